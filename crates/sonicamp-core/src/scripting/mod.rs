//! Scripting
//!
//! A small line-oriented language for sequencing device commands:
//!
//! ```text
//! # sweep twice
//! startloop 2
//! frequency 1000000
//! gain 50
//! on
//! hold 2s
//! ramp_freq 1000000 1100000 10000 100ms 0ms
//! off
//! endloop
//! ```
//!
//! [`parse_script`] turns the text into a [`Script`], an [`Interpreter`]
//! steps through it against a device, and a [`ScriptEngine`] runs the
//! interpreter as a background task with start, pause, single-step and
//! stop.

mod engine;
mod interpreter;
mod parser;

use thiserror::Error;

use crate::device::DeviceError;

pub use engine::{EngineState, ScriptEngine};
pub use interpreter::{Interpreter, Step};
pub use parser::{parse_script, LoopMark, Script, ScriptCommand, Statement};

/// Errors raised while parsing or running a script
#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Syntax error at line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("Error at line {line}: {source}")]
    Runtime {
        line: usize,
        #[source]
        source: DeviceError,
    },

    #[error("No script loaded")]
    NoScript,

    #[error("Script is already running")]
    Busy,
}

impl ScriptError {
    pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
        ScriptError::Syntax {
            line,
            message: message.into(),
        }
    }

    /// Whether the run ended because it was stopped
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            ScriptError::Runtime {
                source: DeviceError::Cancelled,
                ..
            }
        )
    }
}
