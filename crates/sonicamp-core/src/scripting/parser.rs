//! Script parser

use std::fmt;

use super::ScriptError;
use crate::procedures::{HoldDuration, HoldUnit, RampArgs};

/// One executable command
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptCommand {
    /// `frequency <hz>`
    Frequency(i64),
    /// `gain <percent>`
    Gain(i64),
    /// `ramp_freq start, stop, step[, hold_on[, hold_off]]`
    RampFreq(RampArgs),
    /// `hold <duration>`
    Hold(HoldDuration),
    /// `on`
    On,
    /// `off`
    Off,
    /// `auto`
    Auto,
    /// Loop head; `-1` repeats forever
    StartLoop(i64),
    /// `endloop`
    EndLoop,
}

impl fmt::Display for ScriptCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptCommand::Frequency(frequency) => write!(f, "Set frequency to {frequency} Hz"),
            ScriptCommand::Gain(gain) => write!(f, "Set gain to {gain}%"),
            ScriptCommand::RampFreq(args) => write!(
                f,
                "Ramp frequency from {} to {} in steps of {} Hz",
                args.start, args.stop, args.step
            ),
            ScriptCommand::Hold(duration) => write!(f, "Hold for {duration}"),
            ScriptCommand::On => write!(f, "Turn signal on"),
            ScriptCommand::Off => write!(f, "Turn signal off"),
            ScriptCommand::Auto => write!(f, "Start auto mode"),
            ScriptCommand::StartLoop(-1) => write!(f, "Start loop"),
            ScriptCommand::StartLoop(n) => write!(f, "Start loop ({n} times)"),
            ScriptCommand::EndLoop => write!(f, "End loop"),
        }
    }
}

/// Loop bookkeeping of a statement, paired at parse time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMark {
    /// Not a loop statement
    #[default]
    None,
    /// `startloop`, with its matching `endloop`
    Begin {
        /// Statement index of the `endloop`
        end: usize,
        /// Repetitions, `-1` for forever
        quantifier: i64,
    },
    /// `endloop`, with its matching `startloop`
    End {
        /// Statement index of the `startloop`
        begin: usize,
    },
}

/// A command with the source line it came from (1-based)
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Source line (1-based)
    pub line: usize,
    /// What to run
    pub command: ScriptCommand,
}

/// A parsed script
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Script {
    /// Commands in source order
    pub statements: Vec<Statement>,
    /// Indexed like `statements`
    pub loops: Vec<LoopMark>,
    /// Comment lines, joined
    pub comment: String,
}

impl Script {
    /// Number of statements
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    /// Whether the script has no statements
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Number(String),
    Unit(HoldUnit),
}

/// Split `10ms` into a number and its unit
fn split_unit(word: &str) -> Option<(&str, HoldUnit)> {
    for (suffix, unit) in [("ms", HoldUnit::Ms), ("s", HoldUnit::S)] {
        if let Some(number) = word.strip_suffix(suffix) {
            if !number.is_empty() && number.parse::<f64>().is_ok() {
                return Some((number, unit));
            }
        }
    }
    None
}

fn tokenize(line: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for word in line
        .split_whitespace()
        .flat_map(|part| part.split(','))
        .filter(|word| !word.is_empty())
    {
        if let Some(unit) = HoldUnit::parse(word) {
            tokens.push(Token::Unit(unit));
        } else if let Some((number, unit)) = split_unit(word) {
            tokens.push(Token::Number(number.to_string()));
            tokens.push(Token::Unit(unit));
        } else if word.parse::<f64>().is_ok() {
            tokens.push(Token::Number(word.to_string()));
        } else {
            tokens.push(Token::Word(word.to_string()));
        }
    }
    tokens
}

struct Arguments<'a> {
    line: usize,
    command: &'a str,
    tokens: std::slice::Iter<'a, Token>,
}

impl Arguments<'_> {
    fn int(&mut self, name: &str) -> Result<i64, ScriptError> {
        match self.tokens.next() {
            Some(Token::Number(number)) => number.parse().map_err(|_| {
                ScriptError::syntax(self.line, format!("{name} must be an integer, got '{number}'"))
            }),
            Some(other) => Err(ScriptError::syntax(
                self.line,
                format!("{name} must be a number, got {}", describe(other)),
            )),
            None => Err(ScriptError::syntax(
                self.line,
                format!("{} expects {name}", self.command),
            )),
        }
    }

    fn optional_int(&mut self, name: &str) -> Result<Option<i64>, ScriptError> {
        if self.tokens.as_slice().is_empty() {
            return Ok(None);
        }
        self.int(name).map(Some)
    }

    /// A number with an optional unit; bare numbers are milliseconds
    fn duration(&mut self, name: &str) -> Result<HoldDuration, ScriptError> {
        let duration = match self.tokens.next() {
            Some(Token::Number(number)) => number.parse::<f64>().map_err(|_| {
                ScriptError::syntax(self.line, format!("{name} must be a number, got '{number}'"))
            })?,
            Some(other) => {
                return Err(ScriptError::syntax(
                    self.line,
                    format!("{name} must be a duration, got {}", describe(other)),
                ))
            }
            None => {
                return Err(ScriptError::syntax(
                    self.line,
                    format!("{} expects {name}", self.command),
                ))
            }
        };
        if duration < 0.0 {
            return Err(ScriptError::syntax(
                self.line,
                format!("{name} must not be negative"),
            ));
        }
        let unit = match self.tokens.as_slice().first() {
            Some(Token::Unit(unit)) => {
                self.tokens.next();
                *unit
            }
            _ => HoldUnit::Ms,
        };
        Ok(HoldDuration { duration, unit })
    }

    fn finish(mut self) -> Result<(), ScriptError> {
        match self.tokens.next() {
            Some(extra) => Err(ScriptError::syntax(
                self.line,
                format!("unexpected {} after {}", describe(extra), self.command),
            )),
            None => Ok(()),
        }
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Word(word) => format!("'{word}'"),
        Token::Number(number) => format!("'{number}'"),
        Token::Unit(unit) => format!("unit '{unit}'"),
    }
}

fn parse_statement(line: usize, tokens: &[Token]) -> Result<ScriptCommand, ScriptError> {
    let (command, rest) = match tokens.split_first() {
        Some((Token::Word(word), rest)) => (word.as_str(), rest),
        Some((other, _)) => {
            return Err(ScriptError::syntax(
                line,
                format!("expected a command, got {}", describe(other)),
            ))
        }
        None => return Err(ScriptError::syntax(line, "empty statement")),
    };
    let mut args = Arguments {
        line,
        command,
        tokens: rest.iter(),
    };

    let parsed = match command {
        "frequency" => ScriptCommand::Frequency(args.int("a frequency")?),
        "gain" => ScriptCommand::Gain(args.int("a gain")?),
        "ramp_freq" => {
            let start = args.int("a start frequency")?;
            let stop = args.int("a stop frequency")?;
            let step = args.int("a step")?;
            let hold_on = args.duration("an on-hold")?;
            let hold_off = if args.tokens.as_slice().is_empty() {
                HoldDuration::ms(0.0)
            } else {
                args.duration("an off-hold")?
            };
            if step == 0 {
                return Err(ScriptError::syntax(line, "ramp step must not be zero"));
            }
            ScriptCommand::RampFreq(RampArgs {
                start,
                stop,
                step,
                hold_on,
                hold_off,
            })
        }
        "hold" => ScriptCommand::Hold(args.duration("a duration")?),
        "on" => ScriptCommand::On,
        "off" => ScriptCommand::Off,
        "!AUTO" | "AUTO" | "auto" => ScriptCommand::Auto,
        "startloop" => {
            let quantifier = args.optional_int("a loop count")?.unwrap_or(-1);
            if quantifier < -1 {
                return Err(ScriptError::syntax(line, "loop count must not be negative"));
            }
            ScriptCommand::StartLoop(quantifier)
        }
        "endloop" => ScriptCommand::EndLoop,
        other => {
            return Err(ScriptError::syntax(
                line,
                format!("unknown command '{other}'"),
            ))
        }
    };
    args.finish()?;
    Ok(parsed)
}

/// Parse script text.
///
/// Lines containing `#` are comments and blank lines are skipped. Every
/// `startloop` must be closed by an `endloop`, innermost first.
pub fn parse_script(text: &str) -> Result<Script, ScriptError> {
    let mut script = Script::default();
    let mut comments = Vec::new();
    let mut open_loops: Vec<(usize, usize)> = Vec::new();

    for (number, raw) in text.lines().enumerate() {
        let line = number + 1;
        if raw.contains('#') {
            comments.push(raw.trim());
            continue;
        }
        let tokens = tokenize(raw);
        if tokens.is_empty() {
            continue;
        }

        let command = parse_statement(line, &tokens)?;
        let index = script.statements.len();
        let mark = match command {
            ScriptCommand::StartLoop(quantifier) => {
                open_loops.push((index, line));
                LoopMark::Begin {
                    end: index,
                    quantifier,
                }
            }
            ScriptCommand::EndLoop => {
                let (begin, _) = open_loops
                    .pop()
                    .ok_or_else(|| ScriptError::syntax(line, "endloop without startloop"))?;
                if let LoopMark::Begin { end, .. } = &mut script.loops[begin] {
                    *end = index;
                }
                LoopMark::End { begin }
            }
            _ => LoopMark::None,
        };
        script.statements.push(Statement { line, command });
        script.loops.push(mark);
    }

    if let Some((_, line)) = open_loops.last() {
        return Err(ScriptError::syntax(*line, "startloop is never closed"));
    }
    script.comment = comments.join("\n");
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn commands(script: &Script) -> Vec<ScriptCommand> {
        script.statements.iter().map(|s| s.command.clone()).collect()
    }

    #[test]
    fn test_parse_commands() {
        let script = parse_script(
            "frequency 1000\ngain 50\non\nhold 2 s\nhold 10ms\nhold 5\noff\nAUTO\n",
        )
        .unwrap();
        assert_eq!(
            commands(&script),
            vec![
                ScriptCommand::Frequency(1000),
                ScriptCommand::Gain(50),
                ScriptCommand::On,
                ScriptCommand::Hold(HoldDuration::s(2.0)),
                ScriptCommand::Hold(HoldDuration::ms(10.0)),
                ScriptCommand::Hold(HoldDuration::ms(5.0)),
                ScriptCommand::Off,
                ScriptCommand::Auto,
            ]
        );
        assert_eq!(script.loops, vec![LoopMark::None; 8]);
    }

    #[test]
    fn test_parse_ramp_with_commas() {
        let script = parse_script("ramp_freq 1000000,1000200,100,10ms,1s").unwrap();
        assert_eq!(
            commands(&script),
            vec![ScriptCommand::RampFreq(RampArgs {
                start: 1_000_000,
                stop: 1_000_200,
                step: 100,
                hold_on: HoldDuration::ms(10.0),
                hold_off: HoldDuration::s(1.0),
            })]
        );
    }

    #[test]
    fn test_comments_are_collected() {
        let script = parse_script("# warm up\n\nfrequency 1000 \n#done").unwrap();
        assert_eq!(script.len(), 1);
        assert_eq!(script.statements[0].line, 3);
        assert_eq!(script.comment, "# warm up\n#done");
    }

    #[test]
    fn test_loops_are_paired() {
        let script =
            parse_script("startloop 2\nstartloop\nfrequency 1000\nendloop\nendloop").unwrap();
        assert_eq!(
            script.loops,
            vec![
                LoopMark::Begin {
                    end: 4,
                    quantifier: 2
                },
                LoopMark::Begin {
                    end: 3,
                    quantifier: -1
                },
                LoopMark::None,
                LoopMark::End { begin: 1 },
                LoopMark::End { begin: 0 },
            ]
        );
    }

    #[test]
    fn test_syntax_errors() {
        let cases = [
            ("startloop 2\nfrequency 1000", 1),
            ("frequency 1000\nendloop", 2),
            ("on\nfly 3", 2),
            ("frequency 10.5", 1),
            ("gain", 1),
            ("hold fast", 1),
            ("off now", 1),
            ("ramp_freq 1 2 0 10ms", 1),
        ];
        for (text, expected_line) in cases {
            match parse_script(text) {
                Err(ScriptError::Syntax { line, .. }) => assert_eq!(line, expected_line, "{text}"),
                other => panic!("expected syntax error for {text:?}, got {other:?}"),
            }
        }
    }
}
