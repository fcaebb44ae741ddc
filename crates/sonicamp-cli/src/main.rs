//! sonicamp command line host
//!
//! Connects to a sonicamp over a serial port, a subprocess or the built-in
//! demo device, runs the handshake and then executes one subcommand.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sonicamp_core::config::SessionConfig;
use sonicamp_core::demo::DemoConnectionFactory;
use sonicamp_core::device::{DeviceBuilder, SonicDevice};
use sonicamp_core::events::Event;
use sonicamp_core::procedures::{
    AutoArgs, HoldDuration, ProcedureArgs, ProcedureController, RampArgs, ScanArgs, TuneArgs,
};
use sonicamp_core::protocol::{
    CommandCallLog, CommandCallRecord, Communicator, ConnectionFactory, FrameProtocol,
    ProcessConnectionFactory, SerialConnectionFactory,
};
use sonicamp_core::scripting::{EngineState, ScriptEngine};

/// Control a sonicamp ultrasonic amplifier
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serial port of the device (e.g. /dev/ttyUSB0)
    #[arg(short, long, global = true)]
    port: Option<String>,
    /// Program that speaks the device protocol on stdin/stdout
    #[arg(long, global = true)]
    process: Option<String>,
    /// Argument passed to --process (repeatable)
    #[arg(long = "process-arg", global = true)]
    process_args: Vec<String>,
    /// Use the simulated device
    #[arg(long, global = true)]
    demo: bool,
    /// Baud rate
    #[arg(short, long, global = true)]
    baud: Option<u32>,
    /// Device speaks the legacy line protocol (firmware before 1.0)
    #[arg(long, global = true)]
    legacy: bool,
    /// JSON session configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Print every request/answer as a JSON record on stderr
    #[arg(long, global = true)]
    call_log: bool,
    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show device identity and supported commands
    Info,
    /// Read the current status
    Status,
    /// Send a raw request such as `!f=1000000` or `?info`
    Send {
        request: String,
        /// Skip answer validation
        #[arg(long)]
        raw: bool,
    },
    /// Run a script file
    Script {
        file: PathBuf,
    },
    /// Ramp the frequency
    Ramp {
        start: i64,
        stop: i64,
        step: i64,
        /// Time at each frequency (e.g. 100ms, 1s)
        #[arg(long, default_value = "100ms")]
        hold_on: HoldDuration,
        /// Signal-off pause between steps
        #[arg(long, default_value = "0ms")]
        hold_off: HoldDuration,
    },
    /// Scan for the resonance frequency
    Scan(ScanOptions),
    /// Track the resonance frequency
    Tune(TuneOptions),
    /// Scan, then tune
    Auto {
        #[command(flatten)]
        scan: ScanOptions,
        #[command(flatten)]
        tune: TuneOptions,
    },
    /// Run the wipe procedure
    Wipe,
    /// Poll the status and print every change
    Log {
        /// Seconds to run; runs until Ctrl-C when omitted
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[derive(Args, Debug, Clone)]
struct ScanOptions {
    #[arg(long, default_value_t = 10)]
    scan_gain: i64,
    #[arg(long, default_value_t = 100_000)]
    scan_f_range: i64,
    #[arg(long, default_value_t = 1000)]
    scan_f_step: i64,
    #[arg(long, default_value = "10ms")]
    scan_t_step: HoldDuration,
}

impl From<ScanOptions> for ScanArgs {
    fn from(options: ScanOptions) -> Self {
        ScanArgs {
            gain: options.scan_gain,
            f_range: options.scan_f_range,
            f_step: options.scan_f_step,
            t_step: options.scan_t_step,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct TuneOptions {
    #[arg(long, default_value_t = 1000)]
    tune_f_step: i64,
    #[arg(long, default_value = "1000ms")]
    tune_t_time: HoldDuration,
    #[arg(long, default_value = "10ms")]
    tune_t_step: HoldDuration,
}

impl From<TuneOptions> for TuneArgs {
    fn from(options: TuneOptions) -> Self {
        TuneArgs {
            f_step: options.tune_f_step,
            t_time: options.tune_t_time,
            t_step: options.tune_t_step,
        }
    }
}

fn setup_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

fn session_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if cli.legacy {
        config.communicator.protocol = FrameProtocol::Legacy;
    }
    if let Some(baud) = cli.baud {
        config.communicator.baud_rate = baud;
    }
    if cli.demo {
        // The simulator has no input buffer to protect
        config.communicator.write_chunk_delay_ms = 0;
    }
    Ok(config)
}

fn connection_factory(cli: &Cli) -> Result<Arc<dyn ConnectionFactory>> {
    if cli.demo {
        return Ok(Arc::new(DemoConnectionFactory::new()));
    }
    if let Some(program) = &cli.process {
        return Ok(Arc::new(ProcessConnectionFactory::new(
            program.clone(),
            cli.process_args.clone(),
        )));
    }
    if let Some(port) = &cli.port {
        return Ok(Arc::new(SerialConnectionFactory::new(port.clone())));
    }
    bail!("No device given; use --port, --process or --demo")
}

async fn connect(cli: &Cli) -> Result<SonicDevice> {
    let config = session_config(cli)?;
    if cli.demo && config.communicator.protocol == FrameProtocol::Legacy {
        bail!("The demo device only speaks the framed protocol");
    }
    let factory = connection_factory(cli)?;
    let baud_rate = config.communicator.baud_rate;

    let communicator = Arc::new(Communicator::new(config.communicator.clone()));
    communicator
        .open_communication(factory.clone(), baud_rate)
        .await
        .with_context(|| format!("Failed to open {}", factory.describe()))?;

    let mut builder = DeviceBuilder::new().with_config(config.device.clone());
    if cli.call_log {
        let call_log: CommandCallLog =
            Arc::new(|record: &CommandCallRecord| eprintln!("{}", record.to_json()));
        builder = builder.with_call_log(call_log);
    }
    let device = builder
        .build(communicator)
        .await
        .context("Handshake failed")?;
    info!(
        device_type = %device.info().device_type,
        protocol = %device.info().protocol_version,
        "connected"
    );
    Ok(device)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let device = connect(&cli).await?;
    let result = run(&cli, &device).await;
    device.disconnect().await;
    result
}

async fn run(cli: &Cli, device: &SonicDevice) -> Result<()> {
    match &cli.command {
        Commands::Info => {
            println!("{}", serde_json::to_string_pretty(device.info())?);
            let commands: Vec<String> = device
                .command_table()
                .lookups()
                .map(|(code, lookup)| format!("{code} ({})", lookup.command_def.primary_alias()))
                .collect();
            println!("commands: {}", commands.join(", "));
        }
        Commands::Status => {
            device.poll_status().await?;
            let status = device.status().snapshot();
            println!("{}", serde_json::to_string_pretty(status.values())?);
        }
        Commands::Send { request, raw } => {
            let answer = if *raw {
                device.send_message(request).await?
            } else {
                device.execute_raw(request).await?
            };
            println!("{}", answer.message);
            if !answer.value_dict.is_empty() {
                println!("{}", serde_json::to_string_pretty(&answer.value_dict)?);
            }
            if !*raw && !answer.valid {
                warn!(unknown = ?answer.unknown_answers, "answer did not validate");
            }
        }
        Commands::Script { file } => run_script(device, file).await?,
        Commands::Ramp {
            start,
            stop,
            step,
            hold_on,
            hold_off,
        } => {
            run_procedure(
                device,
                ProcedureArgs::Ramp(RampArgs {
                    start: *start,
                    stop: *stop,
                    step: *step,
                    hold_on: *hold_on,
                    hold_off: *hold_off,
                }),
            )
            .await?
        }
        Commands::Scan(options) => {
            run_procedure(device, ProcedureArgs::Scan(options.clone().into())).await?
        }
        Commands::Tune(options) => {
            run_procedure(device, ProcedureArgs::Tune(options.clone().into())).await?
        }
        Commands::Auto { scan, tune } => {
            let args = AutoArgs {
                scan: scan.clone().into(),
                tune: tune.clone().into(),
            };
            run_procedure(device, ProcedureArgs::Auto(args)).await?
        }
        Commands::Wipe => run_procedure(device, ProcedureArgs::Wipe).await?,
        Commands::Log { seconds } => log_status(device, *seconds).await?,
    }
    Ok(())
}

async fn run_procedure(device: &SonicDevice, args: ProcedureArgs) -> Result<()> {
    let controller = ProcedureController::new(device.clone());
    controller
        .execute(args)
        .with_context(|| format!("Cannot run {}", args.procedure_type()))?;

    tokio::select! {
        result = controller.wait() => result.context("Procedure failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping procedure");
            controller.stop().await;
        }
    }
    Ok(())
}

async fn run_script(device: &SonicDevice, file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read script {}", file.display()))?;
    let engine = ScriptEngine::new(device.clone());
    engine.load_source(&text).await?;

    let mut events = device.events().subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Event::PropertyChange { name, new, .. } = &event {
                if name == "current_line" && !new.is_empty() {
                    println!("line {new}");
                }
            }
        }
    });

    engine.start().await?;
    tokio::select! {
        _ = engine.wait() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping script");
            engine.stop().await;
        }
    }
    printer.abort();

    if let Some(error) = engine.last_error() {
        bail!("Script stopped: {error}");
    }
    if engine.state() == EngineState::Paused {
        warn!(line = ?engine.current_line(), "script paused");
    }
    Ok(())
}

async fn log_status(device: &SonicDevice, seconds: Option<u64>) -> Result<()> {
    let mut events = device.events().subscribe();
    device.start_auto_update().await;

    let printer = async {
        while let Ok(event) = events.recv().await {
            match event {
                Event::StatusChanged { .. } => {
                    let status = device.status().snapshot();
                    println!("{}", serde_json::to_string(status.values())?);
                }
                Event::Disconnected => break,
                _ => {}
            }
        }
        Ok::<(), anyhow::Error>(())
    };
    let deadline = async {
        match seconds {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = printer => result?,
        _ = deadline => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    device.stop_auto_update().await;
    Ok(())
}
