//! hdlcd - HDLC daemon
//!
//! Owns one or more serial devices, runs a reliable HDLC link on each and
//! shares the links with any number of TCP clients.

use clap::Parser;
use hdlcd_core::cli::{print_exit_codes, CliResult, ExitCodes, StartupError};
use hdlcd_core::config::{self, ConfigError, DaemonConfig, DeviceConfig, LoggingConfig};
use hdlcd_core::core::access::{ClientAcceptor, ClientHandlerCollection};
use hdlcd_core::core::serial::{self, BaudSelection, SerialOpener, SerialPortHandlerCollection};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// hdlcd daemon
#[derive(Parser, Debug)]
#[command(
    name = "hdlcd",
    version,
    about = "Shares reliable HDLC serial links with TCP clients",
    long_about = None
)]
struct Args {
    /// Serial device to serve, repeatable; replaces the configured devices
    #[arg(short, long = "device", env = "HDLCD_DEVICE", value_delimiter = ',')]
    devices: Vec<String>,

    /// Baud rate for devices given with --device, or `auto`
    #[arg(short, long, default_value = "115200")]
    baud: BaudSelection,

    /// TCP listen address
    #[arg(short, long, env = "HDLCD_LISTEN")]
    listen: Option<String>,

    /// Configuration file
    #[arg(short, long, env = "HDLCD_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for device lock files
    #[arg(long, env = "HDLCD_LOCK_DIR")]
    lock_dir: Option<PathBuf>,

    /// Write a rolling log file into this directory
    #[arg(long, env = "HDLCD_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Seconds to wait for clients on shutdown
    #[arg(long, default_value = "5")]
    shutdown_grace: u64,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Print the exit code table and exit
    #[arg(long)]
    exit_codes: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(ExitCodes::INVALID_ARGS)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    if args.exit_codes {
        print_exit_codes();
        return ExitCode::SUCCESS;
    }
    if args.list_ports {
        return list_ports().to_exit_code();
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err}");
            return CliResult::from(StartupError::from(err)).to_exit_code();
        }
    };

    let _log_guard = init_logging(&args, &config.logging);
    info!("Starting hdlcd v{}", hdlcd_core::VERSION);

    let grace = Duration::from_secs(args.shutdown_grace);
    match run(config, grace).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "Startup failed");
            CliResult::from(err).to_exit_code()
        }
    }
}

/// Config file (explicit, default location or built-in defaults) with
/// command line overrides applied
fn load_config(args: &Args) -> Result<DaemonConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::load_from(path)?,
        None => match config::config_file() {
            Some(path) if path.exists() => DaemonConfig::load_from(&path)?,
            _ => DaemonConfig::default(),
        },
    };

    if !args.devices.is_empty() {
        config.devices = args
            .devices
            .iter()
            .map(|path| DeviceConfig::new(path.clone(), args.baud))
            .collect();
    }
    if let Some(listen) = &args.listen {
        config.listen.clone_from(listen);
    }
    if let Some(lock_dir) = &args.lock_dir {
        config.lock_dir.clone_from(lock_dir);
    }
    if args.log_json {
        config.logging.json = true;
    }
    if let Some(dir) = &args.log_dir {
        config.logging.directory = Some(dir.clone());
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(args: &Args, logging: &LoggingConfig) -> Option<WorkerGuard> {
    let level = match args.verbose {
        0 => logging.level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let stderr = fmt::layer().with_writer(std::io::stderr);
    if logging.json {
        layers.push(stderr.json().with_filter(filter()).boxed());
    } else {
        layers.push(stderr.with_filter(filter()).boxed());
    }

    let guard = logging.directory.as_ref().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, "hdlcd.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(filter())
                .boxed(),
        );
        guard
    });

    if let Err(err) = tracing_subscriber::registry().with(layers).try_init() {
        eprintln!("Logging already initialized: {err}");
    }
    guard
}

async fn run(config: DaemonConfig, grace: Duration) -> Result<(), StartupError> {
    let links = Arc::new(SerialPortHandlerCollection::new(
        &config.lock_dir,
        CancellationToken::new(),
    ));
    for settings in config.link_settings() {
        let device = settings.device.clone();
        let baud = settings.baud;
        if let Err(err) = links.start(settings, SerialOpener) {
            links.shutdown().await;
            return Err(err.into());
        }
        info!(%device, ?baud, "Serving device");
    }

    let sessions = Arc::new(ClientHandlerCollection::new(CancellationToken::new()));
    let acceptor = match ClientAcceptor::bind(
        config.listen.as_str(),
        links.clone(),
        sessions.clone(),
        config.client_settings(),
    )
    .await
    {
        Ok(acceptor) => acceptor,
        Err(source) => {
            links.shutdown().await;
            return Err(StartupError::Bind {
                addr: config.listen.clone(),
                source,
            });
        }
    };

    let accepting = CancellationToken::new();
    let accept_task = tokio::spawn(acceptor.run(accepting.clone()));

    shutdown_signal().await;
    info!("Shutting down");

    accepting.cancel();
    if let Err(err) = accept_task.await {
        warn!(%err, "Accept task ended abnormally");
    }
    // Links first so every session sees the shutdown disconnect
    links.shutdown().await;
    sessions.shutdown(grace).await;
    info!("Stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(err) = result {
                            error!(%err, "Failed to listen for ctrl-c");
                        }
                    }
                    _ = term.recv() => {}
                }
                return;
            }
            Err(err) => warn!(%err, "Cannot listen for SIGTERM"),
        }
    }
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "Failed to listen for ctrl-c");
    }
}

fn list_ports() -> CliResult {
    match serial::list_ports() {
        Ok(ports) => {
            if ports.is_empty() {
                println!("No serial ports found.");
            }
            for port in &ports {
                println!("{} [{:?}]", port.port_name, port.port_type);
            }
            CliResult::success()
        }
        Err(err) => {
            eprintln!("Error: {err}");
            CliResult::error(ExitCodes::ERROR, err.to_string())
        }
    }
}
