//! uabridge - OPC UA to MQTT bridge
//!
//! Usage:
//!   uabridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>        Configuration file path
//!   -l, --log-level <LEVEL>    Log level (error, warn, info, debug, trace)
//!   --metrics-bind <ADDR>      Serve metrics on this address
//!   --pki-dir <DIR>            OPC UA certificate store
//!   --check                    Validate the configuration and exit
//!   -h, --help                 Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use uabridge::bridge::{BridgeRegistry, LogReporter, SessionContext};
use uabridge::config::Config;
use uabridge::source::OpcUaConnector;
use uabridge::{Metrics, MetricsServer};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// uabridge - moves live OPC UA values to an MQTT broker
#[derive(Parser, Debug)]
#[command(name = "uabridge")]
#[command(version)]
#[command(about = "OPC UA to MQTT data-plane bridge")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,

    /// Metrics bind address; enables the metrics endpoint
    #[arg(long)]
    metrics_bind: Option<SocketAddr>,

    /// Directory holding the OPC UA client certificate store
    #[arg(long, default_value = "pki")]
    pki_dir: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[cfg(feature = "opcua-client")]
fn connector(args: &Args, config: &Config) -> Option<Arc<dyn OpcUaConnector>> {
    Some(Arc::new(uabridge::source::opcua::OpcUaClientConnector::new(
        &args.pki_dir,
        config.bridge.channel_capacity,
    )))
}

#[cfg(not(feature = "opcua-client"))]
fn connector(_args: &Args, _config: &Config) -> Option<Arc<dyn OpcUaConnector>> {
    None
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    if args.check {
        println!(
            "Configuration OK ({} transfers, {} credentials)",
            config.transfers.len(),
            config.credentials.len()
        );
        return Ok(());
    }

    // Setup logging - RUST_LOG wins, then CLI, then config
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));
    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact();
    match EnvFilter::try_from_default_env() {
        Ok(filter) => tracing::subscriber::set_global_default(
            builder.with_env_filter(filter).finish(),
        )?,
        Err(_) => tracing::subscriber::set_global_default(
            builder.with_max_level(log_level.to_tracing_level()).finish(),
        )?,
    }

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let Some(connector) = connector(&args, &config) else {
        error!("Built without the opcua-client feature; no OPC UA transport available");
        std::process::exit(1);
    };

    info!("Starting uabridge");
    info!("  Transfers: {} configured", config.transfers.len());
    info!(
        "  Backoff: initial {:?}, max {:?}, {} failures",
        config.bridge.backoff.initial, config.bridge.backoff.max, config.bridge.backoff.max_failures
    );

    let metrics = Arc::new(Metrics::new());
    let metrics_bind = args
        .metrics_bind
        .or(config.metrics.enabled.then_some(config.metrics.bind));
    if let Some(bind) = metrics_bind {
        let server = MetricsServer::bind(metrics.clone(), bind).await?;
        info!("  Metrics: enabled (http://{})", server.local_addr()?);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    let registry = BridgeRegistry::new(SessionContext {
        config: config.bridge.clone(),
        connector,
        credentials: Arc::new(config.credential_resolver()),
        reporter: Arc::new(LogReporter),
        metrics,
    });

    for transfer in config.transfers {
        let id = transfer.id.clone();
        if let Err(e) = registry.start(transfer) {
            warn!(transfer = %id, "Transfer rejected: {}", e);
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, draining {} transfers", registry.len());
    registry.shutdown().await;
    info!("uabridge stopped");

    Ok(())
}
