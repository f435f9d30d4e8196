//! vasilid - multi-radio WiFi uplink selector
//!
//! Scans with one radio, evaluates nearby networks on the others, and shares
//! the best verified uplink with the LAN.

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use vasili_network::{SimulatedBackend, WirelessBackend};
use vasilid::config::{Config, LoggingConfig};
use vasilid::node::Node;

#[derive(Parser, Debug)]
#[command(name = "vasilid")]
#[command(about = "Evaluates nearby WiFi networks and bridges the best one to the LAN")]
#[command(version)]
struct Args {
    /// Path to configuration file (YAML or JSON)
    #[arg(short, long, env = "VASILI_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory
    #[arg(short, long, env = "VASILI_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Write a default configuration and exit
    #[arg(long)]
    init: bool,

    /// Use the in-memory radio simulator instead of host hardware
    #[arg(long)]
    simulate: bool,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.init {
        let config = Config::create_default(args.config, args.data_dir)?;
        println!("Configuration written to {}", config.config_path().display());
        println!("Data directory: {}", config.data_directory.display());
        return Ok(());
    }

    let mut config = Config::load(args.config, args.data_dir)?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_logging(&config.logging)?;

    info!("Starting vasilid v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration: {}", config.config_path().display());

    let backend = select_backend(&config, args.simulate);

    let mut node = Node::new(config, backend).await?;
    node.run().await
}

fn select_backend(config: &Config, simulate: bool) -> Arc<dyn WirelessBackend> {
    if simulate {
        info!("Using simulated radios");
        return Arc::new(SimulatedBackend::demo());
    }

    host_backend(config)
}

#[cfg(target_os = "linux")]
fn host_backend(config: &Config) -> Arc<dyn WirelessBackend> {
    Arc::new(vasili_network::backends::LinuxBackend::new(config.host_backend_config()))
}

#[cfg(not(target_os = "linux"))]
fn host_backend(_config: &Config) -> Arc<dyn WirelessBackend> {
    info!("No host backend for this platform, using simulated radios");
    Arc::new(SimulatedBackend::demo())
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let json = config.format == "json";

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(if json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    });

    if let Some(path) = &config.file {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        let writer = Mutex::new(file);
        layers.push(if json {
            fmt::layer().json().with_writer(writer).boxed()
        } else {
            fmt::layer().with_ansi(false).with_writer(writer).boxed()
        });
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to init logging: {}", e))
}
