//! peerlink-gatewayd entry point.

use anyhow::{Context, Result};
use clap::Parser;
use peerlink_gatewayd::{
    default_registry, Gateway, GatewayConfig, Kernel, MemoryStore, NodeMode, Overrides, Seed,
    StartupGate, DEFAULT_CONFIG_PATH,
};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// peerlink gateway daemon
#[derive(Parser, Debug)]
#[command(name = "peerlink-gatewayd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// JSON file with the initial store contents
    #[arg(short = 's', long)]
    seed: Option<PathBuf>,

    /// Name of the node this daemon runs on
    #[arg(long)]
    node_name: Option<String>,

    /// Host IP of this node, used to derive its overlay address
    #[arg(long)]
    host_ip: Option<Ipv4Addr>,

    /// Role of this node
    #[arg(long, value_parser = parse_mode)]
    mode: Option<NodeMode>,

    /// Network namespace to run kernel commands in
    #[arg(long)]
    netns: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

fn parse_mode(value: &str) -> Result<NodeMode, String> {
    match value {
        "gateway" => Ok(NodeMode::Gateway),
        "node" => Ok(NodeMode::Node),
        other => Err(format!("unknown mode '{}', expected 'gateway' or 'node'", other)),
    }
}

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .compact()
        .init();
}

fn load_seed(path: Option<&PathBuf>) -> Result<Seed> {
    let Some(path) = path else {
        return Ok(Seed::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading seed file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing seed file {}", path.display()))
}

async fn run(args: Args) -> Result<()> {
    let config = GatewayConfig::load_or_default(&args.config)
        .context("loading configuration")?
        .with_overrides(Overrides {
            node_name: args.node_name,
            host_ip: args.host_ip,
            mode: args.mode,
            netns: args.netns,
        });
    config.validate().context("validating configuration")?;
    info!(node = %config.node.name, mode = ?config.node.mode, "Configuration loaded");

    let seed = load_seed(args.seed.as_ref())?;
    let store = Arc::new(MemoryStore::from_seed(&seed));
    let gate = StartupGate::new();
    if let Some(network) = seed.local_network {
        gate.publish(network);
    }

    let kernel = Kernel::shell(&config);
    let registry = default_registry(&config, &kernel).context("registering tunnel backends")?;
    let gateway = Gateway::new(config, &kernel, store, &registry, gate)
        .context("building gateway")?;
    gateway.start().await.context("starting gateway")?;

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                signal.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    gateway.run(cancel).await.context("running gateway")
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);
    info!("Starting peerlink-gatewayd {}", env!("CARGO_PKG_VERSION"));

    match run(args).await {
        Ok(()) => {
            info!("peerlink-gatewayd exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("peerlink-gatewayd exiting with error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
