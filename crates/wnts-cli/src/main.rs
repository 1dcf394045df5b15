use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wnts_core::{NodeConfig, Runtime, DEFAULT_PORT};

#[derive(Parser)]
#[command(name = "wnts")]
#[command(about = "Synchronizes directory trees across a peer-to-peer mesh")]
struct Cli {
    /// Comma-separated relative folders to synchronize. Ignored when
    /// joining: the mesh dictates the folder list.
    #[arg(short = 'f', long = "folders", value_delimiter = ',', value_name = "FOLDER[,FOLDER...]")]
    folders: Vec<PathBuf>,

    /// Address of any node already in the mesh. Omit to bootstrap a new
    /// mesh.
    #[arg(short = 'c', long = "connect", visible_alias = "remote-address", value_name = "IP")]
    connect: Option<IpAddr>,

    /// Service port to listen on (and to dial when joining).
    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Local overlay address override; discovered when omitted.
    #[arg(long = "bind", value_name = "IP")]
    bind: Option<IpAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if cli.folders.is_empty() && cli.connect.is_none() {
        anyhow::bail!("at least one of --folders or --connect is required");
    }
    let mut folders = cli.folders;
    if cli.connect.is_some() && !folders.is_empty() {
        warn!("--folders is ignored when joining an existing mesh");
        folders.clear();
    }

    let config = NodeConfig {
        port: cli.port,
        folders,
        gateway: cli.connect.map(|ip| (ip, cli.port)),
        bind_ip: cli.bind,
        ..NodeConfig::default()
    };

    let mut runtime = Runtime::start(config).await?;
    info!(ip = %runtime.ip(), port = runtime.service_port(), "node up");

    tokio::select! {
        _ = runtime.run() => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    runtime.shutdown().await;
    Ok(())
}
