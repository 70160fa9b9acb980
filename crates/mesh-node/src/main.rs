mod discovery;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mesh_core::config::MeshConfig;
use mesh_core::node::MeshNode;

#[derive(Parser, Debug)]
#[command(name = "mesh-node", about = "MIDI mesh node daemon")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/node.toml")]
    config: PathBuf,

    /// Node display name (overrides the config file)
    #[arg(short, long)]
    name: Option<String>,

    /// Disable mDNS discovery (peers must be fed by other means)
    #[arg(long)]
    no_discovery: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct NodeConfig {
    #[serde(default)]
    node: NodeSection,
    #[serde(flatten)]
    mesh: MeshConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct NodeSection {
    name: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Config file is optional — defaults plus discovery are enough
    let config: NodeConfig = if args.config.exists() {
        let config_str = tokio::fs::read_to_string(&args.config).await?;
        toml::from_str(&config_str)?
    } else {
        info!("No config file found, using defaults");
        NodeConfig::default()
    };

    let name = args
        .name
        .or(config.node.name)
        .unwrap_or_else(|| "midimesh-node".to_string());

    let handle = Arc::new(MeshNode::start(config.mesh, name).await?);
    let identity = handle.identity().clone();

    let cancel = CancellationToken::new();

    if args.no_discovery {
        info!("Discovery disabled; waiting for externally fed peers");
    } else {
        let device_count = handle.registry().list_node(identity.id).len();

        let register_cancel = cancel.child_token();
        let register_identity = identity.clone();
        tokio::spawn(async move {
            if let Err(e) =
                discovery::register(register_identity, device_count, register_cancel).await
            {
                error!("mDNS registration failed: {}", e);
            }
        });

        let browse_cancel = cancel.child_token();
        let browse_events = handle.discovery();
        let local_id = identity.id;
        tokio::spawn(async move {
            if let Err(e) = discovery::browse(local_id, browse_events, browse_cancel).await {
                error!("mDNS browsing failed: {}", e);
            }
        });
    }

    // Periodic status line so an operator can watch the mesh from logs
    {
        let handle = Arc::clone(&handle);
        let status_cancel = cancel.child_token();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            interval.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = status_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let status = handle.status();
                        info!(
                            peers = status.connections.len(),
                            devices = status.devices.len(),
                            routes = status.routes.len(),
                            forwarded = status.router.forwarded,
                            dropped = status.router.dropped,
                            malformed = status.malformed_packets,
                            "Mesh status"
                        );
                    }
                }
            }
        });
    }

    info!(
        node = %identity.id,
        name = %identity.name,
        control = %identity.control_addr,
        data = %identity.data_addr,
        "Mesh node running, press ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    cancel.cancel();
    handle.shutdown().await;

    Ok(())
}
