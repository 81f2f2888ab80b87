use std::sync::Arc;

use clap::Parser;
use slog::{error, info, o, Drain, Logger};
use tokio::signal;

use canopy::topology::{JsonStateStore, NullStateStore, StateStore};
use canopy::{start_grpc_server, GrpcDialer, NodeConfig, NodeRuntime};

#[derive(Parser, Debug)]
#[command(name = "canopy")]
#[command(about = "Tree overlay node for event propagation and command fan-out", long_about = None)]
struct Args {
    /// Path to the compiled topology artifact
    #[arg(short, long)]
    config: Option<String>,

    /// Node ID (required unless --config is given)
    #[arg(short, long)]
    node_id: Option<String>,

    /// Address to listen on for link connections (e.g., 0.0.0.0:4310)
    #[arg(short, long)]
    listen: Option<String>,

    /// Advertised address for other nodes to connect to
    /// If not specified, uses the listen address
    #[arg(short, long)]
    advertise: Option<String>,

    /// Parent address to attach under; omit to run as the tree root
    #[arg(short, long)]
    parent: Option<String>,

    /// Fallback parent addresses tried when the parent is lost
    #[arg(long, value_delimiter = ',')]
    fallback_parents: Vec<String>,

    /// Path for persisted runtime state
    #[arg(short, long)]
    state: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<NodeConfig, Box<dyn std::error::Error>> {
        if let Some(path) = self.config {
            let mut config = NodeConfig::load(&path)?;
            // Flags override the artifact where given
            if let Some(advertise) = self.advertise {
                config = config.with_advertise_address(advertise);
            }
            if let Some(state) = self.state {
                config = config.with_state_path(state);
            }
            return Ok(config);
        }

        let node_id = self.node_id.ok_or("either --config or --node-id is required")?;
        let listen = self.listen.ok_or("either --config or --listen is required")?;
        let mut config = match self.parent {
            Some(parent) => NodeConfig::joining(node_id, listen, parent),
            None => NodeConfig::root(node_id, listen),
        };
        if let Some(advertise) = self.advertise {
            config = config.with_advertise_address(advertise);
        }
        if !self.fallback_parents.is_empty() {
            config = config.with_fallback_parents(self.fallback_parents);
        }
        if let Some(state) = self.state {
            config = config.with_state_path(state);
        }
        Ok(config)
    }
}

fn root_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let logger = root_logger();

    let config = args.into_config()?;

    let state_store: Arc<dyn StateStore> = match &config.state_path {
        Some(path) => Arc::new(JsonStateStore::new(path.clone())),
        None => Arc::new(NullStateStore),
    };
    let dialer = GrpcDialer::new(config.tuning.link_queue_depth, logger.clone());

    let runtime = NodeRuntime::start(config, dialer, state_store, logger.clone()).await;
    let server = start_grpc_server(runtime.clone(), logger.clone()).await?;

    info!(logger, "node up"; "node_id" => runtime.node_id().clone());
    info!(logger, "Press Ctrl+C to shutdown gracefully");

    signal::ctrl_c().await?;

    server.shutdown();
    runtime.shutdown().await;
    if runtime.pending_requests() > 0 {
        error!(logger, "shutting down with outstanding requests";
            "count" => runtime.pending_requests());
    }

    Ok(())
}
