use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use two_phase_register::{
    cli::Cli,
    node::{Node, NodeConfig},
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let ids: Vec<u32> = (0..cli.nodes).collect();

    let mut nodes = Vec::with_capacity(ids.len());
    for id in &ids {
        nodes.push(Node::start(NodeConfig::local(*id, &ids, &cli.log_dir)).await?);
    }

    for delta in cli.deltas {
        match nodes[0].transaction(delta).await {
            Ok(()) => info!(delta, "transaction committed"),
            Err(err) => warn!(delta, error = %err, "transaction failed"),
        }
        for node in &nodes {
            println!("node{}: {}", node.id(), node.state());
        }
    }

    for node in &nodes {
        node.close().await;
    }
    Ok(())
}
