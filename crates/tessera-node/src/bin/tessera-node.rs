//! Tessera replica.
//!
//! ```bash
//! # Uses ./tessera.toml, ./tessera.local.toml and TESSERA_* variables
//! tessera-node --id R1
//!
//! # Explicit config file; keys_dir resolves next to it
//! tessera-node --config /etc/tessera/tessera.toml --id R2
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tessera_config::ConfigLoader;
use tessera_node::{Node, NodeSettings};
use tessera_types::NodeId;

/// Run one Tessera replica until interrupted.
#[derive(Parser)]
#[command(name = "tessera-node")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file. Defaults to tessera.toml in the current directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Roster id of this replica.
    #[arg(short, long)]
    id: String,

    /// Print the effective configuration and exit.
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let loader = match &cli.config {
        Some(path) => ConfigLoader::new().with_file(path),
        None => ConfigLoader::new(),
    };
    let config = loader.load()?;

    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let roster = Arc::new(config.roster().context("Failed to build roster")?);
    let id = NodeId::new(cli.id.as_str());
    if !roster.is_node(&id) {
        anyhow::bail!("{id} is not a replica in the roster");
    }
    let signing_key = config
        .signing_key(id.as_str())
        .with_context(|| format!("Failed to load signing key for {id}"))?;

    let node = Node::bind(
        id,
        signing_key,
        Arc::clone(&roster),
        NodeSettings::from_config(&config),
    )
    .await
    .context("Failed to start node")?;

    tracing::info!(
        replicas = roster.node_count(),
        clients = roster.clients().len(),
        "serving, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    let consensus = node.consensus_metrics();
    let link = node.link_metrics();
    tracing::info!(
        ledger_length = node.engine().ledger_length(),
        decisions = consensus.decisions,
        round_changes = consensus.round_changes,
        retransmissions = link.retransmissions,
        "shutting down"
    );
    node.shutdown();
    Ok(())
}
