//! OXIDE (OX) Blockchain Node
//!
//! Main entry point for running an OX node.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ox_core::consensus::Network;
use ox_core::crypto::KeyPair;
use ox_core::node::{Node, NodeConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum NetworkArg {
    Main,
    Regtest,
}

impl From<NetworkArg> for Network {
    fn from(arg: NetworkArg) -> Self {
        match arg {
            NetworkArg::Main => Network::Main,
            NetworkArg::Regtest => Network::Regtest,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "ox-node", about = "OXIDE (OX) blockchain node")]
struct Cli {
    /// Where chain state and the node key live
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Address to accept peers on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Seed peers to sync from (repeatable)
    #[arg(long = "peer")]
    peers: Vec<SocketAddr>,

    /// Parameter set
    #[arg(long, value_enum, default_value = "main")]
    network: NetworkArg,

    /// Mine blocks in the background
    #[arg(long)]
    mine: bool,

    /// Pay block rewards here instead of the node key's address
    #[arg(long)]
    miner_address: Option<String>,
}

/// Load the node key, generating one on first run
fn load_or_create_key(data_dir: &PathBuf) -> anyhow::Result<KeyPair> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join("node_key");
    if path.exists() {
        let der = hex::decode(std::fs::read_to_string(&path)?.trim())
            .context("node_key is not valid hex")?;
        KeyPair::from_pkcs8_der(&der).map_err(Into::into)
    } else {
        let key = KeyPair::generate();
        let der = key.to_pkcs8_der()?;
        std::fs::write(&path, hex::encode(der))?;
        info!(path = %path.display(), "generated node key");
        Ok(key)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let key = load_or_create_key(&cli.data_dir)?;
    let address = key.address();
    info!(%address, "node address");

    let config = NodeConfig {
        data_dir: cli.data_dir.clone(),
        listen: cli.listen,
        seeds: cli.peers.clone(),
        network: cli.network.into(),
    };
    let node = Node::new(config)?;
    Arc::clone(&node).start().await?;
    let height = node.chain().lock().await.height();
    info!(height, "chain loaded");

    if cli.mine {
        let miner_address = cli.miner_address.unwrap_or(address);
        let miner = node.clone();
        tokio::spawn(async move { miner.run_miner(miner_address).await });
    }

    tokio::signal::ctrl_c().await?;
    node.shutdown().await;
    Ok(())
}
