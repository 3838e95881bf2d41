//! Coordinator binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use minictl::common::Config;
use minictl::Coordinator;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minictl-coord")]
#[command(about = "minictl coordinator with Raft consensus")]
#[command(version = minictl::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start coordinator server
    Serve {
        /// Node ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for gRPC
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Address peers and followers use to reach this node
        #[arg(long)]
        advertise: Option<String>,

        /// Data directory (in-memory log when omitted)
        #[arg(long)]
        data: Option<PathBuf>,

        /// Raft peers as id=addr (comma-separated)
        #[arg(long, value_delimiter = ',')]
        peers: Vec<String>,

        /// Config file (default: ./minictl.toml if present)
        #[arg(long, default_value = "minictl")]
        config: String,
    },
}

fn parse_peers(peers: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    peers
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| {
            let (id, addr) = p
                .split_once('=')
                .with_context(|| format!("peer '{}' is not id=addr", p))?;
            Ok((id.trim().to_string(), addr.trim().to_string()))
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            id,
            bind,
            advertise,
            data,
            peers,
            config,
        } => {
            // File and environment first, CLI flags take priority
            let file_config = Config::load_from(&config).context("loading configuration")?;
            let mut coord_config = file_config.coordinator.unwrap_or_default();
            if let Some(id) = id {
                coord_config.node_id = id;
            }
            if let Some(bind) = bind {
                coord_config.bind_addr = bind;
            }
            if advertise.is_some() {
                coord_config.advertise_addr = advertise;
            }
            if data.is_some() {
                coord_config.data_dir = data;
            }
            if !peers.is_empty() {
                coord_config.peers = parse_peers(&peers)?;
            }

            let coord = Coordinator::new(coord_config)?;
            coord.serve().await?;
        }
    }

    Ok(())
}
