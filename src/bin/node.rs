//! veilq node binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use veilq::gateway::{MemoryGateway, PassthroughAnonymizer, TokenAdminAuth};
use veilq::node::{Collaborators, MemoryCoordinationStore, Node};
use veilq::Config;

#[derive(Parser)]
#[command(name = "veilq")]
#[command(about = "privacy-preserving delayed submission queue node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node
    Serve {
        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Advertised host, reachable by the other instances
        #[arg(long)]
        host: Option<String>,

        /// Bind/advertised port
        #[arg(long)]
        port: Option<u16>,

        /// Run without election, self-declared leader
        #[arg(long)]
        standalone: bool,
    },
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
            config,
            host,
            port,
            standalone,
        } => {
            let mut cfg = Config::load(config.as_deref())?;
            // CLI arguments take priority over the file
            if let Some(host) = host {
                cfg.instance.host = host;
            }
            if let Some(port) = port {
                cfg.instance.port = port;
            }
            if standalone {
                cfg.instance.standalone = true;
            }

            // Standalone deployments run against in-process collaborators;
            // a fleet wires its shared store and real gateways here.
            let store = Arc::new(MemoryCoordinationStore::new());
            let gateway = Arc::new(MemoryGateway::new());
            let collaborators = Collaborators {
                persistence: gateway.clone(),
                anonymizer: Arc::new(PassthroughAnonymizer),
                lifecycle: gateway,
                admin_auth: Arc::new(TokenAdminAuth::new(cfg.instance.admin_token.clone())),
            };

            let node = Node::bind(cfg, store, collaborators).await?;

            let shutdown_handle = node.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown signal received");
                    shutdown_handle.shutdown();
                }
            });

            node.serve().await?;
        }
    }

    Ok(())
}
