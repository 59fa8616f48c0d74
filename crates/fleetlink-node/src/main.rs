//! Fleetlink Node -- accepts game servers and keeps their sessions alive.
//!
//! Usage:
//!   fleetlink-node                      # Run with default config
//!   fleetlink-node --config path.toml   # Run with custom config
//!   fleetlink-node generate-key         # Print a key and nonce layout for a new server

use std::sync::Arc;

use clap::{Parser, Subcommand};
use fleetlink_crypto::{generate_key, NonceLayout};
use fleetlink_node::config::NodeConfig;
use fleetlink_node::{
    expand_tilde, Connection, ConnectionServer, FnHandler, StaticDirectory, TracingObserver,
};
use fleetlink_protocol::{Data, Message, MessageError};

#[derive(Parser)]
#[command(name = "fleetlink-node", about = "Fleetlink game-server connection node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.fleetlink/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the connection server (default)
    Run,
    /// Generate a shared key and nonce layout for a [[servers]] entry
    GenerateKey,
    /// Validate the config file and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetlink_node=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::GenerateKey) => {
            let key = generate_key();
            let layout = NonceLayout::random();
            println!("key = \"{}\"", hex::encode(key));
            println!("nonce_offsets = {:?}", layout.offsets());
        }
        Some(Commands::CheckConfig) => {
            let config_path = expand_tilde(&cli.config);
            let cfg = NodeConfig::load_or_default(&config_path)?;
            cfg.validate()?;
            println!(
                "{}: ok ({} servers, listening on {})",
                config_path.display(),
                cfg.servers.len(),
                cfg.server.listen_addr
            );
        }
        Some(Commands::Run) | None => {
            let config_path = expand_tilde(&cli.config);
            let cfg = NodeConfig::load_or_default(&config_path)?;
            run_node(cfg).await?;
        }
    }

    Ok(())
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    cfg.validate()?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %cfg.server.listen_addr,
        servers = cfg.servers.len(),
        workers = cfg.server.workers_per_connection,
        "starting fleetlink-node"
    );

    let directory = StaticDirectory::from_entries(&cfg.servers)?;
    if directory.is_empty() {
        tracing::warn!("no servers configured -- every identification will be refused");
    }

    let server = ConnectionServer::bind(cfg, Arc::new(directory), Arc::new(TracingObserver)).await?;
    server
        .on_message(
            "event",
            FnHandler(|conn: &Connection, message: &Message| -> Result<Data, MessageError> {
                let Data::Event(event) = &message.data else {
                    return Err(MessageError::code("invalid_event"));
                };
                tracing::info!(
                    public_id = conn.public_id().unwrap_or("-"),
                    event = %event.name,
                    attributes = event.attributes.len(),
                    "event received"
                );
                Ok(Data::Empty)
            }),
        )
        .await;
    server.start().await?;

    tracing::info!(addr = %server.local_addr(), "server running, press Ctrl-C to stop");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");
    server.stop().await;

    tracing::info!("shutdown complete");
    Ok(())
}
