//! meshlink CLI
//!
//! Runs the relay broker and inspects peer identities.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use meshlink_core::{PeerId, PublicKey};
use meshlink_relay::{RelayClient, RelayServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;

/// meshlink - peer connection establishment for mesh VPNs
#[derive(Parser)]
#[command(name = "meshlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay broker
    Relay {
        /// Listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Close sessions idle for this many milliseconds
        #[arg(long)]
        idle_timeout_ms: Option<u64>,

        /// Maximum registered peers
        #[arg(long)]
        max_sessions: Option<usize>,

        /// Reject registrations without a public key
        #[arg(long)]
        require_key: bool,
    },

    /// Derive the peer id of a public key
    PeerId {
        /// Public key, 64 hex characters
        #[arg(required = true)]
        key: String,
    },

    /// Register with a broker and report the assigned id
    Check {
        /// Broker URL, e.g. http://relay.example.com:8080/relay
        #[arg(short, long)]
        url: String,

        /// Public key, 64 hex characters
        #[arg(short, long)]
        key: String,
    },

    /// Write a default configuration file
    InitConfig {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load_or_default(cli.config.as_deref())
        .with_context(|| format!("loading configuration from {:?}", cli.config))?;

    let level = if cli.verbose { "debug" } else { config.logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    config.validate()?;

    match cli.command {
        Commands::Relay {
            listen,
            idle_timeout_ms,
            max_sessions,
            require_key,
        } => {
            let mut config = config;
            if let Some(listen) = listen {
                config.relay.listen = listen;
            }
            if let Some(ms) = idle_timeout_ms {
                config.relay.idle_timeout = Duration::from_millis(ms);
            }
            if let Some(max) = max_sessions {
                config.relay.max_sessions = max;
            }
            config.relay.require_key |= require_key;
            config.validate()?;
            run_relay(config).await?;
        }
        Commands::PeerId { key } => {
            let key = parse_key(&key)?;
            println!("{}", PeerId::from_public_key(&key));
        }
        Commands::Check { url, key } => {
            check_relay(&url, &key, &config).await?;
        }
        Commands::InitConfig { output } => {
            let path = output.unwrap_or_else(Config::default_path);
            if path.exists() {
                anyhow::bail!("{} already exists", path.display());
            }
            Config::default().save(&path)?;
            println!("Wrote {}", path.display());
        }
    }

    Ok(())
}

fn parse_key(hex: &str) -> anyhow::Result<PublicKey> {
    PublicKey::from_hex(hex).context("public key must be 64 hex characters")
}

async fn run_relay(config: Config) -> anyhow::Result<()> {
    let server = RelayServer::bind(config.relay.clone()).await?;
    let shutdown = server.shutdown_handle();

    info!(
        addr = %server.local_addr()?,
        idle_timeout = ?config.relay.idle_timeout,
        max_sessions = config.relay.max_sessions,
        "relay broker started"
    );

    let run = server.run();
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("interrupt received, stopping relay broker");
            shutdown.cancel();
            run.await?;
        }
    }

    Ok(())
}

async fn check_relay(url: &str, key: &str, config: &Config) -> anyhow::Result<()> {
    let key = parse_key(key)?;
    let client = RelayClient::connect(url, &key, config.client.clone())
        .await
        .with_context(|| format!("connecting to {url}"))?;

    println!("Registered with {} as {}", client.url(), client.local_id());
    client.close().await;
    Ok(())
}
