//! Tether CLI
//!
//! Command-line interface for the tether sync core: watch live events, send
//! messages (online or offline), and inspect the offline queue.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tether_core::{Client, Config, FileStore, StaticCredentials, WsConnector};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Tether - resilient chat sync client")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and stream events (presence, typing, delivery, sync)
    Watch,
    /// Send a message to a room
    Send {
        /// Room to send to
        room: String,
        /// Message content
        content: String,
        /// Recipient user ids
        #[arg(short, long, required = true)]
        to: Vec<String>,
        /// Seconds to wait for the relay ack before exiting
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
    /// Inspect the offline queue
    Queue {
        #[command(subcommand)]
        command: Option<QueueCommands>,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Show local state (queue depth, checkpoint, config)
    Status,
}

#[derive(Subcommand, Clone)]
enum QueueCommands {
    /// List queued operations
    #[command(alias = "ls")]
    List,
    /// List operations that exhausted their retries
    Failed,
    /// List quarantined records that failed validation
    Quarantined,
    /// Reset a failed operation for another attempt
    Retry {
        /// Operation id
        id: String,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (relay_url, user_id, data_dir)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    init_logging();

    // Config commands never need a client or the store.
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(&output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, &output)
            }
        };
    }

    let config = Config::load().context("Failed to load configuration")?;

    match cli.command {
        Commands::Watch => {
            let client = build_client(&config)?;
            commands::watch::run(&client, &output).await
        }
        Commands::Send {
            room,
            content,
            to,
            wait,
        } => {
            let client = build_client(&config)?;
            commands::send::run(&client, room, content, to, wait, &output).await
        }
        Commands::Queue { command } => match command.unwrap_or(QueueCommands::List) {
            QueueCommands::List => commands::queue::list(&config, &output),
            QueueCommands::Failed => commands::queue::failed(&config, &output),
            QueueCommands::Quarantined => commands::queue::quarantined(&config, &output),
            QueueCommands::Retry { id } => commands::queue::retry(&config, &id, &output),
        },
        Commands::Status => commands::status::show(&config, &output),
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

/// Build the full client from config; fails fast on missing settings
fn build_client(config: &Config) -> Result<Client> {
    if config.relay_url.is_none() {
        bail!("relay_url not set. Run `tether config set relay_url wss://your-relay`");
    }
    let Some(user_id) = &config.user_id else {
        bail!("user_id not set. Run `tether config set user_id <id>`");
    };
    let Some(token) = &config.token else {
        bail!("No auth token. Set TETHER_TOKEN or `tether config set token <token>`");
    };
    tracing::debug!(user_id, "building client");

    let store = Arc::new(FileStore::new(&config.data_dir));
    Client::new(
        config.clone(),
        Arc::new(WsConnector),
        Arc::new(StaticCredentials::new(token.clone())),
        store,
    )
    .context("Failed to restore durable state")
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tether_core=warn,tether=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
