//! memvault CLI: save and inspect memory events from the command line.
//!
//! ```bash
//! # Local-only node rooted at ./logs
//! memvault save --user "@Jane Doe!" --payload '{"duration": 300, "language": "en"}'
//! memvault list --user at_jane_doe --limit 5
//! memvault stats --user at_jane_doe
//! memvault daily-stats
//! memvault health
//! ```
//!
//! Remote storage is enabled by the `R2_*` environment variables (see
//! `VaultConfig::from_env`). Logging is controlled with `RUST_LOG`.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use memvault_core::config::VaultConfig;
use memvault_core::object::Payload;
use memvault_core::types::{MemoryId, UserId};
use memvault_runtime::VaultNode;

#[derive(Parser)]
#[command(name = "memvault")]
#[command(about = "Resilient storage for memory events", long_about = None)]
struct Cli {
    /// Directory for local fallback files
    #[arg(long, env = "MEMVAULT_LOG_ROOT")]
    log_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save one event
    Save {
        /// Raw user id; sanitized before use
        #[arg(short, long)]
        user: Option<String>,
        /// Memory id (generated when omitted)
        #[arg(short, long)]
        memory_id: Option<String>,
        /// JSON object payload
        #[arg(short, long, conflicts_with = "file")]
        payload: Option<String>,
        /// Read the JSON payload from a file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// List a user's most recent events
    List {
        #[arg(short, long)]
        user: String,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// List today's events across all users
    Today {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Statistics for one user
    Stats {
        #[arg(short, long)]
        user: String,
    },
    /// Statistics for today across all users
    DailyStats,
    /// Circuit breaker and backend status
    Health,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_payload(payload: Option<String>, file: Option<PathBuf>) -> Result<Payload> {
    let raw = match (payload, file) {
        (Some(inline), _) => inline,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read payload file {}", path.display()))?,
        (None, None) => "{}".to_string(),
    };
    match serde_json::from_str::<serde_json::Value>(&raw).context("Payload is not valid JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("Payload must be a JSON object, got {other}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = VaultConfig::from_env();
    if let Some(log_root) = cli.log_root {
        config.log_root = log_root;
    }
    let node = VaultNode::start(config)
        .await
        .context("Failed to start memvault node")?;

    match cli.command {
        Commands::Save {
            user,
            memory_id,
            payload,
            file,
        } => {
            let payload = parse_payload(payload, file)?;
            let memory_id = memory_id.map(MemoryId::new).unwrap_or_else(MemoryId::generate);
            let result = node.save(user.as_deref(), &memory_id, payload).await?;
            print_json(&result)?;
        }
        Commands::List { user, limit } => {
            let objects = node
                .list_user_objects(&UserId::sanitized(Some(&user)), limit)
                .await?;
            print_json(&objects)?;
        }
        Commands::Today { limit } => {
            print_json(&node.list_daily_objects(limit).await?)?;
        }
        Commands::Stats { user } => {
            print_json(&node.user_stats(&UserId::sanitized(Some(&user))).await?)?;
        }
        Commands::DailyStats => {
            print_json(&node.daily_stats().await?)?;
        }
        Commands::Health => {
            print_json(&node.health())?;
        }
    }

    node.shutdown().await;
    Ok(())
}
