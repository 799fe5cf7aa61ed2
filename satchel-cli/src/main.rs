//! SATCHEL command-line client.
//!
//! Reads and writes the shared key-value table through the same sync layer
//! the site uses, so exclusion rules and JSON encoding behave identically.

mod error;
mod telemetry;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use satchel_core::{StoreKey, SyncConfig};
use satchel_storage::{initialize_sync_layer, RemoteStore, SyncLayer};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::CliError;

#[derive(Parser, Debug)]
#[command(name = "satchel")]
#[command(about = "Inspect and edit the synchronized key-value store")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "SATCHEL_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace for short key names (defaults to the configured one)
    #[arg(short, long)]
    namespace: Option<String>,

    /// Use keys exactly as given
    #[arg(long, conflicts_with = "namespace")]
    raw: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a value, storing the default when the key is unknown
    Get {
        key: String,
        /// JSON default for unknown keys
        #[arg(short, long, default_value = "null")]
        default: String,
    },
    /// Store a JSON value
    Set { key: String, value: String },
    /// Delete a key
    Delete { key: String },
    /// Print every remote row as JSON
    Dump,
    /// Print change events until interrupted
    Watch {
        /// Only show changes to this key
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let args = Args::parse();
    telemetry::init_tracing(args.json_logs)?;

    let config = SyncConfig::load(args.config.clone())?;
    let layer = initialize_sync_layer(&config).await?;
    debug!(realtime = layer.has_realtime(), "Connected");

    let outcome = run(&args, &config, &layer).await;
    layer.shutdown().await;
    outcome
}

async fn run(args: &Args, config: &SyncConfig, layer: &SyncLayer) -> Result<(), CliError> {
    let store = layer.store();
    let qualify = |key: &str| resolve_key(args, &config.namespace, key);

    match &args.command {
        Command::Get { key, default } => {
            let key = qualify(key.as_str());
            let default = parse_json(&key, default)?;
            let value: Value = store.get(&key, default).await;
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
        }
        Command::Set { key, value } => {
            let key = qualify(key.as_str());
            let value = parse_json(&key, value)?;
            if !store.set(&key, &value).await {
                return Err(CliError::NotPersisted {
                    operation: "write",
                    key,
                });
            }
            info!(key = %key, "Stored");
        }
        Command::Delete { key } => {
            let key = qualify(key.as_str());
            if !store.delete(&key).await {
                return Err(CliError::NotPersisted {
                    operation: "delete",
                    key,
                });
            }
            info!(key = %key, "Deleted");
        }
        Command::Dump => {
            let records = store
                .engine()
                .remote()
                .fetch_all()
                .await
                .map_err(satchel_core::SatchelError::from)?;
            for record in records {
                println!("{}", serde_json::to_string(&record).unwrap_or_default());
            }
        }
        Command::Watch { key } => {
            let filter = key.as_ref().map(|key| qualify(key.as_str()));
            let mut events = store.engine().bus().stream();
            info!(key = ?filter, "Watching for changes, Ctrl-C to stop");
            let interrupted = tokio::signal::ctrl_c();
            tokio::pin!(interrupted);
            loop {
                tokio::select! {
                    _ = &mut interrupted => break,
                    received = events.recv() => match received {
                        Ok(event) => {
                            if filter.as_deref().map_or(true, |key| key == event.key) {
                                println!("{}", serde_json::to_string(&event).unwrap_or_default());
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Output fell behind, events dropped");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }
    }
    Ok(())
}

/// Qualify a short key name with the namespace from `--namespace` or the
/// configuration. Keys already in that namespace are left alone.
fn resolve_key(args: &Args, configured: &str, key: &str) -> String {
    if args.raw {
        return key.to_string();
    }
    let namespace = args.namespace.as_deref().unwrap_or(configured);
    match StoreKey::parse_in(key, namespace) {
        Some(qualified) => qualified.into(),
        None => StoreKey::new(namespace, key).into(),
    }
}

fn parse_json(key: &str, raw: &str) -> Result<Value, CliError> {
    serde_json::from_str(raw).map_err(|source| CliError::InvalidJson {
        key: key.to_string(),
        source,
    })
}
