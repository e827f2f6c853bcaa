//! Delivery tracker operator CLI.
//!
//! Usage:
//!   delivery-tracker inspect --db <path> [--partition <n>]...
//!   delivery-tracker config [--file <path>]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use delivery_tracker::cache::MESSAGE_KEY_PREFIX;
use delivery_tracker::partition_state::{partition_from_key, partition_key, PARTITION_KEY_PREFIX};
use delivery_tracker::{PartitionState, SqliteStateStore, StateStore};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracker_config::{init_logging, TrackerSettings};
use tracing::{debug, info};

/// Inspect persisted delivery tracker state.
#[derive(Parser, Debug)]
#[command(name = "delivery-tracker")]
#[command(about = "Inspect persisted delivery tracker state")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TRACKER_LOG_LEVEL", default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print cursors and tracked messages of persisted partitions.
    Inspect {
        /// SQLite state store file.
        #[arg(long)]
        db: PathBuf,

        /// Only show these partitions. Repeatable.
        #[arg(long = "partition")]
        partitions: Vec<u32>,
    },
    /// Print the effective configuration.
    Config {
        /// Settings file; defaults apply when it does not exist.
        #[arg(long, env = "TRACKER_CONFIG", default_value = "delivery-tracker.json")]
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let output = match args.command {
        Command::Inspect { db, partitions } => inspect(&db, &partitions)?,
        Command::Config { file } => effective_config(&file)?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn inspect(db: &Path, only: &[u32]) -> Result<Value> {
    if !db.exists() {
        anyhow::bail!("state store {} does not exist", db.display());
    }
    let store = SqliteStateStore::open(db)
        .with_context(|| format!("failed to open state store {}", db.display()))?;
    info!(db = %db.display(), "inspecting state store");

    let mut partitions: Vec<u32> = store
        .keys_with_prefix(PARTITION_KEY_PREFIX)?
        .iter()
        .filter_map(|key| partition_from_key(key))
        .filter(|partition| only.is_empty() || only.contains(partition))
        .collect();
    partitions.sort_unstable();

    let keys: Vec<String> = partitions.iter().map(|p| partition_key(*p)).collect();
    let states = store.get(&keys)?;

    let mut reports = Vec::with_capacity(partitions.len());
    for (partition, key) in partitions.iter().zip(&keys) {
        let stored = states.get(key);
        let state = PartitionState::from_state(*partition, stored)
            .with_context(|| format!("failed to decode partition {partition}"))?;
        debug!(partition, tracked = state.len(), "decoded partition");
        reports.push(partition_report(&state, stored.map(|s| s.version)));
    }

    let cached = store.keys_with_prefix(MESSAGE_KEY_PREFIX)?.len();
    Ok(json!({
        "partitions": reports,
        "storedMessageBodies": cached,
    }))
}

fn partition_report(state: &PartitionState, version: Option<i32>) -> Value {
    let messages: Vec<Value> = state
        .counterparties_to_messages()
        .into_iter()
        .flat_map(|(counterparties, tracked)| {
            tracked.into_iter().map(move |message| {
                json!({
                    "groupId": counterparties.group_id,
                    "ourId": counterparties.our_id,
                    "theirId": counterparties.their_id,
                    "messageId": message.message_id,
                    "timestamp": message.timestamp,
                })
            })
        })
        .collect();

    json!({
        "partition": state.partition(),
        "version": version,
        "readRecordsFromOffset": state.read_records_from_offset(),
        "processRecordsFromOffset": state.process_records_from_offset(),
        "messages": messages,
    })
}

fn effective_config(file: &Path) -> Result<Value> {
    let settings = TrackerSettings::load(file)
        .with_context(|| format!("failed to load settings from {}", file.display()))?;
    Ok(serde_json::to_value(settings)?)
}
