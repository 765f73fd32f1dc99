//! # Tidemark CLI
//!
//! Command-line utilities for inspecting HLCs, draining the outbox, and
//! loading pulled rows into a local store.

use anyhow::{bail, Context, Result};
use std::env;
use tidemark_core::{Row, Timestamp};
use tidemark_store::{ConstraintPolicy, SyncStore};
use tracing_subscriber::EnvFilter;

mod config;

use config::CliConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    tracing::debug!(command = %args[1], version = env!("CARGO_PKG_VERSION"), "Running");

    match args[1].as_str() {
        "now" => {
            let store = open_store().await?;
            println!("{}", store.issue_timestamp().await?);
        }
        "parse" => {
            if args.len() < 3 {
                eprintln!("Usage: tidemark parse <hlc>");
                std::process::exit(1);
            }
            let hlc = Timestamp::parse(&args[2]).context("Failed to parse HLC")?;
            println!("{}", serde_json::to_string_pretty(&describe(&hlc)?)?);
        }
        "outbox" => {
            let store = open_store().await?;
            for entry in store.outbox().get_all().await? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        "ack" => {
            if args.len() < 3 {
                eprintln!("Usage: tidemark ack <sequence>...");
                std::process::exit(1);
            }
            let sequences = args[2..]
                .iter()
                .map(|s| s.parse::<i64>().with_context(|| format!("Invalid sequence: {s}")))
                .collect::<Result<Vec<_>>>()?;

            let store = open_store().await?;
            let pending = store.outbox().get_all().await?;
            let acked: Vec<_> = pending
                .into_iter()
                .filter(|entry| sequences.contains(&entry.sequence))
                .collect();
            let removed = store.outbox().remove(&acked).await?;
            println!("{removed}");
        }
        "load" => {
            if args.len() < 4 {
                eprintln!("Usage: tidemark load <table> <rows.json> [--skip-row]");
                std::process::exit(1);
            }
            let table = &args[2];
            let policy = match args.get(4).map(String::as_str) {
                None => ConstraintPolicy::AbortBatch,
                Some("--skip-row") => ConstraintPolicy::SkipRow,
                Some(flag) => bail!("Unknown flag: {flag}"),
            };

            let json = tokio::fs::read_to_string(&args[3])
                .await
                .with_context(|| format!("Failed to read {}", args[3]))?;
            let rows: Vec<Row> = serde_json::from_str(&json).context("Rows must be a JSON array")?;

            let store = open_store().await?;
            let report = store
                .reconciler()
                .bulk_load(table, rows, policy)
                .await
                .with_context(|| format!("Failed to load rows into {table}"))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        "node-id" => {
            let store = open_store().await?;
            println!("{}", store.node_id());
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn open_store() -> Result<SyncStore> {
    let config = CliConfig::from_env()?;
    let schema = config.load_schema().await?;
    SyncStore::open(&config.store_config(), schema)
        .with_context(|| format!("Failed to open {}", config.db_path.display()))
}

/// Break an HLC into its components, with the physical part as RFC 3339.
fn describe(hlc: &Timestamp) -> Result<serde_json::Value> {
    let millis = i64::try_from(hlc.physical_ms).context("Physical time out of range")?;
    let wall = chrono::DateTime::from_timestamp_millis(millis)
        .context("Physical time out of range")?;

    Ok(serde_json::json!({
        "physical_ms": hlc.physical_ms,
        "time": wall.to_rfc3339(),
        "counter": hlc.counter,
        "node_id": hlc.node_id.as_str(),
    }))
}

fn print_help() {
    println!(
        r#"Tidemark CLI

USAGE:
    tidemark <COMMAND> [OPTIONS]

COMMANDS:
    now                                  Issue and record a fresh HLC from the store's clock
    parse <hlc>                          Show the components of an HLC
    outbox                               List pending outbox entries (JSON lines)
    ack <sequence>...                    Remove acknowledged outbox entries
    load <table> <rows.json> [--skip-row]
                                         Reconcile a JSON array of pulled rows
    node-id                              Print the persisted node id
    help                                 Show this help message

ENVIRONMENT:
    TIDEMARK_DB_PATH          Database path (default ./tidemark.db)
    TIDEMARK_NODE_ID          Node id for a fresh database
    TIDEMARK_SCHEMA           JSON schema document
    TIDEMARK_BUSY_TIMEOUT_MS  SQLite busy timeout

EXAMPLES:
    tidemark parse 0000018c5a3b2e10-00000002-device-1
    TIDEMARK_SCHEMA=schema.json tidemark load tasks pulled.json --skip-row
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_core::NodeId;

    #[test]
    fn describe_renders_wall_time() {
        let hlc = Timestamp::new(1_700_000_000_000, 2, NodeId::new("n1").unwrap());
        let described = describe(&hlc).unwrap();

        assert_eq!(described["time"], "2023-11-14T22:13:20+00:00");
        assert_eq!(described["counter"], 2);
        assert_eq!(described["node_id"], "n1");
    }
}
