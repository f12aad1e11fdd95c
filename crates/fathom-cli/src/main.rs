//! Fathom CLI - manage collections and run searches from the terminal.
//!
//! # Usage
//!
//! ```bash
//! # Create a collection from a schema file
//! fm create schema.json
//!
//! # Import NDJSON documents
//! fm import products docs.ndjson --action upsert
//!
//! # Search
//! fm search products "red shoes" --query-by title --json
//!
//! # Export a collection as NDJSON
//! fm export products
//! ```

mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fathom_core::collection::IndexAction;
use fathom_core::schema::coerce::DirtyValues;
use fathom_core::search::SearchParams;
use fathom_core::store::RedbKvStore;
use fathom_core::Registry;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Fathom search engine CLI.
///
/// Collections and documents live in a local redb database shared with any
/// other process pointing at the same data directory.
#[derive(Parser)]
#[command(name = "fm", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Custom data directory (default: ./fathom-data)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Create a collection from a JSON schema file
    Create {
        /// Path to the schema JSON
        schema: PathBuf,
    },
    /// Import NDJSON documents into a collection
    Import {
        collection: String,
        /// Path to an NDJSON file (one document per line)
        file: PathBuf,
        /// Write action: create, upsert, update or emplace
        #[arg(long, default_value = "create")]
        action: String,
    },
    /// Search a collection
    Search {
        collection: String,
        /// The query string; use `*` for a wildcard search
        query: String,
        /// Fields to search
        #[arg(long = "query-by", value_delimiter = ',')]
        query_by: Vec<String>,
        #[arg(long = "filter-by")]
        filter_by: Option<String>,
        #[arg(long = "sort-by")]
        sort_by: Option<String>,
        /// Maximum number of results to return
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Export a collection as NDJSON
    Export { collection: String },
    /// Drop a collection and all of its documents
    Drop { collection: String },
    /// List collections
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let data_dir = cli
        .data_dir
        .unwrap_or_else(|| PathBuf::from("./fathom-data"));
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
    let store = RedbKvStore::open(data_dir.join("fathom.redb"))
        .map_err(|e| anyhow::anyhow!("Failed to open store: {}", e))?;
    let registry = Registry::new(Arc::new(store));
    registry
        .load()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load collections: {}", e))?;

    match cli.command {
        Command::Create { schema } => {
            let raw = std::fs::read_to_string(&schema)
                .with_context(|| format!("Failed to read {}", schema.display()))?;
            let payload: serde_json::Value = serde_json::from_str(&raw)?;
            let created = registry
                .create_collection(payload)
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            println!("{}", serde_json::to_string_pretty(&created)?);
        }
        Command::Import {
            collection,
            file,
            action,
        } => {
            let action = IndexAction::parse(&action).map_err(|e| anyhow::anyhow!("{}", e))?;
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let mut docs = Vec::new();
            for (line_no, line) in raw.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let doc: serde_json::Value = serde_json::from_str(line)
                    .with_context(|| format!("Invalid JSON on line {}", line_no + 1))?;
                docs.push(doc);
            }
            let results = registry
                .add_many(&collection, docs, action, DirtyValues::CoerceOrReject)
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            let (ok, failed): (Vec<_>, Vec<_>) = results.iter().partition(|r| r.is_ok());
            println!("Imported {} documents ({} failed)", ok.len(), failed.len());
            for (i, err) in results.iter().enumerate().filter_map(|(i, r)| {
                r.as_ref().err().map(|e| (i, e))
            }) {
                eprintln!("  line {}: {}", i + 1, err);
            }
        }
        Command::Search {
            collection,
            query,
            query_by,
            filter_by,
            sort_by,
            limit,
            json,
        } => {
            let mut params = SearchParams::query(
                query.clone(),
                &query_by.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
            );
            params.per_page = limit;
            if let Some(filter) = filter_by {
                params.filter_by = filter;
            }
            if let Some(sort) = sort_by {
                params.sort_by = sort;
            }
            let response = registry
                .search(&collection, &params)
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            let text = if json {
                output::format_json(&response)?
            } else {
                output::format_human(&query, &response)
            };
            println!("{}", text);
        }
        Command::Export { collection } => {
            let arc = registry
                .get(&collection)
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            let guard = arc.read().await;
            for doc in guard.export().await.map_err(|e| anyhow::anyhow!("{}", e))? {
                println!("{}", doc);
            }
        }
        Command::Drop { collection } => {
            registry
                .drop_collection(&collection)
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            println!("Dropped collection `{}`", collection);
        }
        Command::List => {
            for name in registry.list_collection_names().await {
                println!("{}", name);
            }
        }
    }

    Ok(())
}
