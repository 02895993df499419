//! aae-tree CLI Binary
//!
//! Offline inspection of persisted partition hash trees.

use aae::config::{AaeConfig, ConfigLoader};
use aae::coordinator::build::{is_built_marker, BUILT_KEY};
use aae::hashtree::{storage, HashTree, KeyDiff, TreeOptions};
use aae::logging::{init_logging, LoggingConfig};
use aae::object::ObjectKey;
use aae::tree_id::{IndexN, PartitionIndex};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process;
use tracing::{debug, error, info};

/// aae-tree - inspect and compare partition hash trees
#[derive(Parser)]
#[command(name = "aae-tree")]
#[command(about = "Inspect and compare persisted anti-entropy hash trees")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging (default: off)
    #[arg(long, default_value = "false")]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the trees stored under a partition storage root
    Inspect {
        /// Partition storage directory
        #[arg(long)]
        root: PathBuf,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Show key differences between two copies of one tree
    Diff {
        /// Local partition storage directory
        #[arg(long)]
        left: PathBuf,
        /// Remote partition storage directory
        #[arg(long)]
        right: PathBuf,
        /// Preflist partition index (decimal or 40 hex digits)
        #[arg(long)]
        partition: PartitionIndex,
        /// Preflist replication factor
        #[arg(long)]
        n: u16,
    },
}

#[derive(Debug, Serialize)]
struct TreeSummary {
    id: String,
    keys: usize,
    built: bool,
    top_hash: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match ConfigLoader::load_from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                process::exit(1);
            }
        },
        None => ConfigLoader::load(None).unwrap_or_default(),
    };

    if let Err(e) = init_logging(Some(&build_logging_config(&cli, &config))) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    let result = match &cli.command {
        Commands::Inspect { root, format } => inspect(root, format, &config.coordinator.tree),
        Commands::Diff {
            left,
            right,
            partition,
            n,
        } => diff(left, right, IndexN::new(*partition, *n), &config.coordinator.tree).await,
    };

    match result {
        Ok(output) => {
            info!("Command completed successfully");
            println!("{}", output);
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("{:#}", e);
            process::exit(1);
        }
    }
}

/// Logging from the config file, silenced unless `--verbose`
fn build_logging_config(cli: &Cli, config: &AaeConfig) -> LoggingConfig {
    if !cli.verbose {
        return LoggingConfig {
            level: "off".to_string(),
            ..LoggingConfig::default()
        };
    }

    let mut logging = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging.level = level.clone();
    }
    logging
}

/// Open a persisted tree and rebuild its buckets from the stored leaves
fn open_rehashed(db: &sled::Db, id: IndexN, options: &TreeOptions) -> Result<HashTree> {
    let mut tree = HashTree::with_db(db.clone(), id, options.clone())
        .with_context(|| format!("Failed to open tree {}", id))?;
    let update = tree
        .rehash()
        .with_context(|| format!("Failed to rehash tree {}", id))?;
    tree.install(update);
    Ok(tree)
}

fn open_existing(root: &Path) -> Result<sled::Db> {
    if !root.is_dir() {
        bail!("No tree storage at {}", root.display());
    }
    storage::open_db(root).with_context(|| format!("Failed to open {}", root.display()))
}

fn inspect(root: &Path, format: &str, options: &TreeOptions) -> Result<String> {
    let db = open_existing(root)?;
    let ids = storage::list_tree_ids(&db)?;
    debug!(root = %root.display(), trees = ids.len(), "Inspecting trees");

    let mut summaries = Vec::with_capacity(ids.len());
    for id in ids {
        let tree = open_rehashed(&db, id, options)?;
        summaries.push(TreeSummary {
            id: id.to_string(),
            keys: tree.len(),
            built: is_built_marker(tree.read_meta(BUILT_KEY)?.as_deref()),
            top_hash: tree.top_hash().map(hex::encode),
        });
    }

    match format {
        "json" => Ok(serde_json::to_string_pretty(&summaries)?),
        "text" => {
            if summaries.is_empty() {
                return Ok("No trees".to_string());
            }
            let lines: Vec<String> = summaries
                .iter()
                .map(|s| {
                    format!(
                        "{:<48} keys={:<8} built={:<5} top={}",
                        s.id,
                        s.keys,
                        s.built,
                        s.top_hash.as_deref().unwrap_or("-")
                    )
                })
                .collect();
            Ok(lines.join("\n"))
        }
        other => bail!("Invalid format: {} (must be 'text' or 'json')", other),
    }
}

async fn diff(left: &Path, right: &Path, id: IndexN, options: &TreeOptions) -> Result<String> {
    let local = open_rehashed(&open_existing(left)?, id, options)?;
    let remote = open_rehashed(&open_existing(right)?, id, options)?;

    let diffs = local.compare_all(&remote).await?;
    if diffs.is_empty() {
        return Ok(format!("Tree {} is in sync", id));
    }

    let lines: Vec<String> = diffs.iter().map(describe_diff).collect();
    Ok(format!("{} differences in tree {}\n{}", diffs.len(), id, lines.join("\n")))
}

fn describe_diff(diff: &KeyDiff) -> String {
    let kind = match diff {
        KeyDiff::Missing(_) => "missing",
        KeyDiff::RemoteMissing(_) => "remote_missing",
        KeyDiff::Different(_) => "different",
    };
    let key = match ObjectKey::from_tree_key(diff.key()) {
        Some(object_key) => format!(
            "{}/{}",
            String::from_utf8_lossy(&object_key.bucket),
            String::from_utf8_lossy(&object_key.key)
        ),
        None => hex::encode(diff.key()),
    };
    format!("{:<15} {}", kind, key)
}
