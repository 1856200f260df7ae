use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use strata::{BitemporalGraph, GraphConfig, LocalGraphStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Maintenance commands for a strata graph file.
#[derive(Debug, Parser)]
#[command(name = "strata-admin", version, about)]
struct Cli {
    /// Graph database file; created if missing.
    #[arg(long, env = "STRATA_DB_PATH", default_value = "./strata.redb")]
    db_path: PathBuf,

    /// JSON file holding a `GraphConfig`. Missing fields take their defaults.
    #[arg(long, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Declare every entity and relationship index. Safe to re-run.
    Migrate,
    /// Print the timeline hanging off a root record.
    Timeline { root_id: String },
    /// Print the version chain ending at a record, oldest first.
    Lineage { id: String },
    /// Print one record and its incident relationships.
    Show { id: String },
}

#[derive(Serialize)]
struct Shown {
    node: strata::NodeRecord,
    relationships: Vec<strata::Relationship>,
}

fn load_config(path: Option<&Path>) -> Result<GraphConfig> {
    let Some(path) = path else {
        return Ok(GraphConfig::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(cli.config.as_deref())?;
    let store = LocalGraphStore::open(&cli.db_path)
        .with_context(|| format!("failed to open graph at {}", cli.db_path.display()))?;
    let graph = BitemporalGraph::with_config(store, config).context("invalid graph config")?;
    tracing::debug!(db_path = %cli.db_path.display(), "graph opened");

    match cli.command {
        Command::Migrate => {
            let report = graph.create_entity_indexes().await?;
            print_json(&report)
        }
        Command::Timeline { root_id } => {
            let timeline = graph.get_timeline(&root_id).await?;
            print_json(&timeline)
        }
        Command::Lineage { id } => {
            let chain = graph.lineage(&id).await?;
            print_json(&chain)
        }
        Command::Show { id } => {
            let node = graph
                .node(&id)
                .await?
                .with_context(|| format!("no record with id {id}"))?;
            let relationships = graph.relationships(&id).await?;
            print_json(&Shown {
                node,
                relationships,
            })
        }
    }
}
