//! # casetrace CLI
//!
//! Commands for operating the UFDR ingestion pipeline:
//!
//! | Command | Description |
//! |---------|-------------|
//! | `casetrace init` | Create the ledger database and run schema migrations |
//! | `casetrace ingest <archive>` | Ingest one UFDR archive end to end |
//! | `casetrace graph resync [--clear]` | Replay the whole ledger into the graph store |
//! | `casetrace graph reset` | Wipe the graph store |
//!
//! All commands accept `--config` pointing to a TOML configuration file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use casetrace::config::{load_config, Config};
use casetrace::embedding::create_encoder;
use casetrace::graph::Neo4jGraphStore;
use casetrace::ingest::{run_ingest, IngestDeps};
use casetrace::llm::GeminiVision;
use casetrace::vector_store::ChromaVectorStore;
use casetrace::{db, graph_sync, migrate};

/// casetrace — ingest UFDR mobile-forensic archives into a relational
/// ledger, a vector index, and a person graph.
#[derive(Parser)]
#[command(name = "casetrace", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/casetrace.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the ledger schema. Idempotent.
    Init,

    /// Ingest one UFDR archive and print the run summary.
    Ingest {
        /// Path to the archive (zip) to ingest.
        archive: PathBuf,
    },

    /// Graph store administration.
    Graph {
        #[command(subcommand)]
        command: GraphCommands,
    },
}

#[derive(Subcommand)]
enum GraphCommands {
    /// Replay every ledger contact and message into the graph store.
    Resync {
        /// Clear the graph before replaying.
        #[arg(long)]
        clear: bool,
    },
    /// Delete every node and relationship from the graph store.
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("initialized {}", config.db.path.display());
        }
        Commands::Ingest { archive } => {
            let archive_bytes = std::fs::read(&archive)
                .with_context(|| format!("failed to read archive {}", archive.display()))?;
            let archive_name = archive
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| archive.display().to_string());

            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            let deps = build_deps(&config).await?;

            let summary =
                run_ingest(&pool, &deps, &config, &archive_bytes, &archive_name).await?;
            pool.close().await;

            println!("ingest {}", summary.archive_name);
            println!("  extraction id: {}", summary.extraction_id);
            println!("  messages: {}", summary.messages_ingested);
            println!("  contacts: {}", summary.contacts_ingested);
            println!("  system records: {}", summary.system_records_ingested);
            println!("  images logged: {}", summary.images_logged);
            println!("  images captioned: {}", summary.images_captioned);
            for note in &summary.notes {
                println!("  note: {note}");
            }
            println!("ok");
        }
        Commands::Graph { command } => {
            let store = Neo4jGraphStore::connect(&config.graph).await;
            match command {
                GraphCommands::Resync { clear } => {
                    let pool = db::connect(&config).await?;
                    migrate::run_migrations(&pool).await?;
                    let stats = graph_sync::resync_graph(&pool, &store, clear).await;
                    pool.close().await;
                    println!("graph resync");
                    println!("  cleared: {}", stats.cleared);
                    println!("  contacts synced: {}", stats.contacts_synced);
                    println!("  relationships synced: {}", stats.relationships_synced);
                    println!("  skipped contacts: {}", stats.skipped_contacts);
                    println!("  skipped messages: {}", stats.skipped_messages);
                    match &stats.detail {
                        Some(detail) => println!("  failed: {detail}"),
                        None => println!("ok"),
                    }
                }
                GraphCommands::Reset => {
                    let stats = graph_sync::reset_graph(&store).await;
                    match &stats.detail {
                        Some(detail) => println!("graph reset failed: {detail}"),
                        None => println!("graph reset ok"),
                    }
                }
            }
        }
    }

    Ok(())
}

/// Wire the collaborators for an ingestion run from configuration. Each one
/// degrades to disabled (with a summary note downstream) rather than
/// failing startup.
async fn build_deps(config: &Config) -> Result<IngestDeps> {
    let encoder: Arc<dyn casetrace::embedding::TextEncoder> =
        Arc::from(create_encoder(&config.embedding)?);
    let vectors = ChromaVectorStore::connect(&config.vector, Arc::clone(&encoder)).await;
    let graph = Neo4jGraphStore::connect(&config.graph).await;
    let vision = GeminiVision::new(&config.gemini);

    Ok(IngestDeps {
        graph: Arc::new(graph),
        vectors: Arc::new(vectors),
        encoder,
        vision: Arc::new(vision),
    })
}
