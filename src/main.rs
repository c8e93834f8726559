// src/main.rs
// mnemo - conversation memory and retrieval engine for AI coding assistants
//
// Thin CLI over the library: the real consumers are the RPC dispatchers
// layered on top, but every core operation is reachable from here.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use mnemo::chunker::Chunker;
use mnemo::config::EnvConfig;
use mnemo::db::Database;
use mnemo::embeddings::{EmbeddingClient, EmbeddingPipeline};
use mnemo::forget::DeletionService;
use mnemo::ingest::Ingestor;
use mnemo::reindex::AutoIndexer;
use mnemo::relocate::FolderMigration;
use mnemo::search::{SearchEngine, SearchFilters};
use mnemo::util::CancelToken;

#[derive(Parser)]
#[command(name = "mnemo", version, about = "Conversation memory for AI coding assistants")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and store transcripts from both sources
    Index {
        /// Restrict to one project path
        #[arg(long)]
        project: Option<String>,
        /// Reparse everything, ignoring incremental state
        #[arg(long)]
        full: bool,
    },
    /// Hybrid search over stored messages
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        project: Option<String>,
        /// Search extracted decisions instead of messages
        #[arg(long)]
        decisions: bool,
    },
    /// Per-table row counts
    Stats,
    /// Print one conversation's messages
    Show {
        conversation_id: i64,
        /// Include thinking blocks (also via MNEMO_INCLUDE_THINKING)
        #[arg(long)]
        thinking: bool,
    },
    /// Delete conversations matching topic keywords (backup first)
    Forget {
        keywords: Vec<String>,
        #[arg(long)]
        project: String,
        /// Preview without deleting
        #[arg(long)]
        dry_run: bool,
    },
    /// Move ingested history after a project folder rename
    MigrateFolder {
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        target: PathBuf,
        #[arg(long)]
        old_path: String,
        #[arg(long)]
        new_path: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Verify configuration, storage, and embedding stamps before serving
    ServeCheck,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env from ~/.mnemo/.env only (never from CWD - a malicious repo
    // could override API keys).
    if let Some(home) = dirs::home_dir() {
        let _ = dotenvy::from_path(home.join(".mnemo/.env"));
    }

    let cli = Cli::parse();

    let log_level = match &cli.command {
        Commands::Index { .. } => Level::INFO,
        _ => Level::WARN,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let config = EnvConfig::load();
    let validation = config.validate();
    for warning in &validation.warnings {
        tracing::warn!("{}", warning);
    }
    for error in &validation.errors {
        tracing::warn!("{}", error);
    }

    // Startup failures (including migration checksum mismatches) surface
    // here and exit non-zero.
    let db = Arc::new(Database::open(&config.db_path, config.mmap_size).await?);
    let client = Arc::new(EmbeddingClient::from_config(&config).await);
    let pipeline = Arc::new(EmbeddingPipeline::new(client, Chunker::default()));

    match cli.command {
        Commands::Index { project, full } => {
            let ingestor = Ingestor::new(db.clone(), pipeline, &config);
            let cancel = CancelToken::new();
            let summary = match project {
                Some(path) => ingestor.ingest_project(&path, !full, &cancel).await?,
                None => ingestor.ingest_all(!full, &cancel).await?,
            };
            println!(
                "indexed {} conversation(s), {} message(s), {} decision(s), \
                 {} vector(s); {} parse error(s), {} file(s) skipped",
                summary.conversations,
                summary.messages,
                summary.decisions,
                summary.vectors_stored,
                summary.parse_errors,
                summary.skipped_files,
            );
        }
        Commands::Search {
            query,
            limit,
            project,
            decisions,
        } => {
            // Read paths reindex stale projects first; concurrent callers
            // share one in-flight reparse and the cooldown bounds the cost.
            if let Some(project_path) = &project {
                let ingestor = Arc::new(Ingestor::new(db.clone(), pipeline.clone(), &config));
                let indexer = AutoIndexer::new(
                    ingestor,
                    std::time::Duration::from_millis(config.auto_index.cooldown_ms),
                );
                if let Err(e) = indexer.maybe_auto_index(project_path).await {
                    tracing::warn!("Auto-reindex failed, searching stale data: {}", e);
                }
            }
            let engine = SearchEngine::new(db.clone(), pipeline, &config);
            let filters = SearchFilters {
                project_path: project,
                ..Default::default()
            };
            if decisions {
                for hit in engine.search_decisions(&query, limit, &filters).await? {
                    println!(
                        "[{:.4}] decision #{}: {}",
                        hit.scores.combined_score, hit.decision_id, hit.snippet
                    );
                }
            } else {
                for hit in engine.search_messages(&query, limit, &filters).await? {
                    println!(
                        "[{:.4}] {} {}: {}",
                        hit.scores.combined_score, hit.project_path, hit.role, hit.snippet
                    );
                }
            }
        }
        Commands::Stats => {
            let stats = db.get_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Show {
            conversation_id,
            thinking,
        } => {
            let Some(conversation) = db.get_conversation(conversation_id).await? else {
                anyhow::bail!("conversation {conversation_id} not found");
            };
            println!(
                "{} [{}] {} message(s)",
                conversation.external_id, conversation.source_type, conversation.message_count
            );
            let messages = db
                .interact(move |conn| {
                    Ok(mnemo::db::conversations::get_messages_sync(conn, conversation_id)?)
                })
                .await?;
            // Thinking stays redacted unless explicitly requested.
            let include_thinking = thinking || config.include_thinking;
            let thinking_blocks = db
                .get_thinking_blocks(conversation_id, include_thinking)
                .await?;
            for message in messages {
                println!("--- {} @{}", message.role, message.timestamp);
                println!("{}", message.content);
                for (message_id, content) in &thinking_blocks {
                    if *message_id == message.id {
                        println!("[thinking] {content}");
                    }
                }
            }
        }
        Commands::Forget {
            keywords,
            project,
            dry_run,
        } => {
            let service = DeletionService::new(db.clone(), pipeline);
            if dry_run {
                let preview = service.preview_deletion_by_topic(&keywords, &project).await?;
                println!("{}", preview.summary);
            } else {
                let summary = service.forget_by_topic(&keywords, &project).await?;
                println!("{}", summary.summary);
                if let Some(backup) = summary.backup_path {
                    println!("backup: {}", backup.display());
                }
            }
        }
        Commands::ServeCheck => {
            if !validation.is_valid() {
                eprintln!("{}", validation.report());
                anyhow::bail!("configuration invalid");
            }

            // The database is already open at this point, so migrations ran
            // and the checksum verification passed; prove it is readable.
            let stats = db.get_stats().await?;

            // Every stamped vector index must match the active provider.
            let model = pipeline.client().model();
            let dimensions = pipeline.client().dimensions() as i64;
            let stamps: Vec<(String, String, i64)> = db
                .interact(|conn| {
                    let mut stmt = conn.prepare(
                        "SELECT index_name, model_name, dimensions FROM vector_index_meta",
                    )?;
                    let rows = stmt
                        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                        .filter_map(|r| r.ok())
                        .collect();
                    Ok(rows)
                })
                .await?;
            let stale: Vec<String> = stamps
                .iter()
                .filter(|(_, stamped_model, stamped_dims)| {
                    *stamped_model != model || *stamped_dims != dimensions
                })
                .map(|(index, stamped_model, stamped_dims)| {
                    format!("{index} stamped {stamped_model}/{stamped_dims}")
                })
                .collect();
            if !stale.is_empty() {
                anyhow::bail!(
                    "vector index stamp mismatch vs active provider {model}/{dimensions}: {} \
                     (reindex will rebuild)",
                    stale.join(", ")
                );
            }

            println!(
                "ok: db {} ({} conversation(s), {} message(s)), embeddings {} {}d",
                config.db_path.display(),
                stats.conversations,
                stats.messages,
                model,
                dimensions,
            );
        }
        Commands::MigrateFolder {
            source,
            target,
            old_path,
            new_path,
            dry_run,
        } => {
            let service = FolderMigration::new(db.clone(), config.projects_root.clone());
            let report = service
                .execute_migration(&source, &target, &old_path, &new_path, dry_run)
                .await?;
            if report.dry_run {
                println!(
                    "dry run: {} file(s) would be copied, {} conversation(s) updated",
                    report.files_copied, report.conversations_updated
                );
            } else {
                println!(
                    "migrated {} file(s), {} conversation(s) updated",
                    report.files_copied, report.conversations_updated
                );
            }
        }
    }

    Ok(())
}
