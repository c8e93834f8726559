// src/ingest.rs
// Ingestion orchestrator: parse transcripts, store records, run extractors,
// rebuild FTS, then write vectors.
//
// Side-effect order within a batch is fixed: conversations → messages →
// tools/thinking → decisions/mistakes/requirements/methodologies →
// file_edits → FTS rebuild → vectors. Everything up to the FTS rebuild runs
// in one transaction, so readers never observe a half-ingested batch; the
// embedding phase suspends and therefore runs after commit.

use crate::config::EnvConfig;
use crate::db::conversations::{
    get_messages_sync, store_conversations_sync, store_messages_sync, store_thinking_blocks_sync,
    store_tool_results_sync, store_tool_uses_sync,
};
use crate::db::derived::{
    store_decisions_sync, store_file_edits_sync, store_methodologies_sync, store_mistakes_sync,
    store_requirements_sync,
};
use crate::db::schema::{
    VEC_DECISIONS, VEC_MESSAGES, rebuild_derived_fts_for_conversations,
    rebuild_messages_fts_for_conversations,
};
use crate::db::Database;
use crate::embeddings::EmbeddingPipeline;
use crate::embeddings::pipeline::EmbedItem;
use crate::error::{MnemoError, Result};
use crate::extract::{self, ConversationView, ToolUseView};
use crate::parser::{ParseResult, claude, codex};
use crate::util::{CancelToken, now_ms};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Index-state key for whole-store ingests spanning every project.
const ALL_PROJECTS_KEY: &str = "::all::";

/// What one ingest run touched.
#[derive(Debug, Default, Clone)]
pub struct IngestSummary {
    pub conversations: usize,
    pub messages: usize,
    pub tool_uses: usize,
    pub tool_results: usize,
    pub thinking_blocks: usize,
    pub decisions: usize,
    pub mistakes: usize,
    pub requirements: usize,
    pub methodologies: usize,
    pub file_edits: usize,
    pub parse_errors: u64,
    pub skipped_files: u64,
    pub vectors_stored: usize,
}

/// Ingestion service over both transcript sources.
pub struct Ingestor {
    db: Arc<Database>,
    pipeline: Arc<EmbeddingPipeline>,
    projects_root: PathBuf,
    codex_root: PathBuf,
}

impl Ingestor {
    pub fn new(db: Arc<Database>, pipeline: Arc<EmbeddingPipeline>, config: &EnvConfig) -> Self {
        Self {
            db,
            pipeline,
            projects_root: config.projects_root.clone(),
            codex_root: config.codex_root.clone(),
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Ingest every transcript from both roots.
    ///
    /// `incremental` skips files untouched since the last recorded run.
    /// A missing root is skipped with a log line rather than failing the
    /// other source.
    pub async fn ingest_all(&self, incremental: bool, cancel: &CancelToken) -> Result<IngestSummary> {
        let started = now_ms();
        let last_indexed = if incremental {
            Some(
                self.db
                    .last_indexed_ms(ALL_PROJECTS_KEY)
                    .await
                    .map_err(MnemoError::Other)?,
            )
            .filter(|&ms| ms > 0)
        } else {
            None
        };

        let mut parsed = ParseResult::default();
        let projects_root = self.projects_root.clone();
        match tokio::task::spawn_blocking(move || claude::parse_projects_root(&projects_root, last_indexed))
            .await?
        {
            Ok(result) => parsed.merge(result),
            Err(MnemoError::NotFound(msg)) => info!("Skipping Claude source: {}", msg),
            Err(e) => return Err(e),
        }
        cancel.check()?;

        let codex_root = self.codex_root.clone();
        match tokio::task::spawn_blocking(move || codex::parse_codex_root(&codex_root, last_indexed))
            .await?
        {
            Ok(result) => parsed.merge(result),
            Err(MnemoError::NotFound(msg)) => info!("Skipping Codex source: {}", msg),
            Err(e) => return Err(e),
        }
        cancel.check()?;

        let summary = self.ingest_parse_result(parsed, cancel).await?;
        self.db
            .record_index_run(ALL_PROJECTS_KEY, started)
            .await
            .map_err(MnemoError::Other)?;
        Ok(summary)
    }

    /// Ingest one project's Claude Code transcripts.
    pub async fn ingest_project(
        &self,
        project_path: &str,
        incremental: bool,
        cancel: &CancelToken,
    ) -> Result<IngestSummary> {
        let started = now_ms();
        let last_indexed = if incremental {
            Some(
                self.db
                    .last_indexed_ms(project_path)
                    .await
                    .map_err(MnemoError::Other)?,
            )
            .filter(|&ms| ms > 0)
        } else {
            None
        };

        let projects_root = self.projects_root.clone();
        let path = project_path.to_string();
        let parsed = tokio::task::spawn_blocking(move || {
            claude::parse_project(&projects_root, &path, last_indexed)
        })
        .await??;
        cancel.check()?;

        let summary = self.ingest_parse_result(parsed, cancel).await?;
        self.db
            .record_index_run(project_path, started)
            .await
            .map_err(MnemoError::Other)?;
        Ok(summary)
    }

    /// Store a parse result and derive records from it.
    pub async fn ingest_parse_result(
        &self,
        parsed: ParseResult,
        cancel: &CancelToken,
    ) -> Result<IngestSummary> {
        let mut summary = IngestSummary {
            parse_errors: parsed.parse_errors,
            skipped_files: parsed.skipped_files,
            ..Default::default()
        };
        if parsed.is_empty() {
            debug!("Nothing to ingest");
            return Ok(summary);
        }
        cancel.check()?;

        let (stored, embed_messages, embed_decisions) = self
            .db
            .write(move |conn| store_batch_tx(conn, parsed))
            .await
            .map_err(MnemoError::Other)?;
        summary.conversations = stored.conversations;
        summary.messages = stored.messages;
        summary.tool_uses = stored.tool_uses;
        summary.tool_results = stored.tool_results;
        summary.thinking_blocks = stored.thinking_blocks;
        summary.decisions = stored.decisions;
        summary.mistakes = stored.mistakes;
        summary.requirements = stored.requirements;
        summary.methodologies = stored.methodologies;
        summary.file_edits = stored.file_edits;

        // Vector phase: last in the side-effect order, outside the batch
        // transaction because provider calls suspend.
        cancel.check()?;
        match self
            .pipeline
            .embed_and_store(&self.db, VEC_MESSAGES, embed_messages, cancel)
            .await
        {
            Ok(outcome) => summary.vectors_stored += outcome.vectors_stored,
            Err(MnemoError::Cancelled) => return Err(MnemoError::Cancelled),
            Err(e) => info!("Message embedding skipped: {}", e),
        }
        match self
            .pipeline
            .embed_and_store(&self.db, VEC_DECISIONS, embed_decisions, cancel)
            .await
        {
            Ok(outcome) => summary.vectors_stored += outcome.vectors_stored,
            Err(MnemoError::Cancelled) => return Err(MnemoError::Cancelled),
            Err(e) => info!("Decision embedding skipped: {}", e),
        }

        info!(
            conversations = summary.conversations,
            messages = summary.messages,
            decisions = summary.decisions,
            vectors = summary.vectors_stored,
            "Ingest complete"
        );
        Ok(summary)
    }
}

#[derive(Debug, Default)]
struct StoredCounts {
    conversations: usize,
    messages: usize,
    tool_uses: usize,
    tool_results: usize,
    thinking_blocks: usize,
    decisions: usize,
    mistakes: usize,
    requirements: usize,
    methodologies: usize,
    file_edits: usize,
}

/// The transactional half of an ingest batch. Runs on a pooled connection
/// under the writer mutex; any error rolls the whole batch back.
fn store_batch_tx(
    conn: &Connection,
    parsed: ParseResult,
) -> anyhow::Result<(StoredCounts, Vec<EmbedItem>, Vec<EmbedItem>)> {
    conn.execute_batch("BEGIN")?;
    let result = store_batch_inner(conn, parsed);
    match &result {
        Ok(_) => conn.execute_batch("COMMIT")?,
        Err(_) => {
            let _ = conn.execute_batch("ROLLBACK");
        }
    }
    result
}

fn store_batch_inner(
    conn: &Connection,
    parsed: ParseResult,
) -> anyhow::Result<(StoredCounts, Vec<EmbedItem>, Vec<EmbedItem>)> {
    let mut counts = StoredCounts::default();

    // Phase 1: conversations.
    let conversation_map = store_conversations_sync(conn, &parsed.conversations)?;
    counts.conversations = conversation_map.len();

    // Phase 2: messages (FTS deferred to one rebuild below).
    let message_result = store_messages_sync(conn, &parsed.messages, &conversation_map, true)?;
    counts.messages = message_result.stored;

    // Phase 3: tool activity and thinking.
    counts.tool_uses = store_tool_uses_sync(conn, &parsed.tool_uses, &message_result.id_map)?;
    counts.tool_results =
        store_tool_results_sync(conn, &parsed.tool_results, &message_result.id_map)?;
    counts.thinking_blocks =
        store_thinking_blocks_sync(conn, &parsed.thinking_blocks, &message_result.id_map)?;

    // Phase 4: extractors over the stored rows.
    let mut decisions = Vec::new();
    let mut mistakes = Vec::new();
    let mut requirements = Vec::new();
    let mut methodologies = Vec::new();
    let mut conversation_ids: Vec<i64> = conversation_map.values().copied().collect();
    conversation_ids.sort_unstable();

    for &conversation_id in &conversation_ids {
        let view = load_view_sync(conn, conversation_id)?;
        decisions.extend(extract::decisions::extract(&view));
        mistakes.extend(extract::mistakes::extract(&view));
        requirements.extend(extract::requirements::extract(&view));
        methodologies.extend(extract::methodology::extract(&view));
    }
    counts.decisions = store_decisions_sync(conn, &decisions)?;
    counts.mistakes = store_mistakes_sync(conn, &mistakes)?;
    counts.requirements = store_requirements_sync(conn, &requirements)?;
    counts.methodologies = store_methodologies_sync(conn, &methodologies)?;

    // Phase 5: file edits.
    counts.file_edits = store_file_edits_sync(conn, &parsed.file_edits, &conversation_map)?;

    // Phase 6: FTS rebuild for everything touched.
    rebuild_messages_fts_for_conversations(conn, &conversation_ids)?;
    rebuild_derived_fts_for_conversations(conn, &conversation_ids)?;

    // Collect the vector work while we still hold the rows.
    let mut embed_messages = Vec::new();
    let mut embed_decisions = Vec::new();
    for &conversation_id in &conversation_ids {
        let project_id: i64 = conn
            .query_row(
                "SELECT COALESCE(project_id, 0) FROM conversations WHERE id = ?",
                [conversation_id],
                |row| row.get(0),
            )
            .unwrap_or(0);
        for message in get_messages_sync(conn, conversation_id)? {
            if !message.content.trim().is_empty() {
                embed_messages.push(EmbedItem {
                    base_rowid: message.id,
                    project_id,
                    text: message.content,
                });
            }
        }
    }
    {
        let mut stmt = conn.prepare(
            "SELECT d.id, COALESCE(c.project_id, 0), d.decision_text
             FROM decisions d JOIN conversations c ON c.id = d.conversation_id
             WHERE d.conversation_id IN (SELECT value FROM json_each(?1))",
        )?;
        let ids_json = serde_json::to_string(&conversation_ids)?;
        let rows = stmt.query_map([ids_json], |row| {
            Ok(EmbedItem {
                base_rowid: row.get(0)?,
                project_id: row.get(1)?,
                text: row.get(2)?,
            })
        })?;
        embed_decisions.extend(rows.filter_map(|r| r.ok()));
    }

    Ok((counts, embed_messages, embed_decisions))
}

/// Build the extractor view of one stored conversation.
fn load_view_sync(conn: &Connection, conversation_id: i64) -> anyhow::Result<ConversationView> {
    let messages = get_messages_sync(conn, conversation_id)?;
    let mut stmt = conn.prepare_cached(
        "SELECT tu.message_id, tu.tool_name, tu.timestamp
         FROM tool_uses tu
         JOIN messages m ON m.id = tu.message_id
         WHERE m.conversation_id = ?1
         ORDER BY tu.timestamp, tu.id",
    )?;
    let tool_uses: Vec<ToolUseView> = stmt
        .query_map([conversation_id], |row| {
            Ok(ToolUseView {
                message_id: row.get(0)?,
                tool_name: row.get(1)?,
                timestamp: row.get(2)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(ConversationView::new(conversation_id, messages, tool_uses))
}
