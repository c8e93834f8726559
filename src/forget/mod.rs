// src/forget/mod.rs
// Topic-targeted deletion with automatic rollback points.
//
// Discovery unions a semantic pass and a lexical FTS pass; before anything
// is deleted, the affected conversation subtrees (vectors included) are
// dumped to a 0o600 backup file. The delete itself is one transaction:
// FTS rows by rowid, then the conversations, cascade handles the rest.

use crate::db::Database;
use crate::db::schema::{VEC_DECISIONS, VEC_MESSAGES};
use crate::embeddings::EmbeddingPipeline;
use crate::error::{MnemoError, Result};
use crate::util::{fts_or_query, now_ms, sanitize_project_path};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Candidates pulled per discovery path.
const DISCOVERY_LIMIT: usize = 500;

/// What a deletion would remove.
#[derive(Debug, Clone, Serialize)]
pub struct DeletionPreview {
    pub conversation_ids: Vec<i64>,
    pub conversations: usize,
    pub messages: usize,
    pub decisions: usize,
    pub summary: String,
}

/// Outcome of a completed forget run.
#[derive(Debug, Clone, Serialize)]
pub struct ForgetSummary {
    pub deleted_conversations: usize,
    pub deleted_messages: usize,
    pub backup_path: Option<PathBuf>,
    pub summary: String,
}

/// Serialised backup of the deleted subtrees.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeletionBackup {
    pub created_at: i64,
    pub description: String,
    pub conversation_ids: Vec<i64>,
    pub conversations: Vec<serde_json::Value>,
    pub messages: Vec<serde_json::Value>,
    pub tool_uses: Vec<serde_json::Value>,
    pub tool_results: Vec<serde_json::Value>,
    pub thinking_blocks: Vec<serde_json::Value>,
    pub decisions: Vec<serde_json::Value>,
    pub mistakes: Vec<serde_json::Value>,
    pub requirements: Vec<serde_json::Value>,
    pub file_edits: Vec<serde_json::Value>,
    pub message_vectors: Vec<BackupVector>,
    pub decision_vectors: Vec<BackupVector>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupVector {
    pub base_rowid: i64,
    pub chunk_index: i64,
    pub embedding: Vec<f32>,
}

/// Deletion and backup service.
pub struct DeletionService {
    db: Arc<Database>,
    pipeline: Arc<EmbeddingPipeline>,
    /// Where backups land; defaults to `backups/` next to the database.
    backup_dir: Option<PathBuf>,
}

impl DeletionService {
    pub fn new(db: Arc<Database>, pipeline: Arc<EmbeddingPipeline>) -> Self {
        Self {
            db,
            pipeline,
            backup_dir: None,
        }
    }

    pub fn with_backup_dir(mut self, dir: PathBuf) -> Self {
        self.backup_dir = Some(dir);
        self
    }

    /// Preview which conversations a forget run would remove.
    pub async fn preview_deletion_by_topic(
        &self,
        keywords: &[String],
        project_path: &str,
    ) -> Result<DeletionPreview> {
        let ids = self.discover(keywords, project_path).await?;
        let (messages, decisions) = self.count_subtree(&ids).await?;
        let summary = if ids.is_empty() {
            "no conversations found for the given topic".to_string()
        } else {
            format!(
                "{} conversation(s), {} message(s), {} decision(s) would be removed",
                ids.len(),
                messages,
                decisions
            )
        };
        Ok(DeletionPreview {
            conversations: ids.len(),
            conversation_ids: ids,
            messages,
            decisions,
            summary,
        })
    }

    /// Delete every conversation matching the topic keywords, writing a
    /// backup first. Re-running with the same keywords on a cleaned store
    /// finds nothing, writes no backup, and deletes nothing.
    pub async fn forget_by_topic(
        &self,
        keywords: &[String],
        project_path: &str,
    ) -> Result<ForgetSummary> {
        let ids = self.discover(keywords, project_path).await?;
        if ids.is_empty() {
            return Ok(ForgetSummary {
                deleted_conversations: 0,
                deleted_messages: 0,
                backup_path: None,
                summary: "no conversations found for the given topic".to_string(),
            });
        }

        let (messages, _) = self.count_subtree(&ids).await?;
        let backup_path = self.write_backup(&ids, keywords).await?;

        let ids_for_delete = ids.clone();
        self.db
            .write(move |conn| delete_conversations_tx(conn, &ids_for_delete))
            .await
            .map_err(MnemoError::Other)?;
        self.db.clear_cache();

        info!(
            conversations = ids.len(),
            backup = ?backup_path,
            "Forget-by-topic complete"
        );
        Ok(ForgetSummary {
            deleted_conversations: ids.len(),
            deleted_messages: messages,
            backup_path,
            summary: format!("removed {} conversation(s), backup written", ids.len()),
        })
    }

    /// Union of semantic and lexical discovery. A failure in either path is
    /// logged and the other path still contributes.
    async fn discover(&self, keywords: &[String], project_path: &str) -> Result<Vec<i64>> {
        let keywords: Vec<String> = keywords
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let project = sanitize_project_path(project_path)?;
        let mut ids: BTreeSet<i64> = BTreeSet::new();

        // Semantic path.
        match self.pipeline.embed_query(&keywords.join(" ")).await {
            Ok(embedding) => {
                let project_clone = project.clone();
                let semantic = self
                    .db
                    .interact(move |conn| {
                        Ok(semantic_conversations_sync(conn, &embedding, &project_clone))
                    })
                    .await
                    .map_err(MnemoError::Other)?;
                ids.extend(semantic);
            }
            Err(e) => warn!("Semantic discovery unavailable: {}", e),
        }

        // Lexical path: every keyword quoted, OR-joined.
        let match_expr = fts_or_query(&keywords);
        let project_clone = project.clone();
        match self
            .db
            .interact(move |conn| lexical_conversations_sync(conn, &match_expr, &project_clone))
            .await
        {
            Ok(lexical) => ids.extend(lexical),
            Err(e) => warn!("Lexical discovery failed: {}", e),
        }

        Ok(ids.into_iter().collect())
    }

    async fn count_subtree(&self, ids: &[i64]) -> Result<(usize, usize)> {
        if ids.is_empty() {
            return Ok((0, 0));
        }
        let ids = ids.to_vec();
        self.db
            .interact(move |conn| {
                let ids_json = serde_json::to_string(&ids)?;
                let messages: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM messages
                     WHERE conversation_id IN (SELECT value FROM json_each(?1))",
                    [&ids_json],
                    |r| r.get(0),
                )?;
                let decisions: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM decisions
                     WHERE conversation_id IN (SELECT value FROM json_each(?1))",
                    [&ids_json],
                    |r| r.get(0),
                )?;
                Ok((messages as usize, decisions as usize))
            })
            .await
            .map_err(MnemoError::Other)
    }

    /// Dump the affected subtrees to a timestamped backup file (0o600).
    async fn write_backup(&self, ids: &[i64], keywords: &[String]) -> Result<Option<PathBuf>> {
        let dir = match &self.backup_dir {
            Some(dir) => dir.clone(),
            None => match self.db.path() {
                Some(db_path) => db_path
                    .parent()
                    .map(|p| p.join("backups"))
                    .unwrap_or_else(|| PathBuf::from("backups")),
                None => {
                    // In-memory store (tests without an explicit dir): the
                    // delete is already covered by the caller's fixtures.
                    warn!("No backup directory for in-memory database, skipping backup");
                    return Ok(None);
                }
            },
        };
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            let mut perms = std::fs::metadata(&dir)?.permissions();
            perms.set_mode(0o700);
            std::fs::set_permissions(&dir, perms)?;
        }

        let ids_vec = ids.to_vec();
        let description = format!("forget_by_topic: {}", keywords.join(", "));
        let backup = self
            .db
            .interact(move |conn| collect_backup_sync(conn, &ids_vec, &description))
            .await
            .map_err(MnemoError::Other)?;

        let path = dir.join(format!("forget-{}.json", backup.created_at));
        let payload = serde_json::to_vec_pretty(&backup)?;
        std::fs::write(&path, payload)?;
        #[cfg(unix)]
        {
            let mut perms = std::fs::metadata(&path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }
        info!(path = %path.display(), "Deletion backup written");
        Ok(Some(path))
    }
}

/// Conversations whose messages are semantically close to the query.
fn semantic_conversations_sync(conn: &Connection, embedding: &[f32], project: &str) -> Vec<i64> {
    let exists: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?",
            [VEC_MESSAGES],
            |_| Ok(true),
        )
        .unwrap_or(false);
    if !exists {
        return Vec::new();
    }

    let bytes = crate::embeddings::embedding_to_bytes(embedding);
    conn.prepare(
        "SELECT DISTINCT m.conversation_id
         FROM (SELECT base_rowid, vec_distance_cosine(embedding, ?1) AS distance
               FROM vec_messages ORDER BY distance LIMIT ?2) v
         JOIN messages m ON m.id = v.base_rowid
         JOIN conversations c ON c.id = m.conversation_id
         WHERE c.project_path = ?3 AND v.distance < 0.5",
    )
    .and_then(|mut stmt| {
        stmt.query_map(
            rusqlite::params![bytes, DISCOVERY_LIMIT as i64, project],
            |row| row.get(0),
        )
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
    })
    .unwrap_or_default()
}

/// Conversations with an FTS hit for any keyword.
fn lexical_conversations_sync(
    conn: &Connection,
    match_expr: &str,
    project: &str,
) -> anyhow::Result<Vec<i64>> {
    if match_expr.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT DISTINCT m.conversation_id
         FROM messages_fts f
         JOIN messages m ON m.id = f.rowid
         JOIN conversations c ON c.id = m.conversation_id
         WHERE messages_fts MATCH ?1 AND c.project_path = ?2
         LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(
            rusqlite::params![match_expr, project, DISCOVERY_LIMIT as i64],
            |row| row.get(0),
        )?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

fn rows_as_json(
    conn: &Connection,
    sql: &str,
    ids_json: &str,
) -> anyhow::Result<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(sql)?;
    let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let rows = stmt
        .query_map([ids_json], |row| {
            let mut object = serde_json::Map::new();
            for (i, name) in column_names.iter().enumerate() {
                let value: rusqlite::types::Value = row.get(i)?;
                let json = match value {
                    rusqlite::types::Value::Null => serde_json::Value::Null,
                    rusqlite::types::Value::Integer(v) => v.into(),
                    rusqlite::types::Value::Real(v) => serde_json::json!(v),
                    rusqlite::types::Value::Text(v) => v.into(),
                    rusqlite::types::Value::Blob(v) => {
                        serde_json::Value::String(format!("<blob:{}b>", v.len()))
                    }
                };
                object.insert(name.clone(), json);
            }
            Ok(serde_json::Value::Object(object))
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

fn vectors_for_backup(
    conn: &Connection,
    index_name: &str,
    sql: &str,
    ids_json: &str,
) -> Vec<BackupVector> {
    let exists: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?",
            [index_name],
            |_| Ok(true),
        )
        .unwrap_or(false);
    if !exists {
        return Vec::new();
    }
    conn.prepare(sql)
        .and_then(|mut stmt| {
            stmt.query_map([ids_json], |row| {
                let base_rowid: i64 = row.get(0)?;
                let chunk_index: i64 = row.get(1)?;
                let blob: Vec<u8> = row.get(2)?;
                let embedding = blob
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();
                Ok(BackupVector {
                    base_rowid,
                    chunk_index,
                    embedding,
                })
            })
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
        })
        .unwrap_or_default()
}

/// Gather every row of the affected conversation subtrees.
fn collect_backup_sync(
    conn: &Connection,
    ids: &[i64],
    description: &str,
) -> anyhow::Result<DeletionBackup> {
    let ids_json = serde_json::to_string(ids)?;
    let in_ids = "IN (SELECT value FROM json_each(?1))";

    Ok(DeletionBackup {
        created_at: now_ms(),
        description: description.to_string(),
        conversation_ids: ids.to_vec(),
        conversations: rows_as_json(
            conn,
            &format!("SELECT * FROM conversations WHERE id {in_ids}"),
            &ids_json,
        )?,
        messages: rows_as_json(
            conn,
            &format!("SELECT * FROM messages WHERE conversation_id {in_ids}"),
            &ids_json,
        )?,
        tool_uses: rows_as_json(
            conn,
            &format!(
                "SELECT tu.* FROM tool_uses tu JOIN messages m ON m.id = tu.message_id
                 WHERE m.conversation_id {in_ids}"
            ),
            &ids_json,
        )?,
        tool_results: rows_as_json(
            conn,
            &format!(
                "SELECT tr.* FROM tool_results tr JOIN messages m ON m.id = tr.message_id
                 WHERE m.conversation_id {in_ids}"
            ),
            &ids_json,
        )?,
        thinking_blocks: rows_as_json(
            conn,
            &format!(
                "SELECT tb.* FROM thinking_blocks tb JOIN messages m ON m.id = tb.message_id
                 WHERE m.conversation_id {in_ids}"
            ),
            &ids_json,
        )?,
        decisions: rows_as_json(
            conn,
            &format!("SELECT * FROM decisions WHERE conversation_id {in_ids}"),
            &ids_json,
        )?,
        mistakes: rows_as_json(
            conn,
            &format!("SELECT * FROM mistakes WHERE conversation_id {in_ids}"),
            &ids_json,
        )?,
        requirements: rows_as_json(
            conn,
            &format!("SELECT * FROM requirements WHERE conversation_id {in_ids}"),
            &ids_json,
        )?,
        file_edits: rows_as_json(
            conn,
            &format!("SELECT * FROM file_edits WHERE conversation_id {in_ids}"),
            &ids_json,
        )?,
        message_vectors: vectors_for_backup(
            conn,
            VEC_MESSAGES,
            &format!(
                "SELECT v.base_rowid, v.chunk_index, v.embedding FROM vec_messages v
                 JOIN messages m ON m.id = v.base_rowid
                 WHERE m.conversation_id {in_ids}"
            ),
            &ids_json,
        ),
        decision_vectors: vectors_for_backup(
            conn,
            VEC_DECISIONS,
            &format!(
                "SELECT v.base_rowid, v.chunk_index, v.embedding FROM vec_decisions v
                 JOIN decisions d ON d.id = v.base_rowid
                 WHERE d.conversation_id {in_ids}"
            ),
            &ids_json,
        ),
    })
}

/// The destructive half, in one transaction: FTS rows by rowid, vector rows,
/// then the conversations (cascade covers the rest).
fn delete_conversations_tx(conn: &Connection, ids: &[i64]) -> anyhow::Result<()> {
    let ids_json = serde_json::to_string(ids)?;
    conn.execute_batch("BEGIN")?;
    let delete = || -> anyhow::Result<()> {
        conn.execute(
            "DELETE FROM messages_fts WHERE rowid IN
               (SELECT id FROM messages
                WHERE conversation_id IN (SELECT value FROM json_each(?1)))",
            [&ids_json],
        )?;
        conn.execute(
            "DELETE FROM decisions_fts WHERE rowid IN
               (SELECT id FROM decisions
                WHERE conversation_id IN (SELECT value FROM json_each(?1)))",
            [&ids_json],
        )?;
        conn.execute(
            "DELETE FROM mistakes_fts WHERE rowid IN
               (SELECT id FROM mistakes
                WHERE conversation_id IN (SELECT value FROM json_each(?1)))",
            [&ids_json],
        )?;

        for (vec_table, base_sql) in [
            (VEC_MESSAGES, "SELECT id FROM messages WHERE conversation_id IN (SELECT value FROM json_each(?1))"),
            (VEC_DECISIONS, "SELECT id FROM decisions WHERE conversation_id IN (SELECT value FROM json_each(?1))"),
        ] {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?",
                    [vec_table],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            if exists {
                conn.execute(
                    &format!("DELETE FROM {vec_table} WHERE base_rowid IN ({base_sql})"),
                    [&ids_json],
                )?;
            }
        }

        conn.execute(
            "DELETE FROM pending_embeddings WHERE base_rowid IN
               (SELECT id FROM messages
                WHERE conversation_id IN (SELECT value FROM json_each(?1)))
             AND target = 'messages'",
            [&ids_json],
        )?;

        conn.execute(
            "DELETE FROM conversations WHERE id IN (SELECT value FROM json_each(?1))",
            [&ids_json],
        )?;
        Ok(())
    };
    match delete() {
        Ok(()) => conn.execute_batch("COMMIT")?,
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    }
    Ok(())
}
