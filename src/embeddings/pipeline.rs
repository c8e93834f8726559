// src/embeddings/pipeline.rs
// Chunk → embed → store. Vectors land in the sqlite-vec tables stamped with
// the provider's (model_name, dimensions); a stamp change rebuilds the
// affected index before anything is written.

use super::{EmbeddingClient, embedding_to_bytes};
use crate::chunker::Chunker;
use crate::db::Database;
use crate::db::schema::{VEC_DECISIONS, VEC_MESSAGES, ensure_vector_index};
use crate::error::{MnemoError, Result};
use crate::util::{CancelToken, now_ms};
use rusqlite::params;
use std::sync::Arc;
use tracing::{debug, warn};

/// One row to embed.
#[derive(Debug, Clone)]
pub struct EmbedItem {
    pub base_rowid: i64,
    pub project_id: i64,
    pub text: String,
}

/// Outcome of an embed-and-store run.
#[derive(Debug, Default, Clone)]
pub struct EmbedOutcome {
    pub rows_embedded: usize,
    pub vectors_stored: usize,
    /// Rows whose embedding failed; they are queued for retry and carry no
    /// searchable vector until the retry succeeds.
    pub rows_failed: usize,
    pub index_rebuilt: bool,
}

/// Embedding pipeline tying a provider client and a chunker to the store.
pub struct EmbeddingPipeline {
    client: Arc<EmbeddingClient>,
    chunker: Chunker,
}

impl EmbeddingPipeline {
    pub fn new(client: Arc<EmbeddingClient>, chunker: Chunker) -> Self {
        Self { client, chunker }
    }

    pub fn client(&self) -> &EmbeddingClient {
        &self.client
    }

    /// Embed the query text for a semantic sub-query.
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.client.embed(query).await
    }

    /// Chunk, embed, and store a batch of rows into `index_name`
    /// (VEC_MESSAGES or VEC_DECISIONS).
    ///
    /// Failures are local-recovered: a failed sub-batch queues its rows in
    /// pending_embeddings and the run continues. The write itself happens
    /// under the single-writer mutex in one transaction.
    pub async fn embed_and_store(
        &self,
        db: &Database,
        index_name: &'static str,
        batch: Vec<EmbedItem>,
        cancel: &CancelToken,
    ) -> Result<EmbedOutcome> {
        let mut outcome = EmbedOutcome::default();
        if batch.is_empty() {
            return Ok(outcome);
        }

        let model = self.client.model();
        let dimensions = self.client.dimensions();
        outcome.index_rebuilt = db
            .write(move |conn| ensure_vector_index(conn, index_name, &model, dimensions))
            .await
            .map_err(MnemoError::Other)?;

        // Chunk everything up front (pure CPU, no suspension).
        let mut chunk_rows: Vec<(i64, i64, usize, String)> = Vec::new();
        for item in &batch {
            let chunked = self.chunker.chunk(&item.text);
            for chunk in chunked.chunks {
                if chunk.content.trim().is_empty() {
                    continue;
                }
                chunk_rows.push((item.base_rowid, item.project_id, chunk.index, chunk.content));
            }
        }

        let sub_batch = self.client.batch_size();
        let mut stored: Vec<(i64, i64, usize, Vec<f32>)> = Vec::new();
        let mut failed_rowids: Vec<i64> = Vec::new();

        for window in chunk_rows.chunks(sub_batch) {
            cancel.check()?;
            let texts: Vec<String> = window.iter().map(|(_, _, _, text)| text.clone()).collect();
            match self.client.embed_batch(&texts).await {
                Ok(vectors) => {
                    for ((rowid, project_id, chunk_index, _), vector) in
                        window.iter().zip(vectors)
                    {
                        stored.push((*rowid, *project_id, *chunk_index, vector));
                    }
                }
                Err(e) => {
                    warn!("Embedding sub-batch failed, queueing for retry: {}", e);
                    failed_rowids.extend(window.iter().map(|(rowid, ..)| *rowid));
                }
            }
        }
        failed_rowids.sort_unstable();
        failed_rowids.dedup();

        cancel.check()?;

        let embedded_rowids: std::collections::HashSet<i64> = stored
            .iter()
            .map(|(rowid, ..)| *rowid)
            .filter(|rowid| !failed_rowids.contains(rowid))
            .collect();
        outcome.rows_embedded = embedded_rowids.len();
        outcome.rows_failed = failed_rowids.len();
        outcome.vectors_stored = stored.len();

        let failed_for_write = failed_rowids.clone();
        db.write(move |conn| {
            conn.execute_batch("BEGIN")?;
            let write = || -> anyhow::Result<()> {
                // Replace any existing vectors for the rows we embedded.
                for rowid in &embedded_rowids {
                    conn.execute(
                        &format!("DELETE FROM {index_name} WHERE base_rowid = ?1"),
                        [rowid],
                    )?;
                }
                let mut insert = conn.prepare(&format!(
                    "INSERT INTO {index_name} (embedding, base_rowid, chunk_index, project_id)
                     VALUES (?1, ?2, ?3, ?4)"
                ))?;
                for (rowid, project_id, chunk_index, vector) in &stored {
                    if failed_for_write.contains(rowid) {
                        continue;
                    }
                    insert.execute(params![
                        embedding_to_bytes(vector),
                        rowid,
                        *chunk_index as i64,
                        project_id,
                    ])?;
                }

                let target = target_of(index_name);
                for rowid in &embedded_rowids {
                    conn.execute(
                        "DELETE FROM pending_embeddings WHERE target = ?1 AND base_rowid = ?2",
                        params![target, rowid],
                    )?;
                }
                for rowid in &failed_for_write {
                    conn.execute(
                        "INSERT INTO pending_embeddings (target, base_rowid, status, created_at)
                         VALUES (?1, ?2, 'pending', ?3)
                         ON CONFLICT(target, base_rowid) DO UPDATE SET status = 'pending'",
                        params![target, rowid, now_ms()],
                    )?;
                }
                Ok(())
            };
            match write() {
                Ok(()) => conn.execute_batch("COMMIT")?,
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e);
                }
            }
            Ok(())
        })
        .await
        .map_err(MnemoError::Other)?;

        debug!(
            index = index_name,
            rows = outcome.rows_embedded,
            vectors = outcome.vectors_stored,
            failed = outcome.rows_failed,
            "Embedding batch stored"
        );
        Ok(outcome)
    }

    /// Re-embed rows previously queued in pending_embeddings.
    pub async fn retry_pending(
        &self,
        db: &Database,
        index_name: &'static str,
        cancel: &CancelToken,
    ) -> Result<EmbedOutcome> {
        let target = target_of(index_name);

        // Reconcile the index stamp first: a provider change rebuilds the
        // index and requeues every base row, and those rows must be visible
        // to the load below.
        let model = self.client.model();
        let dimensions = self.client.dimensions();
        let rebuilt = db
            .write(move |conn| ensure_vector_index(conn, index_name, &model, dimensions))
            .await
            .map_err(MnemoError::Other)?;
        let items: Vec<EmbedItem> = db
            .interact(move |conn| {
                let sql = match target {
                    "decisions" => {
                        "SELECT p.base_rowid, COALESCE(c.project_id, 0), d.decision_text
                         FROM pending_embeddings p
                         JOIN decisions d ON d.id = p.base_rowid
                         JOIN conversations c ON c.id = d.conversation_id
                         WHERE p.target = 'decisions' AND p.status = 'pending'"
                    }
                    _ => {
                        "SELECT p.base_rowid, COALESCE(c.project_id, 0), m.content
                         FROM pending_embeddings p
                         JOIN messages m ON m.id = p.base_rowid
                         JOIN conversations c ON c.id = m.conversation_id
                         WHERE p.target = 'messages' AND p.status = 'pending'"
                    }
                };
                let mut stmt = conn.prepare(sql)?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(EmbedItem {
                            base_rowid: row.get(0)?,
                            project_id: row.get(1)?,
                            text: row.get(2)?,
                        })
                    })?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .await
            .map_err(MnemoError::Other)?;

        let mut outcome = self.embed_and_store(db, index_name, items, cancel).await?;
        outcome.index_rebuilt |= rebuilt;
        Ok(outcome)
    }
}

fn target_of(index_name: &str) -> &'static str {
    match index_name {
        VEC_DECISIONS => "decisions",
        _ => {
            debug_assert!(index_name == VEC_MESSAGES);
            "messages"
        }
    }
}
