// src/db/conversations.rs
// Upsert operations for conversations, messages, tool activity, and
// thinking blocks. All `_sync` functions assume they run inside the
// caller's transaction; the ingest orchestrator wraps a whole batch in one.

use super::schema;
use super::types::*;
use super::{Database, project};
use crate::util::now_ms;
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{HashMap, HashSet};

/// Outcome of a message batch store.
#[derive(Debug, Default)]
pub struct MessageStoreResult {
    pub stored: usize,
    /// Messages silently dropped because their conversation had no mapping.
    pub dropped: usize,
    /// (conversation_external_id, message_external_id) → message row id.
    pub id_map: HashMap<(String, String), i64>,
}

/// UPSERT a batch of conversations, returning external_id → row id.
///
/// `created_at` is preserved on conflict; every other field tracks the
/// latest parse. Project ids are normalised eagerly: each conversation's
/// path is resolved (or created) before the row is written.
pub fn store_conversations_sync(
    conn: &Connection,
    batch: &[NewConversation],
) -> Result<HashMap<String, i64>> {
    let now = now_ms();
    let mut id_map = HashMap::with_capacity(batch.len());

    let mut stmt = conn.prepare_cached(
        "INSERT INTO conversations (
            project_id, project_path, source_type, external_id,
            first_message_at, last_message_at, message_count,
            git_branch, client_version, metadata_json, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9, ?10, ?10)
         ON CONFLICT(source_type, external_id) DO UPDATE SET
            project_id = excluded.project_id,
            project_path = excluded.project_path,
            first_message_at = excluded.first_message_at,
            last_message_at = excluded.last_message_at,
            git_branch = excluded.git_branch,
            client_version = excluded.client_version,
            metadata_json = excluded.metadata_json,
            updated_at = excluded.updated_at
         RETURNING id",
    )?;

    for conv in batch {
        let project_id = project::resolve_project_id_sync(conn, &conv.project_path)?;
        // first ≤ last must hold even if a transcript is oddly ordered.
        let (first, last) = if conv.first_message_at <= conv.last_message_at {
            (conv.first_message_at, conv.last_message_at)
        } else {
            (conv.last_message_at, conv.first_message_at)
        };

        let id: i64 = stmt.query_row(
            params![
                project_id,
                conv.project_path,
                conv.source_type.as_str(),
                conv.external_id,
                first,
                last,
                conv.git_branch,
                conv.client_version,
                conv.metadata_json,
                now,
            ],
            |row| row.get(0),
        )?;
        id_map.insert(conv.external_id.clone(), id);
    }

    Ok(id_map)
}

/// UPSERT a batch of messages.
///
/// Messages whose conversation external id has no entry in
/// `conversation_id_map` are dropped (debug-logged, not an error). Unless
/// `skip_fts_rebuild` is set, the messages_fts rows of every touched
/// conversation are rebuilt at the end; a caller deferring the rebuild is
/// responsible for doing it once after its batch.
pub fn store_messages_sync(
    conn: &Connection,
    batch: &[NewMessage],
    conversation_id_map: &HashMap<String, i64>,
    skip_fts_rebuild: bool,
) -> Result<MessageStoreResult> {
    let mut result = MessageStoreResult::default();
    let mut touched: HashSet<i64> = HashSet::new();
    // Forward parent references resolved in a second pass.
    let mut parent_fixups: Vec<(i64, i64, String)> = Vec::new();

    let mut stmt = conn.prepare_cached(
        "INSERT INTO messages (
            conversation_id, external_id, parent_id, message_type, role,
            content, timestamp, is_sidechain, metadata_json
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(conversation_id, external_id) DO UPDATE SET
            parent_id = excluded.parent_id,
            message_type = excluded.message_type,
            role = excluded.role,
            content = excluded.content,
            timestamp = excluded.timestamp,
            is_sidechain = excluded.is_sidechain,
            metadata_json = excluded.metadata_json
         RETURNING id",
    )?;

    for msg in batch {
        let Some(&conversation_id) = conversation_id_map.get(&msg.conversation_external_id) else {
            tracing::debug!(
                conversation = %msg.conversation_external_id,
                message = %msg.external_id,
                "Dropping message with unmapped conversation"
            );
            result.dropped += 1;
            continue;
        };

        let parent_id = msg.parent_external_id.as_ref().and_then(|parent| {
            result
                .id_map
                .get(&(msg.conversation_external_id.clone(), parent.clone()))
                .copied()
        });

        let id: i64 = stmt.query_row(
            params![
                conversation_id,
                msg.external_id,
                parent_id,
                msg.message_type.as_str(),
                msg.role,
                msg.content,
                msg.timestamp,
                msg.is_sidechain,
                msg.metadata_json,
            ],
            |row| row.get(0),
        )?;

        if parent_id.is_none() {
            if let Some(parent) = &msg.parent_external_id {
                parent_fixups.push((id, conversation_id, parent.clone()));
            }
        }

        result
            .id_map
            .insert((msg.conversation_external_id.clone(), msg.external_id.clone()), id);
        result.stored += 1;
        touched.insert(conversation_id);
    }

    // Resolve parents that appeared later in the batch or in a prior run.
    for (message_id, conversation_id, parent_external) in parent_fixups {
        let parent_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM messages WHERE conversation_id = ?1 AND external_id = ?2",
                params![conversation_id, parent_external],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(parent_id) = parent_id {
            conn.execute(
                "UPDATE messages SET parent_id = ?1 WHERE id = ?2",
                params![parent_id, message_id],
            )?;
        }
    }

    let touched: Vec<i64> = touched.into_iter().collect();
    refresh_message_counts_sync(conn, &touched)?;
    if !skip_fts_rebuild {
        schema::rebuild_messages_fts_for_conversations(conn, &touched)?;
    }

    Ok(result)
}

/// Recompute message_count for the given conversations.
pub fn refresh_message_counts_sync(conn: &Connection, conversation_ids: &[i64]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "UPDATE conversations SET message_count =
            (SELECT COUNT(*) FROM messages WHERE conversation_id = conversations.id)
         WHERE id = ?1",
    )?;
    for id in conversation_ids {
        stmt.execute([id])?;
    }
    Ok(())
}

/// UPSERT tool uses; entries with unmapped messages are dropped.
pub fn store_tool_uses_sync(
    conn: &Connection,
    batch: &[NewToolUse],
    message_id_map: &HashMap<(String, String), i64>,
) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO tool_uses (message_id, external_id, tool_name, tool_input_json, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(message_id, external_id) DO UPDATE SET
            tool_name = excluded.tool_name,
            tool_input_json = excluded.tool_input_json,
            timestamp = excluded.timestamp",
    )?;

    let mut stored = 0;
    for tool_use in batch {
        let key = (
            tool_use.conversation_external_id.clone(),
            tool_use.message_external_id.clone(),
        );
        let Some(&message_id) = message_id_map.get(&key) else {
            tracing::debug!(tool = %tool_use.tool_name, "Dropping tool use with unmapped message");
            continue;
        };
        stmt.execute(params![
            message_id,
            tool_use.external_id,
            tool_use.tool_name,
            tool_use.tool_input_json,
            tool_use.timestamp,
        ])?;
        stored += 1;
    }
    Ok(stored)
}

/// UPSERT tool results, resolving each to its tool use by external id.
///
/// A result whose tool use cannot be found is an orphan: it is kept with a
/// NULL foreign key and logged, never discarded.
pub fn store_tool_results_sync(
    conn: &Connection,
    batch: &[NewToolResult],
    message_id_map: &HashMap<(String, String), i64>,
) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO tool_results (
            tool_use_id, tool_use_external_id, message_id, content,
            is_error, stdout, stderr, is_image, timestamp
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(message_id, tool_use_external_id) DO UPDATE SET
            tool_use_id = excluded.tool_use_id,
            content = excluded.content,
            is_error = excluded.is_error,
            stdout = excluded.stdout,
            stderr = excluded.stderr,
            is_image = excluded.is_image,
            timestamp = excluded.timestamp",
    )?;

    let mut stored = 0;
    for tool_result in batch {
        let key = (
            tool_result.conversation_external_id.clone(),
            tool_result.message_external_id.clone(),
        );
        let Some(&message_id) = message_id_map.get(&key) else {
            tracing::debug!("Dropping tool result with unmapped message");
            continue;
        };

        let external = tool_result.tool_use_external_id.as_deref().unwrap_or("");
        let tool_use_id: Option<i64> = if external.is_empty() {
            None
        } else {
            conn.query_row(
                "SELECT tu.id FROM tool_uses tu
                 JOIN messages m ON m.id = tu.message_id
                 WHERE tu.external_id = ?1
                   AND m.conversation_id = (SELECT conversation_id FROM messages WHERE id = ?2)",
                params![external, message_id],
                |row| row.get(0),
            )
            .optional()?
        };

        if tool_use_id.is_none() {
            tracing::warn!(
                tool_use = %external,
                "Orphan tool result (no matching tool use), keeping with NULL link"
            );
        }

        stmt.execute(params![
            tool_use_id,
            external,
            message_id,
            tool_result.content,
            tool_result.is_error,
            tool_result.stdout,
            tool_result.stderr,
            tool_result.is_image,
            tool_result.timestamp,
        ])?;
        stored += 1;
    }
    Ok(stored)
}

/// Replace thinking blocks for every message present in the batch.
///
/// Thinking blocks carry no external id of their own, so idempotence comes
/// from clearing the affected messages before reinserting.
pub fn store_thinking_blocks_sync(
    conn: &Connection,
    batch: &[NewThinkingBlock],
    message_id_map: &HashMap<(String, String), i64>,
) -> Result<usize> {
    let mut affected: HashSet<i64> = HashSet::new();
    let mut rows: Vec<(i64, &NewThinkingBlock)> = Vec::with_capacity(batch.len());

    for block in batch {
        let key = (
            block.conversation_external_id.clone(),
            block.message_external_id.clone(),
        );
        if let Some(&message_id) = message_id_map.get(&key) {
            affected.insert(message_id);
            rows.push((message_id, block));
        } else {
            tracing::debug!("Dropping thinking block with unmapped message");
        }
    }

    let mut delete = conn.prepare_cached("DELETE FROM thinking_blocks WHERE message_id = ?1")?;
    for message_id in &affected {
        delete.execute([message_id])?;
    }

    let mut insert = conn.prepare_cached(
        "INSERT INTO thinking_blocks (message_id, thinking_content, signature, timestamp)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (message_id, block) in &rows {
        insert.execute(params![
            message_id,
            block.thinking_content,
            block.signature,
            block.timestamp,
        ])?;
    }
    Ok(rows.len())
}

fn conversation_from_row(row: &rusqlite::Row) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        project_id: row.get(1)?,
        project_path: row.get(2)?,
        source_type: row.get(3)?,
        external_id: row.get(4)?,
        first_message_at: row.get(5)?,
        last_message_at: row.get(6)?,
        message_count: row.get(7)?,
        git_branch: row.get(8)?,
        client_version: row.get(9)?,
    })
}

const CONVERSATION_COLUMNS: &str = "id, project_id, project_path, source_type, external_id, \
     first_message_at, last_message_at, message_count, git_branch, client_version";

/// Fetch one conversation by row id.
pub fn get_conversation_sync(conn: &Connection, id: i64) -> rusqlite::Result<Option<Conversation>> {
    conn.query_row(
        &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?"),
        [id],
        conversation_from_row,
    )
    .optional()
}

/// Most recent conversations for a project path, newest first.
pub fn list_recent_conversations_sync(
    conn: &Connection,
    project_path: &str,
    limit: usize,
) -> rusqlite::Result<Vec<Conversation>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations
         WHERE project_path = ?1
         ORDER BY last_message_at DESC
         LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![project_path, limit as i64], conversation_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Messages of a conversation ordered by (timestamp, id).
pub fn get_messages_sync(conn: &Connection, conversation_id: i64) -> rusqlite::Result<Vec<Message>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, conversation_id, external_id, message_type, role, content,
                timestamp, is_sidechain
         FROM messages WHERE conversation_id = ?1
         ORDER BY timestamp, id",
    )?;
    let rows = stmt
        .query_map([conversation_id], |row| {
            Ok(Message {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                external_id: row.get(2)?,
                message_type: row.get(3)?,
                role: row.get(4)?,
                content: row.get(5)?,
                timestamp: row.get(6)?,
                is_sidechain: row.get(7)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Thinking blocks for a conversation.
///
/// Redacted by default: returns an empty list unless the caller passed
/// `include_thinking = true` explicitly.
pub fn get_thinking_blocks_sync(
    conn: &Connection,
    conversation_id: i64,
    include_thinking: bool,
) -> rusqlite::Result<Vec<(i64, String)>> {
    if !include_thinking {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare_cached(
        "SELECT tb.message_id, tb.thinking_content
         FROM thinking_blocks tb
         JOIN messages m ON m.id = tb.message_id
         WHERE m.conversation_id = ?1
         ORDER BY tb.timestamp, tb.id",
    )?;
    let rows = stmt
        .query_map([conversation_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

impl Database {
    /// UPSERT conversations, returning external_id → row id.
    pub async fn store_conversations(
        &self,
        batch: Vec<NewConversation>,
    ) -> Result<HashMap<String, i64>> {
        self.write(move |conn| store_conversations_sync(conn, &batch)).await
    }

    /// UPSERT messages for previously stored conversations.
    pub async fn store_messages(
        &self,
        batch: Vec<NewMessage>,
        conversation_id_map: HashMap<String, i64>,
        skip_fts_rebuild: bool,
    ) -> Result<MessageStoreResult> {
        self.write(move |conn| {
            store_messages_sync(conn, &batch, &conversation_id_map, skip_fts_rebuild)
        })
        .await
    }

    /// Fetch one conversation by id.
    pub async fn get_conversation(&self, id: i64) -> Result<Option<Conversation>> {
        self.interact(move |conn| Ok(get_conversation_sync(conn, id)?)).await
    }

    /// Most recent conversations for a project path.
    pub async fn list_recent_conversations(
        &self,
        project_path: &str,
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        let path = project_path.to_string();
        self.interact(move |conn| Ok(list_recent_conversations_sync(conn, &path, limit)?))
            .await
    }

    /// Thinking blocks for a conversation as (message_id, content) pairs.
    /// Empty unless the caller opted in with `include_thinking = true`.
    pub async fn get_thinking_blocks(
        &self,
        conversation_id: i64,
        include_thinking: bool,
    ) -> Result<Vec<(i64, String)>> {
        self.interact(move |conn| {
            Ok(get_thinking_blocks_sync(conn, conversation_id, include_thinking)?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn conversation(external_id: &str) -> NewConversation {
        NewConversation {
            source_type: SourceType::ClaudeCode,
            external_id: external_id.to_string(),
            project_path: "/tmp/demo".to_string(),
            first_message_at: 1000,
            last_message_at: 1100,
            message_count: 0,
            git_branch: Some("main".to_string()),
            client_version: None,
            metadata_json: None,
        }
    }

    fn message(conv: &str, id: &str, content: &str, ts: i64) -> NewMessage {
        NewMessage {
            conversation_external_id: conv.to_string(),
            external_id: id.to_string(),
            parent_external_id: None,
            message_type: MessageType::User,
            role: "user".to_string(),
            content: content.to_string(),
            timestamp: ts,
            is_sidechain: false,
            metadata_json: None,
        }
    }

    #[tokio::test]
    async fn test_store_conversations_idempotent() {
        let db = Database::open_in_memory().await.expect("open");

        let map1 = db
            .store_conversations(vec![conversation("S1")])
            .await
            .expect("store");
        let map2 = db
            .store_conversations(vec![conversation("S1")])
            .await
            .expect("store again");
        assert_eq!(map1["S1"], map2["S1"]);

        let row = db
            .interact(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*), MIN(first_message_at), MAX(last_message_at)
                     FROM conversations",
                    [],
                    |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?)),
                )?)
            })
            .await
            .expect("query");
        assert_eq!(row, (1, 1000, 1100));
    }

    #[tokio::test]
    async fn test_store_conversations_preserves_created_at() {
        let db = Database::open_in_memory().await.expect("open");
        db.store_conversations(vec![conversation("S1")]).await.expect("store");
        let created: i64 = db
            .interact(|conn| {
                Ok(conn.query_row("SELECT created_at FROM conversations", [], |r| r.get(0))?)
            })
            .await
            .expect("read");

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        db.store_conversations(vec![conversation("S1")]).await.expect("restore");
        let (created2, updated2): (i64, i64) = db
            .interact(|conn| {
                Ok(conn.query_row(
                    "SELECT created_at, updated_at FROM conversations",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?)
            })
            .await
            .expect("read");
        assert_eq!(created, created2);
        assert!(updated2 >= created2);
    }

    #[tokio::test]
    async fn test_swapped_timestamps_normalised() {
        let db = Database::open_in_memory().await.expect("open");
        let mut conv = conversation("S1");
        conv.first_message_at = 2000;
        conv.last_message_at = 1000;
        db.store_conversations(vec![conv]).await.expect("store");

        let (first, last): (i64, i64) = db
            .interact(|conn| {
                Ok(conn.query_row(
                    "SELECT first_message_at, last_message_at FROM conversations",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?)
            })
            .await
            .expect("read");
        assert!(first <= last);
    }

    #[tokio::test]
    async fn test_store_messages_updates_count_and_fts() {
        let db = Database::open_in_memory().await.expect("open");
        let id_map = db
            .store_conversations(vec![conversation("S1")])
            .await
            .expect("store conv");

        let result = db
            .store_messages(
                vec![message("S1", "m1", "hello", 1000), message("S1", "m2", "hi", 1100)],
                id_map.clone(),
                false,
            )
            .await
            .expect("store messages");
        assert_eq!(result.stored, 2);
        assert_eq!(result.dropped, 0);

        let (count, fts): (i64, i64) = db
            .interact(|conn| {
                let count = conn.query_row(
                    "SELECT message_count FROM conversations",
                    [],
                    |r| r.get(0),
                )?;
                let fts = conn.query_row("SELECT COUNT(*) FROM messages_fts", [], |r| r.get(0))?;
                Ok((count, fts))
            })
            .await
            .expect("read");
        assert_eq!(count, 2);
        assert_eq!(fts, 2);
    }

    #[tokio::test]
    async fn test_store_messages_drops_unmapped() {
        let db = Database::open_in_memory().await.expect("open");
        let id_map = db
            .store_conversations(vec![conversation("S1")])
            .await
            .expect("store conv");

        let result = db
            .store_messages(
                vec![message("S1", "m1", "kept", 1000), message("GHOST", "m2", "dropped", 1100)],
                id_map,
                false,
            )
            .await
            .expect("store");
        assert_eq!(result.stored, 1);
        assert_eq!(result.dropped, 1);
    }

    #[tokio::test]
    async fn test_message_upsert_no_duplicates() {
        let db = Database::open_in_memory().await.expect("open");
        let id_map = db
            .store_conversations(vec![conversation("S1")])
            .await
            .expect("store conv");

        db.store_messages(vec![message("S1", "m1", "v1", 1000)], id_map.clone(), false)
            .await
            .expect("first");
        db.store_messages(vec![message("S1", "m1", "v2 edited", 1000)], id_map, false)
            .await
            .expect("second");

        let (count, content): (i64, String) = db
            .interact(|conn| {
                let count = conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
                let content = conn.query_row("SELECT content FROM messages", [], |r| r.get(0))?;
                Ok((count, content))
            })
            .await
            .expect("read");
        assert_eq!(count, 1);
        assert_eq!(content, "v2 edited");
    }

    #[tokio::test]
    async fn test_parent_resolution_forward_reference() {
        let db = Database::open_in_memory().await.expect("open");
        let id_map = db
            .store_conversations(vec![conversation("S1")])
            .await
            .expect("store conv");

        // Child arrives before its parent in the batch.
        let mut child = message("S1", "m2", "child", 1100);
        child.parent_external_id = Some("m1".to_string());
        let parent = message("S1", "m1", "parent", 1000);

        let result = db
            .store_messages(vec![child, parent], id_map, false)
            .await
            .expect("store");
        let parent_id = result.id_map[&("S1".to_string(), "m1".to_string())];

        let linked: i64 = db
            .interact(move |conn| {
                Ok(conn.query_row(
                    "SELECT parent_id FROM messages WHERE external_id = 'm2'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .expect("read");
        assert_eq!(linked, parent_id);
    }

    #[tokio::test]
    async fn test_tool_use_and_result_linking() {
        let db = Database::open_in_memory().await.expect("open");
        let conv_map = db
            .store_conversations(vec![conversation("S1")])
            .await
            .expect("conv");
        let msg_result = db
            .store_messages(
                vec![message("S1", "m1", "run it", 1000), message("S1", "m2", "result", 1100)],
                conv_map,
                false,
            )
            .await
            .expect("messages");
        let msg_map = msg_result.id_map;

        let uses = vec![NewToolUse {
            conversation_external_id: "S1".into(),
            message_external_id: "m1".into(),
            external_id: "toolu_1".into(),
            tool_name: "Bash".into(),
            tool_input_json: "{}".into(),
            timestamp: 1000,
        }];
        let results = vec![
            NewToolResult {
                conversation_external_id: "S1".into(),
                message_external_id: "m2".into(),
                tool_use_external_id: Some("toolu_1".into()),
                content: "ok".into(),
                is_error: false,
                stdout: None,
                stderr: None,
                is_image: false,
                timestamp: 1100,
            },
            // Orphan: no such tool use, must be kept with NULL link.
            NewToolResult {
                conversation_external_id: "S1".into(),
                message_external_id: "m2".into(),
                tool_use_external_id: Some("toolu_missing".into()),
                content: "orphan".into(),
                is_error: false,
                stdout: None,
                stderr: None,
                is_image: false,
                timestamp: 1101,
            },
        ];

        let map_for_uses = msg_map.clone();
        let (uses_stored, results_stored) = db
            .write(move |conn| {
                let u = store_tool_uses_sync(conn, &uses, &map_for_uses)?;
                let r = store_tool_results_sync(conn, &results, &map_for_uses)?;
                Ok((u, r))
            })
            .await
            .expect("store tools");
        assert_eq!(uses_stored, 1);
        assert_eq!(results_stored, 2);

        let (linked, orphans): (i64, i64) = db
            .interact(|conn| {
                let linked = conn.query_row(
                    "SELECT COUNT(*) FROM tool_results WHERE tool_use_id IS NOT NULL",
                    [],
                    |r| r.get(0),
                )?;
                let orphans = conn.query_row(
                    "SELECT COUNT(*) FROM tool_results WHERE tool_use_id IS NULL",
                    [],
                    |r| r.get(0),
                )?;
                Ok((linked, orphans))
            })
            .await
            .expect("read");
        assert_eq!(linked, 1);
        assert_eq!(orphans, 1);
    }

    #[tokio::test]
    async fn test_thinking_blocks_replace_and_redact() {
        let db = Database::open_in_memory().await.expect("open");
        let conv_map = db
            .store_conversations(vec![conversation("S1")])
            .await
            .expect("conv");
        let conv_id = conv_map["S1"];
        let msg_map = db
            .store_messages(vec![message("S1", "m1", "hi", 1000)], conv_map, false)
            .await
            .expect("messages")
            .id_map;

        let blocks = vec![NewThinkingBlock {
            conversation_external_id: "S1".into(),
            message_external_id: "m1".into(),
            thinking_content: "pondering".into(),
            signature: None,
            timestamp: 1000,
        }];
        let map = msg_map.clone();
        let blocks2 = blocks.clone();
        db.write(move |conn| {
            store_thinking_blocks_sync(conn, &blocks, &map)?;
            Ok(())
        })
        .await
        .expect("store");
        // Re-ingest: replaced, not duplicated.
        let map = msg_map.clone();
        db.write(move |conn| {
            store_thinking_blocks_sync(conn, &blocks2, &map)?;
            Ok(())
        })
        .await
        .expect("restore");

        let (count, redacted, visible) = db
            .interact(move |conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM thinking_blocks", [], |r| r.get(0))?;
                let redacted = get_thinking_blocks_sync(conn, conv_id, false)?;
                let visible = get_thinking_blocks_sync(conn, conv_id, true)?;
                Ok((count, redacted, visible))
            })
            .await
            .expect("read");
        assert_eq!(count, 1);
        assert!(redacted.is_empty(), "thinking redacted unless opted in");
        assert_eq!(visible.len(), 1);
    }

    #[tokio::test]
    async fn test_cascade_delete_conversation() {
        let db = Database::open_in_memory().await.expect("open");
        let conv_map = db
            .store_conversations(vec![conversation("S1")])
            .await
            .expect("conv");
        let conv_id = conv_map["S1"];
        db.store_messages(vec![message("S1", "m1", "hello", 1000)], conv_map, false)
            .await
            .expect("messages");

        db.write(move |conn| {
            conn.execute("DELETE FROM conversations WHERE id = ?", [conv_id])?;
            Ok(())
        })
        .await
        .expect("delete");

        let remaining: i64 = db
            .interact(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?)
            })
            .await
            .expect("count");
        assert_eq!(remaining, 0, "messages cascade with their conversation");
    }
}
