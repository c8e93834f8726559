// src/db/working_memory.rs
// Short-lived key/value records scoped by project path, with TTL.
// Used by the context-injection surface; expired rows are swept lazily on
// read and eagerly by sweep_expired().

use super::Database;
use crate::util::now_ms;
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};

/// Upsert a working-memory entry - sync version.
pub fn set_working_memory_sync(
    conn: &Connection,
    project_path: &str,
    key: &str,
    value: &str,
    ttl_ms: Option<i64>,
) -> rusqlite::Result<()> {
    let now = now_ms();
    let expires_at = ttl_ms.map(|ttl| now + ttl);
    let id: i64 = conn.query_row(
        "INSERT INTO working_memory (project_path, key, value, expires_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(project_path, key) DO UPDATE SET
            value = excluded.value,
            expires_at = excluded.expires_at,
            updated_at = excluded.updated_at
         RETURNING id",
        params![project_path, key, value, expires_at, now],
        |row| row.get(0),
    )?;

    conn.execute("DELETE FROM working_memory_fts WHERE rowid = ?", [id])?;
    conn.execute(
        "INSERT INTO working_memory_fts(rowid, key, value) VALUES (?1, ?2, ?3)",
        params![id, key, value],
    )?;
    Ok(())
}

/// Read a working-memory entry, treating expired rows as absent.
pub fn get_working_memory_sync(
    conn: &Connection,
    project_path: &str,
    key: &str,
) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM working_memory
         WHERE project_path = ?1 AND key = ?2
           AND (expires_at IS NULL OR expires_at > ?3)",
        params![project_path, key, now_ms()],
        |row| row.get(0),
    )
    .optional()
}

/// Store a session handoff for the next session on this project.
pub fn store_session_handoff_sync(
    conn: &Connection,
    project_path: &str,
    summary: &str,
    next_steps: &[String],
    ttl_ms: Option<i64>,
) -> rusqlite::Result<i64> {
    let now = now_ms();
    conn.query_row(
        "INSERT INTO session_handoffs (project_path, summary, next_steps_json, created_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         RETURNING id",
        params![
            project_path,
            summary,
            serde_json::to_string(next_steps).unwrap_or_else(|_| "[]".into()),
            now,
            ttl_ms.map(|ttl| now + ttl),
        ],
        |row| row.get(0),
    )
}

/// Most recent unexpired handoff for a project.
pub fn latest_session_handoff_sync(
    conn: &Connection,
    project_path: &str,
) -> rusqlite::Result<Option<(String, Vec<String>)>> {
    conn.query_row(
        "SELECT summary, next_steps_json FROM session_handoffs
         WHERE project_path = ?1 AND (expires_at IS NULL OR expires_at > ?2)
         ORDER BY created_at DESC
         LIMIT 1",
        params![project_path, now_ms()],
        |row| {
            let summary: String = row.get(0)?;
            let steps: String = row.get(1)?;
            Ok((summary, serde_json::from_str(&steps).unwrap_or_default()))
        },
    )
    .optional()
}

/// Delete all expired working-memory and handoff rows. Returns rows removed.
pub fn sweep_expired_sync(conn: &Connection) -> rusqlite::Result<usize> {
    let now = now_ms();
    // Drop FTS rows first while the base rows still identify them.
    conn.execute(
        "DELETE FROM working_memory_fts WHERE rowid IN
           (SELECT id FROM working_memory WHERE expires_at IS NOT NULL AND expires_at <= ?1)",
        [now],
    )?;
    let memory = conn.execute(
        "DELETE FROM working_memory WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        [now],
    )?;
    let handoffs = conn.execute(
        "DELETE FROM session_handoffs WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        [now],
    )?;
    Ok(memory + handoffs)
}

impl Database {
    /// Upsert a working-memory entry with an optional TTL.
    pub async fn set_working_memory(
        &self,
        project_path: &str,
        key: &str,
        value: &str,
        ttl_ms: Option<i64>,
    ) -> Result<()> {
        let (path, key, value) = (project_path.to_string(), key.to_string(), value.to_string());
        self.write(move |conn| {
            set_working_memory_sync(conn, &path, &key, &value, ttl_ms)?;
            Ok(())
        })
        .await
    }

    /// Read a working-memory entry; expired entries read as None.
    pub async fn get_working_memory(
        &self,
        project_path: &str,
        key: &str,
    ) -> Result<Option<String>> {
        let (path, key) = (project_path.to_string(), key.to_string());
        self.interact(move |conn| Ok(get_working_memory_sync(conn, &path, &key)?))
            .await
    }

    /// Store a session handoff.
    pub async fn store_session_handoff(
        &self,
        project_path: &str,
        summary: &str,
        next_steps: Vec<String>,
        ttl_ms: Option<i64>,
    ) -> Result<i64> {
        let (path, summary) = (project_path.to_string(), summary.to_string());
        self.write(move |conn| {
            Ok(store_session_handoff_sync(conn, &path, &summary, &next_steps, ttl_ms)?)
        })
        .await
    }

    /// Latest unexpired session handoff for a project.
    pub async fn latest_session_handoff(
        &self,
        project_path: &str,
    ) -> Result<Option<(String, Vec<String>)>> {
        let path = project_path.to_string();
        self.interact(move |conn| Ok(latest_session_handoff_sync(conn, &path)?))
            .await
    }

    /// Remove expired TTL rows.
    pub async fn sweep_expired(&self) -> Result<usize> {
        self.write(|conn| Ok(sweep_expired_sync(conn)?)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_working_memory_round_trip() {
        let db = Database::open_in_memory().await.expect("open");
        db.set_working_memory("/p", "current_task", "refactor parser", None)
            .await
            .expect("set");
        let value = db.get_working_memory("/p", "current_task").await.expect("get");
        assert_eq!(value.as_deref(), Some("refactor parser"));

        // Scoped by project path.
        let other = db.get_working_memory("/other", "current_task").await.expect("get");
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn test_working_memory_expiry() {
        let db = Database::open_in_memory().await.expect("open");
        db.set_working_memory("/p", "stale", "old", Some(-1000))
            .await
            .expect("set already-expired");
        assert!(db.get_working_memory("/p", "stale").await.expect("get").is_none());

        let swept = db.sweep_expired().await.expect("sweep");
        assert_eq!(swept, 1);

        let fts: i64 = db
            .interact(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM working_memory_fts", [], |r| r.get(0))?)
            })
            .await
            .expect("fts count");
        assert_eq!(fts, 0, "sweep must not leave dangling FTS rows");
    }

    #[tokio::test]
    async fn test_working_memory_overwrite() {
        let db = Database::open_in_memory().await.expect("open");
        db.set_working_memory("/p", "k", "v1", None).await.expect("set");
        db.set_working_memory("/p", "k", "v2", None).await.expect("overwrite");
        assert_eq!(
            db.get_working_memory("/p", "k").await.expect("get").as_deref(),
            Some("v2")
        );

        let rows: i64 = db
            .interact(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM working_memory", [], |r| r.get(0))?)
            })
            .await
            .expect("count");
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_session_handoff_latest_wins() {
        let db = Database::open_in_memory().await.expect("open");
        db.store_session_handoff("/p", "first", vec![], None).await.expect("one");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        db.store_session_handoff("/p", "second", vec!["step".into()], None)
            .await
            .expect("two");

        let (summary, steps) = db
            .latest_session_handoff("/p")
            .await
            .expect("latest")
            .expect("present");
        assert_eq!(summary, "second");
        assert_eq!(steps, vec!["step".to_string()]);
    }
}
