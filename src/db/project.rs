// src/db/project.rs
// Project resolution across canonical paths and aliases.

use super::Database;
use crate::util::{now_ms, sanitize_project_path};
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};

/// Resolve a project path to its row id - sync version for interact().
///
/// Resolution order: canonical path, then alias, then create a new row.
pub fn resolve_project_id_sync(conn: &Connection, path: &str) -> rusqlite::Result<i64> {
    if let Some(id) = conn
        .query_row(
            "SELECT id FROM projects WHERE canonical_path = ?",
            [path],
            |row| row.get(0),
        )
        .optional()?
    {
        return Ok(id);
    }

    if let Some(id) = conn
        .query_row(
            "SELECT project_id FROM project_aliases WHERE alias_path = ?",
            [path],
            |row| row.get(0),
        )
        .optional()?
    {
        return Ok(id);
    }

    let now = now_ms();
    conn.query_row(
        "INSERT INTO projects (canonical_path, display_path, created_at, updated_at)
         VALUES (?1, ?1, ?2, ?2)
         ON CONFLICT(canonical_path) DO UPDATE SET updated_at = excluded.updated_at
         RETURNING id",
        params![path, now],
        |row| row.get(0),
    )
}

/// Register an alias for an existing project - sync version.
pub fn add_project_alias_sync(
    conn: &Connection,
    alias_path: &str,
    project_id: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO project_aliases (alias_path, project_id) VALUES (?1, ?2)
         ON CONFLICT(alias_path) DO UPDATE SET project_id = excluded.project_id",
        params![alias_path, project_id],
    )?;
    Ok(())
}

/// Point a project at a new canonical path, keeping the old one reachable
/// as an alias. Used by the folder-migration service inside its transaction.
pub fn repoint_project_sync(
    conn: &Connection,
    project_id: i64,
    old_path: &str,
    new_path: &str,
) -> rusqlite::Result<()> {
    // If the new path already exists as an alias of this project, drop the
    // alias first so the canonical update does not create a split identity.
    conn.execute(
        "DELETE FROM project_aliases WHERE alias_path = ?1 AND project_id = ?2",
        params![new_path, project_id],
    )?;
    conn.execute(
        "UPDATE projects SET canonical_path = ?1, display_path = ?1, updated_at = ?2
         WHERE id = ?3 AND canonical_path = ?4",
        params![new_path, now_ms(), project_id, old_path],
    )?;
    add_project_alias_sync(conn, old_path, project_id)?;
    Ok(())
}

impl Database {
    /// Resolve a project path to its id, creating the project if neither the
    /// canonical path nor an alias matches. Input is sanitised first; results
    /// are cached until `clear_cache()`.
    pub async fn resolve_project_id(&self, path: &str) -> crate::error::Result<i64> {
        let clean = sanitize_project_path(path)?;
        if let Some(id) = self.project_cache().get(&clean) {
            return Ok(id);
        }

        let lookup = clean.clone();
        let id = self
            .write(move |conn| Ok(resolve_project_id_sync(conn, &lookup)?))
            .await
            .map_err(crate::error::MnemoError::Other)?;
        self.project_cache().insert(clean, id);
        Ok(id)
    }

    /// Register an alias path for a project.
    pub async fn add_project_alias(&self, alias: &str, project_id: i64) -> crate::error::Result<()> {
        let clean = sanitize_project_path(alias)?;
        self.write(move |conn| Ok(add_project_alias_sync(conn, &clean, project_id)?))
            .await
            .map_err(crate::error::MnemoError::Other)?;
        self.clear_cache();
        Ok(())
    }

    /// List all projects as (id, canonical_path).
    pub async fn list_projects(&self) -> Result<Vec<(i64, String)>> {
        self.interact(|conn| {
            let mut stmt = conn.prepare("SELECT id, canonical_path FROM projects ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_resolve_creates_once() {
        let db = Database::open_in_memory().await.expect("open");
        let a = db.resolve_project_id("/tmp/demo").await.expect("resolve");
        let b = db.resolve_project_id("/tmp/demo").await.expect("resolve again");
        assert_eq!(a, b);

        let stats = db.get_stats().await.expect("stats");
        assert_eq!(stats.projects, 1);
    }

    #[tokio::test]
    async fn test_alias_resolves_to_same_project() {
        let db = Database::open_in_memory().await.expect("open");
        let id = db.resolve_project_id("/old/proj").await.expect("resolve");
        db.add_project_alias("/renamed/proj", id).await.expect("alias");

        let via_alias = db.resolve_project_id("/renamed/proj").await.expect("resolve alias");
        assert_eq!(via_alias, id);

        let stats = db.get_stats().await.expect("stats");
        assert_eq!(stats.projects, 1, "alias must not create a duplicate project");
    }

    #[tokio::test]
    async fn test_resolve_rejects_bad_paths() {
        let db = Database::open_in_memory().await.expect("open");
        assert!(db.resolve_project_id("/etc/passwd").await.is_err());
        assert!(db.resolve_project_id("/tmp/../etc").await.is_err());
    }

    #[tokio::test]
    async fn test_repoint_project() {
        let db = Database::open_in_memory().await.expect("open");
        let id = db.resolve_project_id("/old/proj").await.expect("resolve");

        db.write(move |conn| {
            repoint_project_sync(conn, id, "/old/proj", "/new/proj")?;
            Ok(())
        })
        .await
        .expect("repoint");
        db.clear_cache();

        // New canonical path and old path both resolve to the same project.
        assert_eq!(db.resolve_project_id("/new/proj").await.expect("new"), id);
        assert_eq!(db.resolve_project_id("/old/proj").await.expect("old"), id);
    }
}
