// src/db/schema.rs
// Database schema and versioned migrations.
//
// Migrations are immutable once applied: each row in schema_version carries
// a SHA-256 checksum of "<version>:<description>:<up_sql>", and a mismatch
// at startup is a hard error rather than an auto-repair. FTS5 virtual tables
// cannot be ALTERed, so shape changes drop and recreate them, then reinsert
// from the base table.

use crate::util::now_ms;
use anyhow::{Context, Result, bail};
use rusqlite::{Connection, params};
use sha2::{Digest, Sha256};

/// A single versioned migration.
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub up: &'static str,
}

/// All migrations, ascending by version.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "initial schema",
        up: r#"
-- =======================================
-- CORE: Projects and aliases
-- =======================================
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY,
    canonical_path TEXT UNIQUE NOT NULL,
    display_path TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS project_aliases (
    alias_path TEXT PRIMARY KEY,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE
);

-- =======================================
-- CONVERSATIONS & MESSAGES
-- =======================================
CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY,
    project_id INTEGER REFERENCES projects(id),
    project_path TEXT NOT NULL,
    source_type TEXT NOT NULL,
    external_id TEXT NOT NULL,
    first_message_at INTEGER NOT NULL,
    last_message_at INTEGER NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0,
    git_branch TEXT,
    client_version TEXT,
    metadata_json TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(source_type, external_id)
);
CREATE INDEX IF NOT EXISTS idx_conversations_project ON conversations(project_id, last_message_at DESC);
CREATE INDEX IF NOT EXISTS idx_conversations_path ON conversations(project_path);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    external_id TEXT NOT NULL,
    parent_id INTEGER,
    message_type TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    is_sidechain INTEGER NOT NULL DEFAULT 0,
    metadata_json TEXT,
    UNIQUE(conversation_id, external_id)
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, timestamp, id);

CREATE TABLE IF NOT EXISTS tool_uses (
    id INTEGER PRIMARY KEY,
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    external_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    tool_input_json TEXT,
    timestamp INTEGER NOT NULL,
    UNIQUE(message_id, external_id)
);
CREATE INDEX IF NOT EXISTS idx_tool_uses_external ON tool_uses(external_id);

CREATE TABLE IF NOT EXISTS tool_results (
    id INTEGER PRIMARY KEY,
    tool_use_id INTEGER REFERENCES tool_uses(id) ON DELETE SET NULL,
    tool_use_external_id TEXT NOT NULL DEFAULT '',
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    content TEXT NOT NULL,
    is_error INTEGER NOT NULL DEFAULT 0,
    stdout TEXT,
    stderr TEXT,
    is_image INTEGER NOT NULL DEFAULT 0,
    timestamp INTEGER NOT NULL,
    UNIQUE(message_id, tool_use_external_id)
);
CREATE INDEX IF NOT EXISTS idx_tool_results_message ON tool_results(message_id);

CREATE TABLE IF NOT EXISTS thinking_blocks (
    id INTEGER PRIMARY KEY,
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    thinking_content TEXT NOT NULL,
    signature TEXT,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_thinking_message ON thinking_blocks(message_id);

-- =======================================
-- DERIVED RECORDS
-- =======================================
CREATE TABLE IF NOT EXISTS decisions (
    id INTEGER PRIMARY KEY,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    message_id INTEGER NOT NULL,
    decision_text TEXT NOT NULL,
    rationale TEXT,
    alternatives_json TEXT NOT NULL DEFAULT '[]',
    rejected_reasons_json TEXT NOT NULL DEFAULT '[]',
    related_files_json TEXT NOT NULL DEFAULT '[]',
    related_commits_json TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(conversation_id, message_id, decision_text)
);
CREATE INDEX IF NOT EXISTS idx_decisions_conversation ON decisions(conversation_id);

CREATE TABLE IF NOT EXISTS mistakes (
    id INTEGER PRIMARY KEY,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    message_id INTEGER NOT NULL,
    mistake_text TEXT NOT NULL,
    correction_text TEXT NOT NULL,
    assistant_action TEXT,
    related_files_json TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(conversation_id, message_id, mistake_text)
);

CREATE TABLE IF NOT EXISTS requirements (
    id INTEGER PRIMARY KEY,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    message_id INTEGER NOT NULL,
    requirement_text TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'constraint',
    related_files_json TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(conversation_id, message_id, requirement_text)
);

CREATE TABLE IF NOT EXISTS methodologies (
    id INTEGER PRIMARY KEY,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    start_message_id INTEGER,
    end_message_id INTEGER,
    problem TEXT NOT NULL,
    approach TEXT NOT NULL,
    steps_json TEXT NOT NULL DEFAULT '[]',
    outcome TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE(conversation_id, start_message_id, end_message_id)
);

CREATE TABLE IF NOT EXISTS file_edits (
    id INTEGER PRIMARY KEY,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    file_path TEXT NOT NULL,
    edit_type TEXT NOT NULL,
    snapshot_timestamp INTEGER NOT NULL,
    UNIQUE(conversation_id, file_path, edit_type, snapshot_timestamp)
);
CREATE INDEX IF NOT EXISTS idx_file_edits_path ON file_edits(file_path);

CREATE TABLE IF NOT EXISTS git_commits (
    id INTEGER PRIMARY KEY,
    project_id INTEGER NOT NULL REFERENCES projects(id),
    conversation_id INTEGER REFERENCES conversations(id) ON DELETE SET NULL,
    hash TEXT NOT NULL,
    message TEXT NOT NULL,
    author TEXT,
    timestamp INTEGER NOT NULL,
    branch TEXT,
    files_changed_json TEXT NOT NULL DEFAULT '[]',
    metadata_json TEXT,
    UNIQUE(project_id, hash)
);

-- =======================================
-- WORKING MEMORY (TTL key/value)
-- =======================================
CREATE TABLE IF NOT EXISTS working_memory (
    id INTEGER PRIMARY KEY,
    project_path TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    expires_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(project_path, key)
);

CREATE TABLE IF NOT EXISTS session_handoffs (
    id INTEGER PRIMARY KEY,
    project_path TEXT NOT NULL,
    summary TEXT NOT NULL,
    next_steps_json TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_handoffs_path ON session_handoffs(project_path, created_at DESC);

-- =======================================
-- INDEXING STATE
-- =======================================
CREATE TABLE IF NOT EXISTS index_state (
    project_path TEXT PRIMARY KEY,
    last_indexed_ms INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_embeddings (
    id INTEGER PRIMARY KEY,
    target TEXT NOT NULL,
    base_rowid INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at INTEGER NOT NULL,
    UNIQUE(target, base_rowid)
);
CREATE INDEX IF NOT EXISTS idx_pending_embeddings_status ON pending_embeddings(status);

-- =======================================
-- VECTOR INDEX STAMPS
-- =======================================
-- The vec0 tables themselves are created on demand once the provider's
-- (model_name, dimensions) stamp is known; see ensure_vector_index().
CREATE TABLE IF NOT EXISTS vector_index_meta (
    index_name TEXT PRIMARY KEY,
    model_name TEXT NOT NULL,
    dimensions INTEGER NOT NULL
);

-- =======================================
-- FULL-TEXT SEARCH (FTS5)
-- =======================================
-- Contentless shadow tables sharing the base table rowid. Contentless
-- tables store no column values, so all row maintenance goes by rowid.
CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    content,
    content='',
    contentless_delete=1,
    tokenize='porter unicode61 remove_diacritics 1'
);

CREATE VIRTUAL TABLE IF NOT EXISTS decisions_fts USING fts5(
    decision_text,
    rationale,
    content='',
    contentless_delete=1,
    tokenize='porter unicode61 remove_diacritics 1'
);

CREATE VIRTUAL TABLE IF NOT EXISTS mistakes_fts USING fts5(
    mistake_text,
    correction_text,
    content='',
    contentless_delete=1,
    tokenize='porter unicode61 remove_diacritics 1'
);
"#,
    },
    Migration {
        version: 2,
        description: "working memory full-text search",
        up: r#"
CREATE VIRTUAL TABLE IF NOT EXISTS working_memory_fts USING fts5(
    key,
    value,
    content='',
    contentless_delete=1,
    tokenize='porter unicode61 remove_diacritics 1'
);

INSERT INTO working_memory_fts(rowid, key, value)
SELECT id, key, value FROM working_memory;
"#,
    },
];

/// Checksum recorded alongside each applied migration.
pub fn migration_checksum(version: i64, description: &str, up: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{version}:{description}:{up}"));
    format!("{:x}", hasher.finalize())
}

/// Split an `up` script into statements: `;` separates statements and lines
/// beginning with `--` are comments.
fn split_statements(up: &str) -> Vec<String> {
    let without_comments: String = up
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");

    without_comments
        .split(';')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Run all pending migrations, verifying checksums of already-applied ones.
///
/// Each migration executes inside its own transaction; on failure the
/// database stays at the prior version and the error is surfaced.
pub fn run_all_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT NOT NULL,
            checksum TEXT NOT NULL
        );",
    )?;

    let current: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    for migration in MIGRATIONS {
        let expected = migration_checksum(migration.version, migration.description, migration.up);

        if migration.version <= current {
            let stored: Option<String> = conn
                .query_row(
                    "SELECT checksum FROM schema_version WHERE version = ?",
                    [migration.version],
                    |row| row.get(0),
                )
                .ok();
            if let Some(stored) = stored {
                if stored != expected {
                    bail!(
                        "migration {} checksum mismatch (stored {}, expected {}); \
                         refusing to start",
                        migration.version,
                        stored,
                        expected
                    );
                }
            }
            continue;
        }

        tracing::info!(
            version = migration.version,
            description = migration.description,
            "Applying migration"
        );

        conn.execute_batch("BEGIN")?;
        let apply = || -> Result<()> {
            for statement in split_statements(migration.up) {
                conn.execute_batch(&statement)
                    .with_context(|| format!("migration {} failed", migration.version))?;
            }
            conn.execute(
                "INSERT INTO schema_version (version, applied_at, description, checksum)
                 VALUES (?1, ?2, ?3, ?4)",
                params![migration.version, now_ms(), migration.description, expected],
            )?;
            Ok(())
        };
        match apply() {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e);
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// FTS shadow-table maintenance
// ---------------------------------------------------------------------------

/// Rebuild messages_fts rows for the given conversations.
///
/// Deletes go by rowid: contentless tables cannot match on column values.
pub fn rebuild_messages_fts_for_conversations(
    conn: &Connection,
    conversation_ids: &[i64],
) -> rusqlite::Result<()> {
    for chunk in conversation_ids.chunks(256) {
        let placeholders = vec!["?"; chunk.len()].join(",");
        let args = rusqlite::params_from_iter(chunk.iter());
        conn.execute(
            &format!(
                "DELETE FROM messages_fts WHERE rowid IN
                   (SELECT id FROM messages WHERE conversation_id IN ({placeholders}))"
            ),
            args.clone(),
        )?;
        conn.execute(
            &format!(
                "INSERT INTO messages_fts(rowid, content)
                 SELECT id, content FROM messages
                 WHERE conversation_id IN ({placeholders})"
            ),
            args,
        )?;
    }
    Ok(())
}

/// Rebuild decisions_fts and mistakes_fts rows for the given conversations.
pub fn rebuild_derived_fts_for_conversations(
    conn: &Connection,
    conversation_ids: &[i64],
) -> rusqlite::Result<()> {
    for chunk in conversation_ids.chunks(256) {
        let placeholders = vec!["?"; chunk.len()].join(",");
        let args = rusqlite::params_from_iter(chunk.iter());
        conn.execute(
            &format!(
                "DELETE FROM decisions_fts WHERE rowid IN
                   (SELECT id FROM decisions WHERE conversation_id IN ({placeholders}))"
            ),
            args.clone(),
        )?;
        conn.execute(
            &format!(
                "INSERT INTO decisions_fts(rowid, decision_text, rationale)
                 SELECT id, decision_text, COALESCE(rationale, '')
                 FROM decisions WHERE conversation_id IN ({placeholders})"
            ),
            args.clone(),
        )?;
        conn.execute(
            &format!(
                "DELETE FROM mistakes_fts WHERE rowid IN
                   (SELECT id FROM mistakes WHERE conversation_id IN ({placeholders}))"
            ),
            args.clone(),
        )?;
        conn.execute(
            &format!(
                "INSERT INTO mistakes_fts(rowid, mistake_text, correction_text)
                 SELECT id, mistake_text, correction_text
                 FROM mistakes WHERE conversation_id IN ({placeholders})"
            ),
            args,
        )?;
    }
    Ok(())
}

/// Rebuild every FTS shadow table from its base table.
pub fn rebuild_all_fts(conn: &Connection) -> rusqlite::Result<()> {
    tracing::info!("Rebuilding all FTS shadow tables");
    conn.execute("DELETE FROM messages_fts", [])?;
    conn.execute(
        "INSERT INTO messages_fts(rowid, content) SELECT id, content FROM messages",
        [],
    )?;
    conn.execute("DELETE FROM decisions_fts", [])?;
    conn.execute(
        "INSERT INTO decisions_fts(rowid, decision_text, rationale)
         SELECT id, decision_text, COALESCE(rationale, '') FROM decisions",
        [],
    )?;
    conn.execute("DELETE FROM mistakes_fts", [])?;
    conn.execute(
        "INSERT INTO mistakes_fts(rowid, mistake_text, correction_text)
         SELECT id, mistake_text, correction_text FROM mistakes",
        [],
    )?;
    conn.execute("DELETE FROM working_memory_fts", [])?;
    conn.execute(
        "INSERT INTO working_memory_fts(rowid, key, value)
         SELECT id, key, value FROM working_memory",
        [],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Vector index lifecycle
// ---------------------------------------------------------------------------

/// Logical vector index targets.
pub const VEC_MESSAGES: &str = "vec_messages";
pub const VEC_DECISIONS: &str = "vec_decisions";

/// Ensure a vec0 table exists with the stamped `(model_name, dimensions)`.
///
/// A stamp mismatch drops and recreates the table (partial mixing of models
/// or dimensions within one index is forbidden) and queues every base row
/// for re-embedding. Returns true when a rebuild happened.
pub fn ensure_vector_index(
    conn: &Connection,
    index_name: &str,
    model_name: &str,
    dimensions: usize,
) -> Result<bool> {
    if !matches!(index_name, VEC_MESSAGES | VEC_DECISIONS) {
        bail!("unknown vector index: {index_name}");
    }

    let stamp: Option<(String, i64)> = conn
        .query_row(
            "SELECT model_name, dimensions FROM vector_index_meta WHERE index_name = ?",
            [index_name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .ok();

    let table_exists: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?",
            [index_name],
            |_| Ok(true),
        )
        .unwrap_or(false);

    let up_to_date = matches!(
        &stamp,
        Some((model, dims)) if model == model_name && *dims == dimensions as i64
    );

    if up_to_date && table_exists {
        return Ok(false);
    }

    let rebuilt = table_exists;
    if table_exists {
        tracing::info!(
            index = index_name,
            old = ?stamp,
            new_model = model_name,
            new_dimensions = dimensions,
            "Vector index stamp changed, rebuilding"
        );
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {index_name}"))?;
    }

    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE {index_name} USING vec0(
            embedding float[{dimensions}],
            +base_rowid INTEGER,
            +chunk_index INTEGER,
            +project_id INTEGER
        );"
    ))?;
    conn.execute(
        "INSERT INTO vector_index_meta (index_name, model_name, dimensions)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(index_name) DO UPDATE SET
            model_name = excluded.model_name,
            dimensions = excluded.dimensions",
        params![index_name, model_name, dimensions as i64],
    )?;

    // After a rebuild, queue every base row for re-embedding so no stale
    // vectors survive and nothing is silently left unindexed.
    if rebuilt {
        let (base_table, target) = match index_name {
            VEC_MESSAGES => ("messages", "messages"),
            _ => ("decisions", "decisions"),
        };
        conn.execute(
            &format!(
                "INSERT INTO pending_embeddings (target, base_rowid, status, created_at)
                 SELECT '{target}', id, 'pending', ?1 FROM {base_table} WHERE true
                 ON CONFLICT(target, base_rowid) DO UPDATE SET status = 'pending'"
            ),
            [now_ms()],
        )?;
    }

    Ok(rebuilt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ensure_sqlite_vec_registered;

    fn test_conn() -> Connection {
        ensure_sqlite_vec_registered();
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("PRAGMA foreign_keys=ON;").expect("fk");
        run_all_migrations(&conn).expect("migrations");
        conn
    }

    #[test]
    fn test_migrations_apply_from_scratch() {
        let conn = test_conn();
        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .expect("version");
        assert_eq!(version, MIGRATIONS.last().expect("nonempty").version);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_conn();
        run_all_migrations(&conn).expect("second run");
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))
            .expect("count");
        assert_eq!(rows, MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_checksum_mismatch_is_fatal() {
        let conn = test_conn();
        conn.execute("UPDATE schema_version SET checksum = 'tampered' WHERE version = 1", [])
            .expect("tamper");
        let err = run_all_migrations(&conn).expect_err("should refuse");
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_checksum_format() {
        let a = migration_checksum(1, "x", "CREATE TABLE t (id INTEGER);");
        let b = migration_checksum(1, "x", "CREATE TABLE t (id INTEGER);");
        let c = migration_checksum(2, "x", "CREATE TABLE t (id INTEGER);");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_split_statements_strips_comments() {
        let stmts = split_statements(
            "-- leading comment\nCREATE TABLE a (id INTEGER);\n-- mid\nCREATE TABLE b (id INTEGER);\n",
        );
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE a"));
    }

    #[test]
    fn test_vector_index_create_and_stamp() {
        let conn = test_conn();
        let rebuilt = ensure_vector_index(&conn, VEC_MESSAGES, "hash-v1", 256).expect("create");
        assert!(!rebuilt, "first creation is not a rebuild");

        let (model, dims): (String, i64) = conn
            .query_row(
                "SELECT model_name, dimensions FROM vector_index_meta WHERE index_name = ?",
                [VEC_MESSAGES],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("stamp");
        assert_eq!(model, "hash-v1");
        assert_eq!(dims, 256);
    }

    #[test]
    fn test_vector_index_dimension_change_rebuilds() {
        let conn = test_conn();
        ensure_vector_index(&conn, VEC_MESSAGES, "hash-v1", 256).expect("create");

        // Insert a vector at the old dimensions.
        let vector = vec![0.5f32; 256];
        let bytes: Vec<u8> = vector.iter().flat_map(|f| f.to_le_bytes()).collect();
        conn.execute(
            "INSERT INTO vec_messages(embedding, base_rowid, chunk_index, project_id)
             VALUES (?1, 1, 0, 1)",
            params![bytes],
        )
        .expect("insert vector");

        let rebuilt = ensure_vector_index(&conn, VEC_MESSAGES, "hash-v1", 512).expect("rebuild");
        assert!(rebuilt);

        // No stale vectors remain after the rebuild.
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM vec_messages", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 0);
    }

    #[test]
    fn test_fts_rebuild_matches_base_rows() {
        let conn = test_conn();
        let now = now_ms();
        conn.execute(
            "INSERT INTO conversations (project_path, source_type, external_id,
             first_message_at, last_message_at, message_count, created_at, updated_at)
             VALUES ('/tmp/p', 'claude-code', 'S1', 0, 0, 0, ?1, ?1)",
            [now],
        )
        .expect("conversation");
        let conv_id = conn.last_insert_rowid();
        for i in 0..3 {
            conn.execute(
                "INSERT INTO messages (conversation_id, external_id, message_type, role,
                 content, timestamp) VALUES (?1, ?2, 'user', 'user', ?3, ?4)",
                params![conv_id, format!("m{i}"), format!("hello number {i}"), i],
            )
            .expect("message");
        }

        rebuild_messages_fts_for_conversations(&conn, &[conv_id]).expect("rebuild");
        let fts_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages_fts", [], |r| r.get(0))
            .expect("count");
        assert_eq!(fts_count, 3);

        // Rebuild again: still exactly one FTS row per message.
        rebuild_messages_fts_for_conversations(&conn, &[conv_id]).expect("rebuild 2");
        let fts_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages_fts", [], |r| r.get(0))
            .expect("count");
        assert_eq!(fts_count, 3);
    }
}
