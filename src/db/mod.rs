// src/db/mod.rs
// Storage manager: async connection pool over rusqlite with sqlite-vec,
// schema migrations, and per-entity store operations.
//
// Access pattern follows the pool/interact split: `_sync` free functions
// take `&Connection` and run inside `interact()` closures on a blocking
// thread; `Database` methods are the async public surface. There is a
// single writer at any instant — every mutating operation serialises on
// `write_lock` — while WAL lets readers proceed in parallel.

pub mod conversations;
pub mod derived;
pub mod project;
pub mod schema;
pub mod types;
pub mod working_memory;

pub use types::*;

use crate::error::MnemoError;
use crate::util::{now_ms, path_to_string};
use anyhow::{Context, Result};
use deadpool_sqlite::{Config, Hook, Pool, Runtime};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use tokio::sync::Mutex;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Registers sqlite-vec extension globally (once per process).
/// Must be called before any SQLite connections are opened.
static SQLITE_VEC_INIT: Once = Once::new();

#[allow(clippy::missing_transmute_annotations)]
pub(crate) fn ensure_sqlite_vec_registered() {
    SQLITE_VEC_INIT.call_once(|| {
        // SAFETY: sqlite3_vec_init matches the signature sqlite3_auto_extension
        // expects; the pointer targets a statically-linked symbol that lives for
        // the whole process.
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite3_vec_init as *const (),
            )));
        }
        tracing::debug!("sqlite-vec extension registered globally");
    });
}

/// Check if a rusqlite error is SQLITE_BUSY or SQLITE_LOCKED.
fn is_rusqlite_contention(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi;
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ffi::ErrorCode::DatabaseBusy | ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

/// Check if an anyhow::Error chain contains a SQLite contention error.
fn is_sqlite_contention(err: &anyhow::Error) -> bool {
    if let Some(rusqlite_err) = err.downcast_ref::<rusqlite::Error>() {
        return is_rusqlite_contention(rusqlite_err);
    }
    if let Some(MnemoError::Storage(rusqlite_err)) = err.downcast_ref::<MnemoError>() {
        return is_rusqlite_contention(rusqlite_err);
    }
    false
}

/// Retry delays for SQLite contention backoff.
const RETRY_DELAYS: [std::time::Duration; 3] = [
    std::time::Duration::from_millis(100),
    std::time::Duration::from_millis(500),
    std::time::Duration::from_millis(2000),
];

/// Storage manager owning the pooled database handle.
///
/// Tests instantiate independent in-memory instances; there are no process
/// globals besides the sqlite-vec registration.
pub struct Database {
    pool: Pool,
    path: Option<PathBuf>,
    /// URI for in-memory databases (shared-cache state in tests).
    memory_uri: Option<String>,
    /// Serialises all writers; readers go straight to the pool.
    write_lock: Arc<Mutex<()>>,
    /// Project-path → project-id lookup cache, invalidated by clear_cache().
    project_cache: moka::sync::Cache<String, i64>,
}

impl Database {
    /// Open a pooled database at the given path, running migrations.
    pub async fn open(path: &Path, mmap_size: u64) -> Result<Self> {
        ensure_sqlite_vec_registered();
        ensure_parent_directory(path)?;

        let conn_str = path_to_string(path);
        let hook = make_file_post_create_hook(path.to_path_buf(), mmap_size);

        let cfg = Config::new(&conn_str);
        let pool = cfg
            .builder(Runtime::Tokio1)
            .context("Failed to create pool builder")?
            .max_size(8)
            .post_create(hook)
            .build()
            .context("Failed to build connection pool")?;

        let db = Self {
            pool,
            path: Some(path.to_path_buf()),
            memory_uri: None,
            write_lock: Arc::new(Mutex::new(())),
            project_cache: make_project_cache(),
        };

        if let Err(e) = db.backup_before_migration() {
            tracing::warn!("Pre-migration backup failed (continuing anyway): {}", e);
        }
        db.run_migrations().await?;
        Ok(db)
    }

    /// Open a pooled in-memory database.
    ///
    /// Uses a shared cache URI so all pool connections see the same state;
    /// without it every connection would get its own empty database.
    pub async fn open_in_memory() -> Result<Self> {
        ensure_sqlite_vec_registered();

        let uri = format!("file:memdb_{:?}?mode=memory&cache=shared", uuid::Uuid::new_v4());
        let cfg = Config::new(&uri);
        let pool = cfg
            .builder(Runtime::Tokio1)
            .context("Failed to create pool builder")?
            .max_size(8)
            .post_create(make_memory_post_create_hook())
            .build()
            .context("Failed to build connection pool")?;

        let db = Self {
            pool,
            path: None,
            memory_uri: Some(uri),
            write_lock: Arc::new(Mutex::new(())),
            project_cache: make_project_cache(),
        };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Get the database file path (None for in-memory).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Get the memory URI (for sharing state in tests).
    pub fn memory_uri(&self) -> Option<&str> {
        self.memory_uri.as_deref()
    }

    /// Run a closure with a pooled connection on a blocking thread.
    pub async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get connection from pool")?;
        conn.interact(move |conn| f(conn))
            .await
            .map_err(|e| anyhow::anyhow!("interact failed: {e}"))?
    }

    /// Like [`interact`](Self::interact) but holding the writer mutex, so
    /// only one mutating closure runs at a time.
    pub async fn write<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let _guard = self.write_lock.lock().await;
        self.interact(f).await
    }

    /// Writer variant with retry on SQLite contention (100ms/500ms/2s).
    /// Use for critical writes that must not be lost.
    pub async fn write_with_retry<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + Clone + 'static,
        R: Send + 'static,
    {
        let _guard = self.write_lock.lock().await;
        for delay in RETRY_DELAYS {
            let attempt = f.clone();
            match self.interact(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if is_sqlite_contention(&e) => {
                    tracing::warn!("SQLite contention, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        self.interact(f).await
    }

    /// Invalidate all in-process lookup caches.
    pub fn clear_cache(&self) {
        self.project_cache.invalidate_all();
    }

    pub(crate) fn project_cache(&self) -> &moka::sync::Cache<String, i64> {
        &self.project_cache
    }

    /// Per-table row counts.
    pub async fn get_stats(&self) -> Result<StoreStats> {
        self.interact(|conn| get_stats_sync(conn)).await
    }

    /// Record a completed index run for incremental reindexing.
    pub async fn record_index_run(&self, project_path: &str, indexed_ms: i64) -> Result<()> {
        let path = project_path.to_string();
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO index_state (project_path, last_indexed_ms, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(project_path) DO UPDATE SET
                    last_indexed_ms = excluded.last_indexed_ms,
                    updated_at = excluded.updated_at",
                rusqlite::params![path, indexed_ms, now_ms()],
            )?;
            Ok(())
        })
        .await
    }

    /// Timestamp of the last recorded index run, 0 when never indexed.
    pub async fn last_indexed_ms(&self, project_path: &str) -> Result<i64> {
        let path = project_path.to_string();
        self.interact(move |conn| {
            let ms = conn
                .query_row(
                    "SELECT last_indexed_ms FROM index_state WHERE project_path = ?",
                    [path],
                    |row| row.get(0),
                )
                .unwrap_or(0);
            Ok(ms)
        })
        .await
    }

    /// Create a backup of the database before running migrations.
    /// Uses SQLite's VACUUM INTO for an atomic, consistent backup.
    fn backup_before_migration(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let backup_path = path.with_extension("db.pre-migration");
        let conn = rusqlite::Connection::open(path).context("Failed to open DB for backup")?;
        let _ = std::fs::remove_file(&backup_path);
        conn.execute("VACUUM INTO ?1", [backup_path.to_string_lossy().as_ref()])
            .context("Failed to create pre-migration backup")?;
        tracing::info!("Created pre-migration backup: {}", backup_path.display());
        Ok(())
    }

    /// Create a timestamped copy of the database file (used before
    /// destructive operations). Returns the backup path.
    pub async fn backup_to_suffix(&self) -> Result<Option<PathBuf>> {
        let Some(path) = self.path.clone() else {
            return Ok(None);
        };
        let backup_path = path.with_extension(format!("db.bak.{}", now_ms()));
        let target = backup_path.to_string_lossy().to_string();
        self.interact(move |conn| {
            conn.execute("VACUUM INTO ?1", [target])?;
            Ok(())
        })
        .await?;
        #[cfg(unix)]
        if let Ok(metadata) = std::fs::metadata(&backup_path) {
            let mut perms = metadata.permissions();
            perms.set_mode(0o600);
            let _ = std::fs::set_permissions(&backup_path, perms);
        }
        tracing::info!("Database backup created: {}", backup_path.display());
        Ok(Some(backup_path))
    }

    async fn run_migrations(&self) -> Result<()> {
        self.interact(|conn| {
            schema::run_all_migrations(conn)?;
            if let Err(e) = conn.execute_batch("PRAGMA optimize") {
                tracing::debug!("PRAGMA optimize skipped: {}", e);
            }
            Ok(())
        })
        .await
    }

    /// Rebuild every FTS shadow table from its base table.
    pub async fn rebuild_fts(&self) -> Result<()> {
        self.write(|conn| {
            schema::rebuild_all_fts(conn)?;
            Ok(())
        })
        .await
    }
}

/// Per-table row counts - sync version for interact().
pub fn get_stats_sync(conn: &Connection) -> Result<StoreStats> {
    let count = |table: &str| -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap_or(0)
    };
    Ok(StoreStats {
        projects: count("projects"),
        conversations: count("conversations"),
        messages: count("messages"),
        tool_uses: count("tool_uses"),
        tool_results: count("tool_results"),
        thinking_blocks: count("thinking_blocks"),
        decisions: count("decisions"),
        mistakes: count("mistakes"),
        requirements: count("requirements"),
        methodologies: count("methodologies"),
        file_edits: count("file_edits"),
        git_commits: count("git_commits"),
        working_memory: count("working_memory"),
        message_vectors: count("vec_messages"),
        decision_vectors: count("vec_decisions"),
    })
}

fn make_project_cache() -> moka::sync::Cache<String, i64> {
    moka::sync::Cache::builder().max_capacity(1024).build()
}

/// Ensure parent directory exists with owner-only permissions (0o700 on Unix).
fn ensure_parent_directory(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            let mut perms = std::fs::metadata(parent)?.permissions();
            perms.set_mode(0o700);
            std::fs::set_permissions(parent, perms)?;
        }
    }
    Ok(())
}

/// Create a post_create hook for file-based databases.
///
/// Sets up PRAGMAs via `setup_connection` and restricts file permissions
/// to 0o600.
fn make_file_post_create_hook(path: PathBuf, mmap_size: u64) -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        let path_for_perms = path.clone();
        Box::pin(async move {
            conn.interact(move |conn| {
                setup_connection(conn, mmap_size)?;

                #[cfg(unix)]
                if let Ok(metadata) = std::fs::metadata(&path_for_perms) {
                    let mut perms = metadata.permissions();
                    perms.set_mode(0o600);
                    if let Err(e) = std::fs::set_permissions(&path_for_perms, perms) {
                        tracing::warn!("Failed to set database file permissions to 0600: {}", e);
                    }
                }

                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into()))?
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("connection setup failed: {e}").into())
            })
        })
    })
}

/// Create a post_create hook for in-memory databases.
/// WAL mode is not applicable to in-memory DBs.
fn make_memory_post_create_hook() -> Hook {
    Hook::async_fn(|conn, _metrics| {
        Box::pin(async move {
            conn.interact(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys=ON; \
                     PRAGMA busy_timeout=5000;",
                )?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into()))?
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("connection setup failed: {e}").into())
            })
        })
    })
}

/// Configure a connection after it's created.
fn setup_connection(conn: &Connection, mmap_size: u64) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode=WAL; \
         PRAGMA foreign_keys=ON; \
         PRAGMA busy_timeout=5000; \
         PRAGMA synchronous=NORMAL; \
         PRAGMA cache_size=-65536; \
         PRAGMA mmap_size={mmap_size}; \
         PRAGMA journal_size_limit=32768;",
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_runs_migrations() {
        let db = Database::open_in_memory().await.expect("open");
        let stats = db.get_stats().await.expect("stats");
        assert_eq!(stats.conversations, 0);
        assert_eq!(stats.messages, 0);
    }

    #[tokio::test]
    async fn test_shared_cache_across_pool_connections() {
        let db = Database::open_in_memory().await.expect("open");
        db.write(|conn| {
            conn.execute(
                "INSERT INTO projects (canonical_path, display_path, created_at, updated_at)
                 VALUES ('/test/path', '/test/path', 1, 1)",
                [],
            )?;
            Ok(())
        })
        .await
        .expect("insert");

        let path: String = db
            .interact(|conn| {
                Ok(conn.query_row(
                    "SELECT canonical_path FROM projects WHERE id = 1",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .expect("query");
        assert_eq!(path, "/test/path");
    }

    #[tokio::test]
    async fn test_concurrent_writes_serialised() {
        let db = Arc::new(Database::open_in_memory().await.expect("open"));

        let mut handles = Vec::new();
        for i in 0..10 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                db.write(move |conn| {
                    conn.execute(
                        "INSERT INTO projects (canonical_path, display_path, created_at, updated_at)
                         VALUES (?1, ?1, 1, 1)",
                        [format!("/test/{i}")],
                    )?;
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("write");
        }

        let stats = db.get_stats().await.expect("stats");
        assert_eq!(stats.projects, 10);
    }

    #[tokio::test]
    async fn test_index_state_round_trip() {
        let db = Database::open_in_memory().await.expect("open");
        assert_eq!(db.last_indexed_ms("/p").await.expect("read"), 0);
        db.record_index_run("/p", 1234).await.expect("record");
        assert_eq!(db.last_indexed_ms("/p").await.expect("read"), 1234);
        db.record_index_run("/p", 5678).await.expect("record");
        assert_eq!(db.last_indexed_ms("/p").await.expect("read"), 5678);
    }

    #[tokio::test]
    async fn test_backup_to_suffix_in_memory_is_noop() {
        let db = Database::open_in_memory().await.expect("open");
        assert!(db.backup_to_suffix().await.expect("backup").is_none());
    }

    #[tokio::test]
    async fn test_backup_to_suffix_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("mnemo.db");
        let db = Database::open(&db_path, 0).await.expect("open");
        let backup = db.backup_to_suffix().await.expect("backup").expect("path");
        assert!(backup.exists());

        let conn = rusqlite::Connection::open(&backup).expect("backup is valid sqlite");
        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .expect("schema_version present");
        assert!(version >= 1);
    }
}
