// src/relocate/mod.rs
// Project-folder migration: when a user renames a working directory, the
// on-disk transcript folder name changes with it. This service finds the
// old folder, copies its transcripts to the new name, and repoints the
// stored project in one transaction. The source folder is never deleted.

use crate::db::Database;
use crate::db::project::{repoint_project_sync, resolve_project_id_sync};
use crate::error::{MnemoError, Result};
use crate::util::{folder_name_similarity, folder_name_to_path, now_ms, path_to_folder_name, sanitize_project_path};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Candidates below this similarity are not worth surfacing.
const SIMILARITY_THRESHOLD: f64 = 0.6;

/// Per-candidate statistics shown to the user.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateStats {
    pub conversations: i64,
    pub messages: i64,
    pub files: usize,
    pub last_activity: Option<i64>,
}

/// A possible old transcript folder for the renamed project.
#[derive(Debug, Clone, Serialize)]
pub struct FolderCandidate {
    pub folder_name: String,
    pub stored_project_path: String,
    pub score: f64,
    pub stats: CandidateStats,
}

/// Result of a migration validity check.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationValidation {
    pub valid: bool,
    pub reason: Option<String>,
}

/// What a migration did (or would do, for dry runs).
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub dry_run: bool,
    pub files_copied: usize,
    pub conversations_updated: usize,
    pub backup_path: Option<PathBuf>,
}

/// Project-folder migration service.
pub struct FolderMigration {
    db: Arc<Database>,
    projects_root: PathBuf,
}

impl FolderMigration {
    pub fn new(db: Arc<Database>, projects_root: PathBuf) -> Self {
        Self { db, projects_root }
    }

    /// Rank transcript folders under the projects root by how plausibly
    /// they encode `current_path`'s previous name.
    pub async fn discover_old_folders(&self, current_path: &str) -> Result<Vec<FolderCandidate>> {
        let current = sanitize_project_path(current_path)?;
        if !self.projects_root.exists() {
            return Err(MnemoError::NotFound(format!(
                "projects root not found: {}",
                self.projects_root.display()
            )));
        }

        // The folder the current path would use is not an "old" candidate.
        let current_folder = path_to_folder_name(&current);

        let mut candidates = Vec::new();
        for entry in std::fs::read_dir(&self.projects_root)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(folder_name) = entry.file_name().to_str().map(|s| s.to_string()) else {
                continue;
            };
            if folder_name == current_folder {
                continue;
            }

            let stored_project_path = folder_name_to_path(&folder_name);
            let score = folder_name_similarity(&folder_name, &current);
            if score < SIMILARITY_THRESHOLD {
                continue;
            }

            let files = count_jsonl_files(&entry.path());
            let path_for_stats = stored_project_path.clone();
            let (conversations, messages, last_activity) = self
                .db
                .interact(move |conn| {
                    let (convs, msgs, last): (i64, i64, Option<i64>) = conn.query_row(
                        "SELECT COUNT(*),
                                COALESCE(SUM(message_count), 0),
                                MAX(last_message_at)
                         FROM conversations WHERE project_path = ?1",
                        [&path_for_stats],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )?;
                    Ok((convs, msgs, last))
                })
                .await
                .map_err(MnemoError::Other)?;

            candidates.push(FolderCandidate {
                folder_name,
                stored_project_path,
                score,
                stats: CandidateStats {
                    conversations,
                    messages,
                    files,
                    last_activity,
                },
            });
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.folder_name.cmp(&b.folder_name))
        });
        Ok(candidates)
    }

    /// Check migration preconditions without touching anything.
    pub fn validate_migration(&self, source_folder: &Path, target_folder: &Path) -> MigrationValidation {
        if !source_folder.exists() {
            return MigrationValidation {
                valid: false,
                reason: Some(format!("source folder does not exist: {}", source_folder.display())),
            };
        }
        if source_folder == target_folder {
            return MigrationValidation {
                valid: false,
                reason: Some("source and target are the same folder".to_string()),
            };
        }
        if target_folder.exists() && count_jsonl_files(target_folder) > 0 {
            return MigrationValidation {
                valid: false,
                reason: Some(format!(
                    "target folder already contains transcripts: {}",
                    target_folder.display()
                )),
            };
        }
        MigrationValidation {
            valid: true,
            reason: None,
        }
    }

    /// Copy transcripts from `source_folder` to `target_folder` and repoint
    /// the stored project from `old_path` to `new_path`.
    ///
    /// Order: validate → (dry-run report) → database backup → create target
    /// → byte-identical copies → one transaction updating the project row
    /// and its conversations. The source folder is preserved.
    pub async fn execute_migration(
        &self,
        source_folder: &Path,
        target_folder: &Path,
        old_path: &str,
        new_path: &str,
        dry_run: bool,
    ) -> Result<MigrationReport> {
        let validation = self.validate_migration(source_folder, target_folder);
        if !validation.valid {
            return Err(MnemoError::Conflict(
                validation.reason.unwrap_or_else(|| "invalid migration".to_string()),
            ));
        }
        let old_path = sanitize_project_path(old_path)?;
        let new_path = sanitize_project_path(new_path)?;

        let jsonl_files = list_jsonl_files(source_folder)?;
        let old_for_count = old_path.clone();
        let affected: i64 = self
            .db
            .interact(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM conversations WHERE project_path = ?1",
                    [&old_for_count],
                    |row| row.get(0),
                )?)
            })
            .await
            .map_err(MnemoError::Other)?;

        if dry_run {
            return Ok(MigrationReport {
                dry_run: true,
                files_copied: jsonl_files.len(),
                conversations_updated: affected as usize,
                backup_path: None,
            });
        }

        let backup_path = self.db.backup_to_suffix().await.map_err(MnemoError::Other)?;

        std::fs::create_dir_all(target_folder)?;
        for file in &jsonl_files {
            let Some(name) = file.file_name() else {
                continue;
            };
            let target = target_folder.join(name);
            std::fs::copy(file, &target)?;
            // Transcripts must arrive byte-identical.
            let source_bytes = std::fs::read(file)?;
            let target_bytes = std::fs::read(&target)?;
            if source_bytes != target_bytes {
                return Err(MnemoError::Io(std::io::Error::other(format!(
                    "copy verification failed for {}",
                    target.display()
                ))));
            }
        }

        let (old_for_tx, new_for_tx) = (old_path.clone(), new_path.clone());
        let updated = self
            .db
            .write(move |conn| {
                conn.execute_batch("BEGIN")?;
                let run = || -> anyhow::Result<usize> {
                    let project_id = resolve_project_id_sync(conn, &old_for_tx)?;
                    repoint_project_sync(conn, project_id, &old_for_tx, &new_for_tx)?;
                    let updated = conn.execute(
                        "UPDATE conversations SET project_path = ?1, updated_at = ?2
                         WHERE project_id = ?3",
                        rusqlite::params![new_for_tx, now_ms(), project_id],
                    )?;
                    Ok(updated)
                };
                match run() {
                    Ok(updated) => {
                        conn.execute_batch("COMMIT")?;
                        Ok(updated)
                    }
                    Err(e) => {
                        let _ = conn.execute_batch("ROLLBACK");
                        Err(e)
                    }
                }
            })
            .await
            .map_err(MnemoError::Other)?;
        self.db.clear_cache();

        info!(
            source = %source_folder.display(),
            target = %target_folder.display(),
            files = jsonl_files.len(),
            conversations = updated,
            "Project folder migration complete"
        );
        Ok(MigrationReport {
            dry_run: false,
            files_copied: jsonl_files.len(),
            conversations_updated: updated,
            backup_path,
        })
    }
}

fn list_jsonl_files(folder: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(folder)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
        .collect();
    files.sort();
    Ok(files)
}

fn count_jsonl_files(folder: &Path) -> usize {
    list_jsonl_files(folder).map(|f| f.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::conversations::store_conversations_sync;
    use crate::db::types::{NewConversation, SourceType};

    async fn service_with_store() -> (FolderMigration, Arc<Database>, tempfile::TempDir) {
        let db = Arc::new(Database::open_in_memory().await.expect("open"));
        let root = tempfile::tempdir().expect("tempdir");
        let service = FolderMigration::new(db.clone(), root.path().to_path_buf());
        (service, db, root)
    }

    async fn seed_conversations(db: &Arc<Database>, path: &str, count: usize) {
        let path = path.to_string();
        db.write(move |conn| {
            let batch: Vec<NewConversation> = (0..count)
                .map(|i| NewConversation {
                    source_type: SourceType::ClaudeCode,
                    external_id: format!("{path}-S{i}"),
                    project_path: path.clone(),
                    first_message_at: 1000,
                    last_message_at: 2000 + i as i64,
                    message_count: 0,
                    git_branch: None,
                    client_version: None,
                    metadata_json: None,
                })
                .collect();
            store_conversations_sync(conn, &batch)?;
            Ok(())
        })
        .await
        .expect("seed");
    }

    #[tokio::test]
    async fn test_discover_ranks_similar_folders() {
        let (service, db, root) = service_with_store().await;
        std::fs::create_dir_all(root.path().join("-old-proj")).expect("mkdir");
        std::fs::write(root.path().join("-old-proj/a.jsonl"), "x").expect("file");
        std::fs::create_dir_all(root.path().join("-unrelated-thing-here")).expect("mkdir");
        seed_conversations(&db, "/old/proj", 2).await;

        let candidates = service.discover_old_folders("/old/proj2").await.expect("discover");
        assert!(!candidates.is_empty());
        assert_eq!(candidates[0].folder_name, "-old-proj");
        assert_eq!(candidates[0].stored_project_path, "/old/proj");
        assert!(candidates[0].score > 0.6);
        assert_eq!(candidates[0].stats.conversations, 2);
        assert_eq!(candidates[0].stats.files, 1);
        assert!(!candidates.iter().any(|c| c.folder_name == "-unrelated-thing-here"));
    }

    #[tokio::test]
    async fn test_validate_rejects_bad_preconditions() {
        let (service, _db, root) = service_with_store().await;
        let source = root.path().join("-src");
        let target = root.path().join("-dst");

        // Missing source.
        let v = service.validate_migration(&source, &target);
        assert!(!v.valid);

        // Same path.
        std::fs::create_dir_all(&source).expect("mkdir");
        let v = service.validate_migration(&source, &source);
        assert!(!v.valid);

        // Non-empty target.
        std::fs::create_dir_all(&target).expect("mkdir");
        std::fs::write(target.join("existing.jsonl"), "x").expect("file");
        let v = service.validate_migration(&source, &target);
        assert!(!v.valid);
        assert!(v.reason.expect("reason").contains("already contains"));
    }

    #[tokio::test]
    async fn test_execute_migration_full_flow() {
        let (service, db, root) = service_with_store().await;
        let source = root.path().join("-old-proj");
        let target = root.path().join("-new-proj");
        std::fs::create_dir_all(&source).expect("mkdir");
        std::fs::write(source.join("s1.jsonl"), "line one\n").expect("file");
        std::fs::write(source.join("s2.jsonl"), "line two\n").expect("file");
        seed_conversations(&db, "/old/proj", 2).await;

        let report = service
            .execute_migration(&source, &target, "/old/proj", "/new/proj", false)
            .await
            .expect("migrate");
        assert!(!report.dry_run);
        assert_eq!(report.files_copied, 2);
        assert_eq!(report.conversations_updated, 2);

        // Copies exist and originals are preserved byte-identical.
        assert!(target.join("s1.jsonl").exists());
        assert!(source.join("s1.jsonl").exists());
        assert_eq!(
            std::fs::read(source.join("s2.jsonl")).expect("src"),
            std::fs::read(target.join("s2.jsonl")).expect("dst"),
        );

        // The project row moved and every conversation follows it.
        let (canonical, conv_paths): (String, i64) = db
            .interact(|conn| {
                let canonical = conn.query_row(
                    "SELECT canonical_path FROM projects",
                    [],
                    |r| r.get(0),
                )?;
                let moved = conn.query_row(
                    "SELECT COUNT(*) FROM conversations WHERE project_path = '/new/proj'",
                    [],
                    |r| r.get(0),
                )?;
                Ok((canonical, moved))
            })
            .await
            .expect("read");
        assert_eq!(canonical, "/new/proj");
        assert_eq!(conv_paths, 2);

        // The old path still resolves to the same project via its alias.
        let id_old = db.resolve_project_id("/old/proj").await.expect("old");
        let id_new = db.resolve_project_id("/new/proj").await.expect("new");
        assert_eq!(id_old, id_new);
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let (service, db, root) = service_with_store().await;
        let source = root.path().join("-old-proj");
        let target = root.path().join("-new-proj");
        std::fs::create_dir_all(&source).expect("mkdir");
        std::fs::write(source.join("s1.jsonl"), "data\n").expect("file");
        seed_conversations(&db, "/old/proj", 1).await;

        let report = service
            .execute_migration(&source, &target, "/old/proj", "/new/proj", true)
            .await
            .expect("dry run");
        assert!(report.dry_run);
        assert_eq!(report.files_copied, 1);
        assert_eq!(report.conversations_updated, 1);

        assert!(!target.exists(), "dry run must not create the target");
        let unchanged: i64 = db
            .interact(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM conversations WHERE project_path = '/old/proj'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .expect("count");
        assert_eq!(unchanged, 1);
    }

    #[tokio::test]
    async fn test_conflict_raises_without_touching_folders() {
        let (service, _db, root) = service_with_store().await;
        let source = root.path().join("-src");
        let target = root.path().join("-dst");
        std::fs::create_dir_all(&source).expect("mkdir");
        std::fs::write(source.join("keep.jsonl"), "src\n").expect("file");
        std::fs::create_dir_all(&target).expect("mkdir");
        std::fs::write(target.join("busy.jsonl"), "dst\n").expect("file");

        let err = service
            .execute_migration(&source, &target, "/a", "/b", false)
            .await
            .expect_err("conflict");
        assert!(matches!(err, MnemoError::Conflict(_)));

        // Neither folder was modified.
        assert_eq!(std::fs::read(source.join("keep.jsonl")).expect("src"), b"src\n");
        assert_eq!(std::fs::read(target.join("busy.jsonl")).expect("dst"), b"dst\n");
        assert_eq!(std::fs::read_dir(&target).expect("dir").count(), 1);
    }
}
