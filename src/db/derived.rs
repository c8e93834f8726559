// src/db/derived.rs
// Stores for extracted records: decisions, mistakes, requirements,
// methodologies, file edits, and git commits.

use super::schema;
use super::types::*;
use super::Database;
use crate::util::{now_ms, sanitize_for_like};
use anyhow::Result;
use rusqlite::{Connection, params};
use std::collections::HashSet;

fn to_json(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

fn from_json(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// UPSERT a batch of decisions and refresh the decisions FTS rows.
pub fn store_decisions_sync(conn: &Connection, batch: &[Decision]) -> Result<usize> {
    let now = now_ms();
    let mut touched: HashSet<i64> = HashSet::new();
    let mut stmt = conn.prepare_cached(
        "INSERT INTO decisions (
            conversation_id, message_id, decision_text, rationale,
            alternatives_json, rejected_reasons_json,
            related_files_json, related_commits_json, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
         ON CONFLICT(conversation_id, message_id, decision_text) DO UPDATE SET
            rationale = excluded.rationale,
            alternatives_json = excluded.alternatives_json,
            rejected_reasons_json = excluded.rejected_reasons_json,
            related_files_json = excluded.related_files_json,
            related_commits_json = excluded.related_commits_json,
            updated_at = excluded.updated_at",
    )?;

    for decision in batch {
        stmt.execute(params![
            decision.conversation_id,
            decision.message_id,
            decision.decision_text,
            decision.rationale,
            to_json(&decision.alternatives_considered),
            to_json(&decision.rejected_reasons),
            to_json(&decision.related_files),
            to_json(&decision.related_commits),
            now,
        ])?;
        touched.insert(decision.conversation_id);
    }

    let touched: Vec<i64> = touched.into_iter().collect();
    schema::rebuild_derived_fts_for_conversations(conn, &touched)?;
    Ok(batch.len())
}

/// UPSERT a batch of mistakes and refresh the mistakes FTS rows.
pub fn store_mistakes_sync(conn: &Connection, batch: &[Mistake]) -> Result<usize> {
    let now = now_ms();
    let mut touched: HashSet<i64> = HashSet::new();
    let mut stmt = conn.prepare_cached(
        "INSERT INTO mistakes (
            conversation_id, message_id, mistake_text, correction_text,
            assistant_action, related_files_json, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT(conversation_id, message_id, mistake_text) DO UPDATE SET
            correction_text = excluded.correction_text,
            assistant_action = excluded.assistant_action,
            related_files_json = excluded.related_files_json,
            updated_at = excluded.updated_at",
    )?;

    for mistake in batch {
        stmt.execute(params![
            mistake.conversation_id,
            mistake.message_id,
            mistake.mistake_text,
            mistake.correction_text,
            mistake.assistant_action,
            to_json(&mistake.related_files),
            now,
        ])?;
        touched.insert(mistake.conversation_id);
    }

    let touched: Vec<i64> = touched.into_iter().collect();
    schema::rebuild_derived_fts_for_conversations(conn, &touched)?;
    Ok(batch.len())
}

/// UPSERT a batch of requirements.
pub fn store_requirements_sync(conn: &Connection, batch: &[Requirement]) -> Result<usize> {
    let now = now_ms();
    let mut stmt = conn.prepare_cached(
        "INSERT INTO requirements (
            conversation_id, message_id, requirement_text, kind,
            related_files_json, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(conversation_id, message_id, requirement_text) DO UPDATE SET
            kind = excluded.kind,
            related_files_json = excluded.related_files_json,
            updated_at = excluded.updated_at",
    )?;
    for requirement in batch {
        stmt.execute(params![
            requirement.conversation_id,
            requirement.message_id,
            requirement.requirement_text,
            requirement.kind,
            to_json(&requirement.related_files),
            now,
        ])?;
    }
    Ok(batch.len())
}

/// UPSERT a batch of methodologies.
pub fn store_methodologies_sync(conn: &Connection, batch: &[Methodology]) -> Result<usize> {
    let now = now_ms();
    let mut stmt = conn.prepare_cached(
        "INSERT INTO methodologies (
            conversation_id, start_message_id, end_message_id,
            problem, approach, steps_json, outcome, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(conversation_id, start_message_id, end_message_id) DO UPDATE SET
            problem = excluded.problem,
            approach = excluded.approach,
            steps_json = excluded.steps_json,
            outcome = excluded.outcome",
    )?;
    for methodology in batch {
        stmt.execute(params![
            methodology.conversation_id,
            methodology.start_message_id,
            methodology.end_message_id,
            methodology.problem,
            methodology.approach,
            to_json(&methodology.steps),
            methodology.outcome,
            now,
        ])?;
    }
    Ok(batch.len())
}

/// UPSERT file edit snapshots keyed by conversation id.
pub fn store_file_edits_sync(
    conn: &Connection,
    batch: &[NewFileEdit],
    conversation_id_map: &std::collections::HashMap<String, i64>,
) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO file_edits (conversation_id, file_path, edit_type, snapshot_timestamp)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(conversation_id, file_path, edit_type, snapshot_timestamp) DO NOTHING",
    )?;
    let mut stored = 0;
    for edit in batch {
        let Some(&conversation_id) = conversation_id_map.get(&edit.conversation_external_id) else {
            tracing::debug!(file = %edit.file_path, "Dropping file edit with unmapped conversation");
            continue;
        };
        stmt.execute(params![
            conversation_id,
            edit.file_path,
            edit.edit_type,
            edit.snapshot_timestamp,
        ])?;
        stored += 1;
    }
    Ok(stored)
}

/// UPSERT git commits, unique per (project_id, hash).
pub fn store_git_commits_sync(conn: &Connection, batch: &[GitCommit]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO git_commits (
            project_id, conversation_id, hash, message, author,
            timestamp, branch, files_changed_json
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(project_id, hash) DO UPDATE SET
            conversation_id = COALESCE(excluded.conversation_id, git_commits.conversation_id),
            message = excluded.message,
            author = excluded.author,
            branch = excluded.branch,
            files_changed_json = excluded.files_changed_json",
    )?;
    for commit in batch {
        stmt.execute(params![
            commit.project_id,
            commit.conversation_id,
            commit.hash,
            commit.message,
            commit.author,
            commit.timestamp,
            commit.branch,
            to_json(&commit.files_changed),
        ])?;
    }
    Ok(batch.len())
}

fn decision_from_row(row: &rusqlite::Row) -> rusqlite::Result<Decision> {
    Ok(Decision {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        message_id: row.get(2)?,
        decision_text: row.get(3)?,
        rationale: row.get(4)?,
        alternatives_considered: from_json(&row.get::<_, String>(5)?),
        rejected_reasons: from_json(&row.get::<_, String>(6)?),
        related_files: from_json(&row.get::<_, String>(7)?),
        related_commits: from_json(&row.get::<_, String>(8)?),
    })
}

const DECISION_COLUMNS: &str = "id, conversation_id, message_id, decision_text, rationale, \
     alternatives_json, rejected_reasons_json, related_files_json, related_commits_json";

/// Decisions whose related_files JSON mentions the given path.
///
/// The path is escaped so LIKE wildcards in the input match only literally.
pub fn get_decisions_for_file_sync(
    conn: &Connection,
    file_path: &str,
    limit: usize,
) -> rusqlite::Result<Vec<Decision>> {
    let pattern = format!("%{}%", sanitize_for_like(file_path));
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {DECISION_COLUMNS} FROM decisions
         WHERE related_files_json LIKE ?1 ESCAPE '\\'
         ORDER BY updated_at DESC
         LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![pattern, limit as i64], decision_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Edit history of one file across conversations, newest snapshot first.
pub fn get_file_history_sync(
    conn: &Connection,
    file_path: &str,
    limit: usize,
) -> rusqlite::Result<Vec<(i64, String, i64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT conversation_id, edit_type, snapshot_timestamp
         FROM file_edits WHERE file_path = ?1
         ORDER BY snapshot_timestamp DESC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![file_path, limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

impl Database {
    /// UPSERT extracted decisions.
    pub async fn store_decisions(&self, batch: Vec<Decision>) -> Result<usize> {
        self.write(move |conn| store_decisions_sync(conn, &batch)).await
    }

    /// UPSERT extracted mistakes.
    pub async fn store_mistakes(&self, batch: Vec<Mistake>) -> Result<usize> {
        self.write(move |conn| store_mistakes_sync(conn, &batch)).await
    }

    /// UPSERT extracted requirements.
    pub async fn store_requirements(&self, batch: Vec<Requirement>) -> Result<usize> {
        self.write(move |conn| store_requirements_sync(conn, &batch)).await
    }

    /// UPSERT git commits.
    pub async fn store_git_commits(&self, batch: Vec<GitCommit>) -> Result<usize> {
        self.write(move |conn| store_git_commits_sync(conn, &batch)).await
    }

    /// Decisions related to a file path.
    pub async fn get_decisions_for_file(&self, path: &str, limit: usize) -> Result<Vec<Decision>> {
        let path = path.to_string();
        self.interact(move |conn| Ok(get_decisions_for_file_sync(conn, &path, limit)?))
            .await
    }

    /// Edit history for one file.
    pub async fn get_file_history(
        &self,
        path: &str,
        limit: usize,
    ) -> Result<Vec<(i64, String, i64)>> {
        let path = path.to_string();
        self.interact(move |conn| Ok(get_file_history_sync(conn, &path, limit)?))
            .await
    }
}
