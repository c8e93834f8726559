// src/reindex.rs
// Read-path-triggered auto-reindex with single-flight and cooldown.
//
// One in-flight future per project path is shared by every concurrent
// caller, so a burst of reads causes exactly one reparse. After a success,
// a wall-clock cooldown suppresses further work unless the staleness
// watcher has flagged the project in the meantime. Failures never poison
// the shared future; the next eligible caller retries.

use crate::error::{MnemoError, Result};
use crate::ingest::Ingestor;
use crate::util::CancelToken;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

type ReindexResult = std::result::Result<u64, String>;
type SharedReindex = Shared<BoxFuture<'static, ReindexResult>>;

/// The reindex work itself, injectable for tests.
pub type ReindexFn =
    Arc<dyn Fn(String, CancelToken) -> BoxFuture<'static, ReindexResult> + Send + Sync>;

/// What a maybe_auto_index call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoIndexOutcome {
    /// Cooldown active and nothing stale; no work happened.
    Skipped,
    /// This call ran or joined a reindex that completed successfully.
    Indexed,
}

/// Auto-reindex scheduler keyed by project path.
pub struct AutoIndexer {
    reindex: ReindexFn,
    cooldown: Duration,
    in_flight: Mutex<HashMap<String, SharedReindex>>,
    last_success: Mutex<HashMap<String, Instant>>,
    stale: Mutex<HashSet<String>>,
    cancel: CancelToken,
}

impl AutoIndexer {
    /// Production constructor driving incremental project ingests.
    pub fn new(ingestor: Arc<Ingestor>, cooldown: Duration) -> Self {
        let reindex: ReindexFn = Arc::new(move |path, cancel| {
            let ingestor = ingestor.clone();
            async move {
                ingestor
                    .ingest_project(&path, true, &cancel)
                    .await
                    .map(|summary| summary.messages as u64)
                    .map_err(|e| e.to_string())
            }
            .boxed()
        });
        Self::with_fn(reindex, cooldown)
    }

    /// Test constructor with injected work.
    pub fn with_fn(reindex: ReindexFn, cooldown: Duration) -> Self {
        Self {
            reindex,
            cooldown,
            in_flight: Mutex::new(HashMap::new()),
            last_success: Mutex::new(HashMap::new()),
            stale: Mutex::new(HashSet::new()),
            cancel: CancelToken::new(),
        }
    }

    /// Cancellation token propagated into every reindex run.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Flag a project as stale (bypasses the cooldown once).
    pub fn mark_stale(&self, project_path: &str) {
        self.stale
            .lock()
            .expect("stale lock")
            .insert(project_path.to_string());
    }

    /// Reindex the project if it needs it, sharing in-flight work across
    /// concurrent callers.
    pub async fn maybe_auto_index(&self, project_path: &str) -> Result<AutoIndexOutcome> {
        let path = project_path.to_string();

        let (future, created) = {
            let mut in_flight = self.in_flight.lock().expect("in_flight lock");
            if let Some(existing) = in_flight.get(&path) {
                (existing.clone(), false)
            } else {
                let is_stale = self.stale.lock().expect("stale lock").contains(&path);
                let cooled = self
                    .last_success
                    .lock()
                    .expect("last_success lock")
                    .get(&path)
                    .is_none_or(|t| t.elapsed() >= self.cooldown);
                if !cooled && !is_stale {
                    return Ok(AutoIndexOutcome::Skipped);
                }

                debug!(project = %path, "Starting auto-reindex");
                let future = (self.reindex)(path.clone(), self.cancel.clone()).shared();
                in_flight.insert(path.clone(), future.clone());
                (future, true)
            }
        };

        let result = future.await;

        if created {
            self.in_flight.lock().expect("in_flight lock").remove(&path);
            if result.is_ok() {
                self.last_success
                    .lock()
                    .expect("last_success lock")
                    .insert(path.clone(), Instant::now());
                self.stale.lock().expect("stale lock").remove(&path);
            }
        }

        match result {
            Ok(messages) => {
                debug!(project = %path, messages, "Auto-reindex complete");
                Ok(AutoIndexOutcome::Indexed)
            }
            Err(e) => Err(MnemoError::Other(anyhow::anyhow!(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_indexer(
        cooldown: Duration,
        delay: Duration,
        fail: bool,
    ) -> (Arc<AutoIndexer>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let reindex: ReindexFn = Arc::new(move |_path, _cancel| {
            let count = count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                if fail { Err("boom".to_string()) } else { Ok(42) }
            }
            .boxed()
        });
        (Arc::new(AutoIndexer::with_fn(reindex, cooldown)), count)
    }

    #[tokio::test]
    async fn test_stampede_runs_once() {
        let (indexer, count) =
            counting_indexer(Duration::from_secs(60), Duration::from_millis(100), false);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let indexer = indexer.clone();
            handles.push(tokio::spawn(async move {
                indexer.maybe_auto_index("/proj").await
            }));
        }
        for handle in handles {
            let outcome = handle.await.expect("join").expect("index");
            assert_eq!(outcome, AutoIndexOutcome::Indexed);
        }
        assert_eq!(count.load(Ordering::SeqCst), 1, "exactly one reindex for ten callers");
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_new_work() {
        let (indexer, count) =
            counting_indexer(Duration::from_secs(60), Duration::from_millis(1), false);

        indexer.maybe_auto_index("/proj").await.expect("first");
        let outcome = indexer.maybe_auto_index("/proj").await.expect("second");
        assert_eq!(outcome, AutoIndexOutcome::Skipped);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cooldown_expiry_allows_reindex() {
        let (indexer, count) =
            counting_indexer(Duration::from_millis(20), Duration::from_millis(1), false);

        indexer.maybe_auto_index("/proj").await.expect("first");
        tokio::time::sleep(Duration::from_millis(40)).await;
        indexer.maybe_auto_index("/proj").await.expect("second");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_flag_bypasses_cooldown() {
        let (indexer, count) =
            counting_indexer(Duration::from_secs(60), Duration::from_millis(1), false);

        indexer.maybe_auto_index("/proj").await.expect("first");
        indexer.mark_stale("/proj");
        let outcome = indexer.maybe_auto_index("/proj").await.expect("second");
        assert_eq!(outcome, AutoIndexOutcome::Indexed);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // The stale flag is consumed by the successful run.
        let outcome = indexer.maybe_auto_index("/proj").await.expect("third");
        assert_eq!(outcome, AutoIndexOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_failure_does_not_poison() {
        let (indexer, count) =
            counting_indexer(Duration::from_secs(60), Duration::from_millis(1), true);

        assert!(indexer.maybe_auto_index("/proj").await.is_err());
        // Failure recorded no success; the next caller retries immediately.
        assert!(indexer.maybe_auto_index("/proj").await.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_projects_isolated() {
        let (indexer, count) =
            counting_indexer(Duration::from_secs(60), Duration::from_millis(1), false);

        indexer.maybe_auto_index("/a").await.expect("a");
        indexer.maybe_auto_index("/b").await.expect("b");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
