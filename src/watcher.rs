// src/watcher.rs
// Background watcher over the Claude projects root. Filesystem events flag
// the owning project as stale so read paths skip mtime scans when nothing
// changed and reindex promptly when something did.

use crate::reindex::AutoIndexer;
use crate::util::folder_name_to_path;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

/// How long to wait for events before checking shutdown (ms).
const SELECT_TIMEOUT_MS: u64 = 2000;

/// Map an event path under the projects root to its project path.
fn project_for_event(projects_root: &Path, event_path: &Path) -> Option<String> {
    let relative = event_path.strip_prefix(projects_root).ok()?;
    let folder = relative.components().next()?;
    let folder_name = folder.as_os_str().to_str()?;
    Some(folder_name_to_path(folder_name))
}

/// Spawn the staleness watcher. Returns immediately; the watcher runs until
/// the shutdown signal flips to true.
pub fn spawn_stale_watcher(
    projects_root: PathBuf,
    indexer: Arc<AutoIndexer>,
    shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        if let Err(e) = run_watcher(projects_root, indexer, shutdown).await {
            tracing::warn!("Stale watcher exited with error: {}", e);
        }
    });
}

async fn run_watcher(
    projects_root: PathBuf,
    indexer: Arc<AutoIndexer>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    use notify::{Config, Event, EventKind, RecommendedWatcher, Watcher};

    if !projects_root.exists() {
        tracing::info!(
            root = %projects_root.display(),
            "Projects root missing, stale watcher not started"
        );
        return Ok(());
    }

    let (notify_tx, mut notify_rx) = tokio::sync::mpsc::channel::<PathBuf>(64);
    let mut watcher: RecommendedWatcher = Watcher::new(
        move |res: std::result::Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    for path in event.paths {
                        let _ = notify_tx.try_send(path);
                    }
                }
            }
        },
        Config::default(),
    )?;
    watcher.watch(&projects_root, notify::RecursiveMode::Recursive)?;
    tracing::debug!(root = %projects_root.display(), "Stale watcher running");

    loop {
        tokio::select! {
            event_path = notify_rx.recv() => {
                let Some(event_path) = event_path else { break };
                if let Some(project) = project_for_event(&projects_root, &event_path) {
                    tracing::debug!(project = %project, "Transcript change, marking stale");
                    indexer.mark_stale(&project);
                }
                // Drain the burst; one mark per project is enough.
                while let Ok(extra) = notify_rx.try_recv() {
                    if let Some(project) = project_for_event(&projects_root, &extra) {
                        indexer.mark_stale(&project);
                    }
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(SELECT_TIMEOUT_MS)) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::debug!("Stale watcher shutting down");
                    break;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reindex::ReindexFn;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn indexer_with_counter() -> (Arc<AutoIndexer>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let reindex: ReindexFn = Arc::new(move |_path, _cancel| {
            let count = count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            }
            .boxed()
        });
        (
            Arc::new(AutoIndexer::with_fn(reindex, Duration::from_secs(60))),
            count,
        )
    }

    #[test]
    fn test_project_for_event() {
        let root = Path::new("/home/u/.claude/projects");
        let event = Path::new("/home/u/.claude/projects/-tmp-demo/session.jsonl");
        assert_eq!(
            project_for_event(root, event).as_deref(),
            Some("/tmp/demo")
        );
        assert!(project_for_event(root, Path::new("/elsewhere/x")).is_none());
    }

    #[tokio::test]
    async fn test_watcher_marks_project_stale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let folder = dir.path().join("-tmp-demo");
        std::fs::create_dir_all(&folder).expect("mkdir");

        let (indexer, count) = indexer_with_counter();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        spawn_stale_watcher(dir.path().to_path_buf(), indexer.clone(), shutdown_rx);

        // Give the watcher time to register, then touch a transcript.
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(folder.join("s.jsonl"), "{}").expect("write");

        // Drive the cooldown-bypassing reindex: first call runs (no prior
        // success), second only runs again if the stale flag was set.
        indexer.maybe_auto_index("/tmp/demo").await.expect("first");
        let mut reindexed_again = false;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if indexer.maybe_auto_index("/tmp/demo").await.is_ok()
                && count.load(Ordering::SeqCst) >= 2
            {
                reindexed_again = true;
                break;
            }
        }
        assert!(reindexed_again, "watcher event should flag the project stale");

        shutdown_tx.send(true).expect("shutdown");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
