//! Change-driven filesystem watcher over the data directory.
//!
//! Observes `specs/`, `issues/` and the two collection files. Every change
//! passes a stable-write gate, a per-path in-process flag, and a content
//! gate before entering the sync engine under one global FIFO mutex, so
//! watcher-triggered writes can never re-enter while a prior event is in
//! flight.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use dashmap::DashMap;
use db::models::EntityKind;
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use utils::{canonical::content_hash, path::DataLayout};

use crate::services::sync::{SyncEngine, SyncError};

const DEBOUNCE: Duration = Duration::from_millis(200);
const STABLE_WRITE_PROBES: u32 = 50;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error(transparent)]
    Notify(#[from] notify::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchTarget {
    SpecsJsonl,
    IssuesJsonl,
    SpecMarkdown,
    IssueMarkdown,
}

fn classify(layout: &DataLayout, path: &Path) -> Option<WatchTarget> {
    if path == layout.specs_jsonl() {
        return Some(WatchTarget::SpecsJsonl);
    }
    if path == layout.issues_jsonl() {
        return Some(WatchTarget::IssuesJsonl);
    }
    if path.extension().and_then(|e| e.to_str()) != Some("md") {
        return None;
    }
    if path.starts_with(layout.specs_dir()) {
        return Some(WatchTarget::SpecMarkdown);
    }
    if path.starts_with(layout.issues_dir()) {
        return Some(WatchTarget::IssueMarkdown);
    }
    None
}

pub struct WatcherHandle {
    // kept alive for the lifetime of the watch; dropping stops the notify
    // backend
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn shutdown(self) {
        self.task.abort();
    }
}

pub struct Watcher {
    sync: Arc<SyncEngine>,
    layout: DataLayout,
    stable_write: Duration,
    /// Global FIFO mutex: one sync operation at a time, in arrival order.
    fifo: tokio::sync::Mutex<()>,
    /// Paths currently being handled; events for them are dropped.
    in_process: DashMap<PathBuf, ()>,
    /// Full-file content hashes for the JSONL collections.
    jsonl_hashes: DashMap<PathBuf, String>,
}

impl Watcher {
    /// Prime caches, sweep orphans, then start observing. These startup
    /// side effects (plus orphan deletion later) are the only work the
    /// watcher does without routing through the sync engine.
    pub async fn start(
        sync: Arc<SyncEngine>,
        stable_write: Duration,
    ) -> Result<WatcherHandle, WatcherError> {
        let layout = sync.layout().clone();
        sync.prime_jsonl_caches()?;
        sync.sweep_orphans().await?;

        let watcher = Arc::new(Watcher {
            sync,
            layout: layout.clone(),
            stable_write,
            fifo: tokio::sync::Mutex::new(()),
            in_process: DashMap::new(),
            jsonl_hashes: DashMap::new(),
        });

        for path in [layout.specs_jsonl(), layout.issues_jsonl()] {
            if let Ok(content) = std::fs::read_to_string(&path) {
                watcher.jsonl_hashes.insert(path, content_hash(&content));
            }
        }

        let (tx, mut rx) = mpsc::channel::<DebounceEventResult>(64);
        let mut debouncer = new_debouncer(DEBOUNCE, None, move |result: DebounceEventResult| {
            let _ = tx.blocking_send(result);
        })?;
        debouncer.watch(layout.base(), RecursiveMode::Recursive)?;

        let task = tokio::spawn({
            let watcher = watcher.clone();
            async move {
                while let Some(result) = rx.recv().await {
                    match result {
                        Ok(events) => {
                            for event in events {
                                for path in &event.paths {
                                    // stability waits run concurrently; the
                                    // FIFO mutex serializes the sync itself
                                    let watcher = watcher.clone();
                                    let path = path.clone();
                                    tokio::spawn(async move {
                                        watcher.handle_path(path).await;
                                    });
                                }
                            }
                        }
                        Err(errors) => {
                            for error in errors {
                                tracing::warn!("watch error: {error}");
                            }
                        }
                    }
                }
            }
        });

        Ok(WatcherHandle { _debouncer: debouncer, task })
    }

    async fn handle_path(&self, path: PathBuf) {
        let Some(target) = classify(&self.layout, &path) else {
            return;
        };

        // events for a path already being handled are dropped
        if self.in_process.insert(path.clone(), ()).is_some() {
            return;
        }

        self.wait_for_stable_write(&path).await;

        let _guard = self.fifo.lock().await;
        if let Err(e) = self.dispatch(target, &path).await {
            tracing::error!("sync failed for {}: {e}", path.display());
        }
        self.in_process.remove(&path);
    }

    async fn dispatch(&self, target: WatchTarget, path: &Path) -> Result<(), WatcherError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        match target {
            WatchTarget::SpecsJsonl | WatchTarget::IssuesJsonl => {
                let Some(content) = content else {
                    // the store is the source of truth for existence
                    tracing::warn!("collection file vanished, ignoring: {}", path.display());
                    return Ok(());
                };
                let hash = content_hash(&content);
                if self.jsonl_hashes.get(path).map(|h| *h == hash).unwrap_or(false) {
                    return Ok(());
                }
                self.jsonl_hashes.insert(path.to_path_buf(), hash);

                let kind = if target == WatchTarget::SpecsJsonl {
                    EntityKind::Spec
                } else {
                    EntityKind::Issue
                };
                self.sync.reconcile_jsonl(kind).await?;
                // the reconcile may have written the file back; re-prime
                if let Ok(content) = std::fs::read_to_string(path) {
                    self.jsonl_hashes.insert(path.to_path_buf(), content_hash(&content));
                }
            }
            WatchTarget::SpecMarkdown | WatchTarget::IssueMarkdown => {
                let Some(content) = content else {
                    tracing::info!("markdown file vanished, ignoring: {}", path.display());
                    return Ok(());
                };
                // a db → md write already recorded this exact content, so
                // the notification for it dies here
                if !self.sync.md_content_changed(path, &content) {
                    return Ok(());
                }
                let kind = if target == WatchTarget::SpecMarkdown {
                    EntityKind::Spec
                } else {
                    EntityKind::Issue
                };
                self.sync.sync_markdown_file(kind, path).await?;
            }
        }
        Ok(())
    }

    /// Editors write in bursts; wait until the size holds still.
    async fn wait_for_stable_write(&self, path: &Path) {
        let mut last_len: Option<u64> = None;
        for _ in 0..STABLE_WRITE_PROBES {
            let len = match std::fs::metadata(path) {
                Ok(meta) => meta.len(),
                Err(_) => return,
            };
            if last_len == Some(len) {
                return;
            }
            last_len = Some(len);
            tokio::time::sleep(self.stable_write).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_watched_paths() {
        let layout = DataLayout::new("/p/.sudocode");
        assert_eq!(
            classify(&layout, Path::new("/p/.sudocode/specs.jsonl")),
            Some(WatchTarget::SpecsJsonl)
        );
        assert_eq!(
            classify(&layout, Path::new("/p/.sudocode/issues.jsonl")),
            Some(WatchTarget::IssuesJsonl)
        );
        assert_eq!(
            classify(&layout, Path::new("/p/.sudocode/specs/add_auth.md")),
            Some(WatchTarget::SpecMarkdown)
        );
        assert_eq!(
            classify(&layout, Path::new("/p/.sudocode/issues/fix_login_ISSUE-002.md")),
            Some(WatchTarget::IssueMarkdown)
        );
        // not ours: db file, config, tmp siblings, worktrees
        assert_eq!(classify(&layout, Path::new("/p/.sudocode/db.sqlite")), None);
        assert_eq!(classify(&layout, Path::new("/p/.sudocode/specs.jsonl.tmp")), None);
        assert_eq!(classify(&layout, Path::new("/p/.sudocode/worktrees/x/file.md")), None);
    }
}
