//! Worktree lifecycle on top of the git CLI, with per-path locks so
//! concurrent executions can never race on the same worktree directory.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, LazyLock, Mutex},
};

use git::{GitCli, GitCliError};
use thiserror::Error;
use tracing::{debug, info};
use utils::path::canonicalize_lossy;

static WORKTREE_LOCKS: LazyLock<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn lock_for(path: &Path) -> Arc<tokio::sync::Mutex<()>> {
    let key = path.to_string_lossy().to_string();
    let mut locks = WORKTREE_LOCKS.lock().unwrap_or_else(|e| e.into_inner());
    locks.entry(key).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
}

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Git(#[from] GitCliError),
    #[error("task join error: {0}")]
    TaskJoin(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct WorktreeManager;

impl WorktreeManager {
    /// Create a worktree for `branch`, creating the branch from
    /// `base_branch` first when asked.
    pub async fn create_worktree(
        repo_path: &Path,
        branch: &str,
        worktree_path: &Path,
        base_branch: &str,
        create_branch: bool,
    ) -> Result<(), WorktreeError> {
        let lock = lock_for(worktree_path);
        let _guard = lock.lock().await;

        let repo_path = repo_path.to_path_buf();
        let branch = branch.to_string();
        let worktree_path = worktree_path.to_path_buf();
        let base_branch = base_branch.to_string();

        tokio::task::spawn_blocking(move || -> Result<(), WorktreeError> {
            let cli = GitCli::new();
            if create_branch && !cli.branch_exists(&repo_path, &branch)? {
                cli.create_branch(&repo_path, &branch, Some(&base_branch))?;
            }

            if let Some(parent) = worktree_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            if Self::is_registered(&cli, &repo_path, &worktree_path)? && worktree_path.exists() {
                debug!("worktree already set up at {}", worktree_path.display());
                return Ok(());
            }

            // stale registration or half-removed directory: clean up first
            Self::cleanup_blocking(&cli, &repo_path, &worktree_path);

            cli.worktree_add(&repo_path, &worktree_path, &branch, false, false)?;
            info!("created worktree for {} at {}", branch, worktree_path.display());
            Ok(())
        })
        .await
        .map_err(|e| WorktreeError::TaskJoin(e.to_string()))?
    }

    /// Recreate the worktree when the directory or its registration is
    /// missing; no-op when it is already healthy.
    pub async fn ensure_worktree_exists(
        repo_path: &Path,
        branch: &str,
        worktree_path: &Path,
    ) -> Result<(), WorktreeError> {
        Self::create_worktree(repo_path, branch, worktree_path, branch, false).await
    }

    pub async fn cleanup_worktree(
        repo_path: &Path,
        worktree_path: &Path,
    ) -> Result<(), WorktreeError> {
        let lock = lock_for(worktree_path);
        let _guard = lock.lock().await;

        let repo_path = repo_path.to_path_buf();
        let worktree_path = worktree_path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let cli = GitCli::new();
            Self::cleanup_blocking(&cli, &repo_path, &worktree_path);
            Ok(())
        })
        .await
        .map_err(|e| WorktreeError::TaskJoin(e.to_string()))?
    }

    pub async fn configure_sparse_checkout(
        worktree_path: &Path,
        patterns: Vec<String>,
    ) -> Result<(), WorktreeError> {
        let worktree_path = worktree_path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let cli = GitCli::new();
            cli.configure_sparse_checkout(&worktree_path, &patterns)?;
            Ok(())
        })
        .await
        .map_err(|e| WorktreeError::TaskJoin(e.to_string()))?
    }

    /// Startup hygiene: remove worktree directories under `worktrees_dir`
    /// that no live execution claims. Best-effort; failures are logged.
    pub async fn sweep_stale_worktrees(
        repo_path: &Path,
        worktrees_dir: &Path,
        keep: &[std::path::PathBuf],
    ) -> Result<usize, WorktreeError> {
        let entries = match std::fs::read_dir(worktrees_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let keep: Vec<_> = keep.iter().map(|p| canonicalize_lossy(p)).collect();
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() || keep.contains(&canonicalize_lossy(&path)) {
                continue;
            }
            info!("sweeping stale worktree {}", path.display());
            if let Err(e) = Self::cleanup_worktree(repo_path, &path).await {
                tracing::warn!("stale worktree sweep failed for {}: {e}", path.display());
            } else {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn is_registered(
        cli: &GitCli,
        repo_path: &Path,
        worktree_path: &Path,
    ) -> Result<bool, WorktreeError> {
        let target = canonicalize_lossy(worktree_path);
        let registered = cli
            .worktree_list(repo_path)?
            .into_iter()
            .any(|entry| canonicalize_lossy(&entry.path) == target);
        Ok(registered)
    }

    /// Best-effort removal of the registration and the directory. Cleanup
    /// logs, it never fails the caller.
    fn cleanup_blocking(cli: &GitCli, repo_path: &Path, worktree_path: &Path) {
        if let Err(e) = cli.worktree_remove(repo_path, worktree_path, true) {
            debug!("git worktree remove non-fatal error: {e}");
        }
        if worktree_path.exists()
            && let Err(e) = std::fs::remove_dir_all(worktree_path)
        {
            debug!("could not remove worktree directory: {e}");
        }
        if let Err(e) = cli.worktree_prune(repo_path) {
            debug!("git worktree prune non-fatal error: {e}");
        }
    }
}
