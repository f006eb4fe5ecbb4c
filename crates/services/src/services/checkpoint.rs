//! Checkpoints: reviewable commits on an issue stream carrying a JSONL
//! diff of what the contributing execution changed.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use chrono::Utc;
use db::{
    DBService,
    models::{
        checkpoint::{Checkpoint, EntityChange, EntityChangeType, ReviewStatus},
        execution::Execution,
        stream::Stream,
    },
};
use git::{GitCli, GitCliError};
use serde_json::Value;
use sqlx::types::Json;
use thiserror::Error;
use utils::path::DATA_DIR_NAME;
use uuid::Uuid;

use crate::services::{
    events::{EventBus, names},
    merge_queue::{MergeQueueError, MergeQueueService},
};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("execution produced no changes to checkpoint")]
    NoChanges,
    #[error("execution {0} is missing commit information")]
    MissingCommits(Uuid),
    #[error(transparent)]
    Git(#[from] GitCliError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    MergeQueue(#[from] MergeQueueError),
    #[error("task join error: {0}")]
    TaskJoin(String),
}

/// Branch naming for issue streams: `stream/<branch-id>`.
pub fn issue_stream_branch(issue_id: &str) -> String {
    format!("stream/{}", utils::text::git_branch_id(issue_id))
}

/// Branch naming for execution streams: `exec/<branch-id>/<short-id>`.
pub fn execution_branch(issue_id: &str, execution_id: &Uuid) -> String {
    let short: String = execution_id.simple().to_string().chars().take(8).collect();
    format!("exec/{}/{short}", utils::text::git_branch_id(issue_id))
}

#[derive(Clone)]
pub struct CheckpointService {
    db: DBService,
    repo_path: PathBuf,
    bus: EventBus,
}

impl CheckpointService {
    pub fn new(db: DBService, repo_path: PathBuf, bus: EventBus) -> Self {
        Self { db, repo_path, bus }
    }

    /// Capture a checkpoint for a finished execution: land its commits on
    /// the stream (fast-forward when possible, squash merge otherwise),
    /// diff both JSONL collections against the baseline, persist.
    pub async fn create_checkpoint(
        &self,
        execution: &Execution,
        stream: &Stream,
        message: &str,
        enqueue: Option<&MergeQueueService>,
    ) -> Result<Checkpoint, CheckpointError> {
        let before = execution
            .before_commit
            .clone()
            .ok_or(CheckpointError::MissingCommits(execution.id))?;
        let after = execution
            .after_commit
            .clone()
            .ok_or(CheckpointError::MissingCommits(execution.id))?;
        if before == after {
            return Err(CheckpointError::NoChanges);
        }

        let repo = self.repo_path.clone();
        let branch = stream.branch_name.clone();
        let squash_message = message.to_string();
        let landed = tokio::task::spawn_blocking(move || {
            land_on_stream(&repo, &branch, &before, &after, &squash_message)
        })
        .await
        .map_err(|e| CheckpointError::TaskJoin(e.to_string()))??;

        let issue_snapshot =
            diff_jsonl_baselines(landed.issues_base.as_deref(), landed.issues_after.as_deref());
        let spec_snapshot =
            diff_jsonl_baselines(landed.specs_base.as_deref(), landed.specs_after.as_deref());

        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            issue_uuid: execution.issue_uuid,
            execution_id: execution.id,
            stream_id: stream.id,
            commit_sha: landed.commit_sha.clone(),
            parent_commit: Some(landed.parent_commit),
            changed_files: landed.stats.files_changed as i64,
            additions: landed.stats.additions as i64,
            deletions: landed.stats.deletions as i64,
            message: message.to_string(),
            checkpointed_at: Utc::now(),
            review_status: ReviewStatus::Pending,
            issue_snapshot: issue_snapshot.map(Json),
            spec_snapshot: spec_snapshot.map(Json),
        };

        let mut tx = self.db.pool.begin().await?;
        Checkpoint::insert(&mut *tx, &checkpoint).await?;
        Stream::record_checkpoint(&mut *tx, stream.id, checkpoint.id).await?;
        tx.commit().await?;

        self.bus.emit(
            &names::execution("updated"),
            serde_json::json!({
                "execution_id": execution.id,
                "checkpoint_id": checkpoint.id,
                "commit": checkpoint.commit_sha,
            }),
        );

        if let Some(queue) = enqueue {
            let target = execution.target_branch.clone().unwrap_or_else(|| "main".to_string());
            queue.enqueue(execution.id, stream.id, &target, 0).await?;
        }

        Ok(checkpoint)
    }
}

struct LandedCommits {
    commit_sha: String,
    parent_commit: String,
    stats: git::DiffStats,
    issues_base: Option<String>,
    issues_after: Option<String>,
    specs_base: Option<String>,
    specs_after: Option<String>,
}

/// Make the stream branch contain the execution's work and read both JSONL
/// collections at baseline and result.
fn land_on_stream(
    repo: &Path,
    branch: &str,
    before: &str,
    after: &str,
    message: &str,
) -> Result<LandedCommits, GitCliError> {
    let cli = GitCli::new();
    let tip = cli.branch_commit(repo, branch)?;

    let commit_sha = if cli.is_ancestor(repo, after, &tip)? {
        // the stream already contains the execution's commits
        tip
    } else if cli.is_ancestor(repo, &tip, after)? {
        cli.advance_branch(repo, branch, after)?;
        after.to_string()
    } else {
        squash_onto_stream(&cli, repo, branch, after, message)?
    };

    let issues_rel = format!("{DATA_DIR_NAME}/issues.jsonl");
    let specs_rel = format!("{DATA_DIR_NAME}/specs.jsonl");

    Ok(LandedCommits {
        stats: cli.diff_stats(repo, before, &commit_sha)?,
        issues_base: cli.show_file(repo, before, &issues_rel)?,
        issues_after: cli.show_file(repo, &commit_sha, &issues_rel)?,
        specs_base: cli.show_file(repo, before, &specs_rel)?,
        specs_after: cli.show_file(repo, &commit_sha, &specs_rel)?,
        commit_sha,
        parent_commit: before.to_string(),
    })
}

/// Divergent histories: squash the execution range into one commit on the
/// stream, via a throwaway worktree checked out at the stream branch.
fn squash_onto_stream(
    cli: &GitCli,
    repo: &Path,
    branch: &str,
    after: &str,
    message: &str,
) -> Result<String, GitCliError> {
    let scratch = std::env::temp_dir().join(format!("checkpoint-{}", Uuid::new_v4()));
    cli.worktree_add(repo, &scratch, branch, false, false)?;

    let result = (|| {
        cli.merge_squash(&scratch, after)?;
        cli.commit_all(&scratch, message)
    })();

    if let Err(e) = cli.worktree_remove(repo, &scratch, true) {
        tracing::warn!("could not remove checkpoint worktree: {e}");
    }
    let _ = cli.worktree_prune(repo);

    result
}

/// Diff two JSONL baselines into per-entity change triples. `None` (not an
/// empty list) when nothing changed.
pub fn diff_jsonl_baselines(
    base: Option<&str>,
    after: Option<&str>,
) -> Option<Vec<EntityChange>> {
    let (base_order, base_map) = parse_entities(base);
    let (after_order, after_map) = parse_entities(after);

    let mut changes = Vec::new();

    for id in &after_order {
        match base_map.get(id) {
            None => changes.push(EntityChange {
                id: id.clone(),
                change_type: EntityChangeType::Created,
                changed_fields: None,
            }),
            Some(prev) => {
                let fields = changed_fields(prev, &after_map[id]);
                if !fields.is_empty() {
                    changes.push(EntityChange {
                        id: id.clone(),
                        change_type: EntityChangeType::Modified,
                        changed_fields: Some(fields),
                    });
                }
            }
        }
    }

    for id in &base_order {
        if !after_map.contains_key(id) {
            changes.push(EntityChange {
                id: id.clone(),
                change_type: EntityChangeType::Deleted,
                changed_fields: None,
            });
        }
    }

    if changes.is_empty() { None } else { Some(changes) }
}

fn parse_entities(content: Option<&str>) -> (Vec<String>, HashMap<String, Value>) {
    let mut order = Vec::new();
    let mut map = HashMap::new();
    let Some(content) = content else {
        return (order, map);
    };
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(id) = value.get("id").and_then(|v| v.as_str()).map(|s| s.to_string()) else {
            continue;
        };
        if map.insert(id.clone(), value).is_none() {
            order.push(id);
        }
    }
    (order, map)
}

/// Field-level diff between two entity renderings, ignoring `updated_at`
/// (it moves on every touch and would drown the signal).
fn changed_fields(before: &Value, after: &Value) -> Vec<String> {
    let empty = serde_json::Map::new();
    let before_map = before.as_object().unwrap_or(&empty);
    let after_map = after.as_object().unwrap_or(&empty);

    let mut fields: Vec<String> = before_map
        .keys()
        .chain(after_map.keys())
        .filter(|key| *key != "updated_at")
        .filter(|key| before_map.get(*key) != after_map.get(*key))
        .cloned()
        .collect();
    fields.sort();
    fields.dedup();
    fields
}
