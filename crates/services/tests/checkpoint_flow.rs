use std::fs;

use db::{
    DBService,
    models::{
        checkpoint::EntityChangeType,
        execution::{CreateExecution, Execution},
        issue::{CreateIssue, Issue},
        stream::Stream,
    },
};
use git::GitCli;
use services::services::{
    checkpoint::{CheckpointError, CheckpointService, execution_branch, issue_stream_branch},
    events::EventBus,
    merge_queue::MergeQueueService,
};
use tempfile::TempDir;
use uuid::Uuid;

struct Scenario {
    _td: TempDir,
    repo: std::path::PathBuf,
    db: DBService,
    issue: Issue,
    execution: Execution,
    stream: Stream,
}

/// Repo with a baseline `.sudocode/issues.jsonl` holding I1; the execution
/// branch modifies I1's title and adds I2.
async fn scenario() -> Scenario {
    let td = TempDir::new().unwrap();
    let repo = td.path().join("repo");
    let cli = GitCli::new();
    cli.init_repo(&repo, "main").unwrap();

    fs::create_dir_all(repo.join(".sudocode")).unwrap();
    fs::write(
        repo.join(".sudocode/issues.jsonl"),
        "{\"id\":\"I1\",\"title\":\"old title\",\"updated_at\":\"2024-01-01T00:00:00Z\"}\n",
    )
    .unwrap();
    fs::write(repo.join(".sudocode/specs.jsonl"), "").unwrap();
    let before = cli.commit_all(&repo, "baseline").unwrap();

    // the issue stream forks at the baseline
    let stream_branch = issue_stream_branch("ISSUE-001");
    cli.create_branch(&repo, &stream_branch, Some(&before)).unwrap();

    // the execution works in its own worktree on its own branch
    let execution_id = Uuid::new_v4();
    let exec_branch = execution_branch("ISSUE-001", &execution_id);
    let wt = td.path().join("wt");
    cli.worktree_add(&repo, &wt, &exec_branch, true, false).unwrap();
    fs::write(
        wt.join(".sudocode/issues.jsonl"),
        "{\"id\":\"I1\",\"title\":\"new title\",\"updated_at\":\"2024-02-01T00:00:00Z\"}\n{\"id\":\"I2\",\"title\":\"discovered\",\"updated_at\":\"2024-02-01T00:00:00Z\"}\n",
    )
    .unwrap();
    let after = cli.commit_all(&wt, "agent work").unwrap();

    let db = DBService::new_in_memory().await.unwrap();
    let issue = Issue::new(
        "ISSUE-001".to_string(),
        &CreateIssue {
            title: "tracked issue".to_string(),
            content: String::new(),
            status: None,
            priority: None,
            assignee: None,
            parent_uuid: None,
            external_links: None,
        },
    );
    Issue::insert(&db.pool, &issue).await.unwrap();

    let stream = Stream::find_or_create_for_issue(&db.pool, issue.uuid, &stream_branch)
        .await
        .unwrap();

    let mut execution = Execution::new(&CreateExecution {
        issue_uuid: issue.uuid,
        agent_type: "mock".to_string(),
        target_branch: Some("main".to_string()),
        parent_execution_id: None,
        workflow_execution_id: None,
    });
    execution.id = execution_id;
    execution.branch_name = Some(exec_branch);
    execution.before_commit = Some(before);
    execution.after_commit = Some(after);
    Execution::insert(&db.pool, &execution).await.unwrap();

    Scenario { _td: td, repo, db, issue, execution, stream }
}

#[tokio::test]
async fn checkpoint_captures_jsonl_snapshots() {
    let s = scenario().await;
    let service = CheckpointService::new(s.db.clone(), s.repo.clone(), EventBus::new());

    let checkpoint =
        service.create_checkpoint(&s.execution, &s.stream, "land agent work", None).await.unwrap();

    assert_eq!(checkpoint.issue_uuid, s.issue.uuid);
    assert_eq!(checkpoint.parent_commit, s.execution.before_commit);

    let issue_snapshot = checkpoint.issue_snapshot.as_ref().unwrap();
    assert_eq!(issue_snapshot.0.len(), 2);
    assert_eq!(issue_snapshot.0[0].id, "I1");
    assert_eq!(issue_snapshot.0[0].change_type, EntityChangeType::Modified);
    assert_eq!(
        issue_snapshot.0[0].changed_fields.as_deref(),
        Some(["title".to_string()].as_slice())
    );
    assert_eq!(issue_snapshot.0[1].id, "I2");
    assert_eq!(issue_snapshot.0[1].change_type, EntityChangeType::Created);

    // specs were untouched: null, not an empty list
    assert!(checkpoint.spec_snapshot.is_none());

    // the fast-forward landed the execution commit on the stream
    let cli = GitCli::new();
    assert_eq!(
        cli.branch_commit(&s.repo, &s.stream.branch_name).unwrap(),
        s.execution.after_commit.clone().unwrap()
    );

    // stream bookkeeping advanced
    let stream = Stream::find_by_id(&s.db.pool, s.stream.id).await.unwrap().unwrap();
    assert_eq!(stream.checkpoint_count, 1);
    assert_eq!(stream.last_checkpoint_id, Some(checkpoint.id));
}

#[tokio::test]
async fn no_change_execution_refuses_checkpoint() {
    let s = scenario().await;
    let service = CheckpointService::new(s.db.clone(), s.repo.clone(), EventBus::new());

    let mut unchanged = s.execution.clone();
    unchanged.after_commit = unchanged.before_commit.clone();
    match service.create_checkpoint(&unchanged, &s.stream, "nothing", None).await {
        Err(CheckpointError::NoChanges) => {}
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn divergent_stream_gets_a_squashed_merge() {
    let s = scenario().await;
    let cli = GitCli::new();

    // diverge the stream with an unrelated commit
    let stream_wt = s._td.path().join("stream-wt");
    cli.worktree_add(&s.repo, &stream_wt, &s.stream.branch_name, false, false).unwrap();
    fs::write(stream_wt.join("NOTES.md"), "stream-side note\n").unwrap();
    cli.commit_all(&stream_wt, "stream note").unwrap();
    cli.worktree_remove(&s.repo, &stream_wt, true).unwrap();

    let service = CheckpointService::new(s.db.clone(), s.repo.clone(), EventBus::new());
    let checkpoint =
        service.create_checkpoint(&s.execution, &s.stream, "squash agent work", None).await.unwrap();

    // the stream tip is a new squash commit containing both histories
    let tip = cli.branch_commit(&s.repo, &s.stream.branch_name).unwrap();
    assert_eq!(checkpoint.commit_sha, tip);
    assert_ne!(Some(tip.clone()), s.execution.after_commit);

    let issues_at_tip = cli
        .show_file(&s.repo, &tip, ".sudocode/issues.jsonl")
        .unwrap()
        .unwrap();
    assert!(issues_at_tip.contains("new title"));
    assert!(cli.show_file(&s.repo, &tip, "NOTES.md").unwrap().is_some());
}

#[tokio::test]
async fn checkpoint_can_enqueue_for_merge() {
    let s = scenario().await;
    let queue = MergeQueueService::new(s.db.clone());
    let service = CheckpointService::new(s.db.clone(), s.repo.clone(), EventBus::new());

    service
        .create_checkpoint(&s.execution, &s.stream, "land and queue", Some(&queue))
        .await
        .unwrap();

    let entries = queue.list("main").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].execution_id, s.execution.id);
    assert_eq!(entries[0].position, 0);
}
