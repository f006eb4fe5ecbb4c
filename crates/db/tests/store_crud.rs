use chrono::Utc;
use db::{
    DBService,
    models::{
        EntityKind,
        execution::{CreateExecution, Execution, ExecutionStatus},
        feedback::{Feedback, FeedbackType},
        issue::{CreateIssue, Issue, IssueStatus, UpdateIssue},
        relationship::{Relationship, RelationshipType},
        spec::{CreateSpec, Spec},
        tag::Tag,
    },
};
use uuid::Uuid;

fn sample_spec(id: &str, title: &str) -> Spec {
    Spec::new(
        id.to_string(),
        &CreateSpec {
            title: title.to_string(),
            content: "body".to_string(),
            priority: None,
            parent_uuid: None,
            external_links: None,
        },
    )
}

fn sample_issue(id: &str, title: &str) -> Issue {
    Issue::new(
        id.to_string(),
        &CreateIssue {
            title: title.to_string(),
            content: "body".to_string(),
            status: None,
            priority: None,
            assignee: None,
            parent_uuid: None,
            external_links: None,
        },
    )
}

#[tokio::test]
async fn update_patch_skips_and_clears() {
    let db = DBService::new_in_memory().await.unwrap();
    let mut issue = sample_issue("ISSUE-001", "first");
    issue.assignee = Some("dev".to_string());
    Issue::insert(&db.pool, &issue).await.unwrap();

    // skip: assignee untouched when the patch omits it
    let patch = UpdateIssue { title: Some("renamed".to_string()), ..Default::default() };
    Issue::update(&db.pool, issue.uuid, &patch).await.unwrap();
    let loaded = Issue::find_by_uuid(&db.pool, issue.uuid).await.unwrap().unwrap();
    assert_eq!(loaded.title, "renamed");
    assert_eq!(loaded.assignee.as_deref(), Some("dev"));

    // clear: an explicit null clears the column
    let patch = UpdateIssue { assignee: Some(None), ..Default::default() };
    Issue::update(&db.pool, issue.uuid, &patch).await.unwrap();
    let loaded = Issue::find_by_uuid(&db.pool, issue.uuid).await.unwrap().unwrap();
    assert_eq!(loaded.assignee, None);
}

#[tokio::test]
async fn update_patch_json_distinguishes_missing_from_null() {
    let patch: UpdateIssue = serde_json::from_str(r#"{"title": "t"}"#).unwrap();
    assert!(patch.assignee.is_none());

    let patch: UpdateIssue = serde_json::from_str(r#"{"assignee": null}"#).unwrap();
    assert_eq!(patch.assignee, Some(None));
}

#[tokio::test]
async fn closing_an_issue_stamps_closed_at_once() {
    let db = DBService::new_in_memory().await.unwrap();
    let issue = sample_issue("ISSUE-001", "first");
    Issue::insert(&db.pool, &issue).await.unwrap();

    let patch = UpdateIssue { status: Some(IssueStatus::Closed), ..Default::default() };
    Issue::update(&db.pool, issue.uuid, &patch).await.unwrap();
    let closed_at = Issue::find_by_uuid(&db.pool, issue.uuid).await.unwrap().unwrap().closed_at;
    assert!(closed_at.is_some());

    Issue::update(&db.pool, issue.uuid, &patch).await.unwrap();
    let again = Issue::find_by_uuid(&db.pool, issue.uuid).await.unwrap().unwrap().closed_at;
    assert_eq!(closed_at, again);

    let patch = UpdateIssue { status: Some(IssueStatus::Open), ..Default::default() };
    Issue::update(&db.pool, issue.uuid, &patch).await.unwrap();
    let reopened = Issue::find_by_uuid(&db.pool, issue.uuid).await.unwrap().unwrap();
    assert_eq!(reopened.closed_at, None);
}

#[tokio::test]
async fn live_id_unique_but_archived_id_reusable() {
    let db = DBService::new_in_memory().await.unwrap();
    let first = sample_spec("SPEC-001", "first");
    Spec::insert(&db.pool, &first).await.unwrap();

    // same live id refused
    let dup = sample_spec("SPEC-001", "dup");
    assert!(Spec::insert(&db.pool, &dup).await.is_err());

    // archiving frees the label
    Spec::archive(&db.pool, first.uuid).await.unwrap();
    let reuse = sample_spec("SPEC-001", "reuse");
    Spec::insert(&db.pool, &reuse).await.unwrap();

    let live = Spec::find_by_id(&db.pool, "SPEC-001").await.unwrap().unwrap();
    assert_eq!(live.uuid, reuse.uuid);
}

#[tokio::test]
async fn relationship_and_tag_cascade_on_delete() {
    let db = DBService::new_in_memory().await.unwrap();
    let spec = sample_spec("SPEC-001", "spec");
    let issue = sample_issue("ISSUE-001", "issue");
    Spec::insert(&db.pool, &spec).await.unwrap();
    Issue::insert(&db.pool, &issue).await.unwrap();

    let rel = Relationship {
        from_uuid: issue.uuid,
        from_type: EntityKind::Issue,
        to_uuid: spec.uuid,
        to_type: EntityKind::Spec,
        rel_type: RelationshipType::Implements,
        created_at: Utc::now(),
    };
    Relationship::insert(&db.pool, &rel).await.unwrap();
    Tag::add(&db.pool, issue.uuid, EntityKind::Issue, "backend").await.unwrap();

    let fb = Feedback {
        id: Uuid::new_v4(),
        from_uuid: None,
        to_uuid: issue.uuid,
        feedback_type: FeedbackType::Comment,
        content: "looks wrong".to_string(),
        anchor: None,
        dismissed: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    Feedback::insert(&db.pool, &fb).await.unwrap();

    // full cascade in one transaction
    let mut tx = db.pool.begin().await.unwrap();
    Relationship::delete_all_for(&mut *tx, issue.uuid).await.unwrap();
    Tag::delete_all_for(&mut *tx, issue.uuid).await.unwrap();
    Feedback::delete_for(&mut *tx, issue.uuid).await.unwrap();
    Issue::delete(&mut *tx, issue.uuid).await.unwrap();
    tx.commit().await.unwrap();

    assert!(Relationship::incoming(&db.pool, spec.uuid).await.unwrap().is_empty());
    assert!(Tag::list_for(&db.pool, issue.uuid).await.unwrap().is_empty());
    assert!(Feedback::list_for(&db.pool, issue.uuid).await.unwrap().is_empty());
}

#[tokio::test]
async fn one_live_execution_per_worktree() {
    let db = DBService::new_in_memory().await.unwrap();
    let issue = sample_issue("ISSUE-001", "issue");
    Issue::insert(&db.pool, &issue).await.unwrap();

    let create = CreateExecution {
        issue_uuid: issue.uuid,
        agent_type: "mock".to_string(),
        target_branch: Some("main".to_string()),
        parent_execution_id: None,
        workflow_execution_id: None,
    };

    let mut first = Execution::new(&create);
    first.worktree_path = Some("/tmp/wt/a".to_string());
    Execution::insert(&db.pool, &first).await.unwrap();

    let mut second = Execution::new(&create);
    second.worktree_path = Some("/tmp/wt/a".to_string());
    assert!(Execution::insert(&db.pool, &second).await.is_err());

    // terminal executions release the path
    Execution::update_status(&db.pool, first.id, ExecutionStatus::Completed).await.unwrap();
    assert!(Execution::insert(&db.pool, &second).await.is_ok());

    let active = Execution::find_active_by_worktree(&db.pool, "/tmp/wt/a").await.unwrap().unwrap();
    assert_eq!(active.id, second.id);
}

#[tokio::test]
async fn specs_sort_stably_within_one_millisecond() {
    let db = DBService::new_in_memory().await.unwrap();
    let now = Utc::now();
    for id in ["SPEC-002", "SPEC-001", "SPEC-003"] {
        let mut spec = sample_spec(id, id);
        spec.created_at = now;
        spec.updated_at = now;
        Spec::insert(&db.pool, &spec).await.unwrap();
    }
    let listed = Spec::list(&db.pool, false).await.unwrap();
    let ids: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["SPEC-001", "SPEC-002", "SPEC-003"]);
}
