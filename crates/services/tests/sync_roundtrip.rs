use std::{collections::HashSet, fs, sync::Arc};

use chrono::{Duration, Utc};
use db::{
    DBService,
    models::{
        EntityKind,
        issue::{Issue, IssueStatus},
        spec::Spec,
    },
};
use services::services::{
    events::{EventBus, SyncSource},
    jsonl::read_jsonl,
    sync::{
        MdSyncOutcome, SyncEngine,
        records::{JsonlIssue, JsonlSpec},
    },
};
use utils::path::DataLayout;
use uuid::Uuid;

fn jsonl_spec(id: &str, title: &str) -> JsonlSpec {
    let now = Utc::now();
    JsonlSpec {
        id: id.to_string(),
        uuid: Uuid::new_v4(),
        title: title.to_string(),
        file_path: None,
        content: format!("Body of {id}."),
        priority: 2,
        parent_uuid: None,
        archived: false,
        archived_at: None,
        external_links: None,
        created_at: now,
        updated_at: now,
        relationships: vec![],
        tags: vec![],
    }
}

fn jsonl_issue(id: &str, title: &str) -> JsonlIssue {
    let now = Utc::now();
    JsonlIssue {
        id: id.to_string(),
        uuid: Uuid::new_v4(),
        title: title.to_string(),
        status: IssueStatus::Open,
        content: format!("Body of {id}."),
        priority: 2,
        assignee: None,
        parent_uuid: None,
        archived: false,
        archived_at: None,
        closed_at: None,
        external_links: None,
        created_at: now,
        updated_at: now,
        relationships: vec![],
        tags: vec![],
        feedback: vec![],
    }
}

async fn engine_in(dir: &std::path::Path) -> Arc<SyncEngine> {
    let layout = DataLayout::new(dir.join(".sudocode"));
    layout.ensure_dirs().unwrap();
    let db = DBService::new_in_memory().await.unwrap();
    Arc::new(SyncEngine::new(db, layout, EventBus::new()).unwrap())
}

#[tokio::test]
async fn collision_renumbers_incoming_and_keeps_existing() {
    let td = tempfile::tempdir().unwrap();
    let sync = engine_in(td.path()).await;

    // pre-existing SPEC-003 with uuid A
    let existing = jsonl_spec("SPEC-003", "original");
    let uuid_a = existing.uuid;
    sync.import_spec_records(vec![existing], &HashSet::new(), SyncSource::Jsonl).await.unwrap();

    // import brings SPEC-003 again under uuid B, created later
    let mut incoming = jsonl_spec("SPEC-003", "impostor");
    incoming.created_at = Utc::now() + Duration::seconds(5);
    incoming.updated_at = incoming.created_at;
    let uuid_b = incoming.uuid;

    let report = sync
        .import_spec_records(vec![incoming], &HashSet::new(), SyncSource::Jsonl)
        .await
        .unwrap();

    assert_eq!(report.collisions.len(), 1);
    assert_eq!(report.collisions[0].reason, "Same ID but different UUID");
    assert_eq!(report.collisions[0].resolution, "renumber");

    let keeper = Spec::find_by_id(&sync.db().pool, "SPEC-003").await.unwrap().unwrap();
    assert_eq!(keeper.uuid, uuid_a);
    let renumbered = Spec::find_by_id(&sync.db().pool, "SPEC-1003").await.unwrap().unwrap();
    assert_eq!(renumbered.uuid, uuid_b);
}

#[tokio::test]
async fn export_import_roundtrip_is_stable() {
    let td = tempfile::tempdir().unwrap();
    let sync = engine_in(td.path()).await;

    let mut spec = jsonl_spec("SPEC-001", "Storage layer");
    spec.tags = vec!["backend".to_string()];
    let issue = jsonl_issue("ISSUE-001", "Implement storage");
    sync.import_spec_records(vec![spec], &HashSet::new(), SyncSource::Jsonl).await.unwrap();
    sync.import_issue_records(vec![issue], &HashSet::new(), SyncSource::Jsonl).await.unwrap();

    let first_specs = fs::read_to_string(sync.layout().specs_jsonl()).unwrap();
    let first_issues = fs::read_to_string(sync.layout().issues_jsonl()).unwrap();

    // re-import what was exported: no id churn, no new writes
    let (spec_records, _) = read_jsonl::<JsonlSpec>(&sync.layout().specs_jsonl(), false).unwrap();
    let (issue_records, _) =
        read_jsonl::<JsonlIssue>(&sync.layout().issues_jsonl(), false).unwrap();
    let spec_report = sync
        .import_spec_records(spec_records, &HashSet::new(), SyncSource::Jsonl)
        .await
        .unwrap();
    let issue_report = sync
        .import_issue_records(issue_records, &HashSet::new(), SyncSource::Jsonl)
        .await
        .unwrap();

    assert!(spec_report.collisions.is_empty());
    assert_eq!(spec_report.created(), 0);
    assert_eq!(spec_report.updated(), 0);
    assert_eq!(issue_report.created(), 0);
    assert_eq!(issue_report.updated(), 0);

    assert_eq!(fs::read_to_string(sync.layout().specs_jsonl()).unwrap(), first_specs);
    assert_eq!(fs::read_to_string(sync.layout().issues_jsonl()).unwrap(), first_issues);
}

#[tokio::test]
async fn reconcile_detects_hand_edits_without_timestamp_bump() {
    let td = tempfile::tempdir().unwrap();
    let sync = engine_in(td.path()).await;

    sync.import_issue_records(
        vec![jsonl_issue("ISSUE-001", "before edit")],
        &HashSet::new(),
        SyncSource::Jsonl,
    )
    .await
    .unwrap();

    // hand-edit the title in the JSONL without touching updated_at
    let path = sync.layout().issues_jsonl();
    let edited = fs::read_to_string(&path).unwrap().replace("before edit", "after edit");
    fs::write(&path, edited).unwrap();

    let report = sync.reconcile_jsonl(EntityKind::Issue).await.unwrap();
    assert_eq!(report.updated(), 1);

    let issue = Issue::find_by_id(&sync.db().pool, "ISSUE-001").await.unwrap().unwrap();
    assert_eq!(issue.title, "after edit");
}

#[tokio::test]
async fn second_reconcile_of_unchanged_tree_writes_nothing() {
    let td = tempfile::tempdir().unwrap();
    let sync = engine_in(td.path()).await;

    sync.import_issue_records(
        vec![jsonl_issue("ISSUE-001", "steady")],
        &HashSet::new(),
        SyncSource::Jsonl,
    )
    .await
    .unwrap();

    let path = sync.layout().issues_jsonl();
    let mtime_before = fs::metadata(&path).unwrap().modified().unwrap();

    let report = sync.reconcile_jsonl(EntityKind::Issue).await.unwrap();
    assert_eq!(report.created() + report.updated(), 0);
    assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), mtime_before);
}

#[tokio::test]
async fn forward_parent_reference_resolves_in_second_pass() {
    let td = tempfile::tempdir().unwrap();
    let sync = engine_in(td.path()).await;

    let parent = jsonl_spec("SPEC-002", "parent");
    let mut child = jsonl_spec("SPEC-001", "child");
    child.parent_uuid = Some(parent.uuid);
    // child sorts first; its parent arrives later in the batch
    let report = sync
        .import_spec_records(vec![child.clone(), parent.clone()], &HashSet::new(), SyncSource::Jsonl)
        .await
        .unwrap();
    assert!(report.warnings.is_empty());

    let stored = Spec::find_by_id(&sync.db().pool, "SPEC-001").await.unwrap().unwrap();
    assert_eq!(stored.parent_uuid, Some(parent.uuid));
    // the parent attach did not disturb the imported timestamp
    assert_eq!(stored.updated_at, child.updated_at);
}

#[tokio::test]
async fn missing_relationship_endpoint_warns_but_commits() {
    let td = tempfile::tempdir().unwrap();
    let sync = engine_in(td.path()).await;

    let mut record = jsonl_issue("ISSUE-001", "has dangling edge");
    record.relationships.push(services::services::sync::records::JsonlRelationship {
        from: record.uuid,
        from_type: EntityKind::Issue,
        to: Uuid::new_v4(),
        to_type: EntityKind::Spec,
        rel_type: db::models::relationship::RelationshipType::Blocks,
    });

    let report = sync
        .import_issue_records(vec![record], &HashSet::new(), SyncSource::Jsonl)
        .await
        .unwrap();

    assert_eq!(report.created(), 1);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("missing endpoint"));
    assert!(Issue::find_by_id(&sync.db().pool, "ISSUE-001").await.unwrap().is_some());
}

#[tokio::test]
async fn markdown_projection_and_md_to_db_flow() {
    let td = tempfile::tempdir().unwrap();
    let sync = engine_in(td.path()).await;

    sync.import_issue_records(
        vec![jsonl_issue("ISSUE-001", "Fix login")],
        &HashSet::new(),
        SyncSource::Jsonl,
    )
    .await
    .unwrap();

    let md_path = sync.layout().issues_dir().join("fix_login.md");
    assert!(md_path.is_file());

    // the write that produced this file does not re-trigger a sync
    let content = fs::read_to_string(&md_path).unwrap();
    assert!(!sync.md_content_changed(&md_path, &content));

    // an edited file with a future mtime wins over the store
    let edited = content.replace("Body of ISSUE-001.", "Edited in an editor.");
    fs::write(&md_path, &edited).unwrap();
    filetime::set_file_mtime(
        &md_path,
        filetime::FileTime::from_unix_time((Utc::now() + Duration::seconds(30)).timestamp(), 0),
    )
    .unwrap();

    let outcome = sync.sync_markdown_file(EntityKind::Issue, &md_path).await.unwrap();
    assert_eq!(outcome, MdSyncOutcome::MdToDb);

    let issue = Issue::find_by_id(&sync.db().pool, "ISSUE-001").await.unwrap().unwrap();
    assert!(issue.content.contains("Edited in an editor."));
}

#[tokio::test]
async fn orphaned_markdown_files_are_deleted() {
    let td = tempfile::tempdir().unwrap();
    let sync = engine_in(td.path()).await;

    let orphan = sync.layout().issues_dir().join("ghost.md");
    fs::write(&orphan, "---\nid: ISSUE-999\ntitle: ghost\n---\n\nNobody owns me.\n").unwrap();
    let no_front = sync.layout().specs_dir().join("plain.md");
    fs::write(&no_front, "just text, no frontmatter\n").unwrap();

    let deleted = sync.sweep_orphans().await.unwrap();
    assert_eq!(deleted, 2);
    assert!(!orphan.exists());
    assert!(!no_front.exists());
}

#[tokio::test]
async fn feedback_accepts_legacy_field_names() {
    let td = tempfile::tempdir().unwrap();
    let sync = engine_in(td.path()).await;

    let now = Utc::now();
    let line = serde_json::json!({
        "id": "ISSUE-001",
        "uuid": Uuid::new_v4(),
        "title": "with feedback",
        "created_at": now,
        "updated_at": now,
        "feedback": [{
            "id": Uuid::new_v4(),
            "issue_id": "ISSUE-001",
            "feedback_type": "suggestion",
            "content": "tighten this up",
            "created_at": now,
            "updated_at": now
        }]
    });
    let record: JsonlIssue = serde_json::from_value(line).unwrap();
    assert_eq!(record.feedback[0].from_id.as_deref(), Some("ISSUE-001"));

    sync.import_issue_records(vec![record], &HashSet::new(), SyncSource::Jsonl).await.unwrap();

    let issue = Issue::find_by_id(&sync.db().pool, "ISSUE-001").await.unwrap().unwrap();
    let feedback =
        db::models::feedback::Feedback::list_for(&sync.db().pool, issue.uuid).await.unwrap();
    assert_eq!(feedback.len(), 1);
    // normalized to the canonical uuid reference on the way in
    assert_eq!(feedback[0].to_uuid, issue.uuid);

    // and written back in canonical form only
    let exported = fs::read_to_string(sync.layout().issues_jsonl()).unwrap();
    assert!(exported.contains("to_uuid"));
    assert!(!exported.contains("issue_id"));
}
