//! The sync engine: reconciles the SQL store, the markdown tree and the
//! JSONL snapshots, with the store as the authoritative relational state.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use db::{
    DBService,
    models::{
        EntityKind,
        entity_event::EntityEvent,
        feedback::Feedback,
        issue::{CreateIssue, Issue, UpdateIssue},
        relationship::Relationship,
        spec::{CreateSpec, Spec, UpdateSpec},
        tag::Tag,
    },
};
use serde_json::json;
use thiserror::Error;
use utils::{
    canonical::{canonical_hash, content_hash},
    path::DataLayout,
};
pub mod change;
pub mod collision;
pub mod import;
pub mod md_sync;
pub mod records;

use import::ImportReport;
use records::{JsonlIssue, JsonlSpec};

use crate::services::{
    events::{EventBus, SyncSource, names},
    jsonl::{JsonlError, read_jsonl},
    markdown::{MarkdownError, parse_markdown, render_markdown, resolve_entity_path},
    meta::{CollisionLogEntry, MetaError, MetaFile},
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Jsonl(#[from] JsonlError),
    #[error(transparent)]
    Markdown(#[from] MarkdownError),
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no {kind} with id {id}")]
    NotFound { kind: EntityKind, id: String },
}

/// What one markdown file sync did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdSyncOutcome {
    /// No frontmatter id, or the id matches no live entity; file deleted.
    Orphaned,
    NoChange,
    DbToMd,
    MdToDb,
}

pub struct SyncEngine {
    db: DBService,
    layout: DataLayout,
    bus: EventBus,
    /// Oscillation guard: content hash of the last markdown text this
    /// engine wrote or accepted, keyed by absolute path.
    md_hashes: DashMap<PathBuf, String>,
    /// Canonical entity hashes from the last observed JSONL state, id → hash.
    spec_hashes: DashMap<String, String>,
    issue_hashes: DashMap<String, String>,
    meta: tokio::sync::Mutex<MetaFile>,
}

impl SyncEngine {
    pub fn new(db: DBService, layout: DataLayout, bus: EventBus) -> Result<Self, SyncError> {
        let meta = MetaFile::load_or_default(&layout.meta_file())?;
        Ok(Self {
            db,
            layout,
            bus,
            md_hashes: DashMap::new(),
            spec_hashes: DashMap::new(),
            issue_hashes: DashMap::new(),
            meta: tokio::sync::Mutex::new(meta),
        })
    }

    pub fn db(&self) -> &DBService {
        &self.db
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ---- API-driven mutations ----

    pub async fn create_spec(&self, data: CreateSpec) -> Result<Spec, SyncError> {
        let id = {
            let mut meta = self.meta.lock().await;
            let id = meta.next_spec_id();
            meta.save()?;
            id
        };
        let spec = Spec::new(id, &data);

        let mut tx = self.db.pool.begin().await?;
        Spec::insert(&mut *tx, &spec).await?;
        EntityEvent::record(&mut *tx, spec.uuid, EntityKind::Spec, "created", None).await?;
        tx.commit().await?;

        self.bus.emit(&names::filesystem(EntityKind::Spec, "created"), json!({"id": spec.id}));
        self.bus.emit_entity_sync(
            EntityKind::Spec,
            &spec.id,
            "created",
            SyncSource::Database,
            None,
        );
        self.write_projections().await?;
        Ok(spec)
    }

    pub async fn create_issue(&self, data: CreateIssue) -> Result<Issue, SyncError> {
        let id = {
            let mut meta = self.meta.lock().await;
            let id = meta.next_issue_id();
            meta.save()?;
            id
        };
        let issue = Issue::new(id, &data);

        let mut tx = self.db.pool.begin().await?;
        Issue::insert(&mut *tx, &issue).await?;
        EntityEvent::record(&mut *tx, issue.uuid, EntityKind::Issue, "created", None).await?;
        tx.commit().await?;

        self.bus.emit(&names::filesystem(EntityKind::Issue, "created"), json!({"id": issue.id}));
        self.bus.emit_entity_sync(
            EntityKind::Issue,
            &issue.id,
            "created",
            SyncSource::Database,
            None,
        );
        self.write_projections().await?;
        Ok(issue)
    }

    pub async fn update_issue(&self, id: &str, patch: UpdateIssue) -> Result<Issue, SyncError> {
        let issue = Issue::find_by_id(&self.db.pool, id)
            .await?
            .ok_or_else(|| SyncError::NotFound { kind: EntityKind::Issue, id: id.to_string() })?;

        let status_change = patch.status.filter(|next| *next != issue.status);

        let mut tx = self.db.pool.begin().await?;
        Issue::update(&mut *tx, issue.uuid, &patch).await?;
        EntityEvent::record(&mut *tx, issue.uuid, EntityKind::Issue, "updated", None).await?;
        tx.commit().await?;

        if let Some(next) = status_change {
            self.bus.emit(
                names::ISSUE_STATUS_CHANGED,
                json!({"id": issue.id, "from": issue.status, "to": next}),
            );
        }
        self.bus.emit_entity_sync(
            EntityKind::Issue,
            &issue.id,
            "updated",
            SyncSource::Database,
            None,
        );
        self.write_projections().await?;

        Issue::find_by_uuid(&self.db.pool, issue.uuid)
            .await?
            .ok_or_else(|| SyncError::NotFound { kind: EntityKind::Issue, id: id.to_string() })
    }

    pub async fn update_spec(&self, id: &str, patch: UpdateSpec) -> Result<Spec, SyncError> {
        let spec = Spec::find_by_id(&self.db.pool, id)
            .await?
            .ok_or_else(|| SyncError::NotFound { kind: EntityKind::Spec, id: id.to_string() })?;

        let mut tx = self.db.pool.begin().await?;
        Spec::update(&mut *tx, spec.uuid, &patch).await?;
        EntityEvent::record(&mut *tx, spec.uuid, EntityKind::Spec, "updated", None).await?;
        tx.commit().await?;

        self.bus.emit_entity_sync(
            EntityKind::Spec,
            &spec.id,
            "updated",
            SyncSource::Database,
            None,
        );
        self.write_projections().await?;

        Spec::find_by_uuid(&self.db.pool, spec.uuid)
            .await?
            .ok_or_else(|| SyncError::NotFound { kind: EntityKind::Spec, id: id.to_string() })
    }

    /// Insert a relationship; a missing endpoint demotes to a warning
    /// string instead of failing.
    pub async fn add_relationship(
        &self,
        rel: Relationship,
    ) -> Result<Option<String>, SyncError> {
        let endpoints = import::known_entity_uuids(&self.db).await?;
        if !endpoints.contains(&rel.from_uuid) || !endpoints.contains(&rel.to_uuid) {
            let warning = format!(
                "relationship {} -> {} has a missing endpoint, skipped",
                rel.from_uuid, rel.to_uuid
            );
            tracing::warn!("{warning}");
            return Ok(Some(warning));
        }
        Relationship::insert(&self.db.pool, &rel).await?;
        self.bus.emit(
            names::RELATIONSHIP_CREATED,
            json!({"from": rel.from_uuid, "to": rel.to_uuid, "relationship": rel.rel_type}),
        );
        self.write_projections().await?;
        Ok(None)
    }

    pub async fn add_feedback(&self, feedback: Feedback) -> Result<(), SyncError> {
        Feedback::insert(&self.db.pool, &feedback).await?;
        self.bus.emit(
            names::FEEDBACK_CREATED,
            json!({"id": feedback.id, "to": feedback.to_uuid}),
        );
        self.write_projections().await?;
        Ok(())
    }

    // ---- JSONL import / reconciliation ----

    pub async fn import_spec_records(
        &self,
        records: Vec<JsonlSpec>,
        force_update: &HashSet<String>,
        source: SyncSource,
    ) -> Result<ImportReport, SyncError> {
        let report = import::import_specs(&self.db, records, force_update).await?;
        self.finish_import(EntityKind::Spec, &report, source).await?;
        Ok(report)
    }

    pub async fn import_issue_records(
        &self,
        records: Vec<JsonlIssue>,
        force_update: &HashSet<String>,
        source: SyncSource,
    ) -> Result<ImportReport, SyncError> {
        let report = import::import_issues(&self.db, records, force_update).await?;
        self.finish_import(EntityKind::Issue, &report, source).await?;
        Ok(report)
    }

    async fn finish_import(
        &self,
        kind: EntityKind,
        report: &ImportReport,
        source: SyncSource,
    ) -> Result<(), SyncError> {
        {
            let mut meta = self.meta.lock().await;
            for id in report.created_ids.iter().chain(report.updated_ids.iter()) {
                meta.observe_id(id);
            }
            for collision in &report.collisions {
                meta.observe_id(&collision.new_id);
                meta.log_collision(CollisionLogEntry {
                    old_id: collision.old_id.clone(),
                    new_id: collision.new_id.clone(),
                    uuid: collision.incoming_uuid,
                    reason: collision.reason.clone(),
                    resolution: collision.resolution.clone(),
                    resolved_at: Utc::now(),
                });
            }
            meta.save()?;
        }

        for warning in &report.warnings {
            tracing::warn!("import warning: {warning}");
        }
        for id in &report.created_ids {
            self.bus.emit(&names::filesystem(kind, "created"), json!({"id": id}));
            self.bus.emit_entity_sync(kind, id, "created", source, None);
        }
        for id in &report.updated_ids {
            self.bus.emit(&names::filesystem(kind, "updated"), json!({"id": id}));
            self.bus.emit_entity_sync(kind, id, "updated", source, None);
        }

        // write back both projections so renumbered ids and derived files
        // settle immediately
        self.write_projections().await?;
        Ok(())
    }

    /// Watcher entry point for a changed collection file: canonical hashes
    /// decide which entities really changed, so hand edits that kept their
    /// `updated_at` still propagate (via `force_update`).
    pub async fn reconcile_jsonl(&self, kind: EntityKind) -> Result<ImportReport, SyncError> {
        match kind {
            EntityKind::Spec => {
                let (records, _) =
                    read_jsonl::<JsonlSpec>(&self.layout.specs_jsonl(), true)?;
                let force = stale_ids(&self.spec_hashes, records.iter().map(|r| {
                    (r.id.clone(), canonical_hash(&serde_json::to_value(r).unwrap_or_default()))
                }));
                self.import_spec_records(records, &force, SyncSource::Jsonl).await
            }
            EntityKind::Issue => {
                let (records, _) =
                    read_jsonl::<JsonlIssue>(&self.layout.issues_jsonl(), true)?;
                let force = stale_ids(&self.issue_hashes, records.iter().map(|r| {
                    (r.id.clone(), canonical_hash(&serde_json::to_value(r).unwrap_or_default()))
                }));
                self.import_issue_records(records, &force, SyncSource::Jsonl).await
            }
        }
    }

    /// Prime the per-entity hash caches from current file content so the
    /// first watcher event after launch does not look like a change to
    /// every entity.
    pub fn prime_jsonl_caches(&self) -> Result<(), SyncError> {
        let (specs, _) = read_jsonl::<JsonlSpec>(&self.layout.specs_jsonl(), true)?;
        self.spec_hashes.clear();
        for record in &specs {
            let hash = canonical_hash(&serde_json::to_value(record).unwrap_or_default());
            self.spec_hashes.insert(record.id.clone(), hash);
        }

        let (issues, _) = read_jsonl::<JsonlIssue>(&self.layout.issues_jsonl(), true)?;
        self.issue_hashes.clear();
        for record in &issues {
            let hash = canonical_hash(&serde_json::to_value(record).unwrap_or_default());
            self.issue_hashes.insert(record.id.clone(), hash);
        }
        Ok(())
    }

    // ---- markdown sync ----

    /// Reconcile one markdown file with the store, newest side winning.
    pub async fn sync_markdown_file(
        &self,
        kind: EntityKind,
        path: &Path,
    ) -> Result<MdSyncOutcome, SyncError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // the store is authoritative for existence; a vanished file
                // does not delete the entity
                tracing::info!("markdown file vanished, ignoring: {}", path.display());
                return Ok(MdSyncOutcome::NoChange);
            }
            Err(e) => return Err(e.into()),
        };

        let doc = match parse_markdown(&content) {
            Ok(doc) if !doc.frontmatter.id.is_empty() => doc,
            _ => {
                self.delete_orphan(path);
                return Ok(MdSyncOutcome::Orphaned);
            }
        };

        match kind {
            EntityKind::Spec => self.sync_spec_markdown(path, &content, doc).await,
            EntityKind::Issue => self.sync_issue_markdown(path, &content, doc).await,
        }
    }

    async fn sync_spec_markdown(
        &self,
        path: &Path,
        content: &str,
        doc: crate::services::markdown::MarkdownDoc,
    ) -> Result<MdSyncOutcome, SyncError> {
        let Some(spec) = Spec::find_by_id(&self.db.pool, &doc.frontmatter.id).await? else {
            self.delete_orphan(path);
            return Ok(MdSyncOutcome::Orphaned);
        };

        if md_sync::doc_matches_spec(&doc, &spec) {
            self.md_hashes.insert(path.to_path_buf(), content_hash(content));
            return Ok(MdSyncOutcome::NoChange);
        }

        if !self.md_content_changed(path, content) {
            return Ok(MdSyncOutcome::NoChange);
        }

        let file_mtime = file_mtime_utc(path)?;
        if spec.updated_at > file_mtime {
            self.write_spec_markdown(&spec).await?;
            self.bus.emit_entity_sync(
                EntityKind::Spec,
                &spec.id,
                "updated",
                SyncSource::Database,
                None,
            );
            Ok(MdSyncOutcome::DbToMd)
        } else {
            let patch = UpdateSpec {
                title: Some(doc.frontmatter.title.clone()),
                content: Some(doc.body.clone()),
                priority: doc.frontmatter.priority,
                updated_at: Some(file_mtime),
                ..Default::default()
            };
            let mut tx = self.db.pool.begin().await?;
            Spec::update(&mut *tx, spec.uuid, &patch).await?;
            EntityEvent::record(&mut *tx, spec.uuid, EntityKind::Spec, "updated", None).await?;
            tx.commit().await?;

            self.md_hashes.insert(path.to_path_buf(), content_hash(content));
            self.bus.emit(&names::filesystem(EntityKind::Spec, "updated"), json!({"id": spec.id}));
            self.bus.emit_entity_sync(
                EntityKind::Spec,
                &spec.id,
                "updated",
                SyncSource::Markdown,
                None,
            );
            self.export_jsonl().await?;
            Ok(MdSyncOutcome::MdToDb)
        }
    }

    async fn sync_issue_markdown(
        &self,
        path: &Path,
        content: &str,
        doc: crate::services::markdown::MarkdownDoc,
    ) -> Result<MdSyncOutcome, SyncError> {
        let Some(issue) = Issue::find_by_id(&self.db.pool, &doc.frontmatter.id).await? else {
            self.delete_orphan(path);
            return Ok(MdSyncOutcome::Orphaned);
        };

        if md_sync::doc_matches_issue(&doc, &issue) {
            self.md_hashes.insert(path.to_path_buf(), content_hash(content));
            return Ok(MdSyncOutcome::NoChange);
        }

        if !self.md_content_changed(path, content) {
            return Ok(MdSyncOutcome::NoChange);
        }

        let file_mtime = file_mtime_utc(path)?;
        if issue.updated_at > file_mtime {
            self.write_issue_markdown(&issue).await?;
            self.bus.emit_entity_sync(
                EntityKind::Issue,
                &issue.id,
                "updated",
                SyncSource::Database,
                None,
            );
            Ok(MdSyncOutcome::DbToMd)
        } else {
            let status = doc
                .frontmatter
                .status
                .as_deref()
                .and_then(|s| s.parse().ok());
            let status_change = status.filter(|next| *next != issue.status);
            let patch = UpdateIssue {
                title: Some(doc.frontmatter.title.clone()),
                content: Some(doc.body.clone()),
                status,
                priority: doc.frontmatter.priority,
                updated_at: Some(file_mtime),
                ..Default::default()
            };
            let mut tx = self.db.pool.begin().await?;
            Issue::update(&mut *tx, issue.uuid, &patch).await?;
            EntityEvent::record(&mut *tx, issue.uuid, EntityKind::Issue, "updated", None).await?;
            tx.commit().await?;

            if let Some(next) = status_change {
                self.bus.emit(
                    names::ISSUE_STATUS_CHANGED,
                    json!({"id": issue.id, "from": issue.status, "to": next}),
                );
            }
            self.md_hashes.insert(path.to_path_buf(), content_hash(content));
            self.bus
                .emit(&names::filesystem(EntityKind::Issue, "updated"), json!({"id": issue.id}));
            self.bus.emit_entity_sync(
                EntityKind::Issue,
                &issue.id,
                "updated",
                SyncSource::Markdown,
                None,
            );
            self.export_jsonl().await?;
            Ok(MdSyncOutcome::MdToDb)
        }
    }

    /// Oscillation guard: has this file's content changed since the hash
    /// we last recorded for its path?
    pub fn md_content_changed(&self, path: &Path, content: &str) -> bool {
        let hash = content_hash(content);
        self.md_hashes.get(path).map(|cached| *cached != hash).unwrap_or(true)
    }

    fn delete_orphan(&self, path: &Path) {
        // best-effort: orphan cleanup logs, never fails
        match std::fs::remove_file(path) {
            Ok(()) => tracing::info!("deleted orphaned markdown file {}", path.display()),
            Err(e) => tracing::warn!("could not delete orphan {}: {e}", path.display()),
        }
        self.md_hashes.remove(path);
    }

    /// Startup sweep: delete markdown files whose frontmatter id does not
    /// refer to a live store entity.
    pub async fn sweep_orphans(&self) -> Result<usize, SyncError> {
        let mut deleted = 0;
        for (kind, dir) in
            [(EntityKind::Spec, self.layout.specs_dir()), (EntityKind::Issue, self.layout.issues_dir())]
        {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("md") {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(&path) else {
                    continue;
                };
                let id = parse_markdown(&content)
                    .ok()
                    .map(|doc| doc.frontmatter.id)
                    .unwrap_or_default();
                let live = match kind {
                    EntityKind::Spec => {
                        !id.is_empty() && Spec::find_by_id(&self.db.pool, &id).await?.is_some()
                    }
                    EntityKind::Issue => {
                        !id.is_empty() && Issue::find_by_id(&self.db.pool, &id).await?.is_some()
                    }
                };
                if !live {
                    self.delete_orphan(&path);
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    // ---- projections ----

    /// Write the markdown tree and both JSONL collections from the store.
    /// Markdown goes first: writing it can assign spec file paths, which
    /// the JSONL export must already see.
    pub async fn write_projections(&self) -> Result<(), SyncError> {
        for spec in Spec::list(&self.db.pool, false).await? {
            self.write_spec_markdown(&spec).await?;
        }
        for issue in Issue::list(&self.db.pool, false).await? {
            self.write_issue_markdown(&issue).await?;
        }
        self.export_jsonl().await?;
        Ok(())
    }

    pub async fn export_jsonl(&self) -> Result<(), SyncError> {
        import::export_specs(&self.db, &self.layout.specs_jsonl()).await?;
        import::export_issues(&self.db, &self.layout.issues_jsonl()).await?;
        // the export is now the observed JSONL state
        self.prime_jsonl_caches()?;
        Ok(())
    }

    async fn write_spec_markdown(&self, spec: &Spec) -> Result<(), SyncError> {
        let dir = self.layout.specs_dir();
        std::fs::create_dir_all(&dir)?;
        let path = resolve_entity_path(&dir, &spec.id, &spec.title);
        let tags = Tag::list_for(&self.db.pool, spec.uuid).await?;
        let rendered = render_markdown(&md_sync::spec_to_doc(spec, tags))?;

        if std::fs::read_to_string(&path).map(|c| c == rendered).unwrap_or(false) {
            return Ok(());
        }
        std::fs::write(&path, &rendered)?;
        self.md_hashes.insert(path.clone(), content_hash(&rendered));

        let relative = format!(
            "specs/{}",
            path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
        );
        if spec.file_path.as_deref() != Some(relative.as_str()) {
            Spec::set_file_path(&self.db.pool, spec.uuid, Some(&relative)).await?;
        }
        Ok(())
    }

    async fn write_issue_markdown(&self, issue: &Issue) -> Result<(), SyncError> {
        let dir = self.layout.issues_dir();
        std::fs::create_dir_all(&dir)?;
        let path = resolve_entity_path(&dir, &issue.id, &issue.title);
        let tags = Tag::list_for(&self.db.pool, issue.uuid).await?;
        let rendered = render_markdown(&md_sync::issue_to_doc(issue, tags))?;

        if std::fs::read_to_string(&path).map(|c| c == rendered).unwrap_or(false) {
            return Ok(());
        }
        std::fs::write(&path, &rendered)?;
        self.md_hashes.insert(path.clone(), content_hash(&rendered));
        Ok(())
    }
}

fn stale_ids(
    cache: &DashMap<String, String>,
    current: impl Iterator<Item = (String, String)>,
) -> HashSet<String> {
    let mut force = HashSet::new();
    let mut fresh = Vec::new();
    for (id, hash) in current {
        let changed = cache.get(&id).map(|cached| *cached != hash).unwrap_or(true);
        if changed {
            force.insert(id.clone());
        }
        fresh.push((id, hash));
    }
    cache.clear();
    for (id, hash) in fresh {
        cache.insert(id, hash);
    }
    force
}

fn file_mtime_utc(path: &Path) -> Result<DateTime<Utc>, std::io::Error> {
    Ok(DateTime::<Utc>::from(std::fs::metadata(path)?.modified()?))
}
