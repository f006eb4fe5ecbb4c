//! JSONL import and export against the store.
//!
//! Import is two-pass inside one transaction so forward parent references
//! resolve: entities land without parents first, then parents are attached
//! without touching `updated_at`. Recoverable problems (missing
//! relationship endpoints, unknown parents) become warnings on the report;
//! the transaction still commits.

use std::collections::{HashMap, HashSet};

use db::{
    DBService,
    models::{
        EntityKind,
        entity_event::EntityEvent,
        feedback::Feedback,
        issue::{Issue, UpdateIssue},
        relationship::Relationship,
        spec::{Spec, UpdateSpec},
        tag::Tag,
    },
};
use serde::Serialize;
use uuid::Uuid;

use super::{
    SyncError,
    change::{EntityStamp, detect_changes},
    collision::{CollisionRecord, resolve_collisions},
    records::{JsonlIssue, JsonlSpec},
};
use crate::services::jsonl::write_jsonl;

#[derive(Debug, Default, Serialize)]
pub struct ImportReport {
    pub created_ids: Vec<String>,
    pub updated_ids: Vec<String>,
    pub unchanged: usize,
    pub collisions: Vec<CollisionRecord>,
    pub warnings: Vec<String>,
}

impl ImportReport {
    pub fn created(&self) -> usize {
        self.created_ids.len()
    }

    pub fn updated(&self) -> usize {
        self.updated_ids.len()
    }
}

pub(crate) async fn known_entity_uuids(db: &DBService) -> Result<HashSet<Uuid>, sqlx::Error> {
    let mut uuids = HashSet::new();
    let spec_rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT uuid FROM specs").fetch_all(&db.pool).await?;
    let issue_rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT uuid FROM issues").fetch_all(&db.pool).await?;
    uuids.extend(spec_rows.into_iter().map(|(u,)| u));
    uuids.extend(issue_rows.into_iter().map(|(u,)| u));
    Ok(uuids)
}

pub async fn import_specs(
    db: &DBService,
    mut incoming: Vec<JsonlSpec>,
    force_update: &HashSet<String>,
) -> Result<ImportReport, SyncError> {
    let existing = Spec::list(&db.pool, true).await?;
    let existing_live: HashMap<String, Uuid> = existing
        .iter()
        .filter(|s| !s.archived)
        .map(|s| (s.id.clone(), s.uuid))
        .collect();
    let all_ids: HashSet<String> = existing.iter().map(|s| s.id.clone()).collect();

    let collisions = resolve_collisions(&existing_live, &all_ids, &mut incoming);

    let before: Vec<EntityStamp> = existing
        .iter()
        .map(|s| EntityStamp { id: s.id.clone(), uuid: s.uuid, updated_at: s.updated_at })
        .collect();
    let after: Vec<EntityStamp> = incoming
        .iter()
        .map(|r| EntityStamp { id: r.id.clone(), uuid: r.uuid, updated_at: r.updated_at })
        .collect();
    let changes = detect_changes(&before, &after, force_update);
    let added: HashSet<Uuid> = changes.added.iter().copied().collect();
    let updated: HashSet<Uuid> = changes.updated.iter().copied().collect();

    let mut valid_endpoints = known_entity_uuids(db).await?;
    valid_endpoints.extend(incoming.iter().map(|r| r.uuid));

    let mut report = ImportReport {
        unchanged: changes.unchanged.len(),
        collisions,
        ..Default::default()
    };

    let mut tx = db.pool.begin().await?;

    // pass 1: create without parents so forward references cannot trip
    for record in incoming.iter().filter(|r| added.contains(&r.uuid)) {
        Spec::insert(&mut *tx, &record.to_new_row()).await?;
        EntityEvent::record(&mut *tx, record.uuid, EntityKind::Spec, "created", None).await?;
        report.created_ids.push(record.id.clone());
    }

    // pass 2: attach parents, preserving updated_at
    for record in incoming.iter().filter(|r| added.contains(&r.uuid)) {
        if let Some(parent) = record.parent_uuid {
            if valid_endpoints.contains(&parent) {
                Spec::set_parent_preserving_timestamps(&mut *tx, record.uuid, Some(parent))
                    .await?;
            } else {
                report
                    .warnings
                    .push(format!("{}: parent {parent} does not exist, left unset", record.id));
            }
        }
    }

    for record in incoming.iter().filter(|r| updated.contains(&r.uuid)) {
        let parent_patch = match record.parent_uuid {
            Some(parent) if !valid_endpoints.contains(&parent) => {
                report
                    .warnings
                    .push(format!("{}: parent {parent} does not exist, left unchanged", record.id));
                None
            }
            other => Some(other),
        };
        let patch = UpdateSpec {
            title: Some(record.title.clone()),
            content: Some(record.content.clone()),
            priority: Some(record.priority),
            file_path: Some(record.file_path.clone()),
            parent_uuid: parent_patch,
            external_links: record.external_links.clone(),
            archived: Some(record.archived),
            updated_at: Some(record.updated_at),
        };
        Spec::update(&mut *tx, record.uuid, &patch).await?;
        EntityEvent::record(&mut *tx, record.uuid, EntityKind::Spec, "updated", None).await?;
        report.updated_ids.push(record.id.clone());
    }

    // outgoing edges and tags are replaced wholesale for touched entities;
    // incoming edges from other entities are preserved
    for record in incoming.iter().filter(|r| added.contains(&r.uuid) || updated.contains(&r.uuid)) {
        Relationship::delete_outgoing(&mut *tx, record.uuid).await?;
        for rel in &record.relationships {
            if valid_endpoints.contains(&rel.from) && valid_endpoints.contains(&rel.to) {
                Relationship::insert(&mut *tx, &rel.to_row(record.updated_at)).await?;
            } else {
                report.warnings.push(format!(
                    "{}: relationship {} -> {} has a missing endpoint, skipped",
                    record.id, rel.from, rel.to
                ));
            }
        }

        Tag::delete_all_for(&mut *tx, record.uuid).await?;
        for tag in &record.tags {
            Tag::add(&mut *tx, record.uuid, EntityKind::Spec, tag).await?;
        }
    }

    tx.commit().await?;
    Ok(report)
}

pub async fn import_issues(
    db: &DBService,
    mut incoming: Vec<JsonlIssue>,
    force_update: &HashSet<String>,
) -> Result<ImportReport, SyncError> {
    let existing = Issue::list(&db.pool, true).await?;
    let existing_live: HashMap<String, Uuid> = existing
        .iter()
        .filter(|i| !i.archived)
        .map(|i| (i.id.clone(), i.uuid))
        .collect();
    let all_ids: HashSet<String> = existing.iter().map(|i| i.id.clone()).collect();

    let collisions = resolve_collisions(&existing_live, &all_ids, &mut incoming);

    let before: Vec<EntityStamp> = existing
        .iter()
        .map(|i| EntityStamp { id: i.id.clone(), uuid: i.uuid, updated_at: i.updated_at })
        .collect();
    let after: Vec<EntityStamp> = incoming
        .iter()
        .map(|r| EntityStamp { id: r.id.clone(), uuid: r.uuid, updated_at: r.updated_at })
        .collect();
    let changes = detect_changes(&before, &after, force_update);
    let added: HashSet<Uuid> = changes.added.iter().copied().collect();
    let updated: HashSet<Uuid> = changes.updated.iter().copied().collect();

    let mut valid_endpoints = known_entity_uuids(db).await?;
    valid_endpoints.extend(incoming.iter().map(|r| r.uuid));

    let mut report = ImportReport {
        unchanged: changes.unchanged.len(),
        collisions,
        ..Default::default()
    };

    let mut tx = db.pool.begin().await?;

    for record in incoming.iter().filter(|r| added.contains(&r.uuid)) {
        Issue::insert(&mut *tx, &record.to_new_row()).await?;
        EntityEvent::record(&mut *tx, record.uuid, EntityKind::Issue, "created", None).await?;
        report.created_ids.push(record.id.clone());
    }

    for record in incoming.iter().filter(|r| added.contains(&r.uuid)) {
        if let Some(parent) = record.parent_uuid {
            if valid_endpoints.contains(&parent) {
                Issue::set_parent_preserving_timestamps(&mut *tx, record.uuid, Some(parent))
                    .await?;
            } else {
                report
                    .warnings
                    .push(format!("{}: parent {parent} does not exist, left unset", record.id));
            }
        }
    }

    for record in incoming.iter().filter(|r| updated.contains(&r.uuid)) {
        let parent_patch = match record.parent_uuid {
            Some(parent) if !valid_endpoints.contains(&parent) => {
                report
                    .warnings
                    .push(format!("{}: parent {parent} does not exist, left unchanged", record.id));
                None
            }
            other => Some(other),
        };
        let patch = UpdateIssue {
            title: Some(record.title.clone()),
            content: Some(record.content.clone()),
            status: Some(record.status),
            priority: Some(record.priority),
            assignee: Some(record.assignee.clone()),
            parent_uuid: parent_patch,
            external_links: record.external_links.clone(),
            archived: Some(record.archived),
            updated_at: Some(record.updated_at),
        };
        Issue::update(&mut *tx, record.uuid, &patch).await?;
        EntityEvent::record(&mut *tx, record.uuid, EntityKind::Issue, "updated", None).await?;
        report.updated_ids.push(record.id.clone());
    }

    for record in incoming.iter().filter(|r| added.contains(&r.uuid) || updated.contains(&r.uuid)) {
        Relationship::delete_outgoing(&mut *tx, record.uuid).await?;
        for rel in &record.relationships {
            if valid_endpoints.contains(&rel.from) && valid_endpoints.contains(&rel.to) {
                Relationship::insert(&mut *tx, &rel.to_row(record.updated_at)).await?;
            } else {
                report.warnings.push(format!(
                    "{}: relationship {} -> {} has a missing endpoint, skipped",
                    record.id, rel.from, rel.to
                ));
            }
        }

        Tag::delete_all_for(&mut *tx, record.uuid).await?;
        for tag in &record.tags {
            Tag::add(&mut *tx, record.uuid, EntityKind::Issue, tag).await?;
        }

        // feedback is replaced from the incoming list, normalized to the
        // canonical field shape
        Feedback::delete_for(&mut *tx, record.uuid).await?;
        for feedback in &record.feedback {
            Feedback::insert(&mut *tx, &feedback.to_row(record.uuid)).await?;
        }
    }

    tx.commit().await?;
    Ok(report)
}

/// Assemble every spec with its tags and outgoing edges and write the
/// collection file. Returns whether the file actually changed.
pub async fn export_specs(
    db: &DBService,
    path: &std::path::Path,
) -> Result<bool, SyncError> {
    let specs = Spec::list(&db.pool, true).await?;
    let mut lines = Vec::with_capacity(specs.len());
    for spec in &specs {
        let relationships = Relationship::outgoing(&db.pool, spec.uuid).await?;
        let tags = Tag::list_for(&db.pool, spec.uuid).await?;
        lines.push(JsonlSpec::assemble(spec, &relationships, tags));
    }
    Ok(write_jsonl(path, &lines)?)
}

pub async fn export_issues(
    db: &DBService,
    path: &std::path::Path,
) -> Result<bool, SyncError> {
    let issues = Issue::list(&db.pool, true).await?;
    let mut lines = Vec::with_capacity(issues.len());
    for issue in &issues {
        let relationships = Relationship::outgoing(&db.pool, issue.uuid).await?;
        let tags = Tag::list_for(&db.pool, issue.uuid).await?;
        let feedback = Feedback::list_for(&db.pool, issue.uuid).await?;
        lines.push(JsonlIssue::assemble(issue, &relationships, tags, &feedback));
    }
    Ok(write_jsonl(path, &lines)?)
}
