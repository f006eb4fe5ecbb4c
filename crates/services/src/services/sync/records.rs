//! JSONL line shapes for specs and issues: entity fields plus assembled
//! relationships, tags and (for issues) feedback.

use chrono::{DateTime, Utc};
use db::models::{
    EntityKind,
    feedback::{Feedback, FeedbackAnchor, FeedbackType},
    issue::{Issue, IssueStatus},
    relationship::{Relationship, RelationshipType},
    spec::Spec,
};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use crate::services::jsonl::JsonlRecord;

fn is_false(value: &bool) -> bool {
    !*value
}

fn default_priority() -> i64 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonlRelationship {
    pub from: Uuid,
    pub from_type: EntityKind,
    pub to: Uuid,
    pub to_type: EntityKind,
    #[serde(rename = "type")]
    pub rel_type: RelationshipType,
}

impl JsonlRelationship {
    pub fn from_row(rel: &Relationship) -> Self {
        Self {
            from: rel.from_uuid,
            from_type: rel.from_type,
            to: rel.to_uuid,
            to_type: rel.to_type,
            rel_type: rel.rel_type,
        }
    }

    pub fn to_row(&self, created_at: DateTime<Utc>) -> Relationship {
        Relationship {
            from_uuid: self.from,
            from_type: self.from_type,
            to_uuid: self.to,
            to_type: self.to_type,
            rel_type: self.rel_type,
            created_at,
        }
    }
}

/// Feedback as serialized on an issue line. Older exports named the issue
/// reference `issue_id`, newer ones `from_id`; both are accepted on read
/// and only the canonical uuid form is written back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonlFeedback {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "issue_id")]
    pub from_id: Option<String>,
    #[serde(default)]
    pub feedback_type: FeedbackType,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<FeedbackAnchor>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub dismissed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JsonlFeedback {
    pub fn from_row(feedback: &Feedback) -> Self {
        Self {
            id: feedback.id,
            from_uuid: feedback.from_uuid,
            to_uuid: Some(feedback.to_uuid),
            from_id: None,
            feedback_type: feedback.feedback_type,
            content: feedback.content.clone(),
            anchor: feedback.anchor.as_ref().map(|a| a.0.clone()),
            dismissed: feedback.dismissed,
            created_at: feedback.created_at,
            updated_at: feedback.updated_at,
        }
    }

    /// Normalization pass at the edge: whatever naming the line used, the
    /// stored row points at the owning issue's uuid.
    pub fn to_row(&self, owner: Uuid) -> Feedback {
        Feedback {
            id: self.id,
            from_uuid: self.from_uuid,
            to_uuid: self.to_uuid.unwrap_or(owner),
            feedback_type: self.feedback_type,
            content: self.content.clone(),
            anchor: self.anchor.clone().map(Json),
            dismissed: self.dismissed,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonlSpec {
    pub id: String,
    pub uuid: Uuid,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    /// Absent, a non-empty array, or an explicit `null` used to clear.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_with::rust::double_option")]
    pub external_links: Option<Option<Vec<String>>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<JsonlRelationship>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl JsonlSpec {
    pub fn assemble(spec: &Spec, relationships: &[Relationship], tags: Vec<String>) -> Self {
        Self {
            id: spec.id.clone(),
            uuid: spec.uuid,
            title: spec.title.clone(),
            file_path: spec.file_path.clone(),
            content: spec.content.clone(),
            priority: spec.priority,
            parent_uuid: spec.parent_uuid,
            archived: spec.archived,
            archived_at: spec.archived_at,
            external_links: if spec.external_links.0.is_empty() {
                None
            } else {
                Some(Some(spec.external_links.0.clone()))
            },
            created_at: spec.created_at,
            updated_at: spec.updated_at,
            relationships: relationships.iter().map(JsonlRelationship::from_row).collect(),
            tags,
        }
    }

    /// Row form for first-pass creation; the parent link is attached in the
    /// second pass.
    pub fn to_new_row(&self) -> Spec {
        Spec {
            uuid: self.uuid,
            id: self.id.clone(),
            title: self.title.clone(),
            file_path: self.file_path.clone(),
            content: self.content.clone(),
            priority: self.priority,
            parent_uuid: None,
            archived: self.archived,
            archived_at: self.archived_at,
            external_links: Json(self.external_links.clone().flatten().unwrap_or_default()),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonlIssue {
    pub id: String,
    pub uuid: Uuid,
    pub title: String,
    #[serde(default)]
    pub status: IssueStatus,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_with::rust::double_option")]
    pub external_links: Option<Option<Vec<String>>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<JsonlRelationship>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feedback: Vec<JsonlFeedback>,
}

impl JsonlIssue {
    pub fn assemble(
        issue: &Issue,
        relationships: &[Relationship],
        tags: Vec<String>,
        feedback: &[Feedback],
    ) -> Self {
        Self {
            id: issue.id.clone(),
            uuid: issue.uuid,
            title: issue.title.clone(),
            status: issue.status,
            content: issue.content.clone(),
            priority: issue.priority,
            assignee: issue.assignee.clone(),
            parent_uuid: issue.parent_uuid,
            archived: issue.archived,
            archived_at: issue.archived_at,
            closed_at: issue.closed_at,
            external_links: if issue.external_links.0.is_empty() {
                None
            } else {
                Some(Some(issue.external_links.0.clone()))
            },
            created_at: issue.created_at,
            updated_at: issue.updated_at,
            relationships: relationships.iter().map(JsonlRelationship::from_row).collect(),
            tags,
            feedback: feedback.iter().map(JsonlFeedback::from_row).collect(),
        }
    }

    pub fn to_new_row(&self) -> Issue {
        Issue {
            uuid: self.uuid,
            id: self.id.clone(),
            title: self.title.clone(),
            status: self.status,
            content: self.content.clone(),
            priority: self.priority,
            assignee: self.assignee.clone(),
            parent_uuid: None,
            archived: self.archived,
            archived_at: self.archived_at,
            closed_at: self.closed_at,
            external_links: Json(self.external_links.clone().flatten().unwrap_or_default()),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl JsonlRecord for JsonlSpec {
    fn record_id(&self) -> &str {
        &self.id
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl JsonlRecord for JsonlIssue {
    fn record_id(&self) -> &str {
        &self.id
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

/// The pieces the collision resolver and change detector need, regardless
/// of entity kind.
pub trait ImportRecord {
    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn uuid(&self) -> Uuid;
    fn created_at(&self) -> DateTime<Utc>;
    fn updated_at(&self) -> DateTime<Utc>;
}

impl ImportRecord for JsonlSpec {
    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
    fn uuid(&self) -> Uuid {
        self.uuid
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl ImportRecord for JsonlIssue {
    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        let old_id = std::mem::replace(&mut self.id, id.clone());
        // keep embedded feedback references consistent with the renumber
        for feedback in &mut self.feedback {
            if feedback.from_id.as_deref() == Some(old_id.as_str()) {
                feedback.from_id = Some(id.clone());
            }
        }
    }
    fn uuid(&self) -> Uuid {
        self.uuid
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}
