//! Projections between store entities and their markdown documents.

use db::models::{issue::Issue, spec::Spec};

use crate::services::markdown::{Frontmatter, MarkdownDoc};

pub fn spec_to_doc(spec: &Spec, tags: Vec<String>) -> MarkdownDoc {
    MarkdownDoc {
        frontmatter: Frontmatter {
            id: spec.id.clone(),
            uuid: Some(spec.uuid),
            title: spec.title.clone(),
            status: None,
            priority: Some(spec.priority),
            tags,
        },
        body: spec.content.clone(),
    }
}

pub fn issue_to_doc(issue: &Issue, tags: Vec<String>) -> MarkdownDoc {
    MarkdownDoc {
        frontmatter: Frontmatter {
            id: issue.id.clone(),
            uuid: Some(issue.uuid),
            title: issue.title.clone(),
            status: Some(issue.status.to_string()),
            priority: Some(issue.priority),
            tags,
        },
        body: issue.content.clone(),
    }
}

/// The file and the store agree when title, trimmed body and priority
/// match (plus status for issues); timestamps are deliberately ignored.
pub fn doc_matches_spec(doc: &MarkdownDoc, spec: &Spec) -> bool {
    doc.frontmatter.title == spec.title
        && doc.body.trim() == spec.content.trim()
        && doc.frontmatter.priority.unwrap_or(spec.priority) == spec.priority
}

pub fn doc_matches_issue(doc: &MarkdownDoc, issue: &Issue) -> bool {
    doc.frontmatter.title == issue.title
        && doc.body.trim() == issue.content.trim()
        && doc.frontmatter.priority.unwrap_or(issue.priority) == issue.priority
        && doc
            .frontmatter
            .status
            .as_deref()
            .is_none_or(|status| status == issue.status.to_string())
}
