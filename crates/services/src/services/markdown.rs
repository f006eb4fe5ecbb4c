//! Markdown codec: YAML frontmatter between `---` delimiters, then the
//! body. The writer emits frontmatter keys in one canonical order so
//! repeated writes are textually stable.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utils::text::file_slug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MarkdownError {
    #[error("file has no frontmatter block")]
    MissingFrontmatter,
    #[error("frontmatter block never closes")]
    UnterminatedFrontmatter,
    #[error("invalid frontmatter: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub const FRONTMATTER_DELIMITER: &str = "---";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frontmatter {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub uuid: Option<Uuid>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkdownDoc {
    pub frontmatter: Frontmatter,
    pub body: String,
}

pub fn parse_markdown(content: &str) -> Result<MarkdownDoc, MarkdownError> {
    let mut lines = content.lines();
    if lines.next().map(str::trim) != Some(FRONTMATTER_DELIMITER) {
        return Err(MarkdownError::MissingFrontmatter);
    }

    let mut yaml_lines = Vec::new();
    let mut closed = false;
    let mut body_lines = Vec::new();
    for line in lines {
        if !closed {
            if line.trim() == FRONTMATTER_DELIMITER {
                closed = true;
            } else {
                yaml_lines.push(line);
            }
        } else {
            body_lines.push(line);
        }
    }
    if !closed {
        return Err(MarkdownError::UnterminatedFrontmatter);
    }

    let frontmatter: Frontmatter = serde_yaml::from_str(&yaml_lines.join("\n"))?;

    // drop the conventional blank line between frontmatter and body
    let body_start = usize::from(body_lines.first().is_some_and(|l| l.trim().is_empty()));
    let mut body = body_lines[body_start.min(body_lines.len())..].join("\n");
    if !body.is_empty() {
        body.push('\n');
    }

    Ok(MarkdownDoc { frontmatter, body })
}

pub fn render_markdown(doc: &MarkdownDoc) -> Result<String, MarkdownError> {
    // canonical key order: id, uuid, title, status, priority, tags
    let mut map = serde_yaml::Mapping::new();
    map.insert("id".into(), doc.frontmatter.id.clone().into());
    if let Some(uuid) = doc.frontmatter.uuid {
        map.insert("uuid".into(), uuid.to_string().into());
    }
    map.insert("title".into(), doc.frontmatter.title.clone().into());
    if let Some(status) = &doc.frontmatter.status {
        map.insert("status".into(), status.clone().into());
    }
    if let Some(priority) = doc.frontmatter.priority {
        map.insert("priority".into(), priority.into());
    }
    if !doc.frontmatter.tags.is_empty() {
        let tags: Vec<serde_yaml::Value> =
            doc.frontmatter.tags.iter().map(|t| t.clone().into()).collect();
        map.insert("tags".into(), serde_yaml::Value::Sequence(tags));
    }

    let yaml = serde_yaml::to_string(&map)?;
    let mut body = doc.body.clone();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }
    Ok(format!("{FRONTMATTER_DELIMITER}\n{yaml}{FRONTMATTER_DELIMITER}\n\n{body}"))
}

/// Find the file already holding this entity, checking the legacy naming
/// conventions in order: `<id>.md`, `<slug>.md`, `<slug>_<id>.md`. A
/// slug-only match counts only when its frontmatter id agrees (the slug may
/// belong to an unrelated entity with the same title).
pub fn find_entity_file(dir: &Path, id: &str, title: &str) -> Option<PathBuf> {
    let slug = file_slug(title, id);

    let id_only = dir.join(format!("{id}.md"));
    if id_only.is_file() {
        return Some(id_only);
    }

    let slug_only = dir.join(format!("{slug}.md"));
    if slug_only.is_file()
        && let Ok(content) = std::fs::read_to_string(&slug_only)
        && let Ok(doc) = parse_markdown(&content)
        && doc.frontmatter.id == id
    {
        return Some(slug_only);
    }

    let slug_id = dir.join(format!("{slug}_{id}.md"));
    if slug_id.is_file() {
        return Some(slug_id);
    }

    // last resort, covers files named under an earlier title: any document
    // in the directory claiming this id in its frontmatter
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        if let Ok(content) = std::fs::read_to_string(&path)
            && let Ok(doc) = parse_markdown(&content)
            && doc.frontmatter.id == id
        {
            return Some(path);
        }
    }

    None
}

/// Pick the path to write this entity to: an existing file when one
/// matches a known convention, else `<slug>.md`, with the id appended when
/// that name is taken by an unrelated entity.
pub fn resolve_entity_path(dir: &Path, id: &str, title: &str) -> PathBuf {
    if let Some(existing) = find_entity_file(dir, id, title) {
        return existing;
    }
    let slug = file_slug(title, id);
    let candidate = dir.join(format!("{slug}.md"));
    if candidate.exists() {
        dir.join(format!("{slug}_{id}.md"))
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, title: &str, body: &str) -> MarkdownDoc {
        MarkdownDoc {
            frontmatter: Frontmatter {
                id: id.to_string(),
                uuid: Some(Uuid::new_v4()),
                title: title.to_string(),
                status: Some("open".to_string()),
                priority: Some(1),
                tags: vec!["backend".to_string(), "auth".to_string()],
            },
            body: body.to_string(),
        }
    }

    #[test]
    fn render_then_parse_roundtrips() {
        let original = doc("ISSUE-001", "Fix login", "Steps to reproduce:\n\n1. log in\n");
        let rendered = render_markdown(&original).unwrap();
        let parsed = parse_markdown(&rendered).unwrap();
        assert_eq!(parsed.frontmatter, original.frontmatter);
        assert_eq!(parsed.body, original.body);
    }

    #[test]
    fn repeated_renders_are_byte_identical() {
        let original = doc("SPEC-001", "Storage layer", "Body.");
        let first = render_markdown(&original).unwrap();
        let reparsed = parse_markdown(&first).unwrap();
        let second = render_markdown(&reparsed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn layout_is_delim_yaml_delim_blank_body() {
        let rendered = render_markdown(&doc("SPEC-001", "T", "Body.")).unwrap();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "---");
        let close = lines.iter().skip(1).position(|l| *l == "---").unwrap() + 1;
        assert_eq!(lines[close + 1], "");
        assert_eq!(lines[close + 2], "Body.");
    }

    #[test]
    fn missing_or_unterminated_frontmatter_is_an_error() {
        assert!(matches!(parse_markdown("no frontmatter"), Err(MarkdownError::MissingFrontmatter)));
        assert!(matches!(
            parse_markdown("---\nid: X\ntitle: y"),
            Err(MarkdownError::UnterminatedFrontmatter)
        ));
    }

    #[test]
    fn filename_falls_back_to_id_for_symbol_titles() {
        let dir = tempfile::tempdir().unwrap();
        let path = resolve_entity_path(dir.path(), "SPEC-007", "!!!");
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "spec-007.md");
    }

    #[test]
    fn slug_collision_with_unrelated_entity_appends_id() {
        let dir = tempfile::tempdir().unwrap();
        let other = doc("ISSUE-001", "Fix login", "first claimant");
        std::fs::write(
            dir.path().join("fix_login.md"),
            render_markdown(&other).unwrap(),
        )
        .unwrap();

        let path = resolve_entity_path(dir.path(), "ISSUE-002", "Fix login");
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "fix_login_ISSUE-002.md");
    }

    #[test]
    fn renamed_titles_keep_their_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let owned = doc("ISSUE-009", "Original title", "body");
        std::fs::write(dir.path().join("original_title.md"), render_markdown(&owned).unwrap())
            .unwrap();

        // the slug no longer matches, but the file still claims the id
        let path = resolve_entity_path(dir.path(), "ISSUE-009", "Completely new title");
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "original_title.md");
    }

    #[test]
    fn existing_legacy_files_are_reused() {
        let dir = tempfile::tempdir().unwrap();

        // id-only convention
        std::fs::write(dir.path().join("ISSUE-003.md"), "---\nid: ISSUE-003\ntitle: t\n---\n\nx\n").unwrap();
        let path = resolve_entity_path(dir.path(), "ISSUE-003", "Anything");
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "ISSUE-003.md");

        // slug-only convention, verified by frontmatter id
        let owned = doc("ISSUE-004", "Improve cache", "body");
        std::fs::write(dir.path().join("improve_cache.md"), render_markdown(&owned).unwrap()).unwrap();
        let path = resolve_entity_path(dir.path(), "ISSUE-004", "Improve cache");
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "improve_cache.md");
    }
}
