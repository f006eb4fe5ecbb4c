//! Merge-conflict detection and classification, plus the timestamp-based
//! auto-resolver for JSONL collection files.
//!
//! Detection is a dry-run three-way merge (`git merge-tree`) that never
//! touches a working tree. Conflicted JSONL files under the data directory
//! are auto-resolvable line-by-line (newer `updated_at` wins); everything
//! else needs a human.

use std::{path::Path, sync::LazyLock};

use chrono::{DateTime, NaiveDateTime, Utc};
use git::{GitCli, GitCliError};
use regex::Regex;
use serde::Serialize;
use utils::path::DATA_DIR_NAME;

static UPDATED_AT_RE: LazyLock<Regex> = LazyLock::new(|| {
    // tolerate double-quoted, single-quoted, or bare values
    Regex::new(r#"["']?updated_at["']?\s*:\s*["']?([^"',}]+)"#).unwrap()
});

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConflictFile {
    pub path: String,
    pub auto_resolvable: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct ConflictReport {
    pub jsonl_conflicts: Vec<ConflictFile>,
    pub code_conflicts: Vec<ConflictFile>,
}

impl ConflictReport {
    pub fn has_conflicts(&self) -> bool {
        !self.jsonl_conflicts.is_empty() || !self.code_conflicts.is_empty()
    }

    /// True when every conflict can be resolved without human action.
    pub fn auto_resolvable(&self) -> bool {
        self.code_conflicts.is_empty()
    }
}

pub fn classify_conflicts(paths: Vec<String>) -> ConflictReport {
    let mut report = ConflictReport::default();
    for path in paths {
        let is_data_jsonl = Path::new(&path)
            .components()
            .any(|c| c.as_os_str() == DATA_DIR_NAME)
            && path.ends_with(".jsonl");
        if is_data_jsonl {
            report.jsonl_conflicts.push(ConflictFile { path, auto_resolvable: true });
        } else {
            report.code_conflicts.push(ConflictFile { path, auto_resolvable: false });
        }
    }
    report
}

/// Probe merging `source` into `target` without mutating any worktree.
pub async fn detect_conflicts(
    repo_path: &Path,
    target: &str,
    source: &str,
) -> Result<ConflictReport, GitCliError> {
    let repo_path = repo_path.to_path_buf();
    let target = target.to_string();
    let source = source.to_string();
    let paths = tokio::task::spawn_blocking(move || {
        GitCli::new().merge_tree_conflicts(&repo_path, &target, &source)
    })
    .await
    .map_err(|e| GitCliError::CommandFailed {
        command: "merge-tree".to_string(),
        stderr: e.to_string(),
        stdout: String::new(),
    })??;
    Ok(classify_conflicts(paths))
}

#[derive(Debug, PartialEq)]
pub struct JsonlConflictResolution {
    pub content: String,
    pub resolved: usize,
    pub unresolved: usize,
}

struct ConflictSpan {
    start: usize,
    mid: usize,
    end: usize,
}

/// Resolve standard git conflict markers in a JSONL file by comparing the
/// `updated_at` timestamps inside each hunk: the newer side wins; ties or
/// missing timestamps prefer ours for stability. Spans are replaced in
/// reverse order so earlier line numbers stay valid.
pub fn resolve_jsonl_conflicts(content: &str) -> JsonlConflictResolution {
    let mut lines: Vec<String> = content.lines().map(|l| l.to_string()).collect();
    let spans = find_conflict_spans(&lines);

    let mut resolved = 0;
    let mut unresolved = 0;

    for span in spans.into_iter().rev() {
        let ours = &lines[span.start + 1..span.mid];
        let theirs = &lines[span.mid + 1..span.end];

        let ours_stamp = newest_timestamp(ours);
        let theirs_stamp = newest_timestamp(theirs);

        let winner: Vec<String> = match (ours_stamp, theirs_stamp) {
            (Some(o), Some(t)) if t > o => theirs.to_vec(),
            // ties and missing timestamps keep ours
            _ => ours.to_vec(),
        };

        lines.splice(span.start..=span.end, winner);
        resolved += 1;
    }

    // spans that never closed are left in place
    if lines.iter().any(|l| l.starts_with("<<<<<<<")) {
        unresolved += 1;
    }

    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    JsonlConflictResolution { content, resolved, unresolved }
}

fn find_conflict_spans(lines: &[String]) -> Vec<ConflictSpan> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    let mut mid: Option<usize> = None;

    for (index, line) in lines.iter().enumerate() {
        if line.starts_with("<<<<<<<") {
            start = Some(index);
            mid = None;
        } else if line.starts_with("=======") && start.is_some() {
            mid = Some(index);
        } else if line.starts_with(">>>>>>>")
            && let (Some(s), Some(m)) = (start, mid)
        {
            spans.push(ConflictSpan { start: s, mid: m, end: index });
            start = None;
            mid = None;
        }
    }
    spans
}

fn newest_timestamp(lines: &[String]) -> Option<DateTime<Utc>> {
    lines
        .iter()
        .flat_map(|line| UPDATED_AT_RE.captures_iter(line))
        .filter_map(|caps| parse_flexible_timestamp(caps[1].trim()))
        .max()
}

fn parse_flexible_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_splits_data_jsonl_from_code() {
        let report = classify_conflicts(vec![
            ".sudocode/issues.jsonl".to_string(),
            "src/app.ts".to_string(),
        ]);
        assert_eq!(
            report.jsonl_conflicts,
            vec![ConflictFile { path: ".sudocode/issues.jsonl".to_string(), auto_resolvable: true }]
        );
        assert_eq!(
            report.code_conflicts,
            vec![ConflictFile { path: "src/app.ts".to_string(), auto_resolvable: false }]
        );
        assert!(!report.auto_resolvable());

        // a jsonl file outside the data dir is code
        let report = classify_conflicts(vec!["fixtures/sample.jsonl".to_string()]);
        assert!(report.jsonl_conflicts.is_empty());
        assert_eq!(report.code_conflicts.len(), 1);
    }

    #[test]
    fn newer_updated_at_wins() {
        let content = "\
<<<<<<< HEAD
{\"id\":\"ISSUE-001\",\"title\":\"ours\",\"updated_at\":\"2024-01-01T00:00:00Z\"}
=======
{\"id\":\"ISSUE-001\",\"title\":\"theirs\",\"updated_at\":\"2024-06-01T00:00:00Z\"}
>>>>>>> branch
";
        let result = resolve_jsonl_conflicts(content);
        assert_eq!(result.resolved, 1);
        assert_eq!(result.unresolved, 0);
        assert!(result.content.contains("theirs"));
        assert!(!result.content.contains("ours"));
        assert!(!result.content.contains("<<<<<<<"));
    }

    #[test]
    fn tie_or_missing_timestamp_prefers_ours() {
        let tie = "\
<<<<<<< HEAD
{\"id\":\"I\",\"title\":\"ours\",\"updated_at\":\"2024-01-01T00:00:00Z\"}
=======
{\"id\":\"I\",\"title\":\"theirs\",\"updated_at\":\"2024-01-01T00:00:00Z\"}
>>>>>>> branch
";
        let result = resolve_jsonl_conflicts(tie);
        assert!(result.content.contains("ours"));

        let missing = "\
<<<<<<< HEAD
{\"id\":\"I\",\"title\":\"ours\"}
=======
{\"id\":\"I\",\"title\":\"theirs\"}
>>>>>>> branch
";
        let result = resolve_jsonl_conflicts(missing);
        assert!(result.content.contains("ours"));
    }

    #[test]
    fn quote_styles_are_tolerated() {
        assert!(newest_timestamp(&["'updated_at': '2024-05-01T00:00:00Z'".to_string()]).is_some());
        assert!(newest_timestamp(&["updated_at: 2024-05-01T12:30:00".to_string()]).is_some());
        assert!(
            newest_timestamp(&["\"updated_at\": \"2024-05-01 12:30:00\"".to_string()]).is_some()
        );
    }

    #[test]
    fn multiple_conflicts_resolve_in_reverse_order() {
        let content = "\
{\"id\":\"I-0\",\"updated_at\":\"2024-01-01T00:00:00Z\"}
<<<<<<< HEAD
{\"id\":\"I-1\",\"v\":\"ours\",\"updated_at\":\"2024-03-01T00:00:00Z\"}
=======
{\"id\":\"I-1\",\"v\":\"theirs\",\"updated_at\":\"2024-02-01T00:00:00Z\"}
>>>>>>> branch
{\"id\":\"I-2\",\"updated_at\":\"2024-01-01T00:00:00Z\"}
<<<<<<< HEAD
{\"id\":\"I-3\",\"v\":\"ours\",\"updated_at\":\"2024-01-01T00:00:00Z\"}
=======
{\"id\":\"I-3\",\"v\":\"theirs\",\"updated_at\":\"2024-09-01T00:00:00Z\"}
>>>>>>> branch
";
        let result = resolve_jsonl_conflicts(content);
        assert_eq!(result.resolved, 2);
        let lines: Vec<&str> = result.content.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].contains("ours"));
        assert!(lines[3].contains("theirs"));
    }

    #[test]
    fn untouched_content_passes_through() {
        let content = "{\"id\":\"I-0\"}\n";
        let result = resolve_jsonl_conflicts(content);
        assert_eq!(result.content, content);
        assert_eq!(result.resolved, 0);
    }
}
