//! `meta.json`: id prefixes, next-id counters and the append-only
//! collision log. Every human id handed out goes through here.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid meta file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One renumbering, kept so inbound references can be migrated later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollisionLogEntry {
    pub old_id: String,
    pub new_id: String,
    pub uuid: Uuid,
    pub reason: String,
    pub resolution: String,
    pub resolved_at: DateTime<Utc>,
}

fn default_spec_prefix() -> String {
    "SPEC".to_string()
}

fn default_issue_prefix() -> String {
    "ISSUE".to_string()
}

fn default_next() -> u64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaFile {
    #[serde(default = "default_spec_prefix")]
    pub spec_prefix: String,
    #[serde(default = "default_issue_prefix")]
    pub issue_prefix: String,
    #[serde(default = "default_next")]
    pub next_spec_number: u64,
    #[serde(default = "default_next")]
    pub next_issue_number: u64,
    #[serde(default)]
    pub collision_log: Vec<CollisionLogEntry>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl Default for MetaFile {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults always deserialize")
    }
}

impl MetaFile {
    pub fn load_or_default(path: &Path) -> Result<Self, MetaError> {
        let mut meta: MetaFile = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(path)?)?
        } else {
            MetaFile::default()
        };
        meta.path = Some(path.to_path_buf());
        Ok(meta)
    }

    pub fn save(&self) -> Result<(), MetaError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut rendered = serde_json::to_string_pretty(self)?;
        rendered.push('\n');
        std::fs::write(path, rendered)?;
        Ok(())
    }

    pub fn next_spec_id(&mut self) -> String {
        let id = format!("{}-{:03}", self.spec_prefix, self.next_spec_number);
        self.next_spec_number += 1;
        id
    }

    pub fn next_issue_id(&mut self) -> String {
        let id = format!("{}-{:03}", self.issue_prefix, self.next_issue_number);
        self.next_issue_number += 1;
        id
    }

    /// Bump a counter past an imported id so future allocations never
    /// collide with it.
    pub fn observe_id(&mut self, id: &str) {
        if let Some((prefix, number)) = split_numeric_suffix(id) {
            if prefix.trim_end_matches('-') == self.spec_prefix && number >= self.next_spec_number {
                self.next_spec_number = number + 1;
            }
            if prefix.trim_end_matches('-') == self.issue_prefix && number >= self.next_issue_number
            {
                self.next_issue_number = number + 1;
            }
        }
    }

    pub fn log_collision(&mut self, entry: CollisionLogEntry) {
        self.collision_log.push(entry);
    }
}

/// Split `"SPEC-003"` into `("SPEC-", 3)`; `None` when there is no numeric
/// suffix.
pub fn split_numeric_suffix(id: &str) -> Option<(&str, u64)> {
    let digits_start = id.rfind(|c: char| !c.is_ascii_digit()).map(|i| i + 1).unwrap_or(0);
    if digits_start >= id.len() {
        return None;
    }
    let number: u64 = id[digits_start..].parse().ok()?;
    Some((&id[..digits_start], number))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_sequential_prefixed_ids() {
        let mut meta = MetaFile::default();
        assert_eq!(meta.next_spec_id(), "SPEC-001");
        assert_eq!(meta.next_spec_id(), "SPEC-002");
        assert_eq!(meta.next_issue_id(), "ISSUE-001");
    }

    #[test]
    fn observe_id_skips_past_imported_numbers() {
        let mut meta = MetaFile::default();
        meta.observe_id("SPEC-041");
        assert_eq!(meta.next_spec_id(), "SPEC-042");
        meta.observe_id("ISSUE-007");
        meta.observe_id("ISSUE-003");
        assert_eq!(meta.next_issue_id(), "ISSUE-008");
    }

    #[test]
    fn splits_numeric_suffixes() {
        assert_eq!(split_numeric_suffix("SPEC-003"), Some(("SPEC-", 3)));
        assert_eq!(split_numeric_suffix("ISSUE-1003"), Some(("ISSUE-", 1003)));
        assert_eq!(split_numeric_suffix("NO-SUFFIX-"), None);
    }

    #[test]
    fn load_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");

        let mut meta = MetaFile::load_or_default(&path).unwrap();
        meta.next_spec_id();
        meta.save().unwrap();

        let reloaded = MetaFile::load_or_default(&path).unwrap();
        assert_eq!(reloaded.next_spec_number, 2);
    }
}
