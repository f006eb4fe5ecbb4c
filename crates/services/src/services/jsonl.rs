//! JSONL codec: one entity per line, UTF-8, trailing newline, no BOM.
//!
//! Writes are atomic (tmp sibling + rename), short-circuit when the
//! rendered content matches the file byte for byte, and pin the file mtime
//! to the newest entity `updated_at` so timestamp comparisons elsewhere see
//! entity time, not write time.

use std::{
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use filetime::FileTime;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JsonlError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("failed to serialize record {id}: {source}")]
    Serialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One skipped line from a lenient read, reported once with its number.
#[derive(Debug, Clone, Serialize)]
pub struct ParseIssue {
    pub line: usize,
    pub message: String,
}

/// What the codec needs from a record to order lines and pin mtimes.
pub trait JsonlRecord: Serialize + DeserializeOwned {
    fn record_id(&self) -> &str;
    fn created_at(&self) -> DateTime<Utc>;
    fn updated_at(&self) -> DateTime<Utc>;
}

fn io_err(path: &Path, source: std::io::Error) -> JsonlError {
    JsonlError::Io { path: path.to_path_buf(), source }
}

/// Streaming line-by-line read. With `lenient` set, malformed lines are
/// skipped and reported; otherwise the first bad line aborts.
pub fn read_jsonl<T: JsonlRecord>(
    path: &Path,
    lenient: bool,
) -> Result<(Vec<T>, Vec<ParseIssue>), JsonlError> {
    if !path.exists() {
        return Ok((Vec::new(), Vec::new()));
    }

    let file = fs::File::open(path).map_err(|e| io_err(path, e))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    let mut issues = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| io_err(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                let issue = ParseIssue { line: index + 1, message: e.to_string() };
                if lenient {
                    tracing::warn!("skipping malformed line {} in {}: {}", issue.line, path.display(), issue.message);
                    issues.push(issue);
                } else {
                    return Err(JsonlError::Parse { line: issue.line, message: issue.message });
                }
            }
        }
    }
    Ok((records, issues))
}

/// Sorted atomic write. Returns `false` (and leaves the file completely
/// untouched, mtime included) when the content is already identical.
pub fn write_jsonl<T: JsonlRecord>(path: &Path, records: &[T]) -> Result<bool, JsonlError> {
    let mut sorted: Vec<&T> = records.iter().collect();
    sorted.sort_by(|a, b| {
        a.created_at()
            .cmp(&b.created_at())
            .then_with(|| a.record_id().cmp(b.record_id()))
    });

    let mut rendered = String::new();
    for record in &sorted {
        let line = serde_json::to_string(record).map_err(|e| JsonlError::Serialize {
            id: record.record_id().to_string(),
            source: e,
        })?;
        rendered.push_str(&line);
        rendered.push('\n');
    }

    if let Ok(existing) = fs::read_to_string(path)
        && existing == rendered
    {
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(path, e))?;
    }

    let tmp = tmp_sibling(path);
    fs::write(&tmp, &rendered).map_err(|e| io_err(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;

    // naked SQL timestamps are UTC already; pin mtime to the newest one
    if let Some(max_updated) = sorted.iter().map(|r| r.updated_at()).max() {
        let mtime = FileTime::from_unix_time(
            max_updated.timestamp(),
            max_updated.timestamp_subsec_nanos(),
        );
        if let Err(e) = filetime::set_file_mtime(path, mtime) {
            tracing::warn!("could not pin mtime on {}: {e}", path.display());
        }
    }

    Ok(true)
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
