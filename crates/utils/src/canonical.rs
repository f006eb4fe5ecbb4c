//! Order-invariant content digest over entity JSON.
//!
//! Two renderings of the same entity must hash identically regardless of
//! object key order or array element order, and timestamp churn must not
//! register as a content change.

use std::fmt::Write as _;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Fields elided from the top level before hashing, in addition to any
/// caller-supplied exclusion set.
pub const DEFAULT_EXCLUDED_FIELDS: &[&str] = &["created_at", "updated_at"];

pub fn canonical_hash(value: &Value) -> String {
    canonical_hash_with(value, &[])
}

pub fn canonical_hash_with(value: &Value, extra_excluded: &[&str]) -> String {
    let canonical = canonicalize(value, extra_excluded);
    let rendered = serde_json::to_string(&canonical).unwrap_or_default();
    let digest = Sha256::digest(rendered.as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut acc, b| {
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

/// Canonical rendering: object keys sorted recursively, array elements
/// sorted by the lexicographic order of their serialized form. Exclusions
/// apply to the top level only.
fn canonicalize(value: &Value, excluded: &[&str]) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|k| {
                    !DEFAULT_EXCLUDED_FIELDS.contains(&k.as_str())
                        && !excluded.contains(&k.as_str())
                })
                .collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize_inner(&map[key]));
            }
            Value::Object(out)
        }
        other => canonicalize_inner(other),
    }
}

fn canonicalize_inner(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize_inner(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            let mut canon: Vec<Value> = items.iter().map(canonicalize_inner).collect();
            canon.sort_by_key(|v| serde_json::to_string(v).unwrap_or_default());
            Value::Array(canon)
        }
        other => other.clone(),
    }
}

pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut acc, b| {
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn hash_is_invariant_under_key_order() {
        let a = json!({"id": "SPEC-001", "title": "one", "tags": []});
        let b = json!({"title": "one", "tags": [], "id": "SPEC-001"});
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn hash_is_invariant_under_array_order() {
        let a = json!({"id": "SPEC-001", "tags": ["auth", "backend"]});
        let b = json!({"id": "SPEC-001", "tags": ["backend", "auth"]});
        assert_eq!(canonical_hash(&a), canonical_hash(&b));

        let a = json!({"rels": [{"to": "x", "type": "blocks"}, {"to": "y", "type": "related"}]});
        let b = json!({"rels": [{"type": "related", "to": "y"}, {"type": "blocks", "to": "x"}]});
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn timestamps_do_not_affect_hash() {
        let a = json!({"id": "SPEC-001", "updated_at": "2024-01-01T00:00:00Z", "created_at": "2023-01-01T00:00:00Z"});
        let b = json!({"id": "SPEC-001", "updated_at": "2025-06-30T12:00:00Z", "created_at": "2023-02-02T00:00:00Z"});
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn nested_timestamps_still_count() {
        // Exclusion is top-level only; embedded feedback keeps its stamps.
        let a = json!({"id": "I-1", "feedback": [{"id": "f", "updated_at": "2024-01-01T00:00:00Z"}]});
        let b = json!({"id": "I-1", "feedback": [{"id": "f", "updated_at": "2025-01-01T00:00:00Z"}]});
        assert_ne!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn extra_exclusions_apply() {
        let a = json!({"id": "SPEC-001", "file_path": "a.md"});
        let b = json!({"id": "SPEC-001", "file_path": "b.md"});
        assert_eq!(
            canonical_hash_with(&a, &["file_path"]),
            canonical_hash_with(&b, &["file_path"])
        );
        assert_ne!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn content_differences_register() {
        let a = json!({"id": "SPEC-001", "title": "one"});
        let b = json!({"id": "SPEC-001", "title": "two"});
        assert_ne!(canonical_hash(&a), canonical_hash(&b));
    }
}
