//! Change detection over two snapshots of a collection.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EntityStamp {
    pub id: String,
    pub uuid: Uuid,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, PartialEq)]
pub struct ChangeSet {
    pub added: Vec<Uuid>,
    pub deleted: Vec<Uuid>,
    pub updated: Vec<Uuid>,
    pub unchanged: Vec<Uuid>,
}

/// Classify every uuid across snapshots A (before) and B (after):
/// - *added*: in B only
/// - *deleted*: in A only
/// - *updated*: in both with differing `updated_at`, or id in `force_update`
/// - *unchanged* otherwise
pub fn detect_changes(
    before: &[EntityStamp],
    after: &[EntityStamp],
    force_update: &HashSet<String>,
) -> ChangeSet {
    let before_by_uuid: HashMap<Uuid, &EntityStamp> =
        before.iter().map(|s| (s.uuid, s)).collect();
    let after_uuids: HashSet<Uuid> = after.iter().map(|s| s.uuid).collect();

    let mut changes = ChangeSet::default();

    for stamp in after {
        match before_by_uuid.get(&stamp.uuid) {
            None => changes.added.push(stamp.uuid),
            Some(prior) => {
                if prior.updated_at != stamp.updated_at || force_update.contains(stamp.id.as_str())
                {
                    changes.updated.push(stamp.uuid);
                } else {
                    changes.unchanged.push(stamp.uuid);
                }
            }
        }
    }

    for stamp in before {
        if !after_uuids.contains(&stamp.uuid) {
            changes.deleted.push(stamp.uuid);
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(id: &str, uuid: Uuid, updated: &str) -> EntityStamp {
        EntityStamp { id: id.to_string(), uuid, updated_at: updated.parse().unwrap() }
    }

    #[test]
    fn classifies_all_four_buckets() {
        let kept = Uuid::new_v4();
        let touched = Uuid::new_v4();
        let removed = Uuid::new_v4();
        let fresh = Uuid::new_v4();

        let before = vec![
            stamp("A-1", kept, "2024-01-01T00:00:00Z"),
            stamp("A-2", touched, "2024-01-01T00:00:00Z"),
            stamp("A-3", removed, "2024-01-01T00:00:00Z"),
        ];
        let after = vec![
            stamp("A-1", kept, "2024-01-01T00:00:00Z"),
            stamp("A-2", touched, "2024-02-01T00:00:00Z"),
            stamp("A-4", fresh, "2024-03-01T00:00:00Z"),
        ];

        let changes = detect_changes(&before, &after, &HashSet::new());
        assert_eq!(changes.added, vec![fresh]);
        assert_eq!(changes.updated, vec![touched]);
        assert_eq!(changes.unchanged, vec![kept]);
        assert_eq!(changes.deleted, vec![removed]);
    }

    #[test]
    fn force_update_overrides_equal_timestamps() {
        let uuid = Uuid::new_v4();
        let before = vec![stamp("A-1", uuid, "2024-01-01T00:00:00Z")];
        let after = vec![stamp("A-1", uuid, "2024-01-01T00:00:00Z")];

        let changes = detect_changes(&before, &after, &HashSet::new());
        assert_eq!(changes.unchanged, vec![uuid]);

        let force: HashSet<String> = ["A-1".to_string()].into();
        let changes = detect_changes(&before, &after, &force);
        assert_eq!(changes.updated, vec![uuid]);
    }
}
