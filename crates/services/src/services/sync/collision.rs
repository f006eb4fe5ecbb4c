//! Deterministic id-collision resolution.
//!
//! A collision is two entities sharing a human id with different uuids.
//! The incoming entity is always the one renumbered; the entity already in
//! the store keeps its label. New ids are picked by stripping the numeric
//! suffix, adding 1000 and probing upward, with a timestamp fallback after
//! 1000 failed probes. The uuid → new-id mapping is memoized for the whole
//! resolution pass so one logical entity always lands on the same id.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use super::records::ImportRecord;
use crate::services::meta::split_numeric_suffix;

pub const COLLISION_REASON: &str = "Same ID but different UUID";
pub const COLLISION_RESOLUTION: &str = "renumber";

const RENUMBER_OFFSET: u64 = 1000;
const MAX_PROBES: u64 = 1000;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CollisionRecord {
    pub old_id: String,
    pub new_id: String,
    /// uuid already holding the id in the store, when the collision is
    /// against existing state rather than within the incoming batch.
    pub existing_uuid: Option<Uuid>,
    pub incoming_uuid: Uuid,
    pub reason: String,
    pub resolution: String,
}

pub struct CollisionResolver {
    taken: HashSet<String>,
    assigned: HashMap<Uuid, String>,
}

impl CollisionResolver {
    pub fn new(taken: impl IntoIterator<Item = String>) -> Self {
        Self { taken: taken.into_iter().collect(), assigned: HashMap::new() }
    }

    /// Renumber one entity, memoized per uuid across the pass.
    pub fn resolve(&mut self, uuid: Uuid, current_id: &str) -> String {
        if let Some(assigned) = self.assigned.get(&uuid) {
            return assigned.clone();
        }

        let new_id = self.pick_free_id(current_id);
        self.taken.insert(new_id.clone());
        self.assigned.insert(uuid, new_id.clone());
        new_id
    }

    fn pick_free_id(&self, current_id: &str) -> String {
        let (prefix, number) = match split_numeric_suffix(current_id) {
            Some((prefix, number)) => (prefix.to_string(), number),
            None => (format!("{current_id}-"), 0),
        };

        let mut candidate_number = number + RENUMBER_OFFSET;
        for _ in 0..MAX_PROBES {
            let candidate = format!("{prefix}{candidate_number}");
            if !self.taken.contains(&candidate) {
                return candidate;
            }
            candidate_number += 1;
        }

        format!("{prefix}{}", Utc::now().timestamp_millis())
    }
}

/// Detect and resolve collisions for one incoming batch, mutating the
/// colliding records to their new ids.
///
/// Within the batch, the record that keeps a contested id is the one
/// created first; on identical `created_at` the smaller uuid (string form)
/// wins, so the entity whose uuid sorts greater is renumbered.
pub fn resolve_collisions<R: ImportRecord>(
    existing_live: &HashMap<String, Uuid>,
    all_known_ids: &HashSet<String>,
    incoming: &mut [R],
) -> Vec<CollisionRecord> {
    let mut taken: HashSet<String> = all_known_ids.clone();
    taken.extend(incoming.iter().map(|r| r.id().to_string()));
    let mut resolver = CollisionResolver::new(taken);

    let mut records = Vec::new();

    // existing vs incoming: the store entity cannot be renamed in place
    for record in incoming.iter_mut() {
        if let Some(&existing_uuid) = existing_live.get(record.id())
            && existing_uuid != record.uuid()
        {
            let old_id = record.id().to_string();
            let new_id = resolver.resolve(record.uuid(), &old_id);
            record.set_id(new_id.clone());
            records.push(CollisionRecord {
                old_id,
                new_id,
                existing_uuid: Some(existing_uuid),
                incoming_uuid: record.uuid(),
                reason: COLLISION_REASON.to_string(),
                resolution: COLLISION_RESOLUTION.to_string(),
            });
        }
    }

    // within incoming: first-created keeps the id, ties broken by uuid
    let mut keeper_by_id: HashMap<String, (Uuid, chrono::DateTime<Utc>)> = HashMap::new();
    for record in incoming.iter() {
        let entry = keeper_by_id
            .entry(record.id().to_string())
            .or_insert((record.uuid(), record.created_at()));
        let incoming_key = (record.created_at(), record.uuid().to_string());
        let keeper_key = (entry.1, entry.0.to_string());
        if incoming_key < keeper_key {
            *entry = (record.uuid(), record.created_at());
        }
    }

    for record in incoming.iter_mut() {
        let (keeper_uuid, _) = keeper_by_id[record.id()];
        if keeper_uuid != record.uuid() {
            let old_id = record.id().to_string();
            let new_id = resolver.resolve(record.uuid(), &old_id);
            record.set_id(new_id.clone());
            records.push(CollisionRecord {
                old_id,
                new_id,
                existing_uuid: None,
                incoming_uuid: record.uuid(),
                reason: COLLISION_REASON.to_string(),
                resolution: COLLISION_RESOLUTION.to_string(),
            });
        }
    }

    records
}
