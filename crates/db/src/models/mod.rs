use serde::{Deserialize, Serialize};
use sqlx::Type;
use strum_macros::{Display, EnumString};

pub mod checkpoint;
pub mod entity_event;
pub mod execution;
pub mod feedback;
pub mod issue;
pub mod merge_queue;
pub mod relationship;
pub mod spec;
pub mod stream;
pub mod tag;

/// Which entity table a uuid lives in. Stored as lowercase TEXT wherever a
/// row refers to an entity polymorphically (relationships, tags, events).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Type, Serialize, Deserialize, EnumString, Display,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntityKind {
    Spec,
    Issue,
}
