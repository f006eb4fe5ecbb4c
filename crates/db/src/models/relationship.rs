use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, Type};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

use super::EntityKind;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Type, Serialize, Deserialize, EnumString, Display,
)]
#[sqlx(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RelationshipType {
    Blocks,
    Related,
    DiscoveredFrom,
    Implements,
    References,
    DependsOn,
}

/// A directed, typed edge between two entities. Outgoing edges are owned by
/// the source; incoming edges are an index over the same rows.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct Relationship {
    pub from_uuid: Uuid,
    pub from_type: EntityKind,
    pub to_uuid: Uuid,
    pub to_type: EntityKind,
    pub rel_type: RelationshipType,
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    pub async fn insert<'e, E>(executor: E, rel: &Relationship) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"INSERT OR IGNORE INTO relationships
               (from_uuid, from_type, to_uuid, to_type, rel_type, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(rel.from_uuid)
        .bind(rel.from_type)
        .bind(rel.to_uuid)
        .bind(rel.to_type)
        .bind(rel.rel_type)
        .bind(rel.created_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn outgoing(pool: &SqlitePool, from_uuid: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Relationship>(
            "SELECT * FROM relationships WHERE from_uuid = ? ORDER BY created_at ASC",
        )
        .bind(from_uuid)
        .fetch_all(pool)
        .await
    }

    pub async fn incoming(pool: &SqlitePool, to_uuid: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Relationship>(
            "SELECT * FROM relationships WHERE to_uuid = ? ORDER BY created_at ASC",
        )
        .bind(to_uuid)
        .fetch_all(pool)
        .await
    }

    /// Remove edges owned by the entity (incoming edges are preserved).
    pub async fn delete_outgoing<'e, E>(executor: E, from_uuid: Uuid) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM relationships WHERE from_uuid = ?")
            .bind(from_uuid)
            .execute(executor)
            .await?;
        Ok(result.rows_affected())
    }

    /// Cascade used when an entity is deleted: both directions go.
    pub async fn delete_all_for<'e, E>(executor: E, uuid: Uuid) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM relationships WHERE from_uuid = ? OR to_uuid = ?")
            .bind(uuid)
            .bind(uuid)
            .execute(executor)
            .await?;
        Ok(result.rows_affected())
    }
}
