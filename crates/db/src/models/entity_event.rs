use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, types::Json};
use uuid::Uuid;

use super::EntityKind;

/// One row of the append-only mutation audit log. Written inside the same
/// transaction as the mutation it records, so a rollback leaves no trace.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EntityEvent {
    pub id: i64,
    pub entity_uuid: Uuid,
    pub entity_type: EntityKind,
    pub action: String,
    pub payload: Option<Json<Value>>,
    pub created_at: DateTime<Utc>,
}

impl EntityEvent {
    pub async fn record<'e, E>(
        executor: E,
        entity_uuid: Uuid,
        entity_type: EntityKind,
        action: &str,
        payload: Option<Value>,
    ) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"INSERT INTO entity_events (entity_uuid, entity_type, action, payload, created_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(entity_uuid)
        .bind(entity_type)
        .bind(action)
        .bind(payload.map(Json))
        .bind(Utc::now())
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn list_for(pool: &SqlitePool, entity_uuid: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, EntityEvent>(
            "SELECT * FROM entity_events WHERE entity_uuid = ? ORDER BY id ASC",
        )
        .bind(entity_uuid)
        .fetch_all(pool)
        .await
    }
}
