use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqlitePool};
use uuid::Uuid;

use super::EntityKind;

/// Tag membership for an entity. Set semantics only; no ordering.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Tag {
    pub entity_uuid: Uuid,
    pub entity_type: EntityKind,
    pub tag: String,
}

impl Tag {
    pub async fn add<'e, E>(
        executor: E,
        entity_uuid: Uuid,
        entity_type: EntityKind,
        tag: &str,
    ) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("INSERT OR IGNORE INTO tags (entity_uuid, entity_type, tag) VALUES (?, ?, ?)")
            .bind(entity_uuid)
            .bind(entity_type)
            .bind(tag)
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn remove<'e, E>(executor: E, entity_uuid: Uuid, tag: &str) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM tags WHERE entity_uuid = ? AND tag = ?")
            .bind(entity_uuid)
            .bind(tag)
            .execute(executor)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn list_for(pool: &SqlitePool, entity_uuid: Uuid) -> Result<Vec<String>, sqlx::Error> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT tag FROM tags WHERE entity_uuid = ? ORDER BY tag ASC")
                .bind(entity_uuid)
                .fetch_all(pool)
                .await?;
        Ok(rows.into_iter().map(|(tag,)| tag).collect())
    }

    pub async fn delete_all_for<'e, E>(executor: E, entity_uuid: Uuid) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM tags WHERE entity_uuid = ?")
            .bind(entity_uuid)
            .execute(executor)
            .await?;
        Ok(result.rows_affected())
    }
}
