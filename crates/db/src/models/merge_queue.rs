use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, Type};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize, EnumString, Display, Default,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MergeQueueStatus {
    #[default]
    Pending,
    Ready,
    Merging,
    Merged,
    Failed,
    Cancelled,
}

impl MergeQueueStatus {
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            MergeQueueStatus::Merged | MergeQueueStatus::Failed | MergeQueueStatus::Cancelled
        )
    }
}

/// One queued merge. Positions within a target branch are a dense
/// permutation `{0, 1, …, n-1}`; renumbering is the service's job.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MergeQueueEntry {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub stream_id: Uuid,
    pub target_branch: String,
    pub position: i64,
    pub priority: i64,
    pub status: MergeQueueStatus,
    pub added_at: DateTime<Utc>,
    pub merge_commit: Option<String>,
    pub error: Option<String>,
}

impl MergeQueueEntry {
    pub async fn insert<'e, E>(executor: E, entry: &MergeQueueEntry) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"INSERT INTO merge_queue
               (id, execution_id, stream_id, target_branch, position, priority, status,
                added_at, merge_commit, error)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(entry.id)
        .bind(entry.execution_id)
        .bind(entry.stream_id)
        .bind(&entry.target_branch)
        .bind(entry.position)
        .bind(entry.priority)
        .bind(entry.status)
        .bind(entry.added_at)
        .bind(&entry.merge_commit)
        .bind(&entry.error)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, MergeQueueEntry>("SELECT * FROM merge_queue WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_for_target(
        pool: &SqlitePool,
        target_branch: &str,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, MergeQueueEntry>(
            "SELECT * FROM merge_queue WHERE target_branch = ? ORDER BY position ASC",
        )
        .bind(target_branch)
        .fetch_all(pool)
        .await
    }

    pub async fn count_for_target(
        pool: &SqlitePool,
        target_branch: &str,
    ) -> Result<i64, sqlx::Error> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM merge_queue WHERE target_branch = ?")
                .bind(target_branch)
                .fetch_one(pool)
                .await?;
        Ok(row.0)
    }

    pub async fn set_position<'e, E>(executor: E, id: Uuid, position: i64) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("UPDATE merge_queue SET position = ? WHERE id = ?")
            .bind(position)
            .bind(id)
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn update_status(
        pool: &SqlitePool,
        id: Uuid,
        status: MergeQueueStatus,
        merge_commit: Option<&str>,
        error: Option<&str>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE merge_queue
               SET status = ?, merge_commit = COALESCE(?, merge_commit), error = ?
               WHERE id = ?"#,
        )
        .bind(status)
        .bind(merge_commit)
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete<'e, E>(executor: E, id: Uuid) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM merge_queue WHERE id = ?")
            .bind(id)
            .execute(executor)
            .await?;
        Ok(result.rows_affected())
    }
}
