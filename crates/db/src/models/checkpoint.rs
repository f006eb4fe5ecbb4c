use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, Type, types::Json};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize, EnumString, Display, Default,
)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    Pending,
    Approved,
    ChangesRequested,
    Dismissed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityChangeType {
    Created,
    Modified,
    Deleted,
}

/// One changed entity in a checkpoint snapshot, diffed against the baseline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntityChange {
    pub id: String,
    pub change_type: EntityChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_fields: Option<Vec<String>>,
}

/// A persisted, reviewable commit on an issue stream carrying the JSONL
/// diff captured when the contributing execution finished.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub issue_uuid: Uuid,
    pub execution_id: Uuid,
    pub stream_id: Uuid,
    pub commit_sha: String,
    pub parent_commit: Option<String>,
    pub changed_files: i64,
    pub additions: i64,
    pub deletions: i64,
    pub message: String,
    pub checkpointed_at: DateTime<Utc>,
    pub review_status: ReviewStatus,
    /// `None` when the execution produced no JSONL changes (never an empty
    /// list).
    pub issue_snapshot: Option<Json<Vec<EntityChange>>>,
    pub spec_snapshot: Option<Json<Vec<EntityChange>>>,
}

impl Checkpoint {
    pub async fn insert<'e, E>(executor: E, checkpoint: &Checkpoint) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"INSERT INTO checkpoints
               (id, issue_uuid, execution_id, stream_id, commit_sha, parent_commit,
                changed_files, additions, deletions, message, checkpointed_at,
                review_status, issue_snapshot, spec_snapshot)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(checkpoint.id)
        .bind(checkpoint.issue_uuid)
        .bind(checkpoint.execution_id)
        .bind(checkpoint.stream_id)
        .bind(&checkpoint.commit_sha)
        .bind(&checkpoint.parent_commit)
        .bind(checkpoint.changed_files)
        .bind(checkpoint.additions)
        .bind(checkpoint.deletions)
        .bind(&checkpoint.message)
        .bind(checkpoint.checkpointed_at)
        .bind(checkpoint.review_status)
        .bind(&checkpoint.issue_snapshot)
        .bind(&checkpoint.spec_snapshot)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Checkpoint>("SELECT * FROM checkpoints WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_for_stream(
        pool: &SqlitePool,
        stream_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Checkpoint>(
            "SELECT * FROM checkpoints WHERE stream_id = ? ORDER BY checkpointed_at ASC",
        )
        .bind(stream_id)
        .fetch_all(pool)
        .await
    }

    pub async fn update_review_status(
        pool: &SqlitePool,
        id: Uuid,
        review_status: ReviewStatus,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("UPDATE checkpoints SET review_status = ? WHERE id = ?")
            .bind(review_status)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_change_serializes_camel_case() {
        let change = EntityChange {
            id: "ISSUE-001".to_string(),
            change_type: EntityChangeType::Modified,
            changed_fields: Some(vec!["title".to_string()]),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "ISSUE-001", "changeType": "modified", "changedFields": ["title"]})
        );

        let created = EntityChange {
            id: "ISSUE-002".to_string(),
            change_type: EntityChangeType::Created,
            changed_fields: None,
        };
        let json = serde_json::to_value(&created).unwrap();
        assert_eq!(json, serde_json::json!({"id": "ISSUE-002", "changeType": "created"}));
    }
}
