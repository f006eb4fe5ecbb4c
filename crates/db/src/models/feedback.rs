use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, Type, types::Json};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize, EnumString, Display, Default,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FeedbackType {
    #[default]
    Comment,
    Suggestion,
    Request,
}

/// Location a feedback item is anchored to, with enough context to relocate
/// it fuzzily after the body shifts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedbackAnchor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_after: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Feedback {
    pub id: Uuid,
    /// Absent for external or anonymous feedback.
    pub from_uuid: Option<Uuid>,
    pub to_uuid: Uuid,
    pub feedback_type: FeedbackType,
    pub content: String,
    pub anchor: Option<Json<FeedbackAnchor>>,
    pub dismissed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Feedback {
    pub async fn insert<'e, E>(executor: E, feedback: &Feedback) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"INSERT INTO feedback
               (id, from_uuid, to_uuid, feedback_type, content, anchor, dismissed,
                created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(feedback.id)
        .bind(feedback.from_uuid)
        .bind(feedback.to_uuid)
        .bind(feedback.feedback_type)
        .bind(&feedback.content)
        .bind(&feedback.anchor)
        .bind(feedback.dismissed)
        .bind(feedback.created_at)
        .bind(feedback.updated_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn list_for(pool: &SqlitePool, to_uuid: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Feedback>(
            "SELECT * FROM feedback WHERE to_uuid = ? ORDER BY created_at ASC",
        )
        .bind(to_uuid)
        .fetch_all(pool)
        .await
    }

    pub async fn dismiss(pool: &SqlitePool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("UPDATE feedback SET dismissed = 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_for<'e, E>(executor: E, to_uuid: Uuid) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM feedback WHERE to_uuid = ?")
            .bind(to_uuid)
            .execute(executor)
            .await?;
        Ok(result.rows_affected())
    }
}
