use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, Type};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize, EnumString, Display,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StreamScope {
    Issue,
    Execution,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize, EnumString, Display, Default,
)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StreamReviewState {
    #[default]
    None,
    Pending,
    Reviewed,
}

/// Persistent git-branch identity: an issue stream accumulates checkpoints
/// across executions; an execution stream carries one run's commits.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Stream {
    pub id: Uuid,
    pub scope: StreamScope,
    pub issue_uuid: Option<Uuid>,
    pub execution_id: Option<Uuid>,
    pub branch_name: String,
    pub checkpoint_count: i64,
    pub last_checkpoint_id: Option<Uuid>,
    pub review_state: StreamReviewState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Stream {
    fn new(scope: StreamScope, branch_name: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            scope,
            issue_uuid: None,
            execution_id: None,
            branch_name,
            checkpoint_count: 0,
            last_checkpoint_id: None,
            review_state: StreamReviewState::None,
            created_at: now,
            updated_at: now,
        }
    }

    pub async fn insert<'e, E>(executor: E, stream: &Stream) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"INSERT INTO streams
               (id, scope, issue_uuid, execution_id, branch_name, checkpoint_count,
                last_checkpoint_id, review_state, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(stream.id)
        .bind(stream.scope)
        .bind(stream.issue_uuid)
        .bind(stream.execution_id)
        .bind(&stream.branch_name)
        .bind(stream.checkpoint_count)
        .bind(stream.last_checkpoint_id)
        .bind(stream.review_state)
        .bind(stream.created_at)
        .bind(stream.updated_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Stream>("SELECT * FROM streams WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_branch(
        pool: &SqlitePool,
        branch_name: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Stream>("SELECT * FROM streams WHERE branch_name = ?")
            .bind(branch_name)
            .fetch_optional(pool)
            .await
    }

    pub async fn for_issue(pool: &SqlitePool, issue_uuid: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Stream>(
            "SELECT * FROM streams WHERE issue_uuid = ? AND scope = 'issue'",
        )
        .bind(issue_uuid)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_or_create_for_issue(
        pool: &SqlitePool,
        issue_uuid: Uuid,
        branch_name: &str,
    ) -> Result<Self, sqlx::Error> {
        if let Some(stream) = Self::for_issue(pool, issue_uuid).await? {
            return Ok(stream);
        }
        let mut stream = Self::new(StreamScope::Issue, branch_name.to_string());
        stream.issue_uuid = Some(issue_uuid);
        Self::insert(pool, &stream).await?;
        Ok(stream)
    }

    pub async fn create_for_execution(
        pool: &SqlitePool,
        execution_id: Uuid,
        branch_name: &str,
    ) -> Result<Self, sqlx::Error> {
        let mut stream = Self::new(StreamScope::Execution, branch_name.to_string());
        stream.execution_id = Some(execution_id);
        Self::insert(pool, &stream).await?;
        Ok(stream)
    }

    /// Bookkeeping after a checkpoint lands on the stream.
    pub async fn record_checkpoint<'e, E>(
        executor: E,
        stream_id: Uuid,
        checkpoint_id: Uuid,
    ) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"UPDATE streams
               SET checkpoint_count = checkpoint_count + 1,
                   last_checkpoint_id = ?,
                   review_state = 'pending',
                   updated_at = ?
               WHERE id = ?"#,
        )
        .bind(checkpoint_id)
        .bind(Utc::now())
        .bind(stream_id)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn set_review_state(
        pool: &SqlitePool,
        id: Uuid,
        review_state: StreamReviewState,
    ) -> Result<u64, sqlx::Error> {
        let result =
            sqlx::query("UPDATE streams SET review_state = ?, updated_at = ? WHERE id = ?")
                .bind(review_state)
                .bind(Utc::now())
                .bind(id)
                .execute(pool)
                .await?;
        Ok(result.rows_affected())
    }
}
