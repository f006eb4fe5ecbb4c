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
pub enum ExecutionStatus {
    #[default]
    Preparing,
    Pending,
    Running,
    Paused,
    Waiting,
    Completed,
    Failed,
    Cancelled,
    Stopped,
    Conflicted,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Stopped
                | ExecutionStatus::Conflicted
        )
    }
}

/// One run of a coding agent on an issue within a worktree.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub issue_uuid: Uuid,
    pub agent_type: String,
    pub status: ExecutionStatus,
    pub target_branch: Option<String>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub before_commit: Option<String>,
    pub after_commit: Option<String>,
    pub stream_id: Option<Uuid>,
    pub parent_execution_id: Option<Uuid>,
    pub workflow_execution_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateExecution {
    pub issue_uuid: Uuid,
    pub agent_type: String,
    pub target_branch: Option<String>,
    pub parent_execution_id: Option<Uuid>,
    pub workflow_execution_id: Option<Uuid>,
}

impl Execution {
    pub fn new(data: &CreateExecution) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            issue_uuid: data.issue_uuid,
            agent_type: data.agent_type.clone(),
            status: ExecutionStatus::Preparing,
            target_branch: data.target_branch.clone(),
            branch_name: None,
            worktree_path: None,
            before_commit: None,
            after_commit: None,
            stream_id: None,
            parent_execution_id: data.parent_execution_id,
            workflow_execution_id: data.workflow_execution_id,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub async fn insert<'e, E>(executor: E, execution: &Execution) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"INSERT INTO executions
               (id, issue_uuid, agent_type, status, target_branch, branch_name, worktree_path,
                before_commit, after_commit, stream_id, parent_execution_id,
                workflow_execution_id, created_at, started_at, completed_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id)
        .bind(execution.issue_uuid)
        .bind(&execution.agent_type)
        .bind(execution.status)
        .bind(&execution.target_branch)
        .bind(&execution.branch_name)
        .bind(&execution.worktree_path)
        .bind(&execution.before_commit)
        .bind(&execution.after_commit)
        .bind(execution.stream_id)
        .bind(execution.parent_execution_id)
        .bind(execution.workflow_execution_id)
        .bind(execution.created_at)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.updated_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Execution>("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_for_issue(
        pool: &SqlitePool,
        issue_uuid: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Execution>(
            "SELECT * FROM executions WHERE issue_uuid = ? ORDER BY created_at ASC",
        )
        .bind(issue_uuid)
        .fetch_all(pool)
        .await
    }

    /// The live execution occupying a worktree path, if any. The partial
    /// unique index makes a second concurrent claim fail at insert time.
    pub async fn find_active_by_worktree(
        pool: &SqlitePool,
        worktree_path: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Execution>(
            r#"SELECT * FROM executions
               WHERE worktree_path = ?
                 AND status IN ('preparing', 'pending', 'running', 'paused', 'waiting')"#,
        )
        .bind(worktree_path)
        .fetch_optional(pool)
        .await
    }

    pub async fn update_status(
        pool: &SqlitePool,
        id: Uuid,
        status: ExecutionStatus,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        let started_at_sql = if status == ExecutionStatus::Running {
            "COALESCE(started_at, ?2)"
        } else {
            "started_at"
        };
        let completed_at_sql = if status.is_terminal() {
            "COALESCE(completed_at, ?2)"
        } else {
            "completed_at"
        };
        let sql = format!(
            "UPDATE executions SET status = ?1, started_at = {started_at_sql}, completed_at = {completed_at_sql}, updated_at = ?2 WHERE id = ?3"
        );
        sqlx::query(&sql).bind(status).bind(now).bind(id).execute(pool).await?;
        Ok(())
    }

    pub async fn set_workspace(
        pool: &SqlitePool,
        id: Uuid,
        branch_name: &str,
        worktree_path: &str,
        stream_id: Uuid,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE executions
               SET branch_name = ?, worktree_path = ?, stream_id = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(branch_name)
        .bind(worktree_path)
        .bind(stream_id)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_commits(
        pool: &SqlitePool,
        id: Uuid,
        before_commit: Option<&str>,
        after_commit: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE executions
               SET before_commit = COALESCE(?, before_commit),
                   after_commit = COALESCE(?, after_commit),
                   updated_at = ?
               WHERE id = ?"#,
        )
        .bind(before_commit)
        .bind(after_commit)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn delete<'e, E>(executor: E, id: Uuid) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM executions WHERE id = ?")
            .bind(id)
            .execute(executor)
            .await?;
        Ok(result.rows_affected())
    }
}
