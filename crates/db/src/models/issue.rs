use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, QueryBuilder, Sqlite, SqlitePool, Type, types::Json};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, EnumString, Display, Default,
)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    Open,
    InProgress,
    Blocked,
    NeedsReview,
    Closed,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Issue {
    pub uuid: Uuid,
    pub id: String,
    pub title: String,
    pub status: IssueStatus,
    pub content: String,
    pub priority: i64,
    pub assignee: Option<String>,
    pub parent_uuid: Option<Uuid>,
    pub archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub external_links: Json<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIssue {
    pub title: String,
    pub content: String,
    pub status: Option<IssueStatus>,
    pub priority: Option<i64>,
    pub assignee: Option<String>,
    pub parent_uuid: Option<Uuid>,
    pub external_links: Option<Vec<String>>,
}

/// Patch for [`Issue::update`]; same skip/clear contract as `UpdateSpec`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct UpdateIssue {
    pub title: Option<String>,
    pub content: Option<String>,
    pub status: Option<IssueStatus>,
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_with::rust::double_option")]
    pub assignee: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_with::rust::double_option")]
    pub parent_uuid: Option<Option<Uuid>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_with::rust::double_option")]
    pub external_links: Option<Option<Vec<String>>>,
    pub archived: Option<bool>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl UpdateIssue {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.content.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.assignee.is_none()
            && self.parent_uuid.is_none()
            && self.external_links.is_none()
            && self.archived.is_none()
    }
}

impl Issue {
    pub fn new(id: String, data: &CreateIssue) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            id,
            title: data.title.clone(),
            status: data.status.unwrap_or_default(),
            content: data.content.clone(),
            priority: data.priority.unwrap_or(2),
            assignee: data.assignee.clone(),
            parent_uuid: data.parent_uuid,
            archived: false,
            archived_at: None,
            closed_at: None,
            external_links: Json(data.external_links.clone().unwrap_or_default()),
            created_at: now,
            updated_at: now,
        }
    }

    pub async fn find_by_uuid(
        pool: &SqlitePool,
        uuid: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Issue>("SELECT * FROM issues WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Issue>("SELECT * FROM issues WHERE id = ? AND archived = 0")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list(pool: &SqlitePool, include_archived: bool) -> Result<Vec<Self>, sqlx::Error> {
        let sql = if include_archived {
            "SELECT * FROM issues ORDER BY created_at ASC, id ASC"
        } else {
            "SELECT * FROM issues WHERE archived = 0 ORDER BY created_at ASC, id ASC"
        };
        sqlx::query_as::<_, Issue>(sql).fetch_all(pool).await
    }

    pub async fn list_by_status(
        pool: &SqlitePool,
        status: IssueStatus,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Issue>(
            "SELECT * FROM issues WHERE status = ? AND archived = 0 ORDER BY created_at ASC",
        )
        .bind(status)
        .fetch_all(pool)
        .await
    }

    pub async fn insert<'e, E>(executor: E, issue: &Issue) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"INSERT INTO issues
               (uuid, id, title, status, content, priority, assignee, parent_uuid, archived,
                archived_at, closed_at, external_links, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(issue.uuid)
        .bind(&issue.id)
        .bind(&issue.title)
        .bind(issue.status)
        .bind(&issue.content)
        .bind(issue.priority)
        .bind(&issue.assignee)
        .bind(issue.parent_uuid)
        .bind(issue.archived)
        .bind(issue.archived_at)
        .bind(issue.closed_at)
        .bind(&issue.external_links)
        .bind(issue.created_at)
        .bind(issue.updated_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn update<'e, E>(
        executor: E,
        uuid: Uuid,
        patch: &UpdateIssue,
    ) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE issues SET ");
        let mut fields = qb.separated(", ");

        if let Some(title) = &patch.title {
            fields.push("title = ").push_bind_unseparated(title);
        }
        if let Some(content) = &patch.content {
            fields.push("content = ").push_bind_unseparated(content);
        }
        if let Some(status) = patch.status {
            fields.push("status = ").push_bind_unseparated(status);
            if status == IssueStatus::Closed {
                fields
                    .push("closed_at = COALESCE(closed_at, ")
                    .push_bind_unseparated(Utc::now())
                    .push_unseparated(")");
            } else {
                fields.push("closed_at = NULL");
            }
        }
        if let Some(priority) = patch.priority {
            fields.push("priority = ").push_bind_unseparated(priority);
        }
        if let Some(assignee) = &patch.assignee {
            fields.push("assignee = ").push_bind_unseparated(assignee.clone());
        }
        if let Some(parent_uuid) = &patch.parent_uuid {
            fields.push("parent_uuid = ").push_bind_unseparated(*parent_uuid);
        }
        if let Some(external_links) = &patch.external_links {
            let rendered = external_links.as_ref().map(|links| Json(links.clone()));
            fields
                .push("external_links = ")
                .push_bind_unseparated(rendered.unwrap_or(Json(Vec::new())));
        }
        if let Some(archived) = patch.archived {
            fields.push("archived = ").push_bind_unseparated(archived);
            if archived {
                fields.push("archived_at = ").push_bind_unseparated(Utc::now());
            } else {
                fields.push("archived_at = NULL");
            }
        }
        let updated_at = patch.updated_at.unwrap_or_else(Utc::now);
        fields.push("updated_at = ").push_bind_unseparated(updated_at);

        qb.push(" WHERE uuid = ").push_bind(uuid);
        let result = qb.build().execute(executor).await?;
        Ok(result.rows_affected())
    }

    pub async fn set_parent_preserving_timestamps<'e, E>(
        executor: E,
        uuid: Uuid,
        parent_uuid: Option<Uuid>,
    ) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("UPDATE issues SET parent_uuid = ? WHERE uuid = ?")
            .bind(parent_uuid)
            .bind(uuid)
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn archive(pool: &SqlitePool, uuid: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE issues SET archived = 1, archived_at = ?, updated_at = ? WHERE uuid = ?",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(uuid)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete<'e, E>(executor: E, uuid: Uuid) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM issues WHERE uuid = ?")
            .bind(uuid)
            .execute(executor)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn uuid_for_id(pool: &SqlitePool, id: &str) -> Result<Option<Uuid>, sqlx::Error> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT uuid FROM issues WHERE id = ? AND archived = 0")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(row.map(|(uuid,)| uuid))
    }

    pub async fn exists(pool: &SqlitePool, uuid: Uuid) -> Result<bool, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM issues WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }
}
