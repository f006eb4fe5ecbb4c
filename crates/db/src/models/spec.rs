use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, QueryBuilder, Sqlite, SqlitePool, types::Json};
use uuid::Uuid;

/// A spec tracked by the store. The uuid is the identity of record; the
/// human id (`SPEC-001`) is a label that can be renumbered.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Spec {
    pub uuid: Uuid,
    pub id: String,
    pub title: String,
    pub file_path: Option<String>,
    pub content: String,
    pub priority: i64,
    pub parent_uuid: Option<Uuid>,
    pub archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub external_links: Json<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSpec {
    pub title: String,
    pub content: String,
    pub priority: Option<i64>,
    pub parent_uuid: Option<Uuid>,
    pub external_links: Option<Vec<String>>,
}

/// Patch for [`Spec::update`]. `None` skips a field; for nullable columns a
/// double option distinguishes skip (`None`) from clear (`Some(None)`).
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct UpdateSpec {
    pub title: Option<String>,
    pub content: Option<String>,
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_with::rust::double_option")]
    pub file_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_with::rust::double_option")]
    pub parent_uuid: Option<Option<Uuid>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_with::rust::double_option")]
    pub external_links: Option<Option<Vec<String>>>,
    pub archived: Option<bool>,
    /// Preserves an incoming timestamp (imports); defaults to now.
    pub updated_at: Option<DateTime<Utc>>,
}

impl UpdateSpec {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.content.is_none()
            && self.priority.is_none()
            && self.file_path.is_none()
            && self.parent_uuid.is_none()
            && self.external_links.is_none()
            && self.archived.is_none()
    }
}

impl Spec {
    pub fn new(id: String, data: &CreateSpec) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            id,
            title: data.title.clone(),
            file_path: None,
            content: data.content.clone(),
            priority: data.priority.unwrap_or(2),
            parent_uuid: data.parent_uuid,
            archived: false,
            archived_at: None,
            external_links: Json(data.external_links.clone().unwrap_or_default()),
            created_at: now,
            updated_at: now,
        }
    }

    pub async fn find_by_uuid(
        pool: &SqlitePool,
        uuid: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Spec>("SELECT * FROM specs WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(pool)
            .await
    }

    /// Look up by human id among live (non-archived) specs.
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Spec>("SELECT * FROM specs WHERE id = ? AND archived = 0")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_file_path(
        pool: &SqlitePool,
        file_path: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Spec>("SELECT * FROM specs WHERE file_path = ? AND archived = 0")
            .bind(file_path)
            .fetch_optional(pool)
            .await
    }

    pub async fn list(pool: &SqlitePool, include_archived: bool) -> Result<Vec<Self>, sqlx::Error> {
        let sql = if include_archived {
            "SELECT * FROM specs ORDER BY created_at ASC, id ASC"
        } else {
            "SELECT * FROM specs WHERE archived = 0 ORDER BY created_at ASC, id ASC"
        };
        sqlx::query_as::<_, Spec>(sql).fetch_all(pool).await
    }

    pub async fn children(pool: &SqlitePool, parent_uuid: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Spec>(
            "SELECT * FROM specs WHERE parent_uuid = ? AND archived = 0 ORDER BY created_at ASC",
        )
        .bind(parent_uuid)
        .fetch_all(pool)
        .await
    }

    pub async fn insert<'e, E>(executor: E, spec: &Spec) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"INSERT INTO specs
               (uuid, id, title, file_path, content, priority, parent_uuid, archived,
                archived_at, external_links, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(spec.uuid)
        .bind(&spec.id)
        .bind(&spec.title)
        .bind(&spec.file_path)
        .bind(&spec.content)
        .bind(spec.priority)
        .bind(spec.parent_uuid)
        .bind(spec.archived)
        .bind(spec.archived_at)
        .bind(&spec.external_links)
        .bind(spec.created_at)
        .bind(spec.updated_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn update<'e, E>(
        executor: E,
        uuid: Uuid,
        patch: &UpdateSpec,
    ) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE specs SET ");
        let mut fields = qb.separated(", ");

        if let Some(title) = &patch.title {
            fields.push("title = ").push_bind_unseparated(title);
        }
        if let Some(content) = &patch.content {
            fields.push("content = ").push_bind_unseparated(content);
        }
        if let Some(priority) = patch.priority {
            fields.push("priority = ").push_bind_unseparated(priority);
        }
        if let Some(file_path) = &patch.file_path {
            fields.push("file_path = ").push_bind_unseparated(file_path.clone());
        }
        if let Some(parent_uuid) = &patch.parent_uuid {
            fields.push("parent_uuid = ").push_bind_unseparated(*parent_uuid);
        }
        if let Some(external_links) = &patch.external_links {
            let rendered = external_links.as_ref().map(|links| Json(links.clone()));
            fields.push("external_links = ").push_bind_unseparated(
                rendered.unwrap_or(Json(Vec::new())),
            );
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

    pub async fn set_file_path<'e, E>(
        executor: E,
        uuid: Uuid,
        file_path: Option<&str>,
    ) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("UPDATE specs SET file_path = ? WHERE uuid = ?")
            .bind(file_path)
            .bind(uuid)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Second import pass: attach a parent without touching `updated_at`.
    pub async fn set_parent_preserving_timestamps<'e, E>(
        executor: E,
        uuid: Uuid,
        parent_uuid: Option<Uuid>,
    ) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("UPDATE specs SET parent_uuid = ? WHERE uuid = ?")
            .bind(parent_uuid)
            .bind(uuid)
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn archive(pool: &SqlitePool, uuid: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE specs SET archived = 1, archived_at = ?, updated_at = ? WHERE uuid = ?",
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
        let result = sqlx::query("DELETE FROM specs WHERE uuid = ?")
            .bind(uuid)
            .execute(executor)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn uuid_for_id(pool: &SqlitePool, id: &str) -> Result<Option<Uuid>, sqlx::Error> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT uuid FROM specs WHERE id = ? AND archived = 0")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(row.map(|(uuid,)| uuid))
    }

    pub async fn exists(pool: &SqlitePool, uuid: Uuid) -> Result<bool, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM specs WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }
}
