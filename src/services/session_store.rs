//! Persistence of upload sessions.
//!
//! The coordinator only needs create, read-by-id and a single-statement partial
//! update. Updates are guarded by the status the caller last observed, so two
//! racing calls on one session cannot both apply their transition.

use crate::models::session::{CompletedPart, UploadSession, UploadStatus};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite, types::Json};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

const SESSION_COLUMNS: &str = "id, resource_name, description, file_name, storage_key, \
     content_type, declared_size, strategy, multipart_id, parts_count, parts, status, \
     final_etag, final_size, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage key `{0}` is already taken")]
    DuplicateKey(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Fields an update may change. `None` leaves a column untouched.
#[derive(Debug, Default, Clone)]
pub struct SessionUpdate {
    pub status: Option<UploadStatus>,
    /// `Some(None)` clears the multipart handle.
    pub multipart_id: Option<Option<String>>,
    pub parts_count: Option<i64>,
    pub parts: Option<Vec<CompletedPart>>,
    pub final_etag: Option<String>,
    pub final_size: Option<i64>,
}

impl SessionUpdate {
    pub fn status(status: UploadStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_multipart_id(mut self, multipart_id: Option<String>) -> Self {
        self.multipart_id = Some(multipart_id);
        self
    }

    pub fn with_parts_count(mut self, parts_count: i64) -> Self {
        self.parts_count = Some(parts_count);
        self
    }

    pub fn with_parts(mut self, parts: Vec<CompletedPart>) -> Self {
        self.parts = Some(parts);
        self
    }

    pub fn with_final(mut self, etag: String, size: i64) -> Self {
        self.final_etag = Some(etag);
        self.final_size = Some(size);
        self
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session and return its id.
    async fn create(&self, session: &UploadSession) -> StoreResult<Uuid>;

    async fn get_by_id(&self, id: Uuid) -> StoreResult<Option<UploadSession>>;

    /// Apply `changes` if the session is still in `expected` status.
    ///
    /// Returns `None` when the session is missing or its status moved on.
    async fn update(
        &self,
        id: Uuid,
        expected: UploadStatus,
        changes: SessionUpdate,
    ) -> StoreResult<Option<UploadSession>>;
}

/// [`SessionStore`] backed by the `upload_sessions` SQLite table.
#[derive(Clone)]
pub struct SqliteSessionStore {
    db: Arc<SqlitePool>,
}

impl SqliteSessionStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create(&self, session: &UploadSession) -> StoreResult<Uuid> {
        let result = sqlx::query(
            r#"
            INSERT INTO upload_sessions (
                id, resource_name, description, file_name, storage_key, content_type,
                declared_size, strategy, multipart_id, parts_count, parts, status,
                final_etag, final_size, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session.id)
        .bind(&session.resource_name)
        .bind(&session.description)
        .bind(&session.file_name)
        .bind(&session.storage_key)
        .bind(&session.content_type)
        .bind(session.declared_size)
        .bind(session.strategy)
        .bind(&session.multipart_id)
        .bind(session.parts_count)
        .bind(&session.parts)
        .bind(session.status)
        .bind(&session.final_etag)
        .bind(session.final_size)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&*self.db)
        .await;

        match result {
            Ok(_) => Ok(session.id),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::DuplicateKey(session.storage_key.clone()))
            }
            Err(err) => Err(StoreError::Sqlx(err)),
        }
    }

    async fn get_by_id(&self, id: Uuid) -> StoreResult<Option<UploadSession>> {
        let session = sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(session)
    }

    async fn update(
        &self,
        id: Uuid,
        expected: UploadStatus,
        changes: SessionUpdate,
    ) -> StoreResult<Option<UploadSession>> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE upload_sessions SET updated_at = ");
        builder.push_bind(Utc::now());

        if let Some(status) = changes.status {
            builder.push(", status = ");
            builder.push_bind(status);
        }
        if let Some(multipart_id) = changes.multipart_id {
            builder.push(", multipart_id = ");
            builder.push_bind(multipart_id);
        }
        if let Some(parts_count) = changes.parts_count {
            builder.push(", parts_count = ");
            builder.push_bind(parts_count);
        }
        if let Some(parts) = changes.parts {
            builder.push(", parts = ");
            builder.push_bind(Json(parts));
        }
        if let Some(final_etag) = changes.final_etag {
            builder.push(", final_etag = ");
            builder.push_bind(final_etag);
        }
        if let Some(final_size) = changes.final_size {
            builder.push(", final_size = ");
            builder.push_bind(final_size);
        }

        builder.push(" WHERE id = ");
        builder.push_bind(id);
        builder.push(" AND status = ");
        builder.push_bind(expected);
        builder.push(" RETURNING ");
        builder.push(SESSION_COLUMNS);

        let session = builder
            .build_query_as::<UploadSession>()
            .fetch_optional(&*self.db)
            .await?;
        Ok(session)
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
