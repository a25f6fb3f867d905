//! The narrow interface the coordinator uses to reach object storage.

use crate::models::session::CompletedPart;
use async_trait::async_trait;
use std::{io, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("multipart upload `{0}` does not exist")]
    NoSuchUpload(String),
    #[error("part {part_number} does not match the stored part: {reason}")]
    InvalidPart { part_number: u32, reason: String },
    #[error("invalid object key")]
    InvalidKey,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Integrity token and size storage reports for an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub etag: String,
    pub size: u64,
}

/// Result of assembling a multipart sequence. Some backends do not report the
/// size here; callers follow up with [`StorageGateway::head_object`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedObject {
    pub etag: String,
    pub size: Option<u64>,
}

#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// URL authorizing exactly one PUT of the whole object.
    async fn issue_put_url(
        &self,
        key: &str,
        content_type: Option<&str>,
        ttl: Duration,
    ) -> GatewayResult<String>;

    /// URL authorizing one PUT of `part_number` within `multipart_id`.
    async fn issue_part_url(
        &self,
        key: &str,
        multipart_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> GatewayResult<String>;

    /// URL authorizing downloads of a stored object.
    async fn issue_get_url(&self, key: &str, ttl: Duration) -> GatewayResult<String>;

    async fn open_multipart(&self, key: &str, content_type: Option<&str>) -> GatewayResult<String>;

    /// Assemble the sequence from `parts`, which must be sorted ascending.
    ///
    /// Fails with [`GatewayError::InvalidPart`] when any token is stale.
    async fn complete_multipart(
        &self,
        key: &str,
        multipart_id: &str,
        parts: &[CompletedPart],
    ) -> GatewayResult<CompletedObject>;

    /// Release every part uploaded into the sequence.
    async fn abort_multipart(&self, key: &str, multipart_id: &str) -> GatewayResult<()>;

    async fn head_object(&self, key: &str) -> GatewayResult<ObjectInfo>;
}
