//! JSON bodies of the upload API, shared by the axum handlers and the HTTP
//! client so both sides agree on field names.

use super::session::{CompletedPart, UploadSession, UploadStatus, UploadStrategy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `POST /api/upload/start-upload`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUploadRequest {
    #[serde(default)]
    pub resource_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub size: Option<u64>,
    /// Ask for every part URL in the response instead of one request per part.
    #[serde(default)]
    pub presign_parts: bool,
}

/// A signed URL scoped to one part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUrl {
    pub part_number: u32,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUploadResponse {
    pub session_id: Uuid,
    pub strategy: UploadStrategy,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub part_urls: Vec<PartUrl>,
}

/// Query of `GET /api/upload/part-url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUrlQuery {
    pub session_id: Option<Uuid>,
    pub part_number: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlResponse {
    pub url: String,
}

/// `POST /api/upload/complete-upload`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadRequest {
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<CompletedPart>>,
}

/// `POST /api/upload/abort-upload`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortUploadRequest {
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortUploadResponse {
    pub ok: bool,
    pub status: UploadStatus,
}

/// Client-facing view of a session. The storage multipart handle stays private.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: Uuid,
    pub resource_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub file_name: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub size: u64,
    pub strategy: UploadStrategy,
    pub status: UploadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts_count: Option<u64>,
    #[serde(default)]
    pub parts: Vec<CompletedPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_size: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&UploadSession> for SessionView {
    fn from(session: &UploadSession) -> Self {
        Self {
            id: session.id,
            resource_name: session.resource_name.clone(),
            description: session.description.clone(),
            file_name: session.file_name.clone(),
            key: session.storage_key.clone(),
            content_type: session.content_type.clone(),
            size: session.declared_size(),
            strategy: session.strategy,
            status: session.status,
            parts_count: session.parts_count.map(|count| count.max(0) as u64),
            parts: session.parts.0.clone(),
            integrity_token: session.final_etag.clone(),
            final_size: session.final_size.map(|size| size.max(0) as u64),
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

/// Error body rendered for every failed API call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default)]
    pub kind: String,
    pub status: u16,
}
