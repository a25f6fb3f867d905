//! Represents multipart sequences and their staged parts in the local storage
//! backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// An open multipart sequence, created before parts are uploaded.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartUpload {
    /// Opaque handle returned to the coordinator.
    pub upload_id: String,

    /// Object key being assembled.
    pub key: String,

    /// Content type applied to the assembled object.
    pub content_type: Option<String>,

    /// Timestamp when the sequence was opened.
    pub initiated_at: DateTime<Utc>,
}

/// Represents a single staged part of a multipart sequence.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartPart {
    /// Parent sequence.
    pub upload_id: String,

    /// Part number (1-based).
    pub part_number: i64,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 hex of the part body.
    pub etag: String,

    /// Timestamp of the latest PUT for this part number.
    pub uploaded_at: DateTime<Utc>,
}
