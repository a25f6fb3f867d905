//! Upload session: the one stateful entity of the upload protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use std::fmt;
use uuid::Uuid;

/// How the file bytes reach storage. Decided once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UploadStrategy {
    /// One signed PUT carrying the whole file.
    Single,
    /// Independently uploaded parts stitched together by storage.
    Multipart,
}

/// Session lifecycle.
///
/// `pending -> uploading -> (completing ->) complete`, and any non-terminal
/// state may move to `aborted`. `completing -> uploading` is the rollback taken
/// when storage rejects a finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completing,
    Complete,
    Aborted,
}

impl UploadStatus {
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (self, next),
            (Pending, Uploading)
                | (Uploading, Completing)
                | (Uploading, Complete)
                | (Completing, Complete)
                | (Completing, Uploading)
                | (Pending | Uploading | Completing, Aborted)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completing => "completing",
            Self::Complete => "complete",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A part the client reports as uploaded. Accepts both the current field names
/// and the `PartNumber`/`ETag` spelling used by S3-shaped clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    #[serde(alias = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "integrityToken", alias = "ETag", alias = "etag")]
    pub etag: String,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "Size")]
    pub size: Option<u64>,
}

impl CompletedPart {
    pub fn new(part_number: u32, etag: impl Into<String>) -> Self {
        Self {
            part_number,
            etag: etag.into(),
            size: None,
        }
    }
}

/// Remove the double quotes storage backends wrap around ETags.
pub fn normalize_etag(etag: &str) -> String {
    etag.trim().trim_matches('"').to_string()
}

/// Validate a reported part list and return it sorted by part number.
///
/// The submitted order is never trusted. Every part must carry a part number
/// in `1..=parts_count` and a non-empty token, and no number may repeat.
pub fn normalize_parts(
    parts: Vec<CompletedPart>,
    parts_count: u64,
) -> Result<Vec<CompletedPart>, String> {
    if parts.is_empty() {
        return Err("parts are required for multipart completion".into());
    }

    let mut normalized = Vec::with_capacity(parts.len());
    for part in parts {
        if part.part_number == 0 {
            return Err("part numbers must be positive integers".into());
        }
        if u64::from(part.part_number) > parts_count {
            return Err(format!(
                "part {} exceeds the expected part count {}",
                part.part_number, parts_count
            ));
        }
        let etag = normalize_etag(&part.etag);
        if etag.is_empty() {
            return Err(format!("part {} is missing its integrity token", part.part_number));
        }
        normalized.push(CompletedPart { etag, ..part });
    }

    normalized.sort_by_key(|p| p.part_number);
    if let Some(pair) = normalized
        .windows(2)
        .find(|pair| pair[0].part_number == pair[1].part_number)
    {
        return Err(format!("part {} reported more than once", pair[0].part_number));
    }

    Ok(normalized)
}

/// One upload attempt.
#[derive(Debug, Clone, FromRow)]
pub struct UploadSession {
    /// Assigned at creation, immutable.
    pub id: Uuid,

    pub resource_name: String,

    pub description: Option<String>,

    /// Name of the file as declared by the client.
    pub file_name: String,

    /// Destination key in storage. Unique across sessions.
    pub storage_key: String,

    pub content_type: Option<String>,

    /// Client-declared size in bytes. Informational only.
    pub declared_size: i64,

    pub strategy: UploadStrategy,

    /// Storage handle of the open multipart sequence.
    pub multipart_id: Option<String>,

    /// Part count implied by the declared size, multipart sessions only.
    pub parts_count: Option<i64>,

    /// Recorded at finalization, ascending by part number.
    pub parts: Json<Vec<CompletedPart>>,

    pub status: UploadStatus,

    pub final_etag: Option<String>,

    pub final_size: Option<i64>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn declared_size(&self) -> u64 {
        self.declared_size.max(0) as u64
    }

    pub fn expected_parts(&self) -> u64 {
        self.parts_count.unwrap_or(0).max(0) as u64
    }
}
