//! Client side of the protocol: moves file bytes straight to storage through
//! signed URLs while the coordinator tracks the session.

use std::io;
use thiserror::Error;

pub mod api;
pub mod orchestrator;
pub mod source;
pub mod transport;

pub use api::{HttpUploadApi, UploadApi};
pub use orchestrator::{ChunkedUploader, Progress, TransferStatus, UploadRequest};
pub use source::{FileSource, UploadSource};
pub use transport::{HttpTransport, PartTransport};

#[derive(Debug, Error)]
pub enum ClientError {
    /// The coordinator answered with a structured error.
    #[error("{kind} ({status}): {message}")]
    Api {
        kind: String,
        status: u16,
        message: String,
    },
    #[error("part {part_number} failed: {message}")]
    Transport { part_number: u32, message: String },
    #[error("upload cancelled")]
    Cancelled,
    #[error("server expects {expected} parts but the file splits into {actual}")]
    PartCountMismatch { expected: u64, actual: u64 },
    #[error("unexpected response: {0}")]
    Protocol(String),
    #[error("part task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ClientError {
    /// Taxonomy kind reported by the coordinator, if this came from it.
    pub fn api_kind(&self) -> Option<&str> {
        match self {
            Self::Api { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
