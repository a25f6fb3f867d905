//! UploadCoordinator: server-side authority over upload sessions.
//!
//! The coordinator never sees file bytes. It picks the strategy, issues
//! signed URLs, validates the finalization request and drives each session to
//! a terminal state. Every transition is a single store update guarded by the
//! status it starts from. A multipart completion claims the session as
//! `completing` before assembly; a call interrupted after the claim is resumed
//! by the next completion, never stranded.

use crate::chunking;
use crate::config::UploadConfig;
use crate::models::{
    api::{PartUrl, StartUploadRequest, StartUploadResponse},
    session::{
        CompletedPart, UploadSession, UploadStatus, UploadStrategy, normalize_etag,
        normalize_parts,
    },
};
use crate::services::{
    gateway::{GatewayError, StorageGateway},
    session_store::{SessionStore, SessionUpdate, StoreError},
};
use chrono::Utc;
use sqlx::types::Json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_FILE_NAME_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("cannot {operation} an upload in `{status}` state")]
    InvalidState {
        status: UploadStatus,
        operation: &'static str,
    },
    #[error("{0}")]
    Integrity(String),
    #[error(transparent)]
    Storage(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl UploadError {
    /// Stable name of the error kind, rendered in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::Integrity(_) => "integrity",
            Self::Storage(_) | Self::Store(_) => "internal",
        }
    }
}

pub type UploadResult<T> = Result<T, UploadError>;

#[derive(Clone)]
pub struct UploadCoordinator {
    store: Arc<dyn SessionStore>,
    gateway: Arc<dyn StorageGateway>,
    config: UploadConfig,
}

impl UploadCoordinator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        gateway: Arc<dyn StorageGateway>,
        config: UploadConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Create a session and start it: the `start-upload` call.
    pub async fn start_upload(
        &self,
        request: StartUploadRequest,
    ) -> UploadResult<StartUploadResponse> {
        let presign_parts = request.presign_parts;
        let session = self.create_session(request).await?;
        self.start_session(session, presign_parts).await
    }

    /// Validate the declaration and persist a `pending` session.
    pub async fn create_session(&self, request: StartUploadRequest) -> UploadResult<UploadSession> {
        let resource_name = request.resource_name.trim();
        if resource_name.is_empty() {
            return Err(UploadError::Validation("resourceName is required".into()));
        }
        if request.file_name.trim().is_empty() {
            return Err(UploadError::Validation("fileName is required".into()));
        }
        let size = request
            .size
            .ok_or_else(|| UploadError::Validation("size is required".into()))?;
        let declared_size = i64::try_from(size)
            .map_err(|_| UploadError::Validation(format!("size {size} is too large")))?;

        let strategy = if size <= self.config.single_put_threshold {
            UploadStrategy::Single
        } else {
            UploadStrategy::Multipart
        };
        if strategy == UploadStrategy::Multipart {
            let parts_count = self.config.parts_count(size);
            if parts_count > self.config.max_parts {
                return Err(UploadError::Validation(format!(
                    "file would need {parts_count} parts, more than the limit of {}",
                    self.config.max_parts
                )));
            }
        }

        let now = Utc::now();
        let session = UploadSession {
            id: Uuid::new_v4(),
            resource_name: resource_name.to_string(),
            description: request.description.filter(|d| !d.trim().is_empty()),
            file_name: request.file_name.clone(),
            storage_key: self.generate_key(&request.file_name),
            content_type: request.content_type.filter(|c| !c.trim().is_empty()),
            declared_size,
            strategy,
            multipart_id: None,
            parts_count: None,
            parts: Json(Vec::new()),
            status: UploadStatus::Pending,
            final_etag: None,
            final_size: None,
            created_at: now,
            updated_at: now,
        };
        self.store.create(&session).await?;

        info!(
            session_id = %session.id,
            key = %session.storage_key,
            size,
            strategy = ?strategy,
            "created upload session"
        );
        Ok(session)
    }

    /// Move a `pending` session to `uploading`, obtaining what the client
    /// needs to send bytes.
    pub async fn start_session(
        &self,
        session: UploadSession,
        presign_parts: bool,
    ) -> UploadResult<StartUploadResponse> {
        if session.status != UploadStatus::Pending {
            return Err(UploadError::InvalidState {
                status: session.status,
                operation: "start",
            });
        }
        let key = session.storage_key.as_str();
        let content_type = session.content_type.as_deref();

        match session.strategy {
            UploadStrategy::Single => {
                let upload_url = self
                    .gateway
                    .issue_put_url(key, content_type, self.config.url_ttl)
                    .await?;
                let started = self
                    .store
                    .update(
                        session.id,
                        UploadStatus::Pending,
                        SessionUpdate::status(UploadStatus::Uploading),
                    )
                    .await?;
                if started.is_none() {
                    return Err(self.lost_race(session.id, "start").await);
                }

                info!(session_id = %session.id, "single upload started");
                Ok(StartUploadResponse {
                    session_id: session.id,
                    strategy: UploadStrategy::Single,
                    key: session.storage_key.clone(),
                    upload_url: Some(upload_url),
                    part_size: None,
                    parts_count: None,
                    part_urls: Vec::new(),
                })
            }
            UploadStrategy::Multipart => {
                let parts_count = self.config.parts_count(session.declared_size());
                let multipart_id = self.gateway.open_multipart(key, content_type).await?;

                let part_urls = if presign_parts {
                    match self.presign_parts(key, &multipart_id, parts_count).await {
                        Ok(urls) => urls,
                        Err(err) => {
                            self.release_orphan(key, &multipart_id).await;
                            return Err(err);
                        }
                    }
                } else {
                    Vec::new()
                };

                let updated = self
                    .store
                    .update(
                        session.id,
                        UploadStatus::Pending,
                        SessionUpdate::status(UploadStatus::Uploading)
                            .with_multipart_id(Some(multipart_id.clone()))
                            .with_parts_count(parts_count as i64),
                    )
                    .await;
                match updated {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        self.release_orphan(key, &multipart_id).await;
                        return Err(self.lost_race(session.id, "start").await);
                    }
                    Err(err) => {
                        self.release_orphan(key, &multipart_id).await;
                        return Err(err.into());
                    }
                }

                info!(session_id = %session.id, parts_count, "multipart upload started");
                Ok(StartUploadResponse {
                    session_id: session.id,
                    strategy: UploadStrategy::Multipart,
                    key: session.storage_key.clone(),
                    upload_url: None,
                    part_size: Some(self.config.part_size),
                    parts_count: Some(parts_count),
                    part_urls,
                })
            }
        }
    }

    /// Signed URL for one part of an active multipart sequence.
    pub async fn part_url(&self, session_id: Uuid, part_number: u32) -> UploadResult<String> {
        let session = self.load(session_id).await?;
        let multipart_id = match (&session.strategy, session.status, &session.multipart_id) {
            (UploadStrategy::Multipart, UploadStatus::Uploading, Some(multipart_id)) => {
                multipart_id
            }
            _ => {
                return Err(UploadError::InvalidState {
                    status: session.status,
                    operation: "request a part URL for",
                });
            }
        };
        if part_number == 0 {
            return Err(UploadError::Validation(
                "partNumber must be a positive integer".into(),
            ));
        }
        if u64::from(part_number) > session.expected_parts() {
            return Err(UploadError::Validation(format!(
                "partNumber {part_number} exceeds the part count {}",
                session.expected_parts()
            )));
        }

        let url = self
            .gateway
            .issue_part_url(
                &session.storage_key,
                multipart_id,
                part_number,
                self.config.url_ttl,
            )
            .await?;
        Ok(url)
    }

    /// Finalize an `uploading` session.
    ///
    /// Single uploads are confirmed by looking the object up in storage.
    /// Multipart uploads are validated, sorted and handed to storage for
    /// assembly. A storage rejection leaves the session `uploading` so the
    /// client can retry with a corrected list. A multipart session left
    /// `completing` by an interrupted call is resumed: the object is recorded
    /// if storage already assembled it, otherwise assembly is requested again.
    pub async fn complete_upload(
        &self,
        session_id: Uuid,
        parts: Option<Vec<CompletedPart>>,
    ) -> UploadResult<UploadSession> {
        let session = self.load(session_id).await?;
        let resumable = session.status == UploadStatus::Completing
            && session.strategy == UploadStrategy::Multipart;
        if session.status != UploadStatus::Uploading && !resumable {
            return Err(UploadError::InvalidState {
                status: session.status,
                operation: "complete",
            });
        }

        match session.strategy {
            UploadStrategy::Single => self.complete_single(session, parts).await,
            UploadStrategy::Multipart => {
                self.complete_multipart(session, parts.unwrap_or_default())
                    .await
            }
        }
    }

    async fn complete_single(
        &self,
        session: UploadSession,
        parts: Option<Vec<CompletedPart>>,
    ) -> UploadResult<UploadSession> {
        if parts.is_some_and(|parts| !parts.is_empty()) {
            return Err(UploadError::Validation(
                "parts are only accepted for multipart uploads".into(),
            ));
        }

        let info = match self.gateway.head_object(&session.storage_key).await {
            Ok(info) => info,
            Err(GatewayError::ObjectNotFound(_)) => {
                warn!(
                    session_id = %session.id,
                    "completion requested before the object landed"
                );
                return Err(UploadError::Integrity(format!(
                    "object `{}` is not present in storage",
                    session.storage_key
                )));
            }
            Err(err) => return Err(err.into()),
        };

        let completed = self
            .store
            .update(
                session.id,
                UploadStatus::Uploading,
                SessionUpdate::status(UploadStatus::Complete)
                    .with_final(normalize_etag(&info.etag), info.size as i64),
            )
            .await?;
        match completed {
            Some(session) => {
                info!(session_id = %session.id, size = info.size, "single upload complete");
                Ok(session)
            }
            None => Err(self.lost_race(session.id, "complete").await),
        }
    }

    async fn complete_multipart(
        &self,
        session: UploadSession,
        parts: Vec<CompletedPart>,
    ) -> UploadResult<UploadSession> {
        let Some(multipart_id) = session.multipart_id.clone() else {
            return Err(UploadError::InvalidState {
                status: session.status,
                operation: "complete",
            });
        };

        let declared_size = session.declared_size();
        let parts = normalize_parts(parts, session.expected_parts())
            .map_err(UploadError::Validation)?
            .into_iter()
            .map(|part| CompletedPart {
                size: chunking::part_len(declared_size, self.config.part_size, part.part_number),
                ..part
            })
            .collect::<Vec<_>>();
        let key = session.storage_key.as_str();

        if session.status == UploadStatus::Uploading {
            let claimed = self
                .store
                .update(
                    session.id,
                    UploadStatus::Uploading,
                    SessionUpdate::status(UploadStatus::Completing),
                )
                .await?;
            if claimed.is_none() {
                return Err(self.lost_race(session.id, "complete").await);
            }
        } else {
            match self.gateway.head_object(key).await {
                Ok(info) => {
                    info!(session_id = %session.id, "recording multipart object assembled earlier");
                    let etag = normalize_etag(&info.etag);
                    return self.finish_multipart(&session, parts, etag, info.size).await;
                }
                Err(GatewayError::ObjectNotFound(_)) => {
                    info!(session_id = %session.id, "resuming interrupted multipart completion");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let assembled = match self
            .gateway
            .complete_multipart(key, &multipart_id, &parts)
            .await
        {
            Ok(assembled) => assembled,
            Err(GatewayError::NoSuchUpload(_)) => {
                return self.sequence_vanished(&session, parts).await;
            }
            Err(err) => {
                warn!(
                    session_id = %session.id,
                    error = %err,
                    "storage rejected multipart completion"
                );
                let reverted = self
                    .store
                    .update(
                        session.id,
                        UploadStatus::Completing,
                        SessionUpdate::status(UploadStatus::Uploading),
                    )
                    .await;
                if let Err(store_err) = reverted {
                    warn!(
                        session_id = %session.id,
                        error = %store_err,
                        "session left completing; the next completion resumes it"
                    );
                }
                return Err(match err {
                    GatewayError::InvalidPart { .. } => UploadError::Integrity(err.to_string()),
                    other => UploadError::Storage(other),
                });
            }
        };

        let final_size = match self.gateway.head_object(key).await {
            Ok(info) => info.size,
            Err(err) => {
                warn!(
                    session_id = %session.id,
                    error = %err,
                    "metadata lookup failed after assembly"
                );
                assembled.size.unwrap_or(declared_size)
            }
        };
        let etag = normalize_etag(&assembled.etag);
        self.finish_multipart(&session, parts, etag, final_size).await
    }

    /// Record a `completing` session as `complete`.
    async fn finish_multipart(
        &self,
        session: &UploadSession,
        parts: Vec<CompletedPart>,
        etag: String,
        final_size: u64,
    ) -> UploadResult<UploadSession> {
        let part_count = parts.len();
        let completed = self
            .store
            .update(
                session.id,
                UploadStatus::Completing,
                SessionUpdate::status(UploadStatus::Complete)
                    .with_multipart_id(None)
                    .with_parts(parts)
                    .with_final(etag, final_size as i64),
            )
            .await?;
        match completed {
            Some(session) => {
                info!(
                    session_id = %session.id,
                    parts = part_count,
                    size = final_size,
                    "multipart upload complete"
                );
                Ok(session)
            }
            None => Err(self.lost_race(session.id, "complete").await),
        }
    }

    /// Storage no longer knows the sequence. Unless the object was assembled
    /// by a concurrent completion, nothing can finish this session.
    async fn sequence_vanished(
        &self,
        session: &UploadSession,
        parts: Vec<CompletedPart>,
    ) -> UploadResult<UploadSession> {
        if let Ok(info) = self.gateway.head_object(&session.storage_key).await {
            let etag = normalize_etag(&info.etag);
            return self.finish_multipart(session, parts, etag, info.size).await;
        }

        warn!(session_id = %session.id, "multipart sequence vanished from storage");
        let aborted = self
            .store
            .update(
                session.id,
                UploadStatus::Completing,
                SessionUpdate::status(UploadStatus::Aborted).with_multipart_id(None),
            )
            .await?;
        match aborted {
            Some(session) => Err(UploadError::InvalidState {
                status: session.status,
                operation: "complete",
            }),
            None => Err(self.lost_race(session.id, "complete").await),
        }
    }

    /// Abort a session, releasing its multipart sequence in storage.
    ///
    /// Aborting an already aborted session is acknowledged without effect.
    pub async fn abort_upload(&self, session_id: Uuid) -> UploadResult<UploadSession> {
        let session = self.load(session_id).await?;
        if session.status == UploadStatus::Aborted {
            return Ok(session);
        }
        if !session.status.can_transition_to(UploadStatus::Aborted) {
            return Err(UploadError::InvalidState {
                status: session.status,
                operation: "abort",
            });
        }

        if session.status == UploadStatus::Completing
            && self.gateway.head_object(&session.storage_key).await.is_ok()
        {
            return Err(UploadError::InvalidState {
                status: session.status,
                operation: "abort",
            });
        }

        if let Some(multipart_id) = &session.multipart_id {
            match self
                .gateway
                .abort_multipart(&session.storage_key, multipart_id)
                .await
            {
                Ok(()) => {}
                Err(GatewayError::NoSuchUpload(_)) => {
                    warn!(session_id = %session.id, "multipart sequence already released");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let aborted = self
            .store
            .update(
                session.id,
                session.status,
                SessionUpdate::status(UploadStatus::Aborted).with_multipart_id(None),
            )
            .await?;
        match aborted {
            Some(session) => {
                info!(session_id = %session.id, "upload aborted");
                Ok(session)
            }
            None => {
                let current = self.load(session_id).await?;
                if current.status == UploadStatus::Aborted {
                    Ok(current)
                } else {
                    Err(UploadError::InvalidState {
                        status: current.status,
                        operation: "abort",
                    })
                }
            }
        }
    }

    pub async fn get_session(&self, session_id: Uuid) -> UploadResult<UploadSession> {
        self.load(session_id).await
    }

    /// Signed download URL for a completed upload.
    pub async fn view_url(&self, session_id: Uuid) -> UploadResult<String> {
        let session = self.load(session_id).await?;
        if session.status != UploadStatus::Complete {
            return Err(UploadError::InvalidState {
                status: session.status,
                operation: "view",
            });
        }
        let url = self
            .gateway
            .issue_get_url(&session.storage_key, self.config.url_ttl)
            .await?;
        Ok(url)
    }

    async fn load(&self, session_id: Uuid) -> UploadResult<UploadSession> {
        self.store
            .get_by_id(session_id)
            .await?
            .ok_or_else(|| {
                UploadError::NotFound(format!("upload session `{session_id}` not found"))
            })
    }

    async fn presign_parts(
        &self,
        key: &str,
        multipart_id: &str,
        parts_count: u64,
    ) -> UploadResult<Vec<PartUrl>> {
        let mut urls = Vec::with_capacity(parts_count as usize);
        for part_number in 1..=parts_count as u32 {
            let url = self
                .gateway
                .issue_part_url(key, multipart_id, part_number, self.config.url_ttl)
                .await?;
            urls.push(PartUrl { part_number, url });
        }
        Ok(urls)
    }

    /// A guarded update matched nothing: report the status that won.
    async fn lost_race(&self, session_id: Uuid, operation: &'static str) -> UploadError {
        match self.load(session_id).await {
            Ok(current) => UploadError::InvalidState {
                status: current.status,
                operation,
            },
            Err(err) => err,
        }
    }

    /// Best-effort release of a sequence no session will reference.
    async fn release_orphan(&self, key: &str, multipart_id: &str) {
        if let Err(err) = self.gateway.abort_multipart(key, multipart_id).await {
            warn!(key, multipart_id, error = %err, "failed to release orphaned multipart sequence");
        }
    }

    /// `{prefix}{uuid}-{file name}` with the name reduced to a safe alphabet.
    fn generate_key(&self, file_name: &str) -> String {
        let mut name: String = file_name
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .take(MAX_FILE_NAME_LEN)
            .collect();
        while name.contains("..") {
            name = name.replace("..", ".");
        }
        let prefix: String = self
            .config
            .key_prefix
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_'))
            .collect();
        format!("{}{}-{}", prefix.trim_start_matches('/'), Uuid::new_v4(), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::services::gateway::{CompletedObject, GatewayResult, ObjectInfo};
    use crate::services::session_store::SqliteSessionStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;

    /// In-memory storage double that records what the coordinator asked of it.
    #[derive(Default)]
    struct FakeGateway {
        state: Mutex<FakeState>,
        stall: Mutex<Option<Stall>>,
    }

    /// Where a multipart completion hangs, so a caller can drop it midway.
    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Stall {
        BeforeAssembly,
        AfterAssembly,
    }

    #[derive(Default)]
    struct FakeState {
        objects: HashMap<String, ObjectInfo>,
        uploads: HashMap<String, HashMap<u32, String>>,
        completions: Vec<Vec<u32>>,
        aborted: Vec<String>,
    }

    impl FakeGateway {
        fn put_object(&self, key: &str, etag: &str, size: u64) {
            self.state.lock().unwrap().objects.insert(
                key.to_string(),
                ObjectInfo {
                    etag: etag.to_string(),
                    size,
                },
            );
        }

        fn stall_completion(&self, stall: Option<Stall>) {
            *self.stall.lock().unwrap() = stall;
        }

        fn assemble(
            &self,
            key: &str,
            multipart_id: &str,
            parts: &[CompletedPart],
        ) -> GatewayResult<CompletedObject> {
            let mut state = self.state.lock().unwrap();
            let staged = state
                .uploads
                .get(multipart_id)
                .ok_or_else(|| GatewayError::NoSuchUpload(multipart_id.to_string()))?;
            let mut joined = String::new();
            for part in parts {
                match staged.get(&part.part_number) {
                    Some(etag) if *etag == part.etag => joined.push_str(etag),
                    _ => {
                        return Err(GatewayError::InvalidPart {
                            part_number: part.part_number,
                            reason: "token mismatch".into(),
                        });
                    }
                }
            }
            let etag = format!("{:x}-{}", md5::compute(&joined), parts.len());
            state.uploads.remove(multipart_id);
            state
                .completions
                .push(parts.iter().map(|p| p.part_number).collect());
            state.objects.insert(
                key.to_string(),
                ObjectInfo {
                    etag: etag.clone(),
                    size: 25 * MIB,
                },
            );
            Ok(CompletedObject { etag, size: None })
        }

        fn stage_part(&self, multipart_id: &str, part_number: u32, etag: &str) {
            self.state
                .lock()
                .unwrap()
                .uploads
                .get_mut(multipart_id)
                .unwrap()
                .insert(part_number, etag.to_string());
        }
    }

    #[async_trait]
    impl StorageGateway for FakeGateway {
        async fn issue_put_url(
            &self,
            key: &str,
            _content_type: Option<&str>,
            _ttl: Duration,
        ) -> GatewayResult<String> {
            Ok(format!("https://storage.test/{key}"))
        }

        async fn issue_part_url(
            &self,
            key: &str,
            multipart_id: &str,
            part_number: u32,
            _ttl: Duration,
        ) -> GatewayResult<String> {
            Ok(format!(
                "https://storage.test/{key}?uploadId={multipart_id}&partNumber={part_number}"
            ))
        }

        async fn issue_get_url(&self, key: &str, _ttl: Duration) -> GatewayResult<String> {
            Ok(format!("https://storage.test/{key}?get"))
        }

        async fn open_multipart(
            &self,
            _key: &str,
            _content_type: Option<&str>,
        ) -> GatewayResult<String> {
            let id = Uuid::new_v4().to_string();
            self.state
                .lock()
                .unwrap()
                .uploads
                .insert(id.clone(), HashMap::new());
            Ok(id)
        }

        async fn complete_multipart(
            &self,
            key: &str,
            multipart_id: &str,
            parts: &[CompletedPart],
        ) -> GatewayResult<CompletedObject> {
            let stall = *self.stall.lock().unwrap();
            if stall == Some(Stall::BeforeAssembly) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            let assembled = self.assemble(key, multipart_id, parts)?;
            if stall == Some(Stall::AfterAssembly) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(assembled)
        }

        async fn abort_multipart(&self, _key: &str, multipart_id: &str) -> GatewayResult<()> {
            let mut state = self.state.lock().unwrap();
            state
                .uploads
                .remove(multipart_id)
                .ok_or_else(|| GatewayError::NoSuchUpload(multipart_id.to_string()))?;
            state.aborted.push(multipart_id.to_string());
            Ok(())
        }

        async fn head_object(&self, key: &str) -> GatewayResult<ObjectInfo> {
            self.state
                .lock()
                .unwrap()
                .objects
                .get(key)
                .cloned()
                .ok_or_else(|| GatewayError::ObjectNotFound(key.to_string()))
        }
    }

    async fn coordinator() -> (UploadCoordinator, Arc<FakeGateway>, Arc<SqliteSessionStore>) {
        let store = Arc::new(SqliteSessionStore::new(Arc::new(
            db::connect_in_memory().await.unwrap(),
        )));
        let gateway = Arc::new(FakeGateway::default());
        let config = UploadConfig {
            single_put_threshold: 10 * MIB,
            part_size: 10 * MIB,
            ..UploadConfig::default()
        };
        let coordinator = UploadCoordinator::new(store.clone(), gateway.clone(), config);
        (coordinator, gateway, store)
    }

    fn declare(size: u64) -> StartUploadRequest {
        StartUploadRequest {
            resource_name: "quarterly report".into(),
            description: Some("Q3".into()),
            file_name: "report final.pdf".into(),
            content_type: Some("application/pdf".into()),
            size: Some(size),
            presign_parts: false,
        }
    }

    async fn multipart_id(store: &SqliteSessionStore, id: Uuid) -> String {
        store
            .get_by_id(id)
            .await
            .unwrap()
            .unwrap()
            .multipart_id
            .unwrap()
    }

    #[tokio::test]
    async fn strategy_follows_threshold() {
        let (coordinator, _, _) = coordinator().await;
        for (size, expected) in [
            (0, UploadStrategy::Single),
            (3 * MIB, UploadStrategy::Single),
            (10 * MIB, UploadStrategy::Single),
            (10 * MIB + 1, UploadStrategy::Multipart),
            (25 * MIB, UploadStrategy::Multipart),
        ] {
            let started = coordinator.start_upload(declare(size)).await.unwrap();
            assert_eq!(started.strategy, expected, "size {size}");
        }
    }

    #[tokio::test]
    async fn missing_fields_fail_validation() {
        let (coordinator, _, _) = coordinator().await;

        let mut no_name = declare(1);
        no_name.resource_name = "  ".into();
        assert!(matches!(
            coordinator.start_upload(no_name).await,
            Err(UploadError::Validation(_))
        ));

        let mut no_size = declare(1);
        no_size.size = None;
        assert!(matches!(
            coordinator.start_upload(no_size).await,
            Err(UploadError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn part_ceiling_is_enforced() {
        let (coordinator, _, _) = coordinator().await;
        let too_big = 10 * MIB * 10_001;
        assert!(matches!(
            coordinator.start_upload(declare(too_big)).await,
            Err(UploadError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn keys_are_unique_and_sanitised() {
        let (coordinator, _, _) = coordinator().await;
        let a = coordinator.start_upload(declare(1)).await.unwrap();
        let b = coordinator.start_upload(declare(1)).await.unwrap();
        assert_ne!(a.key, b.key);
        assert!(a.key.ends_with("-report_final.pdf"));
    }

    #[tokio::test]
    async fn single_upload_completes_with_recorded_token() {
        let (coordinator, gateway, _) = coordinator().await;
        let started = coordinator.start_upload(declare(3 * MIB)).await.unwrap();
        assert!(started.upload_url.is_some());

        // Completion before the PUT landed is an integrity failure.
        let err = coordinator
            .complete_upload(started.session_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Integrity(_)));
        let session = coordinator.get_session(started.session_id).await.unwrap();
        assert_eq!(session.status, UploadStatus::Uploading);

        gateway.put_object(&started.key, "\"abc123\"", 3 * MIB);
        let session = coordinator
            .complete_upload(started.session_id, None)
            .await
            .unwrap();
        assert_eq!(session.status, UploadStatus::Complete);
        assert_eq!(session.final_etag.as_deref(), Some("abc123"));
        assert_eq!(session.final_size, Some((3 * MIB) as i64));

        assert!(matches!(
            coordinator.complete_upload(started.session_id, None).await,
            Err(UploadError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn multipart_completion_sorts_parts() {
        let (coordinator, gateway, store) = coordinator().await;
        let started = coordinator.start_upload(declare(25 * MIB)).await.unwrap();
        assert_eq!(started.parts_count, Some(3));
        assert_eq!(started.part_size, Some(10 * MIB));

        let mpid = multipart_id(&store, started.session_id).await;
        for n in 1..=3 {
            gateway.stage_part(&mpid, n, &format!("etag-{n}"));
        }

        let scrambled = vec![
            CompletedPart::new(1, "etag-1"),
            CompletedPart::new(3, "\"etag-3\""),
            CompletedPart::new(2, "etag-2"),
        ];
        let session = coordinator
            .complete_upload(started.session_id, Some(scrambled))
            .await
            .unwrap();

        assert_eq!(session.status, UploadStatus::Complete);
        assert_eq!(session.multipart_id, None);
        let numbers: Vec<u32> = session.parts.0.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(session.parts.0[2].size, Some(5 * MIB));
        assert_eq!(gateway.state.lock().unwrap().completions, vec![vec![1, 2, 3]]);

        let expected = format!("{:x}-3", md5::compute("etag-1etag-2etag-3"));
        assert_eq!(session.final_etag.as_deref(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn malformed_part_lists_never_complete() {
        let (coordinator, _, _) = coordinator().await;
        let started = coordinator.start_upload(declare(25 * MIB)).await.unwrap();

        for parts in [
            None,
            Some(vec![]),
            Some(vec![CompletedPart::new(0, "x")]),
            Some(vec![CompletedPart::new(1, "")]),
            Some(vec![CompletedPart::new(4, "x")]),
            Some(vec![CompletedPart::new(1, "a"), CompletedPart::new(1, "b")]),
        ] {
            assert!(matches!(
                coordinator.complete_upload(started.session_id, parts).await,
                Err(UploadError::Validation(_))
            ));
        }
        let session = coordinator.get_session(started.session_id).await.unwrap();
        assert_eq!(session.status, UploadStatus::Uploading);
    }

    #[tokio::test]
    async fn rejected_tokens_leave_session_retryable() {
        let (coordinator, gateway, store) = coordinator().await;
        let started = coordinator.start_upload(declare(25 * MIB)).await.unwrap();
        let mpid = multipart_id(&store, started.session_id).await;
        for n in 1..=3 {
            gateway.stage_part(&mpid, n, &format!("etag-{n}"));
        }

        let stale = vec![
            CompletedPart::new(1, "etag-1"),
            CompletedPart::new(2, "stale"),
            CompletedPart::new(3, "etag-3"),
        ];
        let err = coordinator
            .complete_upload(started.session_id, Some(stale))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Integrity(_)));

        let session = coordinator.get_session(started.session_id).await.unwrap();
        assert_eq!(session.status, UploadStatus::Uploading);
        assert_eq!(session.multipart_id.as_deref(), Some(mpid.as_str()));

        let fixed = (1..=3)
            .map(|n| CompletedPart::new(n, format!("etag-{n}")))
            .collect();
        let session = coordinator
            .complete_upload(started.session_id, Some(fixed))
            .await
            .unwrap();
        assert_eq!(session.status, UploadStatus::Complete);
    }

    #[tokio::test]
    async fn part_urls_require_active_multipart() {
        let (coordinator, gateway, store) = coordinator().await;

        let single = coordinator.start_upload(declare(1)).await.unwrap();
        assert!(matches!(
            coordinator.part_url(single.session_id, 1).await,
            Err(UploadError::InvalidState { .. })
        ));

        let pending = coordinator.create_session(declare(25 * MIB)).await.unwrap();
        assert!(matches!(
            coordinator.part_url(pending.id, 1).await,
            Err(UploadError::InvalidState {
                status: UploadStatus::Pending,
                ..
            })
        ));

        let started = coordinator.start_upload(declare(25 * MIB)).await.unwrap();
        let url = coordinator.part_url(started.session_id, 2).await.unwrap();
        assert!(url.contains("partNumber=2"));
        assert!(matches!(
            coordinator.part_url(started.session_id, 0).await,
            Err(UploadError::Validation(_))
        ));
        assert!(matches!(
            coordinator.part_url(started.session_id, 4).await,
            Err(UploadError::Validation(_))
        ));

        let mpid = multipart_id(&store, started.session_id).await;
        for n in 1..=3 {
            gateway.stage_part(&mpid, n, "t");
        }
        let parts = (1..=3).map(|n| CompletedPart::new(n, "t")).collect();
        coordinator
            .complete_upload(started.session_id, Some(parts))
            .await
            .unwrap();
        assert!(matches!(
            coordinator.part_url(started.session_id, 1).await,
            Err(UploadError::InvalidState {
                status: UploadStatus::Complete,
                ..
            })
        ));

        assert!(matches!(
            coordinator.part_url(Uuid::new_v4(), 1).await,
            Err(UploadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn presigned_parts_cover_every_part() {
        let (coordinator, _, _) = coordinator().await;
        let mut request = declare(25 * MIB);
        request.presign_parts = true;
        let started = coordinator.start_upload(request).await.unwrap();
        let numbers: Vec<u32> = started.part_urls.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn abort_is_idempotent_and_releases_sequence() {
        let (coordinator, gateway, store) = coordinator().await;
        let started = coordinator.start_upload(declare(25 * MIB)).await.unwrap();
        let mpid = multipart_id(&store, started.session_id).await;

        let session = coordinator.abort_upload(started.session_id).await.unwrap();
        assert_eq!(session.status, UploadStatus::Aborted);
        assert_eq!(session.multipart_id, None);
        assert_eq!(gateway.state.lock().unwrap().aborted, vec![mpid]);

        let again = coordinator.abort_upload(started.session_id).await.unwrap();
        assert_eq!(again.status, UploadStatus::Aborted);
        assert_eq!(gateway.state.lock().unwrap().aborted.len(), 1);

        assert!(matches!(
            coordinator.complete_upload(started.session_id, None).await,
            Err(UploadError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn abort_of_single_and_complete_sessions() {
        let (coordinator, gateway, _) = coordinator().await;
        let single = coordinator.start_upload(declare(1)).await.unwrap();
        let session = coordinator.abort_upload(single.session_id).await.unwrap();
        assert_eq!(session.status, UploadStatus::Aborted);
        assert!(gateway.state.lock().unwrap().aborted.is_empty());

        let done = coordinator.start_upload(declare(1)).await.unwrap();
        gateway.put_object(&done.key, "e", 1);
        coordinator.complete_upload(done.session_id, None).await.unwrap();
        assert!(matches!(
            coordinator.abort_upload(done.session_id).await,
            Err(UploadError::InvalidState {
                status: UploadStatus::Complete,
                ..
            })
        ));
    }

    /// Start a 25 MiB multipart upload with all three parts staged.
    async fn staged_multipart(
        coordinator: &UploadCoordinator,
        gateway: &FakeGateway,
        store: &SqliteSessionStore,
    ) -> (Uuid, Vec<CompletedPart>) {
        let started = coordinator.start_upload(declare(25 * MIB)).await.unwrap();
        let mpid = multipart_id(store, started.session_id).await;
        for n in 1..=3 {
            gateway.stage_part(&mpid, n, &format!("etag-{n}"));
        }
        let parts = (1..=3)
            .map(|n| CompletedPart::new(n, format!("etag-{n}")))
            .collect();
        (started.session_id, parts)
    }

    #[tokio::test]
    async fn dropped_completion_before_assembly_can_be_retried() {
        let (coordinator, gateway, store) = coordinator().await;
        let (id, parts) = staged_multipart(&coordinator, &gateway, &store).await;

        gateway.stall_completion(Some(Stall::BeforeAssembly));
        let dropped = tokio::time::timeout(
            Duration::from_millis(50),
            coordinator.complete_upload(id, Some(parts.clone())),
        )
        .await;
        assert!(dropped.is_err());
        let session = coordinator.get_session(id).await.unwrap();
        assert_eq!(session.status, UploadStatus::Completing);

        gateway.stall_completion(None);
        let session = coordinator.complete_upload(id, Some(parts)).await.unwrap();
        assert_eq!(session.status, UploadStatus::Complete);
        assert_eq!(session.multipart_id, None);
        assert_eq!(gateway.state.lock().unwrap().completions.len(), 1);
    }

    #[tokio::test]
    async fn dropped_completion_after_assembly_is_recorded_on_retry() {
        let (coordinator, gateway, store) = coordinator().await;
        let (id, parts) = staged_multipart(&coordinator, &gateway, &store).await;

        gateway.stall_completion(Some(Stall::AfterAssembly));
        let dropped = tokio::time::timeout(
            Duration::from_millis(50),
            coordinator.complete_upload(id, Some(parts.clone())),
        )
        .await;
        assert!(dropped.is_err());
        gateway.stall_completion(None);

        // The object exists, so abort must not discard it.
        assert!(matches!(
            coordinator.abort_upload(id).await,
            Err(UploadError::InvalidState {
                status: UploadStatus::Completing,
                ..
            })
        ));

        let session = coordinator.complete_upload(id, Some(parts)).await.unwrap();
        assert_eq!(session.status, UploadStatus::Complete);
        assert_eq!(session.parts.0.len(), 3);
        let expected = format!("{:x}-3", md5::compute("etag-1etag-2etag-3"));
        assert_eq!(session.final_etag.as_deref(), Some(expected.as_str()));
        assert_eq!(session.final_size, Some((25 * MIB) as i64));
        // Assembled once; the retry only recorded the result.
        assert_eq!(gateway.state.lock().unwrap().completions.len(), 1);
    }

    #[tokio::test]
    async fn vanished_sequence_aborts_instead_of_retrying() {
        let (coordinator, gateway, store) = coordinator().await;
        let (id, parts) = staged_multipart(&coordinator, &gateway, &store).await;
        let session = coordinator.get_session(id).await.unwrap();
        let mpid = session.multipart_id.clone().unwrap();
        gateway
            .abort_multipart(&session.storage_key, &mpid)
            .await
            .unwrap();

        let err = coordinator
            .complete_upload(id, Some(parts.clone()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::InvalidState {
                status: UploadStatus::Aborted,
                ..
            }
        ));
        let session = coordinator.get_session(id).await.unwrap();
        assert_eq!(session.status, UploadStatus::Aborted);
        assert_eq!(session.multipart_id, None);

        assert!(matches!(
            coordinator.complete_upload(id, Some(parts)).await,
            Err(UploadError::InvalidState {
                status: UploadStatus::Aborted,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn view_url_only_for_complete_sessions() {
        let (coordinator, gateway, _) = coordinator().await;
        let started = coordinator.start_upload(declare(1)).await.unwrap();
        assert!(matches!(
            coordinator.view_url(started.session_id).await,
            Err(UploadError::InvalidState { .. })
        ));
        gateway.put_object(&started.key, "e", 1);
        coordinator
            .complete_upload(started.session_id, None)
            .await
            .unwrap();
        assert!(coordinator.view_url(started.session_id).await.is_ok());
    }
}
