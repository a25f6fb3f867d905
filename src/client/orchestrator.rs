//! ChunkedUploader: drives one file through the upload protocol.
//!
//! The uploader follows whatever strategy the coordinator picked. Multipart
//! transfers run at most `max_concurrent_parts` part PUTs at once, each task
//! holding a semaphore permit for its whole lifetime. Part URLs presigned at
//! start are used while younger than `url_ttl`; later parts fetch a fresh one.
//! The first failed part, or a cancellation, stops scheduling, cancels the
//! parts still in flight and aborts the session. `complete-upload` is only
//! called once every part has succeeded, with the parts sorted ascending.

use super::{
    ClientError, ClientResult, api::UploadApi, source::UploadSource, transport::PartTransport,
};
use crate::chunking::{self, PartRange};
use crate::config::UploadConfig;
use crate::models::{
    api::{SessionView, StartUploadRequest, StartUploadResponse},
    session::{CompletedPart, UploadStrategy},
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, watch},
    task::JoinSet,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What the caller declares about the file. The size comes from the source.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub resource_name: String,
    pub description: Option<String>,
    pub file_name: String,
    pub content_type: Option<String>,
}

/// Byte-weighted transfer progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub completed_bytes: u64,
    pub total_bytes: u64,
    pub completed_parts: u32,
    pub total_parts: u32,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.total_parts > 0 && self.completed_parts == self.total_parts {
                1.0
            } else {
                0.0
            };
        }
        self.completed_bytes as f64 / self.total_bytes as f64
    }

    pub fn percent(&self) -> u8 {
        (self.fraction() * 100.0).floor().min(100.0) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Idle,
    Uploading,
    Completing,
    Complete,
    /// Cancelled by the caller; the session was aborted.
    Aborted,
    /// A request failed; the session was aborted.
    Failed,
}

type PartTasks = JoinSet<ClientResult<CompletedPart>>;

/// Part URLs handed out by `start-upload`, trusted until they expire.
struct PresignedParts {
    urls: HashMap<u32, String>,
    valid_until: Instant,
}

impl PresignedParts {
    fn url(&self, part_number: u32) -> Option<&str> {
        if Instant::now() >= self.valid_until {
            return None;
        }
        self.urls.get(&part_number).map(String::as_str)
    }
}

pub struct ChunkedUploader {
    api: Arc<dyn UploadApi>,
    transport: Arc<dyn PartTransport>,
    max_concurrent_parts: usize,
    url_ttl: Duration,
    presign_parts: bool,
    cancel: CancellationToken,
    progress: watch::Sender<Progress>,
    status: watch::Sender<TransferStatus>,
}

impl ChunkedUploader {
    pub fn new(
        api: Arc<dyn UploadApi>,
        transport: Arc<dyn PartTransport>,
        config: &UploadConfig,
    ) -> Self {
        Self {
            api,
            transport,
            max_concurrent_parts: config.max_concurrent_parts.max(1),
            url_ttl: config.url_ttl,
            presign_parts: false,
            cancel: CancellationToken::new(),
            progress: watch::Sender::new(Progress::default()),
            status: watch::Sender::new(TransferStatus::Idle),
        }
    }

    /// Ask for every part URL upfront instead of one request per part.
    pub fn with_presigned_parts(mut self, presign_parts: bool) -> Self {
        self.presign_parts = presign_parts;
        self
    }

    /// Token that cancels the transfer when triggered. Cancellation is final
    /// for this uploader.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<TransferStatus> {
        self.status.subscribe()
    }

    pub fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    pub fn status(&self) -> TransferStatus {
        *self.status.borrow()
    }

    /// Upload `source` and return the completed session.
    ///
    /// Any failure after the session was started aborts it before the error is
    /// returned. A cancelled transfer yields [`ClientError::Cancelled`].
    pub async fn upload(
        &self,
        request: UploadRequest,
        source: Arc<dyn UploadSource>,
    ) -> ClientResult<SessionView> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let total_bytes = source.size();
        self.progress.send_replace(Progress {
            total_bytes,
            ..Progress::default()
        });
        self.status.send_replace(TransferStatus::Uploading);

        let content_type = request.content_type.clone();
        let start = StartUploadRequest {
            resource_name: request.resource_name,
            description: request.description,
            file_name: request.file_name,
            content_type: request.content_type,
            size: Some(total_bytes),
            presign_parts: self.presign_parts,
        };
        let requested_at = Instant::now();
        let started = match self.api.start_upload(&start).await {
            Ok(started) => started,
            Err(err) => {
                self.reset(&err);
                return Err(err);
            }
        };
        let session_id = started.session_id;
        info!(
            %session_id,
            strategy = ?started.strategy,
            size = total_bytes,
            "upload session started"
        );

        let transferred = match started.strategy {
            UploadStrategy::Single => self
                .transfer_single(&started, source, content_type.as_deref())
                .await
                .map(|()| None),
            UploadStrategy::Multipart => self
                .transfer_parts(&started, source, requested_at)
                .await
                .map(Some),
        };
        let outcome = match transferred {
            Ok(parts) => {
                self.status.send_replace(TransferStatus::Completing);
                self.api.complete_upload(session_id, parts).await
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(session) => {
                self.status.send_replace(TransferStatus::Complete);
                info!(%session_id, token = ?session.integrity_token, "upload complete");
                Ok(session)
            }
            Err(err) => {
                self.abandon(session_id, &err).await;
                Err(err)
            }
        }
    }

    async fn transfer_single(
        &self,
        started: &StartUploadResponse,
        source: Arc<dyn UploadSource>,
        content_type: Option<&str>,
    ) -> ClientResult<()> {
        let url = started
            .upload_url
            .as_deref()
            .ok_or_else(|| ClientError::Protocol("single upload without uploadUrl".into()))?;
        let total_bytes = source.size();
        self.progress.send_modify(|p| p.total_parts = 1);

        let body = source.read_range(0, total_bytes).await?;
        let etag = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
            result = self.transport.put(url, body, content_type) => {
                result.map_err(|err| part_error(1, err))?
            }
        };

        debug!(etag = %etag, "object stored");
        self.progress.send_modify(|p| {
            p.completed_bytes = total_bytes;
            p.completed_parts = 1;
        });
        Ok(())
    }

    async fn transfer_parts(
        &self,
        started: &StartUploadResponse,
        source: Arc<dyn UploadSource>,
        requested_at: Instant,
    ) -> ClientResult<Vec<CompletedPart>> {
        let (Some(part_size), Some(expected)) = (started.part_size, started.parts_count) else {
            return Err(ClientError::Protocol(
                "multipart upload without partSize or partsCount".into(),
            ));
        };
        if part_size == 0 {
            return Err(ClientError::Protocol("part size of zero".into()));
        }

        let ranges = chunking::partition(source.size(), part_size);
        if ranges.len() as u64 != expected {
            return Err(ClientError::PartCountMismatch {
                expected,
                actual: ranges.len() as u64,
            });
        }
        self.progress
            .send_modify(|p| p.total_parts = ranges.len() as u32);

        let presigned = Arc::new(PresignedParts {
            urls: started
                .part_urls
                .iter()
                .map(|p| (p.part_number, p.url.clone()))
                .collect(),
            valid_until: requested_at + self.url_ttl,
        });
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_parts));
        let mut tasks = PartTasks::new();
        let mut pending = ranges.into_iter().peekable();
        let mut completed = Vec::with_capacity(expected as usize);

        loop {
            if pending.peek().is_none() && tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    shutdown(&mut tasks).await;
                    warn!(session_id = %started.session_id, "transfer cancelled");
                    return Err(ClientError::Cancelled);
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    let part = match joined {
                        Ok(Ok(part)) => part,
                        Ok(Err(err)) => {
                            shutdown(&mut tasks).await;
                            return Err(err);
                        }
                        Err(join_err) => {
                            shutdown(&mut tasks).await;
                            return Err(ClientError::Task(join_err));
                        }
                    };

                    let progress = {
                        self.progress.send_modify(|p| {
                            p.completed_bytes += part.size.unwrap_or(0);
                            p.completed_parts += 1;
                        });
                        *self.progress.borrow()
                    };
                    debug!(
                        part_number = part.part_number,
                        percent = progress.percent(),
                        "part uploaded"
                    );
                    completed.push(part);
                }

                permit = semaphore.clone().acquire_owned(), if pending.peek().is_some() => {
                    let permit = permit.map_err(|_| ClientError::Cancelled)?;
                    let Some(range) = pending.next() else {
                        continue;
                    };
                    tasks.spawn(upload_part(
                        self.api.clone(),
                        self.transport.clone(),
                        source.clone(),
                        presigned.clone(),
                        started.session_id,
                        range,
                        permit,
                    ));
                }
            }
        }

        if completed.is_empty() {
            return Err(ClientError::Cancelled);
        }
        completed.sort_by_key(|part| part.part_number);
        Ok(completed)
    }

    /// Abort the session and reset progress. Abort failures are logged only;
    /// the original error is what the caller sees.
    async fn abandon(&self, session_id: Uuid, err: &ClientError) {
        warn!(%session_id, error = %err, "aborting upload session");
        if let Err(abort_err) = self.api.abort_upload(session_id).await {
            warn!(%session_id, error = %abort_err, "abort request failed");
        }
        self.reset(err);
    }

    fn reset(&self, err: &ClientError) {
        self.progress.send_modify(|p| {
            p.completed_bytes = 0;
            p.completed_parts = 0;
        });
        self.status.send_replace(match err {
            ClientError::Cancelled => TransferStatus::Aborted,
            _ => TransferStatus::Failed,
        });
    }
}

async fn upload_part(
    api: Arc<dyn UploadApi>,
    transport: Arc<dyn PartTransport>,
    source: Arc<dyn UploadSource>,
    presigned: Arc<PresignedParts>,
    session_id: Uuid,
    range: PartRange,
    _permit: OwnedSemaphorePermit,
) -> ClientResult<CompletedPart> {
    let part_number = range.part_number;
    let url = match presigned.url(part_number) {
        Some(url) => url.to_string(),
        None => api.part_url(session_id, part_number).await?,
    };

    let body = source.read_range(range.offset, range.len).await?;
    let etag = transport
        .put(&url, body, None)
        .await
        .map_err(|err| part_error(part_number, err))?;

    Ok(CompletedPart {
        part_number,
        etag,
        size: Some(range.len),
    })
}

/// Cancel every task still running and wait until they are gone.
async fn shutdown(tasks: &mut PartTasks) {
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
}

fn part_error(part_number: u32, err: ClientError) -> ClientError {
    match err {
        ClientError::Cancelled | ClientError::Transport { .. } => err,
        other => ClientError::Transport {
            part_number,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        api::{AbortUploadResponse, PartUrl},
        session::UploadStatus,
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };
    use std::time::Duration;

    struct FakeApi {
        start: StartUploadResponse,
        events: Mutex<Vec<String>>,
        completed_with: Mutex<Option<Option<Vec<CompletedPart>>>>,
    }

    impl FakeApi {
        fn new(start: StartUploadResponse) -> Arc<Self> {
            Arc::new(Self {
                start,
                events: Mutex::new(Vec::new()),
                completed_with: Mutex::new(None),
            })
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn saw(&self, event: &str) -> bool {
            self.events().iter().any(|e| e == event)
        }
    }

    #[async_trait]
    impl UploadApi for FakeApi {
        async fn start_upload(
            &self,
            _request: &StartUploadRequest,
        ) -> ClientResult<StartUploadResponse> {
            self.events.lock().unwrap().push("start".into());
            Ok(self.start.clone())
        }

        async fn part_url(&self, _session_id: Uuid, part_number: u32) -> ClientResult<String> {
            self.events
                .lock()
                .unwrap()
                .push(format!("part-url {part_number}"));
            Ok(format!("mem://part/{part_number}"))
        }

        async fn complete_upload(
            &self,
            session_id: Uuid,
            parts: Option<Vec<CompletedPart>>,
        ) -> ClientResult<SessionView> {
            self.events.lock().unwrap().push("complete".into());
            *self.completed_with.lock().unwrap() = Some(parts.clone());
            Ok(SessionView {
                id: session_id,
                resource_name: "report".into(),
                description: None,
                file_name: "report.bin".into(),
                key: "report.bin".into(),
                content_type: None,
                size: 0,
                strategy: self.start.strategy,
                status: UploadStatus::Complete,
                parts_count: self.start.parts_count,
                parts: parts.unwrap_or_default(),
                integrity_token: Some("final".into()),
                final_size: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
        }

        async fn abort_upload(&self, _session_id: Uuid) -> ClientResult<AbortUploadResponse> {
            self.events.lock().unwrap().push("abort".into());
            Ok(AbortUploadResponse {
                ok: true,
                status: UploadStatus::Aborted,
            })
        }
    }

    /// Sleeps per part, tracks concurrency and fails the configured part.
    #[derive(Default)]
    struct FakeTransport {
        delays_ms: HashMap<u32, u64>,
        failing: Option<u32>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        finished: Mutex<Vec<u32>>,
        content_types: Mutex<Vec<Option<String>>>,
    }

    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl FakeTransport {
        fn finished(&self) -> Vec<u32> {
            self.finished.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PartTransport for FakeTransport {
        async fn put(
            &self,
            url: &str,
            _body: Bytes,
            content_type: Option<&str>,
        ) -> ClientResult<String> {
            let part_number: u32 = url.rsplit('/').next().unwrap().parse().unwrap();
            self.content_types
                .lock()
                .unwrap()
                .push(content_type.map(str::to_string));

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            let _guard = InFlight(&self.in_flight);
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let delay = self.delays_ms.get(&part_number).copied().unwrap_or(5);
            tokio::time::sleep(Duration::from_millis(delay)).await;

            if self.failing == Some(part_number) {
                return Err(ClientError::Api {
                    kind: "storage".into(),
                    status: 500,
                    message: "connection reset".into(),
                });
            }
            self.finished.lock().unwrap().push(part_number);
            Ok(format!("etag-{part_number}"))
        }
    }

    fn multipart(parts_count: u64, part_size: u64) -> StartUploadResponse {
        StartUploadResponse {
            session_id: Uuid::new_v4(),
            strategy: UploadStrategy::Multipart,
            key: "report.bin".into(),
            upload_url: None,
            part_size: Some(part_size),
            parts_count: Some(parts_count),
            part_urls: Vec::new(),
        }
    }

    fn request() -> UploadRequest {
        UploadRequest {
            resource_name: "report".into(),
            description: None,
            file_name: "report.bin".into(),
            content_type: Some("application/octet-stream".into()),
        }
    }

    fn source(len: usize) -> Arc<dyn UploadSource> {
        Arc::new(Bytes::from(vec![7u8; len]))
    }

    fn config(max_concurrent_parts: usize) -> UploadConfig {
        UploadConfig {
            max_concurrent_parts,
            ..UploadConfig::default()
        }
    }

    #[tokio::test]
    async fn parts_run_bounded_and_complete_sorted() {
        let api = FakeApi::new(multipart(10, 4));
        // Later parts finish first.
        let transport = Arc::new(FakeTransport {
            delays_ms: (1..=10).map(|n| (n, u64::from(11 - n) * 5)).collect(),
            ..FakeTransport::default()
        });
        let uploader = ChunkedUploader::new(api.clone(), transport.clone(), &config(3));

        let session = uploader.upload(request(), source(40)).await.unwrap();

        assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 3);
        let handed: Vec<u32> = session.parts.iter().map(|p| p.part_number).collect();
        assert_eq!(handed, (1..=10).collect::<Vec<_>>());
        assert_eq!(session.parts[0].etag, "etag-1");
        assert_ne!(transport.finished(), handed);

        let progress = uploader.progress();
        assert_eq!(progress.completed_bytes, 40);
        assert_eq!(progress.completed_parts, 10);
        assert_eq!(progress.percent(), 100);
        assert_eq!(uploader.status(), TransferStatus::Complete);
        assert!(!api.saw("abort"));
    }

    #[tokio::test]
    async fn scrambled_arrival_is_handed_off_ascending() {
        let api = FakeApi::new(multipart(3, 4));
        let transport = Arc::new(FakeTransport {
            delays_ms: HashMap::from([(1, 60), (2, 30), (3, 5)]),
            ..FakeTransport::default()
        });
        let uploader = ChunkedUploader::new(api.clone(), transport.clone(), &config(3));

        uploader.upload(request(), source(10)).await.unwrap();

        assert_eq!(transport.finished(), vec![3, 2, 1]);
        let handed = api.completed_with.lock().unwrap().clone().unwrap().unwrap();
        let numbers: Vec<u32> = handed.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(handed[2].size, Some(2));
    }

    #[tokio::test]
    async fn failed_part_cancels_the_rest_and_aborts() {
        let api = FakeApi::new(multipart(3, 4));
        let transport = Arc::new(FakeTransport {
            delays_ms: HashMap::from([(1, 500), (2, 10), (3, 500)]),
            failing: Some(2),
            ..FakeTransport::default()
        });
        let uploader = ChunkedUploader::new(api.clone(), transport.clone(), &config(3));

        let err = uploader.upload(request(), source(10)).await.unwrap_err();

        assert!(matches!(err, ClientError::Transport { part_number: 2, .. }));
        assert!(api.saw("abort"));
        assert!(!api.saw("complete"));
        assert!(transport.finished().is_empty());
        assert_eq!(transport.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(uploader.status(), TransferStatus::Failed);
    }

    #[tokio::test]
    async fn cancellation_aborts_and_resets_progress() {
        // Two slots: parts 2 and 3 hang while part 4 waits for a permit.
        let api = FakeApi::new(multipart(4, 4));
        let transport = Arc::new(FakeTransport {
            delays_ms: HashMap::from([(1, 5), (2, 5_000), (3, 5_000), (4, 5)]),
            ..FakeTransport::default()
        });
        let uploader = ChunkedUploader::new(api.clone(), transport.clone(), &config(2));
        let mut progress = uploader.subscribe_progress();

        let token = uploader.cancellation_token();
        let (api_seen, transport_seen) = (api.clone(), transport.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
            let puts = transport_seen.content_types.lock().unwrap().len();
            (api_seen.events(), puts)
        });

        let err = uploader.upload(request(), source(14)).await.unwrap_err();
        let (events_at_cancel, puts_at_cancel) = canceller.await.unwrap();

        assert!(matches!(err, ClientError::Cancelled));
        assert_eq!(transport.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(transport.finished(), vec![1]);
        assert_eq!(puts_at_cancel, 3);
        assert_eq!(transport.content_types.lock().unwrap().len(), puts_at_cancel);
        let after: Vec<String> = api
            .events()
            .into_iter()
            .filter(|event| event != "abort")
            .collect();
        assert_eq!(after, events_at_cancel);
        assert!(!api.saw("part-url 4"));
        assert!(api.saw("abort"));
        assert!(!api.saw("complete"));
        assert_eq!(progress.borrow_and_update().completed_bytes, 0);
        assert_eq!(uploader.status(), TransferStatus::Aborted);

        // A cancelled uploader refuses further work.
        assert!(matches!(
            uploader.upload(request(), source(10)).await,
            Err(ClientError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn configured_concurrency_bounds_parts_in_flight() {
        for limit in [1, 2, 5] {
            let api = FakeApi::new(multipart(8, 4));
            let transport = Arc::new(FakeTransport {
                delays_ms: (1..=8).map(|n| (n, 20)).collect(),
                ..FakeTransport::default()
            });
            let uploader = ChunkedUploader::new(api, transport.clone(), &config(limit));

            uploader.upload(request(), source(32)).await.unwrap();

            assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), limit);
        }
    }

    #[tokio::test]
    async fn single_strategy_puts_once_then_completes() {
        let api = FakeApi::new(StartUploadResponse {
            session_id: Uuid::new_v4(),
            strategy: UploadStrategy::Single,
            key: "small.txt".into(),
            upload_url: Some("mem://object/1".into()),
            part_size: None,
            parts_count: None,
            part_urls: Vec::new(),
        });
        let transport = Arc::new(FakeTransport::default());
        let uploader = ChunkedUploader::new(api.clone(), transport.clone(), &config(3));

        uploader.upload(request(), source(3)).await.unwrap();

        assert_eq!(api.events(), vec!["start", "complete"]);
        assert_eq!(*api.completed_with.lock().unwrap(), Some(None));
        assert_eq!(
            *transport.content_types.lock().unwrap(),
            vec![Some("application/octet-stream".to_string())]
        );
        assert_eq!(uploader.progress().percent(), 100);
    }

    #[tokio::test]
    async fn part_count_disagreement_aborts_before_sending() {
        let api = FakeApi::new(multipart(5, 4));
        let transport = Arc::new(FakeTransport::default());
        let uploader = ChunkedUploader::new(api.clone(), transport.clone(), &config(3));

        let err = uploader.upload(request(), source(10)).await.unwrap_err();

        assert!(matches!(
            err,
            ClientError::PartCountMismatch {
                expected: 5,
                actual: 3
            }
        ));
        assert_eq!(api.events(), vec!["start", "abort"]);
        assert!(transport.content_types.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn presigned_urls_skip_part_requests() {
        let mut start = multipart(3, 4);
        start.part_urls = (1..=3)
            .map(|n| PartUrl {
                part_number: n,
                url: format!("mem://presigned/{n}"),
            })
            .collect();
        let api = FakeApi::new(start);
        let transport = Arc::new(FakeTransport::default());
        let uploader = ChunkedUploader::new(api.clone(), transport.clone(), &config(3))
            .with_presigned_parts(true);

        uploader.upload(request(), source(10)).await.unwrap();

        assert_eq!(api.events(), vec!["start", "complete"]);
    }

    #[tokio::test]
    async fn expired_presigned_urls_are_fetched_again() {
        let mut start = multipart(2, 4);
        start.part_urls = (1..=2)
            .map(|n| PartUrl {
                part_number: n,
                url: format!("mem://presigned/{n}"),
            })
            .collect();
        let api = FakeApi::new(start);
        let config = UploadConfig {
            max_concurrent_parts: 1,
            url_ttl: Duration::ZERO,
            ..UploadConfig::default()
        };
        let transport = Arc::new(FakeTransport::default());
        let uploader =
            ChunkedUploader::new(api.clone(), transport, &config).with_presigned_parts(true);

        uploader.upload(request(), source(8)).await.unwrap();

        assert_eq!(
            api.events(),
            vec!["start", "part-url 1", "part-url 2", "complete"]
        );
    }

    #[tokio::test]
    async fn just_in_time_urls_are_requested_per_part() {
        let api = FakeApi::new(multipart(3, 4));
        let transport = Arc::new(FakeTransport::default());
        let uploader = ChunkedUploader::new(api.clone(), transport, &config(1));

        uploader.upload(request(), source(10)).await.unwrap();

        assert_eq!(
            api.events(),
            vec!["start", "part-url 1", "part-url 2", "part-url 3", "complete"]
        );
    }

    #[test]
    fn progress_is_byte_weighted() {
        let progress = Progress {
            completed_bytes: 5,
            total_bytes: 20,
            completed_parts: 1,
            total_parts: 2,
        };
        assert_eq!(progress.percent(), 25);
        assert_eq!(Progress::default().percent(), 0);
    }
}
