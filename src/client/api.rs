//! The coordinator as seen from the client.

use super::{ClientError, ClientResult};
use crate::models::{
    api::{
        AbortUploadRequest, AbortUploadResponse, CompleteUploadRequest, ErrorBody, SessionView,
        StartUploadRequest, StartUploadResponse, UrlResponse,
    },
    session::CompletedPart,
};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use uuid::Uuid;

#[async_trait]
pub trait UploadApi: Send + Sync {
    async fn start_upload(&self, request: &StartUploadRequest) -> ClientResult<StartUploadResponse>;

    async fn part_url(&self, session_id: Uuid, part_number: u32) -> ClientResult<String>;

    async fn complete_upload(
        &self,
        session_id: Uuid,
        parts: Option<Vec<CompletedPart>>,
    ) -> ClientResult<SessionView>;

    async fn abort_upload(&self, session_id: Uuid) -> ClientResult<AbortUploadResponse>;
}

/// [`UploadApi`] over the JSON endpoints under `/api/upload`.
#[derive(Debug, Clone)]
pub struct HttpUploadApi {
    client: Client,
    base_url: String,
}

impl HttpUploadApi {
    pub fn new(client: Client, server_url: &str) -> Self {
        Self {
            client,
            base_url: format!("{}/api/upload", server_url.trim_end_matches('/')),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

/// Decode a success body, or turn an error body back into [`ClientError::Api`].
async fn decode<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let text = response.text().await?;
    Err(match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => ClientError::Api {
            kind: body.kind,
            status: status.as_u16(),
            message: body.error,
        },
        Err(_) => ClientError::Api {
            kind: "internal".into(),
            status: status.as_u16(),
            message: text,
        },
    })
}

#[async_trait]
impl UploadApi for HttpUploadApi {
    async fn start_upload(
        &self,
        request: &StartUploadRequest,
    ) -> ClientResult<StartUploadResponse> {
        let response = self
            .client
            .post(self.endpoint("start-upload"))
            .json(request)
            .send()
            .await?;
        decode(response).await
    }

    async fn part_url(&self, session_id: Uuid, part_number: u32) -> ClientResult<String> {
        let response = self
            .client
            .get(self.endpoint("part-url"))
            .query(&[
                ("sessionId", session_id.to_string()),
                ("partNumber", part_number.to_string()),
            ])
            .send()
            .await?;
        let body: UrlResponse = decode(response).await?;
        Ok(body.url)
    }

    async fn complete_upload(
        &self,
        session_id: Uuid,
        parts: Option<Vec<CompletedPart>>,
    ) -> ClientResult<SessionView> {
        let response = self
            .client
            .post(self.endpoint("complete-upload"))
            .json(&CompleteUploadRequest {
                session_id: Some(session_id),
                parts,
            })
            .send()
            .await?;
        decode(response).await
    }

    async fn abort_upload(&self, session_id: Uuid) -> ClientResult<AbortUploadResponse> {
        let response = self
            .client
            .post(self.endpoint("abort-upload"))
            .json(&AbortUploadRequest {
                session_id: Some(session_id),
            })
            .send()
            .await?;
        decode(response).await
    }
}
