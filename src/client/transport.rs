//! Raw PUTs against signed storage URLs.

use super::{ClientError, ClientResult};
use crate::models::session::normalize_etag;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, header};

#[async_trait]
pub trait PartTransport: Send + Sync {
    /// PUT `body` to `url` and return the integrity token storage reported.
    async fn put(&self, url: &str, body: Bytes, content_type: Option<&str>) -> ClientResult<String>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PartTransport for HttpTransport {
    async fn put(
        &self,
        url: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> ClientResult<String> {
        let mut request = self.client.put(url).body(body);
        if let Some(content_type) = content_type {
            request = request.header(header::CONTENT_TYPE, content_type);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                kind: "storage".into(),
                status: status.as_u16(),
                message,
            });
        }

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(normalize_etag)
            .filter(|etag| !etag.is_empty())
            .ok_or_else(|| ClientError::Protocol("storage response carried no ETag".into()))?;
        Ok(etag)
    }
}
