//! Time-bounded URL signatures for the local storage endpoints.
//!
//! A signature is `HMAC-SHA256(secret, method \n key \n uploadId \n partNumber \n expires)`
//! encoded as URL-safe base64. Changing any of these fields, or presenting the
//! URL after `expires`, invalidates it.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use hmac::{Hmac, Mac, digest::InvalidLength};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signed URL expired")]
    Expired,
    #[error("signature does not match")]
    Mismatch,
    #[error("signature is not valid base64")]
    Malformed,
}

/// What a signed URL authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedOperation<'a> {
    PutObject,
    PutPart { upload_id: &'a str, part_number: u32 },
    GetObject,
}

impl SignedOperation<'_> {
    fn method(&self) -> &'static str {
        match self {
            Self::PutObject | Self::PutPart { .. } => "PUT",
            Self::GetObject => "GET",
        }
    }
}

/// Query parameters carried by a signed URL.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedQuery {
    pub expires: i64,
    pub signature: String,
    pub upload_id: Option<String>,
    pub part_number: Option<u32>,
}

impl SignedQuery {
    pub fn operation(&self, method: &str) -> SignedOperation<'_> {
        match (&self.upload_id, self.part_number) {
            (Some(upload_id), Some(part_number)) => SignedOperation::PutPart {
                upload_id,
                part_number,
            },
            _ if method.eq_ignore_ascii_case("GET") => SignedOperation::GetObject,
            _ => SignedOperation::PutObject,
        }
    }
}

#[derive(Clone)]
pub struct UrlSigner {
    mac: HmacSha256,
    base_url: String,
}

impl UrlSigner {
    pub fn new(secret: &[u8], base_url: impl Into<String>) -> Result<Self, InvalidLength> {
        Ok(Self {
            mac: HmacSha256::new_from_slice(secret)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Build a URL for `operation` on `key`, valid for `ttl` from now.
    pub fn sign(&self, key: &str, operation: SignedOperation<'_>, ttl: Duration) -> String {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let signature = URL_SAFE_NO_PAD.encode(self.digest(key, &operation, expires));

        let mut url = format!(
            "{}/storage/{}?expires={}&signature={}",
            self.base_url, key, expires, signature
        );
        if let SignedOperation::PutPart {
            upload_id,
            part_number,
        } = operation
        {
            url.push_str(&format!("&uploadId={upload_id}&partNumber={part_number}"));
        }
        url
    }

    /// Check a presented signature. Expiry is checked before the MAC.
    pub fn verify(
        &self,
        key: &str,
        operation: SignedOperation<'_>,
        expires: i64,
        signature: &str,
    ) -> Result<(), SignatureError> {
        if Utc::now().timestamp() > expires {
            return Err(SignatureError::Expired);
        }
        let presented = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| SignatureError::Malformed)?;

        let mut mac = self.mac.clone();
        mac.update(canonical(key, &operation, expires).as_bytes());
        mac.verify_slice(&presented)
            .map_err(|_| SignatureError::Mismatch)
    }

    fn digest(&self, key: &str, operation: &SignedOperation<'_>, expires: i64) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(canonical(key, operation, expires).as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

fn canonical(key: &str, operation: &SignedOperation<'_>, expires: i64) -> String {
    let (upload_id, part_number) = match operation {
        SignedOperation::PutPart {
            upload_id,
            part_number,
        } => (*upload_id, part_number.to_string()),
        _ => ("", String::new()),
    };
    format!(
        "{}\n{}\n{}\n{}\n{}",
        operation.method(),
        key,
        upload_id,
        part_number,
        expires
    )
}
