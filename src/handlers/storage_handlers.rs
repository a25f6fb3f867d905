//! Signed storage endpoints of the local backend.
//!
//! These are the targets of the URLs minted by the coordinator. Every request
//! must carry a valid, unexpired signature for exactly the key and operation
//! it performs; anything else is refused with 403 before a byte is read.
//! Bodies are streamed to and from disk without buffering.

use crate::{
    errors::AppError,
    models::object::StoredObject,
    services::{
        local_storage::LocalStorage,
        signer::{SignedOperation, SignedQuery},
    },
};
use axum::{
    body::Body,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use std::io;
use tokio_util::io::ReaderStream;

fn signed_query(
    query: Result<Query<SignedQuery>, QueryRejection>,
) -> Result<SignedQuery, AppError> {
    query
        .map(|Query(query)| query)
        .map_err(|_| AppError::forbidden("missing or malformed signature parameters"))
}

/// `PUT /storage/{*key}`: a single object, or one part when the URL carries
/// `uploadId` and `partNumber`. Responds with the quoted ETag header.
pub async fn put_signed(
    State(storage): State<LocalStorage>,
    Path(key): Path<String>,
    query: Result<Query<SignedQuery>, QueryRejection>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let query = signed_query(query)?;
    let operation = query.operation("PUT");
    storage
        .signer()
        .verify(&key, operation, query.expires, &query.signature)?;

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let etag = match operation {
        SignedOperation::PutPart {
            upload_id,
            part_number,
        } => {
            storage
                .put_part_stream(&key, upload_id, part_number, stream)
                .await?
                .etag
        }
        _ => {
            let content_type = headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string());
            storage
                .put_object_stream(&key, content_type, stream)
                .await?
                .etag
        }
    };

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

/// `GET /storage/{*key}` as a streaming response.
pub async fn get_signed(
    State(storage): State<LocalStorage>,
    Path(key): Path<String>,
    query: Result<Query<SignedQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let query = signed_query(query)?;
    storage.signer().verify(
        &key,
        SignedOperation::GetObject,
        query.expires,
        &query.signature,
    )?;

    let (meta, file) = storage.get_object_reader(&key).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &StoredObject) {
    if let Some(value) = meta
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&meta.size_bytes.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.etag)) {
        headers.insert(header::ETAG, value);
    }
    let last_modified = meta
        .last_modified
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    if let Ok(value) = HeaderValue::from_str(&last_modified) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
