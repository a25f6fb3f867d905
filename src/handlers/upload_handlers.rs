//! HTTP handlers for the upload protocol. Bytes never pass through here; these
//! endpoints only move sessions through their lifecycle and hand out URLs.

use crate::{
    errors::AppError,
    models::api::{
        AbortUploadRequest, AbortUploadResponse, CompleteUploadRequest, PartUrlQuery,
        SessionView, StartUploadRequest, StartUploadResponse, UrlResponse,
    },
    services::coordinator::UploadCoordinator,
};
use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
};
use uuid::Uuid;

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AppError::validation(rejection.body_text()))
}

fn path_session_id(path: Result<Path<Uuid>, PathRejection>) -> Result<Uuid, AppError> {
    path.map(|Path(id)| id)
        .map_err(|rejection| AppError::validation(rejection.body_text()))
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, AppError> {
    value.ok_or_else(|| AppError::validation(format!("{field} is required")))
}

/// `POST /api/upload/start-upload`
pub async fn start_upload(
    State(coordinator): State<UploadCoordinator>,
    payload: Result<Json<StartUploadRequest>, JsonRejection>,
) -> Result<Json<StartUploadResponse>, AppError> {
    let request = json_body(payload)?;
    let started = coordinator.start_upload(request).await?;
    Ok(Json(started))
}

/// `GET /api/upload/part-url?sessionId=..&partNumber=..`
pub async fn part_url(
    State(coordinator): State<UploadCoordinator>,
    query: Result<Query<PartUrlQuery>, QueryRejection>,
) -> Result<Json<UrlResponse>, AppError> {
    let Query(query) = query.map_err(|rejection| AppError::validation(rejection.body_text()))?;
    let session_id = required(query.session_id, "sessionId")?;
    let part_number = required(query.part_number, "partNumber")?;

    let url = coordinator.part_url(session_id, part_number).await?;
    Ok(Json(UrlResponse { url }))
}

/// `POST /api/upload/complete-upload`
pub async fn complete_upload(
    State(coordinator): State<UploadCoordinator>,
    payload: Result<Json<CompleteUploadRequest>, JsonRejection>,
) -> Result<Json<SessionView>, AppError> {
    let request = json_body(payload)?;
    let session_id = required(request.session_id, "sessionId")?;

    let session = coordinator
        .complete_upload(session_id, request.parts)
        .await?;
    Ok(Json(SessionView::from(&session)))
}

/// `POST /api/upload/abort-upload`
pub async fn abort_upload(
    State(coordinator): State<UploadCoordinator>,
    payload: Result<Json<AbortUploadRequest>, JsonRejection>,
) -> Result<Json<AbortUploadResponse>, AppError> {
    let request = json_body(payload)?;
    let session_id = required(request.session_id, "sessionId")?;

    let session = coordinator.abort_upload(session_id).await?;
    Ok(Json(AbortUploadResponse {
        ok: true,
        status: session.status,
    }))
}

/// `GET /api/upload/sessions/{id}`
pub async fn get_session(
    State(coordinator): State<UploadCoordinator>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<SessionView>, AppError> {
    let session = coordinator.get_session(path_session_id(path)?).await?;
    Ok(Json(SessionView::from(&session)))
}

/// `GET /api/upload/sessions/{id}/view-url`
pub async fn view_url(
    State(coordinator): State<UploadCoordinator>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<UrlResponse>, AppError> {
    let url = coordinator.view_url(path_session_id(path)?).await?;
    Ok(Json(UrlResponse { url }))
}
