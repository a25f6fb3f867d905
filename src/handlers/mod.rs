//! axum handlers. Each module receives only the part of [`AppState`] it needs.

use crate::services::{coordinator::UploadCoordinator, local_storage::LocalStorage};
use axum::extract::FromRef;

pub mod health_handlers;
pub mod storage_handlers;
pub mod upload_handlers;

/// Shared router state.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: UploadCoordinator,
    pub storage: LocalStorage,
}

impl FromRef<AppState> for UploadCoordinator {
    fn from_ref(state: &AppState) -> Self {
        state.coordinator.clone()
    }
}

impl FromRef<AppState> for LocalStorage {
    fn from_ref(state: &AppState) -> Self {
        state.storage.clone()
    }
}
