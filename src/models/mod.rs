//! Core data models.
//!
//! `session` is the coordinator's state machine entity, `api` carries the JSON
//! wire types, and `object`/`multipart` are the records kept by the local
//! storage backend. Rows map to SQLite via `sqlx::FromRow`.

pub mod api;
pub mod multipart;
pub mod object;
pub mod session;
