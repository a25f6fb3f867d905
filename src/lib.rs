//! Signed-URL uploads: a coordinator that tracks upload sessions and hands out
//! short-lived storage URLs, a local storage backend that honours them, and a
//! client that moves file bytes straight to storage in bounded-concurrency parts.

pub mod chunking;
pub mod client;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
