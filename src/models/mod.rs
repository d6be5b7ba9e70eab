//! Core data models for the transfer service.
//!
//! Persisted entities map to SQLite tables via `sqlx::FromRow`; request and
//! response shapes serialize as JSON via `serde`.

pub mod direct_transfer;
pub mod file;
pub mod transfer;
pub mod upload;
