//! Domain services: chunked uploads, encryption, storage backends, quotas,
//! transfer lifecycles, sender verification and the cleanup scheduler.

pub mod chunk_store;
pub mod cleanup;
pub mod direct_transfer_service;
pub mod email_verification;
pub mod encryption;
pub mod error;
pub mod file_service;
pub mod kv;
pub mod notification;
pub mod object_storage;
pub mod rate_limit;
pub mod redis_kv;
pub mod s3_storage;
pub mod secrets;
pub mod transfer_service;
