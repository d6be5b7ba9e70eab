//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the database, the KV store and
//!   object storage

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::HashMap, fmt::Display};
use tracing::warn;

/// `GET /healthz`
///
/// Very small liveness probe. Always 200 and never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Runs a lightweight query against SQLite (`SELECT 1`).
/// 2. Pings the KV store.
/// 3. Probes object storage (a write/read/delete round trip on disk, a
///    bucket check on S3).
///
/// Returns JSON with a pass/fail flag per check; causes are only logged.
/// HTTP 200 when all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let sqlite_check = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&state.db)
        .await
    {
        Ok(1) => Ok(()),
        Ok(v) => Err(format!("unexpected result: {}", v)),
        Err(e) => Err(e.to_string()),
    };
    let checks = HashMap::from([
        ("sqlite", CheckStatus::from_result("sqlite", sqlite_check)),
        ("kv", CheckStatus::from_result("kv", state.kv.ping().await)),
        (
            "storage",
            CheckStatus::from_result("storage", state.storage.probe().await),
        ),
    ]);

    let overall_ok = checks.values().all(|check| check.ok);
    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

/// Outcome of one readiness check. Failure details go to the log only.
#[derive(Serialize, Debug, PartialEq)]
struct CheckStatus {
    ok: bool,
}

impl CheckStatus {
    fn from_result<E: Display>(name: &str, result: Result<(), E>) -> Self {
        if let Err(err) = result {
            warn!("readiness check `{}` failed: {}", name, err);
            return Self { ok: false };
        }
        Self { ok: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_checks_do_not_expose_their_cause() {
        let failed = CheckStatus::from_result("storage", Err("disk /srv/secret is read-only"));
        assert_eq!(failed, CheckStatus { ok: false });
        let rendered = serde_json::to_string(&failed).unwrap();
        assert_eq!(rendered, r#"{"ok":false}"#);

        assert!(CheckStatus::from_result::<String>("kv", Ok(())).ok);
    }
}
