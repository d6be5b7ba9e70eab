//! HTTP handlers. Each one extracts input, calls a service and shapes the
//! JSON or file response; failures go through [`AppError`](crate::errors::AppError).

pub mod direct_transfer_handlers;
pub mod email_handlers;
pub mod health_handlers;
pub mod transfer_handlers;
pub mod upload_handlers;

use crate::{
    models::file::{Download, PurgeTarget},
    state::AppState,
};
use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::Response,
};
use std::{convert::Infallible, net::SocketAddr};

/// Caller address: the socket peer, or the first `X-Forwarded-For` hop when
/// the deployment sits behind a trusted proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl FromRequestParts<AppState> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(ClientIp(resolve_client_ip(parts, state.trust_forwarded_for)))
    }
}

fn resolve_client_ip(parts: &Parts, trust_forwarded_for: bool) -> String {
    let forwarded = trust_forwarded_for
        .then(|| parts.headers.get("x-forwarded-for"))
        .flatten()
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".into())
}

#[derive(Debug, Clone, Copy)]
pub enum Disposition {
    Inline,
    Attachment,
}

/// Quoted-string safe filename: quotes, backslashes, control and non-ASCII
/// characters become `_`.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' | '/' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "download".into()
    } else {
        trimmed.to_string()
    }
}

/// Raw file bytes with no-cache headers.
pub fn file_response(download: Download, disposition: Disposition) -> Response {
    let length = download.content.len();
    let mut response = Response::new(Body::from(download.content));
    *response.status_mut() = StatusCode::OK;
    set_file_headers(
        response.headers_mut(),
        &download.file.mime_type,
        &download.file.original_name,
        length,
        disposition,
    );
    response
}

fn set_file_headers(
    headers: &mut HeaderMap,
    mime_type: &str,
    filename: &str,
    length: usize,
    disposition: Disposition,
) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    let kind = match disposition {
        Disposition::Inline => "inline",
        Disposition::Attachment => "attachment",
    };
    let value = format!("{kind}; filename=\"{}\"", sanitize_filename(filename));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );

    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate, max-age=0"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
}

/// Run a consumed grant's purge after the response is built. A failure is
/// left for the cleanup scheduler.
pub fn spawn_purge(state: &AppState, target: PurgeTarget) {
    let state = state.clone();
    tokio::spawn(async move {
        let result = match target {
            PurgeTarget::Transfer(id) => state.transfers.purge_transfer(id).await,
            PurgeTarget::DirectTransfer(id) => state.direct.purge(id).await,
        };
        if let Err(err) = result {
            tracing::warn!("deferred purge of {:?} failed: {}", target, err);
        }
    });
}
