//! Favicon byte relay: serve third-party icons through this origin, but
//! only ones the store actually knows about.

use crate::app::AppState;
use crate::routes::UrlParam;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

/// `GET /favicon?url=`: 404 unless the URL is some record's favicon;
/// otherwise the fetched bytes with their Content-Type preserved.
pub async fn relay(State(state): State<Arc<AppState>>, Query(q): Query<UrlParam>) -> Response {
    let Some(url) = q.url.filter(|u| !u.is_empty()) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // The store check keeps this from being an open proxy.
    match state.store.has_favicon_url(&url).await {
        Ok(true) => {}
        Ok(false) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::warn!(url, error = %e, "favicon membership lookup failed");
            return StatusCode::NOT_FOUND.into_response();
        }
    }

    let resp = match state.relay_client.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(url, error = %e, "favicon fetch failed");
            return StatusCode::NOT_FOUND.into_response();
        }
    };
    if resp.status() != reqwest::StatusCode::OK {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Some(content_type) = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
    else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let bytes = match resp.bytes().await {
        Ok(b) => b,
        Err(e) => {
            tracing::debug!(url, error = %e, "favicon body read failed");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
}
