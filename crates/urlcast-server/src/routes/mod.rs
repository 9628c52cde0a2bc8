//! HTTP handlers. The scan endpoint carries the real logic; the rest are
//! thin relays and redirects.

pub mod favicon;
pub mod scan;
pub mod shortener;

use crate::app::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;

pub async fn index() -> &'static str {
    ""
}

#[derive(Debug, Default, Deserialize)]
pub struct UrlParam {
    #[serde(default)]
    pub url: Option<String>,
}

/// `POST /refresh-url`: accepts `url` in the query string or a form body,
/// enqueues a background refresh, always answers an empty 200.
pub async fn refresh_url(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UrlParam>,
    body: String,
) -> StatusCode {
    let url = q
        .url
        .or_else(|| form_param(&body, "url"))
        .unwrap_or_default();
    if !url.is_empty() {
        state.refresh.enqueue(&url);
    }
    StatusCode::OK
}

fn form_param(body: &str, key: &str) -> Option<String> {
    url::form_urlencoded::parse(body.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// `GET /go?url=`: plain 302 redirector.
pub async fn go(Query(q): Query<UrlParam>) -> Response {
    match q.url.filter(|u| !u.is_empty()) {
        Some(url) => (StatusCode::FOUND, [(header::LOCATION, url)]).into_response(),
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}

/// `GET|HEAD /experimental/googl/{path}`: distance-gated redirect onto the
/// shortener domain: close beacons redirect, far ones get 204.
pub async fn experimental_googl(Path(path): Path<String>, headers: HeaderMap) -> Response {
    let distance = headers
        .get("X-PhysicalWeb-Distance")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok());
    tracing::info!(?distance, "experimental googl redirect");

    if distance.map(|d| d > 2.0).unwrap_or(false) {
        return StatusCode::NO_CONTENT.into_response();
    }
    (
        StatusCode::FOUND,
        [(header::LOCATION, format!("http://goo.gl/{path}"))],
    )
        .into_response()
}
