//! URL shortener proxy: forwards the request body to the external
//! shortener API with our key attached.

use crate::app::AppState;
use axum::body::Bytes;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::extract::State;
use std::sync::Arc;

const SHORTENER_REFERER: &str = "url-cast.physical-web.org";

/// `POST /shorten-url`.
pub async fn shorten(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let Some(key) = state.config.shortener_key() else {
        tracing::warn!("shorten-url called without a configured key");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let result = state
        .relay_client
        .post(&state.config.shortener_endpoint)
        .query(&[("key", key)])
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::REFERER, SHORTENER_REFERER)
        .body(body)
        .send()
        .await;

    match result {
        Ok(resp) => {
            let bytes = resp.bytes().await.unwrap_or_default();
            ([(header::CONTENT_TYPE, "application/json")], bytes).into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "shortener upstream call failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}
