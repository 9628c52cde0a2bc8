//! The `resolve-scan` endpoint: validate the batch, resolve every URL
//! concurrently, rank by distance.

use crate::app::AppState;
use crate::groupid;
use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use futures::future::join_all;
use std::sync::Arc;
use url::Url;
use urlcast_core::{
    compute_distance, distance_order, DeviceData, ScanObject, ScanRequest, ScanResponse,
    UNRANKED_DISTANCE,
};
use urlcast_local::resolver::Resolved;

/// `POST /resolve-scan`. The pipeline never answers 5xx: an unparseable
/// body or a fully-failed batch both come back as `{"metadata": []}`.
pub async fn resolve_scan(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Json<ScanResponse> {
    let req: ScanRequest = serde_json::from_slice(&body).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "unparseable scan body");
        ScanRequest::default()
    });
    Json(build_response(&state, req).await)
}

const DEMO_URLS: [&str; 4] = [
    "http://www.caltrain.com/schedules/realtime/stations/mountainviewstation-mobile.html",
    "http://benfry.com/distellamap/",
    "http://en.wikipedia.org/wiki/Le_D%C3%A9jeuner_sur_l%E2%80%99herbe",
    "http://sfmoma.org",
];

/// `GET /demo`: a canned batch through the full pipeline, for poking the
/// service by hand.
pub async fn demo(State(state): State<Arc<AppState>>) -> Json<ScanResponse> {
    let req = ScanRequest {
        objects: DEMO_URLS
            .iter()
            .map(|u| ScanObject {
                url: Some(u.to_string()),
                ..ScanObject::default()
            })
            .collect(),
        secure_only: None,
    };
    Json(build_response(&state, req).await)
}

enum Outcome {
    Entry(DeviceData, Option<f64>),
    Unresolved(String),
    Skip,
}

pub(crate) async fn build_response(state: &Arc<AppState>, req: ScanRequest) -> ScanResponse {
    let secure_only = req.secure_only.unwrap_or(state.secure_only_default);

    // One slow origin must only cost the batch its own latency, so every
    // object resolves concurrently.
    let outcomes = join_all(
        req.objects
            .into_iter()
            .map(|obj| process_object(state, obj, secure_only)),
    )
    .await;

    let mut entries = Vec::new();
    let mut unresolved = Vec::new();
    for outcome in outcomes {
        match outcome {
            Outcome::Entry(data, distance) => entries.push((data, distance)),
            Outcome::Unresolved(id) => unresolved.push(id),
            Outcome::Skip => {}
        }
    }

    // Stable sort: ties and unranked entries keep input order.
    entries.sort_by(|a, b| distance_order(a.1, b.1));
    let metadata = entries
        .into_iter()
        .map(|(mut data, distance)| {
            data.rank = distance.unwrap_or(UNRANKED_DISTANCE);
            data
        })
        .collect();

    ScanResponse {
        metadata,
        unresolved: if unresolved.is_empty() {
            None
        } else {
            Some(unresolved)
        },
    }
}

async fn process_object(state: &Arc<AppState>, obj: ScanObject, secure_only: bool) -> Outcome {
    let Some(input_url) = obj.url else {
        return Outcome::Skip;
    };
    let Ok(parsed_input) = Url::parse(&input_url) else {
        return Outcome::Skip;
    };
    if !matches!(parsed_input.scheme(), "http" | "https") {
        return Outcome::Skip;
    }

    let distance = compute_distance(obj.rssi, obj.txpower);

    let record = match state.resolver.resolve(&input_url, distance, obj.force).await {
        Ok(Resolved::Record(record)) => record,
        Ok(Resolved::NoContent) => return Outcome::Unresolved(input_url),
        Err(e) => {
            tracing::debug!(url = %input_url, error = %e, "scan entry failed to resolve");
            return Outcome::Unresolved(input_url);
        }
    };

    let final_url = final_url_with_fragment(&record.url, &parsed_input);
    if secure_only && !final_url.starts_with("https://") {
        return Outcome::Skip;
    }

    let jsonld = record.jsonlds.as_deref().and_then(|s| {
        serde_json::from_str(s)
            .map_err(|e| tracing::warn!(url = %input_url, error = %e, "stored json-ld is unreadable"))
            .ok()
    });
    let icon = record.favicon_url.as_deref().map(|i| rewrite_icon(state, i));
    let groupid = make_group_id(
        &final_url,
        record.title.as_deref(),
        record.description.as_deref(),
    );

    Outcome::Entry(
        DeviceData {
            id: input_url,
            url: final_url.clone(),
            display_url: final_url,
            title: record.title,
            description: record.description,
            icon,
            jsonld,
            groupid,
            rank: UNRANKED_DISTANCE,
        },
        distance,
    )
}

/// The resolved URL, adopting the scanned URL's fragment when the resolved
/// one carries none. Untouched otherwise, byte for byte.
fn final_url_with_fragment(resolved: &str, input: &Url) -> String {
    let Some(frag) = input.fragment().filter(|f| !f.is_empty()) else {
        return resolved.to_string();
    };
    let Ok(mut url) = Url::parse(resolved) else {
        return resolved.to_string();
    };
    if url.fragment().map(|f| !f.is_empty()).unwrap_or(false) {
        return resolved.to_string();
    }
    url.set_fragment(Some(frag));
    url.to_string()
}

/// Point the emitted icon at our `/favicon` relay so clients never hit
/// third-party origins directly. Without a public base the raw URL goes out.
fn rewrite_icon(state: &AppState, icon: &str) -> String {
    let Some(base) = &state.public_base else {
        return icon.to_string();
    };
    let Ok(mut relay) = base.join("/favicon") else {
        return icon.to_string();
    };
    relay.query_pairs_mut().append_pair("url", icon);
    relay.to_string()
}

fn make_group_id(
    final_url: &str,
    title: Option<&str>,
    description: Option<&str>,
) -> Option<String> {
    let parsed = match Url::parse(final_url) {
        Ok(u) => u,
        Err(e) => {
            tracing::debug!(url = final_url, error = %e, "group id skipped");
            return None;
        }
    };
    let netloc = groupid::netloc(&parsed)?;
    let identifier = title
        .or(description)
        .map(str::to_string)
        .unwrap_or_else(|| parsed.path().to_string());
    Some(groupid::group_id(&netloc, &identifier))
}
