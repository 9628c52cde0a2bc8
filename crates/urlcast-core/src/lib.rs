use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("unexpected status: {0}")]
    UnexpectedStatus(u16),
    #[error("store error: {0}")]
    Store(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One cached site, keyed in the store by the URL string the client scanned.
///
/// `url` holds the final destination after redirect resolution, so it may
/// differ from the store key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteRecord {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub favicon_url: Option<String>,
    /// Serialized JSON array of JSON-LD objects.
    pub jsonlds: Option<String>,
    pub added_on_epoch_s: u64,
    pub updated_on_epoch_s: u64,
}

impl SiteRecord {
    pub fn age(&self, now_epoch_s: u64) -> Duration {
        Duration::from_secs(now_epoch_s.saturating_sub(self.updated_on_epoch_s))
    }
}

/// The mutable fields of a [`SiteRecord`], as written by an upsert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteRecordFields {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub favicon_url: Option<String>,
    pub jsonlds: Option<String>,
}

/// What the HTML extractor produces for one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    /// Absolute icon URL; the extractor always resolves one (falling back to
    /// `/favicon.ico` on the page origin).
    pub icon: Option<String>,
    /// Parsed JSON-LD blocks, in document order.
    pub jsonlds: Vec<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct PageRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: Option<u64>,
}

impl PageRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            timeout_ms: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone)]
pub struct PageResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub bytes: Vec<u8>,
}

impl PageResponse {
    /// Case-insensitive single-header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A single GET with no redirect following and no status interpretation.
#[async_trait::async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, req: &PageRequest) -> Result<PageResponse>;
}

/// Keyed record store with atomic per-key operations.
///
/// No cross-key transactions, no ordering guarantees between keys.
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<SiteRecord>>;
    /// Create if absent, else overwrite the metadata fields. Bumps
    /// `updated_on` either way.
    async fn upsert(&self, key: &str, fields: SiteRecordFields) -> Result<SiteRecord>;
    /// Bump `updated_on` only. Errors if the key is absent.
    async fn touch(&self, key: &str) -> Result<SiteRecord>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Membership predicate used by the favicon relay: does any record carry
    /// this favicon URL?
    async fn has_favicon_url(&self, url: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub objects: Vec<ScanObject>,
    #[serde(default, rename = "secureOnly")]
    pub secure_only: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScanObject {
    /// Absent means the object is skipped entirely.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub force: bool,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub rssi: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub txpower: Option<f64>,
}

/// Accept numbers or numeric strings; anything else reads as absent.
///
/// Signal fields come from scanners in the wild; a junk rssi unranks the one
/// entry instead of failing the whole batch.
fn lenient_f64<'de, D>(de: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = Option::<serde_json::Value>::deserialize(de)?;
    Ok(match v {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceData {
    pub id: String,
    pub url: String,
    #[serde(rename = "displayUrl")]
    pub display_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, rename = "json-ld", skip_serializing_if = "Option::is_none")]
    pub jsonld: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groupid: Option<String>,
    pub rank: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanResponse {
    pub metadata: Vec<DeviceData>,
    /// Input ids that resolved to nothing. Omitted when empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unresolved: Option<Vec<String>>,
}

/// Rank reported for entries with no usable signal data.
pub const UNRANKED_DISTANCE: f64 = 1000.0;

/// RSSI sentinels: 127 is MAX, 128 is INVALID. Neither carries distance.
const RSSI_SENTINELS: [f64; 2] = [127.0, 128.0];

/// Log-distance path loss model: `10^((txpower - rssi - 41) / 20)` metres.
///
/// Returns None when either input is absent or rssi is a sentinel.
pub fn compute_distance(rssi: Option<f64>, txpower: Option<f64>) -> Option<f64> {
    let rssi = rssi.filter(|v| v.is_finite())?;
    let txpower = txpower.filter(|v| v.is_finite())?;
    if RSSI_SENTINELS.contains(&rssi) {
        return None;
    }
    let path_loss = txpower - rssi;
    Some(10f64.powf((path_loss - 41.0) / 20.0))
}

/// Total order over optional distances: ascending, None after every Some.
///
/// Ties compare Equal so a stable sort preserves input order.
pub fn distance_order(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn distance_matches_path_loss_expectations() {
        // path_loss 41 is the 1m reference point.
        let d = compute_distance(Some(-63.0), Some(-22.0)).unwrap();
        assert!((d - 1.0).abs() < 1e-9);
        let near = compute_distance(Some(-61.0), Some(-22.0)).unwrap();
        let far = compute_distance(Some(-75.0), Some(-22.0)).unwrap();
        assert!(near < far);
    }

    #[test]
    fn rssi_sentinels_have_no_distance() {
        assert_eq!(compute_distance(Some(127.0), Some(-41.0)), None);
        assert_eq!(compute_distance(Some(128.0), Some(-41.0)), None);
        assert_eq!(compute_distance(None, Some(-41.0)), None);
        assert_eq!(compute_distance(Some(-70.0), None), None);
    }

    #[test]
    fn lenient_signal_fields_accept_strings_and_reject_junk() {
        let obj: ScanObject =
            serde_json::from_str(r#"{"url":"http://a","rssi":"-70","txpower":-22}"#).unwrap();
        assert_eq!(obj.rssi, Some(-70.0));
        assert_eq!(obj.txpower, Some(-22.0));

        let obj: ScanObject =
            serde_json::from_str(r#"{"url":"http://a","rssi":{"x":1},"txpower":[2]}"#).unwrap();
        assert_eq!(obj.rssi, None);
        assert_eq!(obj.txpower, None);
    }

    #[test]
    fn bad_key_objects_deserialize_with_no_url() {
        let obj: ScanObject = serde_json::from_str(r#"{"usdf":"http://badkeys"}"#).unwrap();
        assert_eq!(obj.url, None);
    }

    #[test]
    fn device_data_serializes_wire_names_and_omits_absent_fields() {
        let dd = DeviceData {
            id: "http://short/x".to_string(),
            url: "https://long/x".to_string(),
            display_url: "https://long/x".to_string(),
            title: Some("T".to_string()),
            description: None,
            icon: None,
            jsonld: Some(serde_json::json!([{"@type": "Thing"}])),
            groupid: None,
            rank: 1.5,
        };
        let v = serde_json::to_value(&dd).unwrap();
        assert_eq!(v["displayUrl"], "https://long/x");
        assert!(v.get("json-ld").is_some());
        assert!(v.get("description").is_none());
        assert!(v.get("groupid").is_none());
    }

    #[test]
    fn unresolved_is_omitted_when_none() {
        let resp = ScanResponse {
            metadata: vec![],
            unresolved: None,
        };
        let s = serde_json::to_string(&resp).unwrap();
        assert_eq!(s, r#"{"metadata":[]}"#);
    }

    proptest! {
        #[test]
        fn distance_order_sorts_somes_ascending_before_nones(
            xs in prop::collection::vec(prop::option::of(-100.0f64..100.0), 0..20),
        ) {
            let mut sorted = xs.clone();
            sorted.sort_by(|a, b| distance_order(*a, *b));
            let first_none = sorted.iter().position(|d| d.is_none()).unwrap_or(sorted.len());
            prop_assert!(sorted[first_none..].iter().all(|d| d.is_none()));
            for w in sorted[..first_none].windows(2) {
                prop_assert!(w[0].unwrap() <= w[1].unwrap());
            }
        }

        #[test]
        fn distance_is_positive_and_monotone_in_path_loss(
            rssi in -126.0f64..0.0,
            txpower in -100.0f64..20.0,
        ) {
            let d = compute_distance(Some(rssi), Some(txpower)).unwrap();
            prop_assert!(d > 0.0);
            let farther = compute_distance(Some(rssi - 1.0), Some(txpower)).unwrap();
            prop_assert!(farther > d);
        }
    }
}
