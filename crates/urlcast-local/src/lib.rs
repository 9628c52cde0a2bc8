use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use urlcast_core::{
    Error, MetadataStore, PageFetcher, PageRequest, PageResponse, Result, SiteRecord,
    SiteRecordFields,
};

pub mod encoding;
pub mod extract;
pub mod refresh;
pub mod resolver;

pub fn now_epoch_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

fn apply_upsert(prev: Option<&SiteRecord>, fields: SiteRecordFields, now_s: u64) -> SiteRecord {
    // Clock skew must never make a record look fresher than its past self;
    // updated_on is monotone per key.
    let updated_on = prev
        .map(|r| r.updated_on_epoch_s.max(now_s))
        .unwrap_or(now_s);
    SiteRecord {
        url: fields.url,
        title: fields.title,
        description: fields.description,
        favicon_url: fields.favicon_url,
        jsonlds: fields.jsonlds,
        added_on_epoch_s: prev.map(|r| r.added_on_epoch_s).unwrap_or(now_s),
        updated_on_epoch_s: updated_on,
    }
}

/// In-memory store. Backs tests and single-process deployments with no
/// persistence requirement.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<BTreeMap<String, SiteRecord>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record verbatim, timestamps included. Intended for seeding
    /// fixtures with records of a chosen age.
    pub fn seed(&self, key: &str, record: SiteRecord) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), record);
    }
}

#[async_trait::async_trait]
impl MetadataStore for MemStore {
    async fn get(&self, key: &str) -> Result<Option<SiteRecord>> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(key).cloned())
    }

    async fn upsert(&self, key: &str, fields: SiteRecordFields) -> Result<SiteRecord> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let rec = apply_upsert(map.get(key), fields, now_epoch_s());
        map.insert(key.to_string(), rec.clone());
        Ok(rec)
    }

    async fn touch(&self, key: &str) -> Result<SiteRecord> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let rec = map
            .get_mut(key)
            .ok_or_else(|| Error::Store(format!("touch on missing key: {key}")))?;
        rec.updated_on_epoch_s = rec.updated_on_epoch_s.max(now_epoch_s());
        Ok(rec.clone())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(key);
        Ok(())
    }

    async fn has_favicon_url(&self, url: &str) -> Result<bool> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.values().any(|r| r.favicon_url.as_deref() == Some(url)))
    }
}

/// Filesystem-backed store: one JSON document per key, sharded two levels
/// deep by the key hash so no directory grows unbounded.
///
/// Keys are the client-supplied URL strings, verbatim; hashing is only a
/// path-safety measure, never a lookup semantic.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
    // One write lock for the whole store keeps upsert/touch read-modify-write
    // atomic per key without per-key lock bookkeeping.
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl FsStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn key_hash(key: &str) -> String {
        let mut h = Sha256::new();
        h.update(b"site:");
        h.update(key.as_bytes());
        hex::encode(h.finalize())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let h = Self::key_hash(key);
        self.root
            .join(&h[0..2])
            .join(&h[2..4])
            .join(format!("{h}.json"))
    }

    fn read_record(path: &PathBuf) -> Result<Option<SiteRecord>> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Store(e.to_string())),
        };
        let rec = serde_json::from_slice(&bytes).map_err(|e| Error::Store(e.to_string()))?;
        Ok(Some(rec))
    }

    fn write_record(path: &PathBuf, rec: &SiteRecord) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::Store(e.to_string()))?;
        }
        let bytes = serde_json::to_vec(rec).map_err(|e| Error::Store(e.to_string()))?;
        fs::write(path, bytes).map_err(|e| Error::Store(e.to_string()))
    }

    /// Insert a record verbatim, timestamps included. Intended for seeding
    /// fixtures with records of a chosen age.
    pub fn seed(&self, key: &str, record: &SiteRecord) -> Result<()> {
        Self::write_record(&self.path_for(key), record)
    }
}

#[async_trait::async_trait]
impl MetadataStore for FsStore {
    async fn get(&self, key: &str) -> Result<Option<SiteRecord>> {
        let path = self.path_for(key);
        tokio::task::spawn_blocking(move || Self::read_record(&path))
            .await
            .map_err(|e| Error::Store(format!("store get join failed: {e}")))?
    }

    async fn upsert(&self, key: &str, fields: SiteRecordFields) -> Result<SiteRecord> {
        let _guard = self.lock.lock().await;
        let path = self.path_for(key);
        tokio::task::spawn_blocking(move || {
            let prev = Self::read_record(&path)?;
            let rec = apply_upsert(prev.as_ref(), fields, now_epoch_s());
            Self::write_record(&path, &rec)?;
            Ok(rec)
        })
        .await
        .map_err(|e| Error::Store(format!("store upsert join failed: {e}")))?
    }

    async fn touch(&self, key: &str) -> Result<SiteRecord> {
        let _guard = self.lock.lock().await;
        let path = self.path_for(key);
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let mut rec = Self::read_record(&path)?
                .ok_or_else(|| Error::Store(format!("touch on missing key: {key}")))?;
            rec.updated_on_epoch_s = rec.updated_on_epoch_s.max(now_epoch_s());
            Self::write_record(&path, &rec)?;
            Ok(rec)
        })
        .await
        .map_err(|e| Error::Store(format!("store touch join failed: {e}")))?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.path_for(key);
        tokio::task::spawn_blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Store(e.to_string())),
        })
        .await
        .map_err(|e| Error::Store(format!("store delete join failed: {e}")))?
    }

    async fn has_favicon_url(&self, url: &str) -> Result<bool> {
        // Full-shard scan; the favicon relay is a low-volume endpoint and the
        // scan stops at the first match.
        let root = self.root.clone();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || {
            let mut stack = vec![root];
            while let Some(dir) = stack.pop() {
                let Ok(rd) = fs::read_dir(&dir) else {
                    continue;
                };
                for entry in rd.flatten() {
                    let path = entry.path();
                    if path.is_dir() {
                        stack.push(path);
                    } else if path.extension().and_then(|s| s.to_str()) == Some("json") {
                        if let Ok(Some(rec)) = Self::read_record(&path) {
                            if rec.favicon_url.as_deref() == Some(url.as_str()) {
                                return Ok(true);
                            }
                        }
                    }
                }
            }
            Ok(false)
        })
        .await
        .map_err(|e| Error::Store(format!("store scan join failed: {e}")))?
    }
}

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_BODY_BYTES: usize = 5_000_000;

/// reqwest-backed [`PageFetcher`].
///
/// Redirects are never followed here; the resolver owns redirect handling so
/// it can invalidate cache entries for redirect sources. TLS validation stays
/// at the client default (on).
#[derive(Debug, Clone)]
pub struct LocalFetcher {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl LocalFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Fetch(e.to_string()))?;
        Ok(Self {
            client,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        })
    }

    pub fn with_defaults(user_agent: &str) -> Result<Self> {
        Self::new(user_agent, DEFAULT_FETCH_TIMEOUT)
    }
}

#[async_trait::async_trait]
impl PageFetcher for LocalFetcher {
    async fn fetch(&self, req: &PageRequest) -> Result<PageResponse> {
        let url = url::Url::parse(&req.url).map_err(|e| Error::InvalidUrl(e.to_string()))?;

        let mut rb = self.client.get(url);
        if let Some(to) = req.timeout() {
            rb = rb.timeout(to);
        }
        for (k, v) in &req.headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(k.as_bytes()),
                reqwest::header::HeaderValue::from_str(v),
            ) {
                rb = rb.header(name, value);
            }
        }

        let resp = rb.send().await.map_err(|e| Error::Fetch(e.to_string()))?;
        let status = resp.status().as_u16();

        let mut headers = BTreeMap::new();
        for (k, v) in resp.headers().iter() {
            if let Ok(s) = v.to_str() {
                headers.insert(k.as_str().to_string(), s.to_string());
            }
        }

        // Bound the body read; one hostile origin must not exhaust memory.
        let mut bytes = Vec::new();
        let mut stream = resp.bytes_stream();
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Fetch(e.to_string()))?;
            if bytes.len().saturating_add(chunk.len()) > self.max_body_bytes {
                let can_take = self.max_body_bytes.saturating_sub(bytes.len());
                bytes.extend_from_slice(&chunk[..can_take]);
                break;
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(PageResponse {
            status,
            headers,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::header, http::StatusCode, response::Redirect, routing::get, Router};
    use std::net::SocketAddr;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn fields(url: &str, favicon: Option<&str>) -> SiteRecordFields {
        SiteRecordFields {
            url: url.to_string(),
            title: Some("T".to_string()),
            description: None,
            favicon_url: favicon.map(|s| s.to_string()),
            jsonlds: None,
        }
    }

    #[tokio::test]
    async fn mem_store_upsert_creates_then_overwrites() {
        let store = MemStore::new();
        let a = store
            .upsert("http://x/", fields("http://x/", None))
            .await
            .unwrap();
        assert_eq!(a.added_on_epoch_s, a.updated_on_epoch_s);

        let b = store
            .upsert("http://x/", fields("https://y/", Some("https://y/i.png")))
            .await
            .unwrap();
        assert_eq!(b.added_on_epoch_s, a.added_on_epoch_s);
        assert!(b.updated_on_epoch_s >= a.updated_on_epoch_s);
        assert_eq!(b.url, "https://y/");

        let got = store.get("http://x/").await.unwrap().unwrap();
        assert_eq!(got, b);
    }

    #[tokio::test]
    async fn mem_store_touch_requires_existing_key() {
        let store = MemStore::new();
        assert!(store.touch("http://missing/").await.is_err());

        store
            .upsert("http://x/", fields("http://x/", None))
            .await
            .unwrap();
        let touched = store.touch("http://x/").await.unwrap();
        // A touch changes no metadata fields.
        assert_eq!(touched.title.as_deref(), Some("T"));
    }

    #[tokio::test]
    async fn mem_store_favicon_membership() {
        let store = MemStore::new();
        store
            .upsert("http://x/", fields("http://x/", Some("http://x/favicon.ico")))
            .await
            .unwrap();
        assert!(store
            .has_favicon_url("http://x/favicon.ico")
            .await
            .unwrap());
        assert!(!store.has_favicon_url("http://other/i.png").await.unwrap());
    }

    #[tokio::test]
    async fn fs_store_roundtrips_and_deletes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsStore::new(tmp.path().to_path_buf());

        assert_eq!(store.get("http://x/").await.unwrap(), None);
        let a = store
            .upsert("http://x/", fields("http://x/", Some("http://x/favicon.ico")))
            .await
            .unwrap();
        let got = store.get("http://x/").await.unwrap().unwrap();
        assert_eq!(got, a);
        assert!(store
            .has_favicon_url("http://x/favicon.ico")
            .await
            .unwrap());

        store.delete("http://x/").await.unwrap();
        assert_eq!(store.get("http://x/").await.unwrap(), None);
        // Deleting a missing key is not an error.
        store.delete("http://x/").await.unwrap();
    }

    #[tokio::test]
    async fn fs_store_updated_on_is_monotone_even_with_stale_seed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsStore::new(tmp.path().to_path_buf());

        let future = now_epoch_s() + 10_000;
        store
            .seed(
                "http://x/",
                &SiteRecord {
                    url: "http://x/".to_string(),
                    title: None,
                    description: None,
                    favicon_url: None,
                    jsonlds: None,
                    added_on_epoch_s: future,
                    updated_on_epoch_s: future,
                },
            )
            .unwrap();

        let touched = store.touch("http://x/").await.unwrap();
        assert_eq!(touched.updated_on_epoch_s, future);
    }

    #[tokio::test]
    async fn local_fetcher_does_not_follow_redirects() {
        let app = Router::new()
            .route("/short", get(|| async { Redirect::permanent("/long") }))
            .route("/long", get(|| async { "destination" }));
        let addr = serve(app).await;

        let fetcher = LocalFetcher::with_defaults("urlcast-test/0.1").unwrap();
        let resp = fetcher
            .fetch(&PageRequest::new(format!("http://{addr}/short")))
            .await
            .unwrap();
        assert_eq!(resp.status, 308);
        assert_eq!(resp.header("location"), Some("/long"));
    }

    #[tokio::test]
    async fn local_fetcher_forwards_headers_and_reports_status_verbatim() {
        let app = Router::new().route(
            "/",
            get(|headers: axum::http::HeaderMap| async move {
                let dist = headers
                    .get("x-physicalweb-distance")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                (StatusCode::IM_A_TEAPOT, dist)
            }),
        );
        let addr = serve(app).await;

        let fetcher = LocalFetcher::with_defaults("urlcast-test/0.1").unwrap();
        let mut req = PageRequest::new(format!("http://{addr}/"));
        req.headers
            .insert("X-PhysicalWeb-Distance".to_string(), "1.5".to_string());
        let resp = fetcher.fetch(&req).await.unwrap();
        assert_eq!(resp.status, 418);
        assert_eq!(resp.bytes, b"1.5");
    }

    #[tokio::test]
    async fn local_fetcher_caps_body_size() {
        let app = Router::new().route(
            "/big",
            get(|| async { ([(header::CONTENT_TYPE, "text/html")], "x".repeat(100_000)) }),
        );
        let addr = serve(app).await;

        let mut fetcher = LocalFetcher::with_defaults("urlcast-test/0.1").unwrap();
        fetcher.max_body_bytes = 1_000;
        let resp = fetcher
            .fetch(&PageRequest::new(format!("http://{addr}/big")))
            .await
            .unwrap();
        assert_eq!(resp.bytes.len(), 1_000);
    }

    #[tokio::test]
    async fn local_fetcher_surfaces_transport_errors() {
        // Nothing listens on this port.
        let fetcher = LocalFetcher::with_defaults("urlcast-test/0.1").unwrap();
        let err = fetcher
            .fetch(&PageRequest::new("http://127.0.0.1:1/"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fetch(_)));
    }
}
