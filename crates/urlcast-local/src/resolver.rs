//! Cache-backed URL resolution: fetch, extract, store, with
//! stale-while-revalidate refresh scheduling and redirect-aware cache
//! invalidation.

use crate::refresh::RefreshJob;
use crate::{encoding, extract, now_epoch_s};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;
use urlcast_core::{
    Error, MetadataStore, PageFetcher, PageRequest, Result, SiteRecord, SiteRecordFields,
};

pub const DISTANCE_HEADER: &str = "X-PhysicalWeb-Distance";

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Cached records younger than this are served as-is; older ones are
    /// served stale while a background refresh is scheduled.
    pub fresh_ttl: Duration,
    /// Records refreshed more recently than this are not refreshed again.
    pub refresh_debounce: Duration,
    pub max_redirects: usize,
    /// Per-fetch override; None leaves the fetcher's own timeout in charge.
    pub fetch_timeout_ms: Option<u64>,
    /// When set, a known distance rides along on fetches as
    /// `X-PhysicalWeb-Distance`.
    pub experimental: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            fresh_ttl: Duration::from_secs(5 * 60),
            refresh_debounce: Duration::from_secs(5),
            max_redirects: 10,
            fetch_timeout_ms: None,
            experimental: false,
        }
    }
}

/// A successful resolution that produced no record is distinct from a
/// failure: the URL was valid but has nothing to show (204, 5xx).
#[derive(Debug, Clone)]
pub enum Resolved {
    Record(SiteRecord),
    NoContent,
}

impl Resolved {
    pub fn into_record(self) -> Option<SiteRecord> {
        match self {
            Resolved::Record(r) => Some(r),
            Resolved::NoContent => None,
        }
    }
}

pub struct Resolver {
    store: Arc<dyn MetadataStore>,
    fetcher: Arc<dyn PageFetcher>,
    refresh_tx: mpsc::UnboundedSender<RefreshJob>,
    cfg: ResolverConfig,
}

impl Resolver {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        fetcher: Arc<dyn PageFetcher>,
        refresh_tx: mpsc::UnboundedSender<RefreshJob>,
        cfg: ResolverConfig,
    ) -> Self {
        Self {
            store,
            fetcher,
            refresh_tx,
            cfg,
        }
    }

    /// Resolve one URL to its cached or freshly fetched record.
    ///
    /// Redirects re-enter the cache lookup under the target URL, so only
    /// final destinations are ever cached; a record cached under a URL that
    /// now redirects is deleted on the way through.
    pub async fn resolve(
        &self,
        url: &str,
        distance: Option<f64>,
        force: bool,
    ) -> Result<Resolved> {
        let mut current = url.to_string();

        for _hop in 0..=self.cfg.max_redirects {
            if !force {
                if let Some(rec) = self.store.get(&current).await? {
                    if rec.age(now_epoch_s()) <= self.cfg.fresh_ttl {
                        return Ok(Resolved::Record(rec));
                    }
                    // Stale: claim with a touch before enqueueing, so a
                    // concurrent request sees a fresh stamp and does not
                    // schedule a second refresh. The job carries the claim
                    // so the worker's debounce does not bounce it.
                    let rec = match self.store.touch(&current).await {
                        Ok(r) => r,
                        Err(_) => rec,
                    };
                    let job = RefreshJob {
                        url: current.clone(),
                        claimed: true,
                    };
                    if self.refresh_tx.send(job).is_err() {
                        tracing::warn!(url = %current, "refresh queue is gone; serving stale");
                    }
                    return Ok(Resolved::Record(rec));
                }
            }

            match self.fetch_hop(&current, distance).await? {
                Hop::Done(resolved) => return Ok(resolved),
                Hop::Redirect(next) => {
                    // The redirect source must not keep serving its old
                    // destination from cache.
                    if self.store.get(&current).await?.is_some() {
                        tracing::info!(url = %current, "removing stale record for redirect source");
                        self.store.delete(&current).await?;
                    }
                    tracing::debug!(from = %current, to = %next, "following redirect");
                    current = next;
                }
            }
        }

        Err(Error::Fetch(format!("redirect depth exceeded for {url}")))
    }

    /// One background refresh. Unclaimed jobs are debounced against the
    /// store timestamp and then claimed with a touch; pre-claimed jobs go
    /// straight to the forced fetch. Fetch failures are deliberately
    /// swallowed; the stale record stays.
    pub async fn run_refresh_job(&self, job: &RefreshJob) {
        let url = job.url.as_str();
        if !job.claimed {
            match self.store.get(url).await {
                Ok(Some(rec)) => {
                    if rec.age(now_epoch_s()) < self.cfg.refresh_debounce {
                        tracing::debug!(url, "skipping refresh, record was just updated");
                        return;
                    }
                    // Claim before fetching so repeated refresh requests
                    // within the debounce window collapse into this one.
                    if let Err(e) = self.store.touch(url).await {
                        tracing::warn!(url, error = %e, "refresh claim failed");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(url, error = %e, "refresh store lookup failed");
                    return;
                }
            }
        }

        if let Err(e) = self.resolve(url, None, true).await {
            tracing::debug!(url, error = %e, "background refresh failed");
        }
    }

    async fn fetch_hop(&self, url: &str, distance: Option<f64>) -> Result<Hop> {
        let mut req = PageRequest::new(url);
        req.timeout_ms = self.cfg.fetch_timeout_ms;
        if self.cfg.experimental {
            if let Some(d) = distance {
                req.headers.insert(DISTANCE_HEADER.to_string(), d.to_string());
            }
        }

        let resp = self.fetcher.fetch(&req).await?;
        tracing::debug!(url, status = resp.status, "fetched");

        match resp.status {
            200 if !resp.bytes.is_empty() => {
                let html = encoding::decode(&resp.bytes);
                let base = Url::parse(url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
                let meta = extract::extract(&html, &base);

                let jsonlds = if meta.jsonlds.is_empty() {
                    None
                } else {
                    Some(
                        serde_json::to_string(&serde_json::Value::Array(meta.jsonlds))
                            .map_err(|e| Error::Store(e.to_string()))?,
                    )
                };
                let fields = SiteRecordFields {
                    url: url.to_string(),
                    title: meta.title,
                    description: meta.description,
                    favicon_url: meta.icon,
                    jsonlds,
                };
                let rec = self.store.upsert(url, fields).await?;
                Ok(Hop::Done(Resolved::Record(rec)))
            }
            // 200 with an empty body and 204 both mean "valid URL, nothing
            // to show"; callers drop the entry.
            200 | 204 => Ok(Hop::Done(Resolved::NoContent)),
            301 | 302 | 303 | 307 | 308 => {
                let location = resp
                    .header("location")
                    .ok_or_else(|| Error::Fetch(format!("redirect without location from {url}")))?;
                let base = Url::parse(url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
                let mut next = base
                    .join(location)
                    .map_err(|e| Error::InvalidUrl(e.to_string()))?;
                // Fragments are client-side state; a redirect that drops one
                // keeps the original's.
                if next.fragment().map(|f| f.is_empty()).unwrap_or(true) {
                    if let Some(frag) = base.fragment() {
                        next.set_fragment(Some(frag));
                    }
                }
                Ok(Hop::Redirect(next.to_string()))
            }
            s if (500..600).contains(&s) => Ok(Hop::Done(Resolved::NoContent)),
            s => Err(Error::UnexpectedStatus(s)),
        }
    }
}

enum Hop {
    Done(Resolved),
    Redirect(String),
}
