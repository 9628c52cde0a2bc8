//! Background refresh queue: accepts URLs, refreshes them out-of-band.
//!
//! Delivery is at-least-once. Jobs from the refresh endpoint are debounced
//! by the store timestamp; jobs from the resolver's stale-hit path arrive
//! pre-claimed (the stale hit already touched the record) and go straight
//! to the forced fetch, otherwise their own claim would debounce them.

use crate::resolver::Resolver;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct RefreshJob {
    pub url: String,
    /// True when the enqueuer already touched the record to claim the
    /// refresh; the worker then skips the debounce check.
    pub claimed: bool,
}

#[derive(Debug, Clone)]
pub struct RefreshQueue {
    tx: mpsc::UnboundedSender<RefreshJob>,
}

impl RefreshQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RefreshJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// The sender half, for wiring a [`Resolver`]'s stale-hit path into the
    /// same queue.
    pub fn sender(&self) -> mpsc::UnboundedSender<RefreshJob> {
        self.tx.clone()
    }

    /// Enqueue an unclaimed refresh. Fire-and-forget: a closed queue means
    /// shutdown and the job is dropped.
    pub fn enqueue(&self, url: &str) {
        let job = RefreshJob {
            url: url.to_string(),
            claimed: false,
        };
        if self.tx.send(job).is_err() {
            tracing::warn!(url, "refresh queue worker is gone, dropping job");
        }
    }
}

/// Drive queued refresh jobs until every sender is dropped.
pub fn spawn_worker(
    resolver: Arc<Resolver>,
    mut rx: mpsc::UnboundedReceiver<RefreshJob>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            resolver.run_refresh_job(&job).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ResolverConfig;
    use crate::{LocalFetcher, MemStore};
    use axum::{extract::State, http::header, routing::get, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use urlcast_core::{MetadataStore, SiteRecord};

    const PAGE: &str = "<html><head><title>T</title></head></html>";

    #[tokio::test]
    async fn worker_drains_in_order_and_debounce_collapses_duplicates() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/page",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    ([(header::CONTENT_TYPE, "text/html")], PAGE)
                })
                .with_state(hits.clone()),
            )
            .route(
                "/sentinel",
                get(|| async { ([(header::CONTENT_TYPE, "text/html")], PAGE) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let url = format!("http://{addr}/page");
        let sentinel = format!("http://{addr}/sentinel");

        let store = MemStore::new();
        store.seed(
            &url,
            SiteRecord {
                url: url.clone(),
                title: None,
                description: None,
                favicon_url: None,
                jsonlds: None,
                added_on_epoch_s: 1,
                updated_on_epoch_s: 1,
            },
        );

        let (queue, rx) = RefreshQueue::channel();
        let resolver = Arc::new(Resolver::new(
            Arc::new(store.clone()),
            Arc::new(LocalFetcher::with_defaults("urlcast-test/0.1").unwrap()),
            queue.sender(),
            ResolverConfig::default(),
        ));
        let _worker = spawn_worker(resolver, rx);

        // Two unclaimed jobs for the same URL: the first refresh claims the
        // record, the second sees it as just-updated and skips. The sentinel
        // job marks the point where both have been handled, because the
        // worker is strictly FIFO.
        queue.enqueue(&url);
        queue.enqueue(&url);
        queue.enqueue(&sentinel);

        let mut waited = Duration::ZERO;
        while store.get(&sentinel).await.unwrap().is_none() {
            assert!(waited < Duration::from_secs(5), "worker did not drain");
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += Duration::from_millis(20);
        }

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let rec = store.get(&url).await.unwrap().unwrap();
        assert_eq!(rec.title.as_deref(), Some("T"));
    }

    #[tokio::test]
    async fn pre_claimed_jobs_skip_the_debounce() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new().route(
            "/page",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                ([(header::CONTENT_TYPE, "text/html")], PAGE)
            })
            .with_state(hits.clone()),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let url = format!("http://{addr}/page");

        let store = MemStore::new();
        // A record touched moments ago, exactly what the stale-hit path
        // leaves behind.
        let now = crate::now_epoch_s();
        store.seed(
            &url,
            SiteRecord {
                url: url.clone(),
                title: Some("Old".to_string()),
                description: None,
                favicon_url: None,
                jsonlds: None,
                added_on_epoch_s: 1,
                updated_on_epoch_s: now,
            },
        );

        let (queue, rx) = RefreshQueue::channel();
        let resolver = Arc::new(Resolver::new(
            Arc::new(store.clone()),
            Arc::new(LocalFetcher::with_defaults("urlcast-test/0.1").unwrap()),
            queue.sender(),
            ResolverConfig::default(),
        ));
        let _worker = spawn_worker(resolver.clone(), rx);

        resolver
            .run_refresh_job(&RefreshJob {
                url: url.clone(),
                claimed: true,
            })
            .await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // The same record through the unclaimed path is debounced.
        resolver
            .run_refresh_job(&RefreshJob {
                url: url.clone(),
                claimed: false,
            })
            .await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
