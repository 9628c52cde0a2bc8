//! Service wiring: shared state construction and the route table.

use crate::config::ServiceConfig;
use crate::routes;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use urlcast_core::MetadataStore;
use urlcast_local::refresh::{self, RefreshQueue};
use urlcast_local::resolver::{Resolver, ResolverConfig};
use urlcast_local::LocalFetcher;

pub struct AppState {
    pub resolver: Arc<Resolver>,
    pub store: Arc<dyn MetadataStore>,
    pub refresh: RefreshQueue,
    /// Client for the relay endpoints (favicon bytes, shortener proxy).
    /// Unlike the page fetcher it follows redirects.
    pub relay_client: reqwest::Client,
    pub config: ServiceConfig,
    pub secure_only_default: bool,
    /// Public origin of this deployment; set, emitted icons point at our
    /// `/favicon` relay instead of third-party origins.
    pub public_base: Option<Url>,
    pub experimental: bool,
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub user_agent: String,
    pub fetch_timeout: Duration,
    /// Deployment identifier; a `-dev` suffix switches experimental
    /// features on.
    pub app_id: String,
    pub secure_only_default: bool,
    pub public_base: Option<Url>,
    pub config: ServiceConfig,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            user_agent: "urlcast/0.1".to_string(),
            fetch_timeout: Duration::from_secs(10),
            app_id: "url-caster".to_string(),
            secure_only_default: false,
            public_base: None,
            config: ServiceConfig::default(),
        }
    }
}

impl ServiceOptions {
    pub fn experimental(&self) -> bool {
        self.app_id.ends_with("-dev")
    }
}

/// Assemble the resolution pipeline around `store` and spawn the refresh
/// worker. Must run inside a tokio runtime.
pub fn build_state(
    store: Arc<dyn MetadataStore>,
    opts: ServiceOptions,
) -> anyhow::Result<Arc<AppState>> {
    let fetcher = Arc::new(LocalFetcher::new(&opts.user_agent, opts.fetch_timeout)?);
    let (queue, rx) = RefreshQueue::channel();
    let resolver_cfg = ResolverConfig {
        fetch_timeout_ms: Some(opts.fetch_timeout.as_millis() as u64),
        experimental: opts.experimental(),
        ..ResolverConfig::default()
    };
    let resolver = Arc::new(Resolver::new(
        store.clone(),
        fetcher,
        queue.sender(),
        resolver_cfg,
    ));
    refresh::spawn_worker(resolver.clone(), rx);

    let relay_client = reqwest::Client::builder()
        .user_agent(&opts.user_agent)
        .redirect(reqwest::redirect::Policy::limited(10))
        .timeout(Duration::from_secs(10))
        .build()?;

    let experimental = opts.experimental();
    Ok(Arc::new(AppState {
        resolver,
        store,
        refresh: queue,
        relay_client,
        config: opts.config,
        secure_only_default: opts.secure_only_default,
        public_base: opts.public_base,
        experimental,
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/", get(routes::index))
        .route("/resolve-scan", post(routes::scan::resolve_scan))
        .route("/demo", get(routes::scan::demo))
        .route("/refresh-url", post(routes::refresh_url))
        .route("/favicon", get(routes::favicon::relay))
        .route("/go", get(routes::go))
        .route("/shorten-url", post(routes::shortener::shorten));
    if state.experimental {
        app = app.route(
            "/experimental/googl/*path",
            get(routes::experimental_googl),
        );
    }
    app.with_state(state)
}
