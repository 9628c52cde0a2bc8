use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use urlcast_core::MetadataStore;
use urlcast_local::{FsStore, MemStore};
use urlcast_server::app::{self, ServiceOptions};
use urlcast_server::config::ServiceConfig;

#[derive(Parser, Debug)]
#[command(name = "urlcast-server")]
#[command(about = "Physical-Web URL resolution service", long_about = None)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "URLCAST_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Directory for the persistent record store. Omitted, records live in
    /// memory and die with the process.
    #[arg(long, env = "URLCAST_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// Directory holding config.SECRET.json / config.SAMPLE.json.
    #[arg(long, env = "URLCAST_CONFIG_DIR", default_value = ".")]
    config_dir: PathBuf,

    /// Deployment identifier; a `-dev` suffix enables experimental features.
    #[arg(long, env = "URLCAST_APP_ID", default_value = "url-caster")]
    app_id: String,

    /// User-Agent sent on page fetches.
    #[arg(long, env = "URLCAST_USER_AGENT", default_value = "urlcast/0.1")]
    user_agent: String,

    /// Public origin of this deployment, used to rewrite emitted icon URLs
    /// onto the /favicon relay (e.g. https://urlcast.example.org).
    #[arg(long, env = "URLCAST_PUBLIC_BASE")]
    public_base: Option<url::Url>,

    /// Per-page fetch timeout.
    #[arg(long, env = "URLCAST_FETCH_TIMEOUT_MS", default_value_t = 10_000)]
    fetch_timeout_ms: u64,

    /// Default for the batch-level secureOnly flag.
    #[arg(long, env = "URLCAST_SECURE_ONLY", action = clap::ArgAction::Set, default_value_t = false)]
    secure_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("urlcast=info")),
        )
        .init();

    let cli = Cli::parse();

    let store: Arc<dyn MetadataStore> = match &cli.store_dir {
        Some(dir) => {
            tracing::info!(dir = %dir.display(), "using filesystem store");
            Arc::new(FsStore::new(dir.clone()))
        }
        None => {
            tracing::warn!("no --store-dir given, records are in-memory only");
            Arc::new(MemStore::new())
        }
    };

    let opts = ServiceOptions {
        user_agent: cli.user_agent,
        fetch_timeout: Duration::from_millis(cli.fetch_timeout_ms),
        app_id: cli.app_id,
        secure_only_default: cli.secure_only,
        public_base: cli.public_base,
        config: ServiceConfig::load_from_dir(&cli.config_dir),
    };
    if opts.experimental() {
        tracing::info!(app_id = %opts.app_id, "experimental features enabled");
    }

    let state = app::build_state(store, opts)?;
    let router = app::router(state);

    let listener = tokio::net::TcpListener::bind(cli.bind).await?;
    tracing::info!(addr = %cli.bind, "listening");
    axum::serve(listener, router).await?;
    Ok(())
}
