//! Deployment configuration: external API credentials for the proxy
//! endpoints. The resolution pipeline itself needs none of this.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Shortener API key slot in `oauth_keys`.
pub const SHORTENER_KEY: &str = "goo.gl";

const CONFIG_FILES: [&str; 2] = ["config.SECRET.json", "config.SAMPLE.json"];

fn default_shortener_endpoint() -> String {
    "https://www.googleapis.com/urlshortener/v1/url".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub oauth_keys: BTreeMap<String, String>,
    /// Overridable so tests can point the proxy at a fixture.
    #[serde(default = "default_shortener_endpoint")]
    pub shortener_endpoint: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            oauth_keys: BTreeMap::new(),
            shortener_endpoint: default_shortener_endpoint(),
        }
    }
}

impl ServiceConfig {
    /// Load `config.SECRET.json` if present, else `config.SAMPLE.json`.
    /// Neither existing is not fatal: the service runs with the proxy
    /// endpoints unconfigured.
    pub fn load_from_dir(dir: &Path) -> Self {
        for name in CONFIG_FILES {
            let path = dir.join(name);
            if !path.is_file() {
                continue;
            }
            match std::fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|b| serde_json::from_slice(&b).map_err(|e| e.to_string()))
            {
                Ok(cfg) => {
                    tracing::info!(path = %path.display(), "loaded service config");
                    return cfg;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable config file");
                }
            }
        }
        tracing::warn!("no config file found; external API proxies are unconfigured");
        Self::default()
    }

    pub fn shortener_key(&self) -> Option<&str> {
        self.oauth_keys
            .get(SHORTENER_KEY)
            .map(|s| s.as_str())
            .filter(|s| !s.trim().is_empty())
    }
}
