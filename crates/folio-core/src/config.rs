//! Client configuration management.
//!
//! This module handles loading and saving the client configuration, which
//! includes the API base URL, the last used username, the credential backend
//! and token timing settings.
//!
//! Configuration is stored at `~/.config/folio-lms/config.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::auth::token::DEFAULT_REFRESH_MARGIN_SECS;
use crate::auth::{CredentialStore, FileStore, KeyringStore};

/// Application name used for the config directory path
const APP_NAME: &str = "folio-lms";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Credentials file name for the file backend
const CREDENTIALS_FILE: &str = "credentials.json";

/// Backend used when nothing is configured
pub const DEFAULT_API_URL: &str = "http://localhost:8080";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Endpoints that never carry a bearer token or trigger a refresh.
pub const DEFAULT_PUBLIC_PATHS: &[&str] = &["/auth/login", "/auth/register", "/auth/refresh"];

/// Path of the token refresh endpoint
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Path of the login endpoint
pub const LOGIN_PATH: &str = "/auth/login";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackend {
    #[default]
    Keyring,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_url: Option<String>,
    pub last_username: Option<String>,
    pub credential_backend: CredentialBackend,
    pub request_timeout_secs: u64,
    pub refresh_margin_secs: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: None,
            last_username: None,
            credential_backend: CredentialBackend::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            refresh_margin_secs: DEFAULT_REFRESH_MARGIN_SECS,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `FOLIO_API_URL` on top of the file contents.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("FOLIO_API_URL") {
            if !url.trim().is_empty() {
                self.api_url = Some(url.trim().to_string());
            }
        }
    }

    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE))
    }

    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME))
    }

    pub fn api_url(&self) -> &str {
        self.api_url.as_deref().unwrap_or(DEFAULT_API_URL)
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            refresh_margin: chrono::Duration::try_seconds(self.refresh_margin_secs)
                .filter(|margin| *margin >= chrono::Duration::zero())
                .unwrap_or_else(|| {
                    warn!(
                        refresh_margin_secs = self.refresh_margin_secs,
                        "Invalid refresh margin in config, using default"
                    );
                    chrono::Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS)
                }),
            ..GatewayConfig::new(self.api_url())
        }
    }

    /// Open the configured durable credential store
    pub fn credential_store(&self) -> Result<Arc<dyn CredentialStore>> {
        Ok(match self.credential_backend {
            CredentialBackend::Keyring => Arc::new(KeyringStore::new()),
            CredentialBackend::File => {
                Arc::new(FileStore::new(Self::config_dir()?.join(CREDENTIALS_FILE)))
            }
        })
    }
}

/// Runtime settings consumed by the gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub refresh_margin: chrono::Duration,
    pub public_paths: Vec<String>,
}

impl GatewayConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            refresh_margin: chrono::Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
            public_paths: DEFAULT_PUBLIC_PATHS.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Whether `path` targets an endpoint that is sent without authentication.
    pub fn is_public(&self, path: &str) -> bool {
        let path = self.relative_path(path);
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let path = path.trim_end_matches('/');
        self.public_paths.iter().any(|public| {
            let public = public.trim_end_matches('/');
            path == public
                || path
                    .strip_prefix(public)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// Absolute URL for a path relative to the base URL.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn relative_path<'a>(&self, path: &'a str) -> &'a str {
        path.strip_prefix(self.base_url.as_str()).unwrap_or(path)
    }
}
