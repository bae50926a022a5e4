//! Connection configuration
//!
//! Defines how the SDK reaches a DSMS instance: host, credentials, timeouts,
//! TLS policy, and the switches that govern validation and refresh behavior.
//! The configuration is read-only once a [`crate::Session`] has been built.

use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::warn;

/// Embedded default configuration file
const DEFAULT_CONFIG: &str = include_str!("../../dsms.config.toml");

/// Configuration file name
const CONFIG_FILE_NAME: &str = "dsms.config.toml";

/// Settings for one DSMS connection
#[derive(Clone, Serialize, Deserialize)]
pub struct Configuration {
    /// Base URL of the DSMS instance
    pub host_url: String,
    /// Timeout in seconds for a single request
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Verify TLS certificates of the host
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    /// Reject custom properties not declared by the knowledge type
    #[serde(default = "default_true")]
    pub strict_validation: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Pre-supplied bearer token
    #[serde(default)]
    pub token: Option<String>,
    /// Exchange credentials again when the token expired
    #[serde(default = "default_true")]
    pub enable_auto_reauth: bool,
    /// Re-fetch committed objects from the server after a commit
    #[serde(default = "default_true")]
    pub auto_refresh: bool,
    /// Check that the host answers like a DSMS instance when connecting
    #[serde(default = "default_true")]
    pub ping_backend: bool,
    /// Load the knowledge types when the session starts
    #[serde(default = "default_true")]
    pub auto_fetch_ktypes: bool,
    /// Suffix derived slugs with a random fragment
    #[serde(default = "default_true")]
    pub individual_slugs: bool,
    /// Triplestore repository holding knowledge items
    #[serde(default = "default_kitem_repo")]
    pub kitem_repo: String,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_request_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_kitem_repo() -> String {
    "knowledge-items".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("host_url", &self.host_url)
            .field("request_timeout", &self.request_timeout)
            .field("ssl_verify", &self.ssl_verify)
            .field("strict_validation", &self.strict_validation)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("enable_auto_reauth", &self.enable_auto_reauth)
            .field("auto_refresh", &self.auto_refresh)
            .field("ping_backend", &self.ping_backend)
            .field("auto_fetch_ktypes", &self.auto_fetch_ktypes)
            .field("individual_slugs", &self.individual_slugs)
            .field("kitem_repo", &self.kitem_repo)
            .field("logging", &self.logging)
            .finish()
    }
}

impl Configuration {
    /// Configuration for `host_url` with every other setting at its default
    pub fn new(host_url: impl Into<String>) -> Self {
        Self {
            host_url: host_url.into(),
            request_timeout: default_request_timeout(),
            ssl_verify: true,
            strict_validation: true,
            username: None,
            password: None,
            token: None,
            enable_auto_reauth: true,
            auto_refresh: true,
            ping_backend: true,
            auto_fetch_ktypes: true,
            individual_slugs: true,
            kitem_repo: default_kitem_repo(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Load configuration from the usual locations
    ///
    /// Looks at `./dsms.config.toml`, then `~/.dsms/dsms.config.toml`, then the
    /// file named by `DSMS_CONFIG_PATH`. Falls back to the embedded defaults.
    pub fn load() -> Result<Self> {
        if let Ok(content) = std::fs::read_to_string(CONFIG_FILE_NAME) {
            return Self::from_toml_str(&content)
                .with_context(|| format!("Failed to parse {}", CONFIG_FILE_NAME));
        }

        if let Some(base_dirs) = BaseDirs::new() {
            let home_config = base_dirs.home_dir().join(".dsms").join(CONFIG_FILE_NAME);
            if let Ok(content) = std::fs::read_to_string(&home_config) {
                return Self::from_toml_str(&content)
                    .with_context(|| format!("Failed to parse {}", home_config.display()));
            }
        }

        if let Ok(config_path) = std::env::var("DSMS_CONFIG_PATH") {
            if let Ok(content) = std::fs::read_to_string(&config_path) {
                return Self::from_toml_str(&content)
                    .with_context(|| format!("Failed to parse {}", config_path));
            }
        }

        warn!(
            "No {} found, continuing with the embedded default configuration",
            CONFIG_FILE_NAME
        );
        Self::from_toml_str(DEFAULT_CONFIG).context("Failed to parse embedded default config")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.host_url.starts_with("http://") || self.host_url.starts_with("https://")) {
            return Err(anyhow::anyhow!(
                "Host URL must start with http:// or https://, got `{}`",
                self.host_url
            ));
        }

        if self.request_timeout == 0 {
            return Err(anyhow::anyhow!("Request timeout must be greater than zero"));
        }

        match (&self.username, &self.password) {
            (Some(_), None) => {
                return Err(anyhow::anyhow!("`username` provided, but `password` not"))
            }
            (None, Some(_)) => {
                return Err(anyhow::anyhow!("`password` provided, but `username` not"))
            }
            (Some(_), Some(_)) if self.token.is_some() => {
                return Err(anyhow::anyhow!(
                    "Either `username` and `password` or `token` must be provided, not both"
                ))
            }
            _ => {}
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(anyhow::anyhow!("Invalid log level: {}", self.logging.level)),
        }

        if self.username.is_none() && self.token.is_none() {
            warn!("No authentication details provided, requests will be anonymous");
        }

        Ok(())
    }

    /// Apply `DSMS_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.trim().is_empty())
        }

        if let Some(host_url) = var("DSMS_HOST_URL") {
            self.host_url = host_url;
        }
        if let Some(username) = var("DSMS_USERNAME") {
            self.username = Some(username);
        }
        if let Some(password) = var("DSMS_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(token) = var("DSMS_TOKEN") {
            self.token = Some(token);
        }
        if let Some(timeout) = var("DSMS_REQUEST_TIMEOUT") {
            if let Ok(timeout) = timeout.parse::<u64>() {
                self.request_timeout = timeout;
            }
        }
        if let Some(verify) = var("DSMS_SSL_VERIFY") {
            if let Ok(verify) = verify.to_ascii_lowercase().parse::<bool>() {
                self.ssl_verify = verify;
            }
        }
        if let Some(level) = var("DSMS_LOG_LEVEL") {
            self.logging.level = level.to_ascii_lowercase();
        }
    }

    /// Token as an `Authorization` header value
    pub fn bearer(&self) -> Option<String> {
        self.token.as_deref().map(normalize_bearer)
    }

    /// Absolute URL for a route relative to the host
    pub fn endpoint(&self, route: &str) -> String {
        format!(
            "{}/{}",
            self.host_url.trim_end_matches('/'),
            route.trim_start_matches('/')
        )
    }
}

pub(crate) fn normalize_bearer(token: &str) -> String {
    if token.starts_with("Bearer ") {
        token.to_string()
    } else {
        format!("Bearer {}", token)
    }
}
