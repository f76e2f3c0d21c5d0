//! Sync client configuration - YAML file, `TRACEGUARD_*` environment overlay.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;
use crate::sync::{BackoffPolicy, SyncOptions};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub gateway: GatewaySection,
    pub session: SessionSection,
    pub sync: SyncSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// Base URL; operations are appended as `/<Service>/<Method>`.
    pub endpoint: String,
    pub request_timeout_ms: u64,
    pub sample_traces: bool,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            request_timeout_ms: 30_000,
            sample_traces: true,
        }
    }
}

impl GatewaySection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Directory holding the persisted credential.
    pub storage_dir: PathBuf,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from(".traceguard"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub page_size: u32,
    pub snapshot_max_attempts: u32,
    pub tombstone_retention_secs: u64,
    pub degraded_after_secs: u64,
    pub refresh_interval_secs: Option<u64>,
    pub backoff: BackoffSection,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            page_size: 50,
            snapshot_max_attempts: 5,
            tombstone_retention_secs: 300,
            degraded_after_secs: 60,
            refresh_interval_secs: None,
            backoff: BackoffSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSection {
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
    pub jitter: f64,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            multiplier: 2.0,
            max_ms: 30_000,
            jitter: 0.2,
        }
    }
}

impl BackoffSection {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.initial_ms),
            multiplier: self.multiplier,
            max: Duration::from_millis(self.max_ms),
            jitter: self.jitter,
        }
    }
}

impl SyncConfig {
    /// Load from a YAML file. Missing fields take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        let config: SyncConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Parsing {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Validating {}", path.display()))?;
        Ok(config)
    }

    /// Defaults overlaid with `TRACEGUARD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from `lookup` (normally the process environment).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup("TRACEGUARD_ENDPOINT") {
            self.gateway.endpoint = endpoint;
        }
        if let Some(raw) = lookup("TRACEGUARD_REQUEST_TIMEOUT_MS") {
            self.gateway.request_timeout_ms = parse(&raw, "TRACEGUARD_REQUEST_TIMEOUT_MS")?;
        }
        if let Some(raw) = lookup("TRACEGUARD_SAMPLE_TRACES") {
            self.gateway.sample_traces = parse_bool(&raw, "TRACEGUARD_SAMPLE_TRACES")?;
        }
        if let Some(dir) = lookup("TRACEGUARD_STORAGE_DIR") {
            self.session.storage_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup("TRACEGUARD_PAGE_SIZE") {
            self.sync.page_size = parse(&raw, "TRACEGUARD_PAGE_SIZE")?;
        }
        if let Some(raw) = lookup("TRACEGUARD_SNAPSHOT_MAX_ATTEMPTS") {
            self.sync.snapshot_max_attempts = parse(&raw, "TRACEGUARD_SNAPSHOT_MAX_ATTEMPTS")?;
        }
        if let Some(raw) = lookup("TRACEGUARD_REFRESH_INTERVAL_SECS") {
            self.sync.refresh_interval_secs = match raw.trim() {
                "" | "0" => None,
                value => Some(parse(value, "TRACEGUARD_REFRESH_INTERVAL_SECS")?),
            };
        }
        if let Some(raw) = lookup("TRACEGUARD_BACKOFF_INITIAL_MS") {
            self.sync.backoff.initial_ms = parse(&raw, "TRACEGUARD_BACKOFF_INITIAL_MS")?;
        }
        if let Some(raw) = lookup("TRACEGUARD_BACKOFF_MAX_MS") {
            self.sync.backoff.max_ms = parse(&raw, "TRACEGUARD_BACKOFF_MAX_MS")?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint_url()?;
        let sync = &self.sync;
        if sync.page_size == 0 {
            return Err(invalid("sync.page_size", "must be at least 1"));
        }
        if sync.snapshot_max_attempts == 0 {
            return Err(invalid("sync.snapshot_max_attempts", "must be at least 1"));
        }
        let backoff = &sync.backoff;
        if backoff.initial_ms == 0 {
            return Err(invalid("sync.backoff.initial_ms", "must be positive"));
        }
        if backoff.multiplier.is_nan() || backoff.multiplier < 1.0 {
            return Err(invalid("sync.backoff.multiplier", "must be at least 1.0"));
        }
        if backoff.max_ms < backoff.initial_ms {
            return Err(invalid("sync.backoff.max_ms", "must not be below initial_ms"));
        }
        if !(0.0..=1.0).contains(&backoff.jitter) {
            return Err(invalid("sync.backoff.jitter", "must be within [0, 1]"));
        }
        Ok(())
    }

    pub fn endpoint_url(&self) -> Result<Url, ConfigError> {
        let endpoint = self.gateway.endpoint.trim();
        let url = Url::parse(endpoint).map_err(|e| ConfigError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        Ok(url)
    }

    /// Engine options derived from the `sync` section.
    pub fn sync_options(&self) -> SyncOptions {
        let sync = &self.sync;
        SyncOptions {
            backoff: sync.backoff.policy(),
            page_size: sync.page_size,
            snapshot_max_attempts: sync.snapshot_max_attempts,
            tombstone_retention: Duration::from_secs(sync.tombstone_retention_secs),
            degraded_after: Duration::from_secs(sync.degraded_after_secs),
            refresh_interval: sync
                .refresh_interval_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

fn parse<T: std::str::FromStr>(raw: &str, field: &'static str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        field,
        reason: format!("'{raw}': {e}"),
    })
}

fn parse_bool(raw: &str, field: &'static str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field,
            reason: format!("'{raw}' is not a boolean"),
        }),
    }
}
