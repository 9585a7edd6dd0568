use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{ensure, Context, Result};
use shared::protocol::CYGNUS_SERVICE_TYPE;

/// Upper bound for every configured interval, timeout and staleness window
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;
const MAX_WINDOW_MS: u64 = MAX_WINDOW_SECS * 1000;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Restrict mDNS traffic to one interface; all interfaces when unset
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default = "default_resolve_attempts")]
    pub resolve_attempts: u32,
    #[serde(default = "default_resolve_backoff_ms")]
    pub resolve_backoff_ms: u64,
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_reaper_enabled")]
    pub enabled: bool,
    #[serde(default = "default_reaper_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_reaper_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_offline_after")]
    pub offline_after_secs: u64,
    /// 0 keeps reconciliation purely read-triggered
    #[serde(default)]
    pub reconcile_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_service_type() -> String {
    CYGNUS_SERVICE_TYPE.to_string()
}

fn default_resolve_attempts() -> u32 {
    3
}

fn default_resolve_backoff_ms() -> u64 {
    500
}

fn default_resolve_timeout_ms() -> u64 {
    3000
}

fn default_probe_interval() -> u64 {
    30
}

fn default_probe_timeout_ms() -> u64 {
    1500
}

fn default_reaper_enabled() -> bool {
    true
}

fn default_reaper_interval() -> u64 {
    60
}

fn default_reaper_timeout() -> u64 {
    120
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/cygnus/devices.db")
}

fn default_offline_after() -> u64 {
    60
}

fn default_listen() -> String {
    "0.0.0.0:5000".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            interface: None,
            resolve_attempts: default_resolve_attempts(),
            resolve_backoff_ms: default_resolve_backoff_ms(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
            probe_interval_secs: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: default_reaper_enabled(),
            interval_secs: default_reaper_interval(),
            timeout_secs: default_reaper_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            offline_after_secs: default_offline_after(),
            reconcile_interval_secs: 0,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl DiscoveryConfig {
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn resolve_backoff(&self) -> Duration {
        Duration::from_millis(self.resolve_backoff_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall a ticker or overflow a deadline.
    pub fn validate(&self) -> Result<()> {
        let d = &self.discovery;
        ensure!(d.resolve_attempts > 0, "discovery.resolve_attempts must be at least 1");
        ensure!(d.probe_interval_secs > 0, "discovery.probe_interval_secs must be positive");
        ensure!(self.reaper.interval_secs > 0, "reaper.interval_secs must be positive");

        for (key, secs) in [
            ("discovery.probe_interval_secs", d.probe_interval_secs),
            ("reaper.interval_secs", self.reaper.interval_secs),
            ("reaper.timeout_secs", self.reaper.timeout_secs),
            ("store.offline_after_secs", self.store.offline_after_secs),
            ("store.reconcile_interval_secs", self.store.reconcile_interval_secs),
        ] {
            ensure!(secs <= MAX_WINDOW_SECS, "{} must not exceed {}s", key, MAX_WINDOW_SECS);
        }
        for (key, ms) in [
            ("discovery.resolve_backoff_ms", d.resolve_backoff_ms),
            ("discovery.resolve_timeout_ms", d.resolve_timeout_ms),
            ("discovery.probe_timeout_ms", d.probe_timeout_ms),
        ] {
            ensure!(ms <= MAX_WINDOW_MS, "{} must not exceed {}ms", key, MAX_WINDOW_MS);
        }

        Ok(())
    }
}

/// Staleness window in chrono terms, clamped so it can always be subtracted
/// from a timestamp.
pub fn window(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}
