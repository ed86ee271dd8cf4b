use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Output format for the tracing subscriber.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Settings shared by every pool opened from one configuration.
///
/// The claim TTL is the fundamental timeout of the system: auto-extension
/// fires at half of it and the janitor ticks at a third of it, so a dead
/// consumer's objects are reclaimed after at most one TTL.
#[derive(Debug, Deserialize, Clone)]
pub struct PoolSettings {
    /// Redis connection URL (e.g. "redis://127.0.0.1:6379/")
    #[serde(default = "default_url")]
    pub url: String,
    /// Lease duration for claimed objects, in seconds
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: u64,
    /// Interval of the periodic dispatch resignal after a queued
    /// notification, in seconds
    #[serde(default = "default_resignal_secs")]
    pub resignal_secs: u64,
    /// Back-off between retries of a failed store call, in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_claim_ttl_secs() -> u64 {
    30
}

fn default_resignal_secs() -> u64 {
    10
}

fn default_retry_backoff_ms() -> u64 {
    1500
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            url: default_url(),
            claim_ttl_secs: default_claim_ttl_secs(),
            resignal_secs: default_resignal_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
            log_format: LogFormat::default(),
        }
    }
}

impl PoolSettings {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    /// Auto-extension fires at half the lease.
    pub fn extend_interval(&self) -> Duration {
        self.claim_ttl() / 2
    }

    /// The janitor ticks at a third of the lease.
    pub fn clean_interval(&self) -> Duration {
        self.claim_ttl() / 3
    }

    pub fn resignal_interval(&self) -> Duration {
        Duration::from_secs(self.resignal_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_derive_intervals_from_ttl() {
        let s = PoolSettings::default();
        assert_eq!(s.claim_ttl(), Duration::from_secs(30));
        assert_eq!(s.extend_interval(), Duration::from_secs(15));
        assert_eq!(s.clean_interval(), Duration::from_secs(10));
        assert_eq!(s.retry_backoff(), Duration::from_millis(1500));
    }

    #[test]
    fn loads_partial_toml_with_defaults() {
        let cfg: PoolSettings = toml::from_str("claim_ttl_secs = 6\nlog_format = \"json\"").unwrap();
        assert_eq!(cfg.claim_ttl_secs, 6);
        assert_eq!(cfg.extend_interval(), Duration::from_secs(3));
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.url, "redis://127.0.0.1:6379/");
    }
}
