//! Configuration management for the relay.
//!
//! Values come from `config.json` under the base directory, then
//! `OUTBOX_*` environment variables override individual fields.

use crate::{CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Delay between dispatch cycles when the outbox is idle.
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub handler_timeout_ms: u64,
    /// How long a claimed message stays leased to one worker.
    pub lease_secs: u64,
    /// Failures before a message is dead-lettered; 0 retries forever.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Processed messages older than this are deleted.
    pub retention_hours: u64,
    pub sweep_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            poll_interval_ms: 1_000,
            batch_size: 50,
            max_concurrency: 8,
            handler_timeout_ms: 30_000,
            lease_secs: 120,
            max_attempts: 10,
            backoff_base_ms: 2_000,
            backoff_max_ms: 300_000,
            retention_hours: 168,
            sweep_interval_secs: 3_600,
        }
    }
}

impl Config {
    /// Load configuration from the config file (if present), then override
    /// from environment.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Override configuration from `OUTBOX_*` environment variables.
    pub fn load_from_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from `lookup`. Values that fail to parse are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("OUTBOX_LOG_LEVEL").and_then(non_empty) {
            self.log_level = level;
        }
        override_parsed(&lookup, "OUTBOX_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        override_parsed(&lookup, "OUTBOX_BATCH_SIZE", &mut self.batch_size);
        override_parsed(&lookup, "OUTBOX_MAX_CONCURRENCY", &mut self.max_concurrency);
        override_parsed(&lookup, "OUTBOX_HANDLER_TIMEOUT_MS", &mut self.handler_timeout_ms);
        override_parsed(&lookup, "OUTBOX_LEASE_SECS", &mut self.lease_secs);
        override_parsed(&lookup, "OUTBOX_MAX_ATTEMPTS", &mut self.max_attempts);
        override_parsed(&lookup, "OUTBOX_BACKOFF_BASE_MS", &mut self.backoff_base_ms);
        override_parsed(&lookup, "OUTBOX_BACKOFF_MAX_MS", &mut self.backoff_max_ms);
        override_parsed(&lookup, "OUTBOX_RETENTION_HOURS", &mut self.retention_hours);
        override_parsed(&lookup, "OUTBOX_SWEEP_INTERVAL_SECS", &mut self.sweep_interval_secs);
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// `None` means retry forever.
    pub fn max_attempts(&self) -> Option<u32> {
        (self.max_attempts > 0).then_some(self.max_attempts)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3_600))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn non_empty(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn override_parsed<F, T>(lookup: &F, name: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(raw) = lookup(name).and_then(non_empty) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => warn!(variable = name, value = %raw, "Ignoring unparseable environment override"),
    }
}
