//! Dispatcher configuration.
//!
//! Sources are merged in order, later ones winning:
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. `MOTIONIT_OUTBOX_*` environment variables (e.g. `MOTIONIT_OUTBOX_BATCH_SIZE=50`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dispatch::RetryPolicy;
use crate::store::MAX_POLL_BATCH;

pub const ENV_PREFIX: &str = "MOTIONIT_OUTBOX_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {field} {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Delay between the end of one poll and the start of the next.
    pub poll_interval_ms: u64,
    /// Records loaded per poll. Never more than 100.
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// How long a claim is held before another dispatcher may recover it.
    pub claim_lease_secs: u64,
    /// How long a delivery may run before it counts as failed. Must be
    /// shorter than the claim lease.
    pub delivery_timeout_ms: u64,
    pub worker_id: String,
    /// Age after which `SENT` records are purged.
    pub sent_retention_secs: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        OutboxConfig {
            poll_interval_ms: 5_000,
            batch_size: MAX_POLL_BATCH,
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            claim_lease_secs: 60,
            delivery_timeout_ms: 30_000,
            worker_id: default_worker_id(),
            sent_retention_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl OutboxConfig {
    /// Defaults overridden by the environment.
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.min(MAX_POLL_BATCH)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn sent_retention(&self) -> Duration {
        Duration::from_secs(self.sent_retention_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero: [(&'static str, u64); 7] = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("batch_size", self.batch_size as u64),
            ("max_attempts", u64::from(self.max_attempts)),
            ("backoff_base_ms", self.backoff_base_ms),
            ("claim_lease_secs", self.claim_lease_secs),
            ("delivery_timeout_ms", self.delivery_timeout_ms),
            ("sent_retention_secs", self.sent_retention_secs),
        ];
        if let Some((field, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid {
                field: *field,
                reason: "must be greater than zero",
            });
        }
        if self.delivery_timeout_ms >= self.claim_lease_secs.saturating_mul(1_000) {
            return Err(ConfigError::Invalid {
                field: "delivery_timeout_ms",
                reason: "must be less than the claim lease",
            });
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigError::Invalid {
                field: "backoff_max_ms",
                reason: "must not be less than backoff_base_ms",
            });
        }
        if self.worker_id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "worker_id",
                reason: "must not be empty",
            });
        }
        Ok(())
    }
}

/// Builds an [`OutboxConfig`] from defaults, a TOML file and the environment.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_prefix: String,
}

impl ConfigLoader {
    pub fn new() -> Self {
        ConfigLoader {
            config_path: None,
            env_prefix: ENV_PREFIX.to_string(),
        }
    }

    pub fn with_config_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn load(&self) -> Result<OutboxConfig, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(OutboxConfig::default()));

        if let Some(path) = &self.config_path {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
                info!(path = %path.display(), "loaded outbox configuration file");
            } else {
                debug!(path = %path.display(), "outbox configuration file not found, skipping");
            }
        }

        figment = figment.merge(Env::prefixed(&self.env_prefix));

        let config: OutboxConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn default_worker_id() -> String {
    format!("outbox-dispatcher-{}", std::process::id())
}
