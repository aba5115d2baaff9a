use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

use super::ConduitConfig;

/// Flags read on every request, so changes take effect without restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub rate_limit_enabled: bool,
    /// Reject unsigned webhooks and webhooks for providers without a secret.
    pub webhook_strict_mode: bool,
    pub webhook_max_payload_bytes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            rate_limit_enabled: true,
            webhook_strict_mode: false,
            webhook_max_payload_bytes: 1_048_576, // 1 MB
        }
    }
}

impl RuntimeConfig {
    /// Seeds from the file config, then applies env overrides.
    pub fn from_config(config: &ConduitConfig) -> Self {
        let mut cfg = Self {
            webhook_strict_mode: config.webhooks.strict_mode,
            webhook_max_payload_bytes: config.webhooks.max_payload_bytes,
            ..Self::default()
        };
        cfg.apply_env();
        cfg
    }

    /// Build from env vars, falling back to defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("CONDUIT_RATE_LIMIT_ENABLED") {
            if let Ok(b) = v.parse::<bool>() {
                self.rate_limit_enabled = b;
            }
        }
        if let Ok(v) = std::env::var("CONDUIT_WEBHOOK_STRICT_MODE") {
            if let Ok(b) = v.parse::<bool>() {
                self.webhook_strict_mode = b;
            }
        }
        if let Ok(v) = std::env::var("CONDUIT_WEBHOOK_MAX_PAYLOAD_BYTES") {
            if let Ok(n) = v.parse::<usize>() {
                self.webhook_max_payload_bytes = n;
            }
        }
    }
}

pub type SharedRuntimeConfig = Arc<RwLock<RuntimeConfig>>;

pub fn new_runtime_config() -> SharedRuntimeConfig {
    Arc::new(RwLock::new(RuntimeConfig::from_env()))
}

pub fn shared_runtime_config(config: &ConduitConfig) -> SharedRuntimeConfig {
    Arc::new(RwLock::new(RuntimeConfig::from_config(config)))
}
