pub mod runtime;
pub use runtime::{new_runtime_config, shared_runtime_config, RuntimeConfig, SharedRuntimeConfig};

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::queue::{
    Backoff, DispatcherConfig, JobPolicy, QueueDefinition, INTEGRATION_SYNC, OUTBOUND_MESSAGES,
    WEBHOOK_PROCESSING,
};
use crate::rate_limit::BucketPolicy;

/// Complete Conduit configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConduitConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub queues: QueuesConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_integrations_db")]
    pub integrations_db: String,
    /// Used only when an encryption key is provided.
    #[serde(default = "default_credentials_db")]
    pub credentials_db: String,
}

fn default_integrations_db() -> String {
    "data/integrations.db".to_string()
}

fn default_credentials_db() -> String {
    "data/credentials.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            integrations_db: default_integrations_db(),
            credentials_db: default_credentials_db(),
        }
    }
}

/// One queue's weight, concurrency and default job policy.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_priority_weight")]
    pub priority_weight: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default)]
    pub jitter: bool,
    #[serde(default = "default_job_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retain_completed")]
    pub retain_completed: usize,
    #[serde(default = "default_retain_failed")]
    pub retain_failed: usize,
}

fn default_priority_weight() -> u32 {
    1
}

fn default_concurrency() -> usize {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    2_000
}

fn default_backoff_max_ms() -> u64 {
    300_000
}

fn default_job_timeout_ms() -> u64 {
    30_000
}

fn default_retain_completed() -> usize {
    100
}

fn default_retain_failed() -> usize {
    500
}

impl QueueConfig {
    fn with_weight(priority_weight: u32, concurrency: usize) -> Self {
        Self {
            priority_weight,
            concurrency,
            ..Self::default()
        }
    }

    pub fn definition(&self, name: &str) -> QueueDefinition {
        QueueDefinition::new(name, self.priority_weight, self.concurrency).with_policy(JobPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff: Backoff::exponential(
                Duration::from_millis(self.backoff_initial_ms),
                Duration::from_millis(self.backoff_max_ms),
            ),
            jitter: self.jitter,
            timeout: Duration::from_millis(self.timeout_ms),
            retain_completed: self.retain_completed,
            retain_failed: self.retain_failed,
        })
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            priority_weight: default_priority_weight(),
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter: false,
            timeout_ms: default_job_timeout_ms(),
            retain_completed: default_retain_completed(),
            retain_failed: default_retain_failed(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueuesConfig {
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_webhook_queue")]
    pub webhook_processing: QueueConfig,
    #[serde(default = "default_sync_queue")]
    pub integration_sync: QueueConfig,
    #[serde(default = "default_outbound_queue")]
    pub outbound_messages: QueueConfig,
}

fn default_global_concurrency() -> usize {
    32
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_webhook_queue() -> QueueConfig {
    QueueConfig::with_weight(10, 10)
}

fn default_sync_queue() -> QueueConfig {
    QueueConfig::with_weight(5, 5)
}

fn default_outbound_queue() -> QueueConfig {
    QueueConfig::with_weight(3, 5)
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            global_concurrency: default_global_concurrency(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            webhook_processing: default_webhook_queue(),
            integration_sync: default_sync_queue(),
            outbound_messages: default_outbound_queue(),
        }
    }
}

impl QueuesConfig {
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            global_concurrency: self.global_concurrency.max(1),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }

    /// The three well-known queues.
    pub fn definitions(&self) -> Vec<QueueDefinition> {
        vec![
            self.webhook_processing.definition(WEBHOOK_PROCESSING),
            self.integration_sync.definition(INTEGRATION_SYNC),
            self.outbound_messages.definition(OUTBOUND_MESSAGES),
        ]
    }
}

/// Token bucket sizing: `points` per `duration_secs`, optional block after overdraw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BucketConfig {
    pub points: u32,
    pub duration_secs: u64,
    #[serde(default)]
    pub block_duration_secs: u64,
}

impl BucketConfig {
    const fn new(points: u32, duration_secs: u64, block_duration_secs: u64) -> Self {
        Self {
            points,
            duration_secs,
            block_duration_secs,
        }
    }

    pub fn policy(&self) -> BucketPolicy {
        BucketPolicy {
            points: self.points.max(1),
            duration: Duration::from_secs(self.duration_secs.max(1)),
            block_duration: Duration::from_secs(self.block_duration_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitsConfig {
    #[serde(default = "default_global_bucket")]
    pub global: BucketConfig,
    #[serde(default = "default_auth_bucket")]
    pub auth: BucketConfig,
    #[serde(default = "default_webhook_bucket")]
    pub webhook: BucketConfig,
    #[serde(default = "default_integration_bucket")]
    pub integration: BucketConfig,
    /// Buckets untouched for this long are dropped.
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
    /// Peers whose `X-Forwarded-For` header is believed.
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

fn default_global_bucket() -> BucketConfig {
    BucketConfig::new(1000, 60, 0)
}

fn default_auth_bucket() -> BucketConfig {
    BucketConfig::new(10, 60, 300)
}

fn default_webhook_bucket() -> BucketConfig {
    BucketConfig::new(300, 60, 0)
}

fn default_integration_bucket() -> BucketConfig {
    BucketConfig::new(60, 60, 0)
}

fn default_idle_ttl_secs() -> u64 {
    600
}

fn default_purge_interval_secs() -> u64 {
    60
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            global: default_global_bucket(),
            auth: default_auth_bucket(),
            webhook: default_webhook_bucket(),
            integration: default_integration_bucket(),
            idle_ttl_secs: default_idle_ttl_secs(),
            purge_interval_secs: default_purge_interval_secs(),
            trusted_proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhooksConfig {
    #[serde(default)]
    pub strict_mode: bool,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Signing secret per provider name.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

fn default_max_payload_bytes() -> usize {
    1_048_576
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            strict_mode: false,
            max_payload_bytes: default_max_payload_bytes(),
            secrets: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Interval for auto-sync integrations that don't set their own.
    #[serde(default = "default_sync_interval_ms")]
    pub default_interval_ms: u64,
    /// Deadline for each connector call made through an instance.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

fn default_sync_interval_ms() -> u64 {
    300_000
}

fn default_operation_timeout_ms() -> u64 {
    30_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: default_sync_interval_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<ConduitConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: ConduitConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConduitConfig::default();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.queues.webhook_processing.priority_weight, 10);
        assert_eq!(config.queues.integration_sync.concurrency, 5);
        assert_eq!(config.rate_limits.auth.block_duration_secs, 300);
        assert_eq!(config.sync.default_interval_ms, 300_000);
        assert!(!config.webhooks.strict_mode);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [server]
            port = 8080

            [storage]
            integrations_db = "/tmp/i.db"

            [queues]
            global_concurrency = 8

            [queues.webhook_processing]
            priority_weight = 20
            concurrency = 2
            max_attempts = 5

            [rate_limits]
            trusted_proxies = ["10.0.0.1", "::1"]

            [rate_limits.webhook]
            points = 5
            duration_secs = 60

            [webhooks]
            strict_mode = true
            max_payload_bytes = 2048

            [webhooks.secrets]
            github = "gh-secret"

            [sync]
            default_interval_ms = 60000
        "#;

        let config: ConduitConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.storage.integrations_db, "/tmp/i.db");
        assert_eq!(config.queues.global_concurrency, 8);
        assert_eq!(config.queues.webhook_processing.max_attempts, 5);
        assert_eq!(config.rate_limits.webhook.points, 5);
        assert_eq!(config.rate_limits.webhook.block_duration_secs, 0);
        assert_eq!(config.rate_limits.trusted_proxies.len(), 2);
        assert!(config.webhooks.strict_mode);
        assert_eq!(config.webhooks.secrets["github"], "gh-secret");
        assert_eq!(config.sync.default_interval_ms, 60_000);
    }

    #[test]
    fn test_partial_config() {
        // Missing sections use defaults
        let toml = r#"
            [sync]
            operation_timeout_ms = 5000
        "#;

        let config: ConduitConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.sync.operation_timeout_ms, 5000);
        assert_eq!(config.sync.default_interval_ms, 300_000);
        assert_eq!(config.queues.outbound_messages.priority_weight, 3);
        assert_eq!(config.rate_limits.global.points, 1000);
        assert!(config.rate_limits.trusted_proxies.is_empty());
    }

    #[test]
    fn test_queue_definitions() {
        let defs = QueuesConfig::default().definitions();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec![WEBHOOK_PROCESSING, INTEGRATION_SYNC, OUTBOUND_MESSAGES]
        );
        assert_eq!(defs[0].policy.max_attempts, 3);
        assert_eq!(defs[0].policy.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_runtime_config_seeded_from_file() {
        let mut config = ConduitConfig::default();
        config.webhooks.max_payload_bytes = 512;
        let runtime = RuntimeConfig::from_config(&config);
        assert_eq!(runtime.webhook_max_payload_bytes, 512);
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config("/nonexistent/conduit.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
