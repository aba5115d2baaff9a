//! Connector registry - provider constructors and live instances.
//!
//! Constructors are registered at process start. Instances are cached per
//! (integration id, provider) so each integration has exactly one.

use crate::connector::Connector;
use crate::connectors::{SlackConnector, SmtpConnector, WebhookConnector};
use crate::error::ConnectorError;
use crate::instance::ConnectorInstance;
use crate::types::ConnectorDescriptor;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub type ConnectorConstructor = Arc<dyn Fn() -> Box<dyn Connector> + Send + Sync>;

/// Default bound on a single connector call.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

type InstanceKey = (String, String);

pub struct ConnectorRegistry {
    constructors: DashMap<String, ConnectorConstructor>,
    instances: DashMap<InstanceKey, Arc<ConnectorInstance>>,
    operation_timeout: Duration,
}

impl ConnectorRegistry {
    pub fn new(operation_timeout: Duration) -> Self {
        Self {
            constructors: DashMap::new(),
            instances: DashMap::new(),
            operation_timeout,
        }
    }

    /// Registry preloaded with `smtp`, `slack` and `webhook`.
    pub fn with_builtin_connectors(operation_timeout: Duration) -> Self {
        let registry = Self::new(operation_timeout);
        registry.register("smtp", || Box::new(SmtpConnector::new()));
        registry.register("slack", || Box::new(SlackConnector::new()));
        registry.register("webhook", || Box::new(WebhookConnector::new()));
        registry
    }

    /// Adds a provider. A second registration for the same name replaces the first.
    pub fn register<F>(&self, provider: &str, constructor: F)
    where
        F: Fn() -> Box<dyn Connector> + Send + Sync + 'static,
    {
        if self
            .constructors
            .insert(provider.to_string(), Arc::new(constructor))
            .is_some()
        {
            debug!(provider = %provider, "Replaced connector registration");
        }
    }

    pub fn create(&self, provider: &str) -> Result<Box<dyn Connector>, ConnectorError> {
        let constructor = self.constructor(provider)?;
        Ok(constructor())
    }

    fn constructor(&self, provider: &str) -> Result<ConnectorConstructor, ConnectorError> {
        self.constructors
            .get(provider)
            .map(|c| c.value().clone())
            .ok_or_else(|| ConnectorError::configuration(format!("unknown provider '{}'", provider)))
    }

    pub fn descriptor(&self, provider: &str) -> Option<ConnectorDescriptor> {
        self.create(provider).ok().map(|c| c.descriptor().clone())
    }

    /// Registered provider names, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Returns the cached instance for the pair, constructing it on first use.
    pub fn get_or_create_instance(
        &self,
        integration_id: &str,
        provider: &str,
    ) -> Result<Arc<ConnectorInstance>, ConnectorError> {
        let key = (integration_id.to_string(), provider.to_string());
        if let Some(existing) = self.instances.get(&key) {
            return Ok(existing.value().clone());
        }

        let constructor = self.constructor(provider)?;
        let timeout = self.operation_timeout;
        let instance = self
            .instances
            .entry(key)
            .or_insert_with(|| {
                Arc::new(ConnectorInstance::new(integration_id, constructor(), timeout))
            })
            .value()
            .clone();
        Ok(instance)
    }

    pub fn get_instance(&self, integration_id: &str, provider: &str) -> Option<Arc<ConnectorInstance>> {
        self.instances
            .get(&(integration_id.to_string(), provider.to_string()))
            .map(|e| e.value().clone())
    }

    pub fn instances_for_provider(&self, provider: &str) -> Vec<Arc<ConnectorInstance>> {
        self.instances
            .iter()
            .filter(|e| e.key().1 == provider)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Evicts and destroys one instance. Returns it if it existed.
    pub async fn remove_instance(&self, integration_id: &str, provider: &str) -> Option<Arc<ConnectorInstance>> {
        let (_, instance) = self
            .instances
            .remove(&(integration_id.to_string(), provider.to_string()))?;
        instance.destroy().await;
        debug!(integration_id = %integration_id, provider = %provider, "Removed connector instance");
        Some(instance)
    }

    /// Destroys every live instance.
    pub async fn shutdown(&self) {
        let keys: Vec<InstanceKey> = self.instances.iter().map(|e| e.key().clone()).collect();
        let count = keys.len();
        for (integration_id, provider) in keys {
            self.remove_instance(&integration_id, &provider).await;
        }
        info!(instances = count, "Connector registry shut down");
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::with_builtin_connectors(DEFAULT_OPERATION_TIMEOUT)
    }
}
