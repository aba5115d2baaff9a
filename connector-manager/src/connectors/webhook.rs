//! Generic inbound webhook connector.
//!
//! Holds no remote session. It accepts any credentials, reports healthy once
//! connected and filters inbound events by type when configured to.

use crate::connector::{Connector, WebhookCapable};
use crate::error::ConnectorError;
use crate::types::{
    Capability, ConnectorDescriptor, ConnectorKind, WebhookOutcome, WebhookRegistration,
};
use async_trait::async_trait;
use conduit::credentials::Credentials;
use conduit::webhook::WebhookEvent;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    /// Accepted event types. `None` accepts everything.
    #[serde(default)]
    pub event_types: Option<Vec<String>>,
}

pub struct WebhookConnector {
    descriptor: ConnectorDescriptor,
    config: WebhookConfig,
    connected: AtomicBool,
    registered: RwLock<Vec<String>>,
}

impl WebhookConnector {
    pub fn new() -> Self {
        Self {
            descriptor: ConnectorDescriptor::new(
                "webhook",
                ConnectorKind::Webhook,
                env!("CARGO_PKG_VERSION"),
                [Capability::Webhooks],
            ),
            config: WebhookConfig::default(),
            connected: AtomicBool::new(false),
            registered: RwLock::new(Vec::new()),
        }
    }

    /// URLs currently registered through `setup_webhook`.
    pub fn registered_urls(&self) -> Vec<String> {
        self.registered.read().unwrap().clone()
    }

    fn accepts(&self, event_type: &str) -> bool {
        match &self.config.event_types {
            Some(types) => types.iter().any(|t| t == event_type),
            None => true,
        }
    }
}

impl Default for WebhookConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WebhookConnector {
    fn descriptor(&self) -> &ConnectorDescriptor {
        &self.descriptor
    }

    fn configure(&mut self, config: &Value) -> Result<(), ConnectorError> {
        let config: WebhookConfig = if config.is_null() {
            WebhookConfig::default()
        } else {
            serde_json::from_value(config.clone())
                .map_err(|e| ConnectorError::configuration(format!("invalid webhook config: {}", e)))?
        };
        if config.event_types.as_ref().is_some_and(|t| t.is_empty()) {
            return Err(ConnectorError::configuration("event_types must not be empty"));
        }
        self.config = config;
        Ok(())
    }

    async fn authenticate(&self, _credentials: &Credentials) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn validate_auth(&self, _credentials: &Credentials) -> Result<bool, ConnectorError> {
        Ok(true)
    }

    async fn connect(&self, _credentials: &Credentials) -> Result<(), ConnectorError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectorError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> Result<bool, ConnectorError> {
        Ok(self.connected.load(Ordering::SeqCst))
    }

    fn as_webhook_handler(&self) -> Option<&dyn WebhookCapable> {
        Some(self)
    }
}

#[async_trait]
impl WebhookCapable for WebhookConnector {
    async fn setup_webhook(&self, url: &str) -> Result<WebhookRegistration, ConnectorError> {
        let mut registered = self.registered.write().unwrap();
        if !registered.iter().any(|u| u == url) {
            registered.push(url.to_string());
        }
        Ok(WebhookRegistration {
            url: url.to_string(),
            webhook_id: None,
        })
    }

    async fn remove_webhook(&self, url: &str) -> Result<(), ConnectorError> {
        self.registered.write().unwrap().retain(|u| u != url);
        Ok(())
    }

    async fn process_webhook(&self, event: &WebhookEvent) -> Result<WebhookOutcome, ConnectorError> {
        if !self.accepts(&event.event_type) {
            debug!(event_type = %event.event_type, "Ignoring filtered webhook event");
            return Ok(WebhookOutcome::ignored(&event.event_type));
        }
        Ok(WebhookOutcome {
            event_type: event.event_type.clone(),
            processed: true,
            messages: Vec::new(),
            detail: event.payload.clone(),
        })
    }
}
