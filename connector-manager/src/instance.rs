use crate::connector::Connector;
use crate::error::ConnectorError;
use crate::types::{
    Capability, ConnectorDescriptor, ConnectorState, FetchOptions, Message, OutboundMessage,
    SendReceipt, SyncReport, WebhookOutcome, WebhookRegistration,
};
use chrono::{DateTime, Utc};
use conduit::credentials::Credentials;
use conduit::webhook::WebhookEvent;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Credentials expiring within this window are refreshed before connecting.
const REFRESH_THRESHOLD_MINUTES: i64 = 5;

/// Lifecycle notifications for one instance.
#[derive(Clone, Debug, PartialEq)]
pub enum InstanceEvent {
    Connected,
    Disconnected,
    Error(String),
    Destroyed,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub state: ConnectorState,
    pub initialized: bool,
    pub last_error: Option<String>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        Self {
            state: ConnectorState::Uninitialized,
            initialized: false,
            last_error: None,
            last_health_check: None,
            connected_at: None,
        }
    }
}

/// One live connection to a provider on behalf of one integration.
///
/// # Responsibilities
/// - Drive the connector through its state machine
/// - Bound every connector call by the operation timeout
/// - Refuse capability calls the connector does not advertise
/// - Fan out lifecycle events to subscribers
pub struct ConnectorInstance {
    id: Uuid,
    integration_id: String,
    descriptor: ConnectorDescriptor,
    connector: tokio::sync::RwLock<Box<dyn Connector>>,
    status: RwLock<InstanceStatus>,
    credentials: RwLock<Option<Credentials>>,
    config: RwLock<Value>,
    /// Serializes initialize/destroy/reconnect.
    lifecycle: tokio::sync::Mutex<()>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<InstanceEvent>>>,
    operation_timeout: Duration,
}

impl fmt::Debug for ConnectorInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorInstance")
            .field("id", &self.id)
            .field("integration_id", &self.integration_id)
            .field("provider", &self.descriptor.provider)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectorInstance {
    pub fn new(
        integration_id: impl Into<String>,
        connector: Box<dyn Connector>,
        operation_timeout: Duration,
    ) -> Self {
        let descriptor = connector.descriptor().clone();
        Self {
            id: Uuid::now_v7(),
            integration_id: integration_id.into(),
            descriptor,
            connector: tokio::sync::RwLock::new(connector),
            status: RwLock::new(InstanceStatus::default()),
            credentials: RwLock::new(None),
            config: RwLock::new(Value::Null),
            lifecycle: tokio::sync::Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
            operation_timeout,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn integration_id(&self) -> &str {
        &self.integration_id
    }

    pub fn provider(&self) -> &str {
        &self.descriptor.provider
    }

    pub fn descriptor(&self) -> &ConnectorDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ConnectorState {
        self.status.read().unwrap().state
    }

    pub fn status(&self) -> InstanceStatus {
        self.status.read().unwrap().clone()
    }

    /// Credentials in use, possibly refreshed during `initialize`.
    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials.read().unwrap().clone()
    }

    pub fn config(&self) -> Value {
        self.config.read().unwrap().clone()
    }

    /// Receives lifecycle events until the instance is destroyed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<InstanceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap().push(tx);
        rx
    }

    fn emit(&self, event: InstanceEvent) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn set_state(&self, state: ConnectorState) {
        self.status.write().unwrap().state = state;
    }

    async fn timed<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T, ConnectorError>>,
    ) -> Result<T, ConnectorError> {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::external(
                self.provider(),
                format!(
                    "{} timed out after {}ms",
                    operation,
                    self.operation_timeout.as_millis()
                ),
            )),
        }
    }

    /// Configures, authenticates and connects.
    ///
    /// Re-initializing a connected instance disconnects it first. On failure
    /// the instance is left in `Error` with `last_error` set.
    pub async fn initialize(&self, config: Value, credentials: Credentials) -> Result<(), ConnectorError> {
        let _guard = self.lifecycle.lock().await;

        if self.state() == ConnectorState::Connected {
            let connector = self.connector.read().await;
            if let Err(e) = self.timed("disconnect", connector.disconnect()).await {
                warn!(integration_id = %self.integration_id, error = %e, "Disconnect before re-initialize failed");
            }
        }
        self.set_state(ConnectorState::Initializing);

        match self.run_initialize(config, credentials).await {
            Ok(credentials) => {
                *self.credentials.write().unwrap() = Some(credentials);
                {
                    let mut status = self.status.write().unwrap();
                    status.state = ConnectorState::Connected;
                    status.initialized = true;
                    status.last_error = None;
                    status.connected_at = Some(Utc::now());
                }
                info!(
                    integration_id = %self.integration_id,
                    provider = %self.provider(),
                    "Connector connected"
                );
                self.emit(InstanceEvent::Connected);
                Ok(())
            }
            Err(e) => {
                {
                    let mut status = self.status.write().unwrap();
                    status.state = ConnectorState::Error;
                    status.initialized = false;
                    status.last_error = Some(e.to_string());
                    status.connected_at = None;
                }
                warn!(
                    integration_id = %self.integration_id,
                    provider = %self.provider(),
                    error = %e,
                    "Connector initialization failed"
                );
                self.emit(InstanceEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run_initialize(&self, config: Value, credentials: Credentials) -> Result<Credentials, ConnectorError> {
        self.connector.write().await.configure(&config)?;
        *self.config.write().unwrap() = config;

        let connector = self.connector.read().await;
        let mut credentials = credentials;
        if credentials.needs_refresh(chrono::Duration::minutes(REFRESH_THRESHOLD_MINUTES)) {
            debug!(integration_id = %self.integration_id, "Refreshing expiring credentials");
            credentials = self
                .timed("refresh_auth", connector.refresh_auth(&credentials))
                .await?;
        }
        self.timed("authenticate", connector.authenticate(&credentials))
            .await?;
        self.timed("connect", connector.connect(&credentials)).await?;
        Ok(credentials)
    }

    /// Disconnects if needed and returns to `Uninitialized`. Safe to repeat.
    pub async fn destroy(&self) {
        let _guard = self.lifecycle.lock().await;

        if self.state() == ConnectorState::Connected {
            let connector = self.connector.read().await;
            if let Err(e) = self.timed("disconnect", connector.disconnect()).await {
                warn!(integration_id = %self.integration_id, error = %e, "Disconnect during destroy failed");
            }
        }

        {
            let mut status = self.status.write().unwrap();
            status.state = ConnectorState::Uninitialized;
            status.initialized = false;
            status.connected_at = None;
        }
        self.emit(InstanceEvent::Destroyed);
        self.listeners.lock().unwrap().clear();
        debug!(integration_id = %self.integration_id, "Connector instance destroyed");
    }

    /// Closes the session but keeps configuration and credentials.
    pub async fn disconnect(&self) -> Result<(), ConnectorError> {
        let _guard = self.lifecycle.lock().await;
        if self.state() != ConnectorState::Connected {
            return Ok(());
        }
        let connector = self.connector.read().await;
        let result = self.timed("disconnect", connector.disconnect()).await;
        self.status.write().unwrap().connected_at = None;
        self.set_state(ConnectorState::Disconnected);
        self.emit(InstanceEvent::Disconnected);
        result
    }

    /// Reopens a session closed by `disconnect`.
    pub async fn reconnect(&self) -> Result<(), ConnectorError> {
        let _guard = self.lifecycle.lock().await;
        if self.state() != ConnectorState::Disconnected {
            return Err(ConnectorError::configuration("instance is not disconnected"));
        }
        let credentials = self
            .credentials()
            .ok_or_else(|| ConnectorError::configuration("no credentials"))?;

        let connector = self.connector.read().await;
        match self.timed("connect", connector.connect(&credentials)).await {
            Ok(()) => {
                {
                    let mut status = self.status.write().unwrap();
                    status.state = ConnectorState::Connected;
                    status.last_error = None;
                    status.connected_at = Some(Utc::now());
                }
                self.emit(InstanceEvent::Connected);
                Ok(())
            }
            Err(e) => {
                {
                    let mut status = self.status.write().unwrap();
                    status.state = ConnectorState::Error;
                    status.initialized = false;
                    status.last_error = Some(e.to_string());
                }
                self.emit(InstanceEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Pings the provider. False outside `Connected`; never errors.
    pub async fn health_check(&self) -> bool {
        let status = self.status();
        if !status.initialized || status.state != ConnectorState::Connected {
            return false;
        }

        let connector = self.connector.read().await;
        let healthy = match self.timed("ping", connector.ping()).await {
            Ok(ok) => ok,
            Err(e) => {
                debug!(integration_id = %self.integration_id, error = %e, "Health check failed");
                false
            }
        };
        self.status.write().unwrap().last_health_check = Some(Utc::now());
        healthy
    }

    /// Re-validates credentials and pings without touching state.
    pub async fn test(&self) -> bool {
        let Some(credentials) = self.credentials() else {
            return false;
        };
        let connector = self.connector.read().await;
        match self
            .timed("validate_auth", connector.validate_auth(&credentials))
            .await
        {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                debug!(integration_id = %self.integration_id, error = %e, "Credential validation failed");
                return false;
            }
        }
        matches!(self.timed("ping", connector.ping()).await, Ok(true))
    }

    pub async fn authenticate(&self, credentials: &Credentials) -> Result<(), ConnectorError> {
        let connector = self.connector.read().await;
        self.timed("authenticate", connector.authenticate(credentials))
            .await
    }

    pub async fn refresh_auth(&self, credentials: &Credentials) -> Result<Credentials, ConnectorError> {
        let connector = self.connector.read().await;
        self.timed("refresh_auth", connector.refresh_auth(credentials))
            .await
    }

    pub async fn validate_auth(&self, credentials: &Credentials) -> Result<bool, ConnectorError> {
        let connector = self.connector.read().await;
        self.timed("validate_auth", connector.validate_auth(credentials))
            .await
    }

    /// Resolves a capability accessor, failing before any network access.
    fn capability<'a, T: ?Sized>(
        &self,
        capability: Capability,
        accessor: Option<&'a T>,
    ) -> Result<&'a T, ConnectorError> {
        let unsupported = || ConnectorError::UnsupportedCapability {
            provider: self.provider().to_string(),
            capability,
        };
        if !self.descriptor.supports(capability) {
            return Err(unsupported());
        }
        let handle = accessor.ok_or_else(unsupported)?;
        if self.state() != ConnectorState::Connected {
            return Err(ConnectorError::not_connected());
        }
        Ok(handle)
    }

    pub async fn fetch_messages(&self, options: &FetchOptions) -> Result<Vec<Message>, ConnectorError> {
        let connector = self.connector.read().await;
        let fetcher = self.capability(Capability::FetchMessages, connector.as_message_fetcher())?;
        self.timed("fetch_messages", fetcher.fetch_messages(options))
            .await
    }

    pub async fn mark_as_read(&self, message_id: &str) -> Result<(), ConnectorError> {
        let connector = self.connector.read().await;
        let fetcher = self.capability(Capability::MarkAsRead, connector.as_message_fetcher())?;
        self.timed("mark_as_read", fetcher.mark_as_read(message_id))
            .await
    }

    pub async fn delete_message(&self, message_id: &str) -> Result<(), ConnectorError> {
        let connector = self.connector.read().await;
        let fetcher = self.capability(Capability::DeleteMessages, connector.as_message_fetcher())?;
        self.timed("delete_message", fetcher.delete_message(message_id))
            .await
    }

    pub async fn send_message(&self, message: &OutboundMessage) -> Result<SendReceipt, ConnectorError> {
        let connector = self.connector.read().await;
        let sender = self.capability(Capability::SendMessages, connector.as_message_sender())?;
        self.timed("send_message", sender.send_message(message))
            .await
    }

    pub async fn setup_webhook(&self, url: &str) -> Result<WebhookRegistration, ConnectorError> {
        let connector = self.connector.read().await;
        let handler = self.capability(Capability::Webhooks, connector.as_webhook_handler())?;
        self.timed("setup_webhook", handler.setup_webhook(url)).await
    }

    pub async fn remove_webhook(&self, url: &str) -> Result<(), ConnectorError> {
        let connector = self.connector.read().await;
        let handler = self.capability(Capability::Webhooks, connector.as_webhook_handler())?;
        self.timed("remove_webhook", handler.remove_webhook(url)).await
    }

    pub async fn process_webhook(&self, event: &WebhookEvent) -> Result<WebhookOutcome, ConnectorError> {
        let connector = self.connector.read().await;
        let handler = self.capability(Capability::Webhooks, connector.as_webhook_handler())?;
        self.timed("process_webhook", handler.process_webhook(event))
            .await
    }

    /// False when the connector disowns the event or has no webhook support.
    pub async fn accepts_webhook(&self, event: &WebhookEvent) -> bool {
        let connector = self.connector.read().await;
        connector
            .as_webhook_handler()
            .map_or(false, |handler| handler.accepts(event))
    }

    pub async fn sync(&self, since: Option<DateTime<Utc>>) -> Result<SyncReport, ConnectorError> {
        let connector = self.connector.read().await;
        let syncable = self.capability(Capability::Sync, connector.as_syncable())?;
        self.timed("sync", syncable.sync(since)).await
    }
}
