use crate::error::ConnectorError;
use crate::types::{
    ConnectorDescriptor, FetchOptions, Message, OutboundMessage, SendReceipt, SyncReport,
    WebhookOutcome, WebhookRegistration,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit::credentials::Credentials;
use conduit::webhook::WebhookEvent;
use serde_json::Value;

/// Contract every provider plugin implements.
///
/// A connector owns its typed configuration and whatever session it opens in
/// `connect`. Lifecycle ordering, timeouts and state tracking are handled by
/// [`ConnectorInstance`](crate::ConnectorInstance); connectors never see each
/// other and never persist anything.
///
/// # Lifecycle
/// 1. `configure(raw)` validates provider config
/// 2. `authenticate(credentials)` checks the credentials are usable
/// 3. `connect(credentials)` opens the session
/// 4. capability methods and `ping()` run while connected
/// 5. `disconnect()` tears down the session
///
/// # Example
/// ```no_run
/// use async_trait::async_trait;
/// use conduit::credentials::Credentials;
/// use connector_manager::{Connector, ConnectorDescriptor, ConnectorError, ConnectorKind};
///
/// struct Echo(ConnectorDescriptor);
///
/// #[async_trait]
/// impl Connector for Echo {
///     fn descriptor(&self) -> &ConnectorDescriptor {
///         &self.0
///     }
///     fn configure(&mut self, _config: &serde_json::Value) -> Result<(), ConnectorError> {
///         Ok(())
///     }
///     async fn authenticate(&self, _c: &Credentials) -> Result<(), ConnectorError> {
///         Ok(())
///     }
///     async fn validate_auth(&self, _c: &Credentials) -> Result<bool, ConnectorError> {
///         Ok(true)
///     }
///     async fn connect(&self, _c: &Credentials) -> Result<(), ConnectorError> {
///         Ok(())
///     }
///     async fn disconnect(&self) -> Result<(), ConnectorError> {
///         Ok(())
///     }
///     async fn ping(&self) -> Result<bool, ConnectorError> {
///         Ok(true)
///     }
/// }
/// ```
#[async_trait]
pub trait Connector: Send + Sync {
    fn descriptor(&self) -> &ConnectorDescriptor;

    /// Deserializes and validates provider configuration.
    ///
    /// # Errors
    /// `ConnectorError::Configuration` when the config is malformed.
    fn configure(&mut self, config: &Value) -> Result<(), ConnectorError>;

    /// Checks credentials without changing connection state.
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), ConnectorError>;

    async fn validate_auth(&self, credentials: &Credentials) -> Result<bool, ConnectorError>;

    /// Returns fresh credentials. Providers without expiring tokens keep the default.
    async fn refresh_auth(&self, credentials: &Credentials) -> Result<Credentials, ConnectorError> {
        Ok(credentials.clone())
    }

    async fn connect(&self, credentials: &Credentials) -> Result<(), ConnectorError>;

    async fn disconnect(&self) -> Result<(), ConnectorError>;

    /// Provider-specific health check.
    async fn ping(&self) -> Result<bool, ConnectorError>;

    fn as_message_fetcher(&self) -> Option<&dyn MessageFetcher> {
        None
    }

    fn as_message_sender(&self) -> Option<&dyn MessageSender> {
        None
    }

    fn as_webhook_handler(&self) -> Option<&dyn WebhookCapable> {
        None
    }

    fn as_syncable(&self) -> Option<&dyn Syncable> {
        None
    }
}

#[async_trait]
pub trait MessageFetcher: Send + Sync {
    async fn fetch_messages(&self, options: &FetchOptions) -> Result<Vec<Message>, ConnectorError>;

    async fn mark_as_read(&self, message_id: &str) -> Result<(), ConnectorError>;

    async fn delete_message(&self, message_id: &str) -> Result<(), ConnectorError>;
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(&self, message: &OutboundMessage) -> Result<SendReceipt, ConnectorError>;
}

#[async_trait]
pub trait WebhookCapable: Send + Sync {
    async fn setup_webhook(&self, url: &str) -> Result<WebhookRegistration, ConnectorError>;

    async fn remove_webhook(&self, url: &str) -> Result<(), ConnectorError>;

    /// Whether a provider-routed event belongs to this integration.
    fn accepts(&self, _event: &WebhookEvent) -> bool {
        true
    }

    /// Handles one verified inbound event.
    async fn process_webhook(&self, event: &WebhookEvent) -> Result<WebhookOutcome, ConnectorError>;
}

#[async_trait]
pub trait Syncable: Send + Sync {
    /// Pulls changes newer than `since`, or everything when `None`.
    async fn sync(&self, since: Option<DateTime<Utc>>) -> Result<SyncReport, ConnectorError>;
}
