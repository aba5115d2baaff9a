use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

/// Optional features a connector may offer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    FetchMessages,
    SendMessages,
    MarkAsRead,
    DeleteMessages,
    Webhooks,
    Sync,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchMessages => "fetch_messages",
            Self::SendMessages => "send_messages",
            Self::MarkAsRead => "mark_as_read",
            Self::DeleteMessages => "delete_messages",
            Self::Webhooks => "webhooks",
            Self::Sync => "sync",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broad family of a provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    Mail,
    Chat,
    Webhook,
}

/// Static identity of a connector plugin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectorDescriptor {
    pub id: String,
    pub kind: ConnectorKind,
    pub provider: String,
    pub version: String,
    pub capabilities: HashSet<Capability>,
}

impl ConnectorDescriptor {
    pub fn new(
        provider: &str,
        kind: ConnectorKind,
        version: &str,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        Self {
            id: format!("{}-connector", provider),
            kind,
            provider: provider.to_string(),
            version: version.to_string(),
            capabilities: capabilities.into_iter().collect(),
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Connection state of a connector instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorState {
    Uninitialized,
    Initializing,
    Connected,
    Disconnected,
    Error,
}

/// A message read from a provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub unread: bool,
}

/// A message to deliver through a provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub to: Vec<String>,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub message_id: String,
    pub accepted: Vec<String>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FetchOptions {
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub unread_only: bool,
}

/// Outcome of one incremental synchronization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub items_synced: usize,
    /// Provider-specific position reached, if any.
    pub cursor: Option<String>,
    pub synced_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRegistration {
    pub url: String,
    /// Provider-side id, when the provider assigns one.
    pub webhook_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookOutcome {
    pub event_type: String,
    /// False when the connector deliberately ignored the event.
    pub processed: bool,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

impl WebhookOutcome {
    pub fn ignored(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            processed: false,
            messages: Vec::new(),
            detail: Value::Null,
        }
    }
}
