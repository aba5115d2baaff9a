//! Slack chat connector over the Web API.

use crate::connector::{Connector, MessageFetcher, MessageSender, Syncable, WebhookCapable};
use crate::error::{classify, ConnectorError, HttpStatusError};
use crate::types::{
    Capability, ConnectorDescriptor, ConnectorKind, FetchOptions, Message, OutboundMessage,
    SendReceipt, SyncReport, WebhookOutcome, WebhookRegistration,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit::credentials::Credentials;
use conduit::webhook::WebhookEvent;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info};

const PROVIDER: &str = "slack";
pub const BASE_URL: &str = "https://slack.com/api";
const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct SlackConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Default channel for reads and sends.
    pub channel: String,
    /// Workspace this integration belongs to. Without it, provider-routed
    /// events are matched on `channel`.
    #[serde(default)]
    pub team_id: Option<String>,
}

fn default_base_url() -> String {
    BASE_URL.to_string()
}

/// Thin Web API client. Every method is a POST returning `{"ok": bool, ..}`.
pub struct SlackClient {
    http_client: Client,
    base_url: String,
}

impl SlackClient {
    pub fn with_base_url(base_url: &str) -> Result<Self, ConnectorError> {
        let http_client = Client::builder()
            .user_agent(concat!("conduit-connector/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ConnectorError::configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn call(&self, token: &str, method: &str, body: Value) -> Result<Value, ConnectorError> {
        let url = format!("{}/{}", self.base_url, method);
        let result: anyhow::Result<Value> = async {
            let response = self
                .http_client
                .post(&url)
                .bearer_auth(token)
                .json(&body)
                .send()
                .await
                .with_context(|| format!("Failed to send {} request", method))?;
            let response = HttpStatusError::check(response).await?;
            response
                .json::<Value>()
                .await
                .with_context(|| format!("Failed to parse {} response", method))
        }
        .await;

        let value = result.map_err(|e| classify(PROVIDER, e))?;
        if value.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(value);
        }
        let code = value.get("error").and_then(Value::as_str).unwrap_or("unknown_error");
        Err(api_error(method, code))
    }
}

/// Maps a Slack `error` code onto the connector taxonomy.
fn api_error(method: &str, code: &str) -> ConnectorError {
    match code {
        "invalid_auth" | "not_authed" | "token_revoked" | "token_expired" | "account_inactive" => {
            ConnectorError::authentication(format!("{}: {}", method, code))
        }
        "ratelimited" => ConnectorError::RateLimited {
            provider: PROVIDER.to_string(),
            retry_after_seconds: 60,
        },
        "channel_not_found" | "not_in_channel" | "is_archived" | "invalid_arguments"
        | "missing_scope" | "message_not_found" => {
            ConnectorError::configuration(format!("{}: {}", method, code))
        }
        _ => ConnectorError::external(PROVIDER, format!("{}: {}", method, code)),
    }
}

/// Slack timestamps are `"<secs>.<micros>"`.
fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = format!("{:0<6}", frac).get(..6)?.parse().ok()?;
    DateTime::from_timestamp(secs, micros * 1_000)
}

fn format_ts(at: DateTime<Utc>) -> String {
    format!("{}.{:06}", at.timestamp(), at.timestamp_subsec_micros())
}

fn to_message(raw: &Value, channel: &str) -> Option<Message> {
    let ts = raw.get("ts").and_then(Value::as_str)?;
    Some(Message {
        id: ts.to_string(),
        thread_id: raw.get("thread_ts").and_then(Value::as_str).map(str::to_string),
        from: raw.get("user").and_then(Value::as_str).map(str::to_string),
        to: vec![channel.to_string()],
        subject: None,
        body: raw.get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
        timestamp: parse_ts(ts)?,
        unread: false,
    })
}

pub struct SlackConnector {
    descriptor: ConnectorDescriptor,
    client: Option<SlackClient>,
    config: Option<SlackConfig>,
    token: RwLock<Option<String>>,
}

impl SlackConnector {
    pub fn new() -> Self {
        Self {
            descriptor: ConnectorDescriptor::new(
                PROVIDER,
                ConnectorKind::Chat,
                env!("CARGO_PKG_VERSION"),
                [
                    Capability::FetchMessages,
                    Capability::SendMessages,
                    Capability::MarkAsRead,
                    Capability::DeleteMessages,
                    Capability::Webhooks,
                    Capability::Sync,
                ],
            ),
            client: None,
            config: None,
            token: RwLock::new(None),
        }
    }

    fn client(&self) -> Result<(&SlackClient, &SlackConfig), ConnectorError> {
        match (&self.client, &self.config) {
            (Some(client), Some(config)) => Ok((client, config)),
            _ => Err(ConnectorError::configuration("slack connector is not configured")),
        }
    }

    fn session_token(&self) -> Result<String, ConnectorError> {
        self.token
            .read()
            .unwrap()
            .clone()
            .ok_or_else(ConnectorError::not_connected)
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value, ConnectorError> {
        let (client, _) = self.client()?;
        let token = self.session_token()?;
        client.call(&token, method, body).await
    }
}

impl Default for SlackConnector {
    fn default() -> Self {
        Self::new()
    }
}

fn bearer(credentials: &Credentials) -> Result<&str, ConnectorError> {
    credentials
        .bearer_token()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ConnectorError::authentication("slack requires a bearer token"))
}

#[async_trait]
impl Connector for SlackConnector {
    fn descriptor(&self) -> &ConnectorDescriptor {
        &self.descriptor
    }

    fn configure(&mut self, config: &Value) -> Result<(), ConnectorError> {
        let config: SlackConfig = serde_json::from_value(config.clone())
            .map_err(|e| ConnectorError::configuration(format!("invalid slack config: {}", e)))?;
        if config.channel.trim().is_empty() {
            return Err(ConnectorError::configuration("slack channel is required"));
        }
        self.client = Some(SlackClient::with_base_url(&config.base_url)?);
        self.config = Some(config);
        Ok(())
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<(), ConnectorError> {
        let token = bearer(credentials)?;
        let (client, _) = self.client()?;
        let identity = client.call(token, "auth.test", json!({})).await?;
        debug!(team = ?identity.get("team"), "Slack token accepted");
        Ok(())
    }

    async fn validate_auth(&self, credentials: &Credentials) -> Result<bool, ConnectorError> {
        match self.authenticate(credentials).await {
            Ok(()) => Ok(true),
            Err(ConnectorError::Authentication(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn connect(&self, credentials: &Credentials) -> Result<(), ConnectorError> {
        let token = bearer(credentials)?.to_string();
        *self.token.write().unwrap() = Some(token);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectorError> {
        self.token.write().unwrap().take();
        Ok(())
    }

    async fn ping(&self) -> Result<bool, ConnectorError> {
        if self.token.read().unwrap().is_none() {
            return Ok(false);
        }
        self.call("auth.test", json!({})).await.map(|_| true)
    }

    fn as_message_fetcher(&self) -> Option<&dyn MessageFetcher> {
        Some(self)
    }

    fn as_message_sender(&self) -> Option<&dyn MessageSender> {
        Some(self)
    }

    fn as_webhook_handler(&self) -> Option<&dyn WebhookCapable> {
        Some(self)
    }

    fn as_syncable(&self) -> Option<&dyn Syncable> {
        Some(self)
    }
}

#[async_trait]
impl MessageFetcher for SlackConnector {
    async fn fetch_messages(&self, options: &FetchOptions) -> Result<Vec<Message>, ConnectorError> {
        let (_, config) = self.client()?;
        let mut body = json!({
            "channel": config.channel,
            "limit": options.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        });
        if let Some(since) = options.since {
            body["oldest"] = json!(format_ts(since));
        }

        let response = self.call("conversations.history", body).await?;
        let messages = response
            .get("messages")
            .and_then(Value::as_array)
            .map(|raw| raw.iter().filter_map(|m| to_message(m, &config.channel)).collect())
            .unwrap_or_default();
        Ok(messages)
    }

    async fn mark_as_read(&self, message_id: &str) -> Result<(), ConnectorError> {
        let (_, config) = self.client()?;
        self.call("conversations.mark", json!({"channel": config.channel, "ts": message_id}))
            .await
            .map(|_| ())
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), ConnectorError> {
        let (_, config) = self.client()?;
        self.call("chat.delete", json!({"channel": config.channel, "ts": message_id}))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl MessageSender for SlackConnector {
    async fn send_message(&self, message: &OutboundMessage) -> Result<SendReceipt, ConnectorError> {
        let (_, config) = self.client()?;
        let channel = message.to.first().unwrap_or(&config.channel).clone();
        let mut body = json!({"channel": channel, "text": message.body});
        if let Some(thread) = &message.thread_id {
            body["thread_ts"] = json!(thread);
        }

        let response = self.call("chat.postMessage", body).await?;
        let ts = response
            .get("ts")
            .and_then(Value::as_str)
            .ok_or_else(|| ConnectorError::external(PROVIDER, "chat.postMessage returned no ts"))?;
        let accepted = response
            .get("channel")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(channel);

        Ok(SendReceipt {
            message_id: ts.to_string(),
            accepted: vec![accepted],
            sent_at: Utc::now(),
        })
    }
}

#[async_trait]
impl WebhookCapable for SlackConnector {
    /// Event subscriptions are configured on the Slack app itself.
    async fn setup_webhook(&self, url: &str) -> Result<WebhookRegistration, ConnectorError> {
        info!(url = %url, "Slack events must be pointed at this URL in the app settings");
        Ok(WebhookRegistration {
            url: url.to_string(),
            webhook_id: None,
        })
    }

    async fn remove_webhook(&self, _url: &str) -> Result<(), ConnectorError> {
        Ok(())
    }

    fn accepts(&self, event: &WebhookEvent) -> bool {
        let Some(config) = &self.config else {
            return false;
        };
        let payload = &event.payload;
        if let Some(team_id) = &config.team_id {
            return payload.get("team_id").and_then(Value::as_str) == Some(team_id.as_str());
        }
        payload
            .get("event")
            .and_then(|e| e.get("channel"))
            .and_then(Value::as_str)
            == Some(config.channel.as_str())
    }

    async fn process_webhook(&self, event: &WebhookEvent) -> Result<WebhookOutcome, ConnectorError> {
        let payload = &event.payload;
        if payload.get("type").and_then(Value::as_str) != Some("event_callback") {
            return Ok(WebhookOutcome::ignored(&event.event_type));
        }
        let Some(inner) = payload.get("event") else {
            return Ok(WebhookOutcome::ignored(&event.event_type));
        };

        let messages = match event.event_type.as_str() {
            "message" | "app_mention" => {
                let channel = inner.get("channel").and_then(Value::as_str).unwrap_or_default();
                to_message(inner, channel).into_iter().collect()
            }
            _ => Vec::new(),
        };
        Ok(WebhookOutcome {
            event_type: event.event_type.clone(),
            processed: true,
            messages,
            detail: Value::Null,
        })
    }
}

#[async_trait]
impl Syncable for SlackConnector {
    async fn sync(&self, since: Option<DateTime<Utc>>) -> Result<SyncReport, ConnectorError> {
        let messages = self
            .fetch_messages(&FetchOptions {
                since,
                ..FetchOptions::default()
            })
            .await?;
        let cursor = messages
            .iter()
            .max_by_key(|m| m.timestamp)
            .map(|m| m.id.clone());
        Ok(SyncReport {
            items_synced: messages.len(),
            cursor,
            synced_at: Utc::now(),
        })
    }
}
