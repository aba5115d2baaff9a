//! Inbound webhook model: events, provider quirks, and HTTP error mapping.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

mod signature;

pub use signature::{check_request, extract_signature, sign_body, verify_signature, SIGNATURE_HEADERS};

/// Job type of webhook jobs on the `webhook-processing` queue.
pub const WEBHOOK_JOB_TYPE: &str = "webhook.process";

/// Priority webhook jobs are enqueued with.
pub const WEBHOOK_JOB_PRIORITY: i32 = 10;

/// A verified (or accepted unverified) inbound notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub integration_id: Option<String>,
    pub event_type: String,
    #[serde(default)]
    pub signature: Option<String>,
    /// Diagnostic subset of request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
    pub verified: bool,
}

impl WebhookEvent {
    pub fn new(
        provider: impl Into<String>,
        integration_id: Option<String>,
        headers: &HeaderMap,
        payload: Value,
        signature: Option<String>,
        verified: bool,
    ) -> Self {
        let provider = provider.into();
        Self {
            id: Uuid::now_v7().to_string(),
            event_type: event_type_for(&provider, headers, &payload),
            provider,
            integration_id,
            signature,
            headers: capture_headers(headers),
            payload,
            received_at: Utc::now(),
            verified,
        }
    }
}

/// Names the event from provider-specific headers or body fields.
pub fn event_type_for(provider: &str, headers: &HeaderMap, payload: &Value) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let field = |ptr: &str| payload.pointer(ptr).and_then(Value::as_str).map(str::to_string);

    let found = match provider {
        "github" => header("x-github-event"),
        "slack" => field("/event/type").or_else(|| field("/type")),
        "gmail" | "google" => field("/message/attributes/eventType")
            .or_else(|| payload.get("message").map(|_| "push".to_string())),
        "microsoft" | "outlook" | "teams" => field("/value/0/changeType"),
        _ => None,
    };

    found
        .or_else(|| header("x-event-type"))
        .or_else(|| field("/type"))
        .or_else(|| field("/event_type"))
        .or_else(|| field("/event"))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Keeps `x-*` headers plus content type and user agent; drops credentials.
fn capture_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| {
            let n = name.as_str();
            (n.starts_with("x-") || n == "content-type" || n == "user-agent")
                && n != "x-api-key"
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Challenge token from `validationToken`, `hub.challenge` or `challenge`.
pub fn query_challenge(query: &HashMap<String, String>) -> Option<&str> {
    ["validationToken", "hub.challenge", "challenge"]
        .iter()
        .find_map(|k| query.get(*k))
        .map(String::as_str)
        .filter(|s| !s.is_empty())
}

/// Slack URL verification handshake: `{"type":"url_verification","challenge":..}`.
pub fn body_challenge(payload: &Value) -> Option<&str> {
    if payload.get("type").and_then(Value::as_str) != Some("url_verification") {
        return None;
    }
    payload.get("challenge").and_then(Value::as_str)
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing webhook signature")]
    MissingSignature,

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("no webhook secret configured")]
    NoSecret,

    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("unknown integration '{0}'")]
    UnknownIntegration(String),

    #[error("failed to enqueue webhook: {0}")]
    Enqueue(String),

    #[error("integration lookup failed: {0}")]
    Store(String),
}

impl WebhookError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingSignature | Self::InvalidSignature | Self::NoSecret => {
                StatusCode::UNAUTHORIZED
            }
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::UnknownProvider(_) | Self::UnknownIntegration(_) => StatusCode::NOT_FOUND,
            Self::Enqueue(_) | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}
