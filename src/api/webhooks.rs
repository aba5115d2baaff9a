use crate::config::SharedRuntimeConfig;
use crate::integration::IntegrationStore;
use crate::queue::{Dispatcher, EnqueueOptions, WEBHOOK_PROCESSING};
use crate::webhook::{
    body_challenge, check_request, extract_signature, query_challenge, WebhookError,
    WebhookEvent, WEBHOOK_JOB_PRIORITY, WEBHOOK_JOB_TYPE,
};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Hard ceiling on buffered bodies; the runtime limit is checked per request below it.
const BODY_CEILING_BYTES: usize = 64 * 1024 * 1024;

/// Shared webhook ingress state
#[derive(Clone)]
pub struct WebhookAppState {
    pub dispatcher: Dispatcher,
    pub store: Arc<dyn IntegrationStore>,
    pub runtime_config: SharedRuntimeConfig,
    /// Signing secret per provider.
    pub secrets: Arc<HashMap<String, String>>,
    /// Providers accepted on `/webhooks/:provider`.
    pub providers: Arc<HashSet<String>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcceptedResponse {
    job_id: String,
    event_id: String,
}

enum Ingested {
    Challenge(String),
    Enqueued(AcceptedResponse),
}

/// Create router with webhook ingress endpoints
pub fn create_webhook_router(state: WebhookAppState) -> Router {
    Router::new()
        .route(
            "/webhooks/:provider",
            post(receive_provider_webhook).get(provider_challenge),
        )
        .route(
            "/webhooks/integrations/:integration_id",
            post(receive_integration_webhook),
        )
        .layer(DefaultBodyLimit::max(BODY_CEILING_BYTES))
        .with_state(Arc::new(state))
}

/// GET /webhooks/:provider - verification handshake
async fn provider_challenge(
    State(state): State<Arc<WebhookAppState>>,
    Path(provider): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, WebhookError> {
    if !state.providers.contains(&provider) {
        return Err(WebhookError::UnknownProvider(provider));
    }
    match query_challenge(&query) {
        Some(token) => Ok(token.to_string().into_response()),
        None => Err(WebhookError::InvalidPayload(
            "missing challenge parameter".to_string(),
        )),
    }
}

/// POST /webhooks/:provider
async fn receive_provider_webhook(
    State(state): State<Arc<WebhookAppState>>,
    Path(provider): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, WebhookError> {
    if !state.providers.contains(&provider) {
        return Err(WebhookError::UnknownProvider(provider));
    }
    // Some providers validate the endpoint with a POST carrying the token in the query.
    if let Some(token) = query_challenge(&query) {
        return Ok(token.to_string().into_response());
    }

    let secret = state.secrets.get(&provider).map(String::as_str);
    match ingest(&state, &provider, None, secret, &headers, &body)? {
        Ingested::Challenge(token) => Ok(token.into_response()),
        Ingested::Enqueued(accepted) => Ok((StatusCode::OK, Json(accepted)).into_response()),
    }
}

/// POST /webhooks/integrations/:integration_id
async fn receive_integration_webhook(
    State(state): State<Arc<WebhookAppState>>,
    Path(integration_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, WebhookError> {
    let record = state
        .store
        .find_integration(&integration_id)
        .map_err(|e| {
            error!(integration_id = %integration_id, error = %e, "Integration lookup failed");
            WebhookError::Store(e.to_string())
        })?
        .ok_or_else(|| WebhookError::UnknownIntegration(integration_id.clone()))?;

    let secret = record
        .webhook_secret()
        .or_else(|| state.secrets.get(&record.provider).map(String::as_str));

    match ingest(
        &state,
        &record.provider,
        Some(integration_id),
        secret,
        &headers,
        &body,
    )? {
        Ingested::Challenge(token) => Ok(token.into_response()),
        Ingested::Enqueued(accepted) => Ok((StatusCode::ACCEPTED, Json(accepted)).into_response()),
    }
}

/// Verify, parse and enqueue. Returns once the job is queued.
fn ingest(
    state: &WebhookAppState,
    provider: &str,
    integration_id: Option<String>,
    secret: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Ingested, WebhookError> {
    let (strict, max_payload) = {
        let rc = state.runtime_config.read().unwrap();
        (rc.webhook_strict_mode, rc.webhook_max_payload_bytes)
    };

    let signature = extract_signature(headers);
    if strict && signature.is_none() {
        warn!(provider = %provider, "Rejected unsigned webhook");
        return Err(WebhookError::MissingSignature);
    }
    if body.len() > max_payload {
        return Err(WebhookError::PayloadTooLarge { limit: max_payload });
    }

    let verified = check_request(secret, signature.as_deref(), body, strict).map_err(|e| {
        warn!(provider = %provider, error = %e, "Webhook signature check failed");
        e
    })?;

    let payload: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
    if !payload.is_object() {
        return Err(WebhookError::InvalidPayload(
            "expected a JSON object".to_string(),
        ));
    }

    if let Some(token) = body_challenge(&payload) {
        return Ok(Ingested::Challenge(token.to_string()));
    }

    let event = WebhookEvent::new(provider, integration_id, headers, payload, signature, verified);
    let job_payload =
        serde_json::to_value(&event).map_err(|e| WebhookError::Enqueue(e.to_string()))?;

    let job = state
        .dispatcher
        .enqueue(
            WEBHOOK_PROCESSING,
            WEBHOOK_JOB_TYPE,
            job_payload,
            EnqueueOptions::default().priority(WEBHOOK_JOB_PRIORITY),
        )
        .map_err(|e| {
            error!(provider = %provider, error = %e, "Failed to enqueue webhook");
            WebhookError::Enqueue(e.to_string())
        })?;

    info!(
        provider = %event.provider,
        integration_id = event.integration_id.as_deref().unwrap_or("-"),
        event_type = %event.event_type,
        verified = event.verified,
        job_id = %job.id,
        "Webhook accepted"
    );

    Ok(Ingested::Enqueued(AcceptedResponse {
        job_id: job.id,
        event_id: event.id,
    }))
}
