// Integration operator API, merged with the conduit webhook and queue routes.

use crate::error::{ConnectorError, IntegrationError};
use crate::instance::InstanceStatus;
use crate::manager::IntegrationManager;
use crate::types::ConnectorDescriptor;
use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use conduit::api::{limited, with_global_layers, Bucket, WebhookAppState};
use conduit::config::SharedRuntimeConfig;
use conduit::queue::QueueError;
use conduit::rate_limit::RateLimiters;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<IntegrationManager>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TestResponse {
    integration_id: String,
    healthy: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncScheduledResponse {
    integration_id: String,
    job_id: String,
}

/// Full HTTP surface: webhooks, queue introspection and integration operations,
/// each behind its rate limit bucket, all behind the global one.
pub fn create_router(
    manager: Arc<IntegrationManager>,
    webhooks: WebhookAppState,
    limiters: Arc<RateLimiters>,
) -> Router {
    let runtime_config = webhooks.runtime_config.clone();
    let ingress = conduit::api::create_router(webhooks, limiters.clone());
    let integrations = create_integration_router(ApiState { manager }, limiters.clone(), runtime_config.clone());

    with_global_layers(ingress.merge(integrations), limiters, runtime_config)
}

/// Integration routes only; tests mount this without the ingress.
pub fn create_integration_router(
    state: ApiState,
    limiters: Arc<RateLimiters>,
    runtime_config: SharedRuntimeConfig,
) -> Router {
    let checks = Router::new()
        .route("/api/integrations/:id/test", post(test_integration))
        .with_state(state.clone());

    let operations = Router::new()
        .route("/api/integrations/:id/sync", post(schedule_sync))
        .route("/api/integrations/:id/status", get(integration_status))
        .with_state(state.clone());

    let catalog = Router::new()
        .route("/api/connectors", get(list_connectors))
        .with_state(state);

    Router::new()
        .merge(limited(checks, limiters.clone(), Bucket::Auth, runtime_config.clone()))
        .merge(limited(operations, limiters, Bucket::Integration, runtime_config))
        .merge(catalog)
}

/// POST /api/integrations/:id/test
async fn test_integration(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<TestResponse>, ApiError> {
    let healthy = state.manager.test_integration(&id).await?;
    Ok(Json(TestResponse {
        integration_id: id,
        healthy,
    }))
}

/// POST /api/integrations/:id/sync
async fn schedule_sync(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if state.manager.instance(&id).is_none() {
        return Err(IntegrationError::NotFound(id).into());
    }
    match state.manager.schedule_sync(&id)? {
        Some(job) => {
            info!(integration_id = %id, job_id = %job.id, "Sync scheduled via API");
            Ok((
                StatusCode::ACCEPTED,
                Json(SyncScheduledResponse {
                    integration_id: id,
                    job_id: job.id,
                }),
            )
                .into_response())
        }
        None => Ok((
            StatusCode::CONFLICT,
            Json(json!({ "integrationId": id, "status": "already_scheduled" })),
        )
            .into_response()),
    }
}

/// GET /api/integrations/:id/status
async fn integration_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceStatus>, ApiError> {
    state
        .manager
        .status(&id)
        .map(Json)
        .ok_or_else(|| IntegrationError::NotFound(id).into())
}

/// GET /api/connectors
async fn list_connectors(State(state): State<ApiState>) -> Json<Vec<ConnectorDescriptor>> {
    let registry = state.manager.registry();
    let descriptors = registry
        .providers()
        .iter()
        .filter_map(|provider| registry.descriptor(provider))
        .collect();
    Json(descriptors)
}

struct ApiError(IntegrationError);

impl From<IntegrationError> for ApiError {
    fn from(e: IntegrationError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            IntegrationError::NotFound(_) => StatusCode::NOT_FOUND,
            IntegrationError::HealthCheckFailed(_) => StatusCode::BAD_GATEWAY,
            IntegrationError::Connector(e) => match e {
                ConnectorError::Configuration(_) | ConnectorError::UnsupportedCapability { .. } => {
                    StatusCode::BAD_REQUEST
                }
                ConnectorError::Authentication(_) => StatusCode::UNAUTHORIZED,
                ConnectorError::ExternalService { .. } => StatusCode::BAD_GATEWAY,
                ConnectorError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            },
            IntegrationError::Queue(QueueError::Duplicate { .. }) => StatusCode::CONFLICT,
            IntegrationError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
            IntegrationError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Integration API request failed");
        }
        let mut response = (status, Json(json!({ "error": self.0.to_string() }))).into_response();
        if let IntegrationError::Connector(ConnectorError::RateLimited {
            retry_after_seconds, ..
        }) = &self.0
        {
            if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
