// HTTP ingress: webhooks, queue introspection, rate limiting

pub mod queues;
pub mod rate_limit;
pub mod webhooks;

pub use queues::create_queue_router;
pub use rate_limit::{rate_limit, Bucket, RateLimitState};
pub use webhooks::{create_webhook_router, WebhookAppState};

use crate::config::SharedRuntimeConfig;
use crate::rate_limit::RateLimiters;
use axum::{middleware::from_fn_with_state, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Webhook routes behind the webhook bucket, plus the queue routes.
pub fn create_router(state: WebhookAppState, limiters: Arc<RateLimiters>) -> Router {
    let runtime_config = state.runtime_config.clone();
    let dispatcher = state.dispatcher.clone();

    let webhooks = limited(
        create_webhook_router(state),
        limiters,
        Bucket::Webhook,
        runtime_config,
    );

    Router::new()
        .merge(webhooks)
        .merge(create_queue_router(dispatcher))
}

/// Applies one bucket to every route of `router`.
pub fn limited(
    router: Router,
    limiters: Arc<RateLimiters>,
    bucket: Bucket,
    runtime_config: SharedRuntimeConfig,
) -> Router {
    router.layer(from_fn_with_state(
        RateLimitState::new(limiters, bucket, runtime_config),
        rate_limit,
    ))
}

/// Outermost layers: global bucket, CORS, request tracing.
pub fn with_global_layers(
    router: Router,
    limiters: Arc<RateLimiters>,
    runtime_config: SharedRuntimeConfig,
) -> Router {
    limited(router, limiters, Bucket::Global, runtime_config)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
