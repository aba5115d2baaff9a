// Rate limit middleware.
//
// Keys each request by caller identity and consumes one point from the
// configured bucket. Layers stack: the innermost (most specific) bucket
// writes the X-RateLimit-* headers, outer layers only fill them if absent.

use crate::auth::caller_identity;
use crate::config::SharedRuntimeConfig;
use crate::rate_limit::{RateLimitError, RateLimiter, RateLimiters};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// Which named bucket a layer draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Global,
    Auth,
    Webhook,
    Integration,
}

#[derive(Clone)]
pub struct RateLimitState {
    pub limiters: Arc<RateLimiters>,
    pub bucket: Bucket,
    pub runtime_config: SharedRuntimeConfig,
}

impl RateLimitState {
    pub fn new(
        limiters: Arc<RateLimiters>,
        bucket: Bucket,
        runtime_config: SharedRuntimeConfig,
    ) -> Self {
        Self {
            limiters,
            bucket,
            runtime_config,
        }
    }

    fn limiter(&self) -> &RateLimiter {
        match self.bucket {
            Bucket::Global => &self.limiters.global,
            Bucket::Auth => &self.limiters.auth,
            Bucket::Webhook => &self.limiters.webhook,
            Bucket::Integration => &self.limiters.integration,
        }
    }
}

/// Use with `axum::middleware::from_fn_with_state`.
pub async fn rate_limit(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let enabled = state.runtime_config.read().unwrap().rate_limit_enabled;
    if !enabled {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let key = caller_identity(request.headers(), peer, &state.limiters.identity).key();
    let limiter = state.limiter();

    match limiter.consume(&key, 1) {
        Ok(info) => {
            let mut response = next.run(request).await;
            set_limit_headers(response.headers_mut(), info.limit, info.remaining, info.reset_after);
            response
        }
        Err(err) => {
            debug!(bucket = limiter.name(), key = %key, retry_after = err.retry_after_seconds, "Rate limited");
            rejection(err)
        }
    }
}

fn rejection(err: RateLimitError) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "rate limit exceeded",
            "retryAfter": err.retry_after_seconds,
        })),
    )
        .into_response();
    let headers = response.headers_mut();
    set_limit_headers(headers, err.limit, 0, err.reset_after);
    headers.insert(
        axum::http::header::RETRY_AFTER,
        HeaderValue::from(err.retry_after_seconds),
    );
    response
}

fn set_limit_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset_after: Duration) {
    if headers.contains_key(X_RATELIMIT_LIMIT) {
        return;
    }
    let reset_at = SystemTime::now()
        .checked_add(reset_after)
        .unwrap_or_else(SystemTime::now)
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0))
        .unwrap_or(0);

    headers.insert(HeaderName::from_static(X_RATELIMIT_LIMIT), HeaderValue::from(limit));
    headers.insert(
        HeaderName::from_static(X_RATELIMIT_REMAINING),
        HeaderValue::from(remaining),
    );
    headers.insert(HeaderName::from_static(X_RATELIMIT_RESET), HeaderValue::from(reset_at));
}
