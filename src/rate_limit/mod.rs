// Token bucket admission control.
//
// Each named limiter keeps one bucket per caller key. Buckets are created on
// first use and dropped by `purge_idle` once untouched for a TTL. State is
// in-memory only (resets on restart).

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::auth::{IdentityPolicy, TokenVerifier};
use crate::config::RateLimitsConfig;

/// Sizing of one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketPolicy {
    /// Bucket capacity, refilled continuously over `duration`.
    pub points: u32,
    pub duration: Duration,
    /// After an overdraw, reject the key outright for this long. Zero disables.
    pub block_duration: Duration,
}

impl BucketPolicy {
    fn refill_per_sec(&self) -> f64 {
        self.points as f64 / self.duration.as_secs_f64().max(f64::EPSILON)
    }
}

/// Result of an admitted request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    /// Time until the bucket is full again.
    pub reset_after: Duration,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("rate limit exceeded, retry after {retry_after_seconds}s")]
pub struct RateLimitError {
    pub limit: u32,
    /// Whole seconds, never below 1.
    pub retry_after_seconds: u64,
    pub reset_after: Duration,
}

/// Token bucket for a single key.
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
    last_seen: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, now: Instant) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: now,
            blocked_until: None,
            last_seen: now,
        }
    }

    fn refill(&mut self, policy: &BucketPolicy, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * policy.refill_per_sec()).min(policy.points as f64);
        self.last_refill = now;
    }

    fn until_full(&self, policy: &BucketPolicy) -> Duration {
        let missing = (policy.points as f64 - self.tokens).max(0.0);
        Duration::from_secs_f64(missing / policy.refill_per_sec())
    }

    fn try_consume(
        &mut self,
        policy: &BucketPolicy,
        points: u32,
        now: Instant,
    ) -> Result<RateLimitInfo, RateLimitError> {
        self.last_seen = now;
        self.refill(policy, now);

        if let Some(until) = self.blocked_until {
            if until > now {
                return Err(rejection(policy, until - now, self.until_full(policy)));
            }
            self.blocked_until = None;
        }

        let wanted = points as f64;
        if self.tokens >= wanted {
            self.tokens -= wanted;
            return Ok(RateLimitInfo {
                limit: policy.points,
                remaining: self.tokens.floor() as u32,
                reset_after: self.until_full(policy),
            });
        }

        let retry = if policy.block_duration.is_zero() {
            let deficit = wanted - self.tokens;
            Duration::from_secs_f64(deficit * policy.duration.as_secs_f64() / policy.points as f64)
        } else {
            self.blocked_until = Some(now + policy.block_duration);
            policy.block_duration
        };
        Err(rejection(policy, retry, self.until_full(policy)))
    }
}

fn rejection(policy: &BucketPolicy, retry: Duration, reset_after: Duration) -> RateLimitError {
    RateLimitError {
        limit: policy.points,
        retry_after_seconds: retry.as_secs_f64().ceil().max(1.0) as u64,
        reset_after,
    }
}

/// Per-key token bucket rate limiter.
pub struct RateLimiter {
    name: String,
    policy: BucketPolicy,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, policy: BucketPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            buckets: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &BucketPolicy {
        &self.policy
    }

    /// Consume `points` for `key`. A rejected request consumes nothing.
    pub fn consume(&self, key: &str, points: u32) -> Result<RateLimitInfo, RateLimitError> {
        self.consume_at(key, points, Instant::now())
    }

    pub fn consume_at(
        &self,
        key: &str,
        points: u32,
        now: Instant,
    ) -> Result<RateLimitInfo, RateLimitError> {
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.policy.points, now));
        bucket.try_consume(&self.policy, points, now)
    }

    /// Drops buckets not seen for `ttl`. Returns how many were removed.
    pub fn purge_idle(&self, ttl: Duration) -> usize {
        self.purge_idle_at(ttl, Instant::now())
    }

    fn purge_idle_at(&self, ttl: Duration, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, b| now.saturating_duration_since(b.last_seen) < ttl);
        before - self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// The named limiters applied at the HTTP boundary.
pub struct RateLimiters {
    pub global: RateLimiter,
    pub auth: RateLimiter,
    pub webhook: RateLimiter,
    pub integration: RateLimiter,
    /// How callers are told apart.
    pub identity: IdentityPolicy,
}

impl RateLimiters {
    pub fn from_config(config: &RateLimitsConfig) -> Self {
        Self {
            global: RateLimiter::new("global", config.global.policy()),
            auth: RateLimiter::new("auth", config.auth.policy()),
            webhook: RateLimiter::new("webhook", config.webhook.policy()),
            integration: RateLimiter::new("integration", config.integration.policy()),
            identity: IdentityPolicy::new(config.trusted_proxies.iter().copied()),
        }
    }

    /// Lets verified bearer tokens key their own buckets.
    pub fn with_token_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.identity = self.identity.with_verifier(verifier);
        self
    }

    pub fn purge_idle(&self, ttl: Duration) -> usize {
        [&self.global, &self.auth, &self.webhook, &self.integration]
            .iter()
            .map(|l| l.purge_idle(ttl))
            .sum()
    }
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self::from_config(&RateLimitsConfig::default())
    }
}
