//! Error taxonomy for connectors and the integration manager.
//!
//! Raw transport errors are classified exactly once, at the connector
//! boundary, by [`classify`]. Everything above that sees only
//! [`ConnectorError`].

use crate::types::Capability;
use conduit::queue::{JobError, QueueError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectorError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("{provider} does not support {capability}")]
    UnsupportedCapability {
        provider: String,
        capability: Capability,
    },

    #[error("{provider} service error: {message}")]
    ExternalService { provider: String, message: String },

    #[error("rate limited by {provider}, retry after {retry_after_seconds}s")]
    RateLimited {
        provider: String,
        retry_after_seconds: u64,
    },
}

impl ConnectorError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication(message.into())
    }

    pub fn external(provider: &str, message: impl Into<String>) -> Self {
        Self::ExternalService {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn not_connected() -> Self {
        Self::Configuration("not connected".to_string())
    }

    /// Only transient provider failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalService { .. } | Self::RateLimited { .. })
    }
}

/// Non-success HTTP response from a provider API.
#[derive(Debug, Error)]
#[error("HTTP {status}: {body}")]
pub struct HttpStatusError {
    pub status: u16,
    pub retry_after: Option<u64>,
    pub body: String,
}

impl HttpStatusError {
    /// Consumes a response, returning it untouched when its status is a success.
    pub async fn check(response: reqwest::Response) -> Result<reqwest::Response, Self> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = response.text().await.unwrap_or_default();
        Err(Self {
            status: status.as_u16(),
            retry_after,
            body,
        })
    }
}

/// Maps an arbitrary error raised while talking to `provider`.
pub fn classify(provider: &str, err: anyhow::Error) -> ConnectorError {
    let err = match err.downcast::<ConnectorError>() {
        Ok(e) => return e,
        Err(err) => err,
    };

    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<HttpStatusError>() {
            return from_status(provider, e.status, e.retry_after, &e.body);
        }
        if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
            if e.is_timeout() || e.is_connect() {
                return ConnectorError::external(provider, e.to_string());
            }
            if let Some(status) = e.status() {
                return from_status(provider, status.as_u16(), None, &e.to_string());
            }
        }
        if cause.downcast_ref::<std::io::Error>().is_some()
            || cause.downcast_ref::<tokio::time::error::Elapsed>().is_some()
        {
            return ConnectorError::external(provider, cause.to_string());
        }
    }

    ConnectorError::external(provider, format!("{:#}", err))
}

fn from_status(provider: &str, status: u16, retry_after: Option<u64>, body: &str) -> ConnectorError {
    match status {
        401 | 403 => ConnectorError::authentication(format!("{} rejected credentials ({})", provider, status)),
        429 => ConnectorError::RateLimited {
            provider: provider.to_string(),
            retry_after_seconds: retry_after.unwrap_or(60),
        },
        400..=499 => ConnectorError::configuration(format!("{} returned {}: {}", provider, status, body)),
        _ => ConnectorError::external(provider, format!("HTTP {}: {}", status, body)),
    }
}

/// Failures surfaced by the integration manager.
#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("integration '{0}' not found")]
    NotFound(String),

    #[error("health check failed for integration '{0}'")]
    HealthCheckFailed(String),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("store error: {0}")]
    Store(String),
}

impl IntegrationError {
    pub fn store(err: anyhow::Error) -> Self {
        Self::Store(format!("{:#}", err))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotFound(_) => false,
            Self::Connector(e) => e.is_retryable(),
            Self::Queue(QueueError::UnknownQueue(_)) => false,
            Self::HealthCheckFailed(_) | Self::Queue(_) | Self::Store(_) => true,
        }
    }
}

impl From<ConnectorError> for JobError {
    fn from(e: ConnectorError) -> Self {
        if e.is_retryable() {
            JobError::retryable(e.to_string())
        } else {
            JobError::permanent(e.to_string())
        }
    }
}

impl From<IntegrationError> for JobError {
    fn from(e: IntegrationError) -> Self {
        if e.is_retryable() {
            JobError::retryable(e.to_string())
        } else {
            JobError::permanent(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> anyhow::Error {
        anyhow::Error::new(HttpStatusError {
            status: code,
            retry_after: Some(7),
            body: "nope".to_string(),
        })
    }

    #[test]
    fn test_classify_http_statuses() {
        assert!(matches!(classify("slack", status(401)), ConnectorError::Authentication(_)));
        assert!(matches!(classify("slack", status(403)), ConnectorError::Authentication(_)));
        assert!(matches!(classify("slack", status(404)), ConnectorError::Configuration(_)));
        assert!(matches!(classify("slack", status(502)), ConnectorError::ExternalService { .. }));
        assert_eq!(
            classify("slack", status(429)),
            ConnectorError::RateLimited {
                provider: "slack".to_string(),
                retry_after_seconds: 7
            }
        );
    }

    #[test]
    fn test_classify_io_and_passthrough() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = anyhow::Error::new(io).context("opening smtp session");
        assert!(classify("smtp", err).is_retryable());

        let original = ConnectorError::authentication("bad password");
        let err = anyhow::Error::new(original.clone());
        assert_eq!(classify("smtp", err), original);
    }

    #[test]
    fn test_retryable_mapping_into_job_error() {
        let job: JobError = ConnectorError::configuration("bad").into();
        assert!(!job.is_retryable());

        let job: JobError = ConnectorError::external("slack", "503").into();
        assert!(job.is_retryable());

        let job: JobError = IntegrationError::NotFound("i1".to_string()).into();
        assert!(!job.is_retryable());

        let job: JobError = IntegrationError::Connector(ConnectorError::RateLimited {
            provider: "slack".to_string(),
            retry_after_seconds: 1,
        })
        .into();
        assert!(job.is_retryable());
    }
}
