//! Credential handles for connector instances, and encrypted storage for them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - keyed by (owner, credential_ref)      │
//! │  - transparent seal/open                 │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!       (seal)               (open)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Cipher (AES-256-GCM)               │
//! │  - unique nonce per blob                 │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SQLite Database                    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use conduit::credentials::{CredentialStore, Credentials};
//!
//! # fn main() -> anyhow::Result<()> {
//! let encryption_key = std::env::var("CONDUIT_ENCRYPTION_KEY")?;
//! let store = CredentialStore::new("credentials.db", &encryption_key)?;
//!
//! let creds = Credentials::basic("mailer", "hunter2");
//! store.store("org_1", "int_42", &creds)?;
//!
//! if let Some(creds) = store.get("org_1", "int_42")? {
//!     println!("kind: {}", creds.kind());
//! }
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

mod encryption;
mod storage;

pub use encryption::{Cipher, Sealed};
pub use storage::CredentialStore;

/// Credentials handed to a connector instance.
///
/// Deserialized untagged at the outer boundary so that request bodies can
/// carry any of `{access_token, ..}`, `{user, pass}` / `{username, password}`
/// or `{api_key}`. Owned by the caller; connectors only replace them through
/// `refresh_auth`.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Credentials {
    OAuth {
        access_token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
    },
    Basic {
        #[serde(alias = "user")]
        username: String,
        #[serde(alias = "pass")]
        password: String,
    },
    ApiKey {
        api_key: String,
    },
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self::OAuth {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    /// Short name of the credential scheme, safe to log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OAuth { .. } => "oauth",
            Self::Basic { .. } => "basic",
            Self::ApiKey { .. } => "api_key",
        }
    }

    /// Token usable in an `Authorization: Bearer` header, if the scheme has one.
    pub fn bearer_token(&self) -> Option<&str> {
        match self {
            Self::OAuth { access_token, .. } => Some(access_token),
            Self::ApiKey { api_key } => Some(api_key),
            Self::Basic { .. } => None,
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::OAuth { expires_at, .. } => *expires_at,
            _ => None,
        }
    }

    /// True when the token expires within `threshold` and a refresh token is present.
    ///
    /// Tokens without expiry or without a refresh token never need a refresh.
    pub fn needs_refresh(&self, threshold: Duration) -> bool {
        match self {
            Self::OAuth {
                refresh_token: Some(_),
                expires_at: Some(expires_at),
                ..
            } => *expires_at <= Utc::now() + threshold,
            _ => false,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OAuth {
                refresh_token,
                expires_at,
                ..
            } => f
                .debug_struct("OAuth")
                .field("access_token", &"<redacted>")
                .field("refresh_token", &refresh_token.as_ref().map(|_| "<redacted>"))
                .field("expires_at", expires_at)
                .finish(),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::ApiKey { .. } => f
                .debug_struct("ApiKey")
                .field("api_key", &"<redacted>")
                .finish(),
        }
    }
}
