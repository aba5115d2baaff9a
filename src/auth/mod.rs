//! Caller identity at the HTTP boundary.
//!
//! The identity keys rate limit buckets. A bearer token only counts once a
//! [`TokenVerifier`] accepts it, and `X-Forwarded-For` is only read when the
//! peer is a configured trusted proxy. Everything else falls back to the
//! socket peer address.

use axum::http::HeaderMap;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;


/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, TokenError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(TokenError::Missing)?
        .to_str()
        .map_err(|_| TokenError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

fn parse_bearer_token(header_value: &str) -> Result<String, TokenError> {
    let (scheme, token) = header_value
        .split_once(' ')
        .ok_or(TokenError::InvalidFormat)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(TokenError::InvalidFormat);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(token.to_string())
}

/// Who is making a request, for admission control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerIdentity {
    /// Verified user id.
    User(String),
    Ip(String),
    Anonymous,
}

impl CallerIdentity {
    /// Rate limit bucket key.
    pub fn key(&self) -> String {
        match self {
            Self::User(user) => format!("user:{}", user),
            Self::Ip(ip) => format!("ip:{}", ip),
            Self::Anonymous => "anonymous".to_string(),
        }
    }
}

/// Resolves a bearer token to the user it belongs to.
pub trait TokenVerifier: Send + Sync {
    /// `None` for unknown or expired tokens.
    fn verify(&self, token: &str) -> Option<String>;
}

/// How much of the request the identity may be derived from.
#[derive(Clone, Default)]
pub struct IdentityPolicy {
    verifier: Option<Arc<dyn TokenVerifier>>,
    trusted_proxies: HashSet<IpAddr>,
}

impl IdentityPolicy {
    pub fn new(trusted_proxies: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            verifier: None,
            trusted_proxies: trusted_proxies.into_iter().collect(),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.trusted_proxies.contains(ip)
    }
}

impl std::fmt::Debug for IdentityPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityPolicy")
            .field("verifier", &self.verifier.is_some())
            .field("trusted_proxies", &self.trusted_proxies)
            .finish()
    }
}

/// Verified user, else the client address, else anonymous.
///
/// The client address is the peer, unless the peer is a trusted proxy, in
/// which case it is the right-most `X-Forwarded-For` hop that is not itself
/// a trusted proxy.
pub fn caller_identity(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    policy: &IdentityPolicy,
) -> CallerIdentity {
    if let Some(verifier) = &policy.verifier {
        if let Some(user) = extract_bearer_token(headers)
            .ok()
            .and_then(|token| verifier.verify(&token))
        {
            return CallerIdentity::User(user);
        }
    }

    let Some(peer) = peer.map(|addr| addr.ip()) else {
        return CallerIdentity::Anonymous;
    };
    if !policy.is_trusted(&peer) {
        return CallerIdentity::Ip(peer.to_string());
    }

    let client = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .filter_map(|hop| hop.parse::<IpAddr>().ok())
        .find(|ip| !policy.is_trusted(ip));

    CallerIdentity::Ip(client.unwrap_or(peer).to_string())
}

/// Token extraction errors
#[derive(Debug, PartialEq, Clone)]
pub enum TokenError {
    /// Authorization header not present
    Missing,
    /// Not "Bearer <token>"
    InvalidFormat,
    Empty,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Missing => write!(f, "Authorization token not provided"),
            TokenError::InvalidFormat => write!(f, "Invalid authorization token format"),
            TokenError::Empty => write!(f, "Authorization token is empty"),
        }
    }
}

impl std::error::Error for TokenError {}
