use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::WebhookError;

type HmacSha256 = Hmac<Sha256>;

/// Header names checked for a signature, in order.
pub const SIGNATURE_HEADERS: [&str; 3] = ["x-hub-signature-256", "x-hub-signature", "x-signature"];

/// First non-empty HMAC-SHA256 signature header value, if any.
///
/// Values tagged with another algorithm (GitHub's legacy `sha1=`) are skipped.
pub fn extract_signature(headers: &HeaderMap) -> Option<String> {
    SIGNATURE_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty() && is_sha256(s))
            .map(str::to_string)
    })
}

fn is_sha256(value: &str) -> bool {
    match value.split_once('=') {
        Some((algorithm, _)) => algorithm.eq_ignore_ascii_case("sha256"),
        None => true,
    }
}

/// Verify an HMAC-SHA256 signature over `body`.
///
/// Accepts raw hex or `sha256=<hex>`.
pub fn verify_signature(secret: &str, signature: &str, body: &[u8]) -> Result<(), WebhookError> {
    let sig = signature.trim();
    let sig_hex = sig.strip_prefix("sha256=").unwrap_or(sig);
    let provided = hex::decode(sig_hex).map_err(|_| WebhookError::InvalidSignature)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(body);
    // Constant-time comparison.
    mac.verify_slice(&provided)
        .map_err(|_| WebhookError::InvalidSignature)
}

/// `sha256=<hex>` signature of `body`, as a sender would attach it.
pub fn sign_body(secret: &str, body: &[u8]) -> Result<String, WebhookError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Decide whether a request may proceed.
///
/// Returns whether the payload was verified. Strict mode requires both a
/// signature and a secret; otherwise an unsigned or unverifiable request is
/// accepted unverified. A signature that fails verification is always rejected.
pub fn check_request(
    secret: Option<&str>,
    signature: Option<&str>,
    body: &[u8],
    strict: bool,
) -> Result<bool, WebhookError> {
    match (signature, secret) {
        (None, _) if strict => Err(WebhookError::MissingSignature),
        (None, _) => Ok(false),
        (Some(sig), Some(secret)) => verify_signature(secret, sig, body).map(|_| true),
        (Some(_), None) if strict => Err(WebhookError::NoSecret),
        (Some(_), None) => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let body = br#"{"action":"opened"}"#;
        let sig = sign_body("s3cret", body).unwrap();
        assert!(sig.starts_with("sha256="));
        verify_signature("s3cret", &sig, body).unwrap();

        // Raw hex accepted too
        let raw = sig.trim_start_matches("sha256=");
        verify_signature("s3cret", raw, body).unwrap();
    }

    #[test]
    fn test_wrong_secret_or_body_rejected() {
        let body = br#"{"a":1}"#;
        let sig = sign_body("s3cret", body).unwrap();
        assert!(matches!(
            verify_signature("other", &sig, body),
            Err(WebhookError::InvalidSignature)
        ));
        assert!(verify_signature("s3cret", &sig, br#"{"a":2}"#).is_err());
        assert!(verify_signature("s3cret", "sha256=not-hex", body).is_err());
    }

    #[test]
    fn test_extract_signature_header_order() {
        let mut headers = HeaderMap::new();
        headers.insert("x-signature", "abc".parse().unwrap());
        assert_eq!(extract_signature(&headers).as_deref(), Some("abc"));

        headers.insert("x-hub-signature-256", "sha256=def".parse().unwrap());
        assert_eq!(extract_signature(&headers).as_deref(), Some("sha256=def"));

        assert_eq!(extract_signature(&HeaderMap::new()), None);
    }

    #[test]
    fn test_legacy_sha1_header_is_not_a_signature() {
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature", "sha1=0123abcd".parse().unwrap());
        assert_eq!(extract_signature(&headers), None);

        headers.insert("x-signature", "feed".parse().unwrap());
        assert_eq!(extract_signature(&headers).as_deref(), Some("feed"));

        headers.insert("x-hub-signature", "sha256=beef".parse().unwrap());
        assert_eq!(extract_signature(&headers).as_deref(), Some("sha256=beef"));
    }

    #[test]
    fn test_check_request_modes() {
        let body = b"{}";
        let sig = sign_body("k", body).unwrap();

        assert!(matches!(
            check_request(Some("k"), None, body, true),
            Err(WebhookError::MissingSignature)
        ));
        assert_eq!(check_request(Some("k"), None, body, false).unwrap(), false);
        assert_eq!(check_request(Some("k"), Some(&sig), body, true).unwrap(), true);
        assert!(matches!(
            check_request(None, Some(&sig), body, true),
            Err(WebhookError::NoSecret)
        ));
        assert_eq!(check_request(None, Some(&sig), body, false).unwrap(), false);
        assert!(check_request(Some("other"), Some(&sig), body, false).is_err());
    }
}
