use axum::http::{header::AUTHORIZATION, HeaderMap};
use sha2::{Digest, Sha256};

use crate::api::types::{ApiError, ErrorCode};

pub const ADMIN_TOKEN_HEADER: &str = "x-warden-admin-token";

pub fn admin_token_fingerprint(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn extract_bearer_token(raw: &str) -> Option<&str> {
    raw.strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .map(str::trim)
}

fn provided_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(extract_bearer_token)
        })
}

/// Mutating endpoints are open when no admin token is configured
pub fn ensure_admin_authorized(
    headers: &HeaderMap,
    expected_fingerprint: Option<&str>,
) -> std::result::Result<(), ApiError> {
    let Some(expected) = expected_fingerprint else {
        return Ok(());
    };

    match provided_token(headers) {
        Some(token) if admin_token_fingerprint(token) == expected => Ok(()),
        _ => Err(ApiError::new(
            ErrorCode::Unauthorized,
            "admin auth failed (missing/invalid token)",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_open_without_configured_token() {
        assert!(ensure_admin_authorized(&HeaderMap::new(), None).is_ok());
    }

    #[test]
    fn test_header_and_bearer_tokens() {
        let expected = admin_token_fingerprint("s3cret");

        let mut headers = HeaderMap::new();
        headers.insert(ADMIN_TOKEN_HEADER, HeaderValue::from_static("s3cret"));
        assert!(ensure_admin_authorized(&headers, Some(&expected)).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert!(ensure_admin_authorized(&headers, Some(&expected)).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
        let err = ensure_admin_authorized(&headers, Some(&expected)).unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
    }
}
