//! Bearer token check for the statistics endpoint

use crate::audit;
use hyper::header::HeaderValue;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingHeader,

    #[error("invalid authorization header encoding")]
    InvalidEncoding,

    #[error("missing Bearer prefix")]
    MissingBearerPrefix,

    #[error("invalid token")]
    InvalidToken,
}

/// Validate an `Authorization: Bearer <token>` header against `expected`.
///
/// Every outcome is written to the audit log.
pub fn check_bearer(header: Option<&HeaderValue>, expected: &str) -> Result<(), AuthError> {
    let result = match header {
        Some(val) => val
            .to_str()
            .map_err(|_| AuthError::InvalidEncoding)
            .and_then(|s| s.strip_prefix("Bearer ").ok_or(AuthError::MissingBearerPrefix))
            .and_then(|token| {
                if token == expected {
                    Ok(())
                } else {
                    Err(AuthError::InvalidToken)
                }
            }),
        None => Err(AuthError::MissingHeader),
    };

    match &result {
        Ok(()) => audit::stats_auth_success(),
        Err(e) => audit::stats_auth_failure(&e.to_string()),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_token() {
        let header = HeaderValue::from_static("Bearer secret123");
        assert!(check_bearer(Some(&header), "secret123").is_ok());
    }

    #[test]
    fn test_invalid_token() {
        let header = HeaderValue::from_static("Bearer wrong");
        assert_eq!(
            check_bearer(Some(&header), "secret123"),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn test_missing_header() {
        assert_eq!(
            check_bearer(None, "secret123"),
            Err(AuthError::MissingHeader)
        );
    }

    #[test]
    fn test_missing_bearer_prefix() {
        let header = HeaderValue::from_static("Basic c2VjcmV0MTIz");
        assert_eq!(
            check_bearer(Some(&header), "secret123"),
            Err(AuthError::MissingBearerPrefix)
        );
    }

    #[test]
    fn test_non_ascii_header() {
        let header = HeaderValue::from_bytes(b"Bearer \xff").unwrap();
        assert_eq!(
            check_bearer(Some(&header), "secret123"),
            Err(AuthError::InvalidEncoding)
        );
    }
}
