//! Crate-wide error taxonomy. Every adapter and the retry engine classify failures into
//! one of these kinds; the kind (not the HTTP status) drives retry/backoff/pool-mutation
//! decisions.

use std::time::Duration;

use thiserror::Error;

/// Body substrings that mark a 401 as permanent rather than transient.
const PERMANENT_AUTH_PATTERNS: &[&str] = &[
    "invalid_grant",
    "token has been expired or revoked",
    "bad credentials",
    "invalid_api_key",
];

/// Body substrings that indicate the provider has no capacity for the model rather than
/// a hard error.
const CAPACITY_EXHAUSTED_PATTERNS: &[&str] = &["resource_project_invalid", "not available"];

/// Body substrings that indicate a quota/rate-limit condition surfaced via a non-429 status.
const QUOTA_PATTERNS: &[&str] = &["quotaexceeded", "ratelimitexceeded"];

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("network error: {message}")]
    NetworkTransient { message: String },

    #[error("upstream {status} error: {body}")]
    Server5xx { status: u16, body: String },

    #[error("model capacity exhausted: {body}")]
    ModelCapacityExhausted { body: String },

    #[error("rate limit exceeded (reset_ms={reset_ms:?})")]
    RateLimitExceeded {
        reset_ms: Option<i64>,
        model_id: Option<String>,
    },

    #[error("transient auth failure: {body}")]
    AuthTransient { body: String },

    #[error("permanent auth failure: {reason}")]
    AuthInvalidPermanent { reason: String },

    #[error("stream ended without emitting any content")]
    EmptyResponseError,

    #[error("exceeded retry budget")]
    MaxRetriesExceeded,

    #[error("no accounts available for this request")]
    NoAccountsAvailable,

    #[error("upstream error from {provider} ({status}): {body}")]
    UpstreamError {
        provider: String,
        status: u16,
        body: String,
    },

    /// Cooperative cancellation (§5): the request context was cancelled while a sleep or
    /// HTTP call was in flight. Not part of the retry taxonomy proper — always propagates,
    /// never classified as retryable or fatal-by-retry-exhaustion.
    #[error("request cancelled")]
    Cancelled,
}

impl GatewayError {
    /// True if the retry engine should attempt another endpoint/account for this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::NetworkTransient { .. }
                | GatewayError::Server5xx { .. }
                | GatewayError::ModelCapacityExhausted { .. }
                | GatewayError::RateLimitExceeded { .. }
                | GatewayError::AuthTransient { .. }
                | GatewayError::EmptyResponseError
        )
    }

    /// True if this kind must end the request (no amount of retrying helps).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::AuthInvalidPermanent { .. }
                | GatewayError::MaxRetriesExceeded
                | GatewayError::NoAccountsAvailable
        )
    }

    /// Backoff tier lookup per §4.1/§7. Returns `None` for kinds that don't imply a sleep
    /// (the caller decides, e.g. immediate next-account selection).
    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimitExceeded { .. } => Some(Duration::from_secs(30)),
            GatewayError::ModelCapacityExhausted { .. } => Some(Duration::from_secs(15)),
            GatewayError::Server5xx { .. } => Some(Duration::from_secs(20)),
            GatewayError::NetworkTransient { .. } => Some(Duration::from_secs(60)),
            GatewayError::AuthTransient { .. } => Some(Duration::from_secs(60)),
            _ => None,
        }
    }

    /// Stable machine-readable kind name, independent of the variant's payload.
    pub fn error_kind(&self) -> &'static str {
        match self {
            GatewayError::NetworkTransient { .. } => "NetworkTransient",
            GatewayError::Server5xx { .. } => "Server5xx",
            GatewayError::ModelCapacityExhausted { .. } => "ModelCapacityExhausted",
            GatewayError::RateLimitExceeded { .. } => "RateLimitExceeded",
            GatewayError::AuthTransient { .. } => "AuthTransient",
            GatewayError::AuthInvalidPermanent { .. } => "AuthInvalidPermanent",
            GatewayError::EmptyResponseError => "EmptyResponseError",
            GatewayError::MaxRetriesExceeded => "MaxRetriesExceeded",
            GatewayError::NoAccountsAvailable => "NoAccountsAvailable",
            GatewayError::UpstreamError { .. } => "UpstreamError",
            GatewayError::Cancelled => "Cancelled",
        }
    }

    /// Classify an HTTP response into a `GatewayError` kind per §7. `retry_after_secs` is
    /// the parsed `retry-after` header, if the caller already extracted one.
    pub fn from_status(
        status: u16,
        body: &str,
        retry_after_secs: Option<u64>,
        provider: &str,
    ) -> Self {
        let lower = body.to_ascii_lowercase();

        if status == 429 {
            return GatewayError::RateLimitExceeded {
                reset_ms: retry_after_secs.map(|s| (s * 1000) as i64),
                model_id: None,
            };
        }

        if status == 403 && QUOTA_PATTERNS.iter().any(|p| lower.contains(p)) {
            return GatewayError::RateLimitExceeded {
                reset_ms: retry_after_secs.map(|s| (s * 1000) as i64),
                model_id: None,
            };
        }

        if status == 401 {
            if PERMANENT_AUTH_PATTERNS.iter().any(|p| lower.contains(p)) {
                return GatewayError::AuthInvalidPermanent { reason: body.to_string() };
            }
            return GatewayError::AuthTransient { body: body.to_string() };
        }

        if CAPACITY_EXHAUSTED_PATTERNS.iter().any(|p| lower.contains(p)) {
            return GatewayError::ModelCapacityExhausted { body: body.to_string() };
        }

        if (500..600).contains(&status) {
            return GatewayError::Server5xx { status, body: body.to_string() };
        }

        GatewayError::UpstreamError {
            provider: provider.to_string(),
            status,
            body: body.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_429_as_rate_limit() {
        let err = GatewayError::from_status(429, "", Some(30), "anthropic");
        assert!(matches!(err, GatewayError::RateLimitExceeded { reset_ms: Some(30000), .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn classifies_403_quota_as_rate_limit() {
        let err = GatewayError::from_status(403, "quotaExceeded for project", None, "google");
        assert!(matches!(err, GatewayError::RateLimitExceeded { .. }));
    }

    #[test]
    fn classifies_401_permanent_patterns() {
        let err = GatewayError::from_status(401, "invalid_grant: token revoked", None, "codex");
        assert!(matches!(err, GatewayError::AuthInvalidPermanent { .. }));
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn classifies_401_without_permanent_markers_as_transient() {
        let err = GatewayError::from_status(401, "temporary glitch", None, "openai");
        assert!(matches!(err, GatewayError::AuthTransient { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn classifies_capacity_exhausted_body() {
        let err = GatewayError::from_status(400, "RESOURCE_PROJECT_INVALID", None, "google");
        assert!(matches!(err, GatewayError::ModelCapacityExhausted { .. }));
    }

    #[test]
    fn classifies_5xx() {
        let err = GatewayError::from_status(503, "service unavailable", None, "openai");
        assert!(matches!(err, GatewayError::Server5xx { status: 503, .. }));
        assert_eq!(err.suggested_delay(), Some(Duration::from_secs(20)));
    }

    #[test]
    fn unclassified_status_is_upstream_error() {
        let err = GatewayError::from_status(418, "teapot", None, "openai");
        assert!(matches!(err, GatewayError::UpstreamError { status: 418, .. }));
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn error_kind_is_stable() {
        assert_eq!(GatewayError::MaxRetriesExceeded.error_kind(), "MaxRetriesExceeded");
        assert_eq!(GatewayError::NoAccountsAvailable.error_kind(), "NoAccountsAvailable");
    }
}
