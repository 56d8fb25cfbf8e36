//! The provider-adapter seam (§4.4): five operations every upstream implements, behind a
//! trait object rather than a class hierarchy. Adapters are stateless with respect to any
//! particular account — all per-account data (credential, email, cached project id) is
//! passed in, never held.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::Value;
use switchboard_core::errors::GatewayError;
use switchboard_core::security::{Credential, ProviderKind};

/// Outcome of a one-shot credential probe. Network errors are reported as `valid: false`
/// with no `error` detail worth surfacing — per §4.4 they must not mark the account invalid,
/// only a real auth rejection does that, and that distinction is the caller's to make from
/// the returned `GatewayError` of `access_token`, not from `validate`.
#[derive(Debug, Clone)]
pub struct ValidateOutcome {
    pub valid: bool,
    pub email: Option<String>,
    pub error: Option<String>,
}

impl ValidateOutcome {
    pub fn ok(email: impl Into<String>) -> Self {
        Self { valid: true, email: Some(email.into()), error: None }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self { valid: false, email: None, error: Some(error.into()) }
    }
}

/// Absolute reset time extracted from a provider's rate-limit response, if any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitHint {
    pub reset_ms: Option<i64>,
}

/// Everything needed to issue the HTTP call: method is always POST per §6.
#[derive(Debug, Clone)]
pub struct BuiltRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// One probe call against the provider using `credential`. Must not mutate any pool
    /// state itself — the caller decides what to do with the outcome.
    async fn validate(&self, credential: &Credential, custom_endpoint: Option<&str>) -> ValidateOutcome;

    /// Materialize a usable access token. For API-key providers this simply unwraps the
    /// credential; for OAuth providers (google, codex) this performs a refresh. Returns
    /// `GatewayError::AuthTransient` on a transient refresh failure and
    /// `GatewayError::AuthInvalidPermanent` when the refresh token itself is dead
    /// (`invalid_grant`, revoked).
    async fn access_token(&self, email: &str, credential: &Credential) -> Result<String, GatewayError>;

    /// Reads provider-specific rate-limit headers/body markers and returns an absolute
    /// reset time in epoch milliseconds, if the response carries one.
    fn parse_rate_limit(&self, status: u16, headers: &HeaderMap, body: &str, now_ms: i64) -> RateLimitHint;

    /// Provider-specific auth-failure body pattern match, used by the retry engine in
    /// addition to (not instead of) `GatewayError::from_status`'s generic patterns.
    fn is_invalid_credential_error(&self, status: u16, body: &str) -> bool;

    /// Build the request for this provider given a materialized token and (for google)
    /// a discovered project id. `stream` on the canonical request selects the streaming
    /// endpoint variant where the provider distinguishes one.
    fn build_request(
        &self,
        req: &switchboard_core::messages::CanonicalRequest,
        token: &str,
        project_id: Option<&str>,
    ) -> BuiltRequest;
}

/// Shared helper: most non-Google adapters read `retry-after` the same way.
pub fn retry_after_ms(headers: &HeaderMap, now_ms: i64) -> Option<i64> {
    let raw = headers.get("retry-after")?.to_str().ok()?;
    if let Ok(secs) = raw.parse::<i64>() {
        return Some(now_ms + secs * 1000);
    }
    chrono::DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}
