//! OpenAI Codex adapter. OAuth refresh against `auth.openai.com`; unlike `openai`/
//! `openrouter` the request path POSTs to a single fixed Codex responses endpoint rather
//! than a provider base URL + `/chat/completions` suffix (§4.4, §6).

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use switchboard_core::errors::GatewayError;
use switchboard_core::messages::CanonicalRequest;
use switchboard_core::security::{oauth::CODEX_OAUTH, Credential, ProviderKind};
use switchboard_format::build_request_body;

use crate::adapter::{retry_after_ms, BuiltRequest, ProviderAdapter, RateLimitHint, ValidateOutcome};

pub const CODEX_RESPONSES_URL: &str = "https://chatgpt.com/backend-api/codex/responses";

const PERMANENT_REFRESH_PATTERNS: &[&str] = &["invalid_grant", "token has been expired or revoked"];

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

pub struct CodexAdapter {
    client: reqwest::Client,
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl CodexAdapter {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

#[async_trait]
impl ProviderAdapter for CodexAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Codex
    }

    async fn validate(&self, credential: &Credential, _custom_endpoint: Option<&str>) -> ValidateOutcome {
        match self.access_token("", credential).await {
            Ok(_) => ValidateOutcome::ok(""),
            Err(GatewayError::AuthInvalidPermanent { reason }) => ValidateOutcome::invalid(reason),
            Err(_) => ValidateOutcome { valid: false, email: None, error: None },
        }
    }

    async fn access_token(&self, _email: &str, credential: &Credential) -> Result<String, GatewayError> {
        let refresh_token = credential.expose();
        let resp = self
            .client
            .post(CODEX_OAUTH.token_endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", "codex-cli"),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::NetworkTransient { message: e.to_string() })?;

        let status = resp.status();
        let body: RefreshResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::NetworkTransient { message: e.to_string() })?;

        if let Some(err) = &body.error {
            let detail = body.error_description.clone().unwrap_or_default();
            let combined = format!("{err} {detail}").to_ascii_lowercase();
            if PERMANENT_REFRESH_PATTERNS.iter().any(|p| combined.contains(p)) {
                return Err(GatewayError::AuthInvalidPermanent { reason: combined });
            }
            return Err(GatewayError::AuthTransient { body: combined });
        }

        if !status.is_success() {
            return Err(GatewayError::AuthTransient { body: format!("refresh returned {status}") });
        }

        body.access_token.ok_or_else(|| GatewayError::AuthTransient { body: "missing access_token".into() })
    }

    fn parse_rate_limit(&self, _status: u16, headers: &HeaderMap, _body: &str, now_ms: i64) -> RateLimitHint {
        RateLimitHint { reset_ms: retry_after_ms(headers, now_ms) }
    }

    fn is_invalid_credential_error(&self, status: u16, body: &str) -> bool {
        status == 401 && body.to_ascii_lowercase().contains("invalid_grant")
    }

    fn build_request(&self, req: &CanonicalRequest, token: &str, _project_id: Option<&str>) -> BuiltRequest {
        let body = build_request_body(req, req.wants_thinking());
        let headers = vec![
            ("authorization".to_string(), format!("Bearer {token}")),
            ("content-type".to_string(), "application/json".to_string()),
        ];
        BuiltRequest { url: CODEX_RESPONSES_URL.to_string(), headers, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_request_posts_to_fixed_endpoint() {
        let adapter = CodexAdapter::new();
        let req = CanonicalRequest {
            model: "gpt-5".into(),
            messages: vec![switchboard_core::messages::Message::user_text("hi")],
            system: None,
            tools: vec![],
            tool_choice: None,
            max_tokens: 100,
            thinking: None,
            temperature: None,
            top_p: None,
            stream: false,
        };
        let built = adapter.build_request(&req, "tok", None);
        assert_eq!(built.url, CODEX_RESPONSES_URL);
    }

    #[test]
    fn invalid_grant_is_permanent() {
        let adapter = CodexAdapter::new();
        assert!(adapter.is_invalid_credential_error(401, "{\"error\":\"invalid_grant\"}"));
    }
}
