//! The four providers whose credential is a bearer-style API key used as-is: anthropic,
//! openai, openrouter, github_models. They differ only in base URL, auth header shape, and
//! a couple of extra headers (openrouter's attribution headers) — one generic adapter
//! parameterized by a small static config covers all four, per §4.4's "capability
//! interface, not inheritance" guidance.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use switchboard_core::errors::GatewayError;
use switchboard_core::messages::CanonicalRequest;
use switchboard_core::security::{Credential, ProviderKind};
use switchboard_format::build_request_body;

use crate::adapter::{retry_after_ms, BuiltRequest, ProviderAdapter, RateLimitHint, ValidateOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <token>`.
    Bearer,
    /// `x-api-key: <token>` plus a fixed `anthropic-version` header.
    AnthropicHeaders,
}

#[derive(Debug, Clone)]
pub struct ApiKeyAdapterConfig {
    pub kind: ProviderKind,
    pub base_url: &'static str,
    pub chat_path: &'static str,
    pub auth_style: AuthStyle,
    pub extra_headers: &'static [(&'static str, &'static str)],
    /// Anthropic's wire shape already matches `CanonicalRequest`'s serde shape; every other
    /// provider in this family needs the OpenAI-chat translation.
    pub native_anthropic_wire: bool,
}

pub const ANTHROPIC: ApiKeyAdapterConfig = ApiKeyAdapterConfig {
    kind: ProviderKind::Anthropic,
    base_url: "https://api.anthropic.com/v1",
    chat_path: "/messages",
    auth_style: AuthStyle::AnthropicHeaders,
    extra_headers: &[],
    native_anthropic_wire: true,
};

pub const OPENAI: ApiKeyAdapterConfig = ApiKeyAdapterConfig {
    kind: ProviderKind::OpenAi,
    base_url: "https://api.openai.com/v1",
    chat_path: "/chat/completions",
    auth_style: AuthStyle::Bearer,
    extra_headers: &[],
    native_anthropic_wire: false,
};

pub const OPENROUTER: ApiKeyAdapterConfig = ApiKeyAdapterConfig {
    kind: ProviderKind::OpenRouter,
    base_url: "https://openrouter.ai/api/v1",
    chat_path: "/chat/completions",
    auth_style: AuthStyle::Bearer,
    extra_headers: &[
        ("HTTP-Referer", "https://github.com/switchboard-gateway/switchboard"),
        ("X-Title", "switchboard"),
    ],
    native_anthropic_wire: false,
};

pub const GITHUB_MODELS: ApiKeyAdapterConfig = ApiKeyAdapterConfig {
    kind: ProviderKind::GithubModels,
    base_url: "https://models.inference.ai.azure.com",
    chat_path: "/chat/completions",
    auth_style: AuthStyle::Bearer,
    extra_headers: &[],
    native_anthropic_wire: false,
};

/// Body substrings that mark a 401 as a dead key rather than a transient glitch, on top of
/// `GatewayError::from_status`'s own generic patterns.
const INVALID_KEY_PATTERNS: &[&str] = &["invalid_api_key", "incorrect api key", "invalid x-api-key"];

pub struct ApiKeyAdapter {
    config: ApiKeyAdapterConfig,
    client: reqwest::Client,
}

impl ApiKeyAdapter {
    pub fn new(config: ApiKeyAdapterConfig) -> Self {
        Self { config, client: reqwest::Client::new() }
    }

    fn auth_headers(&self, token: &str) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        match self.config.auth_style {
            AuthStyle::Bearer => headers.push(("authorization".to_string(), format!("Bearer {token}"))),
            AuthStyle::AnthropicHeaders => {
                headers.push(("x-api-key".to_string(), token.to_string()));
                headers.push(("anthropic-version".to_string(), "2023-06-01".to_string()));
            }
        }
        for (k, v) in self.config.extra_headers {
            headers.push((k.to_string(), v.to_string()));
        }
        headers.push(("content-type".to_string(), "application/json".to_string()));
        headers
    }
}

#[async_trait]
impl ProviderAdapter for ApiKeyAdapter {
    fn kind(&self) -> ProviderKind {
        self.config.kind
    }

    async fn validate(&self, credential: &Credential, custom_endpoint: Option<&str>) -> ValidateOutcome {
        let token = credential.expose();
        let base = custom_endpoint.unwrap_or(self.config.base_url);
        let url = format!("{base}/models");
        let mut builder = self.client.get(&url);
        builder = match self.config.auth_style {
            AuthStyle::Bearer => builder.bearer_auth(token),
            AuthStyle::AnthropicHeaders => builder
                .header("x-api-key", token)
                .header("anthropic-version", "2023-06-01"),
        };
        match builder.send().await {
            Ok(resp) if resp.status().is_success() => ValidateOutcome::ok(""),
            Ok(resp) => ValidateOutcome::invalid(format!("probe returned {}", resp.status())),
            Err(_) => ValidateOutcome { valid: false, email: None, error: None },
        }
    }

    async fn access_token(&self, _email: &str, credential: &Credential) -> Result<String, GatewayError> {
        Ok(credential.expose().to_string())
    }

    fn parse_rate_limit(&self, _status: u16, headers: &HeaderMap, _body: &str, now_ms: i64) -> RateLimitHint {
        RateLimitHint { reset_ms: retry_after_ms(headers, now_ms) }
    }

    fn is_invalid_credential_error(&self, status: u16, body: &str) -> bool {
        if status != 401 && status != 403 {
            return false;
        }
        let lower = body.to_ascii_lowercase();
        INVALID_KEY_PATTERNS.iter().any(|p| lower.contains(p))
    }

    fn build_request(&self, req: &CanonicalRequest, token: &str, _project_id: Option<&str>) -> BuiltRequest {
        let url = format!("{}{}", self.config.base_url, self.config.chat_path);
        let body = if self.config.native_anthropic_wire {
            serde_json::to_value(req).expect("CanonicalRequest always serializes")
        } else {
            build_request_body(req, req.wants_thinking())
        };
        BuiltRequest { url, headers: self.auth_headers(token), body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_uses_x_api_key_header() {
        let adapter = ApiKeyAdapter::new(ANTHROPIC);
        let headers = adapter.auth_headers("sk-ant-xyz");
        assert!(headers.iter().any(|(k, v)| k == "x-api-key" && v == "sk-ant-xyz"));
        assert!(headers.iter().any(|(k, _)| k == "anthropic-version"));
    }

    #[test]
    fn openai_uses_bearer_header() {
        let adapter = ApiKeyAdapter::new(OPENAI);
        let headers = adapter.auth_headers("sk-xyz");
        assert!(headers.iter().any(|(k, v)| k == "authorization" && v == "Bearer sk-xyz"));
    }

    #[test]
    fn openrouter_carries_attribution_headers() {
        let adapter = ApiKeyAdapter::new(OPENROUTER);
        let headers = adapter.auth_headers("k");
        assert!(headers.iter().any(|(k, _)| k == "HTTP-Referer"));
        assert!(headers.iter().any(|(k, _)| k == "X-Title"));
    }

    #[test]
    fn anthropic_request_is_native_wire_shape() {
        let adapter = ApiKeyAdapter::new(ANTHROPIC);
        let req = CanonicalRequest {
            model: "claude-sonnet-4-5".into(),
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
        assert_eq!(built.body["model"], "claude-sonnet-4-5");
        assert!(built.body["max_tokens"].is_number());
    }

    #[test]
    fn openai_request_uses_chat_translation() {
        let adapter = ApiKeyAdapter::new(OPENAI);
        let req = CanonicalRequest {
            model: "gpt-4.1".into(),
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
        assert!(built.body["max_completion_tokens"].is_number());
        assert!(built.url.ends_with("/chat/completions"));
    }

    #[test]
    fn invalid_api_key_body_is_detected() {
        let adapter = ApiKeyAdapter::new(OPENAI);
        assert!(adapter.is_invalid_credential_error(401, "{\"error\":\"invalid_api_key\"}"));
        assert!(!adapter.is_invalid_credential_error(401, "temporary glitch"));
    }
}
