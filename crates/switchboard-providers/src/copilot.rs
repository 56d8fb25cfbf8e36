//! GitHub Copilot adapter. The stored credential is a long-lived GitHub OAuth token
//! (`gho_*`/`ghu_*`); `access_token` exchanges it for a short-lived Copilot session token
//! and caches that exchange itself, distinct from (and beneath) the pool's own token
//! cache — see §4.4's "Copilot session exchange" note.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::Value;
use switchboard_core::errors::GatewayError;
use switchboard_core::messages::{CanonicalRequest, ContentBlock};
use switchboard_core::security::{Credential, ProviderKind};
use switchboard_format::{build_request_body, normalize};
use tokio::sync::RwLock;

use crate::adapter::{retry_after_ms, BuiltRequest, ProviderAdapter, RateLimitHint, ValidateOutcome};

const SESSION_TOKEN_URL: &str = "https://api.github.com/copilot_internal/v2/token";
const BASE_URL: &str = "https://api.githubcopilot.com";

/// Grace window subtracted from the session token's reported expiry, so callers refresh
/// slightly ahead of the real cutoff rather than racing it.
const EXPIRY_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct SessionTokenResponse {
    token: String,
    expires_at: i64,
}

#[derive(Clone)]
struct CachedSession {
    token: String,
    expires_at_ms: i64,
}

pub struct CopilotAdapter {
    client: reqwest::Client,
    sessions: RwLock<HashMap<String, CachedSession>>,
}

impl Default for CopilotAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl CopilotAdapter {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new(), sessions: RwLock::new(HashMap::new()) }
    }

    async fn ensure_session_token(&self, email: &str, github_token: &str) -> Result<String, GatewayError> {
        let now_ms = chrono::Utc::now().timestamp_millis();

        if let Some(cached) = self.sessions.read().await.get(email) {
            if cached.expires_at_ms > now_ms {
                return Ok(cached.token.clone());
            }
        }

        let resp = self
            .client
            .get(SESSION_TOKEN_URL)
            .bearer_auth(github_token)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| GatewayError::NetworkTransient { message: e.to_string() })?;

        let status = resp.status();
        if status == 401 || status == 403 {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::AuthInvalidPermanent { reason: body });
        }
        if !status.is_success() {
            return Err(GatewayError::AuthTransient { body: format!("session exchange returned {status}") });
        }

        let parsed: SessionTokenResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::NetworkTransient { message: e.to_string() })?;

        let expires_at_ms = (parsed.expires_at * 1000) - EXPIRY_GRACE.as_millis() as i64;
        self.sessions.write().await.insert(
            email.to_string(),
            CachedSession { token: parsed.token.clone(), expires_at_ms },
        );
        Ok(parsed.token)
    }

    fn copilot_headers(&self, token: &str, initiator: &str, vision: bool) -> Vec<(String, String)> {
        let mut headers = vec![
            ("authorization".to_string(), format!("Bearer {token}")),
            ("content-type".to_string(), "application/json".to_string()),
            ("x-initiator".to_string(), initiator.to_string()),
            ("openai-intent".to_string(), "conversation-edits".to_string()),
            ("copilot-integration-id".to_string(), "vscode-chat".to_string()),
        ];
        if vision {
            headers.push(("copilot-vision-request".to_string(), "true".to_string()));
        }
        headers
    }
}

/// `"agent"` when the turn is a tool-result continuation of an earlier agentic call,
/// `"user"` for a fresh user-initiated turn (spec.md:126, SPEC_FULL.md §4.4).
fn initiator_for(req: &CanonicalRequest) -> &'static str {
    let is_continuation =
        req.messages.last().is_some_and(|m| m.content.iter().any(ContentBlock::is_tool_result));
    if is_continuation {
        "agent"
    } else {
        "user"
    }
}

fn request_has_image(req: &CanonicalRequest) -> bool {
    req.messages.iter().any(|m| m.content.iter().any(|b| matches!(b, ContentBlock::Image { .. })))
}

#[async_trait]
impl ProviderAdapter for CopilotAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Copilot
    }

    async fn validate(&self, credential: &Credential, _custom_endpoint: Option<&str>) -> ValidateOutcome {
        match self.ensure_session_token("__validate__", credential.expose()).await {
            Ok(_) => ValidateOutcome::ok(""),
            Err(GatewayError::AuthInvalidPermanent { reason }) => ValidateOutcome::invalid(reason),
            Err(_) => ValidateOutcome { valid: false, email: None, error: None },
        }
    }

    async fn access_token(&self, email: &str, credential: &Credential) -> Result<String, GatewayError> {
        self.ensure_session_token(email, credential.expose()).await
    }

    fn parse_rate_limit(&self, _status: u16, headers: &HeaderMap, _body: &str, now_ms: i64) -> RateLimitHint {
        RateLimitHint { reset_ms: retry_after_ms(headers, now_ms) }
    }

    fn is_invalid_credential_error(&self, status: u16, body: &str) -> bool {
        (status == 401 || status == 403) && body.to_ascii_lowercase().contains("bad credentials")
    }

    fn build_request(&self, req: &CanonicalRequest, token: &str, _project_id: Option<&str>) -> BuiltRequest {
        let normalized = normalize(&req.model);
        let is_thinking = normalized.is_thinking || req.wants_thinking();

        let mut rewritten = req.clone();
        rewritten.model = normalized.name;
        if !normalized.known {
            tracing::warn!(model = %rewritten.model, "copilot: dispatching unnormalized model id");
        }

        let mut body = build_request_body(&rewritten, is_thinking);
        if is_thinking {
            if let Value::Object(map) = &mut body {
                map.insert("include".to_string(), serde_json::json!(["reasoning.encrypted_content"]));
            }
        }

        let url = format!("{BASE_URL}/chat/completions");
        let initiator = initiator_for(&rewritten);
        let vision = request_has_image(&rewritten);
        BuiltRequest { url, headers: self.copilot_headers(token, initiator, vision), body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copilot_headers_carry_required_markers() {
        let adapter = CopilotAdapter::new();
        let headers = adapter.copilot_headers("tok", "user", false);
        assert!(headers.iter().any(|(k, v)| k == "x-initiator" && v == "user"));
        assert!(headers.iter().any(|(k, v)| k == "openai-intent" && v == "conversation-edits"));
        assert!(!headers.iter().any(|(k, _)| k == "copilot-vision-request"));
    }

    #[test]
    fn copilot_headers_set_vision_marker_when_requested() {
        let adapter = CopilotAdapter::new();
        let headers = adapter.copilot_headers("tok", "agent", true);
        assert!(headers.iter().any(|(k, v)| k == "x-initiator" && v == "agent"));
        assert!(headers.iter().any(|(k, v)| k == "copilot-vision-request" && v == "true"));
    }

    #[test]
    fn initiator_is_user_for_a_fresh_turn() {
        let req = CanonicalRequest {
            model: "claude-sonnet-4".into(),
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
        assert_eq!(initiator_for(&req), "user");
    }

    #[test]
    fn initiator_is_agent_for_a_tool_result_continuation() {
        let req = CanonicalRequest {
            model: "claude-sonnet-4".into(),
            messages: vec![switchboard_core::messages::Message::user(vec![ContentBlock::ToolResult {
                tool_use_id: "toolu_1".into(),
                content: "42".into(),
                is_error: None,
            }])],
            system: None,
            tools: vec![],
            tool_choice: None,
            max_tokens: 100,
            thinking: None,
            temperature: None,
            top_p: None,
            stream: false,
        };
        assert_eq!(initiator_for(&req), "agent");
    }

    #[test]
    fn request_has_image_detects_image_block() {
        let req = CanonicalRequest {
            model: "claude-sonnet-4".into(),
            messages: vec![switchboard_core::messages::Message::user(vec![
                ContentBlock::text("what is this"),
                ContentBlock::Image { media_type: "image/png".into(), data: "AAAA".into() },
            ])],
            system: None,
            tools: vec![],
            tool_choice: None,
            max_tokens: 100,
            thinking: None,
            temperature: None,
            top_p: None,
            stream: false,
        };
        assert!(request_has_image(&req));
    }

    #[test]
    fn build_request_sets_vision_header_when_request_has_image() {
        let adapter = CopilotAdapter::new();
        let req = CanonicalRequest {
            model: "claude-3-5-sonnet-latest".into(),
            messages: vec![switchboard_core::messages::Message::user(vec![
                ContentBlock::Image { media_type: "image/png".into(), data: "AAAA".into() },
            ])],
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
        assert!(built.headers.iter().any(|(k, v)| k == "copilot-vision-request" && v == "true"));
    }

    #[test]
    fn build_request_normalizes_model_and_sets_reasoning_include() {
        let adapter = CopilotAdapter::new();
        let req = CanonicalRequest {
            model: "claude-3-5-sonnet-latest-thinking".into(),
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
        assert_eq!(built.body["model"], "claude-sonnet-4");
        assert_eq!(built.body["include"][0], "reasoning.encrypted_content");
    }

    #[test]
    fn bad_credentials_body_is_permanent() {
        let adapter = CopilotAdapter::new();
        assert!(adapter.is_invalid_credential_error(401, "Bad credentials"));
        assert!(!adapter.is_invalid_credential_error(401, "rate limited"));
    }
}
