//! Google Cloud Code adapter. Unlike the OpenAI-chat family, requests carry the Anthropic
//! message list verbatim inside a Google envelope (§4.3) and responses need their own
//! conversion, already implemented in `switchboard_format::google`. This adapter owns OAuth
//! refresh and the `loadCodeAssist` project-discovery dance.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};
use switchboard_core::errors::GatewayError;
use switchboard_core::messages::{CanonicalRequest, ContentBlock};
use switchboard_core::security::{oauth::GOOGLE_OAUTH, Credential, ProviderKind};
use switchboard_format::google::build_envelope;

use crate::adapter::{retry_after_ms, BuiltRequest, ProviderAdapter, RateLimitHint, ValidateOutcome};

/// Tried in order for both content generation and project discovery.
pub const CLOUDCODE_ENDPOINT_FALLBACKS: &[&str] =
    &["https://daily-cloudcode-pa.googleapis.com", "https://cloudcode-pa.googleapis.com"];

/// Used when every `loadCodeAssist` endpoint fails to resolve a project for the account.
pub const DEFAULT_PROJECT_ID: &str = "switchboard-default-project";

const PERMANENT_REFRESH_PATTERNS: &[&str] = &["invalid_grant"];

/// How long a cached thought signature stays valid for replay on the next tool-result turn
/// (§9 glossary "Thought signature": "cached by tool-use ID with TTL").
const SIGNATURE_CACHE_TTL_MS: i64 = 30 * 60 * 1000;

pub struct GoogleAdapter {
    client: reqwest::Client,
    /// Thought signatures keyed by tool-use id, an explicit field of this adapter rather
    /// than module-scope state (§9). Entries are `(signature, expires_at_ms)`.
    signature_cache: RwLock<HashMap<String, (String, i64)>>,
}

impl Default for GoogleAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl GoogleAdapter {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new(), signature_cache: RwLock::new(HashMap::new()) }
    }

    pub fn endpoint(&self, attempt_index: usize) -> &'static str {
        let idx = attempt_index.min(CLOUDCODE_ENDPOINT_FALLBACKS.len() - 1);
        CLOUDCODE_ENDPOINT_FALLBACKS[idx]
    }

    /// Caches a thought signature for `tool_use_id`. Called by the retry engine after a
    /// successful turn whose response carried `tool_use` blocks with a signature attached.
    pub fn cache_signature(&self, tool_use_id: &str, signature: &str, now_ms: i64) {
        let mut cache = self.signature_cache.write().unwrap();
        cache.retain(|_, (_, expires_at)| *expires_at > now_ms);
        cache.insert(tool_use_id.to_string(), (signature.to_string(), now_ms + SIGNATURE_CACHE_TTL_MS));
    }

    /// Returns the cached signature for `tool_use_id`, if present and not expired.
    pub fn cached_signature(&self, tool_use_id: &str, now_ms: i64) -> Option<String> {
        let cache = self.signature_cache.read().unwrap();
        cache.get(tool_use_id).filter(|(_, expires_at)| *expires_at > now_ms).map(|(sig, _)| sig.clone())
    }

    /// Backfills any `tool_use` block in `req` that's missing its signature from the cache,
    /// so a tool-result turn still carries the signature back to Google even when the
    /// caller's own message history dropped it. Returns `None` (no clone) when nothing
    /// needs filling in, which is the common case.
    fn with_cached_signatures(&self, req: &CanonicalRequest, now_ms: i64) -> Option<CanonicalRequest> {
        let mut changed = false;
        let mut filled = req.clone();
        for message in &mut filled.messages {
            for block in &mut message.content {
                if let ContentBlock::ToolUse { id, signature, .. } = block {
                    if signature.is_none() {
                        if let Some(cached) = self.cached_signature(id, now_ms) {
                            *signature = Some(cached);
                            changed = true;
                        }
                    }
                }
            }
        }
        changed.then_some(filled)
    }

    /// Walks `CLOUDCODE_ENDPOINT_FALLBACKS` calling `loadCodeAssist`, returning the first
    /// discovered `cloudaicompanionProject`, or `DEFAULT_PROJECT_ID` if every endpoint
    /// fails. Per §4.4 this never fails the caller's request outright.
    pub async fn discover_project(&self, token: &str) -> String {
        for endpoint in CLOUDCODE_ENDPOINT_FALLBACKS {
            let url = format!("{endpoint}/v1internal:loadCodeAssist");
            let resp = self
                .client
                .post(&url)
                .bearer_auth(token)
                .json(&json!({ "metadata": {} }))
                .send()
                .await;
            let Ok(resp) = resp else { continue };
            if !resp.status().is_success() {
                continue;
            }
            let Ok(parsed) = resp.json::<LoadCodeAssistResponse>().await else { continue };
            if let Some(project) = parsed.project_id() {
                return project;
            }
        }
        tracing::warn!("google: loadCodeAssist exhausted all endpoints, using default project");
        DEFAULT_PROJECT_ID.to_string()
    }
}

#[derive(Debug, Deserialize)]
struct LoadCodeAssistResponse {
    #[serde(default, rename = "cloudaicompanionProject")]
    cloudaicompanion_project: Option<Value>,
}

impl LoadCodeAssistResponse {
    fn project_id(&self) -> Option<String> {
        match self.cloudaicompanion_project.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => map.get("id").and_then(|v| v.as_str()).map(str::to_string),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
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
            .post(GOOGLE_OAUTH.token_endpoint)
            .form(&[
                ("client_id", GOOGLE_OAUTH.client_id),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
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
            if PERMANENT_REFRESH_PATTERNS.iter().any(|p| err.contains(p)) {
                return Err(GatewayError::AuthInvalidPermanent { reason: err.clone() });
            }
            return Err(GatewayError::AuthTransient { body: err.clone() });
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

    fn build_request(&self, req: &CanonicalRequest, token: &str, project_id: Option<&str>) -> BuiltRequest {
        self.build_request_for_endpoint(req, token, project_id, 0, 0)
    }
}

impl GoogleAdapter {
    /// Same as `build_request` but targets a specific entry of `CLOUDCODE_ENDPOINT_FALLBACKS`
    /// and backfills cached thought signatures as of `now_ms`. The retry engine calls this
    /// directly so each endpoint-fallback attempt (§4.6 step 3) hits a different host without
    /// re-deriving the URL itself.
    pub fn build_request_for_endpoint(
        &self,
        req: &CanonicalRequest,
        token: &str,
        project_id: Option<&str>,
        endpoint_index: usize,
        now_ms: i64,
    ) -> BuiltRequest {
        let project = project_id.unwrap_or(DEFAULT_PROJECT_ID);
        let filled = self.with_cached_signatures(req, now_ms);
        let req = filled.as_ref().unwrap_or(req);
        let envelope = build_envelope(req, project);
        let path = if req.stream { "streamGenerateContent?alt=sse" } else { "generateContent" };
        let url = format!("{}/v1internal:{path}", self.endpoint(endpoint_index));
        let headers = vec![
            ("authorization".to_string(), format!("Bearer {token}")),
            ("content-type".to_string(), "application/json".to_string()),
        ];
        let body = serde_json::to_value(&envelope).expect("GoogleEnvelope always serializes");
        BuiltRequest { url, headers, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_falls_back_to_last_entry_past_the_list() {
        let adapter = GoogleAdapter::new();
        assert_eq!(adapter.endpoint(0), CLOUDCODE_ENDPOINT_FALLBACKS[0]);
        assert_eq!(adapter.endpoint(1), CLOUDCODE_ENDPOINT_FALLBACKS[1]);
        assert_eq!(adapter.endpoint(99), CLOUDCODE_ENDPOINT_FALLBACKS[1]);
    }

    #[test]
    fn project_id_extracted_from_bare_string() {
        let parsed: LoadCodeAssistResponse =
            serde_json::from_value(json!({ "cloudaicompanionProject": "proj-123" })).unwrap();
        assert_eq!(parsed.project_id(), Some("proj-123".to_string()));
    }

    #[test]
    fn project_id_extracted_from_nested_object() {
        let parsed: LoadCodeAssistResponse =
            serde_json::from_value(json!({ "cloudaicompanionProject": { "id": "proj-456" } })).unwrap();
        assert_eq!(parsed.project_id(), Some("proj-456".to_string()));
    }

    #[test]
    fn invalid_grant_body_is_permanent() {
        let adapter = GoogleAdapter::new();
        assert!(adapter.is_invalid_credential_error(401, "{\"error\":\"invalid_grant\"}"));
        assert!(!adapter.is_invalid_credential_error(401, "temporary glitch"));
    }

    #[test]
    fn build_request_for_endpoint_targets_requested_host() {
        let adapter = GoogleAdapter::new();
        let req = CanonicalRequest {
            model: "gemini-2.5-pro".into(),
            messages: vec![],
            system: None,
            tools: vec![],
            tool_choice: None,
            max_tokens: 100,
            thinking: None,
            temperature: None,
            top_p: None,
            stream: false,
        };
        let built = adapter.build_request_for_endpoint(&req, "tok", Some("proj-1"), 1, 0);
        assert!(built.url.starts_with(CLOUDCODE_ENDPOINT_FALLBACKS[1]));
    }

    #[test]
    fn build_request_uses_stream_path_when_requested() {
        let adapter = GoogleAdapter::new();
        let req = CanonicalRequest {
            model: "gemini-2.5-pro".into(),
            messages: vec![],
            system: None,
            tools: vec![],
            tool_choice: None,
            max_tokens: 100,
            thinking: None,
            temperature: None,
            top_p: None,
            stream: true,
        };
        let built = adapter.build_request(&req, "tok", Some("proj-1"));
        assert!(built.url.contains("streamGenerateContent"));
        assert_eq!(built.body["project"], "proj-1");
    }

    #[test]
    fn cached_signature_round_trips_within_ttl() {
        let adapter = GoogleAdapter::new();
        adapter.cache_signature("toolu_1", "sig-abc", 1_000);
        assert_eq!(adapter.cached_signature("toolu_1", 1_500), Some("sig-abc".to_string()));
    }

    #[test]
    fn cached_signature_expires_past_ttl() {
        let adapter = GoogleAdapter::new();
        adapter.cache_signature("toolu_1", "sig-abc", 1_000);
        let past_ttl = 1_000 + SIGNATURE_CACHE_TTL_MS + 1;
        assert_eq!(adapter.cached_signature("toolu_1", past_ttl), None);
    }

    #[test]
    fn build_request_for_endpoint_backfills_missing_signature_from_cache() {
        use switchboard_core::messages::Message;

        let adapter = GoogleAdapter::new();
        adapter.cache_signature("toolu_9", "cached-sig", 0);

        let req = CanonicalRequest {
            model: "gemini-2.5-pro".into(),
            messages: vec![Message::assistant(vec![ContentBlock::tool_use(
                "toolu_9",
                "get_weather",
                json!({"city": "nyc"}),
            )])],
            system: None,
            tools: vec![],
            tool_choice: None,
            max_tokens: 100,
            thinking: None,
            temperature: None,
            top_p: None,
            stream: false,
        };

        let built = adapter.build_request_for_endpoint(&req, "tok", Some("proj-1"), 0, 1_000);
        let messages = built.body["request"]["messages"].as_array().unwrap();
        let blocks = messages[0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["name"], "get_weather");
        assert_eq!(blocks[0]["signature"], "cached-sig");
    }

    #[test]
    fn build_request_for_endpoint_leaves_existing_signature_untouched() {
        use switchboard_core::messages::Message;

        let adapter = GoogleAdapter::new();
        adapter.cache_signature("toolu_9", "stale-sig", 0);

        let mut tool_use = ContentBlock::tool_use("toolu_9", "get_weather", json!({}));
        if let ContentBlock::ToolUse { signature, .. } = &mut tool_use {
            *signature = Some("fresh-sig".to_string());
        }

        let req = CanonicalRequest {
            model: "gemini-2.5-pro".into(),
            messages: vec![Message::assistant(vec![tool_use])],
            system: None,
            tools: vec![],
            tool_choice: None,
            max_tokens: 100,
            thinking: None,
            temperature: None,
            top_p: None,
            stream: false,
        };

        let built = adapter.build_request_for_endpoint(&req, "tok", Some("proj-1"), 0, 1_000);
        let messages = built.body["request"]["messages"].as_array().unwrap();
        let blocks = messages[0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["signature"], "fresh-sig");
    }
}
