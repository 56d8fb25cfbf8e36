//! Credential shapes and provider identity. Secrets are wrapped in `secrecy::SecretString`
//! so a stray `{:?}` in a log line can't leak a key or refresh token.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The seven upstream providers this gateway dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Google,
    Anthropic,
    OpenAi,
    #[serde(rename = "github")]
    GithubModels,
    Copilot,
    #[serde(rename = "openrouter")]
    OpenRouter,
    Codex,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Google => "google",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::GithubModels => "github",
            ProviderKind::Copilot => "copilot",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Codex => "codex",
        }
    }

    /// Providers whose credential is a refresh token exchanged for a short-lived access
    /// token, rather than a long-lived API key used as-is.
    pub fn uses_oauth_refresh(&self) -> bool {
        matches!(self, ProviderKind::Google | ProviderKind::Codex)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One account's credential. `google` and `codex` store a refresh token; every other
/// provider (including `copilot`, whose "key" is itself a GitHub OAuth access token) stores
/// a bearer-style API key used directly or exchanged for a session token by the adapter.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Credential {
    RefreshToken { token: SecretString },
    ApiKey { key: SecretString },
}

impl Credential {
    pub fn refresh_token(token: impl Into<String>) -> Self {
        Credential::RefreshToken { token: SecretString::from(token.into()) }
    }

    pub fn api_key(key: impl Into<String>) -> Self {
        Credential::ApiKey { key: SecretString::from(key.into()) }
    }

    pub fn expose(&self) -> &str {
        match self {
            Credential::RefreshToken { token } => token.expose_secret(),
            Credential::ApiKey { key } => key.expose_secret(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::RefreshToken { .. } => write!(f, "Credential::RefreshToken(<redacted>)"),
            Credential::ApiKey { .. } => write!(f, "Credential::ApiKey(<redacted>)"),
        }
    }
}

/// A materialized access token plus the instant it was extracted, for TTL-based caching.
#[derive(Clone)]
pub struct AccessToken {
    pub token: SecretString,
    pub extracted_at_ms: i64,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, extracted_at_ms: i64) -> Self {
        Self { token: SecretString::from(token.into()), extracted_at_ms }
    }

    pub fn expose(&self) -> &str {
        self.token.expose_secret()
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("extracted_at_ms", &self.extracted_at_ms)
            .finish()
    }
}

/// OAuth endpoints for the two refresh-token providers. Not secrets, but grouped here
/// alongside the credential types they materialize.
pub mod oauth {
    pub struct GoogleOAuthConfig {
        pub token_endpoint: &'static str,
        pub client_id: &'static str,
        pub scopes: &'static [&'static str],
        pub token_expiry_buffer_seconds: i64,
    }

    pub const GOOGLE_OAUTH: GoogleOAuthConfig = GoogleOAuthConfig {
        token_endpoint: "https://oauth2.googleapis.com/token",
        client_id: "681255809395-oo8ft2oprdrnp9e3aqf6avd6bnocd6q1.apps.googleusercontent.com",
        scopes: &["https://www.googleapis.com/auth/cloud-platform"],
        token_expiry_buffer_seconds: 300,
    };

    pub struct CodexOAuthConfig {
        pub token_endpoint: &'static str,
        pub issuer: &'static str,
        pub token_expiry_buffer_seconds: i64,
    }

    pub const CODEX_OAUTH: CodexOAuthConfig = CodexOAuthConfig {
        token_endpoint: "https://auth.openai.com/oauth/token",
        issuer: "https://auth.openai.com",
        token_expiry_buffer_seconds: 300,
    };

    /// GitHub OAuth client id used to exchange a GitHub access token for a short-lived
    /// Copilot session token. Per the spec's resolved open question, the newer of the two
    /// client ids observed in the source is authoritative.
    pub const COPILOT_GITHUB_CLIENT_ID: &str = "Ov23li8tweQw6odWQebz";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_roundtrips_through_serde() {
        for p in [
            ProviderKind::Google,
            ProviderKind::Anthropic,
            ProviderKind::OpenAi,
            ProviderKind::GithubModels,
            ProviderKind::Copilot,
            ProviderKind::OpenRouter,
            ProviderKind::Codex,
        ] {
            let json = serde_json::to_string(&p).unwrap();
            let back: ProviderKind = serde_json::from_str(&json).unwrap();
            assert_eq!(p.as_str(), back.as_str());
        }
    }

    #[test]
    fn provider_kind_uses_spec_wire_names() {
        assert_eq!(serde_json::to_string(&ProviderKind::GithubModels).unwrap(), "\"github\"");
        assert_eq!(serde_json::to_string(&ProviderKind::OpenRouter).unwrap(), "\"openrouter\"");
        assert_eq!(serde_json::to_string(&ProviderKind::OpenAi).unwrap(), "\"openai\"");
    }

    #[test]
    fn oauth_refresh_providers() {
        assert!(ProviderKind::Google.uses_oauth_refresh());
        assert!(ProviderKind::Codex.uses_oauth_refresh());
        assert!(!ProviderKind::Anthropic.uses_oauth_refresh());
    }

    #[test]
    fn credential_debug_never_prints_secret() {
        let cred = Credential::api_key("sk-super-secret-value");
        let debug = format!("{cred:?}");
        assert!(!debug.contains("sk-super-secret-value"));
    }

    #[test]
    fn credential_expose_returns_raw_value() {
        let cred = Credential::refresh_token("rt-123");
        assert_eq!(cred.expose(), "rt-123");
    }

    #[test]
    fn access_token_debug_redacts() {
        let tok = AccessToken::new("ya29.secret", 1000);
        let debug = format!("{tok:?}");
        assert!(!debug.contains("ya29.secret"));
        assert!(debug.contains("1000"));
    }
}
