//! `Account` and the pool snapshot it lives in, serde-shaped to match §6's persisted JSON
//! schema field-for-field (camelCase on the wire, unknown fields preserved via `extra`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use switchboard_core::security::ProviderKind;
use switchboard_core::AccountSelectionStrategy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub email: String,
    pub provider: ProviderKind,
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, rename = "refreshToken", skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, rename = "apiKey", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, rename = "customApiEndpoint", skip_serializing_if = "Option::is_none")]
    pub custom_api_endpoint: Option<String>,

    #[serde(default, rename = "projectId", skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    #[serde(rename = "addedAt")]
    pub added_at_ms: i64,
    #[serde(rename = "lastUsed")]
    pub last_used_ms: i64,

    #[serde(default, rename = "isInvalid")]
    pub is_invalid: bool,
    #[serde(default, rename = "invalidReason", skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    #[serde(default, rename = "invalidAt", skip_serializing_if = "Option::is_none")]
    pub invalid_at_ms: Option<i64>,

    #[serde(default, rename = "modelRateLimits")]
    pub model_rate_limits: HashMap<String, i64>,
    #[serde(default, rename = "rateLimitResetTime", skip_serializing_if = "Option::is_none")]
    pub rate_limit_reset_time_ms: Option<i64>,
    #[serde(default, rename = "isRateLimited", skip_serializing_if = "Option::is_none")]
    pub is_rate_limited_hint: Option<bool>,
    #[serde(default, rename = "consecutiveFailures")]
    pub consecutive_failures: u32,
    #[serde(default, rename = "lastFailureMs", skip_serializing_if = "Option::is_none")]
    pub last_failure_ms: Option<i64>,

    /// Advisory-only (`oauth|manual|database`); `provider` is always authoritative for
    /// adapter resolution per §9.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<Value>,

    /// Anything this schema doesn't name explicitly, preserved verbatim on save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl Account {
    /// True iff either the global cooldown or this model's per-model cooldown is still in
    /// the future.
    pub fn is_rate_limited(&self, model_id: &str, now_ms: i64) -> bool {
        if self.rate_limit_reset_time_ms.is_some_and(|reset| reset > now_ms) {
            return true;
        }
        self.model_rate_limits.get(model_id).is_some_and(|&reset| reset > now_ms)
    }

    /// `enabled ∧ ¬isInvalid ∧ ¬isRateLimited`.
    pub fn is_available(&self, model_id: &str, now_ms: i64) -> bool {
        self.enabled && !self.is_invalid && !self.is_rate_limited(model_id, now_ms)
    }

    /// Drops any `modelRateLimits` entries whose reset has already passed, and clears the
    /// global reset if it has passed. Returns true if anything changed (callers use this to
    /// decide whether a persistence pass is needed).
    pub fn clear_expired(&mut self, now_ms: i64) -> bool {
        let mut changed = false;
        if let Some(reset) = self.rate_limit_reset_time_ms {
            if reset <= now_ms {
                self.rate_limit_reset_time_ms = None;
                self.is_rate_limited_hint = Some(false);
                changed = true;
            }
        }
        let before = self.model_rate_limits.len();
        self.model_rate_limits.retain(|_, &mut reset| reset > now_ms);
        if self.model_rate_limits.len() != before {
            changed = true;
        }
        changed
    }

    /// Earliest moment, in epoch ms, at which this account becomes available for
    /// `model_id`, or `None` if it is invalid/disabled (no amount of waiting helps).
    pub fn next_available_ms(&self, model_id: &str) -> Option<i64> {
        if !self.enabled || self.is_invalid {
            return None;
        }
        let global = self.rate_limit_reset_time_ms.unwrap_or(0);
        let per_model = self.model_rate_limits.get(model_id).copied().unwrap_or(0);
        Some(global.max(per_model))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSelectionSettings {
    pub strategy: AccountSelectionStrategy,
}

impl Default for AccountSelectionSettings {
    fn default() -> Self {
        Self { strategy: AccountSelectionStrategy::Hybrid }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_cooldown", rename = "cooldownDurationMs")]
    pub cooldown_duration_ms: i64,
    #[serde(default, rename = "maxAccounts", skip_serializing_if = "Option::is_none")]
    pub max_accounts: Option<u32>,
    #[serde(default, rename = "accountSelection")]
    pub account_selection: AccountSelectionSettings,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_cooldown() -> i64 {
    10_000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cooldown_duration_ms: default_cooldown(),
            max_accounts: None,
            account_selection: AccountSelectionSettings::default(),
            extra: Map::new(),
        }
    }
}

/// The whole persisted pool, round-tripped through `AccountStore`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSnapshot {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default, rename = "activeIndex")]
    pub active_index: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(email: &str) -> Account {
        Account {
            email: email.to_string(),
            provider: ProviderKind::Anthropic,
            enabled: true,
            refresh_token: None,
            api_key: Some("sk-x".into()),
            custom_api_endpoint: None,
            project_id: None,
            added_at_ms: 0,
            last_used_ms: 0,
            is_invalid: false,
            invalid_reason: None,
            invalid_at_ms: None,
            model_rate_limits: HashMap::new(),
            rate_limit_reset_time_ms: None,
            is_rate_limited_hint: None,
            consecutive_failures: 0,
            last_failure_ms: None,
            source: None,
            subscription: None,
            quota: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn unknown_fields_round_trip() {
        let json = serde_json::json!({
            "email": "a@b.com",
            "provider": "anthropic",
            "addedAt": 0,
            "lastUsed": 0,
            "futureField": "keep me",
        });
        let acc: Account = serde_json::from_value(json).unwrap();
        let back = serde_json::to_value(&acc).unwrap();
        assert_eq!(back["futureField"], "keep me");
    }

    #[test]
    fn global_rate_limit_in_future_blocks_availability() {
        let mut acc = account("a@b.com");
        acc.rate_limit_reset_time_ms = Some(1_000);
        assert!(acc.is_rate_limited("gpt-4", 500));
        assert!(!acc.is_available("gpt-4", 500));
    }

    #[test]
    fn per_model_limit_does_not_block_other_models() {
        let mut acc = account("a@b.com");
        acc.model_rate_limits.insert("gpt-4".into(), 1_000);
        assert!(acc.is_rate_limited("gpt-4", 500));
        assert!(!acc.is_rate_limited("gpt-5", 500));
    }

    #[test]
    fn clear_expired_prunes_past_entries_only() {
        let mut acc = account("a@b.com");
        acc.model_rate_limits.insert("expired".into(), 100);
        acc.model_rate_limits.insert("still-limited".into(), 5_000);
        let changed = acc.clear_expired(1_000);
        assert!(changed);
        assert!(!acc.model_rate_limits.contains_key("expired"));
        assert!(acc.model_rate_limits.contains_key("still-limited"));
    }

    #[test]
    fn disabled_account_has_no_next_available_time() {
        let mut acc = account("a@b.com");
        acc.enabled = false;
        assert_eq!(acc.next_available_ms("gpt-4"), None);
    }

    #[test]
    fn invalid_account_never_available_regardless_of_rate_limit() {
        let mut acc = account("a@b.com");
        acc.is_invalid = true;
        assert!(!acc.is_available("gpt-4", 0));
    }
}
