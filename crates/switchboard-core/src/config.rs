//! Named configuration keys from §6, collected into one struct with defaults matching the
//! spec table, plus a thin `GATEWAY_*` environment overlay for the handful of knobs an
//! operator actually needs to flip without editing the account store file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountSelectionStrategy {
    Sticky,
    RoundRobin,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub port: u16,
    pub token_cache_ttl_ms: i64,
    pub max_retries: u32,
    pub max_empty_response_retries: u32,
    pub default_cooldown_ms: i64,
    pub max_wait_before_error_ms: i64,
    pub max_consecutive_failures: u32,
    pub extended_cooldown_ms: i64,
    pub capacity_backoff_tiers_ms: Vec<u64>,
    pub max_capacity_retries: u32,
    pub max_total_retry_time_ms: i64,
    pub upstream_request_timeout_ms: u64,
    pub rate_limit_dedup_window_ms: i64,
    pub first_retry_delay_ms: u64,
    pub account_selection_strategy: AccountSelectionStrategy,
    pub min_backoff_ms: u64,
    pub account_store_path: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8787,
            token_cache_ttl_ms: 15 * 60 * 1000,
            max_retries: 3,
            max_empty_response_retries: 2,
            default_cooldown_ms: 10_000,
            max_wait_before_error_ms: 120_000,
            max_consecutive_failures: 3,
            extended_cooldown_ms: 60_000,
            capacity_backoff_tiers_ms: vec![5_000, 10_000, 20_000, 30_000, 60_000],
            max_capacity_retries: 5,
            max_total_retry_time_ms: 600_000,
            upstream_request_timeout_ms: 120_000,
            rate_limit_dedup_window_ms: 2_000,
            first_retry_delay_ms: 1_000,
            account_selection_strategy: AccountSelectionStrategy::Hybrid,
            min_backoff_ms: 2_000,
            account_store_path: default_account_store_path(),
        }
    }
}

impl GatewayConfig {
    /// Apply `GATEWAY_*` env var overrides on top of the defaults. Unset vars leave the
    /// default untouched; unparsable values are ignored (logged by the caller, not here,
    /// since this crate doesn't depend on a logging facade).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("GATEWAY_PORT") {
            if let Ok(p) = v.parse() {
                cfg.port = p;
            }
        }
        if let Ok(v) = std::env::var("GATEWAY_ACCOUNT_STORE_PATH") {
            cfg.account_store_path = v;
        }
        if let Ok(v) = std::env::var("GATEWAY_UPSTREAM_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                cfg.upstream_request_timeout_ms = ms;
            }
        }
        cfg
    }

    pub fn upstream_request_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_request_timeout_ms)
    }

    pub fn max_total_retry_time(&self) -> Duration {
        Duration::from_millis(self.max_total_retry_time_ms.max(0) as u64)
    }
}

fn default_account_store_path() -> String {
    std::env::var("HOME")
        .map(|home| format!("{home}/.switchboard/accounts.json"))
        .unwrap_or_else(|_| "/tmp/.switchboard/accounts.json".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.max_empty_response_retries, 2);
        assert_eq!(cfg.default_cooldown_ms, 10_000);
        assert_eq!(cfg.max_wait_before_error_ms, 120_000);
        assert_eq!(cfg.max_consecutive_failures, 3);
        assert_eq!(cfg.extended_cooldown_ms, 60_000);
        assert_eq!(cfg.capacity_backoff_tiers_ms, vec![5_000, 10_000, 20_000, 30_000, 60_000]);
        assert_eq!(cfg.max_capacity_retries, 5);
        assert_eq!(cfg.max_total_retry_time_ms, 600_000);
        assert_eq!(cfg.rate_limit_dedup_window_ms, 2_000);
        assert_eq!(cfg.first_retry_delay_ms, 1_000);
        assert_eq!(cfg.min_backoff_ms, 2_000);
        assert_eq!(cfg.account_selection_strategy, AccountSelectionStrategy::Hybrid);
    }

    #[test]
    fn env_overlay_overrides_port() {
        std::env::set_var("GATEWAY_PORT", "9999");
        let cfg = GatewayConfig::from_env();
        assert_eq!(cfg.port, 9999);
        std::env::remove_var("GATEWAY_PORT");
    }

    #[test]
    fn unparsable_env_value_is_ignored() {
        std::env::set_var("GATEWAY_PORT", "not-a-number");
        let cfg = GatewayConfig::from_env();
        assert_eq!(cfg.port, GatewayConfig::default().port);
        std::env::remove_var("GATEWAY_PORT");
    }
}
