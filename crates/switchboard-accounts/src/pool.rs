//! The account pool (C5, §4.5): selection strategies, rate-limit/invalid mutation, token
//! and project caches, all behind one mutex so mutations are linearizable (§5). Persistence
//! flows through the injected `AccountStore` on every mutating call.

use std::collections::HashMap;
use std::sync::Arc;

use switchboard_core::security::ProviderKind;
use switchboard_core::{AccountSelectionStrategy, Clock, Credential, GatewayConfig, GatewayError};
use switchboard_providers::AdapterRegistry;
use tokio::sync::Mutex;

use crate::account::{Account, PoolSnapshot};
use crate::store::{AccountStore, AccountsError};

/// Result of asking the pool for an account to use on the next attempt for `model_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Use this account, identified by email.
    Account(String),
    /// No account is immediately usable, but one becomes available within this many ms —
    /// the caller should sleep and ask again (sticky strategy only, §4.5).
    Wait(i64),
    /// Nothing is usable right now and no near-term wait is worth recommending.
    None,
}

struct TokenCacheEntry {
    token: String,
    extracted_at_ms: i64,
}

struct PoolState {
    snapshot: PoolSnapshot,
    token_cache: HashMap<String, TokenCacheEntry>,
    project_cache: HashMap<String, String>,
    /// Dedup window for `mark_rate_limited`, keyed by (email, model_id). §4.5/§5.
    rate_limit_dedup: HashMap<(String, Option<String>), i64>,
}

pub struct AccountPool {
    store: Arc<dyn AccountStore>,
    registry: Arc<AdapterRegistry>,
    clock: Arc<dyn Clock>,
    config: GatewayConfig,
    state: Mutex<PoolState>,
}

impl AccountPool {
    pub async fn load(
        store: Arc<dyn AccountStore>,
        registry: Arc<AdapterRegistry>,
        clock: Arc<dyn Clock>,
        config: GatewayConfig,
    ) -> Result<Self, AccountsError> {
        let snapshot = store.load().await?;
        Ok(Self {
            store,
            registry,
            clock,
            config,
            state: Mutex::new(PoolState {
                snapshot,
                token_cache: HashMap::new(),
                project_cache: HashMap::new(),
                rate_limit_dedup: HashMap::new(),
            }),
        })
    }

    pub async fn account_count(&self) -> usize {
        self.state.lock().await.snapshot.accounts.len()
    }

    /// Selects an account for `model_id` per the configured strategy (§4.5). Callers
    /// implementing the retry loop (§4.6) turn `Selection::Wait` into a sleep-then-retry and
    /// `Selection::None` into either `NoAccountsAvailable` or moving to the next attempt.
    pub async fn select(&self, model_id: &str) -> Selection {
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock().await;
        let changed = clear_expired_locked(&mut state.snapshot.accounts, now_ms);
        let strategy = state.snapshot.settings.account_selection.strategy;
        let selection = select_locked(&mut state.snapshot, strategy, model_id, now_ms, self.config.max_wait_before_error_ms);
        if changed {
            let snapshot = state.snapshot.clone();
            drop(state);
            let _ = self.store.save(&snapshot).await;
        }
        selection
    }

    /// `markRateLimited` (§4.5). `reset_ms` missing defaults to the configured cooldown.
    pub async fn mark_rate_limited(&self, email: &str, reset_ms: Option<i64>, model_id: Option<&str>) {
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock().await;

        let dedup_key = (email.to_string(), model_id.map(str::to_string));
        if let Some(&last) = state.rate_limit_dedup.get(&dedup_key) {
            if now_ms - last < self.config.rate_limit_dedup_window_ms {
                tracing::debug!(email, ?model_id, "rate-limit event deduped within window");
                return;
            }
        }
        state.rate_limit_dedup.insert(dedup_key, now_ms);

        let cooldown = self.config.default_cooldown_ms;
        let max_consecutive = self.config.max_consecutive_failures;
        let extended = self.config.extended_cooldown_ms;

        let Some(account) = find_account_mut(&mut state.snapshot.accounts, email) else { return };
        let mut effective_reset = reset_ms.unwrap_or(now_ms + cooldown);
        account.consecutive_failures += 1;
        account.last_failure_ms = Some(now_ms);
        if account.consecutive_failures >= max_consecutive {
            effective_reset = effective_reset.max(now_ms + extended);
        }

        match model_id {
            Some(m) => {
                account.model_rate_limits.insert(m.to_string(), effective_reset);
            }
            None => {
                account.rate_limit_reset_time_ms = Some(effective_reset);
                account.is_rate_limited_hint = Some(true);
            }
        }

        let snapshot = state.snapshot.clone();
        drop(state);
        let _ = self.store.save(&snapshot).await;
    }

    /// `markInvalid` (§4.5). The account stays in the pool but is never selected again
    /// until the (external) admin surface re-enables it.
    pub async fn mark_invalid(&self, email: &str, reason: impl Into<String>) {
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock().await;
        let reason = reason.into();
        if let Some(account) = find_account_mut(&mut state.snapshot.accounts, email) {
            account.is_invalid = true;
            account.invalid_reason = Some(reason);
            account.invalid_at_ms = Some(now_ms);
        }
        state.token_cache.remove(email);
        state.project_cache.remove(email);
        let snapshot = state.snapshot.clone();
        drop(state);
        let _ = self.store.save(&snapshot).await;
    }

    /// `notifySuccess` (§4.5): clears this model's cooldown, any expired global cooldown,
    /// resets the failure streak, and clears `isInvalid` if it had been set.
    pub async fn notify_success(&self, email: &str, model_id: &str) {
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock().await;
        if let Some(account) = find_account_mut(&mut state.snapshot.accounts, email) {
            account.model_rate_limits.remove(model_id);
            if account.rate_limit_reset_time_ms.is_some_and(|r| r <= now_ms) {
                account.rate_limit_reset_time_ms = None;
                account.is_rate_limited_hint = Some(false);
            }
            account.consecutive_failures = 0;
            account.is_invalid = false;
            account.invalid_reason = None;
            account.last_used_ms = now_ms;
        }
        let snapshot = state.snapshot.clone();
        drop(state);
        let _ = self.store.save(&snapshot).await;
    }

    /// Materializes a usable access token for `email`, serving from the TTL cache when
    /// fresh. On `AuthInvalidPermanent` the cache entry is evicted and the caller is
    /// expected to call `mark_invalid`; on any other error it's evicted and re-thrown as
    /// transient so the retry engine moves on.
    pub async fn get_token(&self, email: &str) -> Result<String, GatewayError> {
        let now_ms = self.clock.now_ms();
        let ttl = self.config.token_cache_ttl_ms;

        {
            let state = self.state.lock().await;
            if let Some(entry) = state.token_cache.get(email) {
                if entry.extracted_at_ms + ttl > now_ms {
                    return Ok(entry.token.clone());
                }
            }
        }

        let (provider, credential) = {
            let state = self.state.lock().await;
            let account = find_account(&state.snapshot.accounts, email)
                .ok_or(GatewayError::NoAccountsAvailable)?;
            (account.provider, credential_for(account)?)
        };

        let adapter = self.registry.get(provider);
        let result = adapter.access_token(email, &credential).await;

        let mut state = self.state.lock().await;
        match &result {
            Ok(token) => {
                state.token_cache.insert(
                    email.to_string(),
                    TokenCacheEntry { token: token.clone(), extracted_at_ms: now_ms },
                );
            }
            Err(_) => {
                state.token_cache.remove(email);
            }
        }
        result
    }

    /// Returns the cached/stored project id for a google account, discovering one via
    /// `loadCodeAssist` on first use (§4.4). Not applicable to non-google accounts.
    pub async fn get_project_id(&self, email: &str, token: &str) -> Option<String> {
        {
            let state = self.state.lock().await;
            if let Some(project) = state.project_cache.get(email) {
                return Some(project.clone());
            }
            if let Some(account) = find_account(&state.snapshot.accounts, email) {
                if let Some(project) = &account.project_id {
                    return Some(project.clone());
                }
            }
        }

        let discovered = self.registry.google().discover_project(token).await;
        let mut state = self.state.lock().await;
        state.project_cache.insert(email.to_string(), discovered.clone());
        Some(discovered)
    }

    /// Evicts the cached project id for `email`, e.g. after a 401 (§3 lifecycle).
    pub async fn evict_project(&self, email: &str) {
        self.state.lock().await.project_cache.remove(email);
    }

    /// Snapshot of one account's static fields (provider, custom endpoint). The retry engine
    /// needs these to dispatch the HTTP call; everything mutable goes through the methods
    /// above instead of this clone.
    pub async fn account(&self, email: &str) -> Option<Account> {
        find_account(&self.state.lock().await.snapshot.accounts, email).cloned()
    }
}

fn credential_for(account: &Account) -> Result<Credential, GatewayError> {
    if let Some(token) = &account.refresh_token {
        return Ok(Credential::refresh_token(token.clone()));
    }
    if let Some(key) = &account.api_key {
        return Ok(Credential::api_key(key.clone()));
    }
    Err(GatewayError::AuthInvalidPermanent { reason: "account has no usable credential".into() })
}

fn find_account<'a>(accounts: &'a [Account], email: &str) -> Option<&'a Account> {
    accounts.iter().find(|a| a.email == email)
}

fn find_account_mut<'a>(accounts: &'a mut [Account], email: &str) -> Option<&'a mut Account> {
    accounts.iter_mut().find(|a| a.email == email)
}

fn clear_expired_locked(accounts: &mut [Account], now_ms: i64) -> bool {
    let mut changed = false;
    for account in accounts.iter_mut() {
        if account.clear_expired(now_ms) {
            changed = true;
        }
    }
    changed
}

/// `pickNext`: scan forward from `active_index`, return the first available account and
/// commit it as the new active index.
fn pick_next_locked(snapshot: &mut PoolSnapshot, model_id: &str, now_ms: i64) -> Option<String> {
    let n = snapshot.accounts.len();
    if n == 0 {
        return None;
    }
    for step in 1..=n {
        let idx = (snapshot.active_index as usize + step) % n;
        if snapshot.accounts[idx].is_available(model_id, now_ms) {
            snapshot.active_index = idx as i64;
            snapshot.accounts[idx].last_used_ms = now_ms;
            return Some(snapshot.accounts[idx].email.clone());
        }
    }
    None
}

fn select_locked(
    snapshot: &mut PoolSnapshot,
    strategy: AccountSelectionStrategy,
    model_id: &str,
    now_ms: i64,
    max_wait_before_error_ms: i64,
) -> Selection {
    let n = snapshot.accounts.len();
    if n == 0 {
        return Selection::None;
    }

    match strategy {
        AccountSelectionStrategy::RoundRobin => match pick_next_locked(snapshot, model_id, now_ms) {
            Some(email) => Selection::Account(email),
            None => Selection::None,
        },
        AccountSelectionStrategy::Sticky => {
            let active = snapshot.active_index as usize % n;
            if snapshot.accounts[active].is_available(model_id, now_ms) {
                snapshot.accounts[active].last_used_ms = now_ms;
                return Selection::Account(snapshot.accounts[active].email.clone());
            }
            if let Some(email) = pick_next_locked(snapshot, model_id, now_ms) {
                return Selection::Account(email);
            }
            match min_wait_ms(&snapshot.accounts, model_id, now_ms) {
                Some(wait) if wait <= max_wait_before_error_ms => Selection::Wait(wait),
                _ => Selection::None,
            }
        }
        AccountSelectionStrategy::Hybrid => {
            let active = snapshot.active_index as usize % n;
            if snapshot.accounts[active].is_available(model_id, now_ms) {
                snapshot.accounts[active].last_used_ms = now_ms;
                return Selection::Account(snapshot.accounts[active].email.clone());
            }
            match pick_next_locked(snapshot, model_id, now_ms) {
                Some(email) => Selection::Account(email),
                None => Selection::None,
            }
        }
    }
}

/// Smallest `next_available_ms` across all accounts, relative to `now_ms`, or `None` if
/// every account is permanently unavailable (invalid/disabled).
fn min_wait_ms(accounts: &[Account], model_id: &str, now_ms: i64) -> Option<i64> {
    accounts
        .iter()
        .filter_map(|a| a.next_available_ms(model_id))
        .map(|at| (at - now_ms).max(0))
        .min()
}
