//! Time source and backoff computation. `Clock` is injected everywhere a wait is needed so
//! tests can use `tokio::time::{pause, advance}` instead of real sleeps.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

/// Minimum wait applied to any computed backoff, to prevent busy loops.
pub const MIN_BACKOFF: Duration = Duration::from_secs(2);

/// Progressive schedule used specifically for `ModelCapacityExhausted`, capped at 5 tries.
pub const CAPACITY_TIER_SCHEDULE_MS: [u64; 5] = [5_000, 10_000, 20_000, 30_000, 60_000];

#[async_trait]
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;

    /// Sleep for `duration`. Callers that need cancellation compose this with
    /// `tokio::select!` against their own cancellation signal.
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Backoff tier keyed by error kind, per §4.1/§7. `Unknown` is the catch-all for kinds with
/// no specific tier (e.g. a freshly classified error the table doesn't special-case).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    RateLimit,
    ModelCapacityExhausted,
    ServerError,
    Unknown,
}

impl BackoffKind {
    pub fn base_delay(&self) -> Duration {
        match self {
            BackoffKind::RateLimit => Duration::from_secs(30),
            BackoffKind::ModelCapacityExhausted => Duration::from_secs(15),
            BackoffKind::ServerError => Duration::from_secs(20),
            BackoffKind::Unknown => Duration::from_secs(60),
        }
    }
}

/// The capacity-retry schedule indexed by (zero-based) attempt number, capped at the last
/// tier once `attempt >= CAPACITY_TIER_SCHEDULE_MS.len()`.
pub fn capacity_tier_delay(attempt: usize) -> Duration {
    let idx = attempt.min(CAPACITY_TIER_SCHEDULE_MS.len() - 1);
    Duration::from_millis(CAPACITY_TIER_SCHEDULE_MS[idx])
}

/// Applies the 2s floor.
pub fn with_floor(d: Duration) -> Duration {
    d.max(MIN_BACKOFF)
}

/// Adds +/- `factor` proportional jitter (e.g. `factor=0.2` => up to 20% in either
/// direction), then applies the minimum floor.
pub fn jitter(base: Duration, factor: f64) -> Duration {
    let base_ms = base.as_millis() as f64;
    let span = base_ms * factor;
    let delta = rand::thread_rng().gen_range(-span..=span);
    let jittered_ms = (base_ms + delta).max(0.0);
    with_floor(Duration::from_millis(jittered_ms as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn system_clock_sleep_actually_waits() {
        tokio::time::pause();
        let clock = SystemClock;
        let start = clock.now_ms();
        let sleep = clock.sleep(Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(5)).await;
        sleep.await;
        // paused clock doesn't advance now_ms() (it's wall-clock, not tokio's clock) but the
        // sleep future must still resolve once virtual time has advanced past it.
        let _ = start;
    }

    #[test]
    fn capacity_tier_progresses_then_caps() {
        assert_eq!(capacity_tier_delay(0), Duration::from_millis(5_000));
        assert_eq!(capacity_tier_delay(4), Duration::from_millis(60_000));
        assert_eq!(capacity_tier_delay(99), Duration::from_millis(60_000));
    }

    #[test]
    fn backoff_tiers_match_spec_table() {
        assert_eq!(BackoffKind::RateLimit.base_delay(), Duration::from_secs(30));
        assert_eq!(BackoffKind::ModelCapacityExhausted.base_delay(), Duration::from_secs(15));
        assert_eq!(BackoffKind::ServerError.base_delay(), Duration::from_secs(20));
        assert_eq!(BackoffKind::Unknown.base_delay(), Duration::from_secs(60));
    }

    #[test]
    fn floor_is_applied_to_tiny_durations() {
        assert_eq!(with_floor(Duration::from_millis(10)), MIN_BACKOFF);
        assert_eq!(with_floor(Duration::from_secs(10)), Duration::from_secs(10));
    }

    #[test]
    fn jitter_never_drops_below_floor() {
        for _ in 0..100 {
            let d = jitter(Duration::from_millis(500), 0.9);
            assert!(d >= MIN_BACKOFF);
        }
    }

    #[test]
    fn jitter_stays_within_expected_band_above_floor() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let d = jitter(base, 0.2);
            assert!(d.as_millis() <= 12_000);
            assert!(d.as_millis() >= 8_000);
        }
    }
}
