//! Structured logging init, trimmed from the teacher's telemetry crate: the SQLite log sink
//! and metrics recorder are dropped (a metrics pipeline is an explicit Non-goal per §1), but
//! plain `tracing`-based structured logging is ambient infrastructure every component uses
//! and is kept per the teacher's own pattern.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by the `RUST_LOG` env var when set.
    pub log_level: Level,
    /// Per-module level overrides (e.g. `"switchboard_engine" => DEBUG`).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON-formatted log lines instead of the human-readable default.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { log_level: Level::INFO, module_levels: Vec::new(), json: true }
    }
}

/// Initialize the telemetry subsystem. Call once at startup; returns nothing to hold since
/// there is no background sink to flush (see module docs for what was trimmed).
pub fn init_telemetry(config: TelemetryConfig) {
    let mut filter_str = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    if config.json {
        let fmt_layer = tracing_subscriber::fmt::layer().json().with_target(true);
        tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
        tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
    }
}
