pub mod adapter;
pub mod api_key;
pub mod codex;
pub mod copilot;
pub mod google;
pub mod registry;

pub use adapter::{BuiltRequest, ProviderAdapter, RateLimitHint, ValidateOutcome};
pub use registry::AdapterRegistry;
