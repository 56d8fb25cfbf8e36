pub mod anthropic_openai;
pub mod copilot;
pub mod google;
pub mod native;

pub use anthropic_openai::{build_request_body, convert_response, is_reasoning_capable, StreamTranslator};
pub use copilot::{normalize, NormalizeResult};
pub use native::NativeAnthropicStreamTranslator;
