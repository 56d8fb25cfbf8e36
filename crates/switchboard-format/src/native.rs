//! Native Anthropic wire (de)serialization (§4.3, anthropic passthrough path). Anthropic's
//! own SSE events and response body are close to `CanonicalEvent`/`CanonicalResponse` but
//! not identical: `content_block_start` carries its payload under `content_block`, not
//! `block`, and `message_delta` nests `stop_reason` under a `delta` object with a
//! partial `usage` that only carries `output_tokens`. This module reshapes those two
//! instead of deserializing the canonical types directly.

use serde::Deserialize;
use switchboard_core::messages::{CanonicalResponse, ContentBlock, StopReason, Usage};
use switchboard_core::stream::{CanonicalEvent, ContentBlockDelta};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicWireEvent {
    MessageStart {
        #[serde(default)]
        message: serde_json::Value,
    },
    Ping,
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: ContentBlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: MessageDeltaInner,
        #[serde(default)]
        usage: Option<PartialUsage>,
    },
    MessageStop,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MessageDeltaInner {
    #[serde(default)]
    stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct PartialUsage {
    #[serde(default)]
    output_tokens: u32,
}

/// Feeds one `data:` payload at a time (prefix already stripped), returns the canonical
/// events it maps to. Five of six event kinds pass through field-for-field; `message_delta`
/// is the only one that needs reshaping.
#[derive(Debug, Default)]
pub struct NativeAnthropicStreamTranslator {
    usage: Usage,
    saw_stop: bool,
}

impl NativeAnthropicStreamTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &str) -> Vec<CanonicalEvent> {
        let Ok(event) = serde_json::from_str::<AnthropicWireEvent>(data) else {
            return Vec::new();
        };
        match event {
            AnthropicWireEvent::MessageStart { .. } => vec![CanonicalEvent::MessageStart],
            AnthropicWireEvent::Ping | AnthropicWireEvent::Unknown => Vec::new(),
            AnthropicWireEvent::ContentBlockStart { index, content_block } => {
                vec![CanonicalEvent::ContentBlockStart { index, block: content_block }]
            }
            AnthropicWireEvent::ContentBlockDelta { index, delta } => {
                vec![CanonicalEvent::ContentBlockDelta { index, delta }]
            }
            AnthropicWireEvent::ContentBlockStop { index } => {
                vec![CanonicalEvent::ContentBlockStop { index }]
            }
            AnthropicWireEvent::MessageDelta { delta, usage } => {
                if let Some(u) = usage {
                    self.usage.output_tokens = u.output_tokens;
                }
                let stop_reason = delta.stop_reason.unwrap_or(StopReason::EndTurn);
                vec![CanonicalEvent::MessageDelta { stop_reason, usage: self.usage }]
            }
            AnthropicWireEvent::MessageStop => {
                self.saw_stop = true;
                vec![CanonicalEvent::MessageStop]
            }
        }
    }

    /// Synthesizes a clean close if the upstream connection ended before `message_stop`
    /// arrived (idle timeout, dropped socket). A no-op once `message_stop` was already seen.
    pub fn finish_without_reason(&mut self) -> Vec<CanonicalEvent> {
        if self.saw_stop {
            return Vec::new();
        }
        self.saw_stop = true;
        vec![
            CanonicalEvent::MessageDelta { stop_reason: StopReason::EndTurn, usage: self.usage },
            CanonicalEvent::MessageStop,
        ]
    }
}

#[derive(Debug, Clone, Deserialize)]
struct NativeAnthropicResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<StopReason>,
    #[serde(default)]
    usage: NativeUsagePayload,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct NativeUsagePayload {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    #[serde(default)]
    cache_read_input_tokens: Option<u32>,
}

/// Parses a non-stream native Anthropic response body. `model` is threaded through from the
/// request rather than trusted from the wire, matching `google::convert_response` and
/// `anthropic_openai::convert_response`.
pub fn parse_response(model: &str, body: &str) -> Result<CanonicalResponse, serde_json::Error> {
    let parsed: NativeAnthropicResponse = serde_json::from_str(body)?;
    Ok(CanonicalResponse {
        model: model.to_string(),
        content: parsed.content,
        stop_reason: parsed.stop_reason.unwrap_or(StopReason::EndTurn),
        usage: Usage {
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
            cache_read_input_tokens: parsed.usage.cache_read_input_tokens,
        },
    })
}
