//! Serde shapes for the OpenAI-chat wire format, both non-stream responses and SSE deltas.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiChatResponse {
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<UsageWire>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: ChoiceMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallWire>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallWire {
    pub id: String,
    pub function: FunctionWire,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionWire {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct UsageWire {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiStreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub usage: Option<UsageWire>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: StreamDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDeltaWire>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallDeltaWire {
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDeltaWire>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionDeltaWire {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// Maps an OpenAI `finish_reason` to the canonical `StopReason`.
pub fn map_finish_reason(reason: &str) -> switchboard_core::StopReason {
    use switchboard_core::StopReason;
    match reason {
        "stop" => StopReason::EndTurn,
        "length" => StopReason::MaxTokens,
        "tool_calls" => StopReason::ToolUse,
        "content_filter" => StopReason::EndTurn,
        _ => StopReason::EndTurn,
    }
}
