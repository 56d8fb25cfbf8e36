//! Canonical (Anthropic-shaped) request/response types. These are the wire shape the
//! ingress layer speaks and the shape every provider adapter translates to/from.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn in the conversation. `system` is carried separately on `CanonicalRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self { role: Role::User, content }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self { role: Role::Assistant, content }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![ContentBlock::Text { text: text.into(), cache_control: None }])
    }
}

/// Tagged union over the block kinds the translator and pool need to distinguish.
/// Unknown/forward-compatible fields are not modeled; this is the canonical core shape,
/// not a passthrough of arbitrary Anthropic JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },
    Thinking {
        thinking: String,
        /// Opaque attestation token. Google Cloud Code requires this be carried back
        /// verbatim on the next tool-result turn when >= 50 chars.
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
        /// Google Cloud Code's thought signature attesting the preceding reasoning, carried
        /// alongside the tool call it belongs to so it can be replayed on the next turn
        /// (§9 glossary "Thought signature"). `None` for every other provider.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Image {
        media_type: String,
        data: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into(), cache_control: None }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        ContentBlock::ToolUse { id: id.into(), name: name.into(), input, signature: None }
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, ContentBlock::ToolResult { .. })
    }

    pub fn is_thinking(&self) -> bool {
        matches!(self, ContentBlock::Thinking { .. })
    }
}

/// `system` may be a bare string or an array of text blocks (with optional cache_control).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<Value>,
}

impl SystemPrompt {
    /// Flatten to the single joined string the OpenAI-chat translator emits as one
    /// leading `role=system` message.
    pub fn flatten(&self) -> String {
        match self {
            SystemPrompt::Text(s) => s.clone(),
            SystemPrompt::Blocks(blocks) => {
                blocks.iter().map(|b| b.text.as_str()).collect::<Vec<_>>().join("\n")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    Any,
    Tool { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    StopSequence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub kind: ThinkingKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingKind {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stream: bool,
}

impl CanonicalRequest {
    /// Returns a copy with the model swapped, used by the retry engine's fallback-model
    /// recursion (bounded to depth 1, see the engine crate).
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.model = model.into();
        next
    }

    /// True if the request explicitly asked for extended thinking.
    pub fn wants_thinking(&self) -> bool {
        matches!(&self.thinking, Some(cfg) if cfg.kind == ThinkingKind::Enabled)
    }
}

/// A complete (non-streamed) assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalResponse {
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_text_flattens_unchanged() {
        let sys = SystemPrompt::Text("be helpful".into());
        assert_eq!(sys.flatten(), "be helpful");
    }

    #[test]
    fn system_blocks_join_with_newline() {
        let sys = SystemPrompt::Blocks(vec![
            SystemBlock { text: "a".into(), cache_control: None },
            SystemBlock { text: "b".into(), cache_control: None },
        ]);
        assert_eq!(sys.flatten(), "a\nb");
    }

    #[test]
    fn content_block_serde_tag_matches_anthropic_shape() {
        let block = ContentBlock::tool_use("toolu_1", "get_weather", serde_json::json!({"city": "nyc"}));
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_use");
        assert_eq!(json["id"], "toolu_1");
    }

    #[test]
    fn tool_choice_tool_variant_roundtrips() {
        let choice = ToolChoice::Tool { name: "lookup".into() };
        let json = serde_json::to_string(&choice).unwrap();
        let back: ToolChoice = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, ToolChoice::Tool { name } if name == "lookup"));
    }

    #[test]
    fn with_model_preserves_everything_else() {
        let req = CanonicalRequest {
            model: "claude-opus-4-5".into(),
            messages: vec![Message::user_text("hi")],
            system: None,
            tools: vec![],
            tool_choice: None,
            max_tokens: 1024,
            thinking: None,
            temperature: None,
            top_p: None,
            stream: false,
        };
        let fallback = req.with_model("gemini-3-pro-high");
        assert_eq!(fallback.model, "gemini-3-pro-high");
        assert_eq!(fallback.max_tokens, req.max_tokens);
        assert_eq!(fallback.messages.len(), req.messages.len());
    }

    #[test]
    fn wants_thinking_reflects_config() {
        let mut req = CanonicalRequest {
            model: "m".into(),
            messages: vec![],
            system: None,
            tools: vec![],
            tool_choice: None,
            max_tokens: 10,
            thinking: None,
            temperature: None,
            top_p: None,
            stream: false,
        };
        assert!(!req.wants_thinking());
        req.thinking = Some(ThinkingConfig { kind: ThinkingKind::Enabled, budget_tokens: Some(8000) });
        assert!(req.wants_thinking());
    }
}
