//! Canonical streaming event shape. Six variants, each carrying an explicit block index
//! where relevant — the format translator needs indices (not one-variant-per-kind) to
//! track N concurrent `tool_use` blocks.

use serde::{Deserialize, Serialize};

use crate::messages::{ContentBlock, StopReason, Usage};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalEvent {
    MessageStart,
    ContentBlockStart { index: u32, block: ContentBlock },
    ContentBlockDelta { index: u32, delta: ContentBlockDelta },
    ContentBlockStop { index: u32 },
    MessageDelta { stop_reason: StopReason, usage: Usage },
    MessageStop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
}
