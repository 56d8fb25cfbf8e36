//! Google Cloud Code envelope conversion (§4.3, "Google Cloud Code specifics"). This is a
//! separate path from the OpenAI-chat translator: requests carry the Anthropic message
//! list verbatim inside a Google envelope; only the response shape needs converting.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchboard_core::messages::{CanonicalResponse, ContentBlock, Usage};
use switchboard_core::stream::CanonicalEvent;
use switchboard_core::{CanonicalRequest, StopReason};

/// Minimum length a `thoughtSignature` must have to be worth preserving on the thinking
/// block (shorter values are considered noise, per the source's own threshold).
const MIN_SIGNATURE_LEN: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct GoogleEnvelope<'a> {
    pub model: &'a str,
    pub project: &'a str,
    pub request: &'a CanonicalRequest,
}

pub fn build_envelope<'a>(req: &'a CanonicalRequest, project: &'a str) -> GoogleEnvelope<'a> {
    GoogleEnvelope { model: &req.model, project, request: req }
}

/// Pulls every `(tool_use_id, signature)` pair out of a completed turn's content blocks, for
/// the caller to feed into the adapter's thought-signature cache (§9 glossary). Only
/// `tool_use` blocks that actually carry a signature (i.e. survived the `MIN_SIGNATURE_LEN`
/// filter in `convert_response`/`GoogleStreamTranslator`) produce an entry.
pub fn collect_tool_signatures(content: &[ContentBlock]) -> Vec<(String, String)> {
    content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, signature: Some(sig), .. } => Some((id.clone(), sig.clone())),
            _ => None,
        })
        .collect()
}

/// Same as `collect_tool_signatures` but over a streamed event sequence, for the stream
/// dispatch path where there's no single `CanonicalResponse` to scan.
pub fn collect_tool_signatures_from_events(events: &[CanonicalEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|event| match event {
            CanonicalEvent::ContentBlockStart {
                block: ContentBlock::ToolUse { id, signature: Some(sig), .. },
                ..
            } => Some((id.clone(), sig.clone())),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleGenerateResponse {
    #[serde(default)]
    pub candidates: Vec<GoogleCandidate>,
    #[serde(default, rename = "usageMetadata")]
    pub usage_metadata: Option<GoogleUsageMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleCandidate {
    pub content: GoogleContent,
    #[serde(default, rename = "finishReason")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GoogleContent {
    #[serde(default)]
    pub parts: Vec<GooglePart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GooglePart {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub thought: Option<bool>,
    #[serde(default, rename = "thoughtSignature")]
    pub thought_signature: Option<String>,
    #[serde(default, rename = "functionCall")]
    pub function_call: Option<GoogleFunctionCall>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleFunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct GoogleUsageMetadata {
    #[serde(default, rename = "promptTokenCount")]
    pub prompt_token_count: u32,
    #[serde(default, rename = "candidatesTokenCount")]
    pub candidates_token_count: u32,
    #[serde(default, rename = "cachedContentTokenCount")]
    pub cached_content_token_count: Option<u32>,
}

pub fn convert_response(model: &str, resp: &GoogleGenerateResponse) -> CanonicalResponse {
    let candidate = resp.candidates.first();
    let mut content = Vec::new();
    let mut saw_function_call = false;

    if let Some(candidate) = candidate {
        for part in &candidate.content.parts {
            if part.thought == Some(true) {
                let signature = part
                    .thought_signature
                    .clone()
                    .filter(|s| s.len() >= MIN_SIGNATURE_LEN);
                content.push(ContentBlock::Thinking {
                    thinking: part.text.clone().unwrap_or_default(),
                    signature,
                });
                continue;
            }
            if let Some(call) = &part.function_call {
                saw_function_call = true;
                let signature = part.thought_signature.clone().filter(|s| s.len() >= MIN_SIGNATURE_LEN);
                content.push(ContentBlock::ToolUse {
                    id: format!("toolu_{}", uuid::Uuid::now_v7()),
                    name: call.name.clone(),
                    input: call.args.clone(),
                    signature,
                });
                continue;
            }
            if let Some(text) = &part.text {
                content.push(ContentBlock::text(text.clone()));
            }
        }
    }

    if content.is_empty() {
        content.push(ContentBlock::text(""));
    }

    let stop_reason = match candidate.and_then(|c| c.finish_reason.as_deref()) {
        Some("MAX_TOKENS") => StopReason::MaxTokens,
        Some("STOP") if saw_function_call => StopReason::ToolUse,
        _ if saw_function_call => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    };

    let usage = resp
        .usage_metadata
        .map(|u| {
            let cached = u.cached_content_token_count.unwrap_or(0);
            Usage {
                input_tokens: u.prompt_token_count.saturating_sub(cached),
                output_tokens: u.candidates_token_count,
                cache_read_input_tokens: u.cached_content_token_count,
            }
        })
        .unwrap_or_default();

    CanonicalResponse { model: model.to_string(), content, stop_reason, usage }
}

/// Translates the `streamGenerateContent?alt=sse` chunk sequence into canonical events.
/// Each chunk carries a fragment of a single candidate's parts; this tracks at most one
/// open `thinking` block and one open `text` block across chunks the same way the
/// OpenAI-chat translator does, emitting one `content_block_start`/`stop` pair per
/// `functionCall` part as it arrives (Google doesn't stream tool args incrementally the
/// way OpenAI-chat does, so each function call part is complete in one chunk).
#[derive(Debug, Default)]
pub struct GoogleStreamTranslator {
    message_started: bool,
    next_index: u32,
    thinking_index: Option<u32>,
    text_index: Option<u32>,
    usage: Usage,
    saw_function_call: bool,
    done: bool,
}

impl GoogleStreamTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_started(&mut self, out: &mut Vec<CanonicalEvent>) {
        if !self.message_started {
            self.message_started = true;
            out.push(CanonicalEvent::MessageStart);
        }
    }

    fn alloc(&mut self) -> u32 {
        let idx = self.next_index;
        self.next_index += 1;
        idx
    }

    fn close_thinking(&mut self, out: &mut Vec<CanonicalEvent>) {
        if let Some(idx) = self.thinking_index.take() {
            out.push(CanonicalEvent::ContentBlockStop { index: idx });
        }
    }

    fn close_text(&mut self, out: &mut Vec<CanonicalEvent>) {
        if let Some(idx) = self.text_index.take() {
            out.push(CanonicalEvent::ContentBlockStop { index: idx });
        }
    }

    pub fn feed(&mut self, chunk: &GoogleGenerateResponse) -> Vec<CanonicalEvent> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }

        if let Some(usage) = &chunk.usage_metadata {
            let cached = usage.cached_content_token_count.unwrap_or(0);
            self.usage = Usage {
                input_tokens: usage.prompt_token_count.saturating_sub(cached),
                output_tokens: usage.candidates_token_count,
                cache_read_input_tokens: usage.cached_content_token_count,
            };
        }

        let Some(candidate) = chunk.candidates.first() else { return out };
        self.ensure_started(&mut out);

        for part in &candidate.content.parts {
            if part.thought == Some(true) {
                self.close_text(&mut out);
                let idx = *self.thinking_index.get_or_insert_with(|| {
                    let idx = self.next_index;
                    self.next_index += 1;
                    out.push(CanonicalEvent::ContentBlockStart {
                        index: idx,
                        block: ContentBlock::Thinking { thinking: String::new(), signature: None },
                    });
                    idx
                });
                out.push(CanonicalEvent::ContentBlockDelta {
                    index: idx,
                    delta: switchboard_core::stream::ContentBlockDelta::ThinkingDelta {
                        thinking: part.text.clone().unwrap_or_default(),
                    },
                });
                continue;
            }

            if let Some(call) = &part.function_call {
                self.saw_function_call = true;
                self.close_thinking(&mut out);
                self.close_text(&mut out);
                let idx = self.alloc();
                let signature = part.thought_signature.clone().filter(|s| s.len() >= MIN_SIGNATURE_LEN);
                out.push(CanonicalEvent::ContentBlockStart {
                    index: idx,
                    block: ContentBlock::ToolUse {
                        id: format!("toolu_{}", uuid::Uuid::now_v7()),
                        name: call.name.clone(),
                        input: call.args.clone(),
                        signature,
                    },
                });
                out.push(CanonicalEvent::ContentBlockStop { index: idx });
                continue;
            }

            if let Some(text) = &part.text {
                self.close_thinking(&mut out);
                let idx = *self.text_index.get_or_insert_with(|| {
                    let idx = self.next_index;
                    self.next_index += 1;
                    out.push(CanonicalEvent::ContentBlockStart {
                        index: idx,
                        block: ContentBlock::text(""),
                    });
                    idx
                });
                out.push(CanonicalEvent::ContentBlockDelta {
                    index: idx,
                    delta: switchboard_core::stream::ContentBlockDelta::TextDelta { text: text.clone() },
                });
            }
        }

        if let Some(reason) = candidate.finish_reason.as_deref() {
            out.extend(self.finish(reason));
        }

        out
    }

    fn finish(&mut self, reason: &str) -> Vec<CanonicalEvent> {
        let mut out = Vec::new();
        self.close_thinking(&mut out);
        self.close_text(&mut out);

        let stop_reason = match reason {
            "MAX_TOKENS" => StopReason::MaxTokens,
            _ if self.saw_function_call => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        };
        out.push(CanonicalEvent::MessageDelta { stop_reason, usage: self.usage });
        out.push(CanonicalEvent::MessageStop);
        self.done = true;
        out
    }

    /// Closes any still-open blocks with `end_turn` if the stream ended without a
    /// `finishReason` on the final chunk.
    pub fn finish_without_reason(&mut self) -> Vec<CanonicalEvent> {
        if self.done {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        out.extend(self.finish("STOP"));
        out
    }
}
