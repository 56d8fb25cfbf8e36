//! OpenAI-chat → Anthropic non-stream response translation (§4.3).

use serde_json::Value;
use switchboard_core::messages::{CanonicalResponse, ContentBlock, Usage};

use super::wire::{map_finish_reason, OpenAiChatResponse};

pub fn convert_response(model: &str, resp: &OpenAiChatResponse) -> CanonicalResponse {
    let choice = resp.choices.first();
    let mut content = Vec::new();

    if let Some(choice) = choice {
        if let Some(reasoning) = &choice.message.reasoning_content {
            if !reasoning.is_empty() {
                content.push(ContentBlock::Thinking { thinking: reasoning.clone(), signature: None });
            }
        }
        if let Some(text) = &choice.message.content {
            if !text.is_empty() {
                content.push(ContentBlock::text(text.clone()));
            }
        }
        if let Some(tool_calls) = &choice.message.tool_calls {
            for call in tool_calls {
                let input = serde_json::from_str::<Value>(&call.function.arguments)
                    .unwrap_or_else(|_| serde_json::json!({ "_raw": call.function.arguments }));
                content.push(ContentBlock::tool_use(call.id.clone(), call.function.name.clone(), input));
            }
        }
    }

    if content.is_empty() {
        content.push(ContentBlock::text(""));
    }

    let stop_reason = choice
        .and_then(|c| c.finish_reason.as_deref())
        .map(map_finish_reason)
        .unwrap_or(switchboard_core::StopReason::EndTurn);

    let usage = resp
        .usage
        .map(|u| Usage { input_tokens: u.prompt_tokens, output_tokens: u.completion_tokens, cache_read_input_tokens: None })
        .unwrap_or_default();

    CanonicalResponse { model: model.to_string(), content, stop_reason, usage }
}
