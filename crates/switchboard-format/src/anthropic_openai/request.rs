//! Anthropic → OpenAI-chat request translation (§4.3).

use serde_json::{json, Value};
use switchboard_core::messages::{ContentBlock, Message, Role, ThinkingKind};
use switchboard_core::{CanonicalRequest, ToolChoice};

/// Models that accept `reasoning_effort`. Membership here, or an explicit request-side
/// thinking config, is what gates whether reasoning params get attached at all.
pub fn is_reasoning_capable(model: &str) -> bool {
    model.starts_with("o1")
        || model.starts_with("o3")
        || model.starts_with("o4")
        || model.starts_with("gpt-5")
}

fn reasoning_effort_for_budget(budget_tokens: Option<u32>) -> &'static str {
    match budget_tokens {
        Some(b) if b < 4_000 => "low",
        Some(b) if b >= 16_000 => "high",
        _ => "medium",
    }
}

/// Build the OpenAI-chat request body. `is_thinking_detected` is the Copilot normalizer's
/// bit (or simply `req.wants_thinking()` for non-Copilot providers).
pub fn build_request_body(req: &CanonicalRequest, is_thinking_detected: bool) -> Value {
    let mut messages = Vec::new();

    if let Some(system) = &req.system {
        let flattened = system.flatten();
        if !flattened.is_empty() {
            messages.push(json!({ "role": "system", "content": flattened }));
        }
    }

    for message in &req.messages {
        append_message(&mut messages, message);
    }

    let mut body = json!({
        "model": req.model,
        "messages": messages,
        "max_completion_tokens": req.max_tokens,
        "store": false,
    });

    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description.clone().unwrap_or_default(),
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
    }

    if let Some(choice) = &req.tool_choice {
        body["tool_choice"] = map_tool_choice(choice);
    }

    let reasoning_capable = is_reasoning_capable(&req.model);
    if reasoning_capable || is_thinking_detected {
        let budget = req.thinking.as_ref().and_then(|t| {
            if t.kind == ThinkingKind::Enabled {
                t.budget_tokens
            } else {
                None
            }
        });
        body["reasoning_effort"] = json!(reasoning_effort_for_budget(budget));
        body["reasoning_summary"] = json!("auto");
        body["include"] = json!(["reasoning.encrypted_content"]);
    }

    if let Some(temp) = req.temperature {
        body["temperature"] = json!(temp);
    }
    if let Some(top_p) = req.top_p {
        body["top_p"] = json!(top_p);
    }
    if req.stream {
        body["stream"] = json!(true);
    }

    body
}

fn map_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::Any => json!("required"),
        ToolChoice::Tool { name } => json!({ "type": "function", "function": { "name": name } }),
    }
}

fn append_message(out: &mut Vec<Value>, message: &Message) {
    match message.role {
        Role::User => append_user_message(out, &message.content),
        Role::Assistant => append_assistant_message(out, &message.content),
    }
}

fn append_user_message(out: &mut Vec<Value>, content: &[ContentBlock]) {
    let mut tool_results = Vec::new();
    let mut remaining = Vec::new();

    for block in content {
        match block {
            ContentBlock::ToolResult { tool_use_id, content, .. } => {
                tool_results.push((tool_use_id.clone(), content.clone()));
            }
            other => remaining.push(other.clone()),
        }
    }

    for (tool_call_id, content) in tool_results {
        out.push(json!({ "role": "tool", "tool_call_id": tool_call_id, "content": content }));
    }

    if !remaining.is_empty() {
        out.push(json!({ "role": "user", "content": user_content_value(&remaining) }));
    }
}

fn user_content_value(blocks: &[ContentBlock]) -> Value {
    if blocks.len() == 1 {
        if let ContentBlock::Text { text, .. } = &blocks[0] {
            return json!(text);
        }
    }

    let parts: Vec<Value> = blocks
        .iter()
        .map(|b| match b {
            ContentBlock::Text { text, .. } => json!({ "type": "text", "text": text }),
            ContentBlock::Image { media_type, data } => json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{media_type};base64,{data}") }
            }),
            _ => json!({ "type": "text", "text": "" }),
        })
        .collect();
    Value::Array(parts)
}

fn append_assistant_message(out: &mut Vec<Value>, content: &[ContentBlock]) {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in content {
        match block {
            ContentBlock::Text { text: t, .. } => {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(t);
            }
            ContentBlock::ToolUse { id, name, input, .. } => {
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": { "name": name, "arguments": input.to_string() },
                }));
            }
            // thinking blocks are dropped from the wire; reasoning is transported via
            // reasoning_effort on the request, not echoed back as assistant history.
            ContentBlock::Thinking { .. } => {}
            _ => {}
        }
    }

    let mut msg = json!({ "role": "assistant" });
    if !text.is_empty() {
        msg["content"] = json!(text);
    } else {
        msg["content"] = Value::Null;
    }
    if !tool_calls.is_empty() {
        msg["tool_calls"] = Value::Array(tool_calls);
    }
    out.push(msg);
}
