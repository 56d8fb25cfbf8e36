//! OpenAI-chat → Anthropic streaming translation (§4.3). A small pure state machine: feed
//! it one upstream SSE chunk at a time, get back zero or more canonical events.

use switchboard_core::messages::{ContentBlock, StopReason, Usage};
use switchboard_core::stream::{CanonicalEvent, ContentBlockDelta};

use super::wire::{map_finish_reason, OpenAiStreamChunk};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Closed,
    Open(u32),
}

struct ToolTrack {
    upstream_index: u32,
    canonical_index: u32,
    closed: bool,
}

pub struct StreamTranslator {
    message_started: bool,
    next_index: u32,
    thinking: BlockState,
    text: BlockState,
    tools: Vec<ToolTrack>,
    usage: Usage,
    done: bool,
}

impl Default for StreamTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTranslator {
    pub fn new() -> Self {
        Self {
            message_started: false,
            next_index: 0,
            thinking: BlockState::Closed,
            text: BlockState::Closed,
            tools: Vec::new(),
            usage: Usage::default(),
            done: false,
        }
    }

    fn ensure_message_started(&mut self, out: &mut Vec<CanonicalEvent>) {
        if !self.message_started {
            self.message_started = true;
            out.push(CanonicalEvent::MessageStart);
        }
    }

    fn alloc_index(&mut self) -> u32 {
        let idx = self.next_index;
        self.next_index += 1;
        idx
    }

    fn close_thinking(&mut self, out: &mut Vec<CanonicalEvent>) {
        if let BlockState::Open(idx) = self.thinking {
            out.push(CanonicalEvent::ContentBlockStop { index: idx });
            self.thinking = BlockState::Closed;
        }
    }

    fn close_text(&mut self, out: &mut Vec<CanonicalEvent>) {
        if let BlockState::Open(idx) = self.text {
            out.push(CanonicalEvent::ContentBlockStop { index: idx });
            self.text = BlockState::Closed;
        }
    }

    fn close_all_tools(&mut self, out: &mut Vec<CanonicalEvent>) {
        for tool in &mut self.tools {
            if !tool.closed {
                out.push(CanonicalEvent::ContentBlockStop { index: tool.canonical_index });
                tool.closed = true;
            }
        }
    }

    /// Feed one deserialized upstream chunk, returning the canonical events it produces.
    pub fn feed(&mut self, chunk: &OpenAiStreamChunk) -> Vec<CanonicalEvent> {
        let mut out = Vec::new();

        if self.done {
            return out;
        }

        let Some(choice) = chunk.choices.first() else {
            if let Some(usage) = chunk.usage {
                self.usage.input_tokens = usage.prompt_tokens;
                self.usage.output_tokens = usage.completion_tokens;
            }
            return out;
        };

        let delta = &choice.delta;

        if delta.reasoning_content.is_some() || delta.content.is_some() || delta.tool_calls.is_some() {
            self.ensure_message_started(&mut out);
        }

        if let Some(reasoning) = &delta.reasoning_content {
            if !reasoning.is_empty() {
                if self.thinking == BlockState::Closed {
                    let idx = self.alloc_index();
                    self.thinking = BlockState::Open(idx);
                    out.push(CanonicalEvent::ContentBlockStart {
                        index: idx,
                        block: ContentBlock::Thinking { thinking: String::new(), signature: None },
                    });
                }
                if let BlockState::Open(idx) = self.thinking {
                    out.push(CanonicalEvent::ContentBlockDelta {
                        index: idx,
                        delta: ContentBlockDelta::ThinkingDelta { thinking: reasoning.clone() },
                    });
                }
            }
        }

        if let Some(text) = &delta.content {
            if !text.is_empty() {
                self.close_thinking(&mut out);
                if self.text == BlockState::Closed {
                    let idx = self.alloc_index();
                    self.text = BlockState::Open(idx);
                    out.push(CanonicalEvent::ContentBlockStart {
                        index: idx,
                        block: ContentBlock::text(""),
                    });
                }
                if let BlockState::Open(idx) = self.text {
                    out.push(CanonicalEvent::ContentBlockDelta {
                        index: idx,
                        delta: ContentBlockDelta::TextDelta { text: text.clone() },
                    });
                }
            }
        }

        if let Some(tool_calls) = &delta.tool_calls {
            if !tool_calls.is_empty() {
                // Closing thinking is a no-op if it was already closed when text opened;
                // this covers the case where tool_calls arrive directly after reasoning
                // with no text in between.
                self.close_text(&mut out);
                self.close_thinking(&mut out);
            }
            for tc in tool_calls {
                let track_pos = self.tools.iter().position(|t| t.upstream_index == tc.index);
                let canonical_index = match track_pos {
                    Some(pos) => self.tools[pos].canonical_index,
                    None => {
                        let idx = self.alloc_index();
                        self.tools.push(ToolTrack {
                            upstream_index: tc.index,
                            canonical_index: idx,
                            closed: false,
                        });
                        let id = tc
                            .id
                            .clone()
                            .unwrap_or_else(|| format!("toolu_{}_{}", chrono::Utc::now().timestamp_millis(), tc.index));
                        let name = tc.function.as_ref().and_then(|f| f.name.clone()).unwrap_or_default();
                        out.push(CanonicalEvent::ContentBlockStart {
                            index: idx,
                            block: ContentBlock::tool_use(id, name, serde_json::json!({})),
                        });
                        idx
                    }
                };
                if let Some(function) = &tc.function {
                    if let Some(args) = &function.arguments {
                        if !args.is_empty() {
                            out.push(CanonicalEvent::ContentBlockDelta {
                                index: canonical_index,
                                delta: ContentBlockDelta::InputJsonDelta { partial_json: args.clone() },
                            });
                        }
                    }
                }
            }
        }

        if let Some(usage) = chunk.usage {
            self.usage.input_tokens = usage.prompt_tokens;
            self.usage.output_tokens = usage.completion_tokens;
        }

        if let Some(reason) = &choice.finish_reason {
            out.extend(self.finish(map_finish_reason(reason)));
        }

        out
    }

    fn nothing_started(&self) -> bool {
        !self.message_started
    }

    fn finish(&mut self, stop_reason: StopReason) -> Vec<CanonicalEvent> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }

        if self.nothing_started() {
            self.ensure_message_started(&mut out);
            let idx = self.alloc_index();
            out.push(CanonicalEvent::ContentBlockStart { index: idx, block: ContentBlock::text("") });
            out.push(CanonicalEvent::ContentBlockStop { index: idx });
        }

        self.close_thinking(&mut out);
        self.close_text(&mut out);
        self.close_all_tools(&mut out);

        out.push(CanonicalEvent::MessageDelta { stop_reason, usage: self.usage });
        out.push(CanonicalEvent::MessageStop);
        self.done = true;
        out
    }

    /// Called if the upstream stream ends without ever sending a `finish_reason`.
    pub fn finish_without_reason(&mut self) -> Vec<CanonicalEvent> {
        self.finish(StopReason::EndTurn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anthropic_openai::wire::{FunctionDeltaWire, StreamChoice, StreamDelta, ToolCallDeltaWire, UsageWire};

    fn chunk(delta: StreamDelta, finish_reason: Option<&str>) -> OpenAiStreamChunk {
        OpenAiStreamChunk {
            choices: vec![StreamChoice { delta, finish_reason: finish_reason.map(String::from) }],
            usage: None,
        }
    }

    #[test]
    fn text_only_stream_produces_well_formed_sequence() {
        let mut t = StreamTranslator::new();
        let mut events = Vec::new();
        events.extend(t.feed(&chunk(
            StreamDelta { content: Some("hi".into()), ..Default::default() },
            None,
        )));
        events.extend(t.feed(&chunk(StreamDelta::default(), Some("stop"))));

        assert!(matches!(events[0], CanonicalEvent::MessageStart));
        assert!(matches!(events[1], CanonicalEvent::ContentBlockStart { index: 0, .. }));
        assert!(matches!(events[2], CanonicalEvent::ContentBlockDelta { index: 0, .. }));
        assert!(matches!(events[3], CanonicalEvent::ContentBlockStop { index: 0 }));
        assert!(matches!(events[4], CanonicalEvent::MessageDelta { stop_reason: StopReason::EndTurn, .. }));
        assert!(matches!(events[5], CanonicalEvent::MessageStop));
    }

    #[test]
    fn reasoning_then_text_closes_thinking_before_opening_text() {
        let mut t = StreamTranslator::new();
        let mut events = Vec::new();
        events.extend(t.feed(&chunk(
            StreamDelta { reasoning_content: Some("thinking...".into()), ..Default::default() },
            None,
        )));
        events.extend(t.feed(&chunk(
            StreamDelta { content: Some("answer".into()), ..Default::default() },
            None,
        )));
        events.extend(t.feed(&chunk(StreamDelta::default(), Some("stop"))));

        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                CanonicalEvent::MessageStart => "message_start",
                CanonicalEvent::ContentBlockStart { .. } => "cb_start",
                CanonicalEvent::ContentBlockDelta { .. } => "cb_delta",
                CanonicalEvent::ContentBlockStop { .. } => "cb_stop",
                CanonicalEvent::MessageDelta { .. } => "message_delta",
                CanonicalEvent::MessageStop => "message_stop",
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "message_start",
                "cb_start",
                "cb_delta",
                "cb_stop",
                "cb_start",
                "cb_delta",
                "cb_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[test]
    fn every_opened_block_has_exactly_one_stop_before_message_stop() {
        let mut t = StreamTranslator::new();
        let mut events = Vec::new();
        events.extend(t.feed(&chunk(
            StreamDelta {
                tool_calls: Some(vec![ToolCallDeltaWire {
                    index: 0,
                    id: Some("call_a".into()),
                    function: Some(FunctionDeltaWire { name: Some("f1".into()), arguments: Some("{}".into()) }),
                }]),
                ..Default::default()
            },
            None,
        )));
        events.extend(t.feed(&chunk(
            StreamDelta {
                tool_calls: Some(vec![ToolCallDeltaWire {
                    index: 1,
                    id: Some("call_b".into()),
                    function: Some(FunctionDeltaWire { name: Some("f2".into()), arguments: Some("{}".into()) }),
                }]),
                ..Default::default()
            },
            None,
        )));
        events.extend(t.feed(&chunk(StreamDelta::default(), Some("tool_calls"))));

        let mut opened = std::collections::HashSet::new();
        let mut closed = std::collections::HashSet::new();
        for e in &events {
            match e {
                CanonicalEvent::ContentBlockStart { index, .. } => {
                    assert!(opened.insert(*index), "index {index} opened twice");
                }
                CanonicalEvent::ContentBlockStop { index } => {
                    assert!(opened.contains(index));
                    assert!(closed.insert(*index), "index {index} closed twice");
                }
                _ => {}
            }
        }
        assert_eq!(opened, closed);
    }

    #[test]
    fn tool_call_without_id_is_synthesized() {
        let mut t = StreamTranslator::new();
        let events = t.feed(&chunk(
            StreamDelta {
                tool_calls: Some(vec![ToolCallDeltaWire { index: 0, id: None, function: None }]),
                ..Default::default()
            },
            None,
        ));
        let CanonicalEvent::ContentBlockStart { block: ContentBlock::ToolUse { id, .. }, .. } = &events[1] else {
            panic!("expected tool_use start");
        };
        assert!(id.starts_with("toolu_"));
    }

    #[test]
    fn usage_only_chunk_updates_cached_usage_without_events() {
        let mut t = StreamTranslator::new();
        let mut empty = chunk(StreamDelta::default(), None);
        empty.choices.clear();
        empty.usage = Some(UsageWire { prompt_tokens: 7, completion_tokens: 3 });
        let events = t.feed(&empty);
        assert!(events.is_empty());

        let finish_events = t.finish_without_reason();
        let CanonicalEvent::MessageDelta { usage, .. } = finish_events
            .iter()
            .find(|e| matches!(e, CanonicalEvent::MessageDelta { .. }))
            .unwrap()
        else {
            unreachable!()
        };
        assert_eq!(usage.input_tokens, 7);
        assert_eq!(usage.output_tokens, 3);
    }

    #[test]
    fn stream_ending_without_finish_reason_closes_with_end_turn() {
        let mut t = StreamTranslator::new();
        t.feed(&chunk(StreamDelta { content: Some("x".into()), ..Default::default() }, None));
        let events = t.finish_without_reason();
        let last_but_one = &events[events.len() - 2];
        assert!(matches!(last_but_one, CanonicalEvent::MessageDelta { stop_reason: StopReason::EndTurn, .. }));
    }

    #[test]
    fn empty_stream_emits_empty_text_block_before_closing() {
        let mut t = StreamTranslator::new();
        let events = t.finish_without_reason();
        assert!(matches!(events[0], CanonicalEvent::MessageStart));
        assert!(matches!(events[1], CanonicalEvent::ContentBlockStart { index: 0, .. }));
        assert!(matches!(events[2], CanonicalEvent::ContentBlockStop { index: 0 }));
    }

    #[test]
    fn feed_after_finish_is_a_noop() {
        let mut t = StreamTranslator::new();
        t.feed(&chunk(StreamDelta::default(), Some("stop")));
        let events = t.feed(&chunk(StreamDelta { content: Some("late".into()), ..Default::default() }, None));
        assert!(events.is_empty());
    }
}
