//! Chat-completions deltas → Anthropic stream events.
//!
//! At most one content block is open at any time. Block indices are assigned
//! once, in opening order, and keep counting across backend rounds, so every
//! `content_block_start` for index N+1 comes after the stop for index N.

use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

use crate::convert::response::{reconcile_stop_reason, stop_details, usage_from_chat};
use crate::convert::thinking::{TagEvent, ThinkTagScanner};
use crate::error::ProxyError;
use crate::protocol::anthropic::{
    BlockDelta, ContentBlock, MessageDeltaBody, MessagesResponse, StopReason, StreamEvent, Usage,
};
use crate::protocol::openai::{ChatCompletionChunk, ChatToolCall, ChatUsage, ChunkToolCall};
use crate::tokens;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
    Server,
}

#[derive(Debug)]
struct OpenBlock {
    index: usize,
    kind: BlockKind,
    /// Tool-call slot feeding this block, for `tool_use` blocks.
    slot: Option<u32>,
}

/// One backend tool call, assembled from its fragments.
#[derive(Debug, Default)]
struct ToolSlot {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
    block_index: Option<usize>,
    intercepted: bool,
    closed: bool,
}

#[derive(Debug, Default)]
struct UsageAccumulator {
    total: Usage,
    round: Option<Usage>,
    reported: bool,
}

impl UsageAccumulator {
    /// Servers may repeat usage on several chunks; the last report of a
    /// round wins.
    fn record(&mut self, usage: &ChatUsage) {
        self.round = Some(usage_from_chat(usage));
    }

    fn commit_round(&mut self) {
        if let Some(round) = self.round.take() {
            self.total.accumulate(&round);
            self.reported = true;
        }
    }
}

/// Tool calls the backend made in the round just closed.
#[derive(Debug, Default)]
pub struct RoundCalls {
    /// Calls addressed to server tools, never shown to the client as
    /// `tool_use`.
    pub server: Vec<ChatToolCall>,
    /// Number of client tool calls streamed as `tool_use` blocks.
    pub client: usize,
}

#[derive(Debug)]
pub struct StreamState {
    message_id: String,
    model: String,
    input_estimate: u32,
    intercepted: HashSet<String>,
    started: bool,
    finished: bool,
    next_index: usize,
    open: Option<OpenBlock>,
    scanner: ThinkTagScanner,
    reasoning_channel: bool,
    slots: BTreeMap<u32, ToolSlot>,
    stop_reason: Option<StopReason>,
    stop_sequence: Option<String>,
    emitted_tool_use: bool,
    output_chars: usize,
    usage: UsageAccumulator,
    web_search_requests: u32,
}

impl StreamState {
    pub fn new(model: impl Into<String>, input_estimate: u32) -> Self {
        Self {
            message_id: tokens::message_id(),
            model: model.into(),
            input_estimate,
            intercepted: HashSet::new(),
            started: false,
            finished: false,
            next_index: 0,
            open: None,
            scanner: ThinkTagScanner::default(),
            reasoning_channel: false,
            slots: BTreeMap::new(),
            stop_reason: None,
            stop_sequence: None,
            emitted_tool_use: false,
            output_chars: 0,
            usage: UsageAccumulator::default(),
            web_search_requests: 0,
        }
    }

    /// Tool names whose calls are run by the proxy instead of being streamed.
    pub fn with_intercepted(mut self, names: HashSet<String>) -> Self {
        self.intercepted = names;
        self
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn push_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.ensure_started(&mut events);

        if let Some(usage) = &chunk.usage {
            self.usage.record(usage);
        }

        for choice in chunk.choices.iter().filter(|choice| choice.index == 0) {
            let delta = &choice.delta;

            if let Some(reasoning) = delta.reasoning_text() {
                if !self.reasoning_channel {
                    self.reasoning_channel = true;
                    self.flush_scanner(&mut events);
                }
                self.emit_thinking(reasoning, &mut events);
            }

            if let Some(content) = delta.content.as_deref().filter(|c| !c.is_empty()) {
                if self.reasoning_channel {
                    self.emit_text(content, &mut events);
                } else {
                    let tag_events = self.scanner.push(content);
                    self.apply_tag_events(tag_events, &mut events);
                }
            }

            for (position, call) in delta.tool_calls.iter().flatten().enumerate() {
                self.push_tool_call(position, call, &mut events);
            }

            if let Some(finish_reason) = choice.finish_reason.as_deref().filter(|f| !f.is_empty()) {
                self.flush_scanner(&mut events);
                self.close_open(&mut events);
                self.close_slots();
                let (reason, sequence) = stop_details(Some(finish_reason), choice.stop_reason.as_ref());
                debug!(finish_reason, ?reason, "backend round finished");
                self.stop_reason = Some(reason);
                self.stop_sequence = sequence;
            }
        }

        events
    }

    /// Ends the current backend round: held-back text is released, the open
    /// block closed and the round's usage committed.
    pub fn close_round(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.flush_scanner(&mut events);
        self.close_open(&mut events);
        self.close_slots();
        self.usage.commit_round();
        events
    }

    pub fn take_round_calls(&mut self) -> RoundCalls {
        let mut calls = RoundCalls::default();
        for (_, slot) in std::mem::take(&mut self.slots) {
            let Some(name) = slot.name else {
                continue;
            };
            if slot.intercepted {
                let id = slot.id.unwrap_or_else(tokens::tool_use_id);
                calls.server.push(ChatToolCall::new(id, name, slot.arguments));
            } else {
                calls.client += 1;
            }
        }
        calls
    }

    /// Prepares for a follow-up backend round.
    pub fn begin_round(&mut self) {
        self.scanner = ThinkTagScanner::default();
        self.reasoning_channel = false;
        self.slots.clear();
        self.stop_reason = None;
        self.stop_sequence = None;
    }

    /// Emits complete blocks produced by the proxy (server tool use and
    /// results), each as start, optional input delta, stop.
    pub fn push_blocks(&mut self, blocks: Vec<ContentBlock>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.ensure_started(&mut events);
        self.flush_scanner(&mut events);
        self.close_open(&mut events);

        for block in blocks {
            match block {
                ContentBlock::ServerToolUse { id, name, input } => {
                    let index = self.open_block(
                        BlockKind::Server,
                        ContentBlock::ServerToolUse {
                            id,
                            name,
                            input: json!({}),
                        },
                        None,
                        &mut events,
                    );
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: BlockDelta::InputJsonDelta {
                            partial_json: input.to_string(),
                        },
                    });
                }
                other => {
                    self.open_block(BlockKind::Server, other, None, &mut events);
                }
            }
            self.close_open(&mut events);
        }
        events
    }

    pub fn record_web_search(&mut self) {
        self.web_search_requests += 1;
    }

    /// Closes everything and emits `message_delta` + `message_stop`.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.ensure_started(&mut events);
        self.flush_scanner(&mut events);
        self.close_open(&mut events);
        self.close_slots();
        self.usage.commit_round();

        let stop_reason = reconcile_stop_reason(
            self.stop_reason.unwrap_or(StopReason::EndTurn),
            self.emitted_tool_use,
        );
        let stop_sequence = match stop_reason {
            StopReason::StopSequence => self.stop_sequence.take(),
            _ => None,
        };

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop_reason),
                stop_sequence,
            },
            usage: self.final_usage(),
        });
        events.push(StreamEvent::MessageStop);
        self.finished = true;
        events
    }

    /// Terminates the stream with an `error` event after closing the open
    /// block with whatever it already holds.
    pub fn fail(&mut self, err: &ProxyError) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        if self.started {
            self.flush_scanner(&mut events);
            self.close_open(&mut events);
        }
        events.push(StreamEvent::Error {
            error: err.to_body(),
        });
        self.finished = true;
        events
    }

    fn final_usage(&self) -> Usage {
        let mut usage = self.usage.total.clone();
        if !self.usage.reported || usage.input_tokens == 0 {
            usage.input_tokens = self.input_estimate;
        }
        if usage.output_tokens == 0 {
            usage.output_tokens =
                u32::try_from(self.output_chars.div_ceil(4)).unwrap_or(u32::MAX);
        }
        usage.with_web_search_requests(self.web_search_requests)
    }

    fn ensure_started(&mut self, events: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        let usage = Usage {
            input_tokens: self.input_estimate,
            ..Usage::default()
        };
        events.push(StreamEvent::MessageStart {
            message: MessagesResponse::new(
                self.message_id.clone(),
                self.model.clone(),
                Vec::new(),
                usage,
            ),
        });
    }

    fn open_block(
        &mut self,
        kind: BlockKind,
        content_block: ContentBlock,
        slot: Option<u32>,
        events: &mut Vec<StreamEvent>,
    ) -> usize {
        self.close_open(events);
        let index = self.next_index;
        self.next_index += 1;
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block,
        });
        self.open = Some(OpenBlock { index, kind, slot });
        index
    }

    fn close_open(&mut self, events: &mut Vec<StreamEvent>) {
        let Some(block) = self.open.take() else {
            return;
        };
        events.push(StreamEvent::ContentBlockStop { index: block.index });
        if let Some(slot) = block.slot.and_then(|key| self.slots.get_mut(&key)) {
            slot.closed = true;
        }
    }

    fn close_slots(&mut self) {
        for slot in self.slots.values_mut() {
            slot.closed = true;
        }
    }

    /// Index of an open block of `kind`, opening one if needed.
    fn ensure_block(&mut self, kind: BlockKind, events: &mut Vec<StreamEvent>) -> usize {
        if let Some(open) = &self.open
            && open.kind == kind
        {
            return open.index;
        }
        let block = match kind {
            BlockKind::Thinking => ContentBlock::thinking(""),
            _ => ContentBlock::text(""),
        };
        self.open_block(kind, block, None, events)
    }

    fn emit_text(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        let index = self.ensure_block(BlockKind::Text, events);
        self.output_chars += text.chars().count();
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::TextDelta {
                text: text.to_string(),
            },
        });
    }

    fn emit_thinking(&mut self, thinking: &str, events: &mut Vec<StreamEvent>) {
        if thinking.is_empty() {
            return;
        }
        let index = self.ensure_block(BlockKind::Thinking, events);
        self.output_chars += thinking.chars().count();
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::ThinkingDelta {
                thinking: thinking.to_string(),
            },
        });
    }

    fn apply_tag_events(&mut self, tag_events: Vec<TagEvent>, events: &mut Vec<StreamEvent>) {
        for tag_event in tag_events {
            match tag_event {
                TagEvent::Text(text) => self.emit_text(&text, events),
                TagEvent::ThinkingStart => {
                    self.open_block(BlockKind::Thinking, ContentBlock::thinking(""), None, events);
                }
                TagEvent::Thinking(thinking) => self.emit_thinking(&thinking, events),
                TagEvent::ThinkingEnd => {
                    if self
                        .open
                        .as_ref()
                        .is_some_and(|open| open.kind == BlockKind::Thinking)
                    {
                        self.close_open(events);
                    }
                }
            }
        }
    }

    fn flush_scanner(&mut self, events: &mut Vec<StreamEvent>) {
        let tag_events = self.scanner.flush();
        self.apply_tag_events(tag_events, events);
    }

    fn push_tool_call(&mut self, position: usize, call: &ChunkToolCall, events: &mut Vec<StreamEvent>) {
        let key = call
            .index
            .unwrap_or_else(|| u32::try_from(position).unwrap_or(u32::MAX));
        let slot = self.slots.entry(key).or_default();

        if let Some(id) = call.id.as_deref().filter(|id| !id.is_empty())
            && slot.id.is_none()
        {
            slot.id = Some(id.to_string());
        }
        let mut fragment = "";
        if let Some(function) = &call.function {
            if let Some(name) = function.name.as_deref().filter(|n| !n.is_empty())
                && slot.name.is_none()
            {
                slot.name = Some(name.to_string());
                slot.intercepted = self.intercepted.contains(name);
            }
            if let Some(arguments) = function.arguments.as_deref() {
                slot.arguments.push_str(arguments);
                fragment = arguments;
            }
        }

        // Calls are streamed once their name is known; server tool calls
        // only accumulate.
        if slot.intercepted {
            return;
        }
        let Some(name) = slot.name.clone() else {
            return;
        };

        let block_index = slot.block_index;
        match block_index {
            None => {
                let id = slot.id.clone().unwrap_or_else(tokens::tool_use_id);
                slot.id = Some(id.clone());
                let buffered = slot.arguments.clone();

                self.flush_scanner(events);
                let index = self.open_block(
                    BlockKind::ToolUse,
                    ContentBlock::ToolUse {
                        id,
                        name,
                        input: json!({}),
                    },
                    Some(key),
                    events,
                );
                if let Some(slot) = self.slots.get_mut(&key) {
                    slot.block_index = Some(index);
                }
                self.emitted_tool_use = true;
                if !buffered.is_empty() {
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: BlockDelta::InputJsonDelta {
                            partial_json: buffered,
                        },
                    });
                }
            }
            Some(index) => {
                if fragment.is_empty() {
                    return;
                }
                if slot.closed {
                    warn!(index, tool = %name, "argument fragment for an already closed tool block dropped");
                    return;
                }
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::InputJsonDelta {
                        partial_json: fragment.to_string(),
                    },
                });
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ProxyError;
    use serde_json::{Value, json};

    /// Asserts the Anthropic stream grammar: one message_start first, block
    /// indices contiguous from 0, at most one block open, deltas only inside
    /// their block, message_delta/message_stop or error last.
    pub(crate) fn assert_well_formed(events: &[StreamEvent]) {
        let mut open: Option<usize> = None;
        let mut expected_next = 0usize;
        let mut ended = false;
        for (position, event) in events.iter().enumerate() {
            assert!(!ended, "event after end of stream at {position}: {event:?}");
            match event {
                StreamEvent::MessageStart { .. } => assert_eq!(position, 0, "message_start not first"),
                StreamEvent::ContentBlockStart { index, .. } => {
                    assert!(open.is_none(), "block {index} opened while {open:?} is open");
                    assert_eq!(*index, expected_next, "non-contiguous block index");
                    open = Some(*index);
                    expected_next += 1;
                }
                StreamEvent::ContentBlockDelta { index, .. } => {
                    assert_eq!(open, Some(*index), "delta for block {index} outside its span");
                }
                StreamEvent::ContentBlockStop { index } => {
                    assert_eq!(open, Some(*index), "stop for block {index} that is not open");
                    open = None;
                }
                StreamEvent::MessageDelta { .. } => assert!(open.is_none()),
                StreamEvent::MessageStop => {
                    assert!(open.is_none());
                    ended = true;
                }
                StreamEvent::Error { .. } => {
                    assert!(open.is_none());
                    ended = true;
                }
            }
        }
        assert!(ended, "stream never terminated");
    }

    /// `(type, accumulated content)` per block index.
    pub(crate) fn blocks(events: &[StreamEvent]) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = Vec::new();
        for event in events {
            match event {
                StreamEvent::ContentBlockStart { content_block, .. } => {
                    let kind = serde_json::to_value(content_block).unwrap()["type"]
                        .as_str()
                        .unwrap()
                        .to_string();
                    out.push((kind, String::new()));
                }
                StreamEvent::ContentBlockDelta { index, delta } => {
                    let piece = match delta {
                        BlockDelta::TextDelta { text } => text,
                        BlockDelta::ThinkingDelta { thinking } => thinking,
                        BlockDelta::InputJsonDelta { partial_json } => partial_json,
                    };
                    out[*index].1.push_str(piece);
                }
                _ => {}
            }
        }
        out
    }

    pub(crate) fn chunk(value: Value) -> ChatCompletionChunk {
        serde_json::from_value(value).unwrap()
    }

    pub(crate) fn content(text: &str) -> ChatCompletionChunk {
        chunk(json!({"choices": [{"index": 0, "delta": {"content": text}}]}))
    }

    pub(crate) fn finish(reason: &str) -> ChatCompletionChunk {
        chunk(json!({"choices": [{"index": 0, "delta": {}, "finish_reason": reason}]}))
    }

    fn run(state: &mut StreamState, chunks: &[ChatCompletionChunk]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for c in chunks {
            events.extend(state.push_chunk(c));
        }
        events.extend(state.close_round());
        events.extend(state.finish());
        events
    }

    fn message_delta(events: &[StreamEvent]) -> (&MessageDeltaBody, &Usage) {
        events
            .iter()
            .find_map(|event| match event {
                StreamEvent::MessageDelta { delta, usage } => Some((delta, usage)),
                _ => None,
            })
            .expect("message_delta present")
    }

    #[test]
    fn plain_text_stream() {
        let mut state = StreamState::new("m", 12);
        let events = run(
            &mut state,
            &[
                chunk(json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": ""}}]})),
                content("Hel"),
                content("lo"),
                finish("stop"),
                chunk(json!({"choices": [], "usage": {"prompt_tokens": 9, "completion_tokens": 2}})),
            ],
        );
        assert_well_formed(&events);

        let StreamEvent::MessageStart { message } = &events[0] else {
            panic!("expected message_start");
        };
        assert!(message.id.starts_with("msg_"));
        assert_eq!(message.model, "m");
        assert_eq!(message.usage.input_tokens, 12);

        assert_eq!(blocks(&events), vec![("text".to_string(), "Hello".to_string())]);
        let (delta, usage) = message_delta(&events);
        assert_eq!(delta.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(usage.input_tokens, 9);
        assert_eq!(usage.output_tokens, 2);
        assert!(matches!(events.last(), Some(StreamEvent::MessageStop)));
        assert!(state.is_finished());
    }

    #[test]
    fn think_tags_split_across_chunks_become_blocks() {
        let expected = vec![
            ("thinking".to_string(), "A".to_string()),
            ("text".to_string(), "B".to_string()),
        ];
        let input = "<think>A</think>B";
        for split in 1..input.len() {
            let (left, right) = input.split_at(split);
            let mut state = StreamState::new("m", 0);
            let events = run(&mut state, &[content(left), content(right), finish("stop")]);
            assert_well_formed(&events);
            assert_eq!(blocks(&events), expected, "split at {split}");
        }
    }

    #[test]
    fn reasoning_channel_disables_tag_scanning() {
        let mut state = StreamState::new("m", 0);
        let events = run(
            &mut state,
            &[
                chunk(json!({"choices": [{"index": 0, "delta": {"reasoning_content": "step 1"}}]})),
                chunk(json!({"choices": [{"index": 0, "delta": {"reasoning": ", step 2"}}]})),
                content("<think>literal</think>"),
                finish("stop"),
            ],
        );
        assert_well_formed(&events);
        assert_eq!(
            blocks(&events),
            vec![
                ("thinking".to_string(), "step 1, step 2".to_string()),
                ("text".to_string(), "<think>literal</think>".to_string()),
            ]
        );
    }

    #[test]
    fn tool_call_fragments_stream_as_input_json() {
        let mut state = StreamState::new("m", 0);
        let events = run(
            &mut state,
            &[
                content("Checking."),
                chunk(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "id": "call_1", "type": "function", "function": {"name": "lookup", "arguments": ""}}
                ]}}]})),
                chunk(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "function": {"arguments": "{\"a\""}}
                ]}}]})),
                chunk(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "function": {"arguments": ":1,\"b\""}}
                ]}}]})),
                chunk(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "function": {"arguments": ":2}"}}
                ]}}]})),
                finish("tool_calls"),
            ],
        );
        assert_well_formed(&events);

        let start = events
            .iter()
            .find_map(|event| match event {
                StreamEvent::ContentBlockStart {
                    index: 1,
                    content_block,
                } => Some(content_block.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            start,
            ContentBlock::ToolUse {
                id: "call_1".to_string(),
                name: "lookup".to_string(),
                input: json!({}),
            }
        );
        let assembled = &blocks(&events)[1].1;
        assert_eq!(
            serde_json::from_str::<Value>(assembled).unwrap(),
            json!({"a": 1, "b": 2})
        );
        assert_eq!(message_delta(&events).0.stop_reason, Some(StopReason::ToolUse));
    }

    #[test]
    fn arguments_before_name_are_buffered() {
        let mut state = StreamState::new("m", 0);
        let events = run(
            &mut state,
            &[
                chunk(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "function": {"arguments": "{\"x\":"}}
                ]}}]})),
                chunk(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "function": {"name": "f", "arguments": "1}"}}
                ]}}]})),
                finish("tool_calls"),
            ],
        );
        assert_well_formed(&events);
        let blocks = blocks(&events);
        assert_eq!(blocks[0], ("tool_use".to_string(), "{\"x\":1}".to_string()));

        // the backend gave no id, so one is minted
        let id = events
            .iter()
            .find_map(|event| match event {
                StreamEvent::ContentBlockStart {
                    content_block: ContentBlock::ToolUse { id, .. },
                    ..
                } => Some(id.clone()),
                _ => None,
            })
            .unwrap();
        assert!(id.starts_with("toolu_"));
    }

    #[test]
    fn parallel_tool_calls_open_sequentially() {
        let mut state = StreamState::new("m", 0);
        let events = run(
            &mut state,
            &[
                chunk(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "id": "a", "function": {"name": "one", "arguments": "{}"}},
                    {"index": 1, "id": "b", "function": {"name": "two", "arguments": "{\"k\":"}}
                ]}}]})),
                chunk(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 1, "function": {"arguments": "2}"}}
                ]}}]})),
                finish("stop"),
            ],
        );
        assert_well_formed(&events);
        assert_eq!(
            blocks(&events),
            vec![
                ("tool_use".to_string(), "{}".to_string()),
                ("tool_use".to_string(), "{\"k\":2}".to_string()),
            ]
        );
        // "stop" with tool calls present is reported as tool_use
        assert_eq!(message_delta(&events).0.stop_reason, Some(StopReason::ToolUse));
    }

    #[test]
    fn intercepted_calls_are_withheld_and_collected() {
        let mut state = StreamState::new("m", 0).with_intercepted(HashSet::from(["web_search".to_string()]));
        let mut events = Vec::new();
        events.extend(state.push_chunk(&content("Let me search.")));
        events.extend(state.push_chunk(&chunk(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "id": "call_s", "function": {"name": "web_search", "arguments": "{\"query\":"}}
        ]}}]}))));
        events.extend(state.push_chunk(&chunk(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "\"rust\"}"}}
        ]}}]}))));
        events.extend(state.push_chunk(&finish("tool_calls")));
        events.extend(state.close_round());

        let calls = state.take_round_calls();
        assert_eq!(calls.client, 0);
        assert_eq!(calls.server.len(), 1);
        assert_eq!(calls.server[0].id, "call_s");
        assert_eq!(calls.server[0].function.arguments, "{\"query\":\"rust\"}");

        // server blocks continue the index sequence
        events.extend(state.push_blocks(vec![
            ContentBlock::ServerToolUse {
                id: "srvtoolu_1".to_string(),
                name: "web_search".to_string(),
                input: json!({"query": "rust"}),
            },
            ContentBlock::WebSearchToolResult {
                tool_use_id: "srvtoolu_1".to_string(),
                content: crate::protocol::anthropic::WebSearchContent::Results(Vec::new()),
            },
        ]));
        state.record_web_search();
        state.begin_round();
        events.extend(state.push_chunk(&content("Found it.")));
        events.extend(state.push_chunk(&finish("stop")));
        events.extend(state.close_round());
        events.extend(state.finish());

        assert_well_formed(&events);
        let kinds: Vec<String> = blocks(&events).into_iter().map(|(kind, _)| kind).collect();
        assert_eq!(
            kinds,
            vec!["text", "server_tool_use", "web_search_tool_result", "text"]
        );
        assert_eq!(blocks(&events)[1].1, "{\"query\":\"rust\"}");

        let (delta, usage) = message_delta(&events);
        assert_eq!(delta.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(usage.server_tool_use.as_ref().unwrap().web_search_requests, 1);
    }

    #[test]
    fn failure_mid_block_closes_it_then_errors() {
        let mut state = StreamState::new("m", 0);
        let mut events = state.push_chunk(&content("<think>partial"));
        events.extend(state.fail(&ProxyError::UpstreamProtocol("bad chunk".to_string())));
        assert_well_formed(&events);

        assert_eq!(blocks(&events), vec![("thinking".to_string(), "partial".to_string())]);
        let Some(StreamEvent::Error { error }) = events.last() else {
            panic!("expected trailing error event");
        };
        assert_eq!(error.error_type, "decode_error");
        assert!(state.finish().is_empty());
        assert!(state.push_chunk(&content("late")).is_empty());
    }

    #[test]
    fn failure_before_any_output_is_a_lone_error() {
        let mut state = StreamState::new("m", 0);
        let events = state.fail(&ProxyError::UpstreamConnection("refused".to_string()));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error { error } if error.error_type == "connection_error"));
    }

    #[test]
    fn output_tokens_are_estimated_without_backend_usage() {
        let mut state = StreamState::new("m", 7);
        let events = run(&mut state, &[content("abcdefgh"), finish("length")]);
        let (delta, usage) = message_delta(&events);
        assert_eq!(delta.stop_reason, Some(StopReason::MaxTokens));
        assert_eq!(usage.input_tokens, 7);
        assert_eq!(usage.output_tokens, 2);
    }

    #[test]
    fn stop_string_is_reported_as_stop_sequence() {
        let mut state = StreamState::new("m", 0);
        let events = run(
            &mut state,
            &[
                content("one two"),
                chunk(json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop", "stop_reason": "END"}]})),
            ],
        );
        let (delta, _) = message_delta(&events);
        assert_eq!(delta.stop_reason, Some(StopReason::StopSequence));
        assert_eq!(delta.stop_sequence.as_deref(), Some("END"));
    }

    #[test]
    fn ordering_holds_for_mixed_delta_sequences() {
        let fragments: Vec<ChatCompletionChunk> = vec![
            content("intro "),
            content("<thi"),
            content("nk>deliber"),
            chunk(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "t0", "function": {"name": "a", "arguments": "{\"p\""}}
            ]}}]})),
            content("ating</thi"),
            content("nk>answer"),
            chunk(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": ":1}"}},
                {"index": 1, "id": "t1", "function": {"name": "b"}}
            ]}}]})),
            content(" tail"),
            chunk(json!({"choices": [{"index": 0, "delta": {"reasoning_content": "late thought"}}]})),
            content(" more"),
            finish("tool_calls"),
            content("after finish"),
        ];

        // Every prefix of the sequence, cut short by end-of-stream or failure.
        for cut in 0..=fragments.len() {
            let mut state = StreamState::new("m", 0);
            let mut events = Vec::new();
            for c in &fragments[..cut] {
                events.extend(state.push_chunk(c));
            }
            events.extend(state.close_round());
            events.extend(state.finish());
            assert_well_formed(&events);

            let mut state = StreamState::new("m", 0);
            let mut events = Vec::new();
            for c in &fragments[..cut] {
                events.extend(state.push_chunk(c));
            }
            events.extend(state.fail(&ProxyError::UpstreamTimeout("slow".to_string())));
            if cut == 0 {
                assert_eq!(events.len(), 1);
            } else {
                assert_well_formed(&events);
            }
        }
    }
}
