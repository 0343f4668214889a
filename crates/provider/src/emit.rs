//! Re-encoding of adapter events into the Anthropic Messages SSE stream.
//!
//! Every emitted stream satisfies the event grammar
//! `message_start ping* (content_block_start (content_block_delta | ping)*
//! content_block_stop)* message_delta message_limit message_stop`,
//! including on error paths: a failure after `message_start` becomes
//! visible text in the current block and the stream still closes cleanly.

use crate::canonical::{AdapterEvent, StopReason};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    Tool,
}

/// One SSE frame, already formatted as `event: X\ndata: {...}\n\n`.
pub type Frame = String;

fn frame(event: &str, data: serde_json::Value) -> Frame {
    format!("event: {event}\ndata: {data}\n\n")
}

/// Stateful encoder for a single completion response.
pub struct MessageEncoder {
    model: String,
    message_id: String,
    message_uuid: String,
    next_block_index: u64,
    open_block: Option<BlockKind>,
    started: bool,
    finished: bool,
    input_tokens: u64,
    output_tokens: u64,
    collected_text: String,
}

impl MessageEncoder {
    pub fn new(model: &str) -> Self {
        let suffix: [u8; 12] = rand::random();
        let id = format!(
            "msg_{}",
            suffix.iter().map(|b| format!("{b:02x}")).collect::<String>()
        );
        Self {
            model: model.to_string(),
            message_id: id,
            message_uuid: uuid::Uuid::new_v4().to_string(),
            next_block_index: 0,
            open_block: None,
            started: false,
            finished: false,
            input_tokens: 0,
            output_tokens: 0,
            collected_text: String::new(),
        }
    }

    /// The `message_start` frame. Must be emitted exactly once, first.
    pub fn start(&mut self) -> Frame {
        self.started = true;
        frame(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "uuid": self.message_uuid,
                    "content": [],
                    "stop_reason": null,
                    "trace_id": uuid::Uuid::new_v4().to_string(),
                    "request_id": uuid::Uuid::new_v4().to_string(),
                }
            }),
        )
    }

    /// Keep-alive frame, legal anywhere between block boundaries.
    pub fn ping(&self) -> Frame {
        frame("ping", json!({"type": "ping"}))
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Assistant text accumulated so far, for the conversation store.
    pub fn collected_text(&self) -> &str {
        &self.collected_text
    }

    pub fn usage(&self) -> (u64, u64) {
        (self.input_tokens, self.output_tokens)
    }

    /// Translate one adapter event into zero or more frames.
    pub fn handle(&mut self, event: AdapterEvent) -> Vec<Frame> {
        if self.finished {
            return Vec::new();
        }
        match event {
            AdapterEvent::TextDelta(text) => {
                let mut frames = self.ensure_block(BlockKind::Text);
                self.collected_text.push_str(&text);
                frames.push(self.delta(json!({"type": "text_delta", "text": text})));
                frames
            }
            AdapterEvent::ThinkingDelta(text) => {
                let mut frames = self.ensure_block(BlockKind::Thinking);
                frames.push(self.delta(json!({"type": "thinking_delta", "thinking": text})));
                frames
            }
            AdapterEvent::ToolCallStart { id, name } => {
                let mut frames = self.close_block();
                frames.push(frame(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": self.next_block_index,
                        "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}},
                    }),
                ));
                self.open_block = Some(BlockKind::Tool);
                frames
            }
            AdapterEvent::ToolCallDelta(fragment) => {
                if self.open_block != Some(BlockKind::Tool) {
                    return Vec::new();
                }
                vec![self.delta(json!({"type": "input_json_delta", "partial_json": fragment}))]
            }
            AdapterEvent::ToolCallStop => self.close_block(),
            AdapterEvent::Usage {
                input_tokens,
                output_tokens,
            } => {
                self.input_tokens = self.input_tokens.max(input_tokens);
                self.output_tokens = self.output_tokens.max(output_tokens);
                Vec::new()
            }
            AdapterEvent::Done { stop_reason } => self.finish(stop_reason),
        }
    }

    /// Surface an error to the client UI and close the stream cleanly.
    pub fn fail(&mut self, message: &str) -> Vec<Frame> {
        if self.finished {
            return Vec::new();
        }
        let mut frames = Vec::new();
        if !self.started {
            frames.push(self.start());
        }
        let text = format!("⚠ Claudish Proxy Error\n\n{message}");
        frames.extend(self.handle(AdapterEvent::TextDelta(text)));
        frames.extend(self.finish(StopReason::Error));
        frames
    }

    fn finish(&mut self, stop_reason: StopReason) -> Vec<Frame> {
        let mut frames = self.close_block();
        frames.push(frame(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason.as_str(), "stop_sequence": null},
                "usage": {"input_tokens": self.input_tokens, "output_tokens": self.output_tokens},
            }),
        ));
        frames.push(frame(
            "message_limit",
            json!({"type": "message_limit", "message_limit": {"type": "within_limit"}}),
        ));
        frames.push(frame("message_stop", json!({"type": "message_stop"})));
        self.finished = true;
        frames
    }

    fn ensure_block(&mut self, kind: BlockKind) -> Vec<Frame> {
        if self.open_block == Some(kind) {
            return Vec::new();
        }
        let mut frames = self.close_block();
        let content_block = match kind {
            BlockKind::Text => json!({"type": "text", "text": ""}),
            BlockKind::Thinking => json!({"type": "thinking", "thinking": ""}),
            BlockKind::Tool => unreachable!("tool blocks open via ToolCallStart"),
        };
        frames.push(frame(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.next_block_index,
                "content_block": content_block,
            }),
        ));
        self.open_block = Some(kind);
        frames
    }

    fn close_block(&mut self) -> Vec<Frame> {
        if self.open_block.take().is_none() {
            return Vec::new();
        }
        let closed = frame(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": self.next_block_index}),
        );
        self.next_block_index += 1;
        vec![closed]
    }

    fn delta(&self, delta: serde_json::Value) -> Frame {
        frame(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.next_block_index,
                "delta": delta,
            }),
        )
    }
}
