//! Anthropic-compatible providers (MiniMax, Kimi/Moonshot, GLM).
//!
//! These expose `/anthropic/v1/messages` endpoints speaking the Messages
//! wire format, so preparation is a straight re-encode and the upstream
//! SSE maps one-to-one onto adapter events.

use crate::canonical::{AdapterEvent, CanonicalRequest, Role, StopReason};
use crate::sse::SseEvent;
use serde_json::{Value, json};

/// Build the Messages API request body.
pub fn prepare_request(canonical: &CanonicalRequest, model: &str) -> Value {
    let messages: Vec<Value> = canonical
        .messages
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            json!({"role": role, "content": message.content})
        })
        .collect();

    let mut body = json!({
        "model": model,
        "messages": messages,
        "max_tokens": canonical.max_tokens.unwrap_or(32_000),
        "stream": canonical.stream,
    });

    if let Some(system) = &canonical.system {
        body["system"] = json!(system);
    }
    if let Some(temperature) = canonical.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(budget) = canonical.thinking_budget {
        body["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
    }
    if !canonical.tools.is_empty() {
        let tools: Vec<Value> = canonical
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema,
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }

    body
}

/// Translator from Anthropic Messages SSE events to adapter events.
pub struct StreamTranslator {
    stop_reason: Option<StopReason>,
    done: bool,
}

impl StreamTranslator {
    pub fn new() -> Self {
        Self {
            stop_reason: None,
            done: false,
        }
    }

    pub fn translate(&mut self, event: &SseEvent) -> Result<Vec<AdapterEvent>, String> {
        if self.done {
            return Ok(Vec::new());
        }

        let data: Value =
            serde_json::from_str(&event.data).map_err(|e| format!("malformed event: {e}"))?;
        let event_type = event
            .event
            .as_deref()
            .or_else(|| data.get("type").and_then(|t| t.as_str()))
            .unwrap_or_default();

        let mut events = Vec::new();
        match event_type {
            "message_start" => {
                if let Some(input) = data
                    .get("message")
                    .and_then(|m| m.get("usage"))
                    .and_then(|u| u.get("input_tokens"))
                    .and_then(|t| t.as_u64())
                {
                    events.push(AdapterEvent::Usage {
                        input_tokens: input,
                        output_tokens: 0,
                    });
                }
            }
            "content_block_start" => {
                if let Some(block) = data.get("content_block")
                    && block.get("type").and_then(|t| t.as_str()) == Some("tool_use")
                {
                    events.push(AdapterEvent::ToolCallStart {
                        id: block
                            .get("id")
                            .and_then(|i| i.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    });
                }
            }
            "content_block_delta" => {
                if let Some(delta) = data.get("delta") {
                    match delta.get("type").and_then(|t| t.as_str()) {
                        Some("text_delta") => {
                            if let Some(text) = delta.get("text").and_then(|t| t.as_str()) {
                                events.push(AdapterEvent::TextDelta(text.to_string()));
                            }
                        }
                        Some("thinking_delta") => {
                            if let Some(text) = delta.get("thinking").and_then(|t| t.as_str()) {
                                events.push(AdapterEvent::ThinkingDelta(text.to_string()));
                            }
                        }
                        Some("input_json_delta") => {
                            if let Some(json_fragment) =
                                delta.get("partial_json").and_then(|p| p.as_str())
                            {
                                events
                                    .push(AdapterEvent::ToolCallDelta(json_fragment.to_string()));
                            }
                        }
                        _ => {}
                    }
                }
            }
            "content_block_stop" => {
                // Only tool blocks need an explicit close downstream; the
                // encoder ignores stops for text blocks it reopens anyway.
                events.push(AdapterEvent::ToolCallStop);
            }
            "message_delta" => {
                if let Some(reason) = data
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|r| r.as_str())
                {
                    self.stop_reason = Some(match reason {
                        "tool_use" => StopReason::ToolUse,
                        "max_tokens" => StopReason::MaxTokens,
                        _ => StopReason::EndTurn,
                    });
                }
                if let Some(output) = data
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(|t| t.as_u64())
                {
                    events.push(AdapterEvent::Usage {
                        input_tokens: 0,
                        output_tokens: output,
                    });
                }
            }
            "message_stop" => {
                events.extend(self.finish());
            }
            "error" => {
                let message = data
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("upstream error");
                return Err(message.to_string());
            }
            _ => {}
        }

        Ok(events)
    }

    pub fn finish(&mut self) -> Vec<AdapterEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        vec![AdapterEvent::Done {
            stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
        }]
    }
}

impl Default for StreamTranslator {
    fn default() -> Self {
        Self::new()
    }
}
