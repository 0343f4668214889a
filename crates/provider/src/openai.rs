//! OpenAI-family wire translation (OpenAI, OpenRouter, OllamaCloud).

use crate::canonical::{AdapterEvent, CanonicalRequest, Role, StopReason};
use crate::sse::SseEvent;
use serde_json::{Value, json};
use std::collections::HashMap;

/// OpenAI rejects tool names longer than this.
pub const TOOL_NAME_LIMIT: usize = 64;

/// Maps truncated tool names back to the originals so responses carry the
/// names the client declared.
#[derive(Debug, Default)]
pub struct ToolNameMapper {
    truncated_to_original: HashMap<String, String>,
}

impl ToolNameMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorten a name to the wire limit, remembering the mapping.
    /// Collisions between distinct long names get a numeric suffix.
    pub fn shorten(&mut self, name: &str) -> String {
        if name.len() <= TOOL_NAME_LIMIT {
            return name.to_string();
        }
        let mut candidate: String = name.chars().take(TOOL_NAME_LIMIT).collect();
        let mut counter = 1;
        while self
            .truncated_to_original
            .get(&candidate)
            .is_some_and(|original| original != name)
        {
            let suffix = format!("_{counter}");
            candidate = name
                .chars()
                .take(TOOL_NAME_LIMIT - suffix.len())
                .collect::<String>()
                + &suffix;
            counter += 1;
        }
        self.truncated_to_original
            .insert(candidate.clone(), name.to_string());
        candidate
    }

    /// Original name for a possibly-truncated wire name.
    pub fn restore(&self, name: &str) -> String {
        self.truncated_to_original
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.truncated_to_original.is_empty()
    }
}

/// Map a thinking budget to OpenAI's discrete reasoning effort levels.
pub fn reasoning_effort(budget_tokens: u64) -> &'static str {
    match budget_tokens {
        0..4000 => "minimal",
        4000..16000 => "low",
        16000..32000 => "medium",
        _ => "high",
    }
}

/// Build the Chat Completions request body.
pub fn prepare_request(
    canonical: &CanonicalRequest,
    model: &str,
    names: &mut ToolNameMapper,
) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = &canonical.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    for message in &canonical.messages {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        messages.push(json!({"role": role, "content": message.content}));
    }

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": canonical.stream,
    });

    if canonical.stream {
        body["stream_options"] = json!({"include_usage": true});
    }
    if let Some(max_tokens) = canonical.max_tokens {
        body["max_completion_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = canonical.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(budget) = canonical.thinking_budget {
        body["reasoning_effort"] = json!(reasoning_effort(budget));
    }

    if !canonical.tools.is_empty() {
        let tools: Vec<Value> = canonical
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": names.shorten(&tool.name),
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }

    body
}

/// Incremental translator from Chat Completions chunks to adapter events.
///
/// Tool calls arrive as indexed fragments; a change of index closes the
/// open tool block and starts the next.
pub struct StreamTranslator {
    names: ToolNameMapper,
    current_tool_index: Option<u64>,
    finish_reason: Option<StopReason>,
    done: bool,
}

impl StreamTranslator {
    pub fn new(names: ToolNameMapper) -> Self {
        Self {
            names,
            current_tool_index: None,
            finish_reason: None,
            done: false,
        }
    }

    pub fn translate(&mut self, event: &SseEvent) -> Result<Vec<AdapterEvent>, String> {
        if self.done {
            return Ok(Vec::new());
        }
        if event.is_done_sentinel() {
            return Ok(self.finish());
        }

        let chunk: Value =
            serde_json::from_str(&event.data).map_err(|e| format!("malformed chunk: {e}"))?;

        if let Some(error) = chunk.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("upstream error");
            return Err(message.to_string());
        }

        let mut events = Vec::new();

        if let Some(usage) = chunk.get("usage")
            && usage.is_object()
        {
            events.push(AdapterEvent::Usage {
                input_tokens: usage
                    .get("prompt_tokens")
                    .and_then(|t| t.as_u64())
                    .unwrap_or(0),
                output_tokens: usage
                    .get("completion_tokens")
                    .and_then(|t| t.as_u64())
                    .unwrap_or(0),
            });
        }

        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            return Ok(events);
        };

        if let Some(delta) = choice.get("delta") {
            if let Some(reasoning) = delta
                .get("reasoning_content")
                .and_then(|r| r.as_str())
                .filter(|r| !r.is_empty())
            {
                events.push(AdapterEvent::ThinkingDelta(reasoning.to_string()));
            }
            if let Some(content) = delta
                .get("content")
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
            {
                events.push(AdapterEvent::TextDelta(content.to_string()));
            }
            if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                for call in tool_calls {
                    events.extend(self.translate_tool_fragment(call));
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
            self.finish_reason = Some(match reason {
                "tool_calls" => StopReason::ToolUse,
                "length" => StopReason::MaxTokens,
                _ => StopReason::EndTurn,
            });
        }

        Ok(events)
    }

    /// Flush terminal events when the byte stream ends without a `[DONE]`.
    pub fn finish(&mut self) -> Vec<AdapterEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        let mut events = Vec::new();
        if self.current_tool_index.take().is_some() {
            events.push(AdapterEvent::ToolCallStop);
        }
        events.push(AdapterEvent::Done {
            stop_reason: self.finish_reason.unwrap_or(StopReason::EndTurn),
        });
        events
    }

    fn translate_tool_fragment(&mut self, call: &Value) -> Vec<AdapterEvent> {
        let mut events = Vec::new();
        let index = call.get("index").and_then(|i| i.as_u64()).unwrap_or(0);

        if self.current_tool_index != Some(index) {
            if self.current_tool_index.is_some() {
                events.push(AdapterEvent::ToolCallStop);
            }
            let id = call
                .get("id")
                .and_then(|i| i.as_str())
                .map(String::from)
                .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
            let wire_name = call
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())
                .unwrap_or_default();
            events.push(AdapterEvent::ToolCallStart {
                id,
                name: self.names.restore(wire_name),
            });
            self.current_tool_index = Some(index);
        }

        if let Some(arguments) = call
            .get("function")
            .and_then(|f| f.get("arguments"))
            .and_then(|a| a.as_str())
            .filter(|a| !a.is_empty())
        {
            events.push(AdapterEvent::ToolCallDelta(arguments.to_string()));
        }

        events
    }
}
