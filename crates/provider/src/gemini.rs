//! Gemini wire translation (Generative Language API and Code Assist).

use crate::canonical::{AdapterEvent, CanonicalRequest, Role, StopReason};
use crate::sse::SseEvent;
use serde_json::{Map, Value, json};

/// JSON-Schema fields the Gemini API rejects outright.
const STRIPPED_FIELDS: &[&str] = &[
    "$schema",
    "$ref",
    "$defs",
    "definitions",
    "anyOf",
    "oneOf",
    "allOf",
    "format",
    "default",
    "const",
    "examples",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "minimum",
    "maximum",
    "multipleOf",
    "minLength",
    "maxLength",
    "pattern",
    "minItems",
    "maxItems",
    "uniqueItems",
    "minProperties",
    "maxProperties",
    "additionalProperties",
];

/// Strip schema constructs Gemini rejects and normalize nullable type
/// arrays. Idempotent: sanitizing a sanitized schema is a no-op.
pub fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                if STRIPPED_FIELDS.contains(&key.as_str()) {
                    continue;
                }
                match key.as_str() {
                    // `type: [string, null]` → first non-null entry.
                    "type" => match value {
                        Value::Array(types) => {
                            let first = types
                                .iter()
                                .find(|t| t.as_str() != Some("null"))
                                .cloned()
                                .unwrap_or(Value::String("string".to_string()));
                            out.insert("type".to_string(), first);
                        }
                        other => {
                            out.insert("type".to_string(), other.clone());
                        }
                    },
                    "properties" => {
                        if let Value::Object(props) = value {
                            let sanitized: Map<String, Value> = props
                                .iter()
                                .map(|(name, prop)| (name.clone(), sanitize_schema(prop)))
                                .collect();
                            out.insert("properties".to_string(), Value::Object(sanitized));
                        }
                    }
                    "items" => {
                        out.insert("items".to_string(), sanitize_schema(value));
                    }
                    _ => {
                        out.insert(key.clone(), value.clone());
                    }
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Build the `generateContent` request body.
pub fn prepare_request(canonical: &CanonicalRequest) -> Value {
    let mut contents = Vec::new();
    for message in &canonical.messages {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "model",
        };
        contents.push(json!({
            "role": role,
            "parts": [{"text": message.content}],
        }));
    }

    let mut body = json!({"contents": contents});

    if let Some(system) = &canonical.system {
        body["systemInstruction"] = json!({"parts": [{"text": system}]});
    }

    let mut generation_config = Map::new();
    if let Some(max_tokens) = canonical.max_tokens {
        generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = canonical.temperature {
        generation_config.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(budget) = canonical.thinking_budget {
        generation_config.insert(
            "thinkingConfig".to_string(),
            json!({"thinkingBudget": budget, "includeThoughts": true}),
        );
    }
    if !generation_config.is_empty() {
        body["generationConfig"] = Value::Object(generation_config);
    }

    if !canonical.tools.is_empty() {
        let declarations: Vec<Value> = canonical
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": sanitize_schema(&tool.input_schema),
                })
            })
            .collect();
        body["tools"] = json!([{"functionDeclarations": declarations}]);
    }

    body
}

/// Translator from `streamGenerateContent` SSE responses to adapter
/// events. Gemini delivers function calls whole, so each becomes a full
/// start/delta/stop triple.
pub struct StreamTranslator {
    finish_reason: Option<StopReason>,
    saw_tool_call: bool,
    done: bool,
}

impl StreamTranslator {
    pub fn new() -> Self {
        Self {
            finish_reason: None,
            saw_tool_call: false,
            done: false,
        }
    }

    pub fn translate(&mut self, event: &SseEvent) -> Result<Vec<AdapterEvent>, String> {
        if self.done {
            return Ok(Vec::new());
        }

        let mut chunk: Value =
            serde_json::from_str(&event.data).map_err(|e| format!("malformed chunk: {e}"))?;

        // Code Assist wraps each generation response in a `response` field.
        if let Some(inner) = chunk.get("response") {
            chunk = inner.clone();
        }

        if let Some(error) = chunk.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("upstream error");
            return Err(message.to_string());
        }

        let mut events = Vec::new();

        if let Some(usage) = chunk.get("usageMetadata") {
            events.push(AdapterEvent::Usage {
                input_tokens: usage
                    .get("promptTokenCount")
                    .and_then(|t| t.as_u64())
                    .unwrap_or(0),
                output_tokens: usage
                    .get("candidatesTokenCount")
                    .and_then(|t| t.as_u64())
                    .unwrap_or(0),
            });
        }

        let Some(candidate) = chunk.get("candidates").and_then(|c| c.get(0)) else {
            return Ok(events);
        };

        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    if part.get("thought").and_then(|t| t.as_bool()).unwrap_or(false) {
                        events.push(AdapterEvent::ThinkingDelta(text.to_string()));
                    } else {
                        events.push(AdapterEvent::TextDelta(text.to_string()));
                    }
                } else if let Some(call) = part.get("functionCall") {
                    let name = call
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let args = call.get("args").cloned().unwrap_or(json!({}));
                    events.push(AdapterEvent::ToolCallStart {
                        id: format!("toolu_{}", uuid::Uuid::new_v4().simple()),
                        name,
                    });
                    events.push(AdapterEvent::ToolCallDelta(args.to_string()));
                    events.push(AdapterEvent::ToolCallStop);
                    self.saw_tool_call = true;
                }
            }
        }

        if let Some(reason) = candidate.get("finishReason").and_then(|r| r.as_str()) {
            self.finish_reason = Some(match reason {
                "MAX_TOKENS" => StopReason::MaxTokens,
                _ if self.saw_tool_call => StopReason::ToolUse,
                _ => StopReason::EndTurn,
            });
        }

        Ok(events)
    }

    pub fn finish(&mut self) -> Vec<AdapterEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        let fallback = if self.saw_tool_call {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        };
        vec![AdapterEvent::Done {
            stop_reason: self.finish_reason.unwrap_or(fallback),
        }]
    }
}

impl Default for StreamTranslator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;

    #[test]
    fn test_sanitize_strips_rejected_fields() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "city": {"type": ["string", "null"], "format": "city", "minLength": 1},
                "tags": {"type": "array", "items": {"type": "string", "pattern": "^t"}},
            },
        });
        let sanitized = sanitize_schema(&schema);
        assert_json_eq!(
            sanitized,
            json!({
                "type": "object",
                "properties": {
                    "city": {"type": "string"},
                    "tags": {"type": "array", "items": {"type": "string"}},
                },
            })
        );
    }

    #[test]
    fn test_sanitize_idempotent() {
        let schema = json!({
            "type": ["object", "null"],
            "anyOf": [{"type": "string"}],
            "properties": {"a": {"type": ["integer", "null"], "default": 3}},
            "items": {"oneOf": []},
        });
        let once = sanitize_schema(&schema);
        let twice = sanitize_schema(&once);
        assert_json_eq!(once, twice);
    }

    #[test]
    fn test_prepare_request_tools() {
        let canonical = CanonicalRequest {
            model: "g/gemini-2.5-pro".into(),
            system: Some("sys".into()),
            messages: vec![crate::canonical::CanonicalMessage {
                role: Role::User,
                content: "hi".into(),
            }],
            tools: vec![crate::canonical::CanonicalTool {
                name: "lookup".into(),
                description: "d".into(),
                input_schema: json!({"type": "object", "$schema": "x"}),
            }],
            max_tokens: Some(100),
            temperature: None,
            thinking_budget: None,
            stream: true,
        };
        let body = prepare_request(&canonical);
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
        let decl = &body["tools"][0]["functionDeclarations"][0];
        assert_eq!(decl["name"], "lookup");
        assert!(decl["parameters"].get("$schema").is_none());
    }

    #[test]
    fn test_stream_text_and_thought() {
        let mut translator = StreamTranslator::new();
        let events = translator
            .translate(&SseEvent {
                event: None,
                data: json!({"candidates": [{"content": {"parts": [
                    {"text": "mull", "thought": true},
                    {"text": "answer"},
                ]}}]})
                .to_string(),
            })
            .unwrap();
        assert_eq!(
            events,
            vec![
                AdapterEvent::ThinkingDelta("mull".into()),
                AdapterEvent::TextDelta("answer".into()),
            ]
        );
    }

    #[test]
    fn test_stream_function_call_whole() {
        let mut translator = StreamTranslator::new();
        let events = translator
            .translate(&SseEvent {
                event: None,
                data: json!({"candidates": [{
                    "content": {"parts": [{"functionCall": {"name": "lookup", "args": {"q": 1}}}]},
                    "finishReason": "STOP",
                }]})
                .to_string(),
            })
            .unwrap();
        assert!(matches!(events[0], AdapterEvent::ToolCallStart { .. }));
        assert_eq!(events[1], AdapterEvent::ToolCallDelta("{\"q\":1}".into()));
        assert_eq!(events[2], AdapterEvent::ToolCallStop);

        let done = translator.finish();
        assert_eq!(
            done,
            vec![AdapterEvent::Done {
                stop_reason: StopReason::ToolUse
            }]
        );
    }

    #[test]
    fn test_max_tokens_finish() {
        let mut translator = StreamTranslator::new();
        translator
            .translate(&SseEvent {
                event: None,
                data: json!({"candidates": [{"finishReason": "MAX_TOKENS"}]}).to_string(),
            })
            .unwrap();
        assert_eq!(
            translator.finish(),
            vec![AdapterEvent::Done {
                stop_reason: StopReason::MaxTokens
            }]
        );
    }
}
