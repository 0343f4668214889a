//! Anthropic-format `/v1/messages` endpoint for CLI clients pointed at
//! the control API via a base-URL override. Requests route through the
//! same model map and adapters as intercepted desktop traffic.

use crate::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use claudish_core::error::ProxyError;
use claudish_provider::adapter;
use claudish_provider::canonical::{
    AdapterEvent, CanonicalMessage, CanonicalRequest, CanonicalTool, Role, StopReason,
};
use claudish_provider::emit::MessageEncoder;
use serde_json::{Value, json};
use tokio_stream::StreamExt;

pub async fn messages(
    State(state): State<AppState>,
    body: bytes::Bytes,
) -> Result<Response, ProxyError> {
    if !state.controller.is_enabled().await {
        return Err(ProxyError::ProxyDisabled);
    }
    let core = state.controller.core().clone();

    let request: Value = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::BadRequest(format!("invalid JSON body: {e}")))?;
    let source_model = request
        .get("model")
        .and_then(|m| m.as_str())
        .ok_or_else(|| ProxyError::BadRequest("missing model".to_string()))?;

    // A mapped source model routes per configuration; an already-prefixed
    // target is used directly.
    let routing = core.config.snapshot();
    let target_model = routing
        .target_for(source_model)
        .map(String::from)
        .unwrap_or_else(|| source_model.to_string());
    let resolved = claudish_provider::resolve(&target_model).ok_or_else(|| {
        ProxyError::BadRequest(format!("no routing target for model {source_model}"))
    })?;

    let canonical = canonical_from_messages(&request, &target_model);
    let auth = adapter::AuthContext {
        api_keys: core.config.settings().api_keys.clone(),
        gemini_oauth: Some(core.gemini_oauth.clone()),
        kimi_oauth: Some(core.kimi_oauth.clone()),
        device_id: Some(core.device_id.clone()),
    };

    let mut encoder = MessageEncoder::new(&target_model);
    let events = match adapter::run_completion(&core.http, &resolved, &canonical, &auth).await {
        Ok(events) => events,
        Err(e) => {
            // Error-shaped but well-formed stream, so the client UI
            // renders the message instead of hanging.
            let frames = encoder.fail(&format!("Failed to route request to {target_model}: {e}"));
            return Ok(sse_response(futures::stream::iter(frames)));
        }
    };

    if canonical.stream {
        let stream = frame_stream(encoder, events, target_model);
        Ok(sse_response(stream))
    } else {
        let message = collect_message(encoder, events, &target_model).await;
        Ok(axum::Json(message).into_response())
    }
}

fn sse_response(frames: impl futures::Stream<Item = String> + Send + 'static) -> Response {
    let body = Body::from_stream(frames.map(|f| Ok::<_, std::convert::Infallible>(f)));
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// Drive the adapter events through the encoder as an SSE frame stream.
fn frame_stream(
    mut encoder: MessageEncoder,
    mut events: adapter::EventStream,
    target_model: String,
) -> impl futures::Stream<Item = String> + Send + 'static {
    let (tx, rx) = tokio::sync::mpsc::channel::<String>(32);
    tokio::spawn(async move {
        if tx.send(encoder.start()).await.is_err() {
            return;
        }
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    for frame in encoder.handle(event) {
                        if tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                    if encoder.finished() {
                        return;
                    }
                }
                Err(e) => {
                    for frame in
                        encoder.fail(&format!("Failed to route request to {target_model}: {e}"))
                    {
                        let _ = tx.send(frame).await;
                    }
                    return;
                }
            }
        }
        if !encoder.finished() {
            for frame in encoder.handle(AdapterEvent::Done {
                stop_reason: StopReason::EndTurn,
            }) {
                let _ = tx.send(frame).await;
            }
        }
    });
    tokio_stream::wrappers::ReceiverStream::new(rx)
}

/// Buffer the whole completion into one Messages-API response object.
async fn collect_message(
    mut encoder: MessageEncoder,
    mut events: adapter::EventStream,
    target_model: &str,
) -> Value {
    let mut text = String::new();
    let mut tool_blocks: Vec<Value> = Vec::new();
    let mut current_tool: Option<(String, String, String)> = None;
    let mut stop_reason = StopReason::EndTurn;

    while let Some(event) = events.next().await {
        match event {
            Ok(AdapterEvent::TextDelta(t)) => text.push_str(&t),
            Ok(AdapterEvent::ThinkingDelta(_)) => {}
            Ok(AdapterEvent::ToolCallStart { id, name }) => {
                current_tool = Some((id, name, String::new()));
            }
            Ok(AdapterEvent::ToolCallDelta(fragment)) => {
                if let Some((_, _, args)) = current_tool.as_mut() {
                    args.push_str(&fragment);
                }
            }
            Ok(AdapterEvent::ToolCallStop) => {
                if let Some((id, name, args)) = current_tool.take() {
                    let input: Value =
                        serde_json::from_str(&args).unwrap_or_else(|_| json!({}));
                    tool_blocks.push(json!({
                        "type": "tool_use", "id": id, "name": name, "input": input,
                    }));
                }
            }
            Ok(usage @ AdapterEvent::Usage { .. }) => {
                encoder.handle(usage);
            }
            Ok(AdapterEvent::Done { stop_reason: r }) => stop_reason = r,
            Err(e) => {
                text.push_str(&format!("\n⚠ Claudish Proxy Error: {e}"));
                stop_reason = StopReason::Error;
                break;
            }
        }
    }

    let mut content = Vec::new();
    if !text.is_empty() {
        content.push(json!({"type": "text", "text": text}));
    }
    content.extend(tool_blocks);
    let (input_tokens, output_tokens) = encoder.usage();

    json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": target_model,
        "content": content,
        "stop_reason": stop_reason.as_str(),
        "stop_sequence": null,
        "usage": {"input_tokens": input_tokens, "output_tokens": output_tokens},
    })
}

/// Lower an Anthropic Messages request body into the canonical form.
fn canonical_from_messages(body: &Value, target_model: &str) -> CanonicalRequest {
    let system = match body.get("system") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(blocks)) => {
            let text: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect();
            (!text.is_empty()).then(|| text.join("\n"))
        }
        _ => None,
    };

    let messages = body
        .get("messages")
        .and_then(|m| m.as_array())
        .map(|messages| {
            messages
                .iter()
                .filter_map(|message| {
                    let role = match message.get("role").and_then(|r| r.as_str()) {
                        Some("assistant") => Role::Assistant,
                        Some("user") => Role::User,
                        _ => return None,
                    };
                    let content = match message.get("content") {
                        Some(Value::String(s)) => s.clone(),
                        Some(Value::Array(blocks)) => blocks
                            .iter()
                            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                            .collect::<Vec<_>>()
                            .join("\n"),
                        _ => String::new(),
                    };
                    Some(CanonicalMessage { role, content })
                })
                .collect()
        })
        .unwrap_or_default();

    let tools = body
        .get("tools")
        .and_then(|t| t.as_array())
        .map(|tools| {
            tools
                .iter()
                .filter_map(|tool| {
                    Some(CanonicalTool {
                        name: tool.get("name")?.as_str()?.to_string(),
                        description: tool
                            .get("description")
                            .and_then(|d| d.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        input_schema: tool
                            .get("input_schema")
                            .cloned()
                            .unwrap_or_else(|| json!({"type": "object"})),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    CanonicalRequest {
        model: target_model.to_string(),
        system,
        messages,
        tools,
        max_tokens: body.get("max_tokens").and_then(|m| m.as_u64()),
        temperature: body.get("temperature").and_then(|t| t.as_f64()),
        thinking_budget: body
            .get("thinking")
            .and_then(|t| t.get("budget_tokens"))
            .and_then(|b| b.as_u64()),
        stream: body.get("stream").and_then(|s| s.as_bool()).unwrap_or(true),
    }
}
