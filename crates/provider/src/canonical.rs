use serde::{Deserialize, Serialize};

/// Provider-neutral form of one chat turn, extracted from the vendor's
/// completion request before any wire translation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanonicalRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<CanonicalMessage>,
    pub tools: Vec<CanonicalTool>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    /// Requested thinking budget in tokens, when the client asked for
    /// extended reasoning.
    pub thinking_budget: Option<u64>,
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalTool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

impl CanonicalRequest {
    /// Build the canonical request from a vendor completion body
    /// (`{prompt, parent_message_uuid, ...}`).
    pub fn from_vendor_completion(model: &str, body: &serde_json::Value) -> Self {
        let prompt = body
            .get("prompt")
            .and_then(|p| p.as_str())
            .unwrap_or_default()
            .to_string();

        Self {
            model: model.to_string(),
            system: None,
            messages: vec![CanonicalMessage {
                role: Role::User,
                content: prompt,
            }],
            tools: Vec::new(),
            max_tokens: Some(32_000),
            temperature: None,
            thinking_budget: body
                .get("thinking")
                .and_then(|t| t.get("budget_tokens"))
                .and_then(|b| b.as_u64()),
            stream: true,
        }
    }

    pub fn user_text(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }
}

/// Why the upstream finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Error,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::ToolUse => "tool_use",
            Self::MaxTokens => "max_tokens",
            Self::Error => "error",
        }
    }
}

/// Neutral streaming event produced by every adapter, consumed by the
/// Anthropic SSE encoder.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    TextDelta(String),
    ThinkingDelta(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta(String),
    ToolCallStop,
    Usage { input_tokens: u64, output_tokens: u64 },
    Done { stop_reason: StopReason },
}
