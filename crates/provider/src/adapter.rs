//! Tagged adapter dispatch: one variant per wire family, selected once
//! when the intercepted request is constructed.

use crate::canonical::{AdapterEvent, CanonicalRequest};
use crate::oauth::{OAuthManager, TokenOutcome};
use crate::sse::{SseEvent, SseParser};
use crate::{ProviderDescriptor, ResolvedTarget, Wire, anthropic_compat, gemini, openai};
use bytes::Bytes;
use claudish_core::error::ProxyError;
use futures::Stream;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::StreamExt;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<AdapterEvent, ProxyError>> + Send>>;

/// Gemini Code Assist endpoint, used when the provider is OAuth-managed.
const CODE_ASSIST_URL: &str =
    "https://cloudcode-pa.googleapis.com/v1internal:streamGenerateContent?alt=sse";

/// Credential sources available to adapters, created at proxy startup.
#[derive(Clone, Default)]
pub struct AuthContext {
    /// Runtime API keys by provider name; merged over the environment.
    pub api_keys: HashMap<String, String>,
    pub gemini_oauth: Option<Arc<OAuthManager>>,
    pub kimi_oauth: Option<Arc<OAuthManager>>,
    pub device_id: Option<String>,
}

impl AuthContext {
    pub fn api_key_for(&self, descriptor: &ProviderDescriptor) -> Option<String> {
        if let Some(key) = self.api_keys.get(descriptor.name) {
            return Some(key.clone());
        }
        if descriptor.api_key_env.is_empty() {
            return None;
        }
        std::env::var(descriptor.api_key_env).ok()
    }
}

enum Translating {
    OpenAi(openai::StreamTranslator),
    Gemini(gemini::StreamTranslator),
    Anthropic(anthropic_compat::StreamTranslator),
}

impl Translating {
    fn translate(&mut self, event: &SseEvent) -> Result<Vec<AdapterEvent>, String> {
        match self {
            Self::OpenAi(t) => t.translate(event),
            Self::Gemini(t) => t.translate(event),
            Self::Anthropic(t) => t.translate(event),
        }
    }

    fn finish(&mut self) -> Vec<AdapterEvent> {
        match self {
            Self::OpenAi(t) => t.finish(),
            Self::Gemini(t) => t.finish(),
            Self::Anthropic(t) => t.finish(),
        }
    }
}

/// Run an intercepted completion against its resolved provider and hand
/// back the neutral event stream.
pub async fn run_completion(
    http: &reqwest::Client,
    resolved: &ResolvedTarget,
    canonical: &CanonicalRequest,
    auth: &AuthContext,
) -> Result<EventStream, ProxyError> {
    let descriptor = resolved.descriptor;
    let (url, body, headers, translator) = match descriptor.wire {
        Wire::OpenAi => {
            let key = auth.api_key_for(descriptor).ok_or_else(|| {
                ProxyError::Config(format!(
                    "no API key for {} (set {})",
                    descriptor.name, descriptor.api_key_env
                ))
            })?;
            let mut names = openai::ToolNameMapper::new();
            let body = openai::prepare_request(canonical, &resolved.model, &mut names);
            let headers = vec![("authorization".to_string(), format!("Bearer {key}"))];
            (
                format!("{}{}", descriptor.base_url, descriptor.api_path),
                body,
                headers,
                Translating::OpenAi(openai::StreamTranslator::new(names)),
            )
        }
        Wire::Gemini => {
            let body = gemini::prepare_request(canonical);
            match auth.api_key_for(descriptor) {
                Some(key) => {
                    let url = format!(
                        "{}{}",
                        descriptor.base_url,
                        descriptor.api_path.replace("{model}", &resolved.model)
                    );
                    let headers = vec![("x-goog-api-key".to_string(), key)];
                    (
                        url,
                        body,
                        headers,
                        Translating::Gemini(gemini::StreamTranslator::new()),
                    )
                }
                None => {
                    let manager = auth.gemini_oauth.as_ref().ok_or_else(|| {
                        ProxyError::Config(format!(
                            "no API key for gemini (set {}) and no OAuth login",
                            descriptor.api_key_env
                        ))
                    })?;
                    let token = resolve_oauth_token(manager, http, descriptor, auth).await?;
                    // Code Assist wraps the generation request.
                    let wrapped = serde_json::json!({
                        "model": resolved.model,
                        "request": body,
                    });
                    let headers =
                        vec![("authorization".to_string(), format!("Bearer {token}"))];
                    (
                        CODE_ASSIST_URL.to_string(),
                        wrapped,
                        headers,
                        Translating::Gemini(gemini::StreamTranslator::new()),
                    )
                }
            }
        }
        Wire::Anthropic => {
            let body = anthropic_compat::prepare_request(canonical, &resolved.model);
            let token = match auth.api_key_for(descriptor) {
                Some(key) => key,
                None if descriptor.name == "kimi" => {
                    let manager = auth.kimi_oauth.as_ref().ok_or_else(|| {
                        ProxyError::Config(format!(
                            "no API key for kimi (set {}) and no OAuth login",
                            descriptor.api_key_env
                        ))
                    })?;
                    resolve_oauth_token(manager, http, descriptor, auth).await?
                }
                None => {
                    return Err(ProxyError::Config(format!(
                        "no API key for {} (set {})",
                        descriptor.name, descriptor.api_key_env
                    )));
                }
            };
            let mut headers = vec![
                ("authorization".to_string(), format!("Bearer {token}")),
                ("anthropic-version".to_string(), "2023-06-01".to_string()),
            ];
            if descriptor.name == "kimi"
                && let Some(device_id) = &auth.device_id
            {
                headers.push(("x-device-id".to_string(), device_id.clone()));
            }
            (
                format!("{}{}", descriptor.base_url, descriptor.api_path),
                body,
                headers,
                Translating::Anthropic(anthropic_compat::StreamTranslator::new()),
            )
        }
    };

    let mut request = http
        .post(&url)
        .header("content-type", "application/json")
        .json(&body);
    for (name, value) in &headers {
        request = request.header(name.as_str(), value.as_str());
    }
    for (name, value) in descriptor.extra_headers {
        request = request.header(*name, *value);
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProxyError::Upstream {
            status: status.as_u16(),
            body,
        });
    }

    Ok(translate_stream(response.bytes_stream(), translator))
}

async fn resolve_oauth_token(
    manager: &Arc<OAuthManager>,
    http: &reqwest::Client,
    descriptor: &ProviderDescriptor,
    auth: &AuthContext,
) -> Result<String, ProxyError> {
    match manager.get_access_token(http).await {
        TokenOutcome::Token(token) => Ok(token),
        TokenOutcome::NeedApiKey => auth.api_key_for(descriptor).ok_or_else(|| {
            ProxyError::Config(format!(
                "{} OAuth expired and {} is unset",
                descriptor.name, descriptor.api_key_env
            ))
        }),
        TokenOutcome::Fatal(message) => Err(ProxyError::OAuth(message)),
    }
}

struct TranslateState {
    bytes: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    parser: SseParser,
    translator: Translating,
    pending: VecDeque<AdapterEvent>,
    finished: bool,
}

impl TranslateState {
    /// Run every decoded SSE event through the wire translator, queueing
    /// the results. An error from the translator poisons the stream.
    fn drain_parser(&mut self) -> Result<(), ProxyError> {
        while let Some(sse) = self.parser.next_event() {
            self.pending.extend(
                self.translator
                    .translate(&sse)
                    .map_err(ProxyError::Translation)?,
            );
        }
        Ok(())
    }
}

/// Decode the provider byte stream and drive the wire translator,
/// flushing terminal events when the upstream closes without a sentinel.
fn translate_stream(
    bytes: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    translator: Translating,
) -> EventStream {
    Box::pin(futures::stream::unfold(
        TranslateState {
            bytes: Box::pin(bytes),
            parser: SseParser::new(),
            translator,
            pending: VecDeque::new(),
            finished: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((Ok(event), state));
                }
                if state.finished {
                    return None;
                }
                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        let decoded = state
                            .parser
                            .feed(&chunk)
                            .and_then(|_| state.drain_parser());
                        if let Err(e) = decoded {
                            state.finished = true;
                            return Some((Err(e), state));
                        }
                    }
                    Some(Err(e)) => {
                        state.finished = true;
                        return Some((Err(ProxyError::Network(e.to_string())), state));
                    }
                    None => {
                        state.finished = true;
                        if let Some(sse) = state.parser.finish()
                            && let Ok(events) = state.translator.translate(&sse)
                        {
                            state.pending.extend(events);
                        }
                        state.pending.extend(state.translator.finish());
                    }
                }
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::StopReason;

    fn sse_bytes(frames: &[&str]) -> Vec<Result<Bytes, reqwest::Error>> {
        frames
            .iter()
            .map(|f| Ok(Bytes::from(f.to_string())))
            .collect()
    }

    fn openai_translator() -> Translating {
        Translating::OpenAi(openai::StreamTranslator::new(openai::ToolNameMapper::new()))
    }

    async fn run_translate(frames: Vec<Result<Bytes, reqwest::Error>>) -> Vec<AdapterEvent> {
        translate_stream(futures::stream::iter(frames), openai_translator())
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect()
    }

    #[tokio::test]
    async fn test_translate_stream_openai() {
        let events = run_translate(sse_bytes(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        ]))
        .await;
        assert_eq!(
            events,
            vec![
                AdapterEvent::TextDelta("hi".into()),
                AdapterEvent::Done {
                    stop_reason: StopReason::EndTurn
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_translate_stream_reassembles_split_chunks() {
        // The same SSE event spread over three network reads decodes once.
        let events = run_translate(sse_bytes(&[
            "data: {\"choices\":[{\"del",
            "ta\":{\"content\":\"hi\"}}]}",
            "\n\ndata: [DONE]\n\n",
        ]))
        .await;
        assert_eq!(events[0], AdapterEvent::TextDelta("hi".into()));
    }

    #[tokio::test]
    async fn test_translate_stream_flushes_on_eof() {
        // No [DONE] sentinel: the translator still emits Done.
        let events = run_translate(sse_bytes(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n",
        ]))
        .await;
        assert!(matches!(events.last(), Some(AdapterEvent::Done { .. })));
    }

    #[test]
    fn test_api_key_precedence() {
        let descriptor = crate::PROVIDERS.iter().find(|d| d.name == "minimax").unwrap();
        let mut auth = AuthContext::default();
        assert!(auth.api_key_for(descriptor).is_none() || std::env::var("MINIMAX_API_KEY").is_ok());
        auth.api_keys
            .insert("minimax".to_string(), "runtime-key".to_string());
        assert_eq!(auth.api_key_for(descriptor).as_deref(), Some("runtime-key"));
    }
}
