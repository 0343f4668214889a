//! Request classification: auth capture, model tracking, and the
//! per-request routing decision.

use crate::httpparse::ParsedRequest;
use claudish_core::config::ConfigHandle;
use claudish_core::convstore::{ConversationStore, InjectedMessage};
use claudish_core::error::ProxyError;
use claudish_core::tracker::{CapturedAuth, ModelTracker};
use serde_json::Value;
use std::sync::Arc;

/// Exactly one route is chosen per parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Passthrough,
    Intercept {
        conv_uuid: String,
        target_model: String,
    },
    SyncInject {
        conv_uuid: String,
    },
}

pub struct Classifier {
    pub config: Arc<ConfigHandle>,
    pub tracker: Arc<ModelTracker>,
    pub captured: Arc<CapturedAuth>,
    pub convstore: Arc<ConversationStore>,
}

impl Classifier {
    /// Observe and route one request. Tracking updates happen before the
    /// routing decision; auth capture never overwrites earlier fields.
    pub fn classify(&self, request: &ParsedRequest) -> Route {
        let path = request.path_only();

        // 1. Opportunistic auth capture.
        if let Some(org) = segment_after(path, "organizations")
            && !self.captured.has_cookie()
        {
            self.captured.capture(org, &request.headers);
        }

        // 2. Model tracking.
        if request.method == "GET"
            && let Some(model) = segment_after(path, "model_configs")
        {
            self.tracker.observe_model_config(model);
        }
        if request.method == "POST"
            && let Some(conv) = segment_after(path, "chat_conversations")
        {
            self.tracker.observe_conversation(conv);
        }

        // 3. Routing decision.
        if request.method == "POST"
            && path.contains("/completion")
            && let Some(conv) = segment_after(path, "chat_conversations")
        {
            let routing = self.config.snapshot();
            if routing.enabled {
                let source = self.tracker.model_for_conversation(conv);
                let target = source
                    .as_deref()
                    .and_then(|s| routing.target_for(s))
                    .map(String::from)
                    .or_else(|| {
                        let sole = routing.sole_target().map(String::from);
                        if let Some(t) = &sole {
                            tracing::warn!(
                                "no tracked model for conversation {conv}; using sole routing target {t}"
                            );
                        }
                        sole
                    });
                if let Some(target_model) = target {
                    return Route::Intercept {
                        conv_uuid: conv.to_string(),
                        target_model,
                    };
                }
            }
        }

        if request.method == "GET"
            && let Some(conv) = conversation_detail_uuid(path)
            && has_tree_query(request)
            && self.convstore.has_messages(conv)
        {
            return Route::SyncInject {
                conv_uuid: conv.to_string(),
            };
        }

        Route::Passthrough
    }
}

/// The path segment immediately following `marker`.
fn segment_after<'a>(path: &'a str, marker: &str) -> Option<&'a str> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    while let Some(segment) = segments.next() {
        if segment == marker {
            return segments.next().filter(|s| !s.is_empty());
        }
    }
    None
}

/// The conversation uuid when `path` is exactly a conversation-detail URL
/// (no trailing sub-resource such as `/completion`).
fn conversation_detail_uuid(path: &str) -> Option<&str> {
    let uuid = segment_after(path, "chat_conversations")?;
    let last = path.trim_end_matches('/').rsplit('/').next();
    (last == Some(uuid)).then_some(uuid)
}

fn has_tree_query(request: &ParsedRequest) -> bool {
    request
        .query()
        .is_some_and(|q| q.split('&').any(|p| p.eq_ignore_ascii_case("tree=true")))
}

/// Splice stored injected messages into a fetched conversation document.
///
/// Messages already present (by uuid) are left alone; the result is
/// stably ordered by `index` and the leaf pointer moves to the newest
/// stored message.
pub fn merge_injected(
    conversation: &mut Value,
    messages: &[InjectedMessage],
    leaf_uuid: &str,
) -> Result<(), ProxyError> {
    let chat_messages = conversation
        .get_mut("chat_messages")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| ProxyError::Translation("no chat_messages in sync response".to_string()))?;

    for message in messages {
        let present = chat_messages
            .iter()
            .any(|m| m.get("uuid").and_then(|u| u.as_str()) == Some(message.uuid.as_str()));
        if !present {
            chat_messages.push(serde_json::to_value(message)?);
        }
    }
    chat_messages.sort_by_key(|m| m.get("index").and_then(|i| i.as_u64()).unwrap_or(0));

    conversation["current_leaf_message_uuid"] = Value::String(leaf_uuid.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use claudish_core::config::RoutingConfig;
    use claudish_core::convstore::ConversationStore;

    fn request(method: &str, path: &str) -> ParsedRequest {
        let mut parser = crate::httpparse::RequestParser::new();
        parser
            .feed(format!("{method} {path} HTTP/1.1\r\nHost: claude.ai\r\nCookie: s=1\r\n\r\n").as_bytes())
            .unwrap();
        parser.take().unwrap()
    }

    fn classifier() -> Classifier {
        let config = Arc::new(ConfigHandle::default());
        let mut routing = RoutingConfig::default();
        routing.enabled = true;
        routing
            .model_map
            .insert("claude-sonnet-4-5".to_string(), "oai/gpt-4o".to_string());
        config.replace(routing);
        Classifier {
            config,
            tracker: Arc::new(ModelTracker::new()),
            captured: Arc::new(CapturedAuth::new()),
            convstore: Arc::new(ConversationStore::new()),
        }
    }

    #[test]
    fn test_segment_after() {
        assert_eq!(
            segment_after("/api/organizations/org-1/chat_conversations/c-1/completion", "organizations"),
            Some("org-1")
        );
        assert_eq!(
            segment_after("/api/organizations/org-1/chat_conversations/c-1", "chat_conversations"),
            Some("c-1")
        );
        assert_eq!(segment_after("/api/me", "organizations"), None);
    }

    #[test]
    fn test_completion_intercepted_with_tracked_model() {
        let c = classifier();
        c.classify(&request("GET", "/api/model_configs/claude-sonnet-4-5"));
        let route = c.classify(&request(
            "POST",
            "/api/organizations/X/chat_conversations/C/completion",
        ));
        assert_eq!(
            route,
            Route::Intercept {
                conv_uuid: "C".to_string(),
                target_model: "oai/gpt-4o".to_string(),
            }
        );
    }

    #[test]
    fn test_completion_passthrough_when_disabled() {
        let c = classifier();
        c.classify(&request("GET", "/api/model_configs/claude-sonnet-4-5"));
        let mut routing = (*c.config.snapshot()).clone();
        routing.enabled = false;
        c.config.replace(routing);
        let route = c.classify(&request(
            "POST",
            "/api/organizations/X/chat_conversations/C/completion",
        ));
        assert_eq!(route, Route::Passthrough);
    }

    #[test]
    fn test_sole_target_sentinel() {
        // No model ever tracked; the single mapping target still applies.
        let c = classifier();
        let route = c.classify(&request(
            "POST",
            "/api/organizations/X/chat_conversations/C/completion",
        ));
        assert_eq!(
            route,
            Route::Intercept {
                conv_uuid: "C".to_string(),
                target_model: "oai/gpt-4o".to_string(),
            }
        );
    }

    #[test]
    fn test_ambiguous_targets_pass_through() {
        let c = classifier();
        let mut routing = (*c.config.snapshot()).clone();
        routing
            .model_map
            .insert("claude-opus-4-5".to_string(), "g/gemini-2.5-pro".to_string());
        c.config.replace(routing);
        // Unknown source model and disagreeing targets: do not guess.
        let route = c.classify(&request(
            "POST",
            "/api/organizations/X/chat_conversations/C/completion",
        ));
        assert_eq!(route, Route::Passthrough);
    }

    #[test]
    fn test_sync_inject_requires_stored_messages() {
        let c = classifier();
        let sync = request(
            "GET",
            "/api/organizations/X/chat_conversations/C?tree=True&rendering_mode=messages",
        );
        assert_eq!(c.classify(&sync), Route::Passthrough);

        c.convstore.append("C", "q", "a", None);
        assert_eq!(
            c.classify(&sync),
            Route::SyncInject {
                conv_uuid: "C".to_string()
            }
        );
    }

    #[test]
    fn test_completion_path_never_sync_injects() {
        let c = classifier();
        c.convstore.append("C", "q", "a", None);
        // A GET on a sub-resource is not a conversation-detail fetch.
        let route = c.classify(&request(
            "GET",
            "/api/organizations/X/chat_conversations/C/completion?tree=True",
        ));
        assert_eq!(route, Route::Passthrough);
    }

    #[test]
    fn test_exactly_one_route_for_corpus() {
        let c = classifier();
        c.convstore.append("C", "q", "a", None);
        c.classify(&request("GET", "/api/model_configs/claude-sonnet-4-5"));

        let corpus = [
            request("GET", "/api/me"),
            request("POST", "/api/organizations/X/chat_conversations/C"),
            request("POST", "/api/organizations/X/chat_conversations/C/completion"),
            request("GET", "/api/organizations/X/chat_conversations/C?tree=True"),
            request("GET", "/api/organizations/X/chat_conversations/C"),
        ];
        for req in &corpus {
            // classify returns a single Route by construction; this
            // asserts it is total over representative traffic.
            let _ = c.classify(req);
        }
    }

    #[test]
    fn test_auth_capture_write_once() {
        let c = classifier();
        c.classify(&request("GET", "/api/organizations/org-1/chat_conversations/C"));
        let state = c.captured.state();
        assert_eq!(state.organization_id.as_deref(), Some("org-1"));
        assert_eq!(state.headers.get("cookie").map(String::as_str), Some("s=1"));

        c.classify(&request("GET", "/api/organizations/org-2/chat_conversations/C"));
        assert_eq!(c.captured.state().organization_id.as_deref(), Some("org-1"));
    }

    #[test]
    fn test_merge_injected() {
        let store = ConversationStore::new();
        let (user_uuid, assistant_uuid) = store.append("C", "hi", "hello", None);
        let messages = store.get("C");

        let mut conversation = serde_json::json!({
            "uuid": "C",
            "chat_messages": [
                {"uuid": user_uuid, "index": 0, "sender": "user"},
                {"uuid": "upstream-1", "index": 5, "sender": "user"},
            ],
            "current_leaf_message_uuid": "upstream-1",
        });

        merge_injected(&mut conversation, &messages, &assistant_uuid).unwrap();
        let chat = conversation["chat_messages"].as_array().unwrap();
        // The user message was deduplicated by uuid; the assistant added.
        assert_eq!(chat.len(), 3);
        let indices: Vec<u64> = chat.iter().map(|m| m["index"].as_u64().unwrap()).collect();
        let mut sorted = indices.clone();
        sorted.sort();
        assert_eq!(indices, sorted);
        assert_eq!(conversation["current_leaf_message_uuid"], assistant_uuid);
    }

    #[test]
    fn test_merge_injected_requires_messages_array() {
        let mut conversation = serde_json::json!({"uuid": "C"});
        assert!(merge_injected(&mut conversation, &[], "leaf").is_err());
    }
}
