use std::collections::HashMap;
use std::sync::RwLock;

/// Model selection observed from vendor API traffic.
///
/// `GET /model_configs/{model}` marks the model the client is about to use;
/// `POST /chat_conversations/{uuid}` binds that model to the conversation.
/// An existing binding is never displaced by a later observation.
#[derive(Default)]
pub struct ModelTracker {
    inner: RwLock<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    current_model: Option<String>,
    conversation_models: HashMap<String, String>,
    last_updated: Option<i64>,
}

impl ModelTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_model_config(&self, model: &str) {
        let mut state = self.inner.write().expect("tracker lock");
        state.current_model = Some(model.to_string());
        state.last_updated = Some(chrono::Utc::now().timestamp_millis());
    }

    pub fn observe_conversation(&self, conv_uuid: &str) {
        let mut state = self.inner.write().expect("tracker lock");
        if state.conversation_models.contains_key(conv_uuid) {
            return;
        }
        if let Some(model) = state.current_model.clone() {
            state.conversation_models.insert(conv_uuid.to_string(), model);
            state.last_updated = Some(chrono::Utc::now().timestamp_millis());
        }
    }

    pub fn current_model(&self) -> Option<String> {
        self.inner.read().expect("tracker lock").current_model.clone()
    }

    /// Model for a conversation: the binding if present, else the current
    /// model.
    pub fn model_for_conversation(&self, conv_uuid: &str) -> Option<String> {
        let state = self.inner.read().expect("tracker lock");
        state
            .conversation_models
            .get(conv_uuid)
            .cloned()
            .or_else(|| state.current_model.clone())
    }

    pub fn conversation_map(&self) -> HashMap<String, String> {
        self.inner.read().expect("tracker lock").conversation_models.clone()
    }
}

/// Vendor auth material captured opportunistically from observed requests.
///
/// Each field is write-once; later observations never overwrite. Used only
/// to make server-initiated conversation-sync requests.
#[derive(Default)]
pub struct CapturedAuth {
    inner: RwLock<CapturedAuthState>,
}

#[derive(Debug, Clone, Default)]
pub struct CapturedAuthState {
    pub organization_id: Option<String>,
    pub headers: HashMap<String, String>,
    pub captured_at: Option<i64>,
}

/// Headers worth capturing for replayed sync requests.
const CAPTURED_HEADERS: &[&str] = &[
    "cookie",
    "authorization",
    "anthropic-client-id",
    "anthropic-client-platform",
    "anthropic-client-sha",
    "anthropic-client-version",
    "anthropic-device-id",
];

impl CapturedAuth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the organization id and auth headers from a request, keeping
    /// any previously captured values.
    pub fn capture(&self, organization_id: &str, request_headers: &[(String, String)]) {
        let mut state = self.inner.write().expect("captured auth lock");
        if state.organization_id.is_none() {
            state.organization_id = Some(organization_id.to_string());
        }
        for (name, value) in request_headers {
            let lower = name.to_ascii_lowercase();
            if CAPTURED_HEADERS.contains(&lower.as_str()) && !state.headers.contains_key(&lower) {
                state.headers.insert(lower, value.clone());
            }
        }
        if state.captured_at.is_none() {
            state.captured_at = Some(chrono::Utc::now().timestamp_millis());
        }
    }

    pub fn has_cookie(&self) -> bool {
        self.inner
            .read()
            .expect("captured auth lock")
            .headers
            .contains_key("cookie")
    }

    pub fn state(&self) -> CapturedAuthState {
        self.inner.read().expect("captured auth lock").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_binding_prefers_existing() {
        let tracker = ModelTracker::new();
        tracker.observe_model_config("claude-sonnet-4-5");
        tracker.observe_conversation("c1");
        tracker.observe_model_config("claude-opus-4-5");
        tracker.observe_conversation("c1");
        assert_eq!(
            tracker.model_for_conversation("c1").as_deref(),
            Some("claude-sonnet-4-5")
        );
        // An unbound conversation falls back to the current model.
        assert_eq!(
            tracker.model_for_conversation("c2").as_deref(),
            Some("claude-opus-4-5")
        );
    }

    #[test]
    fn test_conversation_without_model_is_unbound() {
        let tracker = ModelTracker::new();
        tracker.observe_conversation("c1");
        assert!(tracker.model_for_conversation("c1").is_none());
        assert!(tracker.conversation_map().is_empty());
    }

    #[test]
    fn test_capture_write_once() {
        let auth = CapturedAuth::new();
        auth.capture(
            "org-1",
            &[("Cookie".to_string(), "a=1".to_string())],
        );
        auth.capture(
            "org-2",
            &[
                ("cookie".to_string(), "b=2".to_string()),
                ("authorization".to_string(), "Bearer t".to_string()),
            ],
        );
        let state = auth.state();
        assert_eq!(state.organization_id.as_deref(), Some("org-1"));
        assert_eq!(state.headers.get("cookie").map(String::as_str), Some("a=1"));
        assert_eq!(
            state.headers.get("authorization").map(String::as_str),
            Some("Bearer t")
        );
    }
}
