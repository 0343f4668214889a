use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Sender role of an injected message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
}

/// A message the proxy fabricated to stand in for a vendor completion.
///
/// Shaped like the vendor's conversation-tree message object so it can be
/// spliced into sync responses verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectedMessage {
    pub uuid: String,
    pub sender: Sender,
    pub index: u64,
    pub parent_message_uuid: String,
    pub created_at: String,
    pub updated_at: String,
    pub content: Vec<MessageContent>,
    pub attachments: Vec<serde_json::Value>,
    pub files: Vec<serde_json::Value>,
    pub files_v2: Vec<serde_json::Value>,
    pub sync_sources: Vec<serde_json::Value>,
    pub truncated: bool,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    pub start_timestamp: String,
    pub stop_timestamp: String,
}

impl InjectedMessage {
    fn new(sender: Sender, index: u64, parent: &str, text: &str) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            sender,
            index,
            parent_message_uuid: parent.to_string(),
            created_at: now.clone(),
            updated_at: now.clone(),
            content: vec![MessageContent {
                kind: "text".to_string(),
                text: text.to_string(),
                start_timestamp: now.clone(),
                stop_timestamp: now,
            }],
            attachments: Vec::new(),
            files: Vec::new(),
            files_v2: Vec::new(),
            sync_sources: Vec::new(),
            truncated: false,
            text: String::new(),
        }
    }
}

/// Root parent used when the client supplies none.
pub const ROOT_PARENT_UUID: &str = "00000000-0000-4000-8000-000000000000";

/// Per-conversation record of injected (user, assistant) pairs.
///
/// Consulted by the classifier's sync-inject branch; appended to by the
/// adapters after each successful intercepted completion. In-memory only.
#[derive(Default)]
pub struct ConversationStore {
    conversations: Mutex<HashMap<String, Vec<InjectedMessage>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a completed (user, assistant) exchange.
    ///
    /// `client_parent_uuid` is the parent the client named in its
    /// completion request; it only matters for the first message of a
    /// conversation. Returns the uuids of the two appended messages.
    pub fn append(
        &self,
        conv_uuid: &str,
        user_text: &str,
        assistant_text: &str,
        client_parent_uuid: Option<&str>,
    ) -> (String, String) {
        let mut conversations = self.conversations.lock().expect("conversation lock");
        let messages = conversations.entry(conv_uuid.to_string()).or_default();

        let next_index = messages.last().map(|m| m.index + 1).unwrap_or(0);
        let parent = match messages.last() {
            Some(last) => last.uuid.clone(),
            None => client_parent_uuid.unwrap_or(ROOT_PARENT_UUID).to_string(),
        };

        let user = InjectedMessage::new(Sender::User, next_index, &parent, user_text);
        let user_uuid = user.uuid.clone();
        let assistant =
            InjectedMessage::new(Sender::Assistant, next_index + 1, &user_uuid, assistant_text);
        let assistant_uuid = assistant.uuid.clone();

        messages.push(user);
        messages.push(assistant);
        (user_uuid, assistant_uuid)
    }

    pub fn get(&self, conv_uuid: &str) -> Vec<InjectedMessage> {
        self.conversations
            .lock()
            .expect("conversation lock")
            .get(conv_uuid)
            .cloned()
            .unwrap_or_default()
    }

    /// Uuid of the newest message, used as `current_leaf_message_uuid` in
    /// rewritten sync responses.
    pub fn current_leaf(&self, conv_uuid: &str) -> Option<String> {
        self.conversations
            .lock()
            .expect("conversation lock")
            .get(conv_uuid)
            .and_then(|m| m.last())
            .map(|m| m.uuid.clone())
    }

    pub fn has_messages(&self, conv_uuid: &str) -> bool {
        self.conversations
            .lock()
            .expect("conversation lock")
            .get(conv_uuid)
            .is_some_and(|m| !m.is_empty())
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        self.conversations
            .lock()
            .expect("conversation lock")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_strictly_increasing() {
        let store = ConversationStore::new();
        store.append("c", "q1", "a1", Some("p0"));
        store.append("c", "q2", "a2", Some("ignored-after-first"));
        let messages = store.get("c");
        let indices: Vec<u64> = messages.iter().map(|m| m.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_parent_chain() {
        let store = ConversationStore::new();
        let (u1, a1) = store.append("c", "q1", "a1", Some("client-parent"));
        let (u2, a2) = store.append("c", "q2", "a2", None);
        let messages = store.get("c");

        assert_eq!(messages[0].parent_message_uuid, "client-parent");
        assert_eq!(messages[1].parent_message_uuid, u1);
        // Second user message chains off the previous assistant.
        assert_eq!(messages[2].parent_message_uuid, a1);
        assert_eq!(messages[3].parent_message_uuid, u2);
        assert_eq!(store.current_leaf("c").as_deref(), Some(a2.as_str()));
    }

    #[test]
    fn test_root_parent_fallback() {
        let store = ConversationStore::new();
        store.append("c", "q", "a", None);
        assert_eq!(store.get("c")[0].parent_message_uuid, ROOT_PARENT_UUID);
    }

    #[test]
    fn test_distinct_conversations_isolated() {
        let store = ConversationStore::new();
        store.append("a", "q", "a", None);
        assert!(store.has_messages("a"));
        assert!(!store.has_messages("b"));
        assert!(store.get("b").is_empty());
    }
}
