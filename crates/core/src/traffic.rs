use crate::ring::RingBuffer;
use serde::{Deserialize, Serialize};

pub const TRAFFIC_CAPACITY: usize = 500;

/// One observed request flowing through the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficEntry {
    pub ts: i64,
    pub method: String,
    pub host: String,
    pub path: String,
    pub content_length: u64,
    pub detected_app: String,
    pub confidence: f32,
}

/// Classify the calling application from its User-Agent.
pub fn detect_app(user_agent: Option<&str>) -> (String, f32) {
    match user_agent {
        Some(ua) if ua.contains("claude-cli") => ("claude-code".to_string(), 0.95),
        Some(ua) if ua.contains("Claude") => ("claude-desktop".to_string(), 0.8),
        Some(ua) if ua.contains("Mozilla") => ("browser".to_string(), 0.5),
        Some(_) => ("unknown".to_string(), 0.1),
        None => ("unknown".to_string(), 0.0),
    }
}

pub struct TrafficStore {
    ring: RingBuffer<TrafficEntry>,
}

impl TrafficStore {
    pub fn new() -> Self {
        Self {
            ring: RingBuffer::new(TRAFFIC_CAPACITY),
        }
    }

    pub fn record(
        &self,
        method: &str,
        host: &str,
        path: &str,
        content_length: u64,
        user_agent: Option<&str>,
    ) {
        let (detected_app, confidence) = detect_app(user_agent);
        self.ring.push(TrafficEntry {
            ts: chrono::Utc::now().timestamp_millis(),
            method: method.to_string(),
            host: host.to_string(),
            path: path.to_string(),
            content_length,
            detected_app,
            confidence,
        });
    }

    pub fn recent(&self, limit: usize) -> Vec<TrafficEntry> {
        self.ring.recent(limit, 0)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn clear(&self) {
        self.ring.clear()
    }
}

impl Default for TrafficStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_app() {
        assert_eq!(detect_app(Some("claude-cli/2.0")).0, "claude-code");
        assert_eq!(detect_app(Some("Claude/1.2 Electron")).0, "claude-desktop");
        assert_eq!(detect_app(None).0, "unknown");
    }

    #[test]
    fn test_record_bounded() {
        let store = TrafficStore::new();
        for i in 0..TRAFFIC_CAPACITY + 20 {
            store.record("GET", "claude.ai", &format!("/api/{i}"), 0, None);
        }
        assert_eq!(store.len(), TRAFFIC_CAPACITY);
        let recent = store.recent(1);
        assert_eq!(recent[0].path, format!("/api/{}", TRAFFIC_CAPACITY + 19));
    }
}
