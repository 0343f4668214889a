use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Model routing table, mutated only through the control API.
///
/// Reads go through [`ConfigHandle::snapshot`], which hands out an
/// immutable `Arc` so in-flight requests keep a consistent view while a
/// writer swaps in a replacement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingConfig {
    pub enabled: bool,
    /// source model id → prefixed target model id (e.g. "oai/gpt-4o").
    pub model_map: HashMap<String, String>,
}

impl RoutingConfig {
    /// The single target all mappings point to, if they agree.
    ///
    /// Used as the last-resort fallback when the tracker has no model for
    /// a conversation. Returns None when the map is empty or mappings
    /// disagree.
    pub fn sole_target(&self) -> Option<&str> {
        let mut iter = self.model_map.values();
        let first = iter.next()?;
        if iter.all(|t| t == first) {
            Some(first.as_str())
        } else {
            None
        }
    }

    /// Resolve the routing target for a source model.
    pub fn target_for(&self, source_model: &str) -> Option<&str> {
        self.model_map.get(source_model).map(|s| s.as_str())
    }
}

/// Hostnames the PAC steers through the dispatcher.
pub fn intercept_hosts() -> Vec<String> {
    vec!["api.anthropic.com".to_string(), "claude.ai".to_string()]
}

/// General proxy settings fixed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySettings {
    /// Static API keys by provider name, seeded from the environment and
    /// overridable via `POST /proxy/enable {apiKeys}`.
    pub api_keys: HashMap<String, String>,
    /// Ping cadence on intercepted SSE streams, seconds.
    pub ping_interval_secs: u64,
    /// Upstream TLS handshake timeout, seconds.
    pub handshake_timeout_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            api_keys: HashMap::new(),
            ping_interval_secs: 10,
            handshake_timeout_secs: 10,
        }
    }
}

/// Shared handle over the mutable configuration.
pub struct ConfigHandle {
    routing: ArcSwap<RoutingConfig>,
    settings: ArcSwap<ProxySettings>,
}

impl ConfigHandle {
    pub fn new(routing: RoutingConfig, settings: ProxySettings) -> Self {
        Self {
            routing: ArcSwap::from_pointee(routing),
            settings: ArcSwap::from_pointee(settings),
        }
    }

    pub fn snapshot(&self) -> Arc<RoutingConfig> {
        self.routing.load_full()
    }

    pub fn replace(&self, routing: RoutingConfig) {
        self.routing.store(Arc::new(routing));
    }

    pub fn settings(&self) -> Arc<ProxySettings> {
        self.settings.load_full()
    }

    pub fn replace_settings(&self, settings: ProxySettings) {
        self.settings.store(Arc::new(settings));
    }

    /// Merge API keys supplied at enable time over the existing set.
    pub fn merge_api_keys(&self, keys: HashMap<String, String>) {
        let mut settings = (*self.settings()).clone();
        settings.api_keys.extend(keys);
        self.replace_settings(settings);
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(RoutingConfig::default(), ProxySettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sole_target() {
        let mut cfg = RoutingConfig::default();
        assert!(cfg.sole_target().is_none());

        cfg.model_map
            .insert("claude-sonnet-4-5".into(), "oai/gpt-4o".into());
        assert_eq!(cfg.sole_target(), Some("oai/gpt-4o"));

        cfg.model_map
            .insert("claude-opus-4-5".into(), "oai/gpt-4o".into());
        assert_eq!(cfg.sole_target(), Some("oai/gpt-4o"));

        cfg.model_map
            .insert("claude-haiku-4-5".into(), "g/gemini-2.5-flash".into());
        assert!(cfg.sole_target().is_none());
    }

    #[test]
    fn test_snapshot_isolation() {
        let handle = ConfigHandle::default();
        let before = handle.snapshot();
        let mut next = RoutingConfig::default();
        next.enabled = true;
        handle.replace(next);
        assert!(!before.enabled);
        assert!(handle.snapshot().enabled);
    }
}
