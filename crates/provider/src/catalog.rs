//! Model catalog: a static snapshot per provider, refreshable from
//! OpenRouter's public model list.

use claudish_core::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Prefixed id usable as a routing target (e.g. "oai/gpt-4o").
    pub id: String,
    pub provider: String,
    pub display_name: String,
}

pub struct ModelCatalog {
    models: RwLock<Vec<CatalogEntry>>,
}

impl ModelCatalog {
    pub fn seeded() -> Self {
        Self {
            models: RwLock::new(seed_entries()),
        }
    }

    pub fn list(&self) -> Vec<CatalogEntry> {
        self.models.read().expect("catalog lock").clone()
    }

    /// Merge entries, replacing by id.
    fn merge(&self, incoming: Vec<CatalogEntry>) {
        let mut models = self.models.write().expect("catalog lock");
        for entry in incoming {
            match models.iter_mut().find(|m| m.id == entry.id) {
                Some(existing) => *existing = entry,
                None => models.push(entry),
            }
        }
    }

    /// Refresh from OpenRouter's public model list.
    ///
    /// A prep-only call: retried up to five times with backoff growing
    /// from 2s toward 30s.
    pub async fn refresh(&self, http: &reqwest::Client) -> Result<usize, ProxyError> {
        let mut backoff = Duration::from_secs(2);
        let mut last_error = None;

        for attempt in 0..5 {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
            match fetch_openrouter_models(http).await {
                Ok(entries) => {
                    let count = entries.len();
                    self.merge(entries);
                    return Ok(count);
                }
                Err(e) => {
                    tracing::warn!("model refresh attempt {} failed: {e}", attempt + 1);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ProxyError::Network("model refresh failed".to_string())))
    }
}

async fn fetch_openrouter_models(http: &reqwest::Client) -> Result<Vec<CatalogEntry>, ProxyError> {
    let response = http
        .get("https://openrouter.ai/api/v1/models")
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ProxyError::Upstream {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        });
    }
    let body: serde_json::Value = response.json().await?;
    let entries = body
        .get("data")
        .and_then(|d| d.as_array())
        .map(|models| {
            models
                .iter()
                .filter_map(|m| {
                    let id = m.get("id").and_then(|i| i.as_str())?;
                    let name = m.get("name").and_then(|n| n.as_str()).unwrap_or(id);
                    Some(CatalogEntry {
                        id: format!("or/{id}"),
                        provider: "openrouter".to_string(),
                        display_name: name.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(entries)
}

fn seed_entries() -> Vec<CatalogEntry> {
    let seeds: &[(&str, &str, &str)] = &[
        ("openai", "oai/gpt-4o", "GPT-4o"),
        ("openai", "oai/gpt-4o-mini", "GPT-4o mini"),
        ("openai", "oai/o3", "o3"),
        ("openai", "oai/o4-mini", "o4-mini"),
        ("gemini", "g/gemini-2.5-pro", "Gemini 2.5 Pro"),
        ("gemini", "g/gemini-2.5-flash", "Gemini 2.5 Flash"),
        ("minimax", "mm/MiniMax-M2", "MiniMax M2"),
        ("kimi", "kimi/kimi-k2-0905-preview", "Kimi K2"),
        ("kimi", "kimi/kimi-k2-turbo-preview", "Kimi K2 Turbo"),
        ("glm", "glm/glm-4.6", "GLM-4.6"),
        ("ollamacloud", "zen/qwen3:480b", "Qwen3 480B (Ollama Cloud)"),
        ("openrouter", "or/anthropic/claude-sonnet-4.5", "Claude Sonnet 4.5 (OpenRouter)"),
    ];
    seeds
        .iter()
        .map(|(provider, id, name)| CatalogEntry {
            id: id.to_string(),
            provider: provider.to_string(),
            display_name: name.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_covers_every_provider() {
        let catalog = ModelCatalog::seeded();
        let entries = catalog.list();
        for descriptor in PROVIDERS {
            assert!(
                entries.iter().any(|e| e.provider == descriptor.name),
                "no seed entry for {}",
                descriptor.name
            );
        }
    }

    #[test]
    fn test_seed_ids_resolve() {
        for entry in ModelCatalog::seeded().list() {
            assert!(
                crate::resolve(&entry.id).is_some(),
                "{} does not resolve",
                entry.id
            );
        }
    }

    #[test]
    fn test_merge_replaces_by_id() {
        let catalog = ModelCatalog::seeded();
        let before = catalog.list().len();
        catalog.merge(vec![CatalogEntry {
            id: "oai/gpt-4o".to_string(),
            provider: "openai".to_string(),
            display_name: "renamed".to_string(),
        }]);
        let entries = catalog.list();
        assert_eq!(entries.len(), before);
        assert!(entries.iter().any(|e| e.display_name == "renamed"));
    }
}
