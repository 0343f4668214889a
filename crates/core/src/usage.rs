use crate::paths;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Price per 1M tokens (input and output separately).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

/// Pricing table seeded with the catalog snapshot; free providers are
/// marked zero-cost.
pub struct PricingTable {
    prices: HashMap<String, ModelPrice>,
}

impl PricingTable {
    pub fn seeded() -> Self {
        Self {
            prices: built_in_prices(),
        }
    }

    /// Estimate cost in USD; None for unknown models.
    pub fn estimate(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Option<f64> {
        // Exact match first, then without the provider prefix.
        let price = self.prices.get(model).or_else(|| {
            let stripped = model.split('/').next_back().unwrap_or(model);
            self.prices.get(stripped)
        })?;
        let input_cost = (input_tokens as f64 / 1_000_000.0) * price.input;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * price.output;
        Some(input_cost + output_cost)
    }

    pub fn merge(&mut self, overrides: HashMap<String, ModelPrice>) {
        self.prices.extend(overrides);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: f64,
    pub requests: u64,
}

/// Per-session token and cost counters, snapshotted to disk after every
/// completed interception.
pub struct UsageCounters {
    per_model: DashMap<String, ModelUsage>,
    snapshot_path: PathBuf,
}

#[derive(Serialize)]
struct UsageSnapshot<'a> {
    updated_at: String,
    models: &'a HashMap<String, ModelUsage>,
    totals: ModelUsage,
}

impl UsageCounters {
    pub fn new(snapshot_path: PathBuf) -> Self {
        Self {
            per_model: DashMap::new(),
            snapshot_path,
        }
    }

    pub fn record(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        pricing: &PricingTable,
    ) {
        let cost = pricing.estimate(model, input_tokens, output_tokens).unwrap_or(0.0);
        let mut entry = self.per_model.entry(model.to_string()).or_default();
        entry.input_tokens += input_tokens;
        entry.output_tokens += output_tokens;
        entry.estimated_cost += cost;
        entry.requests += 1;
        drop(entry);

        if let Err(e) = self.write_snapshot() {
            tracing::warn!("failed to write usage snapshot: {e}");
        }
    }

    pub fn totals(&self) -> ModelUsage {
        let mut totals = ModelUsage::default();
        for entry in self.per_model.iter() {
            totals.input_tokens += entry.input_tokens;
            totals.output_tokens += entry.output_tokens;
            totals.estimated_cost += entry.estimated_cost;
            totals.requests += entry.requests;
        }
        totals
    }

    pub fn per_model(&self) -> HashMap<String, ModelUsage> {
        self.per_model
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn write_snapshot(&self) -> Result<(), crate::error::ProxyError> {
        let models = self.per_model();
        let snapshot = UsageSnapshot {
            updated_at: chrono::Utc::now().to_rfc3339(),
            models: &models,
            totals: self.totals(),
        };
        let body = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| crate::error::ProxyError::Internal(e.to_string()))?;
        if let Some(parent) = self.snapshot_path.parent() {
            paths::ensure_private_dir(parent)?;
        }
        paths::write_atomic(&self.snapshot_path, &body, 0o600)
    }
}

/// Built-in price table (USD per 1M tokens).
fn built_in_prices() -> HashMap<String, ModelPrice> {
    let entries: Vec<(&str, f64, f64)> = vec![
        // OpenAI
        ("gpt-4o", 2.50, 10.0),
        ("gpt-4o-mini", 0.15, 0.60),
        ("gpt-4.1", 2.0, 8.0),
        ("o3", 10.0, 40.0),
        ("o4-mini", 1.10, 4.40),
        // Gemini
        ("gemini-2.5-pro", 1.25, 10.0),
        ("gemini-2.5-flash", 0.15, 0.60),
        ("gemini-2.0-flash", 0.10, 0.40),
        // MiniMax
        ("MiniMax-M2", 0.30, 1.20),
        // Moonshot
        ("kimi-k2-0905-preview", 0.60, 2.50),
        ("kimi-k2-turbo-preview", 1.15, 8.0),
        // GLM
        ("glm-4.6", 0.60, 2.20),
        // Free/local providers
        ("gemini-cli", 0.0, 0.0),
    ];

    entries
        .into_iter()
        .map(|(model, input, output)| (model.to_string(), ModelPrice { input, output }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_strips_prefix() {
        let table = PricingTable::seeded();
        let direct = table.estimate("gpt-4o", 1_000_000, 1_000_000).unwrap();
        let prefixed = table.estimate("oai/gpt-4o", 1_000_000, 1_000_000).unwrap();
        assert_eq!(direct, prefixed);
        assert!((direct - 12.50).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_no_cost() {
        let table = PricingTable::seeded();
        assert!(table.estimate("mystery-model", 100, 100).is_none());
    }

    #[test]
    fn test_record_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens-1.json");
        let counters = UsageCounters::new(path.clone());
        let pricing = PricingTable::seeded();

        counters.record("oai/gpt-4o", 100, 50, &pricing);
        counters.record("oai/gpt-4o", 10, 5, &pricing);

        let totals = counters.totals();
        assert_eq!(totals.input_tokens, 110);
        assert_eq!(totals.output_tokens, 55);
        assert_eq!(totals.requests, 2);

        let snapshot: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(snapshot["totals"]["input_tokens"], 110);
        assert!(snapshot["models"]["oai/gpt-4o"]["requests"] == 2);
    }
}
