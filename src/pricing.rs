//! Per-model pricing catalog for cost attribution. Seeded from the built-in
//! table; admin-supplied overrides land at runtime for providers with
//! dynamic pricing. Lookup is forgiving about versioned model ids: the
//! longest catalog key contained in the id wins.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::constants::SEED_PRICING;
use crate::providers::TokenUsage;

/// $/MTok prices for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_price: f64,
    pub output_price: f64,
    pub cache_read_price: f64,
    pub cache_write_price: f64,
}

pub struct PricingCatalog {
    entries: RwLock<HashMap<String, ModelPricing>>,
}

impl PricingCatalog {
    pub fn new() -> Self {
        let entries = SEED_PRICING
            .iter()
            .map(|&(id, input, output, cache_read, cache_write)| {
                (
                    id.to_string(),
                    ModelPricing {
                        input_price: input,
                        output_price: output,
                        cache_read_price: cache_read,
                        cache_write_price: cache_write,
                    },
                )
            })
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Insert or replace a model's pricing at runtime.
    pub fn set(&self, model: &str, pricing: ModelPricing) {
        self.entries
            .write()
            .expect("pricing catalog lock")
            .insert(model.to_string(), pricing);
    }

    pub fn get(&self, model: &str) -> Option<ModelPricing> {
        let entries = self.entries.read().expect("pricing catalog lock");
        if let Some(pricing) = entries.get(model) {
            return Some(*pricing);
        }
        // Versioned ids like claude-sonnet-4-5-20250929 match their base entry
        let lowered = model.to_ascii_lowercase();
        entries
            .iter()
            .filter(|(key, _)| lowered.contains(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, pricing)| *pricing)
    }

    /// Cost in USD for one request's token usage; `None` when the model is
    /// unknown to the catalog.
    pub fn cost_usd(&self, model: &str, usage: &TokenUsage) -> Option<f64> {
        let pricing = self.get(model)?;
        Some(
            (usage.input_tokens as f64 * pricing.input_price
                + usage.output_tokens as f64 * pricing.output_price
                + usage.cache_read_input_tokens as f64 * pricing.cache_read_price
                + usage.cache_creation_input_tokens as f64 * pricing.cache_write_price)
                / 1_000_000.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versioned_id_matches_base_entry() {
        let catalog = PricingCatalog::new();
        let base = catalog.get("claude-sonnet-4-5").unwrap();
        let versioned = catalog.get("claude-sonnet-4-5-20250929").unwrap();
        assert_eq!(base, versioned);
    }

    #[test]
    fn test_unknown_model_has_no_cost() {
        let catalog = PricingCatalog::new();
        assert!(catalog.get("mystery-model").is_none());
        assert!(
            catalog
                .cost_usd("mystery-model", &TokenUsage::default())
                .is_none()
        );
    }

    #[test]
    fn test_cost_computation() {
        let catalog = PricingCatalog::new();
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 2_000_000,
            cache_read_input_tokens: 1_000_000,
            cache_creation_input_tokens: 0,
            partial: false,
        };
        // sonnet: 3.0 in + 15.0 out + 0.30 cache read
        let cost = catalog.cost_usd("claude-sonnet-4-5", &usage).unwrap();
        assert!((cost - (3.0 + 30.0 + 0.30)).abs() < 1e-9);
    }

    #[test]
    fn test_runtime_override() {
        let catalog = PricingCatalog::new();
        catalog.set(
            "custom/model",
            ModelPricing {
                input_price: 1.0,
                output_price: 2.0,
                cache_read_price: 0.0,
                cache_write_price: 0.0,
            },
        );
        assert!(catalog.get("custom/model").is_some());
    }
}
