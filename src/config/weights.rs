//! Tool weight table.
//!
//! Maps tool names to the positive integer cost that placement sums per
//! worker. Weights are dimensionless and comparable only within one
//! dispatcher instance.

use std::collections::HashMap;

use crate::error::ConfigError;

pub const DEFAULT_WEIGHT_KEY: &str = "default";

/// Immutable tool name → weight mapping, loaded once at start.
#[derive(Debug, Clone)]
pub struct WeightTable {
    entries: HashMap<String, u32>,
    default: u32,
}

impl WeightTable {
    /// A table with no per-tool entries and the given default weight.
    pub fn uniform(default: u32) -> Result<Self, ConfigError> {
        if default == 0 {
            return Err(ConfigError::InvalidValue {
                key: DEFAULT_WEIGHT_KEY.to_string(),
                message: "weight must be a positive integer".to_string(),
            });
        }
        Ok(Self {
            entries: HashMap::new(),
            default,
        })
    }

    /// Load from a JSON object of `{"tool": weight, ..., "default": weight}`.
    ///
    /// The `default` key is required; every weight must be a positive
    /// integer.
    pub fn from_json(doc: &serde_json::Value) -> Result<Self, ConfigError> {
        let map = doc.as_object().ok_or_else(|| ConfigError::Parse {
            reason: "weight table must be a JSON object".to_string(),
        })?;

        let mut entries = HashMap::new();
        let mut default = None;
        for (name, value) in map {
            let weight = value
                .as_u64()
                .filter(|w| *w > 0 && *w <= u64::from(u32::MAX))
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: name.clone(),
                    message: format!("weight must be a positive integer, got {value}"),
                })? as u32;
            if name == DEFAULT_WEIGHT_KEY {
                default = Some(weight);
            } else {
                entries.insert(name.clone(), weight);
            }
        }

        let default = default.ok_or_else(|| ConfigError::InvalidValue {
            key: DEFAULT_WEIGHT_KEY.to_string(),
            message: "weight table must define a 'default' weight".to_string(),
        })?;

        Ok(Self { entries, default })
    }

    /// Weight for a tool; unknown tools fall back to the default.
    pub fn weight_for(&self, tool: &str) -> u32 {
        self.entries.get(tool).copied().unwrap_or(self.default)
    }

    pub fn default_weight(&self) -> u32 {
        self.default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_with_fallback() {
        let table = WeightTable::from_json(&serde_json::json!({
            "default": 1,
            "add": 2,
            "search": 10,
        }))
        .expect("valid table");
        assert_eq!(table.weight_for("add"), 2);
        assert_eq!(table.weight_for("search"), 10);
        assert_eq!(table.weight_for("never-seen"), 1);
    }

    #[test]
    fn missing_default_is_rejected() {
        let err = WeightTable::from_json(&serde_json::json!({"add": 2})).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "default"));
    }

    #[test]
    fn zero_and_negative_weights_are_rejected() {
        for bad in [serde_json::json!({"default": 0}), serde_json::json!({"default": -3})] {
            assert!(WeightTable::from_json(&bad).is_err());
        }
    }

    #[test]
    fn non_object_document_is_rejected() {
        let err = WeightTable::from_json(&serde_json::json!([1, 2])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
