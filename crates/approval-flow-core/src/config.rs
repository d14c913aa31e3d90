use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Compare-and-swap attempts per action before `concurrent_modification`.
    pub max_cas_attempts: u32,
    pub sweep_interval_secs: u64,
    pub sweep_batch_limit: usize,
    pub default_history_page_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cas_attempts: 5,
            sweep_interval_secs: 60,
            sweep_batch_limit: 500,
            default_history_page_size: 50,
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// Returns [`EngineError::Configuration`] naming the first out-of-range field.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(1..=50).contains(&self.max_cas_attempts) {
            return Err(EngineError::Configuration(
                "max_cas_attempts MUST be within 1..=50".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(EngineError::Configuration(
                "sweep_interval_secs MUST be >= 1".to_string(),
            ));
        }
        if self.sweep_batch_limit == 0 {
            return Err(EngineError::Configuration(
                "sweep_batch_limit MUST be >= 1".to_string(),
            ));
        }
        if !(1..=1000).contains(&self.default_history_page_size) {
            return Err(EngineError::Configuration(
                "default_history_page_size MUST be within 1..=1000".to_string(),
            ));
        }
        Ok(())
    }

    /// Missing fields take their defaults.
    ///
    /// # Errors
    /// Returns [`EngineError::Configuration`] on unknown fields, wrong types or
    /// out-of-range values.
    pub fn from_json(value: &Value) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|err| EngineError::Configuration(format!("invalid engine config: {err}")))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_fill_defaults() {
        let config = match EngineConfig::from_json(&serde_json::json!({ "max_cas_attempts": 9 })) {
            Ok(config) => config,
            Err(err) => panic!("config must parse: {err}"),
        };
        assert_eq!(config.max_cas_attempts, 9);
        assert_eq!(config.sweep_interval_secs, 60);
        assert_eq!(config.default_history_page_size, 50);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for document in [
            serde_json::json!({ "max_cas_attempts": 0 }),
            serde_json::json!({ "max_cas_attempts": 51 }),
            serde_json::json!({ "sweep_interval_secs": 0 }),
            serde_json::json!({ "sweep_batch_limit": 0 }),
            serde_json::json!({ "default_history_page_size": 1001 }),
            serde_json::json!({ "unknown": true }),
        ] {
            assert!(matches!(
                EngineConfig::from_json(&document),
                Err(EngineError::Configuration(_))
            ));
        }
    }
}
