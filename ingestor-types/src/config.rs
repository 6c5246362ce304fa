use serde::{Deserialize, Serialize};

use crate::error::TypesError;

fn default_lock_ttl_seconds() -> u64 {
    3600
}

fn default_consistency_tolerance() -> u64 {
    10
}

fn default_lag_days() -> i64 {
    0
}

fn default_capability_tag() -> String {
    "default".to_string()
}

/// A resolved dataset configuration, as produced by the (out of scope) YAML
/// loader. The core only ever sees this struct; it never reads config files
/// itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    pub dataset_id: String,
    pub primary_keys: Vec<String>,
    pub timezone: String,
    #[serde(default = "default_lag_days")]
    pub lag_days: i64,
    #[serde(default)]
    pub full_reload: bool,
    #[serde(default)]
    pub lock_table_name: Option<String>,
    #[serde(default)]
    pub notify_topic: Option<String>,
    /// Selects the registered [`crate`]-external parser implementation for
    /// this dataset.
    #[serde(default = "default_capability_tag")]
    pub parser_tag: String,
    /// Same as `parser_tag`, for the normalizer.
    #[serde(default = "default_capability_tag")]
    pub normalizer_tag: String,
    /// Absolute drift tolerated by the consistency guard.
    #[serde(default = "default_consistency_tolerance")]
    pub consistency_tolerance: u64,
    #[serde(default = "default_lock_ttl_seconds")]
    pub lock_ttl_seconds: u64,
}

impl IngestionConfig {
    pub fn new(dataset_id: impl Into<String>, primary_keys: Vec<String>, timezone: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            primary_keys,
            timezone: timezone.into(),
            lag_days: default_lag_days(),
            full_reload: false,
            lock_table_name: None,
            notify_topic: None,
            parser_tag: default_capability_tag(),
            normalizer_tag: default_capability_tag(),
            consistency_tolerance: default_consistency_tolerance(),
            lock_ttl_seconds: default_lock_ttl_seconds(),
        }
    }

    /// The pipeline lock key for this dataset.
    pub fn lock_key(&self) -> String {
        format!("pipeline:{}", self.dataset_id)
    }

    /// Locking is disabled when no lock table name is configured.
    pub fn locking_enabled(&self) -> bool {
        self.lock_table_name.is_some()
    }

    pub fn validate(&self) -> Result<(), TypesError> {
        if self.dataset_id.trim().is_empty() {
            return Err(TypesError::InvalidConfig("dataset_id is empty".into()));
        }
        if self.primary_keys.is_empty() {
            return Err(TypesError::InvalidConfig(
                "primary_keys must name at least one column".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_namespaced_by_dataset() {
        let cfg = IngestionConfig::new("cpi", vec!["series_id".into()], "UTC");
        assert_eq!(cfg.lock_key(), "pipeline:cpi");
    }

    #[test]
    fn locking_disabled_without_table_name() {
        let cfg = IngestionConfig::new("cpi", vec!["series_id".into()], "UTC");
        assert!(!cfg.locking_enabled());
    }

    #[test]
    fn validate_rejects_empty_primary_keys() {
        let cfg = IngestionConfig::new("cpi", vec![], "UTC");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deserializes_with_defaults() {
        let json = r#"{"dataset_id":"cpi","primary_keys":["series_id","obs_date"],"timezone":"UTC"}"#;
        let cfg: IngestionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.consistency_tolerance, 10);
        assert_eq!(cfg.lock_ttl_seconds, 3600);
        assert!(!cfg.full_reload);
    }
}
