//! Engine configuration.
//!
//! Every knob the engine exposes lives here or in the component configs it
//! aggregates. Configs deserialize from JSON with defaults for missing
//! fields:
//!
//! ```json
//! {
//!   "short_term_capacity": 200,
//!   "scoring": { "priority_weight": 0.5 },
//!   "consolidation": { "min_group_size": 3, "grouping": { "by": "tag" } }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::memory::{ConsolidationConfig, ScoringConfig, Tier};

/// Top-level configuration for a [`MemoryEngine`](crate::memory::MemoryEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum records in the short-term tier
    pub short_term_capacity: usize,
    /// Maximum records in the long-term tier
    pub long_term_capacity: usize,
    /// Relevance scoring weights
    pub scoring: ScoringConfig,
    /// Consolidation grouping and thresholds
    pub consolidation: ConsolidationConfig,
    /// Required embedding length, if embeddings are used
    pub embedding_dimensions: Option<usize>,
    /// Stamp the engine's session id on records added without one
    pub stamp_session: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            short_term_capacity: 100,
            long_term_capacity: 1000,
            scoring: ScoringConfig::default(),
            consolidation: ConsolidationConfig::default(),
            embedding_dimensions: None,
            stamp_session: false,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set both capacities.
    pub fn with_capacities(mut self, short_term: usize, long_term: usize) -> Self {
        self.short_term_capacity = short_term;
        self.long_term_capacity = long_term;
        self
    }

    pub fn with_scoring(mut self, scoring: ScoringConfig) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn with_consolidation(mut self, consolidation: ConsolidationConfig) -> Self {
        self.consolidation = consolidation;
        self
    }

    pub fn with_embedding_dimensions(mut self, dimensions: usize) -> Self {
        self.embedding_dimensions = Some(dimensions);
        self
    }

    pub fn with_session_stamping(mut self, enabled: bool) -> Self {
        self.stamp_session = enabled;
        self
    }

    /// Capacity of one tier.
    pub fn capacity(&self, tier: Tier) -> usize {
        match tier {
            Tier::ShortTerm => self.short_term_capacity,
            Tier::LongTerm => self.long_term_capacity,
        }
    }

    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        for tier in Tier::ALL {
            if self.capacity(tier) == 0 {
                return Err(Error::capacity_exhausted(tier, 0));
            }
        }
        if self.embedding_dimensions == Some(0) {
            return Err(Error::Config(
                "embedding_dimensions must be positive".to_string(),
            ));
        }
        self.scoring.validate()?;
        self.consolidation.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GroupingKey;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capacity(Tier::ShortTerm), 100);
        assert_eq!(config.capacity(Tier::LongTerm), 1000);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json(
            r#"{
                "short_term_capacity": 5,
                "scoring": { "priority_weight": 0.5 },
                "consolidation": { "min_group_size": 3, "grouping": { "by": "tag" } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.short_term_capacity, 5);
        assert_eq!(config.long_term_capacity, 1000);
        assert_eq!(config.scoring.priority_weight, 0.5);
        assert_eq!(config.scoring.match_weight, ScoringConfig::default().match_weight);
        assert_eq!(config.consolidation.min_group_size, 3);
        assert_eq!(config.consolidation.grouping, GroupingKey::Tag);
    }

    #[test]
    fn test_zero_capacity_is_fatal() {
        let err = EngineConfig::from_json(r#"{ "long_term_capacity": 0 }"#).unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted { capacity: 0, .. }));
    }

    #[test]
    fn test_bad_json_is_config_error() {
        assert!(matches!(
            EngineConfig::from_json(r#"{ "short_term_capacity": -1 }"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_json("not json"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        std::fs::write(&path, r#"{ "stamp_session": true }"#).unwrap();

        let config = EngineConfig::from_path(&path).unwrap();
        assert!(config.stamp_session);

        let missing = EngineConfig::from_path(dir.path().join("absent.json"));
        assert!(matches!(missing, Err(Error::Io(_))));
    }
}
