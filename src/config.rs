//! Engine configuration
//!
//! Defaults mirror the tuned pipeline constants. `from_env` applies
//! `HEDGE_*` overrides on top (load `.env` first in the binary).

use crate::error::HedgeError;
use crate::extract::ExtractionPolicy;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

/// Refinement loop tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefinementConfig {
    /// Lower end of the factor band given to the knowledge source
    pub factor_min: usize,
    /// Upper end of the factor band given to the knowledge source
    pub factor_max: usize,
    /// Exit early once every factor's confidence exceeds this
    pub confidence_exit_threshold: f64,
    /// Maximum (targeted, adversarial) rounds
    pub max_rounds: u32,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            factor_min: 3,
            factor_max: 5,
            confidence_exit_threshold: 0.75,
            max_rounds: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FanoutConfig {
    pub queries_min: usize,
    pub queries_max: usize,
    pub max_concurrency: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            queries_min: 2,
            queries_max: 3,
            max_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringConfig {
    pub batch_size: usize,
    pub top_k: usize,
    pub max_concurrency: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            batch_size: 15,
            top_k: 3,
            max_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionConfig {
    /// Fraction of the subject's market value spent on hedges
    pub hedge_ratio: f64,
    pub max_concurrency: usize,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            hedge_ratio: 1.0 / 3.0,
            max_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub refinement: RefinementConfig,
    pub fanout: FanoutConfig,
    pub scoring: ScoringConfig,
    pub positions: PositionConfig,
    pub extraction_policy: ExtractionPolicy,
    /// Output budget for research calls with open search
    pub discovery_max_tokens: u32,
    /// Output budget for structured calls (queries, scores, decisions)
    pub structured_max_tokens: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refinement: RefinementConfig::default(),
            fanout: FanoutConfig::default(),
            scoring: ScoringConfig::default(),
            positions: PositionConfig::default(),
            extraction_policy: ExtractionPolicy::Strict,
            discovery_max_tokens: 4000,
            structured_max_tokens: 2000,
        }
    }
}

impl EngineConfig {
    /// Defaults plus `HEDGE_*` environment overrides.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        override_with(&lookup, "HEDGE_MAX_ROUNDS", &mut config.refinement.max_rounds)?;
        override_with(&lookup, "HEDGE_FACTOR_MIN", &mut config.refinement.factor_min)?;
        override_with(&lookup, "HEDGE_FACTOR_MAX", &mut config.refinement.factor_max)?;
        override_with(
            &lookup,
            "HEDGE_CONFIDENCE_THRESHOLD",
            &mut config.refinement.confidence_exit_threshold,
        )?;
        override_with(&lookup, "HEDGE_QUERIES_MIN", &mut config.fanout.queries_min)?;
        override_with(&lookup, "HEDGE_QUERIES_MAX", &mut config.fanout.queries_max)?;
        override_with(&lookup, "HEDGE_BATCH_SIZE", &mut config.scoring.batch_size)?;
        override_with(&lookup, "HEDGE_TOP_K", &mut config.scoring.top_k)?;
        override_with(&lookup, "HEDGE_RATIO", &mut config.positions.hedge_ratio)?;

        if let Some(raw) = lookup("HEDGE_CONCURRENCY") {
            let concurrency: usize = parse_value("HEDGE_CONCURRENCY", &raw)?;
            config.fanout.max_concurrency = concurrency;
            config.scoring.max_concurrency = concurrency;
            config.positions.max_concurrency = concurrency;
        }

        if let Some(raw) = lookup("HEDGE_EXTRACTION_POLICY") {
            config.extraction_policy = match raw.trim().to_lowercase().as_str() {
                "strict" => ExtractionPolicy::Strict,
                "empty" | "empty_on_failure" => ExtractionPolicy::EmptyOnFailure,
                other => {
                    return Err(HedgeError::ConfigError(format!(
                        "HEDGE_EXTRACTION_POLICY must be 'strict' or 'empty', got '{}'",
                        other
                    )))
                }
            };
        }

        Ok(config.normalized())
    }

    /// Clamp degenerate values into something the pipeline can run with.
    pub fn normalized(mut self) -> Self {
        self.refinement.factor_max = self.refinement.factor_max.max(self.refinement.factor_min);
        self.fanout.queries_min = self.fanout.queries_min.max(1);
        self.fanout.queries_max = self.fanout.queries_max.max(self.fanout.queries_min);
        self.fanout.max_concurrency = self.fanout.max_concurrency.max(1);
        self.scoring.batch_size = self.scoring.batch_size.max(1);
        self.scoring.max_concurrency = self.scoring.max_concurrency.max(1);
        self.positions.max_concurrency = self.positions.max_concurrency.max(1);
        if !self.positions.hedge_ratio.is_finite() || self.positions.hedge_ratio < 0.0 {
            self.positions.hedge_ratio = 0.0;
        }
        self
    }
}

fn override_with<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *slot = parse_value(key, &raw)?;
    }
    Ok(())
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse::<T>().map_err(|_| {
        HedgeError::ConfigError(format!("{} has an invalid value: '{}'", key, raw))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.refinement.max_rounds, 2);
        assert_eq!(config.refinement.factor_min, 3);
        assert_eq!(config.refinement.factor_max, 5);
        assert_eq!(config.scoring.batch_size, 15);
        assert_eq!(config.scoring.top_k, 3);
        assert!((config.positions.hedge_ratio - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(config.extraction_policy, ExtractionPolicy::Strict);
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("HEDGE_MAX_ROUNDS", "4"),
            ("HEDGE_TOP_K", " 5 "),
            ("HEDGE_RATIO", "0.5"),
            ("HEDGE_CONCURRENCY", "2"),
            ("HEDGE_EXTRACTION_POLICY", "empty"),
        ]))
        .unwrap();

        assert_eq!(config.refinement.max_rounds, 4);
        assert_eq!(config.scoring.top_k, 5);
        assert_eq!(config.positions.hedge_ratio, 0.5);
        assert_eq!(config.fanout.max_concurrency, 2);
        assert_eq!(config.positions.max_concurrency, 2);
        assert_eq!(config.extraction_policy, ExtractionPolicy::EmptyOnFailure);
    }

    #[test]
    fn test_invalid_value_is_config_error() {
        let err = EngineConfig::from_lookup(lookup_from(&[("HEDGE_BATCH_SIZE", "fifteen")]))
            .unwrap_err();
        assert!(matches!(err, HedgeError::ConfigError(_)));

        let err = EngineConfig::from_lookup(lookup_from(&[("HEDGE_EXTRACTION_POLICY", "lenient")]))
            .unwrap_err();
        assert!(matches!(err, HedgeError::ConfigError(_)));
    }

    #[test]
    fn test_degenerate_values_are_clamped() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("HEDGE_BATCH_SIZE", "0"),
            ("HEDGE_QUERIES_MIN", "3"),
            ("HEDGE_QUERIES_MAX", "1"),
            ("HEDGE_CONCURRENCY", "0"),
        ]))
        .unwrap();

        assert_eq!(config.scoring.batch_size, 1);
        assert_eq!(config.fanout.queries_max, 3);
        assert_eq!(config.scoring.max_concurrency, 1);
    }
}
