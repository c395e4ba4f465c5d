//! Buffer configuration

use serde::{Deserialize, Serialize};

use crate::error::{BufferError, Result};
use crate::priority::PriorityAggregation;

/// How the cluster to replay from is chosen
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterPrioritisation {
    /// Uniformly among non-empty clusters
    #[serde(rename = "none")]
    Uniform,
    /// Proportionally to fill level times relative average priority
    #[default]
    #[serde(rename = "highest")]
    Highest,
}

/// Replay buffer hyperparameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    // Capacity
    /// Max records per cluster, 0 means "same as global_size"
    pub cluster_size: usize,
    /// Max records overall, 0 means unbounded
    pub global_size: usize,
    /// Share of the global budget a cluster may hold beyond its floor share
    pub min_cluster_size_proportion: f64,

    // Prioritization
    /// How much prioritization is used (0 = uniform, 1 = proportional)
    pub prioritization_alpha: f64,
    /// Importance-weight exponent (0 disables weighting)
    pub prioritization_importance_beta: f64,
    /// Keeps the weight of the highest-priority record above zero
    pub prioritization_importance_eta: f64,
    /// Added to every priority magnitude before the alpha transform
    pub prioritization_epsilon: f64,
    /// Known lower bound of raw priorities; switches to the ratio weight form
    pub priority_lower_limit: Option<f64>,
    pub priority_aggregation: PriorityAggregation,

    // Eviction
    /// Probability of dropping the lowest-priority record instead of the oldest
    pub prioritized_drop_probability: f64,
    /// Drop by an independent random priority instead of the sample priority
    pub global_distribution_matching: bool,

    // Sampling
    pub cluster_prioritisation_strategy: ClusterPrioritisation,
    /// Take weight bounds from the sampled cluster rather than all clusters
    pub cluster_level_weighting: bool,

    /// Seed for sampling and eviction draws, entropy when unset
    pub seed: Option<u64>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            cluster_size: 0,
            global_size: 50_000,
            min_cluster_size_proportion: 0.5,

            prioritization_alpha: 0.6,
            prioritization_importance_beta: 0.4,
            prioritization_importance_eta: 1e-2,
            prioritization_epsilon: 1e-6,
            priority_lower_limit: None,
            priority_aggregation: PriorityAggregation::Mean,

            prioritized_drop_probability: 0.5,
            global_distribution_matching: false,

            cluster_prioritisation_strategy: ClusterPrioritisation::Highest,
            cluster_level_weighting: true,

            seed: None,
        }
    }
}

impl BufferConfig {
    /// Default hyperparameters with the given bounds
    pub fn with_sizes(cluster_size: usize, global_size: usize) -> Self {
        Self {
            cluster_size,
            global_size,
            ..Default::default()
        }
    }

    /// No prioritization: uniform sampling, oldest-first eviction, no weights
    pub fn uniform() -> Self {
        Self {
            prioritization_alpha: 0.0,
            prioritization_importance_beta: 0.0,
            prioritized_drop_probability: 0.0,
            cluster_prioritisation_strategy: ClusterPrioritisation::Uniform,
            ..Default::default()
        }
    }

    /// Priorities known to be non-negative (e.g. absolute TD errors)
    pub fn non_negative() -> Self {
        Self {
            priority_lower_limit: Some(0.0),
            ..Default::default()
        }
    }

    /// Parse and validate a JSON configuration. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: BufferConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_size == 0 && self.global_size == 0 {
            return Err(BufferError::invalid(
                "cluster_size",
                "at least one of cluster_size or global_size must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.prioritization_alpha) {
            return Err(BufferError::invalid(
                "prioritization_alpha",
                format!("must be in [0, 1], got {}", self.prioritization_alpha),
            ));
        }
        if !is_non_negative(self.prioritization_importance_beta) {
            return Err(BufferError::invalid(
                "prioritization_importance_beta",
                format!("must be >= 0, got {}", self.prioritization_importance_beta),
            ));
        }
        if !is_positive(self.prioritization_importance_eta) {
            return Err(BufferError::invalid(
                "prioritization_importance_eta",
                format!("must be > 0, got {}", self.prioritization_importance_eta),
            ));
        }
        if !is_positive(self.prioritization_epsilon) {
            return Err(BufferError::invalid(
                "prioritization_epsilon",
                format!("must be > 0, got {}", self.prioritization_epsilon),
            ));
        }
        if !(0.0..=1.0).contains(&self.prioritized_drop_probability) {
            return Err(BufferError::invalid(
                "prioritized_drop_probability",
                format!("must be in [0, 1], got {}", self.prioritized_drop_probability),
            ));
        }
        if !is_non_negative(self.min_cluster_size_proportion) {
            return Err(BufferError::invalid(
                "min_cluster_size_proportion",
                format!("must be >= 0, got {}", self.min_cluster_size_proportion),
            ));
        }
        if let Some(limit) = self.priority_lower_limit {
            if !limit.is_finite() {
                return Err(BufferError::invalid(
                    "priority_lower_limit",
                    format!("must be finite, got {}", limit),
                ));
            }
        }
        Ok(())
    }

    /// Per-cluster bound after resolving 0 and clamping to the global bound
    pub fn effective_cluster_size(&self) -> usize {
        match (self.cluster_size, self.global_size) {
            (0, global) => global,
            (cluster, 0) => cluster,
            (cluster, global) => cluster.min(global),
        }
    }

    /// Without a non-negative lower limit priorities keep their sign
    pub fn priority_can_be_negative(&self) -> bool {
        !matches!(self.priority_lower_limit, Some(limit) if limit >= 0.0)
    }

    #[inline]
    pub fn importance_weighting(&self) -> bool {
        self.prioritization_importance_beta > 0.0
    }
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn is_non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BufferConfig::default();
        assert_eq!(config.global_size, 50_000);
        assert_eq!(config.effective_cluster_size(), 50_000);
        assert!(config.priority_can_be_negative());
        assert!(config.importance_weighting());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_effective_cluster_size() {
        assert_eq!(BufferConfig::with_sizes(100, 50).effective_cluster_size(), 50);
        assert_eq!(BufferConfig::with_sizes(10, 50).effective_cluster_size(), 10);
        assert_eq!(BufferConfig::with_sizes(10, 0).effective_cluster_size(), 10);
    }

    #[test]
    fn test_presets() {
        let uniform = BufferConfig::uniform();
        assert!(!uniform.importance_weighting());
        assert_eq!(uniform.cluster_prioritisation_strategy, ClusterPrioritisation::Uniform);
        assert!(uniform.validate().is_ok());

        let non_negative = BufferConfig::non_negative();
        assert!(!non_negative.priority_can_be_negative());
        assert!(non_negative.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        let cases = [
            BufferConfig::with_sizes(0, 0),
            BufferConfig {
                prioritization_alpha: 1.5,
                ..Default::default()
            },
            BufferConfig {
                prioritization_importance_beta: -0.1,
                ..Default::default()
            },
            BufferConfig {
                prioritization_importance_eta: 0.0,
                ..Default::default()
            },
            BufferConfig {
                prioritization_epsilon: 0.0,
                ..Default::default()
            },
            BufferConfig {
                prioritized_drop_probability: f64::NAN,
                ..Default::default()
            },
            BufferConfig {
                min_cluster_size_proportion: -1.0,
                ..Default::default()
            },
            BufferConfig {
                priority_lower_limit: Some(f64::INFINITY),
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(BufferError::InvalidConfig { .. })),
                "{:?} should be rejected",
                config
            );
        }
    }

    #[test]
    fn test_from_json() {
        let config = BufferConfig::from_json(
            r#"{
                "global_size": 1000,
                "cluster_size": 200,
                "priority_lower_limit": 0.0,
                "priority_aggregation": "max",
                "cluster_prioritisation_strategy": "none"
            }"#,
        )
        .unwrap();
        assert_eq!(config.global_size, 1000);
        assert_eq!(config.effective_cluster_size(), 200);
        assert_eq!(config.priority_aggregation, PriorityAggregation::Max);
        assert_eq!(config.cluster_prioritisation_strategy, ClusterPrioritisation::Uniform);
        // Untouched fields keep their defaults
        assert_eq!(config.prioritization_alpha, 0.6);
    }

    #[test]
    fn test_from_json_errors() {
        assert!(matches!(
            BufferConfig::from_json("{\"global_size\": \"lots\"}"),
            Err(BufferError::Json(_))
        ));
        assert!(matches!(
            BufferConfig::from_json("{\"global_size\": 0}"),
            Err(BufferError::InvalidConfig { field: "cluster_size", .. })
        ));
    }
}
