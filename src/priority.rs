//! Priority transform, aggregation and importance-sampling weights

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Reduces a record's per-step priority signal to a single scalar
pub type PriorityFn = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

/// Built-in reductions for a priority signal
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityAggregation {
    #[default]
    Mean,
    Sum,
    Max,
    Min,
    /// Last value of the signal
    Last,
}

impl PriorityAggregation {
    /// Reduce `signal`. An empty signal reduces to 0.
    pub fn aggregate(self, signal: &[f64]) -> f64 {
        if signal.is_empty() {
            return 0.0;
        }
        match self {
            PriorityAggregation::Mean => signal.iter().sum::<f64>() / signal.len() as f64,
            PriorityAggregation::Sum => signal.iter().sum(),
            PriorityAggregation::Max => signal.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            PriorityAggregation::Min => signal.iter().cloned().fold(f64::INFINITY, f64::min),
            PriorityAggregation::Last => signal[signal.len() - 1],
        }
    }

    pub fn into_fn(self) -> PriorityFn {
        Arc::new(move |signal: &[f64]| self.aggregate(signal))
    }
}

/// `sign(raw) * (|raw| + epsilon) ^ alpha`
///
/// The epsilon keeps the stored value away from zero; the sign is kept so
/// negative priorities stay ordered.
#[inline]
pub fn normalize_priority(raw: f64, epsilon: f64, alpha: f64) -> f64 {
    let magnitude = (raw.abs() + epsilon).powf(alpha);
    if raw < 0.0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Map a raw priority lower limit into normalized priority space.
///
/// The limit is shifted down by `epsilon` before the transform, so any raw
/// priority at or above `limit` normalizes strictly above the result.
#[inline]
pub fn normalize_lower_limit(limit: f64, epsilon: f64, alpha: f64) -> f64 {
    normalize_priority(limit - epsilon, epsilon, alpha)
}

/// Inverse-priority weight in `(0, 1]` for signed priorities.
///
/// The upper bound is pushed `eta` beyond `max_priority` so the
/// highest-priority record never gets a weight of exactly zero.
pub fn eta_normalisation(priority: f64, min_priority: f64, max_priority: f64, eta: f64) -> f64 {
    let priority = priority.clamp(min_priority.min(max_priority), max_priority);
    let upper_max_priority = if max_priority >= 0.0 {
        max_priority * (1.0 + eta)
    } else {
        max_priority * (1.0 - eta)
    };
    if upper_max_priority == min_priority {
        return 1.0;
    }
    assert!(
        upper_max_priority > min_priority,
        "upper max priority {} must be greater than min priority {}",
        upper_max_priority,
        min_priority
    );
    (upper_max_priority - priority) / (upper_max_priority - min_priority)
}

/// Ratio weight `(min - limit) / (max(priority, min) - limit)` for priorities
/// bounded below by `lower_limit`.
///
/// Panics if `min_priority` is not above the limit.
pub fn lower_limit_ratio(priority: f64, min_priority: f64, lower_limit: f64) -> f64 {
    let priority = priority.max(min_priority);
    if priority == min_priority {
        return 1.0;
    }
    assert!(
        min_priority > lower_limit,
        "min priority {} must be greater than the priority lower limit {}",
        min_priority,
        lower_limit
    );
    (min_priority - lower_limit) / (priority - lower_limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregations() {
        let signal = [1.0, -3.0, 2.0];
        assert_eq!(PriorityAggregation::Mean.aggregate(&signal), 0.0);
        assert_eq!(PriorityAggregation::Sum.aggregate(&signal), 0.0);
        assert_eq!(PriorityAggregation::Max.aggregate(&signal), 2.0);
        assert_eq!(PriorityAggregation::Min.aggregate(&signal), -3.0);
        assert_eq!(PriorityAggregation::Last.aggregate(&signal), 2.0);
        assert_eq!(PriorityAggregation::Max.aggregate(&[]), 0.0);

        let f = PriorityAggregation::Max.into_fn();
        assert_eq!(f(&signal), 2.0);
    }

    #[test]
    fn test_normalize_never_zero() {
        assert!(normalize_priority(0.0, 1e-6, 0.6) > 0.0);
        assert!(normalize_priority(-0.0, 1e-6, 1.0) > 0.0);
        // alpha = 0 flattens every priority to +-1
        assert_eq!(normalize_priority(42.0, 1e-6, 0.0), 1.0);
        assert_eq!(normalize_priority(-42.0, 1e-6, 0.0), -1.0);
    }

    #[test]
    fn test_normalize_monotonic() {
        let pairs = [(0.1, 0.2), (1.0, 100.0), (-5.0, -1.0), (-100.0, -0.5)];
        for (a, b) in pairs {
            assert!(normalize_priority(a, 1e-6, 0.6) < normalize_priority(b, 1e-6, 0.6));
        }
    }

    #[test]
    fn test_eta_normalisation_bounds() {
        let eta = 1e-2;
        let w_max = eta_normalisation(10.0, 1.0, 10.0, eta);
        let w_min = eta_normalisation(1.0, 1.0, 10.0, eta);
        assert!(w_max > 0.0 && w_max < w_min);
        assert_eq!(w_min, 1.0);

        // Negative range
        let w = eta_normalisation(-1.0, -5.0, -1.0, eta);
        assert!(w > 0.0 && w <= 1.0);

        // Degenerate range
        assert_eq!(eta_normalisation(0.0, 0.0, 0.0, eta), 1.0);
        assert_eq!(eta_normalisation(3.0, 3.0, 3.0, eta), 1.0);
    }

    #[test]
    fn test_eta_normalisation_clamps() {
        assert_eq!(eta_normalisation(-100.0, 1.0, 10.0, 0.1), 1.0);
        let top = eta_normalisation(10.0, 1.0, 10.0, 0.1);
        assert_eq!(eta_normalisation(100.0, 1.0, 10.0, 0.1), top);
    }

    #[test]
    fn test_lower_limit_ratio() {
        assert_eq!(lower_limit_ratio(1.0, 1.0, 0.0), 1.0);
        assert_eq!(lower_limit_ratio(4.0, 1.0, 0.0), 0.25);
        // Priorities under the min are treated as the min
        assert_eq!(lower_limit_ratio(0.5, 1.0, 0.0), 1.0);
    }

    #[test]
    #[should_panic(expected = "lower limit")]
    fn test_lower_limit_ratio_rejects_min_at_limit() {
        lower_limit_ratio(1.0, 0.0, 0.0);
    }

    #[test]
    fn test_normalized_lower_limit_stays_below_priorities() {
        let eps = 1e-6;
        // (limit, alpha): negative limit, limit above 1 with alpha < 1, zero limit
        for (limit, alpha) in [(-0.6, 0.6), (2.0, 0.5), (0.0, 1.0), (0.0, 0.6), (1e-7, 0.6)] {
            let normalized_limit = normalize_lower_limit(limit, eps, alpha);
            for raw in [limit, limit + 1e-3, limit + 1.0, limit + 100.0] {
                assert!(
                    normalize_priority(raw, eps, alpha) > normalized_limit,
                    "raw {} normalizes at or below limit {} (alpha {})",
                    raw,
                    limit,
                    alpha
                );
            }
        }
        // Raw 3 over limit 2 with alpha 0.5 falls under the raw limit once normalized
        assert!(normalize_priority(3.0, eps, 0.5) < 2.0);
        assert!(normalize_priority(3.0, eps, 0.5) > normalize_lower_limit(2.0, eps, 0.5));
    }
}
