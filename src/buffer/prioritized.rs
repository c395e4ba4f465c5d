//! Cluster-partitioned Prioritized Experience Replay (PER) buffer

use std::collections::HashMap;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::cluster::{Cluster, DropSource, TreeLayout};
use super::{ClusterKey, ClusterRegistry, ReplayBuffer};
use crate::config::{BufferConfig, ClusterPrioritisation};
use crate::error::{BufferError, Result};
use crate::priority::{
    eta_normalisation, lower_limit_ratio, normalize_lower_limit, normalize_priority, PriorityFn,
};
use crate::record::{Insertion, Record};

/// Fill level and sampling score of one cluster
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ClusterStats {
    /// Records held over the dynamic max cluster size
    pub capacity_fraction: f64,
    /// Unnormalized probability mass used to pick this cluster
    pub priority_score: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct BufferStats<K: ClusterKey> {
    pub clusters: HashMap<K, ClusterStats>,
    pub count: usize,
    pub min_cluster_size: usize,
    pub max_cluster_size: usize,
}

/// Prioritized replay buffer over clusters of records.
///
/// Each cluster keeps a sum tree of normalized priorities for O(log n)
/// sampling, plus min/max, insertion-time and drop-priority trees depending
/// on the configuration. Capacity is bounded per cluster and globally; the
/// per-cluster bound shrinks as clusters are added so that every cluster
/// keeps a floor share of the global budget.
pub struct PrioritizedBuffer<K, T> {
    config: BufferConfig,
    /// Declared per-cluster bound
    cluster_size: usize,
    layout: TreeLayout,
    aggregator: PriorityFn,
    priority_can_be_negative: bool,
    /// `priority_lower_limit` in normalized priority space
    lower_limit: Option<f64>,
    registry: ClusterRegistry<K>,
    clusters: Vec<Cluster<T>>,
    /// Clusters smaller than this are protected from buffer-wide eviction
    min_cluster_size: usize,
    /// Dynamic per-cluster bound
    max_cluster_size: usize,
    /// Logical insertion time
    clock: u64,
    rng: SmallRng,
}

impl<K: ClusterKey, T> PrioritizedBuffer<K, T> {
    /// Create a buffer reducing priority signals with the configured
    /// aggregation
    pub fn new(config: BufferConfig) -> Result<Self> {
        let aggregator = config.priority_aggregation.into_fn();
        Self::build(config, aggregator)
    }

    /// Create a buffer reducing priority signals with `aggregator`
    pub fn with_aggregator<F>(config: BufferConfig, aggregator: F) -> Result<Self>
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        Self::build(config, std::sync::Arc::new(aggregator))
    }

    fn build(config: BufferConfig, aggregator: PriorityFn) -> Result<Self> {
        config.validate()?;
        let cluster_size = config.effective_cluster_size();
        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Ok(Self {
            layout: TreeLayout::from_config(&config),
            priority_can_be_negative: config.priority_can_be_negative(),
            lower_limit: config.priority_lower_limit.map(|limit| {
                normalize_lower_limit(
                    limit,
                    config.prioritization_epsilon,
                    config.prioritization_alpha,
                )
            }),
            cluster_size,
            aggregator,
            registry: ClusterRegistry::new(),
            clusters: Vec::new(),
            min_cluster_size: 0,
            max_cluster_size: cluster_size,
            clock: 0,
            rng,
            config,
        })
    }

    #[inline]
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    #[inline]
    pub fn min_cluster_size(&self) -> usize {
        self.min_cluster_size
    }

    #[inline]
    pub fn max_cluster_size(&self) -> usize {
        self.max_cluster_size
    }

    pub fn cluster_ids(&self) -> &[K] {
        self.registry.keys()
    }

    /// Records of `cluster` in slot order
    pub fn records(&self, cluster: &K) -> &[Record<T>] {
        match self.registry.get(cluster) {
            Some(slot) => self.clusters[slot].records(),
            None => &[],
        }
    }

    /// Every stored record, cluster by cluster
    pub fn all_records(&self) -> impl Iterator<Item = &Record<T>> + '_ {
        self.clusters.iter().flat_map(|cluster| cluster.records())
    }

    /// Stored (normalized) priority of the record at `slot` in `cluster`
    pub fn priority(&self, slot: usize, cluster: &K) -> Option<f64> {
        let cluster_slot = self.registry.get(cluster)?;
        self.clusters[cluster_slot].priority(slot)
    }

    /// Apply the aggregation and the alpha transform to a raw signal
    ///
    /// Panics if the aggregated priority is not finite.
    pub fn normalize(&self, signal: &[f64]) -> f64 {
        let raw = if self.priority_can_be_negative {
            (self.aggregator)(signal)
        } else {
            let magnitudes: SmallVec<[f64; 8]> = signal.iter().map(|p| p.abs()).collect();
            (self.aggregator)(&magnitudes[..])
        };
        assert!(raw.is_finite(), "priority must be finite, got {}", raw);
        normalize_priority(
            raw,
            self.config.prioritization_epsilon,
            self.config.prioritization_alpha,
        )
    }

    /// Effective bound for one cluster
    #[inline]
    pub fn cluster_capacity(&self) -> usize {
        self.cluster_size.min(self.max_cluster_size)
    }

    /// Whether `cluster` is large enough to give up records to buffer-wide
    /// eviction
    pub fn is_valid_cluster(&self, cluster: &K) -> bool {
        self.registry
            .get(cluster)
            .is_some_and(|slot| self.clusters[slot].len() >= self.min_cluster_size)
    }

    /// Remove up to `n` least-important records across the buffer, at most
    /// one per eligible cluster. Returns how many were removed.
    ///
    /// The per-cluster candidates are computed once, sorted, and the
    /// smallest `n` removed.
    pub fn evict(&mut self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let prioritized = self.drop_prioritized();
        let mut candidates = self.eviction_candidates(prioritized, self.min_cluster_size.max(1));
        if candidates.is_empty() {
            // Rounding in the dynamic bounds can leave every cluster below
            // the floor share
            candidates = self.eviction_candidates(prioritized, 1);
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
        let n = n.min(candidates.len());
        for &(_, idx, slot) in &candidates[..n] {
            self.clusters[slot].remove(idx);
        }
        debug!(
            "Evicted {} {} records across {} eligible clusters",
            n,
            if prioritized { "lowest-priority" } else { "oldest" },
            candidates.len()
        );
        n
    }

    /// Per-cluster stats keyed by cluster id
    pub fn stats(&self) -> BufferStats<K> {
        let candidates: SmallVec<[usize; 16]> = self.non_empty_clusters();
        let scores = self.cluster_scores(&candidates);
        let mut clusters: HashMap<K, ClusterStats> = (0..self.clusters.len())
            .map(|slot| {
                let stats = ClusterStats {
                    capacity_fraction: self.capacity_fraction(&self.clusters[slot]),
                    priority_score: 0.0,
                };
                (self.registry.key(slot).clone(), stats)
            })
            .collect();
        for (&slot, score) in candidates.iter().zip(scores) {
            if let Some(stats) = clusters.get_mut(self.registry.key(slot)) {
                stats.priority_score = score;
            }
        }
        BufferStats {
            clusters,
            count: self.len(),
            min_cluster_size: self.min_cluster_size,
            max_cluster_size: self.max_cluster_size,
        }
    }

    /// Store a new priority for a previously returned record.
    ///
    /// The record at `slot` must still carry `record`'s id; otherwise the
    /// slot was evicted or reused and the update is ignored. Returns whether
    /// the priority was applied.
    pub fn update_priority(&mut self, record: &Record<T>, slot: usize, cluster: &K) -> bool {
        let Some(cluster_slot) = self.registry.get(cluster) else {
            return false;
        };
        let target = &self.clusters[cluster_slot];
        if slot >= target.len() || target.record(slot).id() != record.id() {
            return false;
        }
        let priority = self.normalize(&record.priority_signal);
        let target = &mut self.clusters[cluster_slot];
        target
            .record_mut(slot)
            .priority_signal
            .clone_from(&record.priority_signal);
        target.set_priority(slot, priority);
        true
    }

    fn len(&self) -> usize {
        self.clusters.iter().map(Cluster::len).sum()
    }

    fn is_full_buffer(&self) -> bool {
        self.config.global_size > 0 && self.len() >= self.config.global_size
    }

    fn is_full_cluster(&self, slot: usize) -> bool {
        self.clusters[slot].len() >= self.cluster_capacity()
    }

    fn non_empty_clusters(&self) -> SmallVec<[usize; 16]> {
        (0..self.clusters.len())
            .filter(|&slot| !self.clusters[slot].is_empty())
            .collect()
    }

    /// `(min, max)` cluster size for `clusters` active clusters.
    ///
    /// With C clusters and proportion q every cluster keeps at least
    /// `N / (C + q)` records and may grow to `(1 + q)` times that.
    fn dynamic_cluster_bounds(&self, clusters: usize) -> (usize, usize) {
        if self.config.global_size == 0 || clusters == 0 {
            return (0, self.cluster_size);
        }
        let q = self.config.min_cluster_size_proportion;
        let min = (self.config.global_size as f64 / (clusters as f64 + q)).floor() as usize;
        let max = (min as f64 * (1.0 + q)).floor() as usize;
        (min, max)
    }

    /// Register `cluster` if new and shrink existing clusters to the new bound
    fn register_cluster(&mut self, cluster: &K) -> usize {
        let (slot, created) = self.registry.register(cluster.clone());
        if !created {
            return slot;
        }
        self.clusters.push(Cluster::new(&self.layout));
        let (min_cluster_size, max_cluster_size) = self.dynamic_cluster_bounds(self.clusters.len());
        info!(
            "Added a new cluster with id {:?}, now there are {} different clusters (cluster size in [{}, {}])",
            cluster,
            self.clusters.len(),
            min_cluster_size,
            max_cluster_size
        );

        for trim_slot in 0..self.clusters.len() {
            let excess = self.clusters[trim_slot].len().saturating_sub(max_cluster_size);
            if excess == 0 {
                continue;
            }
            for _ in 0..excess {
                match self.least_important_slot(trim_slot) {
                    Some(idx) => {
                        self.clusters[trim_slot].remove(idx);
                    }
                    None => break,
                }
            }
            debug!(
                "Trimmed {} records from cluster {:?}",
                excess,
                self.registry.key(trim_slot)
            );
        }

        self.min_cluster_size = min_cluster_size;
        self.max_cluster_size = max_cluster_size;
        slot
    }

    /// Whether this eviction drops by priority (otherwise by age)
    fn drop_prioritized(&mut self) -> bool {
        self.rng.gen::<f64>() < self.config.prioritized_drop_probability
    }

    fn least_important_slot(&mut self, slot: usize) -> Option<usize> {
        let prioritized = self.drop_prioritized();
        self.clusters[slot]
            .least_important(prioritized)
            .and_then(|least| least.index)
    }

    /// `(value, index, cluster slot)` of the least important record of every
    /// cluster holding at least `min_len` records
    fn eviction_candidates(&self, prioritized: bool, min_len: usize) -> SmallVec<[(f64, usize, usize); 16]> {
        self.clusters
            .iter()
            .enumerate()
            .filter(|(_, cluster)| cluster.len() >= min_len)
            .filter_map(|(slot, cluster)| {
                let least = cluster.least_important(prioritized)?;
                Some((least.value, least.index?, slot))
            })
            .collect()
    }

    fn capacity_fraction(&self, cluster: &Cluster<T>) -> f64 {
        if self.max_cluster_size == 0 {
            return 0.0;
        }
        cluster.len() as f64 / self.max_cluster_size as f64
    }

    /// Cluster selection scores: fill level times average priority relative
    /// to the global average, both measured above the global minimum
    fn cluster_scores(&self, candidates: &[usize]) -> SmallVec<[f64; 16]> {
        let min_priority = candidates
            .iter()
            .map(|&slot| self.clusters[slot].min_priority())
            .fold(f64::INFINITY, f64::min);
        let (sum, count) = candidates.iter().fold((0.0, 0usize), |(sum, count), &slot| {
            let cluster = &self.clusters[slot];
            (sum + cluster.priority_sum(), count + cluster.len())
        });
        let spread = if count > 0 {
            sum / count as f64 - min_priority
        } else {
            0.0
        };

        candidates
            .iter()
            .map(|&slot| {
                let cluster = &self.clusters[slot];
                let above_min = cluster.mean_priority().unwrap_or(min_priority) - min_priority;
                let relative = if spread > 0.0 && spread.is_finite() {
                    above_min / spread
                } else {
                    1.0
                };
                self.capacity_fraction(cluster) * relative
            })
            .collect()
    }

    /// Pick the cluster to replay from, `None` if the buffer is empty
    fn sample_cluster(&mut self) -> Option<usize> {
        let candidates = self.non_empty_clusters();
        if candidates.is_empty() {
            return None;
        }
        if self.config.cluster_prioritisation_strategy == ClusterPrioritisation::Highest
            && candidates.len() > 1
        {
            let scores = self.cluster_scores(&candidates);
            let total: f64 = scores.iter().sum();
            if total > 0.0 && total.is_finite() {
                let mass = self.rng.gen::<f64>() * total;
                let mut cumsum = 0.0;
                for (&slot, &score) in candidates.iter().zip(scores.iter()) {
                    cumsum += score;
                    if score > 0.0 && cumsum >= mass {
                        return Some(slot);
                    }
                }
                // Rounding left the mass past the last cumulative sum
                return candidates
                    .iter()
                    .zip(scores.iter())
                    .rev()
                    .find(|(_, score)| **score > 0.0)
                    .map(|(&slot, _)| slot);
            }
        }
        Some(candidates[self.rng.gen_range(0..candidates.len())])
    }

    /// Importance weight of the record at `idx` in cluster `slot`
    fn importance_weight(&self, slot: usize, idx: usize) -> f64 {
        let cluster = &self.clusters[slot];
        let priority = cluster.priority(idx).unwrap_or(f64::NAN);
        let cluster_level = self.config.cluster_level_weighting;
        let min_priority = if cluster_level {
            cluster.min_priority()
        } else {
            self.clusters
                .iter()
                .map(Cluster::min_priority)
                .fold(f64::INFINITY, f64::min)
        };
        let weight = match self.lower_limit {
            None => {
                let max_priority = if cluster_level {
                    cluster.max_priority()
                } else {
                    self.clusters
                        .iter()
                        .map(Cluster::max_priority)
                        .fold(f64::NEG_INFINITY, f64::max)
                };
                eta_normalisation(
                    priority,
                    min_priority,
                    max_priority,
                    self.config.prioritization_importance_eta,
                )
            }
            Some(limit) => lower_limit_ratio(priority, min_priority, limit),
        };
        weight.powf(self.config.prioritization_importance_beta)
    }

    /// Capacity invariants after a mutation of cluster `slot`
    fn assert_bounds(&self, slot: usize) {
        if self.config.global_size > 0 {
            assert!(
                self.len() <= self.config.global_size,
                "replay buffer overflow: {} records for a global size of {}",
                self.len(),
                self.config.global_size
            );
        }
        assert!(
            self.clusters[slot].len() <= self.cluster_capacity(),
            "cluster overflow: {} records for a cluster capacity of {}",
            self.clusters[slot].len(),
            self.cluster_capacity()
        );
    }

    #[cfg(test)]
    fn assert_coherent(&self) {
        for cluster in &self.clusters {
            cluster.assert_coherent();
        }
    }
}

impl<K: ClusterKey, T: Clone> ReplayBuffer<K, T> for PrioritizedBuffer<K, T> {
    fn add(&mut self, mut record: Record<T>, cluster: K, on_policy: bool) -> Result<Insertion<K>> {
        let priority = self.normalize(&record.priority_signal);
        let slot = self.register_cluster(&cluster);
        if self.cluster_capacity() == 0 {
            return Err(BufferError::ZeroClusterCapacity {
                cluster: format!("{:?}", cluster),
                clusters: self.clusters.len(),
                global_size: self.config.global_size,
            });
        }

        let replace_idx = if self.is_full_cluster(slot) {
            // Full cluster: overwrite its least important record
            let idx = self.least_important_slot(slot);
            assert!(idx.is_some(), "full cluster {:?} has no evictable record", cluster);
            idx
        } else {
            // Full buffer but not full cluster: free a slot elsewhere
            if self.is_full_buffer() {
                self.evict(1);
            }
            None
        };

        self.clock += 1;
        record.stamp(Uuid::new_v4(), self.clock);
        let drop_priority = (self.layout.drop == DropSource::Independent).then(|| self.rng.gen::<f64>());

        let target = &mut self.clusters[slot];
        let idx = match replace_idx {
            Some(idx) => {
                target.replace(idx, record);
                idx
            }
            None => target.push(record),
        };
        target.set_insertion_time(idx, self.clock);
        if let Some(drop_priority) = drop_priority {
            target.set_drop_priority(idx, drop_priority);
        }
        target.set_priority(idx, priority);

        if on_policy && self.config.importance_weighting() {
            let weight = self.importance_weight(slot, idx);
            self.clusters[slot].record_mut(idx).weight = Some(weight);
        }

        self.assert_bounds(slot);
        Ok(Insertion { slot: idx, cluster })
    }

    fn sample(&mut self, n: usize) -> Vec<Record<T>> {
        let Some(slot) = self.sample_cluster() else {
            return Vec::new();
        };
        let shift_negative = self.priority_can_be_negative;
        let mut indices: SmallVec<[usize; 32]> = SmallVec::with_capacity(n);
        for _ in 0..n {
            if let Some(idx) = self.clusters[slot].sample_slot(&mut self.rng, shift_negative) {
                indices.push(idx);
            }
        }
        trace!(
            "sample(n={}) cluster={:?} size={}",
            n,
            self.registry.key(slot),
            self.clusters[slot].len()
        );

        let weighting = self.config.importance_weighting();
        let mut batch = Vec::with_capacity(indices.len());
        for idx in indices {
            if weighting {
                let weight = self.importance_weight(slot, idx);
                self.clusters[slot].record_mut(idx).weight = Some(weight);
            }
            batch.push(self.clusters[slot].record(idx).clone());
        }
        batch
    }

    fn count(&self, cluster: Option<&K>) -> usize {
        match cluster {
            None => self.len(),
            Some(key) => self.registry.get(key).map_or(0, |slot| self.clusters[slot].len()),
        }
    }

    fn is_full(&self, cluster: Option<&K>) -> bool {
        if self.is_full_buffer() {
            return true;
        }
        match cluster {
            None => {
                !self.clusters.is_empty() && (0..self.clusters.len()).all(|slot| self.is_full_cluster(slot))
            }
            Some(key) => self.registry.get(key).is_some_and(|slot| self.is_full_cluster(slot)),
        }
    }

    fn clear(&mut self) {
        self.registry.clear();
        self.clusters.clear();
        self.min_cluster_size = 0;
        self.max_cluster_size = self.cluster_size;
    }
}
