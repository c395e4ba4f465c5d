//! Uniform (non-prioritized) replay buffer

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;
use tracing::info;
use uuid::Uuid;

use super::{ClusterKey, ClusterRegistry, ReplayBuffer};
use crate::config::BufferConfig;
use crate::error::{BufferError, Result};
use crate::record::{Insertion, Record};

/// Baseline buffer: a cluster is picked uniformly, records are drawn
/// uniformly, and capacity pressure evicts a uniformly chosen record.
pub struct UniformBuffer<K, T> {
    /// Max records per cluster
    cluster_size: usize,
    /// Max records overall (0 = unbounded)
    global_size: usize,
    registry: ClusterRegistry<K>,
    clusters: Vec<Vec<Record<T>>>,
    clock: u64,
    rng: SmallRng,
}

impl<K: ClusterKey, T> UniformBuffer<K, T> {
    pub fn new(cluster_size: usize, global_size: usize, seed: Option<u64>) -> Result<Self> {
        if cluster_size == 0 && global_size == 0 {
            return Err(BufferError::invalid(
                "cluster_size",
                "at least one of cluster_size or global_size must be greater than 0",
            ));
        }
        let config = BufferConfig {
            cluster_size,
            global_size,
            seed,
            ..BufferConfig::uniform()
        };
        Ok(Self::build(&config))
    }

    /// Uses the capacity bounds and seed of `config`
    pub fn from_config(config: &BufferConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: &BufferConfig) -> Self {
        Self {
            cluster_size: config.effective_cluster_size(),
            global_size: config.global_size,
            registry: ClusterRegistry::new(),
            clusters: Vec::new(),
            clock: 0,
            rng: match config.seed {
                Some(seed) => SmallRng::seed_from_u64(seed),
                None => SmallRng::from_entropy(),
            },
        }
    }

    #[inline]
    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    pub fn cluster_ids(&self) -> &[K] {
        self.registry.keys()
    }

    /// Records of `cluster` in slot order
    pub fn records(&self, cluster: &K) -> &[Record<T>] {
        match self.registry.get(cluster) {
            Some(slot) => &self.clusters[slot],
            None => &[],
        }
    }

    /// Every stored record, cluster by cluster
    pub fn all_records(&self) -> impl Iterator<Item = &Record<T>> + '_ {
        self.clusters.iter().flatten()
    }

    /// Draw up to `n` distinct records from a uniformly chosen cluster and
    /// take them out of the buffer
    pub fn sample_and_remove(&mut self, n: usize) -> Vec<Record<T>> {
        let candidates = self.non_empty_clusters();
        if candidates.is_empty() {
            return Vec::new();
        }
        let slot = candidates[self.rng.gen_range(0..candidates.len())];
        let records = &mut self.clusters[slot];
        let amount = n.min(records.len());
        let mut picked = rand::seq::index::sample(&mut self.rng, records.len(), amount).into_vec();
        // Highest slot first, so swap_remove only ever moves unpicked records
        picked.sort_unstable_by(|a, b| b.cmp(a));

        let mut batch = Vec::with_capacity(amount);
        for idx in picked {
            batch.push(records.swap_remove(idx));
            if let Some(moved) = records.get_mut(idx) {
                moved.slot = idx;
            }
        }
        batch
    }

    fn len(&self) -> usize {
        self.clusters.iter().map(Vec::len).sum()
    }

    fn is_full_buffer(&self) -> bool {
        self.global_size > 0 && self.len() >= self.global_size
    }

    fn non_empty_clusters(&self) -> SmallVec<[usize; 16]> {
        (0..self.clusters.len())
            .filter(|&slot| !self.clusters[slot].is_empty())
            .collect()
    }

    /// Remove a uniformly chosen record from a uniformly chosen cluster
    fn evict_uniform(&mut self) {
        let candidates = self.non_empty_clusters();
        if candidates.is_empty() {
            return;
        }
        let slot = candidates[self.rng.gen_range(0..candidates.len())];
        let records = &mut self.clusters[slot];
        let idx = self.rng.gen_range(0..records.len());
        records.swap_remove(idx);
        if let Some(moved) = records.get_mut(idx) {
            moved.slot = idx;
        }
    }
}

impl<K: ClusterKey, T: Clone> ReplayBuffer<K, T> for UniformBuffer<K, T> {
    fn add(&mut self, mut record: Record<T>, cluster: K, _on_policy: bool) -> Result<Insertion<K>> {
        let (slot, created) = self.registry.register(cluster.clone());
        if created {
            self.clusters.push(Vec::new());
            info!(
                "Added a new cluster with id {:?}, now there are {} different clusters",
                cluster,
                self.registry.len()
            );
        }

        let replace_idx = if self.clusters[slot].len() >= self.cluster_size {
            Some(self.rng.gen_range(0..self.clusters[slot].len()))
        } else {
            if self.is_full_buffer() {
                self.evict_uniform();
            }
            None
        };

        self.clock += 1;
        record.stamp(Uuid::new_v4(), self.clock);

        let records = &mut self.clusters[slot];
        let idx = match replace_idx {
            Some(idx) => {
                record.slot = idx;
                records[idx] = record;
                idx
            }
            None => {
                record.slot = records.len();
                records.push(record);
                records.len() - 1
            }
        };

        if self.global_size > 0 {
            assert!(
                self.len() <= self.global_size,
                "replay buffer overflow: {} records for a global size of {}",
                self.len(),
                self.global_size
            );
        }
        Ok(Insertion { slot: idx, cluster })
    }

    fn sample(&mut self, n: usize) -> Vec<Record<T>> {
        let candidates = self.non_empty_clusters();
        if candidates.is_empty() {
            return Vec::new();
        }
        let slot = candidates[self.rng.gen_range(0..candidates.len())];
        let records = &self.clusters[slot];
        (0..n)
            .map(|_| records[self.rng.gen_range(0..records.len())].clone())
            .collect()
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
                !self.clusters.is_empty()
                    && self.clusters.iter().all(|records| records.len() >= self.cluster_size)
            }
            Some(key) => self.count(Some(key)) >= self.cluster_size,
        }
    }

    fn clear(&mut self) {
        self.registry.clear();
        self.clusters.clear();
    }
}
