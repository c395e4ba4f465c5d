//! Cluster-partitioned replay buffers
//!
//! - [`UniformBuffer`]: uniform sampling and uniform eviction, the baseline
//! - [`PrioritizedBuffer`]: priority-weighted sampling, prioritized or
//!   oldest-first eviction, dynamic cluster sizing and importance weights

mod cluster;
pub mod prioritized;
pub mod uniform;

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use crate::error::Result;
use crate::record::{Insertion, Record};

pub use prioritized::{BufferStats, ClusterStats, PrioritizedBuffer};
pub use uniform::UniformBuffer;

/// Anything usable as a cluster id
pub trait ClusterKey: Clone + Eq + Hash + fmt::Debug {}

impl<K: Clone + Eq + Hash + fmt::Debug> ClusterKey for K {}

/// Operations shared by every replay buffer.
///
/// Buffers are single-owner structures: callers serialize access themselves.
pub trait ReplayBuffer<K: ClusterKey, T> {
    /// Store `record` in `cluster`, evicting as needed to respect capacity
    fn add(&mut self, record: Record<T>, cluster: K, on_policy: bool) -> Result<Insertion<K>>;

    /// Draw `n` records with replacement from one cluster.
    ///
    /// Returns an empty vector when the buffer holds no record.
    fn sample(&mut self, n: usize) -> Vec<Record<T>>;

    /// Records in `cluster`, or in the whole buffer for `None`
    fn count(&self, cluster: Option<&K>) -> usize;

    fn is_full(&self, cluster: Option<&K>) -> bool;

    fn is_empty(&self, cluster: Option<&K>) -> bool {
        self.count(cluster) == 0
    }

    fn has_at_least(&self, n: usize, cluster: Option<&K>) -> bool {
        self.count(cluster) >= n
    }

    /// Drop every cluster and record
    fn clear(&mut self);
}

/// Maps cluster ids to dense arena slots, in registration order
#[derive(Debug)]
pub(crate) struct ClusterRegistry<K> {
    slots: HashMap<K, usize>,
    keys: Vec<K>,
}

impl<K: ClusterKey> ClusterRegistry<K> {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            keys: Vec::new(),
        }
    }

    #[inline]
    pub fn get(&self, key: &K) -> Option<usize> {
        self.slots.get(key).copied()
    }

    /// Slot for `key`, and whether it was just created
    pub fn register(&mut self, key: K) -> (usize, bool) {
        if let Some(slot) = self.get(&key) {
            return (slot, false);
        }
        let slot = self.keys.len();
        self.slots.insert(key.clone(), slot);
        self.keys.push(key);
        (slot, true)
    }

    #[inline]
    pub fn key(&self, slot: usize) -> &K {
        &self.keys[slot]
    }

    #[inline]
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.keys.clear();
    }
}
