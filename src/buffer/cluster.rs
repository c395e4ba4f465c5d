//! One cluster: a dense record array plus the segment trees indexed by slot

use rand::Rng;

use crate::config::{BufferConfig, ClusterPrioritisation};
use crate::record::Record;
use crate::segment_tree::{Extremum, MaxTree, MinTree, SumTree};

/// Where the prioritized-drop minimum is read from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DropSource {
    /// Prioritized drop disabled
    Disabled,
    /// Lowest sample priority (the min tree)
    SamplePriority,
    /// Independent random drop priority
    Independent,
}

/// Which trees every cluster carries, decided once from the configuration
#[derive(Clone, Copy, Debug)]
pub(crate) struct TreeLayout {
    pub capacity: usize,
    pub with_min: bool,
    pub with_max: bool,
    pub with_insertion_time: bool,
    pub drop: DropSource,
}

impl TreeLayout {
    pub fn from_config(config: &BufferConfig) -> Self {
        let drop_probability = config.prioritized_drop_probability;
        let drop = if drop_probability <= 0.0 {
            DropSource::Disabled
        } else if config.global_distribution_matching {
            DropSource::Independent
        } else {
            DropSource::SamplePriority
        };
        let can_be_negative = config.priority_can_be_negative();
        Self {
            capacity: config.effective_cluster_size(),
            with_min: config.importance_weighting()
                || can_be_negative
                || drop == DropSource::SamplePriority
                || config.cluster_prioritisation_strategy != ClusterPrioritisation::Uniform,
            with_max: can_be_negative,
            with_insertion_time: drop_probability < 1.0,
            drop,
        }
    }
}

/// Per-slot trees of a cluster. Every tree shares the record array's indices.
#[derive(Debug)]
struct ClusterTrees {
    sample: SumTree,
    min: Option<MinTree>,
    max: Option<MaxTree>,
    insertion_time: Option<MinTree>,
    drop: Option<MinTree>,
    drop_source: DropSource,
}

impl ClusterTrees {
    fn new(layout: &TreeLayout) -> Self {
        let capacity = layout.capacity;
        Self {
            sample: SumTree::new(capacity),
            min: layout.with_min.then(|| MinTree::new(capacity)),
            max: layout.with_max.then(|| MaxTree::new(capacity)),
            insertion_time: layout.with_insertion_time.then(|| MinTree::new(capacity)),
            drop: (layout.drop == DropSource::Independent).then(|| MinTree::new(capacity)),
            drop_source: layout.drop,
        }
    }

    fn set_priority(&mut self, idx: usize, priority: Option<f64>) {
        self.sample.update(idx, priority);
        if let Some(tree) = self.min.as_mut() {
            tree.update(idx, priority);
        }
        if let Some(tree) = self.max.as_mut() {
            tree.update(idx, priority);
        }
    }

    /// Move every tree's leaf `from` into `to` and clear `from`
    fn move_slot(&mut self, from: usize, to: usize) {
        self.set_priority(to, self.sample.get(from));
        self.set_priority(from, None);
        for tree in [self.insertion_time.as_mut(), self.drop.as_mut()].into_iter().flatten() {
            let value = tree.get(from);
            tree.update(to, value);
            tree.update(from, None);
        }
    }

    fn clear_slot(&mut self, idx: usize) {
        self.set_priority(idx, None);
        for tree in [self.insertion_time.as_mut(), self.drop.as_mut()].into_iter().flatten() {
            tree.remove(idx);
        }
    }

    fn drop_tree(&self) -> Option<&MinTree> {
        match self.drop_source {
            DropSource::Disabled => None,
            DropSource::SamplePriority => self.min.as_ref(),
            DropSource::Independent => self.drop.as_ref(),
        }
    }
}

pub(crate) struct Cluster<T> {
    records: Vec<Record<T>>,
    trees: ClusterTrees,
}

impl<T> Cluster<T> {
    pub fn new(layout: &TreeLayout) -> Self {
        Self {
            records: Vec::new(),
            trees: ClusterTrees::new(layout),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[inline]
    pub fn records(&self) -> &[Record<T>] {
        &self.records
    }

    #[inline]
    pub fn record(&self, idx: usize) -> &Record<T> {
        &self.records[idx]
    }

    #[inline]
    pub fn record_mut(&mut self, idx: usize) -> &mut Record<T> {
        &mut self.records[idx]
    }

    /// Append `record`, returning its slot
    pub fn push(&mut self, mut record: Record<T>) -> usize {
        let idx = self.records.len();
        record.slot = idx;
        self.records.push(record);
        idx
    }

    /// Overwrite the record at `idx`. Trees keep the old values until reset.
    pub fn replace(&mut self, idx: usize, mut record: Record<T>) {
        record.slot = idx;
        self.records[idx] = record;
    }

    pub fn set_priority(&mut self, idx: usize, priority: f64) {
        self.trees.set_priority(idx, Some(priority));
    }

    pub fn set_insertion_time(&mut self, idx: usize, tick: u64) {
        if let Some(tree) = self.trees.insertion_time.as_mut() {
            tree.set(idx, tick as f64);
        }
    }

    pub fn set_drop_priority(&mut self, idx: usize, value: f64) {
        if let Some(tree) = self.trees.drop.as_mut() {
            tree.set(idx, value);
        }
    }

    /// Stored (normalized) priority at `idx`
    pub fn priority(&self, idx: usize) -> Option<f64> {
        if idx >= self.len() {
            return None;
        }
        self.trees.sample.get(idx)
    }

    #[inline]
    pub fn priority_sum(&self) -> f64 {
        self.trees.sample.sum()
    }

    /// Lowest stored priority, `+inf` when empty
    pub fn min_priority(&self) -> f64 {
        self.trees.min.as_ref().map_or(f64::INFINITY, |tree| tree.min().value)
    }

    /// Highest stored priority, `-inf` when empty
    pub fn max_priority(&self) -> f64 {
        self.trees.max.as_ref().map_or(f64::NEG_INFINITY, |tree| tree.max().value)
    }

    /// Average stored priority, `None` when empty
    pub fn mean_priority(&self) -> Option<f64> {
        if self.is_empty() {
            None
        } else {
            Some(self.priority_sum() / self.len() as f64)
        }
    }

    /// Least important record: lowest drop priority when `prioritized`,
    /// otherwise the oldest. Falls back to whichever tree exists.
    pub fn least_important(&self, prioritized: bool) -> Option<Extremum> {
        let drop_tree = self.trees.drop_tree();
        let insertion_tree = self.trees.insertion_time.as_ref();
        let tree = if prioritized {
            drop_tree.or(insertion_tree)
        } else {
            insertion_tree.or(drop_tree)
        }?;
        let least = tree.min();
        least.index.map(|_| least)
    }

    /// Remove the record at `idx`, moving the last record into the freed slot.
    ///
    /// Panics if `idx` is past the end.
    pub fn remove(&mut self, idx: usize) -> Record<T> {
        let last_idx = self.records.len().saturating_sub(1);
        assert!(
            idx < self.records.len(),
            "slot {} cannot be removed from a cluster of {} records",
            idx,
            self.records.len()
        );
        if idx == last_idx {
            self.trees.clear_slot(idx);
        } else {
            self.trees.move_slot(last_idx, idx);
        }
        let removed = self.records.swap_remove(idx);
        if let Some(moved) = self.records.get_mut(idx) {
            moved.slot = idx;
        }
        removed
    }

    /// Draw one slot proportionally to stored priority.
    ///
    /// With `shift_negative`, a negative cluster minimum is subtracted from
    /// every priority so masses are non-negative. A cluster without mass is
    /// sampled uniformly.
    pub fn sample_slot<R: Rng>(&self, rng: &mut R, shift_negative: bool) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let shift = if shift_negative {
            self.min_priority().min(0.0)
        } else {
            0.0
        };
        let total = self.priority_sum() - self.len() as f64 * shift;
        if !total.is_finite() || total <= 0.0 {
            return Some(rng.gen_range(0..self.len()));
        }
        let mass = rng.gen::<f64>() * total;
        self.trees
            .sample
            .find_prefixsum_idx(mass, shift)
            .map(|idx| idx.min(self.len() - 1))
    }

    /// Every record's slot matches its position and every tree holds exactly
    /// the live slots
    #[cfg(test)]
    pub fn assert_coherent(&self) {
        let len = self.len();
        for (idx, record) in self.records.iter().enumerate() {
            assert_eq!(record.slot, idx, "record slot out of sync");
            assert!(self.trees.sample.get(idx).is_some(), "missing priority at {}", idx);
        }
        assert_eq!(self.trees.sample.inserted_elements(), len);
        if let Some(tree) = self.trees.min.as_ref() {
            assert_eq!(tree.inserted_elements(), len);
        }
        if let Some(tree) = self.trees.max.as_ref() {
            assert_eq!(tree.inserted_elements(), len);
        }
        if let Some(tree) = self.trees.insertion_time.as_ref() {
            assert_eq!(tree.inserted_elements(), len);
        }
        if let Some(tree) = self.trees.drop.as_ref() {
            assert_eq!(tree.inserted_elements(), len);
        }
    }
}
