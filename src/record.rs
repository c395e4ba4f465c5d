//! Records stored in a replay buffer

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An opaque payload plus the metadata the buffer keeps about it.
///
/// `id`, `slot` and `inserted_at` are stamped by the buffer on insertion.
/// A record built with [`Record::new`] carries the nil id until it is stored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Record<T> {
    /// Caller data
    pub payload: T,
    /// Raw per-step priority values, reduced to one scalar by the buffer's
    /// aggregation function
    pub priority_signal: Vec<f64>,
    /// Importance-sampling weight written by the buffer
    pub weight: Option<f64>,
    pub(crate) id: Uuid,
    pub(crate) slot: usize,
    pub(crate) inserted_at: u64,
}

impl<T> Record<T> {
    pub fn new(payload: T, priority_signal: Vec<f64>) -> Self {
        Self {
            payload,
            priority_signal,
            weight: None,
            id: Uuid::nil(),
            slot: 0,
            inserted_at: 0,
        }
    }

    /// Record with a single-step priority signal
    pub fn with_priority(payload: T, priority: f64) -> Self {
        Self::new(payload, vec![priority])
    }

    /// Unique identifier assigned on insertion
    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Slot within the owning cluster at the time this copy was taken.
    ///
    /// Slots are reassigned when other records are evicted; resolve by
    /// [`Record::id`] before relying on it.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Logical insertion time (monotonic per buffer)
    #[inline]
    pub fn inserted_at(&self) -> u64 {
        self.inserted_at
    }

    pub(crate) fn stamp(&mut self, id: Uuid, inserted_at: u64) {
        self.id = id;
        self.inserted_at = inserted_at;
        self.weight = None;
    }
}

/// Where `add` put a record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Insertion<K> {
    pub slot: usize,
    pub cluster: K,
}
