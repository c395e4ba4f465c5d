//! Clustered Replay - bounded, cluster-partitioned experience replay
//!
//! This crate provides:
//! - Segment trees (sum/min/max) sharing one slot layout
//! - A uniform baseline buffer
//! - A prioritized buffer with dynamic cluster sizing, prioritized or
//!   oldest-first eviction, prioritized cluster selection and
//!   importance-sampling weights
//!
//! Buffers are single-owner structures with no internal synchronization.

#![deny(clippy::all)]

pub mod buffer;
pub mod config;
pub mod error;
pub mod priority;
pub mod record;
pub mod segment_tree;

pub use buffer::{BufferStats, ClusterKey, ClusterStats, PrioritizedBuffer, ReplayBuffer, UniformBuffer};
pub use config::{BufferConfig, ClusterPrioritisation};
pub use error::{BufferError, Result};
pub use priority::{PriorityAggregation, PriorityFn};
pub use record::{Insertion, Record};
pub use segment_tree::{MaxTree, MinTree, SegmentTree, SumTree};
