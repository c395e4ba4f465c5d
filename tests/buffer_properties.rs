//! Property tests for the prioritized replay buffer
//!
//! Drives the public API through long add/sample/update sequences and checks
//! the capacity, identity and weighting guarantees after every step.

use std::collections::HashSet;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use clustered_replay::priority::normalize_priority;
use clustered_replay::{BufferConfig, PrioritizedBuffer, Record, ReplayBuffer};

/// Helper to route buffer logs to the test output (RUST_LOG=clustered_replay=debug)
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Helper to create a seeded buffer
fn create_buffer(config: BufferConfig) -> PrioritizedBuffer<u32, u64> {
    init_tracing();
    PrioritizedBuffer::new(BufferConfig {
        seed: Some(1234),
        ..config
    })
    .expect("valid config")
}

/// Helper to check every structural invariant of the buffer
fn assert_invariants(buffer: &PrioritizedBuffer<u32, u64>) {
    let global_size = buffer.config().global_size;
    if global_size > 0 {
        assert!(buffer.count(None) <= global_size);
    }

    let mut ids = HashSet::new();
    let mut total = 0;
    for cluster in buffer.cluster_ids() {
        let records = buffer.records(cluster);
        assert!(records.len() <= buffer.cluster_capacity());
        assert_eq!(buffer.count(Some(cluster)), records.len());
        for (idx, record) in records.iter().enumerate() {
            assert_eq!(record.slot(), idx, "slot out of sync in cluster {}", cluster);
            assert!(buffer.priority(idx, cluster).is_some());
            assert!(ids.insert(record.id()), "duplicate id {}", record.id());
        }
        assert_eq!(buffer.priority(records.len(), cluster), None);
        total += records.len();
    }
    assert_eq!(buffer.count(None), total);
}

/// Helper to snapshot `(id, priority)` of every record
fn snapshot(buffer: &PrioritizedBuffer<u32, u64>) -> Vec<(u32, usize, uuid::Uuid, Option<f64>)> {
    buffer
        .cluster_ids()
        .iter()
        .flat_map(|&cluster| {
            buffer
                .records(&cluster)
                .iter()
                .enumerate()
                .map(move |(idx, record)| (cluster, idx, record.id(), buffer.priority(idx, &cluster)))
        })
        .collect()
}

// ============================================================================
// Capacity, identity and index coherence
// ============================================================================

#[test]
fn test_capacity_invariant_under_random_adds() {
    let configs = [
        BufferConfig::with_sizes(0, 200),
        BufferConfig::with_sizes(30, 200),
        BufferConfig {
            prioritized_drop_probability: 1.0,
            global_distribution_matching: true,
            ..BufferConfig::with_sizes(0, 150)
        },
        BufferConfig {
            prioritized_drop_probability: 0.0,
            min_cluster_size_proportion: 0.0,
            ..BufferConfig::with_sizes(0, 120)
        },
        BufferConfig {
            priority_lower_limit: Some(0.0),
            ..BufferConfig::with_sizes(25, 0)
        },
    ];

    for config in configs {
        let mut buffer = create_buffer(config);
        let mut rng = SmallRng::seed_from_u64(99);
        for step in 0..2_000u64 {
            // New clusters keep appearing early on
            let cluster = rng.gen_range(0..(1 + step / 200).min(8)) as u32;
            let priority = rng.gen_range(-5.0..20.0);
            buffer
                .add(Record::with_priority(step, priority), cluster, false)
                .unwrap();
            assert_invariants(&buffer);
        }
    }
}

#[test]
fn test_invariants_with_interleaved_sampling_and_updates() {
    let mut buffer = create_buffer(BufferConfig::with_sizes(0, 100));
    let mut rng = SmallRng::seed_from_u64(5);
    for step in 0..1_000u64 {
        let cluster = rng.gen_range(0..4u32);
        buffer
            .add(Record::with_priority(step, rng.gen_range(0.0..3.0)), cluster, false)
            .unwrap();

        if step % 10 == 0 {
            for mut record in buffer.sample(8) {
                record.priority_signal = vec![rng.gen_range(-1.0..1.0)];
                // Re-resolve the slot by id across clusters
                for &key in buffer.cluster_ids().to_vec().iter() {
                    if let Some(slot) = buffer.records(&key).iter().position(|r| r.id() == record.id()) {
                        assert!(buffer.update_priority(&record, slot, &key));
                    }
                }
            }
        }
        assert_invariants(&buffer);
    }
}

#[test]
fn test_evict_many_keeps_invariants() {
    let mut buffer = create_buffer(BufferConfig::with_sizes(0, 100));
    for step in 0..100u64 {
        buffer
            .add(Record::with_priority(step, step as f64), (step % 5) as u32, false)
            .unwrap();
    }
    let before = buffer.count(None);
    // Five clusters of 20, all above the min cluster size of 18
    assert_eq!(buffer.evict(3), 3);
    assert_eq!(buffer.count(None), before - 3);
    assert_invariants(&buffer);
}

// ============================================================================
// Priorities and eviction
// ============================================================================

#[test]
fn test_priority_monotonicity() {
    let buffer = create_buffer(BufferConfig::default());
    let mut rng = SmallRng::seed_from_u64(3);
    for _ in 0..1_000 {
        let a: f64 = rng.gen_range(0.0..1_000.0);
        let b: f64 = rng.gen_range(0.0..1_000.0);
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        if lo == hi {
            continue;
        }
        assert!(buffer.normalize(&[lo]) < buffer.normalize(&[hi]));
        assert!(buffer.normalize(&[-hi]) < buffer.normalize(&[-lo]));
    }
    assert_eq!(buffer.normalize(&[2.0]), normalize_priority(2.0, 1e-6, 0.6));
}

#[test]
fn test_prioritized_eviction_single_slot_cluster() {
    let mut buffer = create_buffer(BufferConfig {
        prioritized_drop_probability: 1.0,
        ..BufferConfig::with_sizes(1, 0)
    });
    for (payload, priority) in [(5, 5.0), (1, 1.0), (9, 9.0)] {
        buffer
            .add(Record::with_priority(payload, priority), 0, false)
            .unwrap();
        assert_eq!(buffer.count(None), 1);
        assert_eq!(buffer.records(&0)[0].payload, payload);
    }
    assert_eq!(buffer.records(&0)[0].payload, 9);
}

#[test]
fn test_prioritized_eviction_drops_lowest_not_oldest() {
    let mut buffer = create_buffer(BufferConfig {
        prioritized_drop_probability: 1.0,
        ..BufferConfig::with_sizes(2, 0)
    });
    for (payload, priority) in [(5, 5.0), (1, 1.0), (9, 9.0)] {
        buffer
            .add(Record::with_priority(payload, priority), 0, false)
            .unwrap();
    }
    let mut survivors: Vec<u64> = buffer.records(&0).iter().map(|r| r.payload).collect();
    survivors.sort_unstable();
    assert_eq!(survivors, vec![5, 9]);
}

// ============================================================================
// Sampling and weights
// ============================================================================

#[test]
fn test_sampling_bias_matches_priorities() {
    let mut buffer = create_buffer(BufferConfig {
        prioritization_alpha: 1.0,
        prioritization_importance_beta: 0.0,
        ..BufferConfig::with_sizes(2, 0)
    });
    buffer.add(Record::with_priority(0, 1.0), 0, false).unwrap();
    buffer.add(Record::with_priority(1, 100.0), 0, false).unwrap();

    let draws = 10_000;
    let high = buffer
        .sample(draws)
        .iter()
        .filter(|record| record.payload == 1)
        .count();
    let proportion = high as f64 / draws as f64;
    let expected = 100.0 / 101.0;
    assert!(
        (proportion - expected).abs() < 0.006,
        "high-priority proportion {} far from {}",
        proportion,
        expected
    );
}

#[test]
fn test_weights_in_unit_interval() {
    for cluster_level_weighting in [true, false] {
        let mut buffer = create_buffer(BufferConfig {
            cluster_level_weighting,
            ..BufferConfig::with_sizes(0, 300)
        });
        let mut rng = SmallRng::seed_from_u64(11);
        for step in 0..600u64 {
            let priority = rng.gen_range(-50.0..50.0);
            buffer
                .add(Record::with_priority(step, priority), rng.gen_range(0..3), step % 7 == 0)
                .unwrap();
        }
        for _ in 0..50 {
            for record in buffer.sample(16) {
                let weight = record.weight.expect("weights enabled");
                assert!(weight > 0.0 && weight <= 1.0, "weight {} out of (0, 1]", weight);
            }
        }
    }
}

#[test]
fn test_round_trip_single_record() {
    let mut buffer = create_buffer(BufferConfig::default());
    let insertion = buffer
        .add(Record::with_priority(77, -3.5), 4, false)
        .unwrap();
    assert_eq!(insertion.slot, 0);
    assert_eq!(insertion.cluster, 4);

    let id = buffer.records(&4)[0].id();
    for record in buffer.sample(10) {
        assert_eq!(record.payload, 77);
        assert_eq!(record.id(), id);
        assert_eq!(record.weight, Some(1.0));
    }
}

// ============================================================================
// Stale updates and lifecycle
// ============================================================================

#[test]
fn test_stale_update_is_noop() {
    let mut buffer = create_buffer(BufferConfig {
        prioritized_drop_probability: 0.0,
        ..BufferConfig::with_sizes(3, 0)
    });
    for step in 0..3u64 {
        buffer.add(Record::with_priority(step, 1.0), 0, false).unwrap();
    }
    let mut stale = buffer.records(&0)[0].clone();
    // Oldest-first eviction reuses slot 0
    buffer.add(Record::with_priority(10, 2.0), 0, false).unwrap();

    let before = snapshot(&buffer);
    stale.priority_signal = vec![1_000.0];
    assert!(!buffer.update_priority(&stale, stale.slot(), &0));
    assert_eq!(snapshot(&buffer), before);
}

#[test]
fn test_clear_resets_everything() {
    let mut buffer = create_buffer(BufferConfig::with_sizes(0, 50));
    for step in 0..40u64 {
        buffer
            .add(Record::with_priority(step, 1.0), (step % 3) as u32, false)
            .unwrap();
    }
    buffer.clear();
    assert!(buffer.is_empty(None));
    assert!(buffer.sample(5).is_empty());
    assert!(buffer.stats().clusters.is_empty());

    buffer.add(Record::with_priority(1, 1.0), 0, false).unwrap();
    assert_eq!(buffer.count(None), 1);
    assert_invariants(&buffer);
}
