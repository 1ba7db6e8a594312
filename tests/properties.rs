//! Property tests for the invariant-bearing data structures.

use proptest::prelude::*;

use weft::counter::{CounterUpdate, GlobalCounter};
use weft::mesh::bucket::{PriorityQueue, TokenBucket};
use weft::metrics::Reservoir;
use weft::sync::{compare_vectors, VectorOrder, VersionVector};

fn version_vector() -> impl Strategy<Value = VersionVector> {
    prop::collection::btree_map("[abc]", 0u64..5, 0..3)
}

proptest! {
    #[test]
    fn token_bucket_stays_within_bounds(
        rate in 0.5f64..50.0,
        capacity in 1.0f64..50.0,
        acquires in prop::collection::vec(0.1f64..5.0, 1..50),
    ) {
        let mut bucket = TokenBucket::new(rate, capacity);
        for count in acquires {
            let wait = bucket.acquire(count);
            prop_assert!(bucket.tokens() >= 0.0);
            prop_assert!(bucket.tokens() <= bucket.capacity());
            prop_assert!(wait >= std::time::Duration::ZERO);
        }
    }

    #[test]
    fn vector_comparison_is_antisymmetric(a in version_vector(), b in version_vector()) {
        match compare_vectors(&a, &b) {
            VectorOrder::Dominates => {
                prop_assert_eq!(compare_vectors(&b, &a), VectorOrder::Dominated);
            }
            VectorOrder::Dominated => {
                prop_assert_eq!(compare_vectors(&b, &a), VectorOrder::Dominates);
            }
            VectorOrder::Concurrent => {
                prop_assert_eq!(compare_vectors(&b, &a), VectorOrder::Concurrent);
            }
        }
    }

    #[test]
    fn counter_application_is_idempotent(
        updates in prop::collection::vec(("[ab]", 1i64..10, 1i64..100), 1..20),
    ) {
        let once = GlobalCounter::new();
        let twice = GlobalCounter::new();
        for (node, delta, ts) in &updates {
            let update = CounterUpdate {
                node_id: node.clone(),
                delta: *delta,
                logical_ts: *ts,
                counter_kind: "tool_call".into(),
            };
            once.apply(&update);
            twice.apply(&update);
            twice.apply(&update);
        }
        prop_assert_eq!(once.total(), twice.total());
        prop_assert_eq!(once.node_count("a"), twice.node_count("a"));
        prop_assert_eq!(once.node_count("b"), twice.node_count("b"));
    }

    #[test]
    fn priority_queue_respects_capacity_and_order(
        pushes in prop::collection::vec(-5i32..15, 1..40),
    ) {
        let mut queue = PriorityQueue::new(8);
        for (i, priority) in pushes.iter().enumerate() {
            queue.push(*priority, i);
            prop_assert!(queue.len() <= 8);
        }
        let mut last: Option<i32> = None;
        let mut drained = Vec::new();
        while let Some(item) = queue.pop() {
            drained.push(pushes[item]);
        }
        for priority in drained {
            if let Some(prev) = last {
                prop_assert!(priority <= prev, "pops must be non-increasing in priority");
            }
            last = Some(priority);
        }
    }

    #[test]
    fn reservoir_is_bounded_and_summary_counts_match(
        samples in prop::collection::vec(0.0f64..1e6, 0..64),
    ) {
        let mut reservoir = Reservoir::new(16);
        for s in &samples {
            reservoir.push(*s);
        }
        prop_assert!(reservoir.len() <= 16);
        match reservoir.summary() {
            Some(summary) => {
                prop_assert_eq!(summary.count, samples.len().min(16));
                prop_assert!(summary.min <= summary.p50);
                prop_assert!(summary.p50 <= summary.p95);
                prop_assert!(summary.p95 <= summary.max);
            }
            None => prop_assert!(samples.is_empty()),
        }
    }
}
