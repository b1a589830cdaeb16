//! Property-based tests for the memory tiers using proptest.
//!
//! These check the invariants that must hold for any sequence of operations:
//!
//! - A store never holds more records than its capacity
//! - Eviction always takes a record of the lowest resident priority
//! - Scores stay in `[0, 1]` and retrieval order is deterministic
//! - Retrieval returns `min(limit, candidates)` records

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;

    use crate::memory::codec;
    use crate::memory::retrieve::{Query, Retriever};
    use crate::memory::scoring::{Scorer, ScoringConfig};
    use crate::memory::store::{InMemoryStore, MemoryStore};
    use crate::memory::types::{Kind, Priority, Record, RecordFilter, Tier};

    fn priority() -> impl Strategy<Value = Priority> {
        prop_oneof![
            Just(Priority::Low),
            Just(Priority::Medium),
            Just(Priority::High),
            Just(Priority::Critical),
        ]
    }

    fn words() -> impl Strategy<Value = String> {
        prop::collection::vec(
            prop_oneof![
                Just("alice"),
                Just("python"),
                Just("deploy"),
                Just("weather"),
                Just("lunch"),
                Just("key"),
            ],
            1..6,
        )
        .prop_map(|w| w.join(" "))
    }

    fn record(content: String, priority: Priority, offset_secs: i64) -> Record {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        Record::new_at(
            content,
            Kind::ShortTerm,
            priority,
            t0 + Duration::seconds(offset_secs),
        )
    }

    // =========================================================================
    // Capacity and Eviction
    // =========================================================================

    proptest! {
        /// Occupancy never exceeds capacity, whatever is inserted.
        #[test]
        fn store_never_exceeds_capacity(
            capacity in 1usize..8,
            priorities in prop::collection::vec(priority(), 0..40)
        ) {
            let store = InMemoryStore::new(Tier::ShortTerm, capacity).unwrap();
            for (i, p) in priorities.into_iter().enumerate() {
                store.insert(record(format!("r{}", i), p, i as i64)).unwrap();
                prop_assert!(store.len().unwrap() <= capacity);
            }
        }

        /// The evicted record never outranks any record left behind.
        #[test]
        fn eviction_takes_lowest_priority(
            capacity in 1usize..6,
            priorities in prop::collection::vec(priority(), 1..30)
        ) {
            let store = InMemoryStore::new(Tier::ShortTerm, capacity).unwrap();
            for (i, p) in priorities.into_iter().enumerate() {
                let residents = store.snapshot(&RecordFilter::default()).unwrap();
                if let Some(evicted) = store.insert(record(format!("r{}", i), p, i as i64)).unwrap() {
                    for resident in residents.iter().filter(|r| r.id != evicted.id) {
                        prop_assert!(evicted.priority <= resident.priority);
                    }
                    if evicted.priority == Priority::Critical {
                        prop_assert!(residents.iter().all(|r| r.priority == Priority::Critical));
                    }
                }
            }
        }
    }

    // =========================================================================
    // Scoring and Retrieval
    // =========================================================================

    proptest! {
        /// Every score is a number in [0, 1].
        #[test]
        fn scores_are_bounded(
            content in words(),
            query in words(),
            p in priority(),
            age_secs in 0i64..10_000_000
        ) {
            let r = record(content, p, 0);
            let now = r.created_at + Duration::seconds(age_secs);
            let score = Scorer::new(ScoringConfig::default()).score(&r, &Query::new(query, 5), now);
            prop_assert!(score.is_finite());
            prop_assert!((0.0..=1.0).contains(&score));
        }

        /// Ranking the same state twice gives the same ids in the same order.
        #[test]
        fn ranking_is_deterministic(
            entries in prop::collection::vec((words(), priority()), 1..20),
            query in words(),
            limit in 1usize..10
        ) {
            let store = InMemoryStore::new(Tier::ShortTerm, 32).unwrap();
            for (i, (content, p)) in entries.into_iter().enumerate() {
                store.insert(record(content, p, (i % 3) as i64)).unwrap();
            }
            let now = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
            let retriever = Retriever::default();
            let query = Query::new(query, limit);
            let stores: [&dyn MemoryStore; 1] = [&store];

            let first: Vec<_> = retriever.rank(&stores, &query, now).unwrap()
                .into_iter().map(|s| s.record.id).collect();
            let second: Vec<_> = retriever.rank(&stores, &query, now).unwrap()
                .into_iter().map(|s| s.record.id).collect();

            prop_assert!(first.len() <= limit);
            prop_assert_eq!(first, second);
        }

        /// Retrieval fills the limit unless there are fewer candidates.
        #[test]
        fn retrieval_returns_min_of_limit_and_candidates(
            short in prop::collection::vec((words(), priority()), 0..12),
            long in prop::collection::vec((words(), priority()), 0..12),
            limit in 1usize..30
        ) {
            let st = InMemoryStore::new(Tier::ShortTerm, 16).unwrap();
            let lt = InMemoryStore::new(Tier::LongTerm, 16).unwrap();
            let candidates = short.len() + long.len();
            for (i, (content, p)) in short.into_iter().enumerate() {
                st.insert(record(content, p, i as i64)).unwrap();
            }
            for (i, (content, p)) in long.into_iter().enumerate() {
                lt.insert(record(content, p, i as i64)).unwrap();
            }
            let now = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
            let stores: [&dyn MemoryStore; 2] = [&st, &lt];

            let results = Retriever::default()
                .retrieve(&stores, &Query::new("alice", limit), now)
                .unwrap();
            prop_assert_eq!(results.len(), limit.min(candidates));
            prop_assert!(results.iter().all(|s| s.record.access_count == 1));
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    proptest! {
        /// Any encoded snapshot decodes back to itself.
        #[test]
        fn snapshot_survives_encoding(
            entries in prop::collection::vec((words(), priority()), 0..10),
            embedding in prop::collection::vec(-10.0f32..10.0, 1..8)
        ) {
            let short_term: Vec<Record> = entries
                .into_iter()
                .enumerate()
                .map(|(i, (content, p))| {
                    record(content, p, i as i64).with_embedding(embedding.clone())
                })
                .collect();
            let state = codec::MemorySnapshot {
                session_id: "s".to_string(),
                short_term_capacity: 10,
                long_term_capacity: 10,
                short_term,
                long_term: Vec::new(),
            };

            let back = codec::decode(&codec::encode(&state).unwrap()).unwrap();
            prop_assert_eq!(back, state);
        }
    }
}
