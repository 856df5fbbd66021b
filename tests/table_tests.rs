use compact_ht::{
    full_observed, reset_full_flag, CuckooTable, FeistelPermutation, IcebergTable, Outcome,
    TableError,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;

/// Fixed seed so table layouts (and therefore eviction paths) are
/// reproducible across runs.
const SEED: u64 = 0x0123_4567_89ab_cdef;

mod helpers {
    use super::*;

    /// 21-bit keys, 32 buckets of 32 compact u32 slots, three hashes:
    /// 1024 slots total.
    pub type TestCuckoo = CuckooTable<u32, FeistelPermutation, 32, 3>;

    /// Primary: 32 buckets of 32 slots, one hash. Secondary: 16 buckets
    /// of 16 slots, three hashes from an independent family.
    pub type TestIceberg = IcebergTable<u32, u32, FeistelPermutation, 32, 16, 1, 3>;

    pub fn cuckoo_w21() -> TestCuckoo {
        TestCuckoo::with_seed(21, 5, SEED).expect("valid geometry")
    }

    pub fn iceberg_w21() -> TestIceberg {
        TestIceberg::with_seed(21, 5, 4, SEED).expect("valid geometry")
    }

    pub fn outcomes(len: usize) -> Vec<Outcome> {
        vec![Outcome::Full; len]
    }

    pub fn assert_all(results: &[Outcome], expected: Outcome) {
        for (i, &r) in results.iter().enumerate() {
            assert_eq!(r, expected, "result {i}");
        }
    }
}

mod cuckoo_ops {
    use super::helpers::*;
    use super::*;

    /// Bulk insert of 1000 sequential keys into 1024 slots, then a find
    /// sweep over twice the range.
    #[test]
    fn bulk_put_then_find() {
        let table = cuckoo_w21();
        let keys: Vec<u64> = (0..1000).collect();
        let mut results = outcomes(keys.len());
        table.put(&keys, &mut results).unwrap();
        assert_all(&results, Outcome::Put);

        let probes: Vec<u64> = (0..2000).collect();
        let mut hits = vec![false; probes.len()];
        table.find(&probes, &mut hits).unwrap();
        for (i, &hit) in hits.iter().enumerate() {
            assert_eq!(hit, i < 1000, "key {i}");
        }
        for k in 0..1000 {
            assert_eq!(table.count(k), 1, "key {k}");
        }
        assert_eq!(table.occupied_slots(), 1000);
    }

    /// Stepwise sorted find-or-put: every batch of fresh keys comes back
    /// `Put`, repeating a batch comes back `Found`, and keys from batches
    /// not yet presented stay absent.
    #[test]
    fn stepwise_sorted_find_or_put() {
        let table = cuckoo_w21();
        let all: Vec<u64> = (0..300).collect();
        for batch in all.chunks(30) {
            let mut results = outcomes(batch.len());
            table.find_or_put_sorted(batch, &mut results).unwrap();
            assert_all(&results, Outcome::Put);

            table.find_or_put_sorted(batch, &mut results).unwrap();
            assert_all(&results, Outcome::Found);

            let next = batch[batch.len() - 1] + 1;
            for unseen in next..next + 10 {
                assert_eq!(table.count(unseen), 0, "key {unseen} inserted early");
            }
        }
        for k in 0..300 {
            assert_eq!(table.count(k), 1);
        }
    }

    /// Unsorted find-or-put over a duplicate-heavy random stream,
    /// processed in batches: each distinct key ends up stored exactly
    /// once, and a repeated batch reports only `Found`.
    #[test]
    fn unsorted_find_or_put_random_batches() {
        let table = cuckoo_w21();
        let mut rng = ChaCha12Rng::seed_from_u64(2024);
        let keys: Vec<u64> = (0..800).map(|_| rng.random_range(0..=100)).collect();
        let mut scratch = vec![0u64; 400];

        for batch in keys.chunks(200) {
            let mut results = outcomes(batch.len());
            table.find_or_put(batch, &mut scratch, &mut results).unwrap();
            assert!(results.iter().all(|r| !r.is_full()));
        }
        for k in 0..=100u64 {
            let expected = usize::from(keys.contains(&k));
            assert_eq!(table.count(k), expected, "key {k}");
        }

        let replay = &keys[0..200];
        let mut results = outcomes(replay.len());
        table.find_or_put(replay, &mut scratch, &mut results).unwrap();
        assert_all(&results, Outcome::Found);
    }

    /// Sorted find-or-put with adjacent duplicates: first occurrences
    /// insert, the rest coarsen to `Found`; a second run is pure `Found`.
    #[test]
    fn sorted_find_or_put_is_idempotent() {
        let table = cuckoo_w21();
        let keys: Vec<u64> = [0, 0, 1, 5, 5, 5, 9, 12, 12, 40]
            .into_iter()
            .collect();
        let mut results = outcomes(keys.len());
        table.find_or_put_sorted(&keys, &mut results).unwrap();
        let expected = [
            Outcome::Put,
            Outcome::Found,
            Outcome::Put,
            Outcome::Put,
            Outcome::Found,
            Outcome::Found,
            Outcome::Put,
            Outcome::Put,
            Outcome::Found,
            Outcome::Put,
        ];
        assert_eq!(results, expected);

        table.find_or_put_sorted(&keys, &mut results).unwrap();
        assert_all(&results, Outcome::Found);
        for k in [0u64, 1, 5, 9, 12, 40] {
            assert_eq!(table.count(k), 1);
        }
    }

    /// Overfilling a 1024-slot table with 1025 distinct keys must reject
    /// at least one of them and raise the process-wide failure flag.
    #[test]
    fn overfill_reports_full() {
        let table = cuckoo_w21();
        let keys: Vec<u64> = (0..1025).collect();
        let mut scratch = vec![0u64; 2 * keys.len()];
        let mut results = outcomes(keys.len());

        reset_full_flag();
        table.find_or_put(&keys, &mut scratch, &mut results).unwrap();
        let puts = results.iter().filter(|r| r.is_put()).count();
        let fulls = results.iter().filter(|r| r.is_full()).count();
        assert!(fulls >= 1, "1025 keys cannot fit 1024 slots");
        assert_eq!(puts + fulls, keys.len());
        assert_eq!(table.occupied_slots(), puts);
        assert!(full_observed());
    }

    /// Raw put stores duplicates; put_avoid_dups does not.
    #[test]
    fn raw_put_keeps_duplicates() {
        let table = cuckoo_w21();
        let keys = [77u64, 77];
        let mut results = outcomes(2);
        table.put(&keys, &mut results).unwrap();
        assert_all(&results, Outcome::Put);
        assert_eq!(table.count(77), 2);

        let other = [99u64, 99];
        table.put_avoid_dups(&other, &mut results).unwrap();
        assert_eq!(
            results.iter().filter(|r| r.is_put()).count(),
            1,
            "one copy wins"
        );
        assert_eq!(results.iter().filter(|r| r.is_found()).count(), 1);
        assert_eq!(table.count(99), 1);
    }

    /// Clearing brings every count back to zero and makes the table
    /// reusable.
    #[test]
    fn clear_resets_everything() {
        let mut table = cuckoo_w21();
        let keys: Vec<u64> = (0..500).collect();
        let mut results = outcomes(keys.len());
        table.put(&keys, &mut results).unwrap();
        assert!(table.occupied_slots() > 0);

        table.clear();
        assert_eq!(table.occupied_slots(), 0);
        for k in 0..500 {
            assert_eq!(table.count(k), 0);
            assert!(!table.contains(k));
        }

        table.put(&keys, &mut results).unwrap();
        assert_all(&results, Outcome::Put);
    }

    /// Wide rows and a larger universe through the default geometry.
    #[test]
    fn wide_row_table() {
        let table = CuckooTable::<u64, FeistelPermutation, 32, 3>::with_seed(33, 7, SEED).unwrap();
        let mut rng = ChaCha12Rng::seed_from_u64(5);
        let keys: Vec<u64> = (0..3000).map(|_| rng.random::<u64>() >> 31).collect();
        let mut results = outcomes(keys.len());
        table.put_avoid_dups(&keys, &mut results).unwrap();
        assert!(results.iter().all(|r| !r.is_full()));

        let mut hits = vec![false; keys.len()];
        table.find(&keys, &mut hits).unwrap();
        assert!(hits.iter().all(|&h| h));
        for &k in &keys {
            assert_eq!(table.count(k), 1);
        }
    }
}

mod iceberg_ops {
    use super::helpers::*;
    use super::*;

    /// Filling past the primary capacity: everything is stored, the
    /// pigeonhole overflow lands in the secondary, and every key counts
    /// exactly once across both levels.
    #[test]
    fn overflow_spills_to_secondary() {
        let table = iceberg_w21();
        assert_eq!(table.primary_capacity(), 1024);
        assert_eq!(table.secondary_capacity(), 256);

        let keys: Vec<u64> = (0..1100).collect();
        let mut results = outcomes(keys.len());
        table.put(&keys, &mut results).unwrap();
        assert_all(&results, Outcome::Put);

        // 1100 keys cannot all sit in 1024 primary slots.
        assert!(table.secondary_occupied() >= 76);
        assert_eq!(
            table.primary_occupied() + table.secondary_occupied(),
            keys.len()
        );

        let mut hits = vec![false; keys.len()];
        table.find(&keys, &mut hits).unwrap();
        assert!(hits.iter().all(|&h| h));
        for &k in &keys {
            assert_eq!(table.count(k), 1);
        }
        for k in 1100..1300 {
            assert!(!table.contains(k));
        }
    }

    /// A primary miss must not conclude absence: keys resident in the
    /// secondary are found even while their primary bucket has room.
    #[test]
    fn secondary_resident_keys_are_found() {
        let table = iceberg_w21();
        let keys: Vec<u64> = (0..1100).collect();
        let mut results = outcomes(keys.len());
        table.put(&keys, &mut results).unwrap();
        assert!(table.secondary_occupied() > 0);

        // Every key is found regardless of which level holds it, and the
        // levels never hold the same key twice.
        for &k in &keys {
            assert!(table.contains(k), "key {k}");
            assert_eq!(table.count(k), 1, "key {k}");
        }
    }

    /// Repeated find-or-put of a duplicate-heavy multiset, no scratch:
    /// one `Put` per distinct key the first time, all `Found` the second
    /// time, counts stable at one.
    #[test]
    fn repeated_find_or_put_multiset() {
        let table = iceberg_w21();
        let mut rng = ChaCha12Rng::seed_from_u64(12345);
        let keys: Vec<u64> = (0..500).map(|_| rng.random_range(0..=150)).collect();
        let distinct = {
            let mut d = keys.clone();
            d.sort_unstable();
            d.dedup();
            d
        };

        let mut results = outcomes(keys.len());
        table.find_or_put(&keys, &mut results).unwrap();
        assert!(results.iter().all(|r| !r.is_full()));
        let puts = results.iter().filter(|r| r.is_put()).count();
        assert_eq!(puts, distinct.len(), "one insert per distinct key");
        for &k in &distinct {
            assert_eq!(table.count(k), 1);
        }

        table.find_or_put(&keys, &mut results).unwrap();
        assert_all(&results, Outcome::Found);
        for &k in &distinct {
            assert_eq!(table.count(k), 1);
        }
    }

    /// The sorted variant shares the cuckoo contract, including the
    /// `Found` coarsening for non-first occurrences.
    #[test]
    fn sorted_find_or_put() {
        let table = iceberg_w21();
        let keys = [3u64, 3, 3, 8, 15, 15, 200];
        let mut results = outcomes(keys.len());
        table.find_or_put_sorted(&keys, &mut results).unwrap();
        assert_eq!(
            results,
            [
                Outcome::Put,
                Outcome::Found,
                Outcome::Found,
                Outcome::Put,
                Outcome::Put,
                Outcome::Found,
                Outcome::Put,
            ]
        );
        table.find_or_put_sorted(&keys, &mut results).unwrap();
        assert_all(&results, Outcome::Found);
    }

    /// Clearing zeroes both levels.
    #[test]
    fn clear_resets_both_levels() {
        let mut table = iceberg_w21();
        let keys: Vec<u64> = (0..1100).collect();
        let mut results = outcomes(keys.len());
        table.put(&keys, &mut results).unwrap();
        assert!(table.secondary_occupied() > 0);

        table.clear();
        assert_eq!(table.primary_occupied(), 0);
        assert_eq!(table.secondary_occupied(), 0);
        for k in (0..1100).step_by(97) {
            assert_eq!(table.count(k), 0);
        }
    }
}

mod hard_errors {
    use super::helpers::*;
    use super::*;

    #[test]
    fn construction_rejects_bad_geometry() {
        assert!(matches!(
            TestCuckoo::with_seed(0, 0, SEED),
            Err(TableError::KeyWidth(0))
        ));
        assert!(matches!(
            TestCuckoo::with_seed(21, 21, SEED),
            Err(TableError::AddrWidth { addr: 21, key: 21 })
        ));
        // A u32 row cannot hold 2 state bits plus a 31-bit remainder.
        assert!(matches!(
            TestCuckoo::with_seed(36, 5, SEED),
            Err(TableError::RowWidth { .. })
        ));
        assert!(matches!(
            CuckooTable::<u32, FeistelPermutation, 12, 3>::with_seed(21, 5, SEED),
            Err(TableError::BucketSize(12))
        ));
        assert!(matches!(
            IcebergTable::<u32, u32, FeistelPermutation, 32, 16, 1, 3>::with_seed(21, 5, 21, SEED),
            Err(TableError::AddrWidth { addr: 21, key: 21 })
        ));
    }

    #[test]
    fn bulk_calls_check_their_buffers() {
        let table = cuckoo_w21();
        let keys = [1u64, 2, 3];
        let mut short = outcomes(2);
        assert_eq!(
            table.put(&keys, &mut short),
            Err(TableError::LengthMismatch {
                keys: 3,
                results: 2
            })
        );

        let mut results = outcomes(3);
        let mut scratch = vec![0u64; 5];
        assert_eq!(
            table.find_or_put(&keys, &mut scratch, &mut results),
            Err(TableError::ScratchTooSmall { got: 5, need: 6 })
        );
    }

    /// The unsorted cuckoo path refuses ranges longer than the key width
    /// can index.
    #[test]
    fn range_length_must_be_representable() {
        let table = CuckooTable::<u32, FeistelPermutation, 32, 3>::with_seed(8, 2, SEED).unwrap();
        let keys = vec![1u64; 300];
        let mut scratch = vec![0u64; 600];
        let mut results = outcomes(300);
        assert_eq!(
            table.find_or_put(&keys, &mut scratch, &mut results),
            Err(TableError::RangeTooLong { len: 300, width: 8 })
        );
    }
}
