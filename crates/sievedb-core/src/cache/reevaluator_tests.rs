//! Tests for reevaluation cycles.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use proptest::prelude::*;

use super::reevaluator::Reevaluator;
use super::*;
use crate::bitmap::Bitmap;
use crate::config::CacheConfig;
use crate::error::Error;

fn key(hash: u64) -> CacheKey {
    CacheKey::new(hash, CacheScope::GLOBAL)
}

fn config(budget: u64) -> CacheConfig {
    CacheConfig {
        cache_size_in_bytes: budget,
        max_record_size_in_bytes: budget,
        minimal_usage_threshold: 2,
        promotion_score_threshold: 0.0,
        cooldown_score_threshold: 0.0,
        ..CacheConfig::default()
    }
}

/// Records `usages` computations of `key`.
fn record(anteroom: &Anteroom, key: CacheKey, usages: u64, cost: u64, size: u64) {
    for _ in 0..usages {
        anteroom.record_access(key, cost, size);
    }
}

#[test]
fn test_candidates_are_promoted_by_score_within_budget() {
    // Arrange
    let reevaluator = Reevaluator::new(16);
    let cache = ResultCache::new();
    let anteroom = Anteroom::new(16, 1_000);
    record(&anteroom, key(1), 4, 6_000, 600); // score 30
    record(&anteroom, key(2), 2, 600, 600); // score 1
    record(&anteroom, key(3), 2, 30, 300); // score 0.1

    // Act
    let report = reevaluator.run(&config(1_000), &cache, &anteroom).unwrap();

    // Assert
    assert_eq!(report.adepts_evaluated, 3);
    assert_eq!(report.promoted, 1);
    assert!(cache.contains(&key(1)));
    assert!(anteroom.contains(&key(2)));
    assert!(anteroom.contains(&key(3)));
    assert_eq!(cache.occupied_bytes(), 600);
    assert_eq!(report.occupied_bytes, 600);
}

#[test]
fn test_adepts_below_thresholds_stay_waiting() {
    // Arrange
    let reevaluator = Reevaluator::new(16);
    let cache = ResultCache::new();
    let anteroom = Anteroom::new(16, 1_000);
    record(&anteroom, key(1), 1, 10_000, 10);
    record(&anteroom, key(2), 3, 1, 1_000);
    let config = CacheConfig {
        promotion_score_threshold: 1.0,
        ..config(10_000)
    };

    // Act
    let report = reevaluator.run(&config, &cache, &anteroom).unwrap();

    // Assert
    assert_eq!(report.promoted, 0);
    assert_eq!(report.adepts_waiting, 2);
    assert!(cache.is_empty());
}

#[test]
fn test_record_is_evicted_after_cooldown_cycles() {
    // Arrange
    let reevaluator = Reevaluator::new(16);
    let cache = ResultCache::new();
    let anteroom = Anteroom::new(16, 1_000);
    let config = CacheConfig {
        cooldown_cycles: 2,
        ..config(1_000)
    };
    record(&anteroom, key(1), 2, 100, 100);
    reevaluator.run(&config, &cache, &anteroom).unwrap();

    // Act
    let reports: Vec<_> = (0..3)
        .map(|_| reevaluator.run(&config, &cache, &anteroom).unwrap())
        .collect();

    // Assert
    assert_eq!(reports[0].cooled_down, 1);
    assert_eq!(reports[1].cooled_down, 1);
    assert_eq!(reports[2].evicted, 1);
    assert!(cache.is_empty());
    assert_eq!(cache.occupied_bytes(), 0);
    assert_eq!(
        reevaluator.departed_state(&key(1)),
        Some(CacheRecordState::Evicted)
    );
}

#[test]
fn test_hit_record_survives_and_leaves_cooldown() {
    // Arrange
    let reevaluator = Reevaluator::new(16);
    let cache = ResultCache::new();
    let anteroom = Anteroom::new(16, 1_000);
    let config = config(1_000);
    record(&anteroom, key(1), 2, 100, 100);
    reevaluator.run(&config, &cache, &anteroom).unwrap();
    reevaluator.run(&config, &cache, &anteroom).unwrap();
    assert_eq!(cache.state_of(&key(1)), Some(CacheRecordState::Cooldown));

    // Act
    let fill = cache.get_or_compute(key(1), || Ok(Bitmap::from_unsorted(&[1])));
    let hit = cache.get_or_compute(key(1), || Ok(Bitmap::empty()));
    let report = reevaluator.run(&config, &cache, &anteroom).unwrap();

    // Assert
    assert_eq!(fill.unwrap().1, CacheOutcome::Enriched);
    assert_eq!(hit.unwrap(), (Bitmap::from_unsorted(&[1]), CacheOutcome::Hit));
    assert_eq!(report.surviving, 1);
    assert_eq!(report.hits, 1);
    assert_eq!(report.enrichments, 1);
    assert_eq!(cache.state_of(&key(1)), Some(CacheRecordState::Promoted));
}

#[test]
fn test_idle_adepts_are_wasted() {
    // Arrange
    let reevaluator = Reevaluator::new(16);
    let cache = ResultCache::new();
    let anteroom = Anteroom::new(16, 1_000);
    record(&anteroom, key(1), 2, 100, 100);
    let config = CacheConfig {
        adept_ttl_ms: 1,
        ..config(1_000)
    };
    thread::sleep(Duration::from_millis(20));

    // Act
    let report = reevaluator.run(&config, &cache, &anteroom).unwrap();

    // Assert
    assert_eq!(report.wasted, 1);
    assert_eq!(report.promoted, 0);
    assert!(anteroom.is_empty());
    assert_eq!(
        reevaluator.departed_state(&key(1)),
        Some(CacheRecordState::Wasted)
    );
}

#[test]
fn test_noop_cycles_still_report() {
    let reevaluator = Reevaluator::new(16);
    let cache = ResultCache::new();
    let anteroom = Anteroom::new(16, 1_000);

    let first = reevaluator.run(&config(1_000), &cache, &anteroom).unwrap();
    let second = reevaluator.run(&config(1_000), &cache, &anteroom).unwrap();

    assert_eq!(first.cycle, 1);
    assert_eq!(second.cycle, 2);
    assert_eq!(
        ReevaluationReport {
            duration_us: 0,
            ..second.clone()
        },
        ReevaluationReport {
            cycle: 2,
            ..ReevaluationReport::default()
        }
    );
    assert_eq!(*reevaluator.last_report(), second);
}

#[test]
fn test_failed_cycle_keeps_committed_promotions() {
    // Arrange
    let reevaluator = Reevaluator::new(16);
    let cache = ResultCache::new();
    let anteroom = Anteroom::new(16, 10_000);
    record(&anteroom, key(1), 3, 1_000, 100);
    record(&anteroom, key(2), 2, 1_000, 100);
    reevaluator
        .fail_after_first_promotion
        .store(true, Ordering::Relaxed);

    // Act
    let failed = reevaluator.run(&config(10_000), &cache, &anteroom);

    // Assert
    assert!(matches!(failed, Err(Error::Reevaluation(_))));
    assert!(cache.contains(&key(1)));
    assert!(anteroom.contains(&key(2)));
    assert_eq!(cache.occupied_bytes(), 100);

    // The next cycle picks up the remainder.
    reevaluator
        .fail_after_first_promotion
        .store(false, Ordering::Relaxed);
    let recovered = reevaluator.run(&config(10_000), &cache, &anteroom).unwrap();
    assert_eq!(recovered.promoted, 1);
    assert_eq!(recovered.cycle, 2);
    assert!(cache.contains(&key(2)));
    assert!(anteroom.is_empty());
}

#[test]
fn test_key_is_never_both_waiting_and_cached() {
    // Arrange
    let reevaluator = Reevaluator::new(64);
    let cache = ResultCache::new();
    let anteroom = Anteroom::new(8, 1_000);
    let config = config(1_000);

    // Act / Assert
    for round in 0..6_u64 {
        for hash in 0..12_u64 {
            if (hash + round) % 3 != 0 {
                record(&anteroom, key(hash), 2, 50 * (hash + 1), 100);
            }
        }
        reevaluator.run(&config, &cache, &anteroom).unwrap();
        for hash in 0..12_u64 {
            let k = key(hash);
            assert!(
                !(anteroom.contains(&k) && cache.contains(&k)),
                "key {hash} is both waiting and cached"
            );
        }
        assert!(cache.occupied_bytes() <= config.cache_size_in_bytes);
    }
}

#[test]
fn test_cycle_drops_adepts_of_already_cached_keys() {
    // Arrange
    let reevaluator = Reevaluator::new(16);
    let cache = ResultCache::new();
    let anteroom = Anteroom::new(8, 1_000);
    assert!(cache.insert_promoted(key(1), 100, 10));
    record(&anteroom, key(1), 1, 100, 10);

    // Act
    let report = reevaluator.run(&config(1_000), &cache, &anteroom).unwrap();

    // Assert
    assert!(cache.contains(&key(1)));
    assert!(!anteroom.contains(&key(1)));
    assert_eq!(report.wasted, 0);
    assert_eq!(anteroom.wasted(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_promotions_never_exceed_budget(
        adepts in prop::collection::vec((1u64..6, 1u64..10_000, 1u64..400), 1..24),
        budget in 1u64..2_000,
    ) {
        let reevaluator = Reevaluator::new(64);
        let cache = ResultCache::new();
        let anteroom = Anteroom::new(64, budget);
        let config = config(budget);

        for (hash, (usages, cost, size)) in adepts.iter().enumerate() {
            record(&anteroom, key(hash as u64), *usages, *cost, *size);
        }
        for _ in 0..3 {
            let report = reevaluator.run(&config, &cache, &anteroom).unwrap();
            prop_assert!(report.occupied_bytes <= budget);
            prop_assert!(cache.occupied_bytes() <= budget);
        }
    }
}
