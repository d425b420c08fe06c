//! Concurrency tests for single-flight computation.
//!
//! Every test runs its threads under a deadline so that a lost wakeup fails
//! the test instead of hanging the suite.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use super::*;
use crate::bitmap::Bitmap;
use crate::config::CacheConfig;
use crate::error::{Error, Result};

const THREADS: usize = 8;
const DEADLINE: Duration = Duration::from_secs(10);
const SLOW_COMPUTATION: Duration = Duration::from_millis(100);

fn key(hash: u64) -> CacheKey {
    CacheKey::new(hash, CacheScope::GLOBAL)
}

/// Runs `work` on `THREADS` threads released together and collects the
/// results, failing if any thread does not finish before the deadline.
fn run_together<T, F>(work: F) -> Vec<thread::Result<T>>
where
    T: Send + 'static,
    F: Fn(usize) -> T + Send + Sync + 'static,
{
    let work = Arc::new(work);
    let barrier = Arc::new(Barrier::new(THREADS));
    let (done_tx, done_rx) = crossbeam_channel::unbounded();

    let handles: Vec<_> = (0..THREADS)
        .map(|index| {
            let work = Arc::clone(&work);
            let barrier = Arc::clone(&barrier);
            let done_tx = done_tx.clone();
            thread::spawn(move || {
                barrier.wait();
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| work(index)));
                let _ = done_tx.send(());
                match result {
                    Ok(value) => value,
                    Err(payload) => std::panic::resume_unwind(payload),
                }
            })
        })
        .collect();

    for _ in 0..THREADS {
        done_rx
            .recv_timeout(DEADLINE)
            .expect("threads deadlocked on a shared computation");
    }
    handles.into_iter().map(thread::JoinHandle::join).collect()
}

#[test]
fn test_concurrent_misses_compute_once() {
    // Arrange
    let cache = Arc::new(ResultCache::new());
    let computations = Arc::new(AtomicUsize::new(0));

    // Act
    let results = {
        let cache = Arc::clone(&cache);
        let computations = Arc::clone(&computations);
        run_together(move |_| {
            cache.get_or_compute(key(1), || {
                computations.fetch_add(1, Ordering::SeqCst);
                thread::sleep(SLOW_COMPUTATION);
                Ok(Bitmap::from_unsorted(&[4, 5, 6]))
            })
        })
    };

    // Assert
    assert_eq!(computations.load(Ordering::SeqCst), 1);
    let outcomes: Vec<(Bitmap, CacheOutcome)> = results
        .into_iter()
        .map(|result| result.unwrap().unwrap())
        .collect();
    assert!(outcomes
        .iter()
        .all(|(bitmap, _)| *bitmap == Bitmap::from_unsorted(&[4, 5, 6])));
    let computed = outcomes
        .iter()
        .filter(|(_, outcome)| *outcome == CacheOutcome::Computed)
        .count();
    let joined = outcomes
        .iter()
        .filter(|(_, outcome)| *outcome == CacheOutcome::Joined)
        .count();
    assert_eq!(computed, 1);
    assert_eq!(joined, THREADS - 1);
    assert_eq!(cache.inflight_count(), 0);
}

#[test]
fn test_waiters_receive_cache_computation_error_when_leader_fails() {
    // Arrange
    let cache = Arc::new(ResultCache::new());

    // Act
    let results: Vec<Result<(Bitmap, CacheOutcome)>> = {
        let cache = Arc::clone(&cache);
        run_together(move |_| {
            cache.get_or_compute(key(2), || {
                thread::sleep(SLOW_COMPUTATION);
                Err(Error::Planning("index unavailable".to_string()))
            })
        })
    }
    .into_iter()
    .map(|result| result.unwrap())
    .collect();

    // Assert
    let leaders = results
        .iter()
        .filter(|r| matches!(r, Err(Error::Planning(_))))
        .count();
    let waiters = results
        .iter()
        .filter(|r| {
            matches!(
                r,
                Err(Error::CacheComputation { hash: 2, reason }) if reason.contains("index unavailable")
            )
        })
        .count();
    assert_eq!(leaders, 1);
    assert_eq!(waiters, THREADS - 1);
    assert_eq!(cache.inflight_count(), 0);
}

#[test]
fn test_waiters_are_released_when_leader_panics() {
    // Arrange
    let cache = Arc::new(ResultCache::new());

    // Act
    let results = {
        let cache = Arc::clone(&cache);
        run_together(move |_| {
            cache.get_or_compute(key(3), || -> Result<Bitmap> {
                thread::sleep(SLOW_COMPUTATION);
                panic!("computation exploded");
            })
        })
    };

    // Assert
    let panicked = results.iter().filter(|r| r.is_err()).count();
    let released = results
        .iter()
        .filter(|r| matches!(r, Ok(Err(Error::CacheComputation { hash: 3, .. }))))
        .count();
    assert_eq!(panicked, 1);
    assert_eq!(released, THREADS - 1);
    assert_eq!(cache.inflight_count(), 0);

    // The key is computable again afterwards.
    let retry = cache.get_or_compute(key(3), || Ok(Bitmap::from_unsorted(&[1])));
    assert_eq!(retry.unwrap().1, CacheOutcome::Computed);
}

#[test]
fn test_promoted_record_is_filled_once_under_contention() {
    // Arrange
    let cache = Arc::new(ResultCache::new());
    assert!(cache.insert_promoted(key(4), 100, 64));
    let computations = Arc::new(AtomicUsize::new(0));

    // Act
    let results = {
        let cache = Arc::clone(&cache);
        let computations = Arc::clone(&computations);
        run_together(move |_| {
            cache.get_or_compute(key(4), || {
                computations.fetch_add(1, Ordering::SeqCst);
                thread::sleep(SLOW_COMPUTATION);
                Ok(Bitmap::from_unsorted(&[9]))
            })
        })
    };

    // Assert
    assert_eq!(computations.load(Ordering::SeqCst), 1);
    let outcomes: Vec<CacheOutcome> = results
        .into_iter()
        .map(|r| r.unwrap().unwrap().1)
        .collect();
    let enriched = outcomes
        .iter()
        .filter(|outcome| **outcome == CacheOutcome::Enriched)
        .count();
    let hits = outcomes
        .iter()
        .filter(|outcome| **outcome == CacheOutcome::Hit)
        .count();
    assert_eq!(enriched, 1);
    assert_eq!(hits, THREADS - 1);
    assert_eq!(cache.peek(&key(4)), Some(Bitmap::from_unsorted(&[9])));
}

#[test]
fn test_waiters_on_promoted_record_do_not_return_to_anteroom() {
    // Arrange
    let engine = Arc::new(
        CacheEngine::new(CacheConfig {
            minimal_complexity_threshold: 1,
            promotion_score_threshold: 0.0,
            cooldown_score_threshold: 0.0,
            ..CacheConfig::default()
        })
        .unwrap(),
    );
    for _ in 0..2 {
        engine
            .get_or_compute(key(77), 500, || Ok(Bitmap::from_unsorted(&[7])))
            .unwrap();
    }
    assert_eq!(engine.reevaluate().unwrap().promoted, 1);

    // Act
    let results = {
        let engine = Arc::clone(&engine);
        run_together(move |_| {
            engine.get_or_compute(key(77), 500, || {
                thread::sleep(SLOW_COMPUTATION);
                Ok(Bitmap::from_unsorted(&[7]))
            })
        })
    };

    // Assert
    assert!(results.into_iter().all(|r| r.unwrap().is_ok()));
    assert!(engine.results().contains(&key(77)));
    assert!(!engine.anteroom().contains(&key(77)));
    assert_eq!(engine.record_state(&key(77)), Some(CacheRecordState::Promoted));
    let report = engine.reevaluate().unwrap();
    assert_eq!(report.surviving, 1);
    assert_eq!(engine.results().peek(&key(77)), Some(Bitmap::from_unsorted(&[7])));
}

#[test]
fn test_engine_records_joined_computations_as_usages() {
    // Arrange
    let engine = Arc::new(
        CacheEngine::new(CacheConfig {
            minimal_complexity_threshold: 1,
            ..CacheConfig::default()
        })
        .unwrap(),
    );

    // Act
    let results = {
        let engine = Arc::clone(&engine);
        run_together(move |_| {
            engine.get_or_compute(key(5), 500, || {
                thread::sleep(SLOW_COMPUTATION);
                Ok(Bitmap::from_unsorted(&[1, 2]))
            })
        })
    };

    // Assert
    assert!(results.into_iter().all(|r| r.unwrap().is_ok()));
    let adept = engine.anteroom().get(&key(5)).unwrap();
    assert_eq!(adept.usages(), THREADS as u64);
}

#[test]
fn test_reevaluation_runs_alongside_lookups() {
    // Arrange
    let engine = Arc::new(
        CacheEngine::new(CacheConfig {
            minimal_complexity_threshold: 1,
            promotion_score_threshold: 0.0,
            cooldown_score_threshold: 0.0,
            ..CacheConfig::default()
        })
        .unwrap(),
    );

    // Act
    let results = {
        let engine = Arc::clone(&engine);
        run_together(move |index| -> Result<()> {
            for round in 0..50_u64 {
                if index == 0 {
                    engine.reevaluate()?;
                } else {
                    let hash = round % 5;
                    let bitmap = engine.get_or_compute(key(hash), 1_000, || {
                        Ok(Bitmap::from_range(0..(hash as u32 + 1) * 10))
                    })?;
                    assert_eq!(bitmap.len(), (hash + 1) * 10);
                }
            }
            Ok(())
        })
    };

    // Assert
    for result in results {
        result.unwrap().unwrap();
    }
    let stats = engine.statistics();
    assert!(stats.occupied_bytes <= stats.budget_bytes);
}
