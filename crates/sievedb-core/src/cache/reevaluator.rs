//! Periodic promotion and eviction of cache records.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::anteroom::Anteroom;
use super::ghost::GhostList;
use super::result_cache::ResultCache;
use super::{score, CacheKey, CacheRecordState};
use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Cycles slower than this are reported at warn level.
const SLOW_CYCLE_MICROS: u64 = 100_000;

/// Summary of one reevaluation cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReevaluationReport {
    /// Cycle number, starting at 1.
    pub cycle: u64,
    /// Adepts scored for promotion.
    pub adepts_evaluated: usize,
    /// Adepts promoted into the cache.
    pub promoted: usize,
    /// Cached records that kept paying off.
    pub surviving: usize,
    /// Cached records in cooldown after this cycle.
    pub cooled_down: usize,
    /// Cached records evicted.
    pub evicted: usize,
    /// Idle adepts discarded.
    pub wasted: usize,
    /// Adepts waiting after the cycle.
    pub adepts_waiting: usize,
    /// Records cached after the cycle.
    pub cached_records: usize,
    /// Bytes reserved by cached records after the cycle.
    pub occupied_bytes: u64,
    /// Cache hits since the previous cycle.
    pub hits: u64,
    /// Cache misses since the previous cycle.
    pub misses: u64,
    /// Promoted records filled with their payload since the previous cycle.
    pub enrichments: u64,
    /// Wall time of the cycle in microseconds.
    pub duration_us: u64,
}

/// Runs reevaluation cycles one at a time.
#[derive(Debug)]
pub(crate) struct Reevaluator {
    cycle: Mutex<u64>,
    last_report: ArcSwap<ReevaluationReport>,
    departed: GhostList,
    #[cfg(test)]
    pub(crate) fail_after_first_promotion: std::sync::atomic::AtomicBool,
}

impl Reevaluator {
    pub(crate) fn new(departed_capacity: usize) -> Self {
        Self {
            cycle: Mutex::new(0),
            last_report: ArcSwap::from_pointee(ReevaluationReport::default()),
            departed: GhostList::new(departed_capacity),
            #[cfg(test)]
            fail_after_first_promotion: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub(crate) fn last_report(&self) -> Arc<ReevaluationReport> {
        self.last_report.load_full()
    }

    pub(crate) fn departed_state(&self, key: &CacheKey) -> Option<CacheRecordState> {
        self.departed.get(key)
    }

    pub(crate) fn remember_departed(&self, key: CacheKey, state: CacheRecordState) {
        self.departed.remember(key, state);
    }

    pub(crate) fn clear(&self) {
        self.departed.clear();
    }

    /// Runs one cycle. Cycles never overlap; a second caller waits.
    ///
    /// Changes are committed record by record, so a cycle that fails halfway
    /// leaves a consistent cache and the remainder is picked up next cycle.
    pub(crate) fn run(
        &self,
        config: &CacheConfig,
        cache: &ResultCache,
        anteroom: &Anteroom,
    ) -> Result<ReevaluationReport> {
        let mut cycle = self.cycle.lock();
        *cycle += 1;
        let cycle_number = *cycle;
        let started = Instant::now();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.run_cycle(cycle_number, config, cache, anteroom)
        }));

        match outcome {
            Ok(mut report) => {
                report.duration_us =
                    u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
                if report.duration_us > SLOW_CYCLE_MICROS {
                    warn!(
                        cycle = cycle_number,
                        duration_us = report.duration_us,
                        "Slow cache reevaluation cycle"
                    );
                }
                debug!(
                    cycle = report.cycle,
                    adepts_evaluated = report.adepts_evaluated,
                    promoted = report.promoted,
                    surviving = report.surviving,
                    cooled_down = report.cooled_down,
                    evicted = report.evicted,
                    wasted = report.wasted,
                    adepts_waiting = report.adepts_waiting,
                    cached_records = report.cached_records,
                    occupied_bytes = report.occupied_bytes,
                    hits = report.hits,
                    misses = report.misses,
                    enrichments = report.enrichments,
                    duration_us = report.duration_us,
                    "Cache reevaluation cycle finished"
                );
                self.last_report.store(Arc::new(report.clone()));
                Ok(report)
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(cycle = cycle_number, reason = %reason, "Cache reevaluation cycle failed");
                Err(Error::Reevaluation(reason))
            }
        }
    }

    fn run_cycle(
        &self,
        cycle: u64,
        config: &CacheConfig,
        cache: &ResultCache,
        anteroom: &Anteroom,
    ) -> ReevaluationReport {
        let mut report = ReevaluationReport {
            cycle,
            ..ReevaluationReport::default()
        };

        // Records cached before this cycle: survive, cool down or go.
        for (key, record) in cache.records_snapshot() {
            let hits = record.hits.swap(0, Ordering::Relaxed);
            let record_score = score(hits, record.cost, record.size_in_bytes);
            if hits > 0 && record_score >= config.cooldown_score_threshold {
                record.cooling_cycles.store(0, Ordering::Relaxed);
                report.surviving += 1;
                continue;
            }
            let cooled = record.cooling_cycles.fetch_add(1, Ordering::Relaxed) + 1;
            if cooled > config.cooldown_cycles {
                if cache.remove(&key).is_some() {
                    self.departed.remember(key, CacheRecordState::Evicted);
                    report.evicted += 1;
                }
            } else {
                report.cooled_down += 1;
            }
        }

        // Adepts: drop the idle ones, promote the best within the budget.
        anteroom.remove_where(|key| cache.contains(key));
        let idle = anteroom.discard_idle(config.adept_ttl(), Instant::now());
        report.wasted = idle.len();
        for key in idle {
            self.departed.remember(key, CacheRecordState::Wasted);
        }

        let adepts = anteroom.snapshot();
        report.adepts_evaluated = adepts.len();
        let mut candidates: Vec<_> = adepts
            .into_iter()
            .filter(|adept| {
                adept.usages() >= config.minimal_usage_threshold
                    && adept.score() >= config.promotion_score_threshold
            })
            .collect();
        candidates.sort_by(|a, b| b.score().total_cmp(&a.score()));

        for adept in candidates {
            let occupied = cache.occupied_bytes();
            if occupied.saturating_add(adept.size_in_bytes) > config.cache_size_in_bytes {
                break;
            }
            if anteroom.remove(&adept.key).is_none() {
                continue;
            }
            if cache.insert_promoted(adept.key, adept.cost, adept.size_in_bytes) {
                self.departed.forget(&adept.key);
                report.promoted += 1;
            }
            #[cfg(test)]
            if self.fail_after_first_promotion.load(Ordering::Relaxed) {
                panic!("injected failure after promotion");
            }
        }

        report.adepts_waiting = anteroom.len();
        report.cached_records = cache.len();
        report.occupied_bytes = cache.occupied_bytes();
        let counters = cache.take_counters();
        report.hits = counters.hits;
        report.misses = counters.misses;
        report.enrichments = counters.enrichments;
        report
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "reevaluation cycle panicked".to_string()
    }
}
