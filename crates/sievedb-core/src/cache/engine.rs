//! Cache engine tying the anteroom, the result cache and reevaluation together.

#![allow(clippy::cast_precision_loss)] // Precision loss acceptable for hit rate calculation

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::anteroom::{AdeptAdmission, Anteroom};
use super::events::{CacheEvent, EventPublisher};
use super::reevaluator::{ReevaluationReport, Reevaluator};
use super::result_cache::{CacheOutcome, LookupCounters, ResultCache};
use super::scheduler::ReevaluationTask;
use super::{CacheKey, CacheRecordState};
use crate::bitmap::Bitmap;
use crate::config::CacheConfig;
use crate::error::Result;

/// Upper bound on remembered departed keys.
const MAX_DEPARTED_KEYS: usize = 65_536;

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStatistics {
    /// Lookups served from the cache, including joined computations.
    pub hits: u64,
    /// Computations whose result was not cached.
    pub misses: u64,
    /// Promoted records filled with their payload.
    pub enrichments: u64,
    /// Adepts waiting in the anteroom.
    pub adepts_waiting: usize,
    /// Adepts discarded before promotion.
    pub wasted_total: u64,
    /// Promoted records.
    pub cached_records: usize,
    /// Bytes reserved by promoted records.
    pub occupied_bytes: u64,
    /// Configured cache budget in bytes.
    pub budget_bytes: u64,
    /// Finished reevaluation cycles.
    pub cycles: u64,
    /// Events lost to full subscriber queues.
    pub events_dropped: u64,
}

impl CacheStatistics {
    /// Calculate hit rate (0.0 to 1.0).
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// State shared between the engine handle and the reevaluation thread.
#[derive(Debug)]
pub(crate) struct EngineShared {
    config: CacheConfig,
    results: ResultCache,
    anteroom: Anteroom,
    reevaluator: Reevaluator,
    events: EventPublisher,
    /// Counters of finished cycles; the live ones sit in `results`.
    totals: Mutex<LookupCounters>,
    wake: Sender<()>,
}

impl EngineShared {
    pub(crate) fn reevaluate(&self) -> Result<ReevaluationReport> {
        let report = self
            .reevaluator
            .run(&self.config, &self.results, &self.anteroom)?;
        {
            let mut totals = self.totals.lock();
            totals.hits += report.hits;
            totals.misses += report.misses;
            totals.enrichments += report.enrichments;
        }
        self.events.publish(&CacheEvent::AnteroomStatistics {
            adepts_waiting: self.anteroom.len(),
            wasted_total: self.anteroom.wasted(),
        });
        self.events
            .publish(&CacheEvent::ReevaluationCompleted(report.clone()));
        Ok(report)
    }
}

/// Usage-driven result cache shared by formula evaluations.
///
/// Results enter the cache only through reevaluation cycles. Use
/// [`CacheEngine::start`] to run cycles on a background thread, or
/// [`CacheEngine::new`] and drive [`CacheEngine::reevaluate`] manually.
///
/// # Example
///
/// ```rust
/// use sievedb_core::{CacheConfig, CacheEngine, CacheScope, EvaluationContext, FormulaTree};
///
/// let engine = CacheEngine::new(CacheConfig::default()).unwrap();
/// let mut tree = FormulaTree::new();
/// let a = tree.constant([1, 2, 3].into_iter().collect());
/// let b = tree.constant([2, 3, 4].into_iter().collect());
/// let and = tree.and(vec![a, b]).unwrap();
///
/// let ctx = EvaluationContext::cached(&engine, CacheScope::GLOBAL);
/// let keys = tree.compute(and, &ctx).unwrap();
/// assert_eq!(keys.iter().collect::<Vec<_>>(), vec![2, 3]);
/// ```
#[derive(Debug)]
pub struct CacheEngine {
    shared: Arc<EngineShared>,
    task: Option<ReevaluationTask>,
}

impl CacheEngine {
    /// Creates an engine without a background thread.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if `config` is invalid.
    pub fn new(config: CacheConfig) -> Result<Self> {
        let (shared, _wake) = Self::build(config)?;
        Ok(Self { shared, task: None })
    }

    /// Creates an engine running reevaluation cycles on a background thread.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if `config` is invalid, or
    /// [`crate::Error::Internal`] if the thread cannot be spawned.
    pub fn start(config: CacheConfig) -> Result<Self> {
        let (shared, wake) = Self::build(config)?;
        let task = ReevaluationTask::spawn(
            Arc::downgrade(&shared),
            shared.config.reevaluation_interval(),
            wake,
        )?;
        Ok(Self {
            shared,
            task: Some(task),
        })
    }

    fn build(config: CacheConfig) -> Result<(Arc<EngineShared>, Receiver<()>)> {
        config.validate()?;
        let (wake, wake_rx) = crossbeam_channel::bounded(1);
        let departed = config.anteroom_record_count.min(MAX_DEPARTED_KEYS);
        debug!(
            enabled = config.enabled,
            anteroom_record_count = config.anteroom_record_count,
            cache_size_in_bytes = config.cache_size_in_bytes,
            "Cache engine created"
        );
        let shared = Arc::new(EngineShared {
            anteroom: Anteroom::new(config.anteroom_record_count, config.max_record_size_in_bytes),
            results: ResultCache::new(),
            reevaluator: Reevaluator::new(departed),
            events: EventPublisher::default(),
            totals: Mutex::new(LookupCounters::default()),
            wake,
            config,
        });
        Ok((shared, wake_rx))
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Returns true if caching is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.shared.config.enabled
    }

    /// Returns true if a formula of estimated `cost` may use the cache.
    pub(crate) fn admits(&self, cost: u64) -> bool {
        self.is_enabled() && cost >= self.shared.config.minimal_complexity_threshold
    }

    /// Returns the cached result of `key`, or computes it.
    ///
    /// Concurrent callers asking for the same key share one computation. A
    /// computed result that is not cached yet is recorded in the anteroom as
    /// evidence for a later promotion.
    ///
    /// # Errors
    ///
    /// Returns the error of `compute`, or [`crate::Error::CacheComputation`]
    /// when a shared computation this call waited for failed.
    pub fn get_or_compute<F>(&self, key: CacheKey, cost: u64, compute: F) -> Result<Bitmap>
    where
        F: FnOnce() -> Result<Bitmap>,
    {
        if !self.is_enabled() {
            return compute();
        }

        let (bitmap, outcome) = self.shared.results.get_or_compute(key, compute)?;
        trace!(hash = key.formula_hash, ?outcome, "Cache lookup");
        // A key promoted meanwhile is already tracked by the result cache.
        if matches!(outcome, CacheOutcome::Computed | CacheOutcome::Joined)
            && !self.shared.results.contains(&key)
        {
            let admission =
                self.shared
                    .anteroom
                    .record_access(key, cost, bitmap.estimated_memory_size());
            if let AdeptAdmission::CreatedWithEviction(victim) = admission {
                self.shared
                    .reevaluator
                    .remember_departed(victim, CacheRecordState::Wasted);
                warn!(
                    wasted_total = self.shared.anteroom.wasted(),
                    "Cache anteroom full, least promising adept discarded"
                );
            }
            if matches!(admission, AdeptAdmission::CreatedWithEviction(_))
                || self.shared.anteroom.is_full()
            {
                // Full channel means a cycle is already requested.
                let _ = self.shared.wake.try_send(());
            }
        }
        Ok(bitmap)
    }

    /// Runs one reevaluation cycle now and publishes its events.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Reevaluation`] if the cycle aborted. Changes
    /// committed before the failure are kept.
    pub fn reevaluate(&self) -> Result<ReevaluationReport> {
        self.shared.reevaluate()
    }

    /// Subscribes to cache events through a queue of `capacity` events.
    ///
    /// Events are dropped rather than queued beyond `capacity`.
    #[must_use]
    pub fn subscribe(&self, capacity: usize) -> Receiver<CacheEvent> {
        self.shared.events.subscribe(capacity)
    }

    /// Number of live event subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.events.subscriber_count()
    }

    /// Current statistics.
    #[must_use]
    pub fn statistics(&self) -> CacheStatistics {
        let live = self.shared.results.counters();
        let totals = *self.shared.totals.lock();
        CacheStatistics {
            hits: totals.hits + live.hits,
            misses: totals.misses + live.misses,
            enrichments: totals.enrichments + live.enrichments,
            adepts_waiting: self.shared.anteroom.len(),
            wasted_total: self.shared.anteroom.wasted(),
            cached_records: self.shared.results.len(),
            occupied_bytes: self.shared.results.occupied_bytes(),
            budget_bytes: self.shared.config.cache_size_in_bytes,
            cycles: self.shared.reevaluator.last_report().cycle,
            events_dropped: self.shared.events.dropped(),
        }
    }

    /// Lifecycle state of `key`, or `None` if the engine never saw it or
    /// forgot its departure.
    #[must_use]
    pub fn record_state(&self, key: &CacheKey) -> Option<CacheRecordState> {
        if let Some(state) = self.shared.results.state_of(key) {
            return Some(state);
        }
        if self.shared.anteroom.contains(key) {
            return Some(CacheRecordState::Adept);
        }
        self.shared.reevaluator.departed_state(key)
    }

    /// The anteroom of this engine.
    #[must_use]
    pub fn anteroom(&self) -> &Anteroom {
        &self.shared.anteroom
    }

    /// The result cache of this engine.
    #[must_use]
    pub fn results(&self) -> &ResultCache {
        &self.shared.results
    }

    /// Report of the last finished cycle.
    #[must_use]
    pub fn last_report(&self) -> Arc<ReevaluationReport> {
        self.shared.reevaluator.last_report()
    }

    /// Returns true if a background thread runs reevaluation cycles.
    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.task.is_some()
    }

    /// Drops every record, adept and remembered departure.
    pub fn clear(&self) {
        self.shared.results.clear();
        self.shared.anteroom.clear();
        self.shared.reevaluator.clear();
    }

    #[cfg(test)]
    pub(crate) fn inject_reevaluation_failure(&self, enabled: bool) {
        self.shared
            .reevaluator
            .fail_after_first_promotion
            .store(enabled, std::sync::atomic::Ordering::Relaxed);
    }
}

impl Drop for CacheEngine {
    fn drop(&mut self) {
        if let Some(mut task) = self.task.take() {
            task.stop();
        }
    }
}
