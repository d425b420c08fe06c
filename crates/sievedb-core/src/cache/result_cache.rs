//! Promoted cache records and single-flight computation.
//!
//! The cache itself never decides what to keep: records are inserted and
//! removed only by the reevaluation cycle. Lookups and computations merely
//! update counters.

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxBuildHasher, FxHashMap};

use super::{CacheKey, CacheRecordState};
use crate::bitmap::Bitmap;
use crate::error::{Error, Result};

/// How [`ResultCache::get_or_compute`] produced its bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from a cached record.
    Hit,
    /// Waited for a peer thread computing a key that is not cached.
    Joined,
    /// Computed and stored into a promoted record still lacking its payload.
    Enriched,
    /// Computed; the key is not cached.
    Computed,
}

/// A promoted record.
///
/// Records are promoted from statistics alone; the payload is filled by the
/// first computation after promotion.
#[derive(Debug)]
pub(crate) struct CachedRecord {
    pub(crate) cost: u64,
    pub(crate) size_in_bytes: u64,
    payload: OnceLock<Bitmap>,
    /// Hits since the last reevaluation cycle.
    pub(crate) hits: AtomicU64,
    /// Consecutive cycles spent in cooldown; zero while promoted.
    pub(crate) cooling_cycles: AtomicU32,
}

impl CachedRecord {
    fn new(cost: u64, size_in_bytes: u64) -> Self {
        Self {
            cost,
            size_in_bytes,
            payload: OnceLock::new(),
            hits: AtomicU64::new(0),
            cooling_cycles: AtomicU32::new(0),
        }
    }

    pub(crate) fn state(&self) -> CacheRecordState {
        if self.cooling_cycles.load(Ordering::Relaxed) == 0 {
            CacheRecordState::Promoted
        } else {
            CacheRecordState::Cooldown
        }
    }
}

/// Result handed from a leader to its waiters: the bitmap and how the
/// leader produced it, or the failure reason.
type SharedOutcome = std::result::Result<(Bitmap, CacheOutcome), String>;

#[derive(Debug)]
struct InflightComputation {
    outcome: Mutex<Option<SharedOutcome>>,
    ready: Condvar,
}

impl InflightComputation {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn wait(&self) -> SharedOutcome {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            self.ready.wait(&mut outcome);
        }
    }
}

enum InflightRole {
    Leader(Arc<InflightComputation>),
    Waiter(Arc<InflightComputation>),
}

/// Hit, miss and enrichment counts since the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LookupCounters {
    pub(crate) hits: u64,
    pub(crate) misses: u64,
    pub(crate) enrichments: u64,
}

/// Concurrent map of promoted records with at-most-one computation per key.
pub struct ResultCache {
    records: DashMap<CacheKey, Arc<CachedRecord>, FxBuildHasher>,
    inflight: Mutex<FxHashMap<CacheKey, Arc<InflightComputation>>>,
    occupied_bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    enrichments: AtomicU64,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::with_hasher(FxBuildHasher),
            inflight: Mutex::new(FxHashMap::default()),
            occupied_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            enrichments: AtomicU64::new(0),
        }
    }

    /// Number of promoted records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing is promoted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Bytes reserved by promoted records.
    #[must_use]
    pub fn occupied_bytes(&self) -> u64 {
        self.occupied_bytes.load(Ordering::Relaxed)
    }

    /// Returns true if `key` is promoted.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.records.contains_key(key)
    }

    /// Cached payload of `key` without touching any statistics.
    #[must_use]
    pub fn peek(&self, key: &CacheKey) -> Option<Bitmap> {
        self.record(key)
            .and_then(|record| record.payload.get().cloned())
    }

    /// Returns the cached bitmap of `key`, or runs `compute` once for all
    /// concurrent callers asking for the same key.
    ///
    /// `compute` runs without any cache lock held. If it fails or panics,
    /// every waiting caller receives [`Error::CacheComputation`] carrying the
    /// failure reason; the computing caller gets the original error or panic.
    ///
    /// # Errors
    ///
    /// Returns the error of `compute`, or [`Error::CacheComputation`] when the
    /// peer computation this call waited for failed.
    pub fn get_or_compute<F>(&self, key: CacheKey, compute: F) -> Result<(Bitmap, CacheOutcome)>
    where
        F: FnOnce() -> Result<Bitmap>,
    {
        if let Some(bitmap) = self.lookup_hit(&key) {
            return Ok((bitmap, CacheOutcome::Hit));
        }

        match self.claim_inflight_slot(key) {
            InflightRole::Waiter(slot) => match slot.wait() {
                Ok((bitmap, CacheOutcome::Computed)) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Ok((bitmap, CacheOutcome::Joined))
                }
                // The leader served or filled a cached record.
                Ok((bitmap, _)) => {
                    if let Some(record) = self.record(&key) {
                        record.hits.fetch_add(1, Ordering::Relaxed);
                    }
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Ok((bitmap, CacheOutcome::Hit))
                }
                Err(reason) => Err(Error::CacheComputation {
                    hash: key.formula_hash,
                    reason,
                }),
            },
            InflightRole::Leader(slot) => self.lead_computation(key, &slot, compute),
        }
    }

    fn lead_computation<F>(
        &self,
        key: CacheKey,
        slot: &Arc<InflightComputation>,
        compute: F,
    ) -> Result<(Bitmap, CacheOutcome)>
    where
        F: FnOnce() -> Result<Bitmap>,
    {
        // A previous leader may have filled the record meanwhile.
        if let Some(bitmap) = self.lookup_hit(&key) {
            self.release_inflight_slot(key, slot, Ok((bitmap.clone(), CacheOutcome::Hit)));
            return Ok((bitmap, CacheOutcome::Hit));
        }

        match catch_unwind(AssertUnwindSafe(compute)) {
            Ok(Ok(bitmap)) => {
                let outcome = match self.record(&key) {
                    Some(record) if record.payload.set(bitmap.clone()).is_ok() => {
                        self.enrichments.fetch_add(1, Ordering::Relaxed);
                        CacheOutcome::Enriched
                    }
                    _ => {
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        CacheOutcome::Computed
                    }
                };
                self.release_inflight_slot(key, slot, Ok((bitmap.clone(), outcome)));
                Ok((bitmap, outcome))
            }
            Ok(Err(err)) => {
                let reason = match &err {
                    Error::CacheComputation { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                self.release_inflight_slot(key, slot, Err(reason));
                Err(err)
            }
            Err(payload) => {
                self.release_inflight_slot(
                    key,
                    slot,
                    Err("computation panicked before completion".to_string()),
                );
                resume_unwind(payload)
            }
        }
    }

    fn lookup_hit(&self, key: &CacheKey) -> Option<Bitmap> {
        let record = self.record(key)?;
        let bitmap = record.payload.get()?.clone();
        record.hits.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(bitmap)
    }

    fn record(&self, key: &CacheKey) -> Option<Arc<CachedRecord>> {
        self.records.get(key).map(|entry| Arc::clone(entry.value()))
    }

    fn claim_inflight_slot(&self, key: CacheKey) -> InflightRole {
        let mut inflight = self.inflight.lock();
        if let Some(existing) = inflight.get(&key) {
            return InflightRole::Waiter(Arc::clone(existing));
        }
        let slot = Arc::new(InflightComputation::new());
        inflight.insert(key, Arc::clone(&slot));
        InflightRole::Leader(slot)
    }

    fn release_inflight_slot(
        &self,
        key: CacheKey,
        slot: &Arc<InflightComputation>,
        result: SharedOutcome,
    ) {
        {
            let mut inflight = self.inflight.lock();
            if inflight
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, slot))
            {
                inflight.remove(&key);
            }
        }
        *slot.outcome.lock() = Some(result);
        slot.ready.notify_all();
    }

    /// Number of computations currently in flight.
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().len()
    }

    // ---------------------------------------------------------------------
    // Reevaluator interface
    // ---------------------------------------------------------------------

    /// Inserts a promoted record without payload. Returns false if present.
    pub(crate) fn insert_promoted(&self, key: CacheKey, cost: u64, size_in_bytes: u64) -> bool {
        let mut inserted = false;
        self.records.entry(key).or_insert_with(|| {
            inserted = true;
            Arc::new(CachedRecord::new(cost, size_in_bytes))
        });
        if inserted {
            self.occupied_bytes
                .fetch_add(size_in_bytes, Ordering::Relaxed);
        }
        inserted
    }

    /// Removes a record and releases its reserved bytes.
    pub(crate) fn remove(&self, key: &CacheKey) -> Option<Arc<CachedRecord>> {
        let (_, record) = self.records.remove(key)?;
        let _ = self
            .occupied_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |occupied| {
                Some(occupied.saturating_sub(record.size_in_bytes))
            });
        Some(record)
    }

    /// Point-in-time list of records.
    pub(crate) fn records_snapshot(&self) -> Vec<(CacheKey, Arc<CachedRecord>)> {
        self.records
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect()
    }

    /// Lifecycle state of `key` if promoted.
    pub(crate) fn state_of(&self, key: &CacheKey) -> Option<CacheRecordState> {
        self.record(key).map(|record| record.state())
    }

    /// Current counters.
    pub(crate) fn counters(&self) -> LookupCounters {
        LookupCounters {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            enrichments: self.enrichments.load(Ordering::Relaxed),
        }
    }

    /// Returns and resets the counters.
    pub(crate) fn take_counters(&self) -> LookupCounters {
        LookupCounters {
            hits: self.hits.swap(0, Ordering::Relaxed),
            misses: self.misses.swap(0, Ordering::Relaxed),
            enrichments: self.enrichments.swap(0, Ordering::Relaxed),
        }
    }

    /// Drops every record and resets occupancy.
    pub fn clear(&self) {
        self.records.clear();
        self.occupied_bytes.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("records", &self.records.len())
            .field("occupied_bytes", &self.occupied_bytes())
            .field("inflight", &self.inflight_count())
            .finish()
    }
}
