//! Bounded waiting room for cache candidates.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{score, CacheKey};

/// Usage statistics of a formula that is not cached yet.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheAdept {
    /// Cache key of the formula.
    pub key: CacheKey,
    /// Times the formula was needed again after its first computation.
    pub hits: u64,
    /// Times the formula was computed without reuse evidence.
    pub misses: u64,
    /// Estimated cost of computing the formula.
    pub cost: u64,
    /// Estimated size of the result in bytes.
    pub size_in_bytes: u64,
    /// When the adept was created.
    pub first_seen: Instant,
    /// When the adept was last recorded.
    pub last_seen: Instant,
    /// Creation order; unique per anteroom.
    pub(crate) sequence: u64,
}

impl CacheAdept {
    /// Reuse score: `hits × cost / size`.
    #[must_use]
    pub fn score(&self) -> f64 {
        score(self.hits, self.cost, self.size_in_bytes)
    }

    /// Total number of recorded usages.
    #[must_use]
    pub fn usages(&self) -> u64 {
        self.hits + self.misses
    }
}

/// What [`Anteroom::record_access`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdeptAdmission {
    /// A new adept was created.
    Created,
    /// A new adept was created after discarding the least promising one,
    /// whose key is carried along.
    CreatedWithEviction(CacheKey),
    /// An existing adept gained a hit.
    Updated,
    /// The result is too large to ever be cached.
    Rejected,
}

/// Eviction order of an adept: the smallest rank is discarded first.
#[derive(Debug, Clone, Copy)]
struct VictimRank {
    score: f64,
    hits: u64,
    sequence: u64,
}

impl VictimRank {
    fn of(adept: &CacheAdept) -> Self {
        Self {
            score: adept.score(),
            hits: adept.hits,
            sequence: adept.sequence,
        }
    }
}

impl Ord for VictimRank {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.score
            .total_cmp(&other.score)
            .then(self.hits.cmp(&other.hits))
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for VictimRank {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for VictimRank {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for VictimRank {}

/// Adepts by key plus their eviction order, kept in sync under one lock.
#[derive(Debug, Default)]
struct AdeptTable {
    adepts: FxHashMap<CacheKey, CacheAdept>,
    // Sequences are unique, so every adept has exactly one rank.
    ranking: BTreeMap<VictimRank, CacheKey>,
}

impl AdeptTable {
    fn insert(&mut self, adept: CacheAdept) {
        self.ranking.insert(VictimRank::of(&adept), adept.key);
        self.adepts.insert(adept.key, adept);
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheAdept> {
        let adept = self.adepts.remove(key)?;
        self.ranking.remove(&VictimRank::of(&adept));
        Some(adept)
    }

    fn pop_least_promising(&mut self) -> Option<CacheKey> {
        let (_, key) = self.ranking.pop_first()?;
        self.adepts.remove(&key);
        Some(key)
    }

    fn clear(&mut self) {
        self.adepts.clear();
        self.ranking.clear();
    }
}

/// Bounded table of cache adepts.
///
/// When the table is full, a new key displaces the least promising adept:
/// lowest score first, then fewest hits, then the most recently created.
/// Adepts are kept ordered by that rank, so finding the victim does not
/// depend on the number of adepts.
#[derive(Debug)]
pub struct Anteroom {
    capacity: usize,
    max_record_size: u64,
    table: Mutex<AdeptTable>,
    sequence: AtomicU64,
    wasted: AtomicU64,
}

impl Anteroom {
    /// Creates an anteroom holding at most `capacity` adepts no larger than
    /// `max_record_size` bytes.
    #[must_use]
    pub fn new(capacity: usize, max_record_size: u64) -> Self {
        Self {
            capacity,
            max_record_size,
            table: Mutex::new(AdeptTable::default()),
            sequence: AtomicU64::new(0),
            wasted: AtomicU64::new(0),
        }
    }

    /// Maximum number of adepts.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of adepts waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().adepts.len()
    }

    /// Returns true if no adept is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.lock().adepts.is_empty()
    }

    /// Returns true if the anteroom reached its capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Adepts discarded before promotion since creation.
    #[must_use]
    pub fn wasted(&self) -> u64 {
        self.wasted.load(Ordering::Relaxed)
    }

    /// Returns true if `key` is waiting.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.table.lock().adepts.contains_key(key)
    }

    /// Statistics of one adept.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<CacheAdept> {
        self.table.lock().adepts.get(key).cloned()
    }

    /// Point-in-time copy of all adepts.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CacheAdept> {
        self.table.lock().adepts.values().cloned().collect()
    }

    /// Key of the adept the next overflow would discard.
    #[must_use]
    pub fn least_promising(&self) -> Option<CacheKey> {
        self.table
            .lock()
            .ranking
            .first_key_value()
            .map(|(_, key)| *key)
    }

    /// Records one computation of `key`.
    ///
    /// The first computation creates the adept (a miss); later ones count as
    /// hits. Estimates are refreshed with the latest values.
    pub fn record_access(&self, key: CacheKey, cost: u64, size_in_bytes: u64) -> AdeptAdmission {
        if size_in_bytes > self.max_record_size {
            return AdeptAdmission::Rejected;
        }

        let now = Instant::now();
        let mut table = self.table.lock();
        if let Some(mut adept) = table.remove(&key) {
            adept.hits += 1;
            adept.cost = cost;
            adept.size_in_bytes = size_in_bytes;
            adept.last_seen = now;
            table.insert(adept);
            return AdeptAdmission::Updated;
        }

        let mut admission = AdeptAdmission::Created;
        if table.adepts.len() >= self.capacity {
            if let Some(victim) = table.pop_least_promising() {
                self.wasted.fetch_add(1, Ordering::Relaxed);
                admission = AdeptAdmission::CreatedWithEviction(victim);
            }
        }
        table.insert(CacheAdept {
            key,
            hits: 0,
            misses: 1,
            cost,
            size_in_bytes,
            first_seen: now,
            last_seen: now,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        });
        admission
    }

    /// Removes an adept, e.g. on promotion.
    pub(crate) fn remove(&self, key: &CacheKey) -> Option<CacheAdept> {
        self.table.lock().remove(key)
    }

    /// Removes every adept whose key satisfies `cached`, without counting
    /// them as wasted.
    pub(crate) fn remove_where<F>(&self, cached: F) -> usize
    where
        F: Fn(&CacheKey) -> bool,
    {
        let mut table = self.table.lock();
        let keys: Vec<CacheKey> = table.adepts.keys().filter(|key| cached(key)).copied().collect();
        for key in &keys {
            table.remove(key);
        }
        keys.len()
    }

    /// Discards adepts idle for longer than `ttl` and counts them as wasted.
    pub(crate) fn discard_idle(&self, ttl: Duration, now: Instant) -> Vec<CacheKey> {
        let mut table = self.table.lock();
        let idle: Vec<CacheKey> = table
            .adepts
            .values()
            .filter(|adept| now.saturating_duration_since(adept.last_seen) > ttl)
            .map(|adept| adept.key)
            .collect();
        for key in &idle {
            table.remove(key);
        }
        self.wasted.fetch_add(idle.len() as u64, Ordering::Relaxed);
        idle
    }

    /// Drops every adept.
    pub fn clear(&self) {
        self.table.lock().clear();
    }
}
