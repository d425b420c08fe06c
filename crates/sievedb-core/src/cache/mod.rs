//! Usage-driven result cache for formula bitmaps.
//!
//! Results are not cached on first sight. A computed formula first becomes an
//! *adept* in the [`Anteroom`], a bounded table that only counts how often the
//! formula is needed. A periodic reevaluation cycle scores adepts by
//! `hits × cost / size` and promotes the best ones into the [`ResultCache`]
//! within a memory budget; cached records that stop paying off cool down and
//! are eventually evicted.
//!
//! ```text
//! Adept ──promote──▶ Promoted ◀──▶ Cooldown ──▶ Evicted
//!   └──capacity / idle──▶ Wasted
//! ```
//!
//! Invalidation is implicit: formulas mix the version stamps of the indexes
//! they read into their structural hash, so a mutated index produces new keys
//! and stale records simply stop being hit.

mod anteroom;
mod engine;
mod events;
mod ghost;
mod reevaluator;
mod result_cache;
mod scheduler;

#[cfg(test)]
mod concurrency_tests;
#[cfg(test)]
mod reevaluator_tests;

pub use anteroom::{AdeptAdmission, Anteroom, CacheAdept};
pub use engine::{CacheEngine, CacheStatistics};
pub use events::CacheEvent;
pub use reevaluator::ReevaluationReport;
pub use result_cache::{CacheOutcome, ResultCache};

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

/// Discriminates cache keys of unrelated collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CacheScope(u64);

impl CacheScope {
    /// Scope shared by every caller that does not discriminate.
    pub const GLOBAL: Self = Self(0);

    /// Scope of one entity collection in one catalog.
    #[must_use]
    pub fn new(catalog: &str, entity_type: &str) -> Self {
        let mut hasher = FxHasher::default();
        catalog.hash(&mut hasher);
        entity_type.hash(&mut hasher);
        Self(hasher.finish())
    }

    /// Raw discriminator value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// Key of a cached result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Structural hash of the formula.
    pub formula_hash: u64,
    /// Scope the formula was evaluated in.
    pub scope: CacheScope,
}

impl CacheKey {
    /// Creates a key.
    #[must_use]
    pub const fn new(formula_hash: u64, scope: CacheScope) -> Self {
        Self {
            formula_hash,
            scope,
        }
    }
}

/// Lifecycle state of a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheRecordState {
    /// Waiting in the anteroom.
    Adept,
    /// Held in the result cache.
    Promoted,
    /// Held in the result cache, scheduled for eviction unless reused.
    Cooldown,
    /// Removed from the result cache.
    Evicted,
    /// Discarded from the anteroom before promotion.
    Wasted,
}

/// Reuse score of a result: `hits × cost / size`.
pub(crate) fn score(hits: u64, cost: u64, size_in_bytes: u64) -> f64 {
    hits as f64 * cost as f64 / size_in_bytes.max(1) as f64
}
