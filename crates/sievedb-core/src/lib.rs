//! # `SieveDB` Core
//!
//! Formula algebra over primary-key bitmaps with a usage-driven result cache.
//!
//! A filtering query is compiled into a tree of formulas: set operations
//! (`And`, `Or`, `Not`) over index lookups, translations through reference
//! indexes and literal key sets. Formulas know their structural hash, an
//! estimated cardinality and an estimated cost before anything is computed,
//! which lets the engine skip empty branches, intersect smallest-first and
//! reuse results of expensive sub-formulas across queries.
//!
//! ## Features
//!
//! - **Roaring bitmaps**: immutable, cheaply shared primary-key sets
//! - **Snapshot indexes**: attribute and reference indexes with lock-free reads
//! - **Lazy formulas**: memoized per node, estimates as upper bounds
//! - **Tree optimizer**: flattening, locale pruning, memoization groups
//! - **Result cache**: anteroom admission, scored promotion, cooldown eviction
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sievedb_core::{AttributeIndex, CacheEngine, CacheScope, EvaluationContext, FormulaTree, SieveConfig};
//!
//! let config = SieveConfig::load()?;
//! let engine = CacheEngine::start(config.cache)?;
//!
//! let color = Arc::new(AttributeIndex::new("color"));
//! color.insert("red", 1);
//!
//! let mut tree = FormulaTree::new();
//! let red = tree.attribute_equals(&color, "red");
//! let keys = tree.compute(red, &EvaluationContext::cached(&engine, CacheScope::GLOBAL))?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// =============================================================================
// NUMERIC CAST LINTS
// =============================================================================
// Prefer try_from() in new code; the casts left are widening or bounded by
// the arena and bitmap sizes.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)] // Acceptable for scores and hit rates
#![allow(clippy::cast_lossless)]
// =============================================================================
// STYLISTIC LINTS
// =============================================================================
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::derive_partial_eq_without_eq)]
#![allow(clippy::redundant_pub_crate)]
#![allow(clippy::use_self)]
#![allow(clippy::significant_drop_in_scrutinee)]

pub mod bitmap;
pub mod cache;
pub mod config;
pub mod error;
pub mod formula;
pub mod index;

#[cfg(test)]
mod config_tests;

pub use bitmap::Bitmap;
pub use cache::{
    CacheEngine, CacheEvent, CacheKey, CacheRecordState, CacheScope, CacheStatistics,
    ReevaluationReport,
};
pub use config::{CacheConfig, ConfigError, SieveConfig};
pub use error::{Error, Result};
pub use formula::{
    DeferredFormula, EvaluationContext, FormulaId, FormulaKind, FormulaOptimizer, FormulaTree,
    OptimizedFormula,
};
pub use index::{
    AttributeIndex, AttributeValue, ReferenceIndex, TransactionalStamp, TranslationDirection,
};
