//! In-memory, version-stamped indexes read by formula leaves.
//!
//! Every index owns a process-unique id and a version that increases on each
//! mutation. Readers take an immutable snapshot through [`arc_swap::ArcSwap`];
//! the snapshot's [`TransactionalStamp`] identifies exactly the data it holds,
//! which is what formulas mix into their structural hash.

mod attribute;
mod reference;
mod value;


pub use attribute::{AttributeIndex, AttributeSnapshot};
pub use reference::{ReferenceIndex, ReferenceSnapshot, TranslationDirection};
pub use value::{AttributeValue, OrderedFloat};

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_INDEX_ID: AtomicU64 = AtomicU64::new(1);

fn next_index_id() -> u64 {
    NEXT_INDEX_ID.fetch_add(1, Ordering::Relaxed)
}

/// Identity of an index state: which index, at which version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionalStamp {
    /// Process-unique index id.
    pub index_id: u64,
    /// Monotonic version, bumped on every mutation.
    pub version: u64,
}
