//! Structural hashing of formulas.
//!
//! Two formulas with the same structural hash compute the same bitmap, so the
//! hash is the result cache key. It mixes the class id, the node's own
//! arguments, the children's hashes (sorted for commutative kinds) and, for
//! index-backed nodes, the transactional stamp of the pinned snapshot.

use std::hash::{Hash, Hasher};
use std::ops::Bound;

use rustc_hash::FxHasher;

use super::{FormulaId, FormulaKind, FormulaTree};
use crate::bitmap::Bitmap;
use crate::error::Result;
use crate::index::{AttributeValue, TransactionalStamp};

impl FormulaTree {
    /// Structural hash of node `id`, computed without evaluating anything.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Planning`] for an unknown id.
    pub fn structural_hash(&self, id: FormulaId) -> Result<u64> {
        let node = self.node(id)?;
        if let Some(hash) = node.hash.get() {
            return Ok(*hash);
        }

        let mut child_hashes = node
            .children
            .iter()
            .map(|child| self.structural_hash(*child))
            .collect::<Result<Vec<u64>>>()?;
        if node.kind.is_commutative() {
            child_hashes.sort_unstable();
        }

        let mut hasher = FxHasher::default();
        node.kind.class_id().hash(&mut hasher);
        match &node.kind {
            FormulaKind::Empty
            | FormulaKind::And
            | FormulaKind::Or
            | FormulaKind::Not
            | FormulaKind::UserFilter => {}
            FormulaKind::Constant(keys) | FormulaKind::SuperSet(keys) => {
                hash_bitmap(keys, &mut hasher);
            }
            FormulaKind::AttributeEquals { index, value } => {
                hash_stamp(node.attribute_snapshot(index).stamp(), &mut hasher);
                value.hash(&mut hasher);
            }
            FormulaKind::AttributeRange { index, from, to } => {
                hash_stamp(node.attribute_snapshot(index).stamp(), &mut hasher);
                hash_bound(from, &mut hasher);
                hash_bound(to, &mut hasher);
            }
            FormulaKind::Locale { index, locale } => {
                hash_stamp(node.attribute_snapshot(index).stamp(), &mut hasher);
                locale.hash(&mut hasher);
            }
            FormulaKind::Translate { index, direction } => {
                // Any change of the reference index supersedes the result.
                hash_stamp(node.reference_snapshot(index).stamp(), &mut hasher);
                direction.hash(&mut hasher);
            }
            FormulaKind::Deferred(deferred) => {
                deferred.label.hash(&mut hasher);
                deferred.hash.hash(&mut hasher);
            }
        }
        child_hashes.hash(&mut hasher);

        Ok(*node.hash.get_or_init(|| hasher.finish()))
    }
}

fn hash_bitmap(keys: &Bitmap, hasher: &mut FxHasher) {
    keys.len().hash(hasher);
    for key in keys.iter() {
        key.hash(hasher);
    }
}

fn hash_stamp(stamp: TransactionalStamp, hasher: &mut FxHasher) {
    stamp.index_id.hash(hasher);
    stamp.version.hash(hasher);
}

fn hash_bound(bound: &Bound<AttributeValue>, hasher: &mut FxHasher) {
    match bound {
        Bound::Included(value) => {
            0u8.hash(hasher);
            value.hash(hasher);
        }
        Bound::Excluded(value) => {
            1u8.hash(hasher);
            value.hash(hasher);
        }
        Bound::Unbounded => 2u8.hash(hasher),
    }
}
