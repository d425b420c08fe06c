//! Reference index: links between owning entities and referenced entities.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use roaring::RoaringBitmap;
use rustc_hash::FxHashMap;

use super::{next_index_id, TransactionalStamp};
use crate::bitmap::Bitmap;

/// Direction in which a translating formula maps keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranslationDirection {
    /// Referenced entity keys → keys of the entities referencing them.
    ReferencedToOwning,
    /// Owning entity keys → keys of the entities they reference.
    OwningToReferenced,
}

/// Immutable view of a [`ReferenceIndex`] at one version.
#[derive(Debug, Clone)]
pub struct ReferenceSnapshot {
    index_id: u64,
    version: u64,
    owning_by_referenced: FxHashMap<u32, Bitmap>,
    referenced_by_owning: FxHashMap<u32, Bitmap>,
    link_count: u64,
}

impl ReferenceSnapshot {
    /// Stamp identifying this snapshot.
    #[must_use]
    pub fn stamp(&self) -> TransactionalStamp {
        TransactionalStamp {
            index_id: self.index_id,
            version: self.version,
        }
    }

    /// Keys linked to `key` in the given direction.
    #[must_use]
    pub fn lookup(&self, direction: TranslationDirection, key: u32) -> Option<&Bitmap> {
        self.side(direction).get(&key)
    }

    /// Total number of links.
    #[must_use]
    pub fn link_count(&self) -> u64 {
        self.link_count
    }

    /// Average number of linked keys per source key, rounded up.
    #[must_use]
    pub fn average_fan_out(&self, direction: TranslationDirection) -> u64 {
        let sources = self.side(direction).len() as u64;
        if sources == 0 {
            0
        } else {
            self.link_count.div_ceil(sources)
        }
    }

    fn side(&self, direction: TranslationDirection) -> &FxHashMap<u32, Bitmap> {
        match direction {
            TranslationDirection::ReferencedToOwning => &self.owning_by_referenced,
            TranslationDirection::OwningToReferenced => &self.referenced_by_owning,
        }
    }
}

/// Bidirectional reference index with lock-free snapshot reads.
#[derive(Debug)]
pub struct ReferenceIndex {
    name: String,
    state: ArcSwap<ReferenceSnapshot>,
    write_lock: Mutex<()>,
}

impl ReferenceIndex {
    /// Creates an empty index for the named reference.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ArcSwap::from_pointee(ReferenceSnapshot {
                index_id: next_index_id(),
                version: 0,
                owning_by_referenced: FxHashMap::default(),
                referenced_by_owning: FxHashMap::default(),
                link_count: 0,
            }),
            write_lock: Mutex::new(()),
        }
    }

    /// Reference name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ReferenceSnapshot> {
        self.state.load_full()
    }

    /// Stamp of the current snapshot.
    #[must_use]
    pub fn stamp(&self) -> TransactionalStamp {
        self.state.load().stamp()
    }

    /// Links `owning` to `referenced`.
    pub fn link(&self, owning: u32, referenced: u32) {
        self.link_all([(owning, referenced)]);
    }

    /// Links many pairs of `(owning, referenced)` under a single version bump.
    pub fn link_all<I>(&self, links: I)
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        let mut owners_by_referenced: FxHashMap<u32, RoaringBitmap> = FxHashMap::default();
        for (owning, referenced) in links {
            owners_by_referenced
                .entry(referenced)
                .or_default()
                .insert(owning);
        }
        self.mutate(|next| {
            let mut changed = false;
            for (referenced, owners) in owners_by_referenced {
                let current = next.owning_by_referenced.entry(referenced).or_default();
                let added = &owners - current.as_roaring();
                if added.is_empty() {
                    continue;
                }
                let mut merged = current.as_roaring().clone();
                merged |= &added;
                *current = Bitmap::from_roaring(merged);
                for owning in &added {
                    let targets = next.referenced_by_owning.entry(owning).or_default();
                    *targets = targets.with_inserted(referenced);
                }
                next.link_count += added.len();
                changed = true;
            }
            changed
        });
    }

    /// Removes the link between `owning` and `referenced`.
    ///
    /// Returns true if the link existed.
    pub fn unlink(&self, owning: u32, referenced: u32) -> bool {
        self.mutate(|next| {
            let removed = remove_from(&mut next.owning_by_referenced, referenced, owning);
            if removed {
                remove_from(&mut next.referenced_by_owning, owning, referenced);
                next.link_count -= 1;
            }
            removed
        })
    }

    fn mutate<F>(&self, apply: F) -> bool
    where
        F: FnOnce(&mut ReferenceSnapshot) -> bool,
    {
        let _guard = self.write_lock.lock();
        let current = self.state.load_full();
        let mut next = ReferenceSnapshot::clone(&current);
        if !apply(&mut next) {
            return false;
        }
        next.version = current.version + 1;
        self.state.store(Arc::new(next));
        true
    }
}

fn remove_from(side: &mut FxHashMap<u32, Bitmap>, source: u32, target: u32) -> bool {
    let Some(targets) = side.get(&source) else {
        return false;
    };
    if !targets.contains(target) {
        return false;
    }
    let updated = targets.with_removed(target);
    if updated.is_empty() {
        side.remove(&source);
    } else {
        side.insert(source, updated);
    }
    true
}
