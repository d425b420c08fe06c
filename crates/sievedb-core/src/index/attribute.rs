//! Ordered attribute index: value → primary keys.
//!
//! Provides O(log n) point and range lookups. A localized index only holds
//! keys of entities that carry data in its locale.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use roaring::RoaringBitmap;

use super::{next_index_id, AttributeValue, TransactionalStamp};
use crate::bitmap::Bitmap;

/// Immutable view of an [`AttributeIndex`] at one version.
#[derive(Debug, Clone)]
pub struct AttributeSnapshot {
    index_id: u64,
    version: u64,
    buckets: BTreeMap<AttributeValue, Bitmap>,
}

impl AttributeSnapshot {
    /// Stamp identifying this snapshot.
    #[must_use]
    pub fn stamp(&self) -> TransactionalStamp {
        TransactionalStamp {
            index_id: self.index_id,
            version: self.version,
        }
    }

    /// Keys whose attribute equals `value`.
    #[must_use]
    pub fn equals(&self, value: &AttributeValue) -> Bitmap {
        self.buckets.get(value).cloned().unwrap_or_default()
    }

    /// Buckets whose value lies within the bounds, in ascending value order.
    ///
    /// Inverted or empty bounds yield no buckets.
    #[must_use]
    pub fn range(&self, from: Bound<&AttributeValue>, to: Bound<&AttributeValue>) -> Vec<Bitmap> {
        if !bounds_are_valid(from, to) {
            return Vec::new();
        }
        self.buckets
            .range::<AttributeValue, _>((from, to))
            .map(|(_, bitmap)| bitmap.clone())
            .collect()
    }

    /// Number of distinct values.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

fn bounds_are_valid(from: Bound<&AttributeValue>, to: Bound<&AttributeValue>) -> bool {
    match (from, to) {
        (Bound::Included(a), Bound::Included(b)) => a <= b,
        (Bound::Included(a) | Bound::Excluded(a), Bound::Excluded(b))
        | (Bound::Excluded(a), Bound::Included(b)) => a < b,
        _ => true,
    }
}

/// Attribute index with lock-free snapshot reads.
///
/// Writers are serialized and publish a fresh snapshot per mutation; bitmaps
/// of untouched values are shared between versions.
#[derive(Debug)]
pub struct AttributeIndex {
    name: String,
    locale: Option<String>,
    state: ArcSwap<AttributeSnapshot>,
    write_lock: Mutex<()>,
}

impl AttributeIndex {
    /// Creates an empty, locale-independent index.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), None)
    }

    /// Creates an empty index of a localized attribute.
    #[must_use]
    pub fn localized(name: impl Into<String>, locale: impl Into<String>) -> Self {
        Self::build(name.into(), Some(locale.into()))
    }

    fn build(name: String, locale: Option<String>) -> Self {
        Self {
            name,
            locale,
            state: ArcSwap::from_pointee(AttributeSnapshot {
                index_id: next_index_id(),
                version: 0,
                buckets: BTreeMap::new(),
            }),
            write_lock: Mutex::new(()),
        }
    }

    /// Attribute name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Locale of a localized attribute.
    #[must_use]
    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<AttributeSnapshot> {
        self.state.load_full()
    }

    /// Stamp of the current snapshot.
    #[must_use]
    pub fn stamp(&self) -> TransactionalStamp {
        self.state.load().stamp()
    }

    /// Indexes `key` under `value`.
    pub fn insert(&self, value: impl Into<AttributeValue>, key: u32) {
        self.insert_all([(value.into(), key)]);
    }

    /// Indexes many entries under a single version bump.
    pub fn insert_all<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (AttributeValue, u32)>,
    {
        let mut additions: BTreeMap<AttributeValue, RoaringBitmap> = BTreeMap::new();
        for (value, key) in entries {
            additions.entry(value).or_default().insert(key);
        }
        self.mutate(|buckets| {
            let mut changed = false;
            for (value, keys) in additions {
                let bucket = buckets.entry(value).or_default();
                if keys.is_subset(bucket.as_roaring()) {
                    continue;
                }
                let mut merged = bucket.as_roaring().clone();
                merged |= keys;
                *bucket = Bitmap::from_roaring(merged);
                changed = true;
            }
            changed
        });
    }

    /// Removes `key` from `value`. Returns true if it was present.
    pub fn remove(&self, value: &AttributeValue, key: u32) -> bool {
        self.mutate(|buckets| {
            let Some(bucket) = buckets.get(value) else {
                return false;
            };
            if !bucket.contains(key) {
                return false;
            }
            let updated = bucket.with_removed(key);
            if updated.is_empty() {
                buckets.remove(value);
            } else {
                buckets.insert(value.clone(), updated);
            }
            true
        })
    }

    fn mutate<F>(&self, apply: F) -> bool
    where
        F: FnOnce(&mut BTreeMap<AttributeValue, Bitmap>) -> bool,
    {
        let _guard = self.write_lock.lock();
        let current = self.state.load_full();
        let mut buckets = current.buckets.clone();
        if !apply(&mut buckets) {
            return false;
        }
        self.state.store(Arc::new(AttributeSnapshot {
            index_id: current.index_id,
            version: current.version + 1,
            buckets,
        }));
        true
    }
}
