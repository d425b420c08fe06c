//! Immutable primary-key bitmaps.
//!
//! [`Bitmap`] wraps a [`RoaringBitmap`] behind an [`Arc`] so that results can
//! be shared between formulas, queries and the result cache without copying.
//! Every operation returns a new bitmap; an empty result is always the
//! process-wide canonical empty instance returned by [`Bitmap::empty`].

use std::fmt;
use std::ops::RangeBounds;
use std::sync::{Arc, LazyLock};

use roaring::RoaringBitmap;

use crate::error::{Error, Result};

/// Fixed bookkeeping cost added to the serialized size when estimating the
/// memory footprint of a cached bitmap.
const MEMORY_OVERHEAD_BYTES: u64 = 48;

static EMPTY: LazyLock<Bitmap> = LazyLock::new(|| Bitmap(Arc::new(RoaringBitmap::new())));

/// An immutable, ordered, compressed set of `u32` primary keys.
///
/// Cloning is O(1) and shares the underlying storage.
#[derive(Clone)]
pub struct Bitmap(Arc<RoaringBitmap>);

impl Bitmap {
    /// Returns the canonical empty bitmap.
    #[must_use]
    pub fn empty() -> Self {
        EMPTY.clone()
    }

    /// Wraps a roaring bitmap, normalizing empty sets to the canonical instance.
    #[must_use]
    pub fn from_roaring(bitmap: RoaringBitmap) -> Self {
        if bitmap.is_empty() {
            Self::empty()
        } else {
            Self(Arc::new(bitmap))
        }
    }

    /// Builds a bitmap from strictly ascending keys.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBitmap`] if the keys are not strictly ascending.
    pub fn from_sorted(keys: &[u32]) -> Result<Self> {
        RoaringBitmap::from_sorted_iter(keys.iter().copied())
            .map(Self::from_roaring)
            .map_err(|e| Error::InvalidBitmap(format!("keys are not strictly ascending: {e}")))
    }

    /// Builds a bitmap from keys in any order, duplicates allowed.
    #[must_use]
    pub fn from_unsorted(keys: &[u32]) -> Self {
        keys.iter().copied().collect()
    }

    /// Builds a bitmap holding every key in `range`.
    #[must_use]
    pub fn from_range<R: RangeBounds<u32>>(range: R) -> Self {
        let mut bitmap = RoaringBitmap::new();
        bitmap.insert_range(range);
        Self::from_roaring(bitmap)
    }

    /// Returns the underlying roaring bitmap.
    #[must_use]
    pub fn as_roaring(&self) -> &RoaringBitmap {
        &self.0
    }

    /// Number of keys in the set.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.0.len()
    }

    /// Returns true if the set holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if `key` is a member.
    #[must_use]
    pub fn contains(&self, key: u32) -> bool {
        self.0.contains(key)
    }

    /// Smallest key, if any.
    #[must_use]
    pub fn first(&self) -> Option<u32> {
        self.0.min()
    }

    /// Largest key, if any.
    #[must_use]
    pub fn last(&self) -> Option<u32> {
        self.0.max()
    }

    /// Iterates keys in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter()
    }

    /// Returns true if this is the canonical empty instance.
    #[must_use]
    pub fn is_canonical_empty(&self) -> bool {
        Arc::ptr_eq(&self.0, &EMPTY.0)
    }

    /// Returns true if both bitmaps share the same storage.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Intersection.
    #[must_use]
    pub fn and(&self, other: &Self) -> Self {
        if self.is_empty() || other.is_empty() {
            return Self::empty();
        }
        Self::from_roaring(self.as_roaring() & other.as_roaring())
    }

    /// Union.
    #[must_use]
    pub fn or(&self, other: &Self) -> Self {
        if other.is_empty() {
            return self.normalized();
        }
        if self.is_empty() {
            return other.clone();
        }
        Self::from_roaring(self.as_roaring() | other.as_roaring())
    }

    /// Keys of `self` that are not in `other`.
    #[must_use]
    pub fn and_not(&self, other: &Self) -> Self {
        if self.is_empty() {
            return Self::empty();
        }
        if other.is_empty() {
            return self.clone();
        }
        Self::from_roaring(self.as_roaring() - other.as_roaring())
    }

    /// Symmetric difference.
    #[must_use]
    pub fn xor(&self, other: &Self) -> Self {
        Self::from_roaring(self.as_roaring() ^ other.as_roaring())
    }

    /// Complement of `self` relative to `universe`.
    #[must_use]
    pub fn not(&self, universe: &Self) -> Self {
        universe.and_not(self)
    }

    /// Intersection of all operands. No operands yields the empty set.
    pub fn and_all<'a, I>(bitmaps: I) -> Self
    where
        I: IntoIterator<Item = &'a Bitmap>,
    {
        let mut iter = bitmaps.into_iter();
        let Some(first) = iter.next() else {
            return Self::empty();
        };
        let mut acc = first.as_roaring().clone();
        for bitmap in iter {
            if acc.is_empty() {
                break;
            }
            acc &= bitmap.as_roaring();
        }
        Self::from_roaring(acc)
    }

    /// Union of all operands. No operands yields the empty set.
    pub fn or_all<'a, I>(bitmaps: I) -> Self
    where
        I: IntoIterator<Item = &'a Bitmap>,
    {
        let mut acc = RoaringBitmap::new();
        for bitmap in bitmaps {
            acc |= bitmap.as_roaring();
        }
        Self::from_roaring(acc)
    }

    /// Upper bound of the intersection size: the smallest operand.
    pub fn estimated_and_cardinality<I: IntoIterator<Item = u64>>(cardinalities: I) -> u64 {
        cardinalities.into_iter().min().unwrap_or(0)
    }

    /// Upper bound of the union size: the saturating sum of operands.
    pub fn estimated_or_cardinality<I: IntoIterator<Item = u64>>(cardinalities: I) -> u64 {
        cardinalities.into_iter().fold(0u64, u64::saturating_add)
    }

    /// Size of the portable serialized form in bytes.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        self.0.serialized_size()
    }

    /// Estimated heap footprint when kept in the result cache.
    #[must_use]
    pub fn estimated_memory_size(&self) -> u64 {
        self.serialized_size() as u64 + MEMORY_OVERHEAD_BYTES
    }

    /// Serializes into the portable roaring format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if writing fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.serialized_size());
        self.0
            .serialize_into(&mut bytes)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserializes from the portable roaring format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the bytes are malformed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        RoaringBitmap::deserialize_from(bytes)
            .map(Self::from_roaring)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Copy-on-write insert used by index maintenance.
    pub(crate) fn with_inserted(&self, key: u32) -> Self {
        if self.contains(key) {
            return self.clone();
        }
        let mut bitmap = self.as_roaring().clone();
        bitmap.insert(key);
        Self(Arc::new(bitmap))
    }

    /// Copy-on-write removal used by index maintenance.
    pub(crate) fn with_removed(&self, key: u32) -> Self {
        if !self.contains(key) {
            return self.clone();
        }
        let mut bitmap = self.as_roaring().clone();
        bitmap.remove(key);
        Self::from_roaring(bitmap)
    }

    fn normalized(&self) -> Self {
        if self.is_empty() {
            Self::empty()
        } else {
            self.clone()
        }
    }
}

impl Default for Bitmap {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for Bitmap {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0 == other.0
    }
}

impl Eq for Bitmap {}

impl FromIterator<u32> for Bitmap {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        Self::from_roaring(iter.into_iter().collect())
    }
}

impl From<RoaringBitmap> for Bitmap {
    fn from(bitmap: RoaringBitmap) -> Self {
        Self::from_roaring(bitmap)
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 8;
        let preview: Vec<u32> = self.iter().take(PREVIEW).collect();
        f.debug_struct("Bitmap")
            .field("len", &self.len())
            .field("keys", &preview)
            .field("truncated", &(self.len() > PREVIEW as u64))
            .finish()
    }
}
