//! Tests for key translation.

use std::cell::Cell;

use proptest::prelude::*;
use rustc_hash::FxHashMap;

use super::translate::{translate, translate_by_union};
use crate::bitmap::Bitmap;

fn mapping(entries: &[(u32, Vec<u32>)]) -> FxHashMap<u32, Bitmap> {
    entries
        .iter()
        .map(|(key, values)| (*key, Bitmap::from_unsorted(values)))
        .collect()
}

#[test]
fn test_no_keys_never_touch_the_index() {
    // Arrange
    let lookups = Cell::new(0);
    let map = mapping(&[(1, vec![10])]);

    // Act
    let result = translate(&Bitmap::empty(), |key| {
        lookups.set(lookups.get() + 1);
        map.get(&key)
    });

    // Assert
    assert!(result.is_canonical_empty());
    assert_eq!(lookups.get(), 0);
}

#[test]
fn test_single_key_returns_mapped_bitmap_itself() {
    let map = mapping(&[(1, vec![10, 11])]);

    let result = translate(&Bitmap::from_unsorted(&[1]), |key| map.get(&key));

    assert!(result.ptr_eq(&map[&1]));
}

#[test]
fn test_single_unmapped_key_is_empty() {
    let map = mapping(&[(1, vec![10])]);

    let result = translate(&Bitmap::from_unsorted(&[2]), |key| map.get(&key));

    assert!(result.is_canonical_empty());
}

#[test]
fn test_many_keys_union_mapped_bitmaps() {
    let map = mapping(&[(1, vec![10, 11]), (2, vec![11, 12]), (3, vec![13])]);

    let result = translate(&Bitmap::from_unsorted(&[1, 2, 4]), |key| map.get(&key));

    assert_eq!(result.iter().collect::<Vec<_>>(), vec![10, 11, 12]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_shortcuts_match_general_union(
        entries in prop::collection::vec((0u32..16, prop::collection::vec(0u32..256, 0..8)), 0..16),
        keys in prop::collection::vec(0u32..20, 0..4),
    ) {
        let map: FxHashMap<u32, Bitmap> = entries
            .into_iter()
            .map(|(key, values)| (key, Bitmap::from_unsorted(&values)))
            .collect();
        let keys = Bitmap::from_unsorted(&keys);

        let fast = translate(&keys, |key| map.get(&key));
        let general = translate_by_union(&keys, |key| map.get(&key));

        prop_assert_eq!(fast, general);
    }
}
