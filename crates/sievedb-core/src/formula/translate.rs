//! Key translation through a reference index.

use crate::bitmap::Bitmap;

/// Maps every key of `keys` through `lookup` and unions the results.
///
/// No keys yields the empty set without touching the index; a single key
/// returns the mapped bitmap itself, shared with the index.
pub(crate) fn translate<'a, F>(keys: &Bitmap, lookup: F) -> Bitmap
where
    F: Fn(u32) -> Option<&'a Bitmap>,
{
    match keys.len() {
        0 => Bitmap::empty(),
        1 => keys
            .first()
            .and_then(&lookup)
            .cloned()
            .unwrap_or_default(),
        _ => translate_by_union(keys, lookup),
    }
}

/// General path of [`translate`]: union of every mapped bitmap.
pub(crate) fn translate_by_union<'a, F>(keys: &Bitmap, lookup: F) -> Bitmap
where
    F: Fn(u32) -> Option<&'a Bitmap>,
{
    let mapped: Vec<&Bitmap> = keys.iter().filter_map(lookup).collect();
    Bitmap::or_all(mapped)
}
