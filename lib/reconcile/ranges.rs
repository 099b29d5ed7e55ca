//! Cursor arithmetic shared by the four passes.
//!
//! A range query returns a prefix of the requested window. A page shorter than the limit
//! therefore covers the whole window, while a full page only covers up to its last id.
//! When a pass compares two pages it may only trust ids both pages cover, so each
//! iteration works on the smaller of the two covered bounds and moves the cursor there.

use crate::store::IdRange;

/// Upper bound of the part of `range` that a page holding `ids` covers.
pub fn covered_bound(range: IdRange, ids: &[i64], limit: usize) -> i64 {
    if ids.len() < limit {
        return range.end_id;
    }
    ids.iter()
        .copied()
        .max()
        .map_or(range.end_id, |max| max.min(range.end_id))
}

/// Window `(begin, end]` for a pass, or `None` when there is nothing to scan.
pub fn window(begin_id: i64, end_id: i64) -> Option<IdRange> {
    let range = IdRange::new(begin_id, end_id);
    (!range.is_empty()).then_some(range)
}
