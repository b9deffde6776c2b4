//! Occupancy tracking for the virtual arena.
//!
//! Two interval structures cover the two platform mapping strategies:
//!
//! - [`FreeRegionTracker`] records which sub-ranges of the arena are *free*.
//!   The Unix backend consults it before every fixed-address remap: mapping
//!   carves a block out of a free run, unmapping returns the block and merges
//!   it with its neighbors so the whole merged run can be replaced with a
//!   single placeholder mapping.
//! - [`PlaceholderTracker`] records which sub-ranges are *mapped* and the
//!   backing offset each one aliases. The Windows backend needs this extra
//!   detail because partial unmaps must re-map the untouched remainder of a
//!   view at its original backing offset.
//!
//! All intervals are half-open `[lower, upper)` byte ranges. Both trackers
//! keep their intervals disjoint at all times; together with the implicit
//! complement they exactly tile the arena's address window.

use std::collections::BTreeMap;

/// Ordered set of disjoint free intervals, keyed by lower bound.
#[derive(Debug, Default)]
pub struct FreeRegionTracker {
    free: BTreeMap<usize, usize>,
}

impl FreeRegionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the tracker with the arena's full address window.
    pub fn set_address_space(&mut self, start: usize, size: usize) {
        self.free.clear();
        self.free_block(start, size);
    }

    /// Carve `[start, start + size)` out of the free set.
    ///
    /// # Panics
    ///
    /// Panics if the range is not entirely contained in a single free run.
    /// Mapping over an occupied range is a caller contract violation and
    /// continuing would corrupt the occupancy invariant.
    pub fn allocate_block(&mut self, start: usize, size: usize) {
        let end = start + size;
        let run = self
            .free
            .range(..=start)
            .next_back()
            .map(|(&lower, &upper)| (lower, upper))
            .filter(|&(_, upper)| end <= upper);
        let Some((lower, upper)) = run else {
            panic!("range [{start:#x}, {end:#x}) is not entirely free");
        };

        self.free.remove(&lower);
        if lower < start {
            self.free.insert(lower, start);
        }
        if end < upper {
            self.free.insert(end, upper);
        }
    }

    /// Return `[start, start + size)` to the free set, merging it with any
    /// overlapping or adjacent free runs. Returns the merged run as a
    /// `(start, size)` pair.
    pub fn free_block(&mut self, start: usize, size: usize) -> (usize, usize) {
        let mut merged_lower = start;
        let mut merged_upper = start + size;

        // Join a run that overlaps or touches us from the left.
        if let Some((&lower, &upper)) = self.free.range(..=merged_lower).next_back() {
            if upper >= merged_lower {
                merged_lower = lower;
                merged_upper = merged_upper.max(upper);
                self.free.remove(&lower);
            }
        }
        // Join every run starting inside or at the end of the merged range.
        while let Some((&lower, &upper)) = self.free.range(merged_lower..=merged_upper).next() {
            merged_upper = merged_upper.max(upper);
            self.free.remove(&lower);
        }

        self.free.insert(merged_lower, merged_upper);
        (merged_lower, merged_upper - merged_lower)
    }

    /// Whether `[start, start + size)` lies entirely inside one free run.
    pub fn is_free(&self, start: usize, size: usize) -> bool {
        let end = start + size;
        self.free
            .range(..=start)
            .next_back()
            .is_some_and(|(_, &upper)| end <= upper)
    }

    /// The free runs in ascending order.
    pub fn free_runs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.free.iter().map(|(&lower, &upper)| (lower, upper))
    }
}

/// A mapped interval inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placeholder {
    /// Exclusive upper bound of the interval.
    pub upper: usize,
    /// Backing store offset the interval aliases.
    pub host_offset: usize,
}

/// Ordered map of disjoint mapped intervals, keyed by lower bound.
#[derive(Debug, Default)]
pub struct PlaceholderTracker {
    mapped: BTreeMap<usize, Placeholder>,
}

impl PlaceholderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lowest mapped interval intersecting `[lower, upper)`.
    pub fn find_overlap(&self, lower: usize, upper: usize) -> Option<(usize, Placeholder)> {
        if let Some((&l, p)) = self.mapped.range(..=lower).next_back() {
            if p.upper > lower {
                return Some((l, *p));
            }
        }
        self.mapped.range(lower..upper).next().map(|(&l, p)| (l, *p))
    }

    /// Whether any mapped interval intersects `[lower, upper)`.
    pub fn overlaps(&self, lower: usize, upper: usize) -> bool {
        self.find_overlap(lower, upper).is_some()
    }

    /// All mapped intervals intersecting `[lower, upper)`, in ascending order.
    pub fn overlapping(&self, lower: usize, upper: usize) -> Vec<(usize, Placeholder)> {
        let mut result = Vec::new();
        if let Some((&l, p)) = self.mapped.range(..=lower).next_back() {
            if p.upper > lower {
                result.push((l, *p));
            }
        }
        for (&l, p) in self.mapped.range((lower + 1)..upper) {
            result.push((l, *p));
        }
        result
    }

    /// Track a mapped interval. The range must not intersect any tracked
    /// interval.
    pub fn insert(&mut self, lower: usize, upper: usize, host_offset: usize) {
        debug_assert!(lower < upper);
        debug_assert!(!self.overlaps(lower, upper));
        self.mapped.insert(lower, Placeholder { upper, host_offset });
    }

    /// Stop tracking the interval starting at `lower`.
    ///
    /// # Panics
    ///
    /// Panics if no interval starts there; untracking an unknown interval
    /// means the bookkeeping has already diverged.
    pub fn remove(&mut self, lower: usize) -> Placeholder {
        self.mapped
            .remove(&lower)
            .unwrap_or_else(|| panic!("no mapped interval starts at {lower:#x}"))
    }

    /// Upper bound of the mapped interval immediately left of `lower`.
    pub fn prev_upper(&self, lower: usize) -> Option<usize> {
        self.mapped.range(..lower).next_back().map(|(_, p)| p.upper)
    }

    /// Lower bound of the first mapped interval at or beyond `upper`.
    pub fn next_lower(&self, upper: usize) -> Option<usize> {
        self.mapped.range(upper..).next().map(|(&l, _)| l)
    }

    /// Exact-fit check: `[lower, upper)` already spans the whole gap between
    /// its mapped neighbors (or the arena start), so the OS placeholder
    /// underneath needs no split before mapping.
    pub fn is_niche(&self, lower: usize, upper: usize) -> bool {
        match self.mapped.range(upper..).next() {
            Some((&next_lower, _)) if next_lower == upper => {
                match self.mapped.range(..upper).next_back() {
                    Some((_, prev)) => prev.upper == lower,
                    None => lower == 0,
                }
            }
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mapped.is_empty()
    }

    /// The mapped intervals in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Placeholder)> + '_ {
        self.mapped.iter().map(|(&l, p)| (l, *p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const PAGE: usize = 0x1000;
    const SPAN: usize = 256 * PAGE;

    fn make_free() -> FreeRegionTracker {
        let mut tracker = FreeRegionTracker::new();
        tracker.set_address_space(0, SPAN);
        tracker
    }

    // -- FreeRegionTracker --------------------------------------------------

    #[test]
    fn test_allocate_splits_run() {
        let mut tracker = make_free();
        tracker.allocate_block(4 * PAGE, 2 * PAGE);

        let runs: Vec<_> = tracker.free_runs().collect();
        assert_eq!(runs, vec![(0, 4 * PAGE), (6 * PAGE, SPAN)]);
    }

    #[test]
    fn test_allocate_at_run_edges() {
        let mut tracker = make_free();
        tracker.allocate_block(0, PAGE);
        tracker.allocate_block(SPAN - PAGE, PAGE);

        let runs: Vec<_> = tracker.free_runs().collect();
        assert_eq!(runs, vec![(PAGE, SPAN - PAGE)]);
    }

    #[test]
    fn test_free_coalesces_both_sides() {
        let mut tracker = make_free();
        tracker.allocate_block(4 * PAGE, 6 * PAGE);

        // Freeing the middle block merges with the free runs on both sides.
        let (start, size) = tracker.free_block(4 * PAGE, 6 * PAGE);
        assert_eq!((start, size), (0, SPAN));
        assert_eq!(tracker.free_runs().count(), 1);
    }

    #[test]
    fn test_free_merges_left_only() {
        let mut tracker = make_free();
        tracker.allocate_block(4 * PAGE, 8 * PAGE);

        // Free the first half; the right half stays allocated, so the merge
        // only extends left into [0, 4 pages).
        let (start, size) = tracker.free_block(4 * PAGE, 4 * PAGE);
        assert_eq!((start, size), (0, 8 * PAGE));
        assert!(tracker.is_free(0, 8 * PAGE));
        assert!(!tracker.is_free(8 * PAGE, PAGE));
    }

    #[test]
    fn test_map_unmap_roundtrip_restores_occupancy() {
        let mut tracker = make_free();
        let before: Vec<_> = tracker.free_runs().collect();

        tracker.allocate_block(10 * PAGE, 3 * PAGE);
        tracker.free_block(10 * PAGE, 3 * PAGE);

        let after: Vec<_> = tracker.free_runs().collect();
        assert_eq!(before, after);
    }

    #[test]
    #[should_panic(expected = "not entirely free")]
    fn test_allocate_occupied_range_panics() {
        let mut tracker = make_free();
        tracker.allocate_block(4 * PAGE, 2 * PAGE);
        tracker.allocate_block(5 * PAGE, 2 * PAGE);
    }

    /// Interleaved allocate/free at random page-aligned offsets; tracked free
    /// runs plus the shadow allocation set must exactly tile `[0, SPAN)` with
    /// no overlaps at every step.
    #[test]
    fn test_occupancy_invariant_fuzz() {
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let mut tracker = make_free();
        let mut allocated: Vec<(usize, usize)> = Vec::new();

        for round in 0..2000 {
            let do_alloc = allocated.is_empty() || rng.gen_bool(0.5);
            if do_alloc {
                let offset = rng.gen_range(0..SPAN / PAGE) * PAGE;
                let length = rng.gen_range(1..=8) * PAGE;
                if offset + length <= SPAN && tracker.is_free(offset, length) {
                    tracker.allocate_block(offset, length);
                    allocated.push((offset, offset + length));
                }
            } else {
                let index = rng.gen_range(0..allocated.len());
                let (start, end) = allocated.swap_remove(index);
                tracker.free_block(start, end - start);
            }

            if round % 50 == 0 {
                check_tiling(&tracker, &allocated);
            }
        }
        check_tiling(&tracker, &allocated);
    }

    fn check_tiling(tracker: &FreeRegionTracker, allocated: &[(usize, usize)]) {
        let mut intervals: Vec<(usize, usize)> = tracker.free_runs().collect();

        // Free runs must be sorted, disjoint, and maximally coalesced.
        for pair in intervals.windows(2) {
            assert!(pair[0].1 < pair[1].0, "free runs overlap or touch: {pair:?}");
        }

        intervals.extend(allocated.iter().copied());
        intervals.sort_unstable();

        let mut cursor = 0;
        for (lower, upper) in intervals {
            assert_eq!(lower, cursor, "gap or overlap at {cursor:#x}");
            cursor = upper;
        }
        assert_eq!(cursor, SPAN, "intervals do not cover the span");
    }

    // -- PlaceholderTracker -------------------------------------------------

    #[test]
    fn test_find_overlap() {
        let mut tracker = PlaceholderTracker::new();
        tracker.insert(4 * PAGE, 8 * PAGE, 0);
        tracker.insert(16 * PAGE, 20 * PAGE, 0x10000);

        // Query starting inside the first interval.
        assert_eq!(tracker.find_overlap(6 * PAGE, 32 * PAGE).map(|(l, _)| l), Some(4 * PAGE));
        // Query covering only the second interval.
        assert_eq!(tracker.find_overlap(8 * PAGE, 17 * PAGE).map(|(l, _)| l), Some(16 * PAGE));
        // Query in the gap.
        assert!(tracker.find_overlap(8 * PAGE, 16 * PAGE).is_none());
    }

    #[test]
    fn test_overlapping_collects_all() {
        let mut tracker = PlaceholderTracker::new();
        tracker.insert(0, 2 * PAGE, 0);
        tracker.insert(4 * PAGE, 6 * PAGE, 0);
        tracker.insert(8 * PAGE, 10 * PAGE, 0);

        let hits: Vec<usize> = tracker
            .overlapping(PAGE, 9 * PAGE)
            .into_iter()
            .map(|(l, _)| l)
            .collect();
        assert_eq!(hits, vec![0, 4 * PAGE, 8 * PAGE]);
    }

    #[test]
    fn test_is_niche() {
        let mut tracker = PlaceholderTracker::new();
        tracker.insert(4 * PAGE, 8 * PAGE, 0);

        // Exact-fit gap between the arena start and the mapped interval.
        assert!(tracker.is_niche(0, 4 * PAGE));
        // The gap is wider than the candidate range.
        assert!(!tracker.is_niche(PAGE, 4 * PAGE));
        // No mapped interval begins at the candidate's end.
        assert!(!tracker.is_niche(0, 3 * PAGE));

        tracker.insert(10 * PAGE, 12 * PAGE, 0);
        // Exact-fit gap between two mapped intervals.
        assert!(tracker.is_niche(8 * PAGE, 10 * PAGE));
        assert!(!tracker.is_niche(9 * PAGE, 10 * PAGE));
    }

    #[test]
    fn test_neighbor_queries() {
        let mut tracker = PlaceholderTracker::new();
        tracker.insert(4 * PAGE, 8 * PAGE, 0);
        tracker.insert(16 * PAGE, 20 * PAGE, 0);

        assert_eq!(tracker.prev_upper(16 * PAGE), Some(8 * PAGE));
        assert_eq!(tracker.prev_upper(4 * PAGE), None);
        assert_eq!(tracker.next_lower(8 * PAGE), Some(16 * PAGE));
        assert_eq!(tracker.next_lower(20 * PAGE), None);
    }

    #[test]
    #[should_panic(expected = "no mapped interval starts at")]
    fn test_remove_unknown_panics() {
        let mut tracker = PlaceholderTracker::new();
        tracker.remove(PAGE);
    }
}
