//! Tracking of host-visible ranges handed out from a mapped buffer.
//!
//! While a buffer is mapped, every call to
//! [`Buffer::get_mapped_range`](crate::buffer::Buffer::get_mapped_range) exposes a
//! byte interval to the caller. Two exposed intervals may never share a byte, so that
//! every [`BufferView`](crate::buffer::BufferView) has exclusive access to its bytes.
//! [`RangeTracker`] enforces this.
//!
//! Intervals are half-open: `[a, b)` and `[c, d)` overlap iff both are non-empty and
//! `a < d && c < b`. Empty intervals contain no bytes, so they never overlap anything.
//!
//! There is no partial removal. Unmapping releases every interval at once through
//! [`RangeTracker::clear`].

use std::ops::Range;

use smallvec::SmallVec;

use crate::error::ValidationError;

/// Returns `true` if the two half-open intervals share at least one byte.
#[inline]
pub fn ranges_overlap(a: &Range<u64>, b: &Range<u64>) -> bool {
    !a.is_empty() && !b.is_empty() && a.start < b.end && b.start < a.end
}

/// The set of disjoint intervals currently exposed from one mapping.
///
/// Intervals are kept sorted by start offset. Lookups are linear in the number of
/// active intervals, which in practice is a handful per mapping.
#[derive(Debug, Default, Clone)]
pub struct RangeTracker {
    ranges: SmallVec<[Range<u64>; 4]>,
}

impl RangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first active interval overlapping `candidate`, if any.
    pub fn find_overlap(&self, candidate: &Range<u64>) -> Option<&Range<u64>> {
        self.ranges.iter().find(|r| ranges_overlap(r, candidate))
    }

    /// Inserts `candidate` unless it overlaps an active interval.
    pub fn try_insert(&mut self, candidate: Range<u64>) -> Result<(), ValidationError> {
        if let Some(existing) = self.find_overlap(&candidate) {
            return Err(ValidationError::Overlap {
                range: candidate,
                existing: existing.clone(),
            });
        }
        let at = self
            .ranges
            .partition_point(|r| r.start < candidate.start);
        self.ranges.insert(at, candidate);
        Ok(())
    }

    /// Releases every interval.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Active intervals in ascending order of offset.
    pub fn iter(&self) -> impl Iterator<Item = &Range<u64>> {
        self.ranges.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_overlap_law() {
        assert!(ranges_overlap(&(0..32), &(16..48)));
        assert!(ranges_overlap(&(16..48), &(0..32)));
        assert!(ranges_overlap(&(0..64), &(8..16)));
        assert!(!ranges_overlap(&(0..32), &(32..64)));
        assert!(!ranges_overlap(&(32..64), &(0..32)));
        // Empty intervals contain no bytes.
        assert!(!ranges_overlap(&(8..8), &(0..32)));
        assert!(!ranges_overlap(&(0..32), &(0..0)));
        assert!(!ranges_overlap(&(8..8), &(8..8)));
    }

    #[test]
    fn test_reject_overlap() {
        let mut tracker = RangeTracker::new();
        tracker.try_insert(0..32).unwrap();
        let err = tracker.try_insert(16..48).unwrap_err();
        assert_eq!(
            err,
            ValidationError::Overlap {
                range: 16..48,
                existing: 0..32
            }
        );
        assert_eq!(tracker.len(), 1);
        tracker.try_insert(32..64).unwrap();
        assert_eq!(tracker.len(), 2);
        tracker.try_insert(8..8).unwrap();
        tracker.try_insert(8..8).unwrap();
        assert_eq!(tracker.len(), 4);
    }

    #[test]
    fn test_sorted_and_clear() {
        let mut tracker = RangeTracker::new();
        tracker.try_insert(64..72).unwrap();
        tracker.try_insert(0..8).unwrap();
        tracker.try_insert(16..24).unwrap();
        let starts: Vec<u64> = tracker.iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![0, 16, 64]);

        tracker.clear();
        assert!(tracker.is_empty());
        tracker.try_insert(0..72).unwrap();
    }

    proptest! {
        /// Whatever sequence of insertions is attempted, the accepted set stays
        /// pairwise disjoint, and every rejection really did overlap.
        #[test]
        fn accepted_ranges_never_overlap(
            candidates in prop::collection::vec((0u64..32, 1u64..8), 0..64)
        ) {
            let mut tracker = RangeTracker::new();
            for (slot, len) in candidates {
                let range = slot * 8..slot * 8 + len * 4;
                let overlapped = tracker.find_overlap(&range).is_some();
                let inserted = tracker.try_insert(range).is_ok();
                prop_assert_eq!(inserted, !overlapped);
            }
            let ranges: Vec<_> = tracker.iter().cloned().collect();
            for (i, a) in ranges.iter().enumerate() {
                for b in &ranges[i + 1..] {
                    prop_assert!(!ranges_overlap(a, b));
                }
            }
        }
    }
}
