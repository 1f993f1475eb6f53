//! Disjoint byte-range sets.
//!
//! Used to track space deallocated by the active writer and space that a
//! reader snapshot may still reference. Adjacent and overlapping ranges are
//! merged on insert, so iteration yields maximal disjoint ranges in order.

use std::collections::BTreeMap;

/// Set of disjoint half-open byte ranges keyed by start offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    ranges: BTreeMap<u64, u64>,
}

impl IntervalSet {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ranges: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of disjoint ranges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Total bytes covered.
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.ranges.iter().map(|(start, end)| end - start).sum()
    }

    /// Add `[start, start + len)`, merging with neighbours.
    pub fn insert(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut new_start = start;
        let mut new_end = start + len;

        let previous = self
            .ranges
            .range(..=new_start)
            .next_back()
            .map(|(&s, &e)| (s, e));
        if let Some((prev_start, prev_end)) = previous {
            if prev_end >= new_start {
                new_start = prev_start;
                new_end = new_end.max(prev_end);
                self.ranges.remove(&prev_start);
            }
        }

        let swallowed: Vec<(u64, u64)> = self
            .ranges
            .range(new_start..=new_end)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in swallowed {
            new_end = new_end.max(e);
            self.ranges.remove(&s);
        }

        self.ranges.insert(new_start, new_end);
    }

    /// Remove `[start, start + len)`, splitting ranges that straddle it.
    pub fn remove(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let end = start + len;
        let affected: Vec<(u64, u64)> = self
            .ranges
            .range(..end)
            .filter(|&(_, &e)| e > start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in affected {
            self.ranges.remove(&s);
            if s < start {
                self.ranges.insert(s, start);
            }
            if e > end {
                self.ranges.insert(end, e);
            }
        }
    }

    /// End of the first range overlapping `[start, start + len)`, if any.
    ///
    /// Callers searching for free space restart their scan at the returned
    /// offset.
    #[must_use]
    pub fn first_overlap_end(&self, start: u64, len: u64) -> Option<u64> {
        let end = start + len;
        if let Some((_, &prev_end)) = self.ranges.range(..=start).next_back() {
            if prev_end > start {
                return Some(prev_end);
            }
        }
        self.ranges
            .range(start..end)
            .next()
            .map(|(_, &range_end)| range_end)
    }

    #[must_use]
    pub fn overlaps(&self, start: u64, len: u64) -> bool {
        len > 0 && self.first_overlap_end(start, len).is_some()
    }

    /// Whether `[start, start + len)` is fully covered.
    #[must_use]
    pub fn contains(&self, start: u64, len: u64) -> bool {
        self.ranges
            .range(..=start)
            .next_back()
            .is_some_and(|(_, &end)| end >= start + len)
    }

    /// Add every range of `other`.
    pub fn extend(&mut self, other: &Self) {
        for (start, len) in other.iter() {
            self.insert(start, len);
        }
    }

    /// Iterate as `(start, len)` pairs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(&start, &end)| (start, end - start))
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}
