//! Locality cache for the allocator.
//!
//! One byte per region (the span of one allocator leaf) recording the
//! longest free run seen there, capped at [`RUN_CAP`] granules. A value
//! below the cap is an upper bound the allocator can use to skip the region
//! without loading its bitmap; [`UNKNOWN`] means nothing is known.
//!
//! Updates made while a transaction runs are tentative. They become
//! authoritative on commit and are turned into [`UNKNOWN`] on rollback,
//! because the rolled back bitmap may hold more free space than observed.

use std::collections::HashMap;

use crate::sector::GRANULE_SIZE;

/// Largest run length tracked exactly.
pub const RUN_CAP: u8 = 63;

/// Marker for a region with no usable estimate.
pub const UNKNOWN: u8 = 0xFF;

/// Coarse per-region free-run table.
#[derive(Debug, Clone)]
pub struct LocalityCache {
    region_granules: u64,
    regions: Vec<u8>,
    pending: HashMap<u64, u8>,
}

impl LocalityCache {
    #[must_use]
    pub fn new(region_granules: u64) -> Self {
        Self {
            region_granules: region_granules.max(1),
            regions: Vec::new(),
            pending: HashMap::new(),
        }
    }

    /// Region holding `byte_offset`.
    #[must_use]
    pub const fn region_of(&self, byte_offset: u64) -> u64 {
        byte_offset / GRANULE_SIZE / self.region_granules
    }

    fn stored(&self, region: u64) -> u8 {
        if let Some(&value) = self.pending.get(&region) {
            return value;
        }
        usize::try_from(region)
            .ok()
            .and_then(|index| self.regions.get(index).copied())
            .unwrap_or(UNKNOWN)
    }

    /// Upper bound on the longest free run (in granules) near `byte_offset`.
    ///
    /// `None` when the region is unknown or holds a run of at least
    /// [`RUN_CAP`] granules.
    #[must_use]
    pub fn query(&self, byte_offset: u64) -> Option<u64> {
        match self.stored(self.region_of(byte_offset)) {
            value if value < RUN_CAP => Some(u64::from(value)),
            _ => None,
        }
    }

    /// Record the longest free run observed in the region of `byte_offset`.
    pub fn update(&mut self, byte_offset: u64, observed_run: u64) {
        let value = u8::try_from(observed_run.min(u64::from(RUN_CAP))).unwrap_or(RUN_CAP);
        let region = self.region_of(byte_offset);
        self.pending.insert(region, value);
    }

    /// Forget estimates for every region touched by a granule range.
    pub fn invalidate(&mut self, start_granule: u64, count: u64) {
        let first = start_granule / self.region_granules;
        let last = (start_granule + count.max(1) - 1) / self.region_granules;
        for region in first..=last {
            self.pending.insert(region, UNKNOWN);
        }
    }

    /// Tentative entries become authoritative.
    pub fn commit(&mut self) {
        for (region, value) in self.pending.drain() {
            let Ok(index) = usize::try_from(region) else {
                continue;
            };
            if self.regions.len() <= index {
                self.regions.resize(index + 1, UNKNOWN);
            }
            self.regions[index] = value;
        }
    }

    /// Tentative entries are discarded and their regions invalidated.
    pub fn rollback(&mut self) {
        for (region, _) in self.pending.drain() {
            if let Some(value) = usize::try_from(region)
                .ok()
                .and_then(|index| self.regions.get_mut(index))
            {
                *value = UNKNOWN;
            }
        }
    }

    #[cfg(test)]
    pub fn tracked_regions(&self) -> usize {
        self.regions.len()
    }
}
