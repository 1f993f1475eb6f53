//! Sectors owned by the active write transaction.
//!
//! Every sector the writer creates or clones lives here until commit. Ids
//! are negative granule multiples and double as the synthetic position
//! stored in parent pointers, so a pointer with a negative position always
//! resolves to an arena entry. Once commit assigns a real position, the
//! sector is also reachable through that position.

use std::collections::HashMap;

use crate::sector::{GRANULE_SIZE, Sector, SectorId, SectorType};

#[allow(clippy::cast_possible_wrap)]
const ID_STEP: SectorId = GRANULE_SIZE as SectorId;

#[derive(Debug)]
pub struct SectorArena {
    sectors: HashMap<SectorId, Sector>,
    by_position: HashMap<i64, SectorId>,
    next_id: SectorId,
}

impl Default for SectorArena {
    fn default() -> Self {
        Self::new()
    }
}

impl SectorArena {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sectors: HashMap::new(),
            by_position: HashMap::new(),
            next_id: -ID_STEP,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    /// Take ownership of new content and return its id.
    pub fn publish(&mut self, kind: SectorType, data: Vec<u8>, parent: Option<SectorId>) -> SectorId {
        let id = self.next_id;
        self.next_id -= ID_STEP;
        let mut sector = Sector::new(kind, id, Vec::new(), parent);
        sector.set_data(data);
        self.sectors.insert(id, sector);
        id
    }

    /// Arena id for a pointer position, if the sector is owned here.
    #[must_use]
    pub fn resolve(&self, position: i64) -> Option<SectorId> {
        if position < 0 {
            self.sectors.contains_key(&position).then_some(position)
        } else {
            self.by_position.get(&position).copied()
        }
    }

    #[must_use]
    pub fn get(&self, id: SectorId) -> Option<&Sector> {
        self.sectors.get(&id)
    }

    pub fn get_mut(&mut self, id: SectorId) -> Option<&mut Sector> {
        self.sectors.get_mut(&id)
    }

    /// Drop a sector the transaction no longer references.
    pub fn remove(&mut self, id: SectorId) -> Option<Sector> {
        let sector = self.sectors.remove(&id)?;
        if sector.allocated() {
            self.by_position.remove(&sector.position());
        }
        Some(sector)
    }

    /// Record the disk position chosen for `id`.
    pub fn assign_position(&mut self, id: SectorId, position: i64) -> bool {
        let Some(sector) = self.sectors.get_mut(&id) else {
            return false;
        };
        sector.set_position(position);
        self.by_position.insert(position, id);
        true
    }

    /// Distance from the sector to its tree root.
    #[must_use]
    pub fn deepness(&self, id: SectorId) -> usize {
        let mut depth = 0;
        let mut current = self.sectors.get(&id).and_then(Sector::parent);
        while let Some(parent) = current {
            depth += 1;
            current = self.sectors.get(&parent).and_then(Sector::parent);
        }
        depth
    }

    #[must_use]
    pub fn ids(&self) -> Vec<SectorId> {
        self.sectors.keys().copied().collect()
    }

    /// Ids of sectors still waiting for a disk position.
    #[must_use]
    pub fn unallocated(&self) -> Vec<SectorId> {
        self.sectors
            .values()
            .filter(|sector| !sector.allocated())
            .map(Sector::id)
            .collect()
    }

    /// Ids of sectors with unflushed content.
    #[must_use]
    pub fn dirty(&self) -> Vec<SectorId> {
        self.sectors
            .values()
            .filter(|sector| sector.is_dirty())
            .map(Sector::id)
            .collect()
    }

    /// Hand every sector over, leaving the arena empty.
    pub fn drain(&mut self) -> impl Iterator<Item = Sector> + '_ {
        self.by_position.clear();
        self.sectors.drain().map(|(_, sector)| sector)
    }
}
