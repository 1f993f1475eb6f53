//! Sector store: shared committed sectors plus the writer's private copies.
//!
//! Readers only ever see committed sectors through the [`SectorCache`]. The
//! active writer additionally owns a [`SectorArena`] holding every sector it
//! created or cloned. Copy-on-write ("dirtize") turns a committed sector into
//! a private clone, rewrites the parent's pointer to the clone and records
//! the original's space as freed by this transaction.
//!
//! # Invariants
//!
//! - A committed sector is never modified in place.
//! - Parents are dirtized before their children, so every pointer patch
//!   lands in a private sector or in the writer's State.
//! - Space freed by a transaction is not reused by that transaction.

mod arena;
mod cache;

use std::collections::HashMap;
use std::sync::Arc;

pub use arena::SectorArena;
pub use cache::{CachedSector, SectorCache};

use crate::btree::{internal, leaf};
use crate::config::Format;
use crate::error::EngineError;
use crate::header::State;
use crate::interval::IntervalSet;
use crate::sector::{INDEX_SLOTS, INDEX_NODE_SIZE, SECTOR_PTR_SIZE, Sector, SectorId, SectorPtr, SectorType, checksum};
use crate::storage::BlockStorage;

/// Storage plus the committed-sector cache, shared by every transaction.
pub struct StoreContext {
    pub(crate) storage: Box<dyn BlockStorage>,
    pub(crate) cache: SectorCache,
    pub(crate) format: Format,
}

impl std::fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreContext")
            .field("cache", &self.cache)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl StoreContext {
    pub fn new(storage: Box<dyn BlockStorage>, format: Format, cache: SectorCache) -> Self {
        Self { storage, cache, format }
    }
}

/// On-disk length of the sector a pointer refers to.
///
/// Allocator pointers carry a free-run hint instead of a length, so their
/// size comes from the format.
#[must_use]
pub const fn sector_len(ptr: SectorPtr, kind: SectorType, format: &Format) -> usize {
    match kind {
        SectorType::AllocLeaf => format.alloc_leaf_bytes,
        SectorType::AllocInternal => INDEX_NODE_SIZE,
        _ => ptr.length(),
    }
}

/// Offsets of the non-null child slots of an allocator or blob index node.
#[must_use]
pub fn index_ptr_offsets(data: &[u8]) -> Vec<usize> {
    (0..INDEX_SLOTS)
        .map(|slot| slot * SECTOR_PTR_SIZE)
        .filter(|&offset| offset + SECTOR_PTR_SIZE <= data.len() && !SectorPtr::read(data, offset).is_null())
        .collect()
}

/// Offsets of every sector pointer stored in `data`.
pub fn ptr_offsets(kind: SectorType, data: &[u8], format: &Format) -> Result<Vec<usize>, EngineError> {
    match kind {
        SectorType::BTreeLeaf => Ok(leaf::ptr_offsets(data, format)),
        SectorType::BTreeInternal => internal::ptr_offsets(data, format),
        SectorType::AllocInternal | SectorType::BlobInternal => Ok(index_ptr_offsets(data)),
        SectorType::AllocLeaf | SectorType::BlobLeaf => Ok(Vec::new()),
    }
}

/// Borrowed bytes of a sector, shared or writer-private.
#[derive(Debug)]
pub enum View<'a> {
    Shared(Arc<CachedSector>),
    Private(&'a Sector),
}

impl View<'_> {
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match self {
            Self::Shared(sector) => sector.data(),
            Self::Private(sector) => sector.data(),
        }
    }
}

/// Read access to one version of the database.
///
/// Without an arena it sees exactly the committed snapshot; with the
/// writer's arena it also sees uncommitted private sectors.
#[derive(Debug, Clone, Copy)]
pub struct Reader<'a> {
    store: &'a StoreContext,
    arena: Option<&'a SectorArena>,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub const fn new(store: &'a StoreContext, arena: Option<&'a SectorArena>) -> Self {
        Self { store, arena }
    }

    #[must_use]
    pub const fn format(&self) -> &'a Format {
        &self.store.format
    }

    /// Bytes of the sector `ptr` refers to.
    pub fn view(&self, ptr: SectorPtr, kind: SectorType, deepness: usize) -> Result<View<'a>, EngineError> {
        if ptr.is_null() {
            return Err(EngineError::internal(format!("null {kind:?} pointer dereferenced")));
        }
        if let Some(arena) = self.arena {
            if let Some(id) = arena.resolve(ptr.position()) {
                return arena
                    .get(id)
                    .map(View::Private)
                    .ok_or_else(|| EngineError::internal(format!("arena lost sector {id}")));
            }
        }
        if !ptr.is_allocated() {
            return Err(EngineError::internal(format!(
                "dangling pointer to unallocated sector {}",
                ptr.position()
            )));
        }
        let len = sector_len(ptr, kind, &self.store.format);
        let sector = self
            .store
            .cache
            .get(ptr, kind, len, deepness, self.store.storage.as_ref())?;
        Ok(View::Shared(sector))
    }
}

/// Everything a write transaction owns besides its writer permit.
#[derive(Debug)]
pub struct WriteState {
    /// The State being built; becomes current on commit.
    pub state: State,
    pub arena: SectorArena,
    /// Committed space released by this transaction.
    pub deallocated: IntervalSet,
    /// Released ranges whose bitmap bits are cleared at commit.
    pub pending_free: Vec<(u64, u64)>,
}

impl WriteState {
    #[must_use]
    pub fn new(state: State) -> Self {
        Self {
            state,
            arena: SectorArena::new(),
            deallocated: IntervalSet::new(),
            pending_free: Vec::new(),
        }
    }
}

/// Mutable access to the writer's version of the database.
pub struct Writer<'a> {
    store: &'a StoreContext,
    ws: &'a mut WriteState,
}

impl<'a> Writer<'a> {
    pub const fn new(store: &'a StoreContext, ws: &'a mut WriteState) -> Self {
        Self { store, ws }
    }

    #[must_use]
    pub const fn format(&self) -> &'a Format {
        &self.store.format
    }

    #[must_use]
    pub const fn store(&self) -> &'a StoreContext {
        self.store
    }

    /// Read view including private sectors.
    #[must_use]
    pub fn reader(&self) -> Reader<'_> {
        Reader::new(self.store, Some(&self.ws.arena))
    }

    #[must_use]
    pub const fn state(&self) -> &State {
        &self.ws.state
    }

    pub const fn state_mut(&mut self) -> &mut State {
        &mut self.ws.state
    }

    #[must_use]
    pub const fn write_state(&self) -> &WriteState {
        &*self.ws
    }

    pub const fn write_state_mut(&mut self) -> &mut WriteState {
        &mut *self.ws
    }

    pub fn sector(&self, id: SectorId) -> Result<&Sector, EngineError> {
        self.ws
            .arena
            .get(id)
            .ok_or_else(|| EngineError::internal(format!("sector {id} not in arena")))
    }

    pub fn sector_mut(&mut self, id: SectorId) -> Result<&mut Sector, EngineError> {
        self.ws
            .arena
            .get_mut(id)
            .ok_or_else(|| EngineError::internal(format!("sector {id} not in arena")))
    }

    /// Arena id of the sector `ptr` refers to, when it is private.
    #[must_use]
    pub fn resolve(&self, ptr: SectorPtr) -> Option<SectorId> {
        if ptr.is_null() {
            return None;
        }
        self.ws.arena.resolve(ptr.position())
    }

    /// Create an unallocated sector holding `data`.
    pub fn new_sector(&mut self, kind: SectorType, data: Vec<u8>, parent: Option<SectorId>) -> SectorId {
        let id = self.ws.arena.publish(kind, data, parent);
        tracing::trace!("new {kind:?} sector {id}");
        id
    }

    /// Length-encoded pointer to a private sector.
    pub fn ptr_of(&self, id: SectorId) -> Result<SectorPtr, EngineError> {
        let sector = self.sector(id)?;
        Ok(SectorPtr::with_length(sector.position(), sector.len(), 0))
    }

    /// Replace a private sector's content.
    pub fn set_data(&mut self, id: SectorId, data: Vec<u8>) -> Result<(), EngineError> {
        let sector = self.sector_mut(id)?;
        if !sector.is_dirty() {
            return Err(EngineError::internal(format!("sector {id} modified while clean")));
        }
        sector.set_data(data);
        Ok(())
    }

    /// Change a private sector's length, keeping its leading bytes and
    /// zero-filling growth.
    pub fn resize(&mut self, id: SectorId, new_len: usize) -> Result<(), EngineError> {
        let sector = self.sector_mut(id)?;
        if !sector.is_dirty() {
            return Err(EngineError::internal(format!("sector {id} resized while clean")));
        }
        let mut data = std::mem::take(sector.data_mut());
        data.resize(new_len, 0);
        sector.set_data(data);
        Ok(())
    }

    /// Make the sector `ptr` refers to writable and return its arena id.
    ///
    /// A private sector is returned as is. A committed one is cloned into
    /// the arena, the pointer in `parent` (or the State root when `parent`
    /// is `None`) is redirected to the clone, and the original's space is
    /// recorded as freed.
    ///
    /// Pre-conditions:
    /// - `parent`, if given, is private and dirty.
    pub fn dirtize(
        &mut self,
        ptr: SectorPtr,
        kind: SectorType,
        parent: Option<SectorId>,
        deepness: usize,
    ) -> Result<SectorId, EngineError> {
        if let Some(id) = self.resolve(ptr) {
            let sector = self.sector_mut(id)?;
            if !sector.is_dirty() {
                sector.mark_dirty();
            }
            return Ok(id);
        }
        if !ptr.is_allocated() {
            return Err(EngineError::internal(format!(
                "cannot dirtize unknown sector {}",
                ptr.position()
            )));
        }

        let original = match self.reader().view(ptr, kind, deepness)? {
            View::Shared(sector) => sector,
            View::Private(_) => return Err(EngineError::internal("committed pointer resolved to arena")),
        };
        let id = self.ws.arena.publish(kind, original.data().to_vec(), parent);
        self.replace_child_ptr(parent, kind, ptr.position(), ptr.moved_to(id))?;
        self.release_committed(original.position(), original.data().len());
        tracing::trace!("dirtized {kind:?} sector at {} as {id}", original.position());
        Ok(id)
    }

    fn root_ptr_mut(&mut self, kind: SectorType) -> Result<&mut SectorPtr, EngineError> {
        if kind.is_btree() {
            Ok(&mut self.ws.state.btree_root)
        } else if kind.is_alloc() {
            Ok(&mut self.ws.state.alloc_root)
        } else {
            Err(EngineError::internal("blob sector has no root slot"))
        }
    }

    /// Point the slot that refers to `old_position` at `new_ptr`.
    pub fn replace_child_ptr(
        &mut self,
        parent: Option<SectorId>,
        kind: SectorType,
        old_position: i64,
        new_ptr: SectorPtr,
    ) -> Result<(), EngineError> {
        let Some(parent) = parent else {
            let root = self.root_ptr_mut(kind)?;
            if root.position() != old_position {
                return Err(EngineError::internal("child not found while patching parent pointer"));
            }
            *root = new_ptr;
            return Ok(());
        };

        let format = *self.format();
        let sector = self.sector_mut(parent)?;
        if !sector.is_dirty() {
            return Err(EngineError::internal(format!("parent {parent} patched while clean")));
        }
        let offsets = ptr_offsets(sector.kind(), sector.data(), &format)?;
        let data = sector.data_mut();
        for offset in offsets {
            if SectorPtr::read(data, offset).position() == old_position {
                new_ptr.write(data, offset);
                return Ok(());
            }
        }
        Err(EngineError::internal("child not found while patching parent pointer"))
    }

    /// Point every private child of `id` back at `id`.
    pub fn reparent_children(&mut self, id: SectorId) -> Result<(), EngineError> {
        let sector = self.sector(id)?;
        let children: Vec<SectorId> = ptr_offsets(sector.kind(), sector.data(), self.format())?
            .into_iter()
            .filter_map(|offset| self.resolve(SectorPtr::read(sector.data(), offset)))
            .collect();
        for child in children {
            self.sector_mut(child)?.set_parent(Some(id));
        }
        Ok(())
    }

    /// Release the sector `ptr` refers to.
    ///
    /// Private sectors are dropped; committed space is recorded and
    /// returned to the allocator at commit.
    pub fn deallocate(&mut self, ptr: SectorPtr, kind: SectorType) -> Result<(), EngineError> {
        if ptr.is_null() {
            return Ok(());
        }
        if let Some(id) = self.resolve(ptr) {
            if let Some(sector) = self.ws.arena.remove(id) {
                if let Ok(position) = u64::try_from(sector.position()) {
                    if position > 0 {
                        self.release_committed(position, sector.len());
                    }
                }
            }
            return Ok(());
        }
        let position = u64::try_from(ptr.position())
            .ok()
            .filter(|&p| p > 0)
            .ok_or_else(|| EngineError::internal(format!("cannot deallocate unknown sector {}", ptr.position())))?;
        self.release_committed(position, sector_len(ptr, kind, self.format()));
        Ok(())
    }

    fn release_committed(&mut self, position: u64, len: usize) {
        let len = len as u64;
        self.ws.deallocated.insert(position, len);
        self.ws.pending_free.push((position, len));
    }

    /// Record the disk position chosen for `id` and patch its parent.
    pub fn assign_position(&mut self, id: SectorId, position: u64) -> Result<(), EngineError> {
        let position = i64::try_from(position)
            .map_err(|_| EngineError::internal(format!("position {position} out of range")))?;
        let (kind, parent, old_position) = {
            let sector = self.sector(id)?;
            (sector.kind(), sector.parent(), sector.position())
        };
        let current = self.slot_ptr(parent, kind, old_position)?;
        self.ws.arena.assign_position(id, position);
        self.replace_child_ptr(parent, kind, old_position, current.moved_to(position))
    }

    fn slot_ptr(&self, parent: Option<SectorId>, kind: SectorType, position: i64) -> Result<SectorPtr, EngineError> {
        let Some(parent) = parent else {
            let root = if kind.is_btree() {
                self.ws.state.btree_root
            } else {
                self.ws.state.alloc_root
            };
            return Ok(root);
        };
        let sector = self.sector(parent)?;
        ptr_offsets(sector.kind(), sector.data(), self.format())?
            .into_iter()
            .map(|offset| SectorPtr::read(sector.data(), offset))
            .find(|ptr| ptr.position() == position)
            .ok_or_else(|| EngineError::internal("child not found while patching parent pointer"))
    }

    /// Write one allocated sector and store its checksum in the parent.
    ///
    /// Pre-conditions:
    /// - every private child of the sector was flushed already.
    pub fn flush_sector(&mut self, id: SectorId) -> Result<(), EngineError> {
        let format = *self.format();
        let (kind, parent, position, crc, pointer) = {
            let sector = self.sector(id)?;
            let position = sector.position();
            let offset = u64::try_from(position)
                .ok()
                .filter(|&p| p > 0)
                .ok_or_else(|| EngineError::internal(format!("flushing unallocated sector {id}")))?;
            self.store.storage.write(sector.data(), offset)?;
            let crc = checksum(sector.data());
            let pointer = if sector.kind().is_alloc() {
                SectorPtr::with_hint(position, crate::alloc::node_hint(sector.kind(), sector.data(), &format), crc)
            } else {
                SectorPtr::with_length(position, sector.len(), crc)
            };
            (sector.kind(), sector.parent(), position, crc, pointer)
        };
        self.replace_child_ptr(parent, kind, position, pointer)?;
        self.sector_mut(id)?.mark_flushed();
        tracing::trace!("flushed {kind:?} sector at {position} crc {crc:#010x}");
        Ok(())
    }

    /// Move every sector of the transaction into the shared cache.
    ///
    /// Pre-conditions:
    /// - every sector is allocated and flushed.
    pub fn demote_to_cache(&mut self) -> Result<(), EngineError> {
        if let Some(id) = self.ws.arena.dirty().first() {
            return Err(EngineError::internal(format!("sector {id} left dirty at demotion")));
        }
        if let Some(id) = self.ws.arena.unallocated().first() {
            return Err(EngineError::internal(format!("sector {id} left unallocated at demotion")));
        }
        let depths: HashMap<SectorId, usize> = self
            .ws
            .arena
            .ids()
            .into_iter()
            .map(|id| (id, self.ws.arena.deepness(id)))
            .collect();
        for mut sector in self.ws.arena.drain() {
            sector.leave_transaction();
            let deepness = depths.get(&sector.id()).copied().unwrap_or_default();
            let kind = sector.kind();
            let position = sector.position().unsigned_abs();
            self.store
                .cache
                .insert(CachedSector::new(kind, position, deepness, sector.into_data()));
        }
        Ok(())
    }
}
