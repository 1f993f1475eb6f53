//! Shared cache of committed sectors.
//!
//! Committed sectors are immutable, so readers and the writer share them
//! through `Arc`s. Each position maps to a compute-once slot: concurrent
//! lookups of an uncached sector wait on the same slot and exactly one of
//! them performs the read. A failed read leaves nothing behind, so a retry
//! goes back to storage.
//!
//! # Invariants
//!
//! - A cached sector's checksum matches the pointer it was loaded through.
//!   A lookup whose pointer disagrees reloads from storage, since the
//!   position may have been freed and reused by a later commit.
//! - Compaction never drops a sector that is still pinned by a view.
//! - With a policy attached, every load that takes the cache over capacity
//!   compacts it back to the policy's target.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};

use crate::config::Tweaks;
use crate::error::EngineError;
use crate::sector::{SectorPtr, SectorType, checksum};
use crate::storage::{BlockStorage, StorageError};

/// Compute-once slot for one position. `loading` serializes the first read
/// so concurrent misses perform a single storage access.
#[derive(Debug, Default)]
struct Slot {
    sector: OnceLock<Arc<CachedSector>>,
    loading: Mutex<()>,
}

type Cell = Arc<Slot>;

/// Immutable copy of a committed sector.
#[derive(Debug)]
pub struct CachedSector {
    kind: SectorType,
    position: u64,
    checksum: u32,
    deepness: usize,
    data: Box<[u8]>,
    last_access: AtomicU64,
}

impl CachedSector {
    #[must_use]
    pub fn new(kind: SectorType, position: u64, deepness: usize, data: Vec<u8>) -> Self {
        Self {
            kind,
            position,
            checksum: checksum(&data),
            deepness,
            data: data.into_boxed_slice(),
            last_access: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> SectorType {
        self.kind
    }

    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    #[must_use]
    pub const fn checksum(&self) -> u32 {
        self.checksum
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn touch(&self, tick: u64) {
        self.last_access.store(tick, Ordering::Relaxed);
    }
}

/// Position-keyed cache shared by every transaction of an engine.
#[derive(Debug, Default)]
pub struct SectorCache {
    entries: RwLock<HashMap<u64, Cell>>,
    cached_bytes: AtomicUsize,
    clock: AtomicU64,
    policy: Option<Arc<dyn Tweaks>>,
}

impl SectorCache {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache that keeps itself within `policy`'s capacity.
    #[must_use]
    pub fn with_policy(policy: Arc<dyn Tweaks>) -> Self {
        Self {
            policy: Some(policy),
            ..Self::default()
        }
    }

    /// Bytes held by cached sectors.
    #[must_use]
    pub fn cached_bytes(&self) -> usize {
        self.cached_bytes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up the sector `ptr` refers to, reading it on a miss.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Corruption`] when the bytes on storage do not
    /// match the pointer's checksum or the storage ends before the sector.
    pub fn get(
        &self,
        ptr: SectorPtr,
        kind: SectorType,
        len: usize,
        deepness: usize,
        storage: &dyn BlockStorage,
    ) -> Result<Arc<CachedSector>, EngineError> {
        let position = u64::try_from(ptr.position())
            .ok()
            .filter(|&p| p > 0)
            .ok_or_else(|| EngineError::internal(format!("lookup of unallocated position {}", ptr.position())))?;

        let cell = self.entries.read().get(&position).cloned();
        let cell = match cell {
            Some(cell) => cell,
            None => Arc::clone(self.entries.write().entry(position).or_default()),
        };

        if let Some(sector) = cell.sector.get() {
            return self.hit_or_reload(ptr, kind, position, len, deepness, storage, sector);
        }

        let _loading = cell.loading.lock();
        if let Some(sector) = cell.sector.get() {
            return self.hit_or_reload(ptr, kind, position, len, deepness, storage, sector);
        }
        match self.load(ptr, kind, position, len, deepness, storage) {
            Ok(sector) => {
                let sector = Arc::new(sector);
                self.cached_bytes.fetch_add(sector.data.len(), Ordering::Relaxed);
                let _ = cell.sector.set(Arc::clone(&sector));
                self.enforce_capacity();
                Ok(sector)
            }
            Err(e) => {
                self.remove_cell(position, &cell);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn hit_or_reload(
        &self,
        ptr: SectorPtr,
        kind: SectorType,
        position: u64,
        len: usize,
        deepness: usize,
        storage: &dyn BlockStorage,
        sector: &Arc<CachedSector>,
    ) -> Result<Arc<CachedSector>, EngineError> {
        if sector.checksum == ptr.checksum() && sector.kind == kind {
            sector.touch(self.tick());
            return Ok(Arc::clone(sector));
        }
        // The position was freed and reused since this copy was cached.
        match self.load(ptr, kind, position, len, deepness, storage) {
            Ok(loaded) => {
                let loaded = Arc::new(loaded);
                self.replace(position, Arc::clone(&loaded));
                self.enforce_capacity();
                Ok(loaded)
            }
            Err(e) => {
                self.evict(position);
                Err(e)
            }
        }
    }

    fn load(
        &self,
        ptr: SectorPtr,
        kind: SectorType,
        position: u64,
        len: usize,
        deepness: usize,
        storage: &dyn BlockStorage,
    ) -> Result<CachedSector, EngineError> {
        let mut data = vec![0u8; len];
        match storage.read_exact(&mut data, position) {
            Ok(()) => {}
            Err(StorageError::ShortRead { .. }) => {
                return Err(EngineError::corruption(format!(
                    "{kind:?} sector at {position} extends past the end of storage"
                )));
            }
            Err(e) => return Err(e.into()),
        }
        let actual = checksum(&data);
        if actual != ptr.checksum() {
            return Err(EngineError::corruption(format!(
                "{kind:?} sector at {position}: checksum {actual:#010x}, expected {:#010x}",
                ptr.checksum()
            )));
        }
        let sector = CachedSector::new(kind, position, deepness, data);
        sector.touch(self.tick());
        Ok(sector)
    }

    fn replace(&self, position: u64, sector: Arc<CachedSector>) {
        let added = sector.data.len();
        let slot = Slot::default();
        let _ = slot.sector.set(sector);
        let previous = self.entries.write().insert(position, Arc::new(slot));
        let removed = previous
            .as_ref()
            .and_then(|cell| cell.sector.get())
            .map_or(0, |old| old.data.len());
        self.cached_bytes.fetch_add(added, Ordering::Relaxed);
        self.cached_bytes.fetch_sub(removed.min(self.cached_bytes()), Ordering::Relaxed);
    }

    fn remove_cell(&self, position: u64, cell: &Cell) {
        let mut entries = self.entries.write();
        if entries.get(&position).is_some_and(|current| Arc::ptr_eq(current, cell)) {
            entries.remove(&position);
        }
    }

    /// Publish a sector written by a commit.
    pub fn insert(&self, sector: CachedSector) {
        sector.touch(self.tick());
        let position = sector.position;
        self.replace(position, Arc::new(sector));
    }

    /// Drop whatever is cached at `position`.
    pub fn evict(&self, position: u64) {
        let removed = self.entries.write().remove(&position);
        if let Some(sector) = removed.as_ref().and_then(|cell| cell.sector.get()) {
            let len = sector.data.len().min(self.cached_bytes());
            self.cached_bytes.fetch_sub(len, Ordering::Relaxed);
        }
    }

    /// Compact down to the policy's target when over its capacity.
    /// Returns the number of sectors evicted.
    pub fn enforce_capacity(&self) -> usize {
        match &self.policy {
            Some(policy) if policy.cache_over_capacity(self.cached_bytes()) => {
                self.compact(policy.cache_target_bytes())
            }
            _ => 0,
        }
    }

    /// Evict unpinned sectors until at most `target_bytes` remain.
    ///
    /// Sectors are scored by age multiplied by tree depth, so rarely used
    /// leaves go before hot upper levels. Returns the number evicted.
    pub fn compact(&self, target_bytes: usize) -> usize {
        let entries = self.entries.upgradable_read();
        let now = self.clock.load(Ordering::Relaxed);

        let mut total = 0usize;
        let mut candidates = Vec::new();
        for (&position, cell) in entries.iter() {
            let Some(sector) = cell.sector.get() else { continue };
            total += sector.data.len();
            // The map's reference is the only one when nothing pins it.
            if Arc::strong_count(sector) > 1 || Arc::strong_count(cell) > 1 {
                continue;
            }
            let age = now.saturating_sub(sector.last_access.load(Ordering::Relaxed));
            let score = age.saturating_mul(sector.deepness as u64 + 1);
            candidates.push((score, position, sector.data.len()));
        }

        if total <= target_bytes {
            self.cached_bytes.store(total, Ordering::Relaxed);
            return 0;
        }

        candidates.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        let mut entries = RwLockUpgradableReadGuard::upgrade(entries);
        let mut evicted = 0;
        for (_, position, len) in candidates {
            if total <= target_bytes {
                break;
            }
            entries.remove(&position);
            total -= len;
            evicted += 1;
        }
        self.cached_bytes.store(total, Ordering::Relaxed);
        tracing::debug!("cache compaction evicted {evicted} sectors, {total} bytes remain");
        evicted
    }
}
