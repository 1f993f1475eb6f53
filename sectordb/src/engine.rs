//! Engine handle: open and recovery, the snapshot chain, writer admission
//! and the commit pipeline.
//!
//! # Snapshots
//!
//! Every committed State is published as a [`ReadTrLink`]. Read
//! transactions pin the current link; when a commit retires a link, the
//! space that commit freed is attached to it and stays reserved until no
//! reader holds that link or any older one.
//!
//! # Writers
//!
//! At most one write transaction exists at a time. Waiting writers queue in
//! FIFO order and the slot is handed directly from one writer to the next,
//! so a late `try_start_write_transaction` cannot overtake the queue.
//!
//! # Commit
//!
//! 1. Apply recorded frees to the bitmap and give every new sector a disk
//!    position, repeating until the allocator tree itself is settled.
//! 2. Write dirty sectors children first, so each parent stores the final
//!    pointer and checksum of its children.
//! 3. Flush, move the sectors into the shared cache, write the header slot
//!    for the new counter and flush again.
//! 4. Publish the new link and retire the old one with the freed space.

use std::cmp::Reverse;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::alloc::{self, LocalityCache};
use crate::config::{DefaultTweaks, EngineConfig, Format, Tweaks};
use crate::error::{ConflictReason, EngineError};
use crate::header::{self, State};
use crate::interval::IntervalSet;
use crate::sector::{SectorId, granules_for};
use crate::storage::{BlockStorage, StorageError};
use crate::store::{SectorCache, StoreContext, WriteState, Writer};
use crate::transaction::Transaction;

/// One committed version visible to readers.
#[derive(Debug)]
pub(crate) struct ReadTrLink {
    pub(crate) state: State,
    readers: AtomicUsize,
    /// Space released by the commit that retired this link.
    freed: Mutex<IntervalSet>,
}

impl ReadTrLink {
    fn new(state: State) -> Self {
        Self {
            state,
            readers: AtomicUsize::new(0),
            freed: Mutex::new(IntervalSet::new()),
        }
    }

    pub(crate) const fn transaction_number(&self) -> u64 {
        self.state.transaction_counter
    }
}

#[derive(Debug)]
struct Shared {
    current: Arc<ReadTrLink>,
    /// Retired links, oldest first, whose freed space may still be visible.
    retired: VecDeque<Arc<ReadTrLink>>,
    writer_active: bool,
    waiting: VecDeque<oneshot::Sender<WriterPermit>>,
}

impl Shared {
    fn prune(&mut self) {
        while let Some(oldest) = self.retired.front() {
            if oldest.readers.load(Ordering::Acquire) > 0 {
                break;
            }
            self.retired.pop_front();
        }
    }
}

#[derive(Debug)]
pub(crate) struct EngineInner {
    pub(crate) store: StoreContext,
    pub(crate) config: EngineConfig,
    pub(crate) tweaks: Arc<dyn Tweaks>,
    locality: Mutex<LocalityCache>,
    shared: Mutex<Shared>,
    /// Set when a commit failed after its header slot reached storage.
    poisoned: AtomicBool,
}

/// Exclusive right to write. Dropping it hands the slot to the next waiter.
#[derive(Debug)]
pub(crate) struct WriterPermit {
    engine: Arc<EngineInner>,
    armed: bool,
}

impl Drop for WriterPermit {
    fn drop(&mut self) {
        if self.armed {
            self.engine.release_writer();
        }
    }
}

impl EngineInner {
    fn sync(&self) -> Result<(), StorageError> {
        if self.config.durable_commits {
            self.store.storage.durable_flush()
        } else {
            self.store.storage.flush()
        }
    }

    fn check_poisoned(&self) -> Result<(), EngineError> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(EngineError::Poisoned);
        }
        Ok(())
    }

    /// Pin the current version for a new transaction.
    pub(crate) fn acquire_snapshot(&self) -> Arc<ReadTrLink> {
        let shared = self.shared.lock();
        shared.current.readers.fetch_add(1, Ordering::AcqRel);
        Arc::clone(&shared.current)
    }

    pub(crate) fn release_snapshot(&self, link: &ReadTrLink) {
        link.readers.fetch_sub(1, Ordering::AcqRel);
        self.shared.lock().prune();
    }

    /// Take the writer slot for a transaction reading `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns a [`EngineError::TransactionConflict`] when another writer
    /// holds the slot or `snapshot` is no longer the current version, and
    /// [`EngineError::Poisoned`] after a commit failed past its header write.
    pub(crate) fn try_acquire_writer(self: &Arc<Self>, snapshot: &ReadTrLink) -> Result<WriterPermit, EngineError> {
        self.check_poisoned()?;
        let mut shared = self.shared.lock();
        if shared.writer_active {
            return Err(EngineError::TransactionConflict(ConflictReason::WriterActive));
        }
        if shared.current.transaction_number() != snapshot.transaction_number() {
            return Err(EngineError::TransactionConflict(ConflictReason::SnapshotOutdated));
        }
        shared.writer_active = true;
        Ok(WriterPermit {
            engine: Arc::clone(self),
            armed: true,
        })
    }

    fn release_writer(self: &Arc<Self>) {
        let mut shared = self.shared.lock();
        while let Some(waiter) = shared.waiting.pop_front() {
            let permit = WriterPermit {
                engine: Arc::clone(self),
                armed: true,
            };
            match waiter.send(permit) {
                Ok(()) => {
                    tracing::trace!("writer slot handed to the next waiter");
                    return;
                }
                // The waiter gave up; its permit must not re-enter this lock.
                Err(mut permit) => permit.armed = false,
            }
        }
        shared.writer_active = false;
    }

    /// Space that must not be reused because a live snapshot may read it.
    fn reserved_space(&self) -> IntervalSet {
        let shared = self.shared.lock();
        let mut reserved = IntervalSet::new();
        for link in &shared.retired {
            reserved.extend(&link.freed.lock());
        }
        reserved
    }

    /// Persist the writer's State and publish it as the current version.
    ///
    /// Pre-conditions:
    /// - the caller holds the writer permit and `base` is the current link.
    pub(crate) fn commit(&self, ws: &mut WriteState, base: &ReadTrLink) -> Result<(), EngineError> {
        self.check_poisoned()?;
        let counter = ws.state.transaction_counter;
        if ws.arena.is_empty() && ws.pending_free.is_empty() && ws.state.same_content(&base.state) {
            tracing::debug!("transaction {counter} changed nothing");
            return Ok(());
        }

        let reserved = self.reserved_space();
        let mut locality = self.locality.lock();
        let sectors = ws.arena.len();
        if let Err(e) = self.persist(ws, &reserved, &mut locality) {
            locality.rollback();
            tracing::warn!("commit of transaction {counter} failed: {e}");
            return Err(e);
        }
        locality.commit();
        drop(locality);

        let link = Arc::new(ReadTrLink::new(ws.state));
        {
            let mut shared = self.shared.lock();
            let retiring = std::mem::replace(&mut shared.current, link);
            *retiring.freed.lock() = std::mem::take(&mut ws.deallocated);
            shared.retired.push_back(retiring);
            shared.prune();
        }
        tracing::debug!(
            "committed transaction {counter}: {sectors} sectors written, {} keys, {} bytes used",
            ws.state.key_value_count,
            ws.state.used_size
        );

        self.store.cache.enforce_capacity();
        Ok(())
    }

    fn persist(&self, ws: &mut WriteState, reserved: &IntervalSet, locality: &mut LocalityCache) -> Result<(), EngineError> {
        let mut w = Writer::new(&self.store, ws);
        assign_positions(&mut w, reserved, locality)?;

        let storage = self.store.storage.as_ref();
        let wanted = w.state().wanted_size;
        if storage.get_size()? < wanted {
            storage.set_size(wanted)?;
        }

        let mut dirty: Vec<(usize, SectorId)> = {
            let arena = &w.write_state().arena;
            arena.dirty().into_iter().map(|id| (arena.deepness(id), id)).collect()
        };
        dirty.sort_unstable_by_key(|&(deepness, id)| (Reverse(deepness), id));
        for (_, id) in dirty {
            w.flush_sector(id)?;
        }
        self.sync()?;
        w.demote_to_cache()?;

        // From here on the new slot may be on disk, and the version it names
        // references space this process still considers free.
        let written = header::write_state(storage, w.state(), &self.store.format).and_then(|()| self.sync());
        if let Err(e) = written {
            self.poisoned.store(true, Ordering::Release);
            tracing::error!("header of transaction {} may be on disk but was not synced: {e}", w.state().transaction_counter);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Apply recorded frees and place every unallocated sector.
///
/// Both steps may dirtize or create allocator sectors, which in turn free
/// their committed originals and need positions, so this runs until
/// nothing is left.
fn assign_positions(w: &mut Writer<'_>, reserved: &IntervalSet, locality: &mut LocalityCache) -> Result<(), EngineError> {
    loop {
        let frees = std::mem::take(&mut w.write_state_mut().pending_free);
        for (offset, len) in frees {
            alloc::free(w, locality, offset, granules_for(len as usize))?;
        }

        let mut pending: Vec<(bool, usize, SectorId)> = {
            let arena = &w.write_state().arena;
            arena
                .unallocated()
                .into_iter()
                .filter_map(|id| arena.get(id).map(|sector| (sector.kind().is_alloc(), arena.deepness(id), id)))
                .collect()
        };
        if pending.is_empty() {
            if w.write_state().pending_free.is_empty() {
                return Ok(());
            }
            continue;
        }
        // Tree sectors before allocator sectors, deepest first.
        pending.sort_unstable_by_key(|&(is_alloc, deepness, id)| (is_alloc, Reverse(deepness), Reverse(id)));
        for (_, _, id) in pending {
            let granules = granules_for(w.sector(id)?.len());
            let offset = alloc::allocate(w, locality, reserved, granules)?;
            w.assign_position(id, offset)?;
        }
    }
}

/// An open database.
///
/// Cheap to clone; all clones share the cache, the snapshot chain and the
/// writer queue.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Open the database in `storage`, creating it when the storage is empty.
    pub fn open(storage: impl BlockStorage + 'static, config: EngineConfig) -> Result<Self, EngineError> {
        let tweaks = Arc::new(DefaultTweaks::from_config(&config));
        Self::open_with_tweaks(storage, config, tweaks)
    }

    /// Like [`Engine::open`] with custom split and cache policies.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Corruption`] when the header cannot be
    /// recovered and [`EngineError::Config`] when the thresholds do not fit
    /// the database's format.
    pub fn open_with_tweaks(
        storage: impl BlockStorage + 'static,
        config: EngineConfig,
        tweaks: Arc<dyn Tweaks>,
    ) -> Result<Self, EngineError> {
        let storage: Box<dyn BlockStorage> = Box::new(storage);
        let (state, format) = if storage.get_size()? == 0 {
            config.validate()?;
            let state = State::initial();
            header::initialize(storage.as_ref(), &state, &config.format)?;
            if config.durable_commits {
                storage.durable_flush()?;
            } else {
                storage.flush()?;
            }
            tracing::info!("created database with {:?}", config.format);
            (state, config.format)
        } else {
            let (state, format) = header::read(storage.as_ref())?;
            config.validate_for(&format)?;
            tracing::info!(
                "opened database at transaction {} ({} keys, {} bytes used)",
                state.transaction_counter,
                state.key_value_count,
                state.used_size
            );
            (state, format)
        };

        let inner = EngineInner {
            store: StoreContext::new(storage, format, SectorCache::with_policy(Arc::clone(&tweaks))),
            config,
            tweaks,
            locality: Mutex::new(LocalityCache::new(format.alloc_leaf_granules())),
            shared: Mutex::new(Shared {
                current: Arc::new(ReadTrLink::new(state)),
                retired: VecDeque::new(),
                writer_active: false,
                waiting: VecDeque::new(),
            }),
            poisoned: AtomicBool::new(false),
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    /// Transaction reading the latest committed version.
    ///
    /// It upgrades to a writer on its first mutation if no other writer is
    /// active and nothing was committed since it started.
    #[must_use]
    pub fn start_read_transaction(&self) -> Transaction {
        Transaction::read(Arc::clone(&self.inner))
    }

    /// Wait for the writer slot and start a write transaction.
    pub async fn start_write_transaction(&self) -> Result<Transaction, EngineError> {
        self.inner.check_poisoned()?;
        let receiver = {
            let mut shared = self.inner.shared.lock();
            if shared.writer_active {
                let (sender, receiver) = oneshot::channel();
                shared.waiting.push_back(sender);
                tracing::trace!("write transaction queued behind {} waiters", shared.waiting.len() - 1);
                Some(receiver)
            } else {
                shared.writer_active = true;
                None
            }
        };
        let permit = match receiver {
            None => WriterPermit {
                engine: Arc::clone(&self.inner),
                armed: true,
            },
            Some(receiver) => receiver
                .await
                .map_err(|_| EngineError::internal("writer queue dropped a waiter"))?,
        };
        Ok(Transaction::write(Arc::clone(&self.inner), permit))
    }

    /// Start a write transaction or fail at once if a writer is active.
    pub fn try_start_write_transaction(&self) -> Result<Transaction, EngineError> {
        let snapshot = self.inner.acquire_snapshot();
        let permit = self.inner.try_acquire_writer(&snapshot);
        self.inner.release_snapshot(&snapshot);
        Ok(Transaction::write(Arc::clone(&self.inner), permit?))
    }

    /// State of the latest committed version.
    #[must_use]
    pub fn current_state(&self) -> State {
        self.inner.shared.lock().current.state
    }

    /// Byte layout of the open database.
    #[must_use]
    pub fn format(&self) -> Format {
        self.inner.store.format
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Bytes held by the shared sector cache.
    #[must_use]
    pub fn cached_bytes(&self) -> usize {
        self.inner.store.cache.cached_bytes()
    }

    /// Trim the cache to the configured target; returns evicted sectors.
    pub fn compact_cache(&self) -> usize {
        let evicted = self.inner.store.cache.compact(self.inner.tweaks.cache_target_bytes());
        tracing::debug!("cache compaction evicted {evicted} sectors");
        evicted
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }

    /// Number of retired versions still held for older readers.
    #[cfg(test)]
    pub(crate) fn retired_versions(&self) -> usize {
        self.inner.shared.lock().retired.len()
    }
}
