//! Shared in-memory storage for tests.
//!
//! Clones share the same buffer, so a test can keep a handle after giving
//! one to the engine and then corrupt bytes, inspect sectors, or reopen the
//! database from the same contents.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::storage::io::{BlockStorage, StorageError};

#[derive(Debug, Default)]
struct Shared {
    data: RwLock<Vec<u8>>,
    fail_writes: AtomicBool,
    fail_flushes: AtomicBool,
    flushes_left: AtomicU64,
    durable_flushes: AtomicU64,
}

/// In-memory block storage with simple fault injection.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    shared: Arc<Shared>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.shared
            .data
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Independent storage holding a copy of the current contents.
    #[must_use]
    pub fn fork(&self) -> Self {
        let storage = Self::new();
        *storage
            .shared
            .data
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = self.contents();
        storage
    }

    /// Flip bits of the byte at `offset`.
    pub fn corrupt(&self, offset: u64, mask: u8) {
        let mut data = self
            .shared
            .data
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(byte) = usize::try_from(offset).ok().and_then(|i| data.get_mut(i)) {
            *byte ^= mask;
        }
    }

    /// Make every subsequent write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Let `successful` more flushes through, then fail every flush.
    /// `None` stops failing.
    pub fn fail_flushes_after(&self, successful: Option<u64>) {
        match successful {
            Some(count) => {
                self.shared.flushes_left.store(count, Ordering::SeqCst);
                self.shared.fail_flushes.store(true, Ordering::SeqCst);
            }
            None => self.shared.fail_flushes.store(false, Ordering::SeqCst),
        }
    }

    fn take_flush(&self) -> Result<(), StorageError> {
        if !self.shared.fail_flushes.load(Ordering::SeqCst) {
            return Ok(());
        }
        let left = self.shared.flushes_left.load(Ordering::SeqCst);
        if left == 0 {
            return Err(StorageError::InjectedFault("flush".to_string()));
        }
        self.shared.flushes_left.store(left - 1, Ordering::SeqCst);
        Ok(())
    }

    /// Number of durable flushes requested so far.
    #[must_use]
    pub fn durable_flush_count(&self) -> u64 {
        self.shared.durable_flushes.load(Ordering::SeqCst)
    }
}

fn to_index(offset: u64) -> Result<usize, StorageError> {
    usize::try_from(offset)
        .map_err(|_| StorageError::InjectedFault(format!("offset {offset} exceeds memory")))
}

impl BlockStorage for MemoryStorage {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        let data = self
            .shared
            .data
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let start = to_index(offset)?;
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<(), StorageError> {
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::InjectedFault(format!(
                "write of {} bytes at {offset}",
                buf.len()
            )));
        }
        let mut data = self
            .shared
            .data
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let start = to_index(offset)?;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.take_flush()
    }

    fn durable_flush(&self) -> Result<(), StorageError> {
        self.take_flush()?;
        self.shared.durable_flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_size(&self) -> Result<u64, StorageError> {
        let data = self
            .shared
            .data
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(data.len() as u64)
    }

    fn set_size(&self, size: u64) -> Result<(), StorageError> {
        let size = to_index(size)?;
        self.shared
            .data
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .resize(size, 0);
        Ok(())
    }
}
