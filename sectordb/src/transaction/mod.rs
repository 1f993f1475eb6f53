//! Transactions: the public key/value API.
//!
//! A [`Transaction`] starts reading one committed version. The first
//! mutation upgrades it to the single writer, which fails with a retryable
//! [`EngineError::TransactionConflict`] when another writer is active or a
//! newer version has been committed since the transaction started.
//!
//! Operations work on a current key selected by [`Transaction::find_key`],
//! the navigation calls or [`Transaction::set_key_index`]. All keys are
//! addressed relative to the prefix set with [`Transaction::set_key_prefix`];
//! navigation never leaves it.
//!
//! # Lifecycle
//!
//! `ReadOnly` → (first mutation) `Write` → `Finished` after
//! [`Transaction::commit`] or [`Transaction::rollback`]. Dropping an
//! unfinished transaction rolls it back.

mod cursor;
mod mutate;

use std::sync::Arc;

use crate::btree::SearchKey;
use crate::config::Tweaks;
use crate::engine::{EngineInner, ReadTrLink, WriterPermit};
use crate::error::EngineError;
use crate::header::State;
use crate::store::{Reader, WriteState, Writer};
use cursor::{Cursor, Tree};

/// How [`Transaction::find_key`] treats a key that does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindKeyStrategy {
    /// Only an exact match is accepted.
    ExactMatch,
    /// Insert the key with an empty value; upgrades to a writer.
    Create,
    /// The next key, or the previous one when there is no next key.
    PreferNext,
    /// The previous key, or the next one when there is no previous key.
    PreferPrevious,
    OnlyNext,
    OnlyPrevious,
}

/// Outcome of [`Transaction::find_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindResult {
    Created,
    FoundExact,
    FoundNext,
    FoundPrevious,
    NotFound,
}

impl FindResult {
    /// Whether a current key was selected.
    #[must_use]
    pub const fn is_found(self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

#[derive(Debug)]
struct WriteSession {
    ws: WriteState,
    _permit: WriterPermit,
}

#[derive(Debug)]
enum Mode {
    ReadOnly,
    Write(Box<WriteSession>),
    Finished,
}

const FINISHED: EngineError = EngineError::InvalidOperation("transaction already finished");
const NO_CURRENT_KEY: EngineError = EngineError::InvalidOperation("no current key");

/// A read or write transaction over one version of the database.
#[derive(Debug)]
pub struct Transaction {
    engine: Arc<EngineInner>,
    /// Version this transaction started from, pinned until it finishes.
    snapshot: Option<Arc<ReadTrLink>>,
    mode: Mode,
    prefix: Vec<u8>,
    cursor: Option<Cursor>,
}

/// Smallest key greater than every key starting with `prefix`.
fn successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    while let Some(last) = next.pop() {
        if last < u8::MAX {
            next.push(last + 1);
            return Some(next);
        }
    }
    None
}

/// Rank of the first key not below `key`.
fn rank(tree: &Tree<'_>, key: &[u8]) -> Result<u64, EngineError> {
    Ok(tree
        .descend(&SearchKey::new(key, &[]))?
        .map_or(0, |(cursor, _)| cursor.key_index))
}

fn to_usize(len: u64) -> Result<usize, EngineError> {
    usize::try_from(len).map_err(|_| EngineError::internal(format!("length {len} exceeds memory")))
}

impl Transaction {
    pub(crate) fn read(engine: Arc<EngineInner>) -> Self {
        let snapshot = engine.acquire_snapshot();
        tracing::trace!("read transaction at version {}", snapshot.transaction_number());
        Self {
            engine,
            snapshot: Some(snapshot),
            mode: Mode::ReadOnly,
            prefix: Vec::new(),
            cursor: None,
        }
    }

    /// Pre-conditions:
    /// - `permit` was just granted, so the current version cannot change
    ///   before the snapshot is taken.
    pub(crate) fn write(engine: Arc<EngineInner>, permit: WriterPermit) -> Self {
        let snapshot = engine.acquire_snapshot();
        let ws = WriteState::new(snapshot.state.next());
        tracing::debug!("write transaction {} started", ws.state.transaction_counter);
        Self {
            engine,
            snapshot: Some(snapshot),
            mode: Mode::Write(Box::new(WriteSession { ws, _permit: permit })),
            prefix: Vec::new(),
            cursor: None,
        }
    }

    fn snapshot(&self) -> Result<&Arc<ReadTrLink>, EngineError> {
        self.snapshot.as_ref().ok_or(FINISHED)
    }

    /// The State this transaction sees, including its own changes.
    fn state(&self) -> Result<&State, EngineError> {
        match &self.mode {
            Mode::Write(session) => Ok(&session.ws.state),
            Mode::ReadOnly => Ok(&self.snapshot()?.state),
            Mode::Finished => Err(FINISHED),
        }
    }

    fn tree(&self) -> Result<Tree<'_>, EngineError> {
        let store = &self.engine.store;
        match &self.mode {
            Mode::Write(session) => Ok(Tree::new(
                Reader::new(store, Some(&session.ws.arena)),
                &session.ws.state,
            )),
            Mode::ReadOnly => Ok(Tree::new(Reader::new(store, None), &self.snapshot()?.state)),
            Mode::Finished => Err(FINISHED),
        }
    }

    fn current(&self) -> Result<&Cursor, EngineError> {
        if matches!(self.mode, Mode::Finished) {
            return Err(FINISHED);
        }
        self.cursor.as_ref().ok_or(NO_CURRENT_KEY)
    }

    fn upgrade(&mut self) -> Result<(), EngineError> {
        match self.mode {
            Mode::Write(_) => Ok(()),
            Mode::Finished => Err(FINISHED),
            Mode::ReadOnly => {
                let snapshot = self.snapshot()?;
                let permit = self.engine.try_acquire_writer(snapshot)?;
                let ws = WriteState::new(snapshot.state.next());
                tracing::debug!(
                    "read transaction upgraded to write transaction {}",
                    ws.state.transaction_counter
                );
                self.mode = Mode::Write(Box::new(WriteSession { ws, _permit: permit }));
                Ok(())
            }
        }
    }

    fn writer(&mut self) -> Result<(Writer<'_>, &dyn Tweaks), EngineError> {
        self.upgrade()?;
        match &mut self.mode {
            Mode::Write(session) => Ok((
                Writer::new(&self.engine.store, &mut session.ws),
                self.engine.tweaks.as_ref(),
            )),
            _ => Err(EngineError::internal("upgraded transaction has no write state")),
        }
    }

    /// Point the cursor at the entry with absolute rank `key_index`.
    fn reposition(&mut self, key_index: u64) -> Result<(), EngineError> {
        let cursor = self.tree()?.descend_by_index(key_index)?;
        self.cursor = Some(cursor);
        Ok(())
    }

    fn in_prefix(&self, tree: &Tree<'_>, cursor: &Cursor) -> Result<bool, EngineError> {
        if self.prefix.is_empty() {
            return Ok(true);
        }
        Ok(SearchKey::starts_with(&tree.key(cursor)?, &self.prefix))
    }

    /// Absolute ranks `[start, end)` of the keys under the prefix.
    fn prefix_bounds(&self, tree: &Tree<'_>) -> Result<(u64, u64), EngineError> {
        if self.prefix.is_empty() {
            return Ok((0, tree.keys()));
        }
        let start = rank(tree, &self.prefix)?;
        let end = match successor(&self.prefix) {
            Some(next) => rank(tree, &next)?,
            None => tree.keys(),
        };
        Ok((start, end))
    }

    /// Entry at or after the insertion point `at`.
    fn next_from(tree: &Tree<'_>, at: &Cursor) -> Result<Option<Cursor>, EngineError> {
        if at.leaf.index < tree.leaf_len(at)? {
            return Ok(Some(at.clone()));
        }
        let mut last = at.clone();
        last.leaf.index -= 1;
        last.key_index -= 1;
        tree.next(&last)
    }

    fn filtered(&self, tree: &Tree<'_>, cursor: Option<Cursor>) -> Result<Option<Cursor>, EngineError> {
        match cursor {
            Some(cursor) if self.in_prefix(tree, &cursor)? => Ok(Some(cursor)),
            _ => Ok(None),
        }
    }

    /// Select `key` as the current key, or a neighbour as `strategy` allows.
    ///
    /// # Errors
    ///
    /// [`FindKeyStrategy::Create`] fails with a conflict when the
    /// transaction cannot become the writer.
    pub fn find_key(&mut self, key: &[u8], strategy: FindKeyStrategy) -> Result<FindResult, EngineError> {
        self.cursor = None;
        let tree = self.tree()?;
        let found = tree.descend(&SearchKey::new(&self.prefix, key))?;

        let Some((at, exact)) = found else {
            if strategy != FindKeyStrategy::Create {
                return Ok(FindResult::NotFound);
            }
            return self.create(None, key);
        };
        if exact {
            self.cursor = Some(at);
            return Ok(FindResult::FoundExact);
        }

        let (first, second) = match strategy {
            FindKeyStrategy::ExactMatch => return Ok(FindResult::NotFound),
            FindKeyStrategy::Create => return self.create(Some(&at), key),
            FindKeyStrategy::PreferNext => (true, Some(false)),
            FindKeyStrategy::PreferPrevious => (false, Some(true)),
            FindKeyStrategy::OnlyNext => (true, None),
            FindKeyStrategy::OnlyPrevious => (false, None),
        };
        for next in std::iter::once(first).chain(second) {
            let candidate = if next {
                Self::next_from(&tree, &at)?
            } else {
                tree.previous(&at)?
            };
            let candidate = self.filtered(&tree, candidate)?;
            if let Some(cursor) = candidate {
                self.cursor = Some(cursor);
                return Ok(if next {
                    FindResult::FoundNext
                } else {
                    FindResult::FoundPrevious
                });
            }
        }
        Ok(FindResult::NotFound)
    }

    fn create(&mut self, at: Option<&Cursor>, key: &[u8]) -> Result<FindResult, EngineError> {
        let mut full = self.prefix.clone();
        full.extend_from_slice(key);
        let key_index = at.map_or(0, |cursor| cursor.key_index);

        let (mut w, tweaks) = self.writer()?;
        mutate::insert(&mut w, tweaks, at, &full)?;
        self.reposition(key_index)?;
        Ok(FindResult::Created)
    }

    /// Select the first key under the prefix.
    pub fn find_first_key(&mut self) -> Result<bool, EngineError> {
        Ok(self.find_key(&[], FindKeyStrategy::OnlyNext)?.is_found())
    }

    /// Select the last key under the prefix.
    pub fn find_last_key(&mut self) -> Result<bool, EngineError> {
        self.cursor = None;
        let tree = self.tree()?;
        let candidate = match successor(&self.prefix) {
            Some(next) => match tree.descend(&SearchKey::new(&next, &[]))? {
                Some((at, _)) => tree.previous(&at)?,
                None => None,
            },
            None => tree.last()?,
        };
        let cursor = self.filtered(&tree, candidate)?;
        let found = cursor.is_some();
        self.cursor = cursor;
        Ok(found)
    }

    /// Move to the following key. On `false` the current key is unchanged.
    pub fn find_next_key(&mut self) -> Result<bool, EngineError> {
        let current = self.current()?;
        let tree = self.tree()?;
        let candidate = tree.next(current)?;
        let Some(cursor) = self.filtered(&tree, candidate)? else {
            return Ok(false);
        };
        self.cursor = Some(cursor);
        Ok(true)
    }

    /// Move to the preceding key. On `false` the current key is unchanged.
    pub fn find_previous_key(&mut self) -> Result<bool, EngineError> {
        let current = self.current()?;
        let tree = self.tree()?;
        let candidate = tree.previous(current)?;
        let Some(cursor) = self.filtered(&tree, candidate)? else {
            return Ok(false);
        };
        self.cursor = Some(cursor);
        Ok(true)
    }

    /// Current key without the prefix.
    pub fn get_key(&self) -> Result<Vec<u8>, EngineError> {
        let key = self.tree()?.key(self.current()?)?;
        key.get(self.prefix.len()..)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| EngineError::internal("current key is shorter than the prefix"))
    }

    pub fn get_key_size(&self) -> Result<u64, EngineError> {
        let (_, layout) = self.tree()?.entry(self.current()?)?;
        Ok(layout.key_len - self.prefix.len() as u64)
    }

    pub fn get_value_size(&self) -> Result<u64, EngineError> {
        let (_, layout) = self.tree()?.entry(self.current()?)?;
        Ok(layout.value_len)
    }

    /// Fill `buf` with value bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidOperation`] when the range passes the
    /// end of the value.
    pub fn read_value(&self, offset: u64, buf: &mut [u8]) -> Result<(), EngineError> {
        self.tree()?.read_value(self.current()?, offset, buf)
    }

    /// The whole value of the current key.
    pub fn get_value(&self) -> Result<Vec<u8>, EngineError> {
        let mut value = vec![0u8; to_usize(self.get_value_size()?)?];
        self.read_value(0, &mut value)?;
        Ok(value)
    }

    /// Grow (zero-filled) or truncate the current value.
    pub fn set_value_size(&mut self, len: u64) -> Result<(), EngineError> {
        let cursor = self.current()?.clone();
        let (mut w, tweaks) = self.writer()?;
        mutate::set_value_size(&mut w, tweaks, &cursor, len)?;
        self.reposition(cursor.key_index)
    }

    /// Overwrite value bytes in place; the value length does not change.
    pub fn write_value(&mut self, offset: u64, data: &[u8]) -> Result<(), EngineError> {
        let len = self.get_value_size()?;
        if offset.checked_add(data.len() as u64).is_none_or(|end| end > len) {
            return Err(EngineError::InvalidOperation("value write past its end"));
        }
        let cursor = self.current()?.clone();
        let (mut w, _) = self.writer()?;
        mutate::write_value(&mut w, &cursor, offset, data)?;
        self.reposition(cursor.key_index)
    }

    /// Replace the current value.
    pub fn set_value(&mut self, value: &[u8]) -> Result<(), EngineError> {
        self.set_value_size(value.len() as u64)?;
        self.write_value(0, value)
    }

    /// Insert or overwrite `key`; returns whether the key was created.
    pub fn create_or_update(&mut self, key: &[u8], value: &[u8]) -> Result<bool, EngineError> {
        let created = self.find_key(key, FindKeyStrategy::Create)? == FindResult::Created;
        self.set_value(value)?;
        Ok(created)
    }

    /// Remove the current key. Afterwards there is no current key.
    pub fn erase_current(&mut self) -> Result<(), EngineError> {
        let cursor = self.current()?.clone();
        let (mut w, _) = self.writer()?;
        mutate::erase(&mut w, &cursor)?;
        self.cursor = None;
        Ok(())
    }

    /// Remove the keys with prefix-relative ranks `first..=last`.
    ///
    /// Returns the number of removed keys.
    pub fn erase_range(&mut self, first: u64, last: u64) -> Result<u64, EngineError> {
        self.upgrade()?;
        self.cursor = None;
        let (start, end) = {
            let tree = self.tree()?;
            self.prefix_bounds(&tree)?
        };
        let from = start.saturating_add(first);
        if first > last || from >= end {
            return Ok(0);
        }
        let count = start.saturating_add(last).saturating_add(1).min(end) - from;
        for _ in 0..count {
            let cursor = self.tree()?.descend_by_index(from)?;
            let (mut w, _) = self.writer()?;
            mutate::erase(&mut w, &cursor)?;
        }
        tracing::debug!("erased {count} keys from rank {from}");
        Ok(count)
    }

    /// Remove every key under the prefix.
    pub fn erase_all(&mut self) -> Result<u64, EngineError> {
        match self.key_value_count()? {
            0 => Ok(0),
            count => self.erase_range(0, count - 1),
        }
    }

    /// Prefix-relative rank of the current key.
    pub fn get_key_index(&self) -> Result<u64, EngineError> {
        let cursor = self.current()?;
        let (start, _) = self.prefix_bounds(&self.tree()?)?;
        Ok(cursor.key_index - start)
    }

    /// Select the key with prefix-relative rank `index`.
    ///
    /// Returns `false` and clears the current key when `index` is out of range.
    pub fn set_key_index(&mut self, index: u64) -> Result<bool, EngineError> {
        self.cursor = None;
        let (start, end) = self.prefix_bounds(&self.tree()?)?;
        let absolute = start.saturating_add(index);
        if absolute >= end {
            return Ok(false);
        }
        self.reposition(absolute)?;
        Ok(true)
    }

    /// Keys under the prefix.
    pub fn key_value_count(&self) -> Result<u64, EngineError> {
        let (start, end) = self.prefix_bounds(&self.tree()?)?;
        Ok(end - start)
    }

    /// Address every following key operation to `prefix ++ key`.
    ///
    /// Clears the current key.
    pub fn set_key_prefix(&mut self, prefix: &[u8]) {
        self.prefix = prefix.to_vec();
        self.cursor = None;
    }

    #[must_use]
    pub fn key_prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn invalidate_current_key(&mut self) {
        self.cursor = None;
    }

    /// Record an opaque transaction-log location in the committed State.
    pub fn set_transaction_log(&mut self, position: u64, size: u64) -> Result<(), EngineError> {
        let (mut w, _) = self.writer()?;
        let state = w.state_mut();
        state.transaction_log_position = position;
        state.transaction_log_size = size;
        Ok(())
    }

    /// Transaction-log location as `(position, size)`.
    pub fn transaction_log(&self) -> Result<(u64, u64), EngineError> {
        let state = self.state()?;
        Ok((state.transaction_log_position, state.transaction_log_size))
    }

    /// Counter of the version being read, or being written once upgraded.
    pub fn transaction_number(&self) -> Result<u64, EngineError> {
        Ok(self.state()?.transaction_counter)
    }

    #[must_use]
    pub const fn is_writing(&self) -> bool {
        matches!(self.mode, Mode::Write(_))
    }

    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self.mode, Mode::Finished)
    }

    fn release_snapshot(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.engine.release_snapshot(&snapshot);
        }
    }

    /// Make the changes durable and visible to new transactions.
    ///
    /// Committing a transaction that never wrote only ends it. Whether it
    /// succeeds or not, the transaction is finished afterwards.
    ///
    /// # Errors
    ///
    /// Storage failures leave the previous version current.
    pub fn commit(&mut self) -> Result<(), EngineError> {
        let mode = std::mem::replace(&mut self.mode, Mode::Finished);
        self.cursor = None;
        let result = match mode {
            Mode::Finished => return Err(FINISHED),
            Mode::ReadOnly => Ok(()),
            Mode::Write(mut session) => {
                let snapshot = self.snapshot()?;
                self.engine.commit(&mut session.ws, snapshot)
            }
        };
        self.release_snapshot();
        result
    }

    /// Discard all changes and end the transaction.
    pub fn rollback(&mut self) {
        let mode = std::mem::replace(&mut self.mode, Mode::Finished);
        self.cursor = None;
        if let Mode::Write(session) = mode {
            tracing::debug!(
                "write transaction {} rolled back ({} private sectors discarded)",
                session.ws.state.transaction_counter,
                session.ws.arena.len()
            );
        }
        self.release_snapshot();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.is_finished() {
            self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::cursor::node_kind;
    use super::*;
    use crate::alloc;
    use crate::blob;
    use crate::btree::{internal, leaf};
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::sector::{SectorPtr, SectorType};
    use crate::storage::MemoryStorage;
    use crate::testing::{init_tracing, small_engine};

    fn put_all(engine: &Engine, keys: &[Vec<u8>], value: &[u8]) {
        let mut tr = engine.try_start_write_transaction().expect("writer");
        for key in keys {
            tr.create_or_update(key, value).expect("put");
        }
        tr.commit().expect("commit");
    }

    fn numbered(count: u32, step: u32) -> Vec<Vec<u8>> {
        (0..count).map(|i| format!("key{:03}", i * step).into_bytes()).collect()
    }

    fn forward_keys(tr: &mut Transaction) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        if tr.find_first_key().expect("first") {
            loop {
                keys.push(tr.get_key().expect("key"));
                if !tr.find_next_key().expect("next") {
                    break;
                }
            }
        }
        keys
    }

    fn backward_keys(tr: &mut Transaction) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        if tr.find_last_key().expect("last") {
            loop {
                keys.push(tr.get_key().expect("key"));
                if !tr.find_previous_key().expect("previous") {
                    break;
                }
            }
        }
        keys
    }

    /// Check every recorded subtree count against the leaves; returns the total.
    fn check_counts(tree: &Tree<'_>, ptr: SectorPtr, level: usize) -> u64 {
        let view = tree
            .reader()
            .view(ptr, node_kind(level, tree.depth()), level)
            .expect("node");
        if level + 1 == tree.depth() {
            let count = leaf::count(view.data());
            assert!(count > 0, "empty leaf in tree");
            return count as u64;
        }
        let slots = internal::parse(view.data(), tree.reader().format()).expect("parse");
        assert!(!slots.is_empty());
        slots
            .iter()
            .map(|slot| {
                let actual = check_counts(tree, internal::child_ptr(view.data(), slot), level + 1);
                assert_eq!(internal::subtree_count(view.data(), slot), actual);
                actual
            })
            .sum()
    }

    fn assert_counts(tr: &Transaction) {
        let tree = tr.tree().expect("tree");
        let total = if tree.root().is_null() {
            0
        } else {
            check_counts(&tree, tree.root(), 0)
        };
        assert_eq!(total, tree.keys());
    }

    #[test]
    fn test_insert_then_find() {
        init_tracing();
        let engine = Engine::open(MemoryStorage::new(), EngineConfig::default()).expect("open");
        let mut tr = engine.try_start_write_transaction().expect("writer");
        for (key, value) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3")] {
            assert!(tr.create_or_update(key, value).expect("put"));
        }
        tr.commit().expect("commit");

        let mut tr = engine.start_read_transaction();
        assert_eq!(tr.find_key(b"b", FindKeyStrategy::ExactMatch).expect("find"), FindResult::FoundExact);
        assert_eq!(tr.get_value().expect("value"), b"2");
        assert_eq!(tr.get_key_size().expect("key size"), 1);
        assert_eq!(tr.get_value_size().expect("value size"), 1);
        assert_eq!(tr.find_key(b"d", FindKeyStrategy::ExactMatch).expect("find"), FindResult::NotFound);
        assert!(matches!(tr.get_value(), Err(EngineError::InvalidOperation(_))));
    }

    #[test]
    fn test_leaf_split_creates_root_with_one_separator() {
        let (engine, _) = small_engine();
        let mut tr = engine.try_start_write_transaction().expect("writer");
        let mut inserted = 0;
        while tr.state().expect("state").btree_depth < 2 {
            assert!(inserted < 100, "leaf never split");
            tr.create_or_update(format!("key{inserted:02}").as_bytes(), b"v")
                .expect("put");
            inserted += 1;
        }

        let tree = tr.tree().expect("tree");
        let reader = tree.reader();
        let format = reader.format();
        let root = reader.view(tree.root(), SectorType::BTreeInternal, 0).expect("root");
        let slots = internal::parse(root.data(), format).expect("parse");
        assert_eq!(slots.len(), 2);

        let mut tail = |ptr: SectorPtr, len: u64| blob::read_all(reader, ptr, len);
        let separator = slots[1]
            .key
            .as_ref()
            .expect("separator")
            .stored(root.data())
            .to_vec(&mut tail)
            .expect("separator bytes");
        let right = reader
            .view(internal::child_ptr(root.data(), &slots[1]), SectorType::BTreeLeaf, 1)
            .expect("right leaf");
        let first = leaf::layout(right.data(), 0, format)
            .key(right.data())
            .to_vec(&mut tail)
            .expect("first key");
        assert_eq!(separator, first);

        let left_keys = internal::subtree_count(root.data(), &slots[0]);
        let right_keys = internal::subtree_count(root.data(), &slots[1]);
        assert_eq!(left_keys + right_keys, inserted);
        assert_eq!(tree.keys(), inserted);
    }

    #[test]
    fn test_navigation_crosses_leaves() {
        let (engine, _) = small_engine();
        let keys = numbered(60, 2);
        put_all(&engine, &keys, b"0123456789");
        assert!(engine.current_state().btree_depth >= 2);

        let mut tr = engine.start_read_transaction();
        assert_eq!(forward_keys(&mut tr), keys);
        let mut reversed = keys.clone();
        reversed.reverse();
        assert_eq!(backward_keys(&mut tr), reversed);

        for (rank, key) in keys.iter().enumerate() {
            assert!(tr.set_key_index(rank as u64).expect("index"));
            assert_eq!(&tr.get_key().expect("key"), key);
            assert_eq!(tr.get_key_index().expect("rank"), rank as u64);
        }
        assert!(!tr.set_key_index(60).expect("out of range"));
    }

    #[test]
    fn test_neighbour_strategies() {
        let (engine, _) = small_engine();
        let keys = numbered(60, 2);
        put_all(&engine, &keys, b"v");
        let mut tr = engine.start_read_transaction();

        for i in 0..60u32 {
            let missing = format!("key{:03}", i * 2 + 1).into_bytes();
            let next = tr.find_key(&missing, FindKeyStrategy::OnlyNext).expect("next");
            if i < 59 {
                assert_eq!(next, FindResult::FoundNext);
                assert_eq!(tr.get_key().expect("key"), keys[i as usize + 1]);
                assert_eq!(tr.get_key_index().expect("rank"), u64::from(i) + 1);
            } else {
                assert_eq!(next, FindResult::NotFound);
            }

            let previous = tr.find_key(&missing, FindKeyStrategy::OnlyPrevious).expect("previous");
            assert_eq!(previous, FindResult::FoundPrevious);
            assert_eq!(tr.get_key().expect("key"), keys[i as usize]);
        }

        assert_eq!(tr.find_key(b"a", FindKeyStrategy::OnlyPrevious).expect("find"), FindResult::NotFound);
        assert_eq!(tr.find_key(b"a", FindKeyStrategy::PreferPrevious).expect("find"), FindResult::FoundNext);
        assert_eq!(tr.get_key().expect("key"), keys[0]);
        assert_eq!(tr.find_key(b"z", FindKeyStrategy::PreferNext).expect("find"), FindResult::FoundPrevious);
        assert_eq!(tr.get_key().expect("key"), keys[59]);
        assert_eq!(tr.find_key(b"key010", FindKeyStrategy::OnlyNext).expect("find"), FindResult::FoundExact);
    }

    #[test]
    fn test_key_prefix() {
        let (engine, _) = small_engine();
        let keys: Vec<Vec<u8>> = ["a1", "a2", "b1", "b2", "b3", "c1"]
            .iter()
            .map(|key| key.as_bytes().to_vec())
            .collect();
        put_all(&engine, &keys, b"v");

        let mut tr = engine.start_read_transaction();
        tr.set_key_prefix(b"b");
        assert_eq!(tr.key_value_count().expect("count"), 3);
        assert_eq!(forward_keys(&mut tr), vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
        assert_eq!(tr.get_key().expect("key"), b"3");
        assert!(!tr.find_next_key().expect("next"));
        assert_eq!(tr.get_key().expect("still current"), b"3");
        assert_eq!(backward_keys(&mut tr), vec![b"3".to_vec(), b"2".to_vec(), b"1".to_vec()]);

        assert_eq!(tr.find_key(b"0", FindKeyStrategy::OnlyPrevious).expect("find"), FindResult::NotFound);
        assert_eq!(tr.find_key(b"4", FindKeyStrategy::OnlyNext).expect("find"), FindResult::NotFound);
        assert_eq!(tr.find_key(b"4", FindKeyStrategy::PreferNext).expect("find"), FindResult::FoundPrevious);
        assert_eq!(tr.get_key().expect("key"), b"3");
        assert_eq!(tr.find_key(b"2", FindKeyStrategy::ExactMatch).expect("find"), FindResult::FoundExact);
        assert_eq!(tr.get_key_index().expect("rank"), 1);
        assert!(tr.set_key_index(2).expect("index"));
        assert_eq!(tr.get_key().expect("key"), b"3");
        assert!(!tr.set_key_index(3).expect("out of range"));

        assert!(tr.create_or_update(b"9", b"x").expect("insert"));
        assert_eq!(tr.key_value_count().expect("count"), 4);
        assert_eq!(tr.erase_all().expect("erase"), 4);
        tr.set_key_prefix(b"");
        assert_eq!(forward_keys(&mut tr), vec![b"a1".to_vec(), b"a2".to_vec(), b"c1".to_vec()]);

        tr.set_key_prefix(b"x");
        assert!(!tr.find_first_key().expect("first"));
        assert!(!tr.find_last_key().expect("last"));
    }

    #[test]
    fn test_prefix_of_max_bytes() {
        assert_eq!(successor(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(successor(&[1, 0xff]), Some(vec![2]));
        assert_eq!(successor(&[0xff, 0xff]), None);

        let (engine, _) = small_engine();
        put_all(&engine, &[vec![0xff, 1], vec![0xff, 2], vec![1]], b"v");
        let mut tr = engine.start_read_transaction();
        tr.set_key_prefix(&[0xff]);
        assert_eq!(tr.key_value_count().expect("count"), 2);
        assert!(tr.find_last_key().expect("last"));
        assert_eq!(tr.get_key().expect("key"), vec![2]);
    }

    #[test]
    fn test_erase_range_and_collapse() {
        let (engine, storage) = small_engine();
        let keys = numbered(80, 1);
        put_all(&engine, &keys, b"value");
        let grown_depth = engine.current_state().btree_depth;
        assert!(grown_depth >= 3);

        let mut tr = engine.try_start_write_transaction().expect("writer");
        assert_eq!(tr.erase_range(10, 69).expect("erase"), 60);
        assert_counts(&tr);
        let mut expected = keys[..10].to_vec();
        expected.extend_from_slice(&keys[70..]);
        assert_eq!(forward_keys(&mut tr), expected);
        assert_eq!(tr.erase_range(5, 4).expect("empty range"), 0);
        assert_eq!(tr.erase_range(20, 30).expect("past the end"), 0);
        tr.commit().expect("commit");
        assert_eq!(engine.current_state().key_value_count, 20);
        assert!(engine.current_state().btree_depth <= grown_depth);

        let mut tr = engine.try_start_write_transaction().expect("writer");
        assert_eq!(tr.erase_all().expect("erase"), 20);
        assert!(!tr.find_first_key().expect("first"));
        tr.commit().expect("commit");

        let state = engine.current_state();
        assert!(state.btree_root.is_null());
        assert_eq!(state.btree_depth, 0);
        assert_eq!(state.key_value_count, 0);

        let reopened = Engine::open(storage, crate::testing::small_config()).expect("reopen");
        let reader = Reader::new(&reopened.inner().store, None);
        let state = reopened.current_state();
        assert_eq!(alloc::count_used(reader, &state).expect("count"), state.used_size);
    }

    #[test]
    fn test_erase_current() {
        let (engine, _) = small_engine();
        let keys = numbered(30, 1);
        put_all(&engine, &keys, &[5u8; 40]);

        let mut tr = engine.start_read_transaction();
        assert!(matches!(tr.erase_current(), Err(EngineError::InvalidOperation(_))));
        for key in keys.iter().step_by(2) {
            assert_eq!(tr.find_key(key, FindKeyStrategy::ExactMatch).expect("find"), FindResult::FoundExact);
            tr.erase_current().expect("erase");
            assert!(tr.is_writing());
        }
        assert_counts(&tr);
        let odd: Vec<Vec<u8>> = keys.iter().skip(1).step_by(2).cloned().collect();
        assert_eq!(forward_keys(&mut tr), odd);
        tr.commit().expect("commit");
        assert_eq!(engine.current_state().key_value_count, 15);
    }

    #[test]
    fn test_value_resize_transitions() {
        let (engine, _) = small_engine();
        let mut tr = engine.try_start_write_transaction().expect("writer");
        // Long enough for the key to spill out of the node as well.
        let key = b"a key longer than the inline cap";
        tr.find_key(key, FindKeyStrategy::Create).expect("create");
        let mut model = b"0123456789".to_vec();
        tr.set_value(&model).expect("inline");

        let check = |tr: &mut Transaction, model: &[u8]| {
            assert_eq!(tr.get_value_size().expect("size"), model.len() as u64);
            assert_eq!(tr.get_value().expect("value"), model);
            assert_eq!(tr.get_key().expect("key"), key);
        };
        check(&mut tr, &model);

        for (len, offset, patch) in [
            (40usize, 20usize, vec![b'a'; 3]),
            (5000, 4500, vec![9u8; 100]),
            (1_100_000, 1_099_000, vec![7u8; 1000]),
            (100, 90, vec![1u8; 10]),
            (8, 0, vec![2u8; 8]),
        ] {
            tr.set_value_size(len as u64).expect("resize");
            model.resize(len, 0);
            check(&mut tr, &model);
            tr.write_value(offset as u64, &patch).expect("write");
            model[offset..offset + patch.len()].copy_from_slice(&patch);
            check(&mut tr, &model);
        }

        let mut part = [0u8; 4];
        tr.read_value(4, &mut part).expect("read");
        assert_eq!(part, [2u8; 4]);
        assert!(matches!(
            tr.read_value(6, &mut part),
            Err(EngineError::InvalidOperation(_))
        ));
        assert!(matches!(
            tr.write_value(6, &part),
            Err(EngineError::InvalidOperation(_))
        ));
        tr.commit().expect("commit");

        let mut tr = engine.start_read_transaction();
        assert_eq!(tr.find_key(key, FindKeyStrategy::ExactMatch).expect("find"), FindResult::FoundExact);
        assert_eq!(tr.get_value().expect("value"), model);
        tr.set_value_size(0).expect("empty");
        assert!(tr.get_value().expect("value").is_empty());
    }

    #[test]
    fn test_value_ranges_past_the_end_are_rejected() {
        let (engine, _) = small_engine();
        let mut tr = engine.try_start_write_transaction().expect("writer");
        tr.create_or_update(b"k", b"abc").expect("put");
        tr.commit().expect("commit");

        let mut tr = engine.start_read_transaction();
        assert_eq!(tr.find_key(b"k", FindKeyStrategy::ExactMatch).expect("find"), FindResult::FoundExact);
        let mut buf = [0u8; 2];
        assert!(matches!(
            tr.read_value(u64::MAX, &mut buf),
            Err(EngineError::InvalidOperation(_))
        ));
        assert!(matches!(
            tr.write_value(u64::MAX, &[1u8; 2]),
            Err(EngineError::InvalidOperation(_))
        ));
        assert!(matches!(
            tr.write_value(u64::MAX - 1, &[1u8; 2]),
            Err(EngineError::InvalidOperation(_))
        ));
        assert!(!tr.is_writing());
        assert_eq!(tr.get_value().expect("value"), b"abc");

        // Same with a value that lives in a blob.
        tr.set_value(&[5u8; 5000]).expect("blob value");
        assert!(matches!(
            tr.read_value(u64::MAX - 1, &mut buf),
            Err(EngineError::InvalidOperation(_))
        ));
        assert!(matches!(
            tr.write_value(u64::MAX, &[1u8; 2]),
            Err(EngineError::InvalidOperation(_))
        ));
        tr.read_value(4998, &mut buf).expect("tail");
        assert_eq!(buf, [5u8; 2]);
    }

    #[test]
    fn test_random_operations_match_btreemap() {
        let (engine, _) = small_engine();
        let mut rng = StdRng::seed_from_u64(0x5ec7);
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        for _round in 0..6 {
            let mut tr = engine.try_start_write_transaction().expect("writer");
            for _ in 0..80 {
                if !model.is_empty() && rng.random_bool(0.25) {
                    let nth = rng.random_range(0..model.len());
                    let key = model.keys().nth(nth).cloned().expect("key");
                    assert_eq!(tr.find_key(&key, FindKeyStrategy::ExactMatch).expect("find"), FindResult::FoundExact);
                    tr.erase_current().expect("erase");
                    model.remove(&key);
                } else {
                    let key_len = rng.random_range(1..=20);
                    let key: Vec<u8> = (0..key_len).map(|_| rng.random_range(b'a'..=b'e')).collect();
                    let value: Vec<u8> = (0..rng.random_range(0..60)).map(|_| rng.random()).collect();
                    let created = tr.create_or_update(&key, &value).expect("put");
                    assert_eq!(created, model.insert(key, value).is_none());
                }
            }
            assert_counts(&tr);
            tr.commit().expect("commit");

            let mut tr = engine.start_read_transaction();
            assert_eq!(tr.key_value_count().expect("count"), model.len() as u64);
            let expected: Vec<Vec<u8>> = model.keys().cloned().collect();
            assert_eq!(forward_keys(&mut tr), expected);
            for (rank, (key, value)) in model.iter().enumerate().step_by(7) {
                assert!(tr.set_key_index(rank as u64).expect("index"));
                assert_eq!(&tr.get_key().expect("key"), key);
                assert_eq!(&tr.get_value().expect("value"), value);
            }
            assert_counts(&tr);
        }
    }

    #[test]
    fn test_rollback_discards_changes() {
        let (engine, _) = small_engine();
        put_all(&engine, &[b"kept".to_vec()], b"1");
        {
            let mut tr = engine.try_start_write_transaction().expect("writer");
            tr.create_or_update(b"dropped", b"2").expect("put");
            tr.find_key(b"kept", FindKeyStrategy::ExactMatch).expect("find");
            tr.erase_current().expect("erase");
        }
        let mut tr = engine.try_start_write_transaction().expect("slot released");
        assert_eq!(tr.find_key(b"dropped", FindKeyStrategy::ExactMatch).expect("find"), FindResult::NotFound);
        assert_eq!(tr.find_key(b"kept", FindKeyStrategy::ExactMatch).expect("find"), FindResult::FoundExact);
        tr.rollback();
        assert!(tr.is_finished());
        assert_eq!(engine.current_state().transaction_counter, 1);
    }

    #[test]
    fn test_finished_transaction_rejects_operations() {
        let (engine, _) = small_engine();
        let mut tr = engine.try_start_write_transaction().expect("writer");
        tr.create_or_update(b"k", b"v").expect("put");
        tr.commit().expect("commit");

        assert!(matches!(tr.commit(), Err(EngineError::InvalidOperation(_))));
        assert!(matches!(tr.find_key(b"k", FindKeyStrategy::ExactMatch), Err(EngineError::InvalidOperation(_))));
        assert!(matches!(tr.create_or_update(b"k", b"w"), Err(EngineError::InvalidOperation(_))));
        assert!(matches!(tr.set_value_size(3), Err(EngineError::InvalidOperation(_))));

        let mut reader = engine.start_read_transaction();
        reader.commit().expect("read-only commit");
        assert!(reader.is_finished());
    }

    #[test]
    fn test_transaction_log_slot() {
        let (engine, _) = small_engine();
        let mut tr = engine.start_read_transaction();
        assert_eq!(tr.transaction_log().expect("log"), (0, 0));
        tr.set_transaction_log(4096, 100).expect("log");
        assert!(tr.is_writing());
        assert_eq!(tr.transaction_number().expect("number"), 1);
        tr.commit().expect("commit");

        let state = engine.current_state();
        assert_eq!(state.transaction_counter, 1);
        assert_eq!(state.transaction_log_position, 4096);
        let tr = engine.start_read_transaction();
        assert_eq!(tr.transaction_log().expect("log"), (4096, 100));
    }
}
