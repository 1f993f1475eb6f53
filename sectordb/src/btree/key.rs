//! Key comparison shared by leaf and internal nodes.

use std::cmp::Ordering;

use crate::error::EngineError;
use crate::sector::{SECTOR_PTR_SIZE, SectorPtr};

/// Callback returning the externalized tail of a stored key.
///
/// Arguments are the blob pointer and the tail length in bytes.
pub type KeyTail<'a> = dyn FnMut(SectorPtr, u64) -> Result<Vec<u8>, EngineError> + 'a;

/// A search key made of a transaction prefix and a caller key.
#[derive(Debug, Clone, Copy)]
pub struct SearchKey<'a> {
    prefix: &'a [u8],
    suffix: &'a [u8],
}

impl<'a> SearchKey<'a> {
    #[must_use]
    pub const fn new(prefix: &'a [u8], suffix: &'a [u8]) -> Self {
        Self { prefix, suffix }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.prefix.len() + self.suffix.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes from `start` to the end of the key.
    pub fn bytes_from(&self, start: usize) -> impl Iterator<Item = u8> + '_ {
        let prefix_skip = start.min(self.prefix.len());
        let suffix_skip = start.saturating_sub(self.prefix.len());
        self.prefix[prefix_skip..]
            .iter()
            .chain(&self.suffix[suffix_skip.min(self.suffix.len())..])
            .copied()
    }

    /// Concatenated key bytes.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes_from(0).collect()
    }

    /// Whether the key begins with `prefix`.
    #[must_use]
    pub fn starts_with(key: &[u8], prefix: &[u8]) -> bool {
        key.len() >= prefix.len() && &key[..prefix.len()] == prefix
    }
}

/// A key as stored in a node.
#[derive(Debug, Clone, Copy)]
pub struct StoredKey<'a> {
    /// Full key length.
    pub len: u64,
    /// Inline bytes (a prefix of the key).
    pub inline: &'a [u8],
    /// Blob holding the remaining `len - inline.len()` bytes.
    pub ext: Option<SectorPtr>,
}

impl StoredKey<'_> {
    /// Full key bytes, fetching the tail when externalized.
    pub fn to_vec(&self, tail: &mut KeyTail<'_>) -> Result<Vec<u8>, EngineError> {
        let mut key = self.inline.to_vec();
        if let Some(ptr) = self.ext {
            key.extend(tail(ptr, self.len - self.inline.len() as u64)?);
        }
        Ok(key)
    }
}

fn compare_bytes(search: impl Iterator<Item = u8>, stored: &[u8]) -> Ordering {
    for (a, &b) in search.zip(stored) {
        match a.cmp(&b) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

/// Order of `search` relative to `stored`.
///
/// Bytes are compared lexicographically; the externalized tail is only
/// fetched when every inline byte ties and the search key is longer than
/// the inline part. Remaining ties are broken by length, shorter first.
pub fn compare_key(
    search: &SearchKey<'_>,
    stored: &StoredKey<'_>,
    tail: &mut KeyTail<'_>,
) -> Result<Ordering, EngineError> {
    let ordering = compare_bytes(search.bytes_from(0), stored.inline);
    if ordering != Ordering::Equal {
        return Ok(ordering);
    }

    if let Some(ptr) = stored.ext {
        let inline_len = stored.inline.len();
        if search.len() > inline_len {
            let rest = tail(ptr, stored.len - inline_len as u64)?;
            let ordering = compare_bytes(search.bytes_from(inline_len), &rest);
            if ordering != Ordering::Equal {
                return Ok(ordering);
            }
        }
    }

    Ok((search.len() as u64).cmp(&stored.len))
}

/// Encode `(key_len u32, inline bytes, [ext ptr])`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_key_part(key_len: u64, inline: &[u8], ext: Option<SectorPtr>) -> Vec<u8> {
    let mut part = Vec::with_capacity(4 + inline.len() + SECTOR_PTR_SIZE);
    part.extend_from_slice(&(key_len as u32).to_le_bytes());
    part.extend_from_slice(inline);
    if let Some(ptr) = ext {
        part.extend_from_slice(&ptr.to_bytes());
    }
    part
}
