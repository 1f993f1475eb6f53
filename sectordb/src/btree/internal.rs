//! Internal node codec.
//!
//! Layout:
//! - header: 1 byte, `128 + child_count`
//! - first child pointer (12 bytes) and its subtree key count (8 bytes)
//! - `child_count - 1` entries, each:
//!   - `key_len`: 4 bytes
//!   - inline separator bytes (at most `key_inline_cap`)
//!   - separator blob pointer, only when the key is longer than the cap
//!   - child pointer: 12 bytes
//!   - subtree key count: 8 bytes
//!
//! Child `i` (for `i >= 1`) holds keys greater than or equal to its
//! separator; child 0 holds everything smaller than the first separator.
//! The per-child key counts are kept exact so rank queries can descend
//! without scanning subtrees.

#![allow(clippy::cast_possible_truncation)]

use std::cmp::Ordering;
use std::ops::Range;

use crate::btree::key::{KeyTail, SearchKey, StoredKey, compare_key};
use crate::btree::leaf::inline_len;
use crate::config::{Format, MAX_INTERNAL_CHILDREN};
use crate::error::EngineError;
use crate::sector::{SECTOR_PTR_SIZE, SectorPtr, bytes};

/// Header byte marker for internal nodes.
const HEADER_BASE: u8 = 128;

/// Child pointer plus subtree key count.
const CHILD_SIZE: usize = SECTOR_PTR_SIZE + 8;

/// Positions of one separator key within the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySlot {
    /// Whole encoded key part (length, inline bytes, optional pointer).
    pub range: Range<usize>,
    pub len: u64,
    pub inline: Range<usize>,
    pub ext: Option<usize>,
}

impl KeySlot {
    #[must_use]
    pub fn stored<'a>(&self, data: &'a [u8]) -> StoredKey<'a> {
        StoredKey {
            len: self.len,
            inline: &data[self.inline.clone()],
            ext: self.ext.map(|offset| SectorPtr::read(data, offset)),
        }
    }
}

/// Positions of one child within the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSlot {
    /// Separator; `None` for the first child.
    pub key: Option<KeySlot>,
    pub ptr_offset: usize,
    pub count_offset: usize,
}

/// Decoded child, used to rebuild nodes during splits and removals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    /// Encoded key part; empty for the first child.
    pub key: Vec<u8>,
    pub child: SectorPtr,
    pub keys: u64,
}

/// Number of children.
pub fn count(data: &[u8]) -> Result<usize, EngineError> {
    let header = data[0];
    if header <= HEADER_BASE {
        return Err(EngineError::corruption(format!(
            "invalid internal node header 0x{header:02x}"
        )));
    }
    Ok(usize::from(header - HEADER_BASE))
}

/// Decode child and separator positions.
pub fn parse(data: &[u8], format: &Format) -> Result<Vec<ChildSlot>, EngineError> {
    let n = count(data)?;
    let mut slots = Vec::with_capacity(n);
    let mut offset = 1;
    slots.push(ChildSlot {
        key: None,
        ptr_offset: offset,
        count_offset: offset + SECTOR_PTR_SIZE,
    });
    offset += CHILD_SIZE;

    for _ in 1..n {
        let start = offset;
        if offset + 4 > data.len() {
            return Err(EngineError::corruption("internal node entry out of bounds"));
        }
        let len = u64::from(bytes::read_u32(data, offset));
        offset += 4;
        let inline_bytes = inline_len(len, format.key_inline_cap);
        let inline = offset..offset + inline_bytes;
        offset += inline_bytes;
        let ext = (len > inline_bytes as u64).then_some(offset);
        if ext.is_some() {
            offset += SECTOR_PTR_SIZE;
        }
        if offset + CHILD_SIZE > data.len() {
            return Err(EngineError::corruption("internal node entry out of bounds"));
        }
        slots.push(ChildSlot {
            key: Some(KeySlot {
                range: start..offset,
                len,
                inline,
                ext,
            }),
            ptr_offset: offset,
            count_offset: offset + SECTOR_PTR_SIZE,
        });
        offset += CHILD_SIZE;
    }
    Ok(slots)
}

#[must_use]
pub fn child_ptr(data: &[u8], slot: &ChildSlot) -> SectorPtr {
    SectorPtr::read(data, slot.ptr_offset)
}

#[must_use]
pub fn subtree_count(data: &[u8], slot: &ChildSlot) -> u64 {
    bytes::read_u64(data, slot.count_offset)
}

pub fn set_subtree_count(data: &mut [u8], slot: &ChildSlot, keys: u64) {
    bytes::write_u64(data, slot.count_offset, keys);
}

/// Adjust one child's key count by `delta`.
pub fn add_to_subtree_count(data: &mut [u8], slot: &ChildSlot, delta: i64) -> Result<(), EngineError> {
    let current = subtree_count(data, slot);
    let updated = current
        .checked_add_signed(delta)
        .ok_or_else(|| EngineError::internal(format!("subtree count {current} cannot change by {delta}")))?;
    set_subtree_count(data, slot, updated);
    Ok(())
}

/// Decode every child into owned entries.
pub fn entries(data: &[u8], format: &Format) -> Result<Vec<ChildEntry>, EngineError> {
    Ok(parse(data, format)?
        .iter()
        .map(|slot| ChildEntry {
            key: slot
                .key
                .as_ref()
                .map(|key| data[key.range.clone()].to_vec())
                .unwrap_or_default(),
            child: child_ptr(data, slot),
            keys: subtree_count(data, slot),
        })
        .collect())
}

/// Encoded size of a node holding `children`.
#[must_use]
pub fn encoded_size(children: &[ChildEntry]) -> usize {
    1 + children.len() * CHILD_SIZE + children.iter().skip(1).map(|c| c.key.len()).sum::<usize>()
}

/// Encode a node. The first child's key part is ignored.
pub fn build(children: &[ChildEntry]) -> Result<Vec<u8>, EngineError> {
    if children.is_empty() || children.len() > MAX_INTERNAL_CHILDREN {
        return Err(EngineError::internal(format!(
            "internal node cannot hold {} children",
            children.len()
        )));
    }
    let mut data = Vec::with_capacity(encoded_size(children));
    data.push(HEADER_BASE + children.len() as u8);
    for (i, entry) in children.iter().enumerate() {
        if i > 0 {
            data.extend_from_slice(&entry.key);
        }
        data.extend_from_slice(&entry.child.to_bytes());
        data.extend_from_slice(&entry.keys.to_le_bytes());
    }
    Ok(data)
}

/// Child to descend into when searching for `key`.
pub fn find_child(
    data: &[u8],
    format: &Format,
    key: &SearchKey<'_>,
    tail: &mut KeyTail<'_>,
) -> Result<usize, EngineError> {
    let slots = parse(data, format)?;
    let mut low = 1;
    let mut high = slots.len();
    while low < high {
        let mid = low + (high - low) / 2;
        let separator = slots[mid]
            .key
            .as_ref()
            .ok_or_else(|| EngineError::internal("separator missing"))?;
        if compare_key(key, &separator.stored(data), tail)? == Ordering::Less {
            high = mid;
        } else {
            low = mid + 1;
        }
    }
    Ok(low - 1)
}

/// Child holding the key with rank `index` within this subtree.
///
/// Returns the child index and the rank relative to that child.
pub fn find_child_by_index(data: &[u8], format: &Format, index: u64) -> Result<(usize, u64), EngineError> {
    let mut remaining = index;
    for (i, slot) in parse(data, format)?.iter().enumerate() {
        let keys = subtree_count(data, slot);
        if remaining < keys {
            return Ok((i, remaining));
        }
        remaining -= keys;
    }
    Err(EngineError::internal(format!(
        "key index {index} beyond subtree"
    )))
}

/// Keys stored in children before `child`.
pub fn keys_before(data: &[u8], slots: &[ChildSlot], child: usize) -> u64 {
    slots[..child].iter().map(|slot| subtree_count(data, slot)).sum()
}

/// Offsets of every pointer stored in the node: children and separator blobs.
pub fn ptr_offsets(data: &[u8], format: &Format) -> Result<Vec<usize>, EngineError> {
    let mut offsets = Vec::new();
    for slot in parse(data, format)? {
        if let Some(ext) = slot.key.and_then(|key| key.ext) {
            offsets.push(ext);
        }
        offsets.push(slot.ptr_offset);
    }
    Ok(offsets)
}

/// Child index where the node splits closest to its byte midpoint.
///
/// The separator of the returned child moves up to the parent. Requires at
/// least two children.
#[must_use]
pub fn split_point(children: &[ChildEntry]) -> usize {
    let total = encoded_size(children);
    let mut best = 1;
    let mut best_distance = usize::MAX;
    for m in 1..children.len() {
        let left = encoded_size(&children[..m]);
        let distance = (2 * left).abs_diff(total);
        if distance < best_distance {
            best = m;
            best_distance = distance;
        }
    }
    best
}

/// Blob pointer inside an encoded key part, if the key is externalized.
#[must_use]
pub fn key_part_ext(part: &[u8], format: &Format) -> Option<SectorPtr> {
    if part.len() < 4 {
        return None;
    }
    let len = u64::from(bytes::read_u32(part, 0));
    let inline = inline_len(len, format.key_inline_cap);
    (len > inline as u64).then(|| SectorPtr::read(part, 4 + inline))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::key::encode_key_part;

    fn format() -> Format {
        Format {
            key_inline_cap: 4,
            value_inline_cap: 8,
            alloc_leaf_bytes: 256,
        }
    }

    fn child(position: i64, key: &[u8], keys: u64) -> ChildEntry {
        ChildEntry {
            key: if key.is_empty() {
                Vec::new()
            } else {
                encode_key_part(key.len() as u64, key, None)
            },
            child: SectorPtr::with_length(position, 256, 0),
            keys,
        }
    }

    fn node() -> Vec<u8> {
        build(&[
            child(1024, b"", 3),
            child(2048, b"d", 2),
            child(3072, b"g", 4),
        ])
        .expect("build")
    }

    fn find(data: &[u8], key: &[u8]) -> usize {
        let mut tail = |_: SectorPtr, _: u64| Err::<Vec<u8>, _>(EngineError::internal("no blobs"));
        find_child(data, &format(), &SearchKey::new(b"", key), &mut tail).expect("find")
    }

    #[test]
    fn test_header_and_parse() {
        let data = node();
        assert_eq!(data[0], 131);
        assert_eq!(count(&data).expect("count"), 3);

        let slots = parse(&data, &format()).expect("parse");
        assert_eq!(slots.len(), 3);
        assert!(slots[0].key.is_none());
        assert_eq!(child_ptr(&data, &slots[2]).position(), 3072);
        assert_eq!(subtree_count(&data, &slots[1]), 2);
        assert_eq!(data.len(), encoded_size(&entries(&data, &format()).expect("entries")));
    }

    #[test]
    fn test_invalid_header_is_corruption() {
        let data = vec![5u8; 32];
        assert!(matches!(count(&data), Err(EngineError::Corruption(_))));
    }

    #[test]
    fn test_find_child_by_key() {
        let data = node();
        assert_eq!(find(&data, b"a"), 0);
        assert_eq!(find(&data, b"d"), 1);
        assert_eq!(find(&data, b"e"), 1);
        assert_eq!(find(&data, b"g"), 2);
        assert_eq!(find(&data, b"zz"), 2);
    }

    #[test]
    fn test_rank_descent() {
        let data = node();
        let fmt = format();
        assert_eq!(find_child_by_index(&data, &fmt, 0).expect("rank"), (0, 0));
        assert_eq!(find_child_by_index(&data, &fmt, 3).expect("rank"), (1, 0));
        assert_eq!(find_child_by_index(&data, &fmt, 8).expect("rank"), (2, 3));
        assert!(find_child_by_index(&data, &fmt, 9).is_err());
        let slots = parse(&data, &fmt).expect("parse");
        assert_eq!(keys_before(&data, &slots, 2), 5);
        assert_eq!(keys_before(&data, &slots, slots.len()), 9);
    }

    #[test]
    fn test_subtree_count_updates() {
        let mut data = node();
        let slots = parse(&data, &format()).expect("parse");
        add_to_subtree_count(&mut data, &slots[1], 1).expect("increment");
        assert_eq!(subtree_count(&data, &slots[1]), 3);
        add_to_subtree_count(&mut data, &slots[1], -3).expect("decrement");
        assert_eq!(subtree_count(&data, &slots[1]), 0);
        assert!(add_to_subtree_count(&mut data, &slots[1], -1).is_err());
    }

    #[test]
    fn test_pointer_offsets_include_key_blobs() {
        let fmt = format();
        let ext = SectorPtr::with_length(-512, 256, 0);
        let long_key = ChildEntry {
            key: encode_key_part(9, b"hijk", Some(ext)),
            child: SectorPtr::with_length(4096, 256, 0),
            keys: 1,
        };
        let mut children = entries(&node(), &fmt).expect("entries");
        children.push(long_key);
        let data = build(&children).expect("build");

        assert_eq!(child_ptr(&data, &parse(&data, &fmt).expect("parse")[3]).position(), 4096);

        let offsets = ptr_offsets(&data, &fmt).expect("offsets");
        assert_eq!(offsets.len(), 5);
        assert!(offsets.iter().any(|&o| SectorPtr::read(&data, o) == ext));
        assert_eq!(key_part_ext(&children[3].key, &fmt), Some(ext));
        assert_eq!(key_part_ext(&children[1].key, &fmt), None);
    }

    #[test]
    fn test_split_point() {
        let children = vec![
            child(256, b"", 1),
            child(512, b"b", 1),
            child(768, b"c", 1),
            child(1024, b"d", 1),
        ];
        assert_eq!(split_point(&children), 2);
    }
}
