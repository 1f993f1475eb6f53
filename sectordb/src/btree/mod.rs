//! B+Tree node codecs.
//!
//! Pure encode/decode/search logic over sector bytes. Nothing here touches
//! storage: externalized key tails are fetched through a caller-supplied
//! callback so the codecs stay independent of the blob tree.
//!
//! # Structure
//!
//! - Leaf nodes: sorted key/value entries behind a cumulative offset table
//! - Internal nodes: child pointers, separator keys and per-child key counts
//!
//! # Key Format
//!
//! Keys and values are arbitrary byte strings. The first
//! `Format::key_inline_cap` key bytes (`value_inline_cap` for values) are
//! stored inline; the remainder lives in a blob tree referenced by a
//! [`SectorPtr`](crate::sector::SectorPtr) appended after the inline bytes.

pub mod internal;
mod key;
pub mod leaf;

pub use key::{SearchKey, encode_key_part};
