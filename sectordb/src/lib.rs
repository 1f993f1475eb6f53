// Life of a write transaction:
// 1. Start reading the current committed State (a read link)
// 2. First mutation takes the single writer slot
// 3. Every touched sector is dirtized into the writer's private arena,
//    cascading up to the root
// 4. Commit:
//     - Place new sectors through the allocator tree
//     - Write sectors children first, then the header slot
//     - Publish the new State; space freed by this commit stays reserved
//       until older readers finish
//
// System components:
//  - Block storage and sector cache
//  - Copy-on-write B+Tree with blob trees for long keys and values
//  - Bitmap allocator tree with a locality cache
//  - Snapshot chain and writer queue

mod alloc;
mod blob;
mod btree;
mod config;
mod engine;
mod error;
mod header;
mod interval;
mod sector;
mod storage;
mod store;
#[cfg(test)]
mod testing;
mod transaction;

pub use config::{ConfigError, DefaultTweaks, EngineConfig, Format, Tweaks};
pub use engine::Engine;
pub use error::{ConflictReason, EngineError};
pub use header::State;
pub use sector::SectorPtr;
pub use storage::{BlockStorage, FileStorage, MemoryStorage, StorageError};
pub use transaction::{FindKeyStrategy, FindResult, Transaction};
