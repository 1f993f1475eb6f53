//! Positionless block storage.
//!
//! The engine never relies on a stream cursor: every read and write names
//! its byte offset explicitly. Two implementations are provided:
//!
//! - [`FileStorage`]: a single database file using positional I/O.
//! - [`MemoryStorage`]: a shared in-memory buffer with fault injection,
//!   used by tests to corrupt bytes and to reopen a database without
//!   touching the filesystem.

mod file;
mod io;
mod memory;

pub use file::FileStorage;
pub use io::{BlockStorage, StorageError};
pub use memory::MemoryStorage;
