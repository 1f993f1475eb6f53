//! Storage abstraction shared by file and in-memory backends.

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// A read ended before the requested range was filled.
    ShortRead {
        offset: u64,
        expected: usize,
        actual: usize,
    },
    /// Injected fault for testing.
    InjectedFault(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::ShortRead {
                offset,
                expected,
                actual,
            } => write!(
                f,
                "short read at offset {offset}: expected {expected} bytes, got {actual}"
            ),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Byte-addressed storage without a cursor.
///
/// Implementations take `&self` so that concurrent readers can load sectors
/// while the single writer appends new ones.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `read` returns the last written content for the range
/// - writing past the end grows the storage
/// - `durable_flush` makes all previous writes survive a crash
pub trait BlockStorage: Send + Sync {
    /// Read into `buf` starting at `offset`. Returns the number of bytes read,
    /// which is smaller than `buf.len()` only at the end of the storage.
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError>;

    /// Write all of `buf` at `offset`.
    fn write(&self, buf: &[u8], offset: u64) -> Result<(), StorageError>;

    /// Hand buffered writes to the operating system.
    fn flush(&self) -> Result<(), StorageError>;

    /// Make every previous write durable.
    fn durable_flush(&self) -> Result<(), StorageError>;

    /// Current size in bytes.
    fn get_size(&self) -> Result<u64, StorageError>;

    /// Grow or truncate to `size` bytes.
    fn set_size(&self, size: u64) -> Result<(), StorageError>;

    /// Read exactly `buf.len()` bytes at `offset`.
    fn read_exact(&self, buf: &mut [u8], offset: u64) -> Result<(), StorageError> {
        let actual = self.read(buf, offset)?;
        if actual == buf.len() {
            Ok(())
        } else {
            Err(StorageError::ShortRead {
                offset,
                expected: buf.len(),
                actual,
            })
        }
    }
}
