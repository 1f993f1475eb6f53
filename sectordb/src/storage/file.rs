//! Database file backend.
//!
//! Uses positional I/O (`pread`/`pwrite` on Unix) so reads from concurrent
//! transactions never contend on a shared file cursor.

use std::fs::{File, OpenOptions};
#[cfg(not(unix))]
use std::io::{Read, Seek, SeekFrom, Write};
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::storage::io::{BlockStorage, StorageError};

/// A database file handle.
pub struct FileStorage {
    path: PathBuf,
    #[cfg(unix)]
    file: File,
    #[cfg(not(unix))]
    file: std::sync::Mutex<File>,
}

impl FileStorage {
    /// Open the file at `path`, creating an empty one if it does not exist.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        tracing::debug!(path = %path.display(), "opened database file");

        Ok(Self {
            path: path.to_path_buf(),
            #[cfg(unix)]
            file,
            #[cfg(not(unix))]
            file: std::sync::Mutex::new(file),
        })
    }

    /// Path the storage was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    const fn file(&self) -> &File {
        &self.file
    }

    #[cfg(not(unix))]
    fn file(&self) -> std::sync::MutexGuard<'_, File> {
        self.file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl BlockStorage for FileStorage {
    #[cfg(unix)]
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.file().read_at(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    #[cfg(not(unix))]
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        let mut file = self.file();
        file.seek(SeekFrom::Start(offset))?;
        let mut done = 0;
        while done < buf.len() {
            let n = file.read(&mut buf[done..])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    #[cfg(unix)]
    fn write(&self, buf: &[u8], offset: u64) -> Result<(), StorageError> {
        self.file().write_all_at(buf, offset)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn write(&self, buf: &[u8], offset: u64) -> Result<(), StorageError> {
        let mut file = self.file();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        // Positional writes go straight to the OS page cache.
        Ok(())
    }

    fn durable_flush(&self) -> Result<(), StorageError> {
        self.file().sync_data()?;
        Ok(())
    }

    fn get_size(&self) -> Result<u64, StorageError> {
        Ok(self.file().metadata()?.len())
    }

    fn set_size(&self, size: u64) -> Result<(), StorageError> {
        self.file().set_len(size)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_empty_file() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.db");

        let storage = FileStorage::open(&path).expect("open storage");
        assert!(path.exists());
        assert_eq!(storage.get_size().expect("size"), 0);
        assert_eq!(storage.path(), path.as_path());
    }

    #[test]
    fn test_write_past_end_grows_file() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.db");
        let storage = FileStorage::open(&path).expect("open storage");

        storage.write(b"hello", 1000).expect("write");
        assert_eq!(storage.get_size().expect("size"), 1005);

        let mut buf = [0u8; 5];
        storage.read_exact(&mut buf, 1000).expect("read");
        assert_eq!(&buf, b"hello");

        let mut gap = [0xFFu8; 4];
        storage.read_exact(&mut gap, 10).expect("read gap");
        assert_eq!(gap, [0u8; 4]);
    }

    #[test]
    fn test_short_read_at_end() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.db");
        let storage = FileStorage::open(&path).expect("open storage");
        storage.write(b"abc", 0).expect("write");

        let mut buf = [0u8; 8];
        assert_eq!(storage.read(&mut buf, 0).expect("read"), 3);
        assert!(matches!(
            storage.read_exact(&mut buf, 0),
            Err(StorageError::ShortRead { actual: 3, .. })
        ));
    }

    #[test]
    fn test_data_persists_across_reopen() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.db");
        {
            let storage = FileStorage::open(&path).expect("open storage");
            storage.write(&[7u8; 256], 256).expect("write");
            storage.durable_flush().expect("sync");
        }

        let storage = FileStorage::open(&path).expect("reopen storage");
        let mut buf = [0u8; 256];
        storage.read_exact(&mut buf, 256).expect("read");
        assert!(buf.iter().all(|&b| b == 7));

        storage.set_size(300).expect("truncate");
        assert_eq!(storage.get_size().expect("size"), 300);
    }
}
