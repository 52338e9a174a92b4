//! Raw block-device access.
//!
//! This is the `disk_read`/`disk_write` collaborator named in the purpose
//! & scope section: a thin, positioned-I/O wrapper around an open file
//! descriptor. It performs no caching and no buffering of its own — that is
//! the buffer cache's job (see [`crate::cache`]).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::prelude::*;

/// A block device: something `disk_read`/`disk_write` can be issued against.
pub trait BlockDevice: Send {
    /// Reads `buf.len()` bytes starting at byte offset `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Writes `buf` at byte offset `offset`.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()>;

    /// Flushes any OS-level buffering to stable storage.
    fn sync(&self) -> Result<()>;

    /// Total device size in bytes, if known.
    fn size_bytes(&self) -> Result<u64>;
}

/// A block device backed by a regular file or a real block special file.
pub struct FileDevice {
    file: File,
}

impl FileDevice {
    /// Opens an existing device/file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|e| {
                error!("failed to open device {:?}: {e}", path.as_ref());
                Error::from(e)
            })?;
        Ok(Self { file })
    }

    /// Creates (or truncates) a plain file to back a device, used by
    /// `initialize` against loopback-style test images.
    pub fn create(path: impl AsRef<Path>, size_bytes: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(size_bytes)?;
        Ok(Self { file })
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file.read_exact_at(buf, offset).map_err(|e| {
            error!("read_at(offset={offset}, len={}) failed: {e}", buf.len());
            Error::from(e)
        })
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.file.write_all_at(buf, offset).map_err(|e| {
            error!("write_at(offset={offset}, len={}) failed: {e}", buf.len());
            Error::from(e)
        })
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data().map_err(Error::from)
    }

    fn size_bytes(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}
