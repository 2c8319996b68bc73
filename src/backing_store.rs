// src/backing_store.rs
//
// The host block-I/O submission path is named as an external collaborator;
// this module is the minimal seam the replication core needs, plus a
// straightforward file-backed implementation used by tests and the demo
// binary. Not a generic async I/O layer.

use crate::error::{DrbdError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

pub const SECTOR_SIZE: u64 = 512;

pub trait BackingStore: Send + Sync {
    fn read_at(&self, sector: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&self, sector: u64, buf: &[u8]) -> Result<()>;
    fn size_sectors(&self) -> u64;
    fn flush(&self) -> Result<()>;
}

/// File-backed store. A single `Mutex<File>` serialises seek+read/write
/// pairs; concurrent callers (DiskSender issuing resync reads while the
/// Receiver submits peer writes) are expected and safe, just not
/// parallel at the syscall level — matching the granularity the teacher's
/// `snapshot::SnapshotWriter` holds over its own file handle.
pub struct FileBackingStore {
    file: Mutex<File>,
    size_sectors: u64,
}

impl FileBackingStore {
    pub fn open(path: &Path, size_sectors: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        file.set_len(size_sectors * SECTOR_SIZE)?;
        Ok(Self { file: Mutex::new(file), size_sectors })
    }
}

impl BackingStore for FileBackingStore {
    fn read_at(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let mut f = self.file.lock().unwrap();
        f.seek(SeekFrom::Start(sector * SECTOR_SIZE))?;
        f.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, sector: u64, buf: &[u8]) -> Result<()> {
        let mut f = self.file.lock().unwrap();
        f.seek(SeekFrom::Start(sector * SECTOR_SIZE))?;
        f.write_all(buf)?;
        Ok(())
    }

    fn size_sectors(&self) -> u64 {
        self.size_sectors
    }

    fn flush(&self) -> Result<()> {
        let f = self.file.lock().unwrap();
        f.sync_data().map_err(DrbdError::from)
    }
}
