//! Memory-mapped backing file
//!
//! `MappedFile` owns an OS file handle together with a shared, writable
//! mapping of the whole file. Both are acquired in `open` and released
//! together: the mapping is declared before the handle, so dropping a
//! `MappedFile` (including on an early `?` return) always unmaps first and
//! closes second.
//!
//! After `open` returns, the mapped bytes are only reachable through
//! [`words`](MappedFile::words), a slice of `AtomicU32` laid over the mapping.
//! `open` verifies that the mapping is 4-byte aligned and a whole number of
//! words long, so every word is a valid, aligned atomic.

use crate::error::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};

const WORD_SIZE: usize = mem::size_of::<AtomicU32>();

#[derive(Debug)]
pub struct MappedFile {
    map: MmapMut,
    file: File,
    path: PathBuf,
    previous_len: u64,
}

impl MappedFile {
    /// Open or create `path` and map it
    ///
    /// The file is sized to `max(current size, min_len)` rounded up to a
    /// multiple of `granularity`. It is never shrunk, and any bytes added by
    /// this call are zeroed.
    pub fn open(path: &Path, min_len: u64, granularity: u64) -> Result<Self> {
        debug_assert!(granularity > 0 && granularity % WORD_SIZE as u64 == 0);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::io("open", path, e))?;

        let previous_len = file
            .metadata()
            .map_err(|e| Error::io("stat", path, e))?
            .len();

        let len = previous_len
            .max(min_len)
            .div_ceil(granularity)
            .checked_mul(granularity)
            .ok_or_else(|| {
                Error::io(
                    "truncate",
                    path,
                    io::Error::new(io::ErrorKind::InvalidInput, "requested size overflows"),
                )
            })?;
        if len == 0 {
            return Err(Error::io(
                "map",
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "cannot map an empty file"),
            ));
        }
        // set_len zero-extends, so bytes added here read back as zero
        if len > previous_len {
            file.set_len(len).map_err(|e| Error::io("truncate", path, e))?;
        }

        let map_len = usize::try_from(len).map_err(|_| {
            Error::io(
                "map",
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "file too large to map"),
            )
        })?;

        // SAFETY: the mapping is shared with other processes that map the same
        // file, which is the intended use. Inside this process the bytes are
        // only touched through atomic words, so no plain reference ever
        // aliases a concurrent write.
        let map = unsafe { MmapOptions::new().len(map_len).map_mut(&file) }
            .map_err(|e| Error::io("mmap", path, e))?;

        if map.as_ptr().align_offset(mem::align_of::<AtomicU32>()) != 0 {
            return Err(Error::io(
                "map",
                path,
                io::Error::new(io::ErrorKind::InvalidData, "mapping is not word aligned"),
            ));
        }

        Ok(Self {
            map,
            file,
            path: path.to_path_buf(),
            previous_len,
        })
    }

    /// Mapped length in bytes
    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    /// File size before this open grew it
    pub fn previous_len(&self) -> u64 {
        self.previous_len
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomic word view over the whole mapping
    pub fn words(&self) -> &[AtomicU32] {
        // SAFETY: `open` checked that the base pointer is aligned for
        // AtomicU32 and the length is a multiple of the granularity, itself a
        // multiple of WORD_SIZE. The slice borrows `self`, so it cannot
        // outlive the mapping, and AtomicU32 permits mutation through `&`.
        unsafe {
            slice::from_raw_parts(
                self.map.as_ptr().cast::<AtomicU32>(),
                self.map.len() / WORD_SIZE,
            )
        }
    }

    /// Advisory read of a single byte
    pub fn byte(&self, index: usize) -> u8 {
        self.words()[index / WORD_SIZE]
            .load(Ordering::Acquire)
            .to_ne_bytes()[index % WORD_SIZE]
    }

    /// Flush dirty pages of the mapping
    pub fn flush(&self) -> Result<()> {
        self.map
            .flush()
            .map_err(|e| Error::io("flush", &self.path, e))
    }

    /// Flush, sync, then unmap and close
    pub fn close(self) -> Result<()> {
        self.flush()?;
        self.file
            .sync_all()
            .map_err(|e| Error::io("sync", &self.path, e))?;
        let Self { map, file, .. } = self;
        drop(map);
        drop(file);
        Ok(())
    }
}
