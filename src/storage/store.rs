//! Slot store over `metadata.ds`
//!
//! The metadata file is a flat array of fixed 200-byte intervals, one per
//! slot:
//!
//! ```text
//! interval N (offset N * 200)
//! +--------+---------------------------+------------------+
//! | status | SlotRecord v1 (24 bytes)  | zero padding     |
//! | 1 byte | bytes 1..25               | bytes 25..200    |
//! +--------+---------------------------+------------------+
//! ```
//!
//! Intervals are a whole number of 4-byte words and the mapping is page
//! aligned, so word 0 of every interval holds the status byte plus the first
//! three record bytes. Writers claim a slot by CAS on that word, copy the
//! remaining words, then publish the first three bytes and clear
//! `BEING_MODIFIED` in one final update of word 0.

use super::bitmap::{SlotBitmap, DEFAULT_RESERVE_RETRIES};
use super::mapped::MappedFile;
use super::slot::SlotRecord;
use super::status::SlotStatus;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, error, info, warn, Dispatch};

/// File name of the metadata file inside the store directory
pub const METADATA_FILE_NAME: &str = "metadata.ds";

/// Bytes per slot interval
pub const SLOT_INTERVAL: usize = 200;

/// Metadata file growth unit
pub const PAGE_SIZE: u64 = 4096;

const WORDS_PER_INTERVAL: usize = SLOT_INTERVAL / 4;

const _: () = {
    assert!(SLOT_INTERVAL % 4 == 0);
    assert!(1 + SlotRecord::ENCODED_LEN <= SLOT_INTERVAL);
};

/// Memory-mapped slot metadata with a free-slot bitmap
///
/// `SlotStore` is `Send + Sync`; once opened, `allocate`, `write_slot`,
/// `get_slot` and `status` may be called from any number of threads.
/// Opening the same directory concurrently is not supported.
#[derive(Debug)]
pub struct SlotStore {
    metadata: MappedFile,
    bitmap: SlotBitmap,
    num_slots: u64,
    dir: PathBuf,
    dispatch: Dispatch,
}

impl SlotStore {
    /// Open or create a store in `dir` with room for at least `requested_bytes`
    ///
    /// Logs go to the caller's current default subscriber.
    pub fn open<P: AsRef<Path>>(dir: P, requested_bytes: u64) -> Result<Self> {
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        Self::open_with_dispatch(dir, requested_bytes, dispatch)
    }

    /// Open using a [`StoreConfig`]
    pub fn open_with_config(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        Self::open_inner(
            &config.data_dir,
            config.requested_bytes,
            config.reserve_retries,
            dispatch,
        )
    }

    /// Open with an explicit log dispatcher
    pub fn open_with_dispatch<P: AsRef<Path>>(
        dir: P,
        requested_bytes: u64,
        dispatch: Dispatch,
    ) -> Result<Self> {
        Self::open_inner(dir.as_ref(), requested_bytes, DEFAULT_RESERVE_RETRIES, dispatch)
    }

    fn open_inner(dir: &Path, requested_bytes: u64, retries: usize, dispatch: Dispatch) -> Result<Self> {
        let result = tracing::dispatcher::with_default(&dispatch, || -> Result<(MappedFile, SlotBitmap, u64)> {
            std::fs::create_dir_all(dir).map_err(|e| Error::io("create directory", dir, e))?;

            let metadata = MappedFile::open(
                &dir.join(METADATA_FILE_NAME),
                requested_bytes.max(1),
                PAGE_SIZE,
            )?;
            let num_slots = metadata.len() / SLOT_INTERVAL as u64;

            // Dropping `metadata` on failure unmaps and closes it
            let bitmap = SlotBitmap::open(dir, num_slots, retries, dispatch.clone())?;

            info!(
                path = ?dir,
                num_slots,
                metadata_bytes = metadata.len(),
                lookup_bytes = bitmap.len_bytes(),
                grown = metadata.len() > metadata.previous_len(),
                "Opened slot store"
            );
            Ok((metadata, bitmap, num_slots))
        });

        let (metadata, bitmap, num_slots) = result.inspect_err(|e: &Error| {
            tracing::dispatcher::with_default(&dispatch, || {
                error!(path = ?dir, error = %e, "Failed to open slot store");
            });
        })?;

        Ok(Self {
            metadata,
            bitmap,
            num_slots,
            dir: dir.to_path_buf(),
            dispatch,
        })
    }

    /// Number of slots the metadata file can hold
    pub fn num_slots(&self) -> u64 {
        self.num_slots
    }

    /// Store directory
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Free-slot bitmap backing [`allocate`](Self::allocate)
    pub fn bitmap(&self) -> &SlotBitmap {
        &self.bitmap
    }

    /// Claim a free slot number for a subsequent [`write_slot`](Self::write_slot)
    pub fn allocate(&self) -> Result<u64> {
        self.bitmap.allocate()
    }

    fn interval(&self, slot_no: u64) -> Result<&[AtomicU32]> {
        if slot_no >= self.num_slots {
            return Err(Error::SlotOutOfRange {
                slot: slot_no,
                num_slots: self.num_slots,
            });
        }
        let start = slot_no as usize * WORDS_PER_INTERVAL;
        Ok(&self.metadata.words()[start..start + WORDS_PER_INTERVAL])
    }

    /// Current status flags of a slot
    ///
    /// Advisory only: the value may change right after it is read.
    pub fn status(&self, slot_no: u64) -> Result<SlotStatus> {
        let head = &self.interval(slot_no)?[0];
        Ok(SlotStatus::from_bits_retain(
            head.load(Ordering::Acquire).to_ne_bytes()[0],
        ))
    }

    /// Write `record` into slot `slot_no`
    ///
    /// Fails with `SlotInUse` without touching the slot if another writer
    /// holds it or it is marked for deletion.
    pub fn write_slot(&self, record: &SlotRecord, slot_no: u64) -> Result<()> {
        let words = self.interval(slot_no)?;
        if record.slot_no != slot_no {
            return Err(Error::SlotMismatch {
                slot: slot_no,
                record_slot: record.slot_no,
            });
        }

        let head = &words[0];
        let observed = head.load(Ordering::Acquire);
        let mut image = observed.to_ne_bytes();
        let prior = SlotStatus::from_bits_retain(image[0]);
        if !prior.is_writable() {
            return Err(self.conflict(slot_no, image[0]));
        }

        image[0] = SlotStatus::claimed().bits();
        if head
            .compare_exchange(
                observed,
                u32::from_ne_bytes(image),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            let status = head.load(Ordering::Acquire).to_ne_bytes()[0];
            return Err(self.conflict(slot_no, status));
        }

        let mut encoded = [0u8; SLOT_INTERVAL];
        if let Err(e) = record.encode_into(&mut encoded[1..]) {
            update_head(head, |bytes| bytes[0] = prior.bits());
            return Err(e);
        }

        for (word, chunk) in words.iter().zip(encoded.chunks_exact(4)).skip(1) {
            word.store(
                u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                Ordering::Release,
            );
        }

        update_head(head, |bytes| {
            bytes[0] = SlotStatus::from_bits_retain(bytes[0]).released().bits();
            bytes[1..4].copy_from_slice(&encoded[1..4]);
        });

        metrics::counter!("diskstore_slot_writes_total").increment(1);
        Ok(())
    }

    fn conflict(&self, slot: u64, status: u8) -> Error {
        metrics::counter!("diskstore_slot_write_conflicts_total").increment(1);
        tracing::dispatcher::with_default(&self.dispatch, || {
            debug!(slot, status, "Slot write rejected");
        });
        Error::SlotInUse { slot, status }
    }

    /// Read the record stored in slot `slot_no`
    ///
    /// The status byte is neither checked nor changed.
    pub fn get_slot(&self, slot_no: u64) -> Result<SlotRecord> {
        let words = self.interval(slot_no)?;

        let mut bytes = [0u8; SLOT_INTERVAL];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.load(Ordering::Acquire).to_ne_bytes());
        }

        SlotRecord::decode(&bytes[1..]).inspect_err(|e| {
            tracing::dispatcher::with_default(&self.dispatch, || {
                warn!(slot = slot_no, error = %e, "Failed to decode slot");
            });
        })
    }

    /// Occupancy and file sizes
    pub fn stats(&self) -> StoreStats {
        let occupied_slots = self.bitmap.occupied_count();
        StoreStats {
            num_slots: self.num_slots,
            occupied_slots,
            free_slots: self.num_slots - occupied_slots,
            metadata_bytes: self.metadata.len(),
            lookup_bytes: self.bitmap.len_bytes(),
        }
    }

    /// Flush both mappings to disk
    pub fn flush(&self) -> Result<()> {
        self.metadata.flush()?;
        self.bitmap.flush()
    }

    /// Sync and release both files
    pub fn close(self) -> Result<()> {
        let Self {
            metadata,
            bitmap,
            dir,
            dispatch,
            ..
        } = self;

        tracing::dispatcher::with_default(&dispatch, || {
            let result = metadata.close().and_then(|()| bitmap.close());
            match &result {
                Ok(()) => info!(path = ?dir, "Closed slot store"),
                Err(e) => error!(path = ?dir, error = %e, "Failed to close slot store"),
            }
            result
        })
    }
}

/// Apply `f` to the byte image of an interval's first word
fn update_head(head: &AtomicU32, mut f: impl FnMut(&mut [u8; 4])) {
    let mut current = head.load(Ordering::Acquire);
    loop {
        let mut bytes = current.to_ne_bytes();
        f(&mut bytes);
        match head.compare_exchange_weak(
            current,
            u32::from_ne_bytes(bytes),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

/// Store statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub num_slots: u64,
    pub occupied_slots: u64,
    pub free_slots: u64,
    pub metadata_bytes: u64,
    pub lookup_bytes: u64,
}
