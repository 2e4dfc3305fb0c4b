//! Free-slot bitmap
//!
//! One bit per metadata slot, stored in `metadata_lookup.ds`. A set bit means
//! the slot has been handed out. Bits are numbered most-significant first:
//!
//! ```text
//! byte 0:  0x80 0x40 0x20 0x10 0x08 0x04 0x02 0x01
//!          slot0 slot1 ...                   slot7
//! byte 1:  slot8 ...                         slot15
//! ```
//!
//! Allocation scans left to right and claims a bit with a single
//! compare-and-swap on the 4-byte word containing it, so concurrent callers
//! never need a lock and never receive the same slot.

use super::mapped::MappedFile;
use crate::error::{Error, Result};
use rayon::prelude::*;
use std::path::Path;
use std::sync::atomic::Ordering;
use tracing::{debug, warn, Dispatch};

#[cfg(test)]
use std::sync::atomic::AtomicU64;

/// File name of the bitmap inside the store directory
pub const LOOKUP_FILE_NAME: &str = "metadata_lookup.ds";

/// CAS attempts per candidate bit after the first one fails
pub const DEFAULT_RESERVE_RETRIES: usize = 5;

/// Mask for each bit position within a byte
const SLOT_OCCUPIED_MASKS: [u8; 8] = [0x80, 0x40, 0x20, 0x10, 0x08, 0x04, 0x02, 0x01];

/// Outcome of trying to claim one candidate bit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    Reserved,
    Taken,
    Exhausted,
}

/// Lock-free allocator over the lookup file
#[derive(Debug)]
pub struct SlotBitmap {
    file: MappedFile,
    num_slots: u64,
    retries: usize,
    dispatch: Dispatch,
    /// Slot whose CAS always fails, to exercise the retry path
    #[cfg(test)]
    stuck_slot: AtomicU64,
}

impl SlotBitmap {
    /// Open or create the lookup file in `dir`, sized for `num_slots`
    pub fn open(dir: &Path, num_slots: u64, retries: usize, dispatch: Dispatch) -> Result<Self> {
        let path = dir.join(LOOKUP_FILE_NAME);
        let file = MappedFile::open(&path, Self::required_len(num_slots), 4)?;

        tracing::dispatcher::with_default(&dispatch, || {
            debug!(
                path = ?path,
                num_slots,
                bytes = file.len(),
                grown_from = file.previous_len(),
                "Opened metadata lookup file"
            );
        });

        Ok(Self {
            file,
            num_slots,
            retries,
            dispatch,
            #[cfg(test)]
            stuck_slot: AtomicU64::new(u64::MAX),
        })
    }

    /// Bytes needed for `num_slots` bits, rounded up to whole CAS words
    pub fn required_len(num_slots: u64) -> u64 {
        num_slots.div_ceil(8).div_ceil(4) * 4
    }

    pub fn num_slots(&self) -> u64 {
        self.num_slots
    }

    /// Size of the lookup file in bytes
    pub fn len_bytes(&self) -> u64 {
        self.file.len()
    }

    /// Number of bytes holding at least one valid slot bit
    fn byte_count(&self) -> usize {
        self.num_slots.div_ceil(8) as usize
    }

    fn locate(slot: u64) -> (usize, usize) {
        ((slot / 8) as usize, (slot % 8) as usize)
    }

    /// Whether `slot` is marked occupied
    pub fn is_occupied(&self, slot: u64) -> Result<bool> {
        if slot >= self.num_slots {
            return Err(Error::SlotOutOfRange {
                slot,
                num_slots: self.num_slots,
            });
        }
        let (byte_index, position) = Self::locate(slot);
        Ok(self.file.byte(byte_index) & SLOT_OCCUPIED_MASKS[position] != 0)
    }

    /// Claim `slot` with one CAS
    ///
    /// Returns `false` if the slot is out of range, already occupied, or the
    /// containing word changed under us.
    pub fn try_reserve(&self, slot: u64) -> bool {
        if slot >= self.num_slots {
            return false;
        }
        let (byte_index, position) = Self::locate(slot);
        let word = &self.file.words()[byte_index / 4];

        let current = word.load(Ordering::Acquire);
        let mut image = current.to_ne_bytes();
        let mask = SLOT_OCCUPIED_MASKS[position];
        if image[byte_index % 4] & mask != 0 {
            return false;
        }
        image[byte_index % 4] |= mask;

        #[cfg(test)]
        if self.stuck_slot.load(Ordering::Relaxed) == slot {
            return false;
        }

        word.compare_exchange(
            current,
            u32::from_ne_bytes(image),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok()
    }

    /// Find and claim the first free slot
    ///
    /// Full bytes are skipped without looking at their bits. A candidate that
    /// keeps losing its CAS after the retry budget is passed over; if nothing
    /// else is free the call reports `AllocationRetryExhausted` for it rather
    /// than `OutOfSlots`.
    pub fn allocate(&self) -> Result<u64> {
        let mut exhausted = None;

        for byte_index in 0..self.byte_count() {
            if self.file.byte(byte_index) == 0xFF {
                continue;
            }

            for (position, &mask) in SLOT_OCCUPIED_MASKS.iter().enumerate() {
                let slot = byte_index as u64 * 8 + position as u64;
                if slot >= self.num_slots {
                    return Err(self.scan_failed(exhausted));
                }
                if self.file.byte(byte_index) & mask != 0 {
                    continue;
                }

                match self.claim(slot) {
                    Claim::Reserved => {
                        metrics::counter!("diskstore_slots_allocated_total").increment(1);
                        return Ok(slot);
                    }
                    Claim::Taken => {}
                    Claim::Exhausted => {
                        tracing::dispatcher::with_default(&self.dispatch, || {
                            warn!(slot, retries = self.retries, "Slot reservation kept failing, moving on");
                        });
                        exhausted.get_or_insert(slot);
                    }
                }
            }
        }

        Err(self.scan_failed(exhausted))
    }

    fn claim(&self, slot: u64) -> Claim {
        if self.try_reserve(slot) {
            return Claim::Reserved;
        }
        for _ in 0..self.retries {
            if self.is_set(slot) {
                return Claim::Taken;
            }
            metrics::counter!("diskstore_allocation_retries_total").increment(1);
            if self.try_reserve(slot) {
                return Claim::Reserved;
            }
        }
        if self.is_set(slot) {
            Claim::Taken
        } else {
            Claim::Exhausted
        }
    }

    fn is_set(&self, slot: u64) -> bool {
        let (byte_index, position) = Self::locate(slot);
        self.file.byte(byte_index) & SLOT_OCCUPIED_MASKS[position] != 0
    }

    fn scan_failed(&self, exhausted: Option<u64>) -> Error {
        match exhausted {
            Some(slot) => Error::AllocationRetryExhausted {
                slot,
                retries: self.retries,
            },
            None => Error::OutOfSlots {
                num_slots: self.num_slots,
            },
        }
    }

    /// Number of occupied slots, counted in parallel
    pub fn occupied_count(&self) -> u64 {
        let full_bytes = (self.num_slots / 8) as usize;
        let tail_bits = (self.num_slots % 8) as u32;

        let full: u64 = (0..full_bytes)
            .into_par_iter()
            .map(|i| self.file.byte(i).count_ones() as u64)
            .sum();

        let tail = if tail_bits == 0 {
            0
        } else {
            let valid = !(0xFFu8 >> tail_bits);
            (self.file.byte(full_bytes) & valid).count_ones() as u64
        };

        full + tail
    }

    pub fn free_count(&self) -> u64 {
        self.num_slots - self.occupied_count()
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }

    pub fn close(self) -> Result<()> {
        self.file.close()
    }

    #[cfg(test)]
    pub(crate) fn stick_slot(&self, slot: u64) {
        self.stuck_slot.store(slot, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_bitmap(dir: &Path, num_slots: u64) -> SlotBitmap {
        SlotBitmap::open(dir, num_slots, DEFAULT_RESERVE_RETRIES, Dispatch::none())
            .expect("open bitmap")
    }

    #[test]
    fn test_required_len() {
        assert_eq!(SlotBitmap::required_len(0), 0);
        assert_eq!(SlotBitmap::required_len(1), 4);
        assert_eq!(SlotBitmap::required_len(20), 4);
        assert_eq!(SlotBitmap::required_len(40), 8);
        assert_eq!(SlotBitmap::required_len(204), 28);
    }

    #[test]
    fn test_msb_first_bit_mapping() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let bitmap = open_bitmap(dir.path(), 20);

        assert!(bitmap.try_reserve(0));
        assert!(bitmap.try_reserve(9));
        assert!(bitmap.try_reserve(19));
        assert_eq!(bitmap.file.byte(0), 0x80);
        assert_eq!(bitmap.file.byte(1), 0x40);
        assert_eq!(bitmap.file.byte(2), 0x10);
        assert!(bitmap.is_occupied(9)?);
        assert!(!bitmap.is_occupied(10)?);
        Ok(())
    }

    #[test]
    fn test_reserve_rejects_taken_and_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let bitmap = open_bitmap(dir.path(), 20);

        assert!(bitmap.try_reserve(5));
        assert!(!bitmap.try_reserve(5));
        assert!(!bitmap.try_reserve(20));
        assert!(matches!(
            bitmap.is_occupied(20),
            Err(Error::SlotOutOfRange { slot: 20, num_slots: 20 })
        ));
    }

    #[test]
    fn test_allocates_in_order() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let bitmap = open_bitmap(dir.path(), 20);

        for expected in 0..20 {
            assert_eq!(bitmap.allocate()?, expected);
        }
        assert!(matches!(
            bitmap.allocate(),
            Err(Error::OutOfSlots { num_slots: 20 })
        ));
        Ok(())
    }

    #[test]
    fn test_tail_bits_past_num_slots_are_never_handed_out() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let bitmap = open_bitmap(dir.path(), 18);
        for slot in 0..17 {
            assert!(bitmap.try_reserve(slot));
        }

        assert_eq!(bitmap.allocate()?, 17);
        assert!(matches!(bitmap.allocate(), Err(Error::OutOfSlots { .. })));
        assert_eq!(bitmap.file.byte(2), 0xC0);
        Ok(())
    }

    #[test]
    fn test_exhausted_candidate_is_skipped() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let bitmap = open_bitmap(dir.path(), 20);
        bitmap.stick_slot(0);

        assert_eq!(bitmap.allocate()?, 1);
        assert!(!bitmap.is_occupied(0)?);
        Ok(())
    }

    #[test]
    fn test_exhaustion_reported_when_nothing_else_is_free() {
        let dir = tempfile::tempdir().unwrap();
        let bitmap = open_bitmap(dir.path(), 20);
        for slot in (0..20).filter(|&s| s != 6) {
            assert!(bitmap.try_reserve(slot));
        }
        bitmap.stick_slot(6);

        assert!(matches!(
            bitmap.allocate(),
            Err(Error::AllocationRetryExhausted { slot: 6, retries: DEFAULT_RESERVE_RETRIES })
        ));

        bitmap.stick_slot(u64::MAX);
        assert_eq!(bitmap.allocate().unwrap(), 6);
    }

    #[test]
    fn test_occupied_count_ignores_tail_padding() {
        let dir = tempfile::tempdir().unwrap();
        let bitmap = open_bitmap(dir.path(), 12);
        bitmap.file.words()[0].store(u32::MAX, Ordering::Release);

        assert_eq!(bitmap.occupied_count(), 12);
        assert_eq!(bitmap.free_count(), 0);
    }

    #[test]
    fn test_bits_survive_reopen() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        {
            let bitmap = open_bitmap(dir.path(), 40);
            assert!(bitmap.try_reserve(3));
            assert!(bitmap.try_reserve(33));
            bitmap.close()?;
        }

        let bitmap = open_bitmap(dir.path(), 80);
        assert!(bitmap.is_occupied(3)?);
        assert!(bitmap.is_occupied(33)?);
        assert_eq!(bitmap.occupied_count(), 2);
        assert_eq!(bitmap.len_bytes(), 12);
        Ok(())
    }
}
