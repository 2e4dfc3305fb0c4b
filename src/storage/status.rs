//! Per-slot status byte

use bitflags::bitflags;

bitflags! {
    /// Flags stored in the first byte of every slot interval
    ///
    /// Independent of the free-slot bitmap: the bitmap decides who gets a slot,
    /// the status byte decides who may write it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SlotStatus: u8 {
        const IN_USE = 0x01;
        const BEING_MODIFIED = 0x02;
        const MARKED_FOR_DELETION = 0x04;
    }
}

impl SlotStatus {
    /// Whether `write_slot` may claim a slot in this state
    pub fn is_writable(self) -> bool {
        self.is_empty() || self == SlotStatus::IN_USE
    }

    /// State held while a writer copies record bytes
    pub fn claimed() -> Self {
        SlotStatus::IN_USE | SlotStatus::BEING_MODIFIED
    }

    /// State after a write completes; only `BEING_MODIFIED` is dropped
    pub fn released(self) -> Self {
        self.difference(SlotStatus::BEING_MODIFIED)
    }
}
