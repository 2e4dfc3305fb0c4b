//! Slot records and their on-disk encoding
//!
//! # Layout (version 1)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ----------------
//! 0       8     data_store_slot  (u64, little-endian)
//! 8       8     size_of_data     (u64, little-endian)
//! 16      8     slot_no          (u64, little-endian)
//! ```
//!
//! The encoded record sits right after the status byte of its interval and
//! everything past offset 24 is zero padding, which `decode` ignores.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Location and size of one payload in the external data store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotRecord {
    /// Where the payload lives in the data store
    pub data_store_slot: u64,
    /// Payload length in bytes
    pub size_of_data: u64,
    /// Index of the slot holding this record
    pub slot_no: u64,
}

impl SlotRecord {
    /// Version of the fixed-offset layout written by [`encode`](Self::encode)
    pub const LAYOUT_VERSION: u8 = 1;

    /// Encoded size in bytes
    pub const ENCODED_LEN: usize = 24;

    /// Create a new record
    pub fn new(data_store_slot: u64, size_of_data: u64, slot_no: u64) -> Self {
        Self {
            data_store_slot,
            size_of_data,
            slot_no,
        }
    }

    /// Encode into the fixed 24-byte layout
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..8].copy_from_slice(&self.data_store_slot.to_le_bytes());
        out[8..16].copy_from_slice(&self.size_of_data.to_le_bytes());
        out[16..24].copy_from_slice(&self.slot_no.to_le_bytes());
        out
    }

    /// Encode into `buf`, returning the number of bytes written
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(Error::Encoding(format!(
                "Slot record needs {} bytes but only {} are available",
                Self::ENCODED_LEN,
                buf.len()
            )));
        }
        buf[..Self::ENCODED_LEN].copy_from_slice(&self.encode());
        Ok(Self::ENCODED_LEN)
    }

    /// Decode a record, ignoring any trailing padding
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(Error::Encoding(format!(
                "Truncated slot record: expected {} bytes, got {}",
                Self::ENCODED_LEN,
                bytes.len()
            )));
        }

        let field = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };

        Ok(Self {
            data_store_slot: field(0),
            size_of_data: field(8),
            slot_no: field(16),
        })
    }
}

impl fmt::Display for SlotRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Slot(no={}, data_store_slot={}, size={})",
            self.slot_no, self.data_store_slot, self.size_of_data
        )
    }
}
