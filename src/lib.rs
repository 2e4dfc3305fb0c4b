// diskstore - Slot metadata for a disk-based object store
// Fixed-layout memory-mapped records plus a lock-free free-slot bitmap

#![warn(rust_2018_idioms)]

pub mod config;
pub mod storage;

// Re-exports for convenience
pub use config::StoreConfig;
pub use storage::{SlotBitmap, SlotRecord, SlotStatus, SlotStore, StoreStats};

/// diskstore error types
pub mod error {
    use std::path::PathBuf;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("I/O error while trying to {op} '{}': {source}", path.display())]
        Io {
            op: &'static str,
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },

        #[error("Encoding error: {0}")]
        Encoding(String),

        #[error("Slot {slot} is in use (status 0x{status:02x})")]
        SlotInUse { slot: u64, status: u8 },

        #[error("Could not find a free slot among {num_slots} slots")]
        OutOfSlots { num_slots: u64 },

        #[error("Could not reserve slot {slot} even after trying {retries} times")]
        AllocationRetryExhausted { slot: u64, retries: usize },

        #[error("Slot {slot} is out of range ({num_slots} slots)")]
        SlotOutOfRange { slot: u64, num_slots: u64 },

        #[error("Record for slot {record_slot} cannot be written at slot {slot}")]
        SlotMismatch { slot: u64, record_slot: u64 },

        #[error("Configuration error: {0}")]
        Config(String),
    }

    impl Error {
        pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
            Error::Io {
                op,
                path: path.into(),
                source,
            }
        }

        /// Whether the caller can recover by retrying, picking another slot or growing the store.
        pub fn is_retryable(&self) -> bool {
            matches!(
                self,
                Error::SlotInUse { .. } | Error::AllocationRetryExhausted { .. }
            )
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
