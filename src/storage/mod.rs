//! Storage layer
//!
//! # Architecture
//!
//! ```text
//! SlotStore (metadata.ds, 200-byte intervals)
//!   ├─→ interval 0:  [status][SlotRecord][padding]
//!   ├─→ interval 1:  [status][SlotRecord][padding]
//!   └─→ ...
//!
//! SlotBitmap (metadata_lookup.ds, 1 bit per slot)
//!   └─→ 0b1010_0000 ...  → slots 0 and 2 handed out
//! ```
//!
//! A writer first asks the bitmap for a slot number (`allocate`), then fills
//! that slot's interval (`write_slot`). The bitmap decides which slot a writer
//! gets; the status byte decides whether a writer may touch a slot right now.
//! Both updates are lock-free CAS operations on 4-byte words of the mapped
//! files.

pub mod bitmap;
pub mod mapped;
pub mod slot;
pub mod status;
pub mod store;

pub use bitmap::{SlotBitmap, DEFAULT_RESERVE_RETRIES, LOOKUP_FILE_NAME};
pub use mapped::MappedFile;
pub use slot::SlotRecord;
pub use status::SlotStatus;
pub use store::{SlotStore, StoreStats, METADATA_FILE_NAME, PAGE_SIZE, SLOT_INTERVAL};
