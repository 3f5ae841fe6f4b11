#![forbid(unsafe_code)]
//! btq public API facade.
//!
//! Re-exports the key, record and scan layers through one crate. This is
//! the crate downstream consumers depend on; the member crates stay usable
//! on their own for callers that only need one layer.

pub use btq_key as key;
pub use btq_key::{FieldOverflow, Key, KeyParseError};
pub use btq_record as record;
pub use btq_record::{decode, Item, RawRecord, RecordError};
pub use btq_scan as scan;
pub use btq_scan::{
    ExtentInfo, ExtentIter, FreeSpaceIter, Items, RangeScanner, Record, ScanError, Subvolume,
    SubvolumeIter, Transport, TransportError, TreeSearch,
};
