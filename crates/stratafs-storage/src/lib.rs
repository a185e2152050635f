#![warn(missing_docs)]

//! StrataFS storage subsystem: multi-device tiered block layer.
//!
//! This crate is the storage-tiering core of StrataFS. It exposes a single
//! flat block address space per tier, backed by byte-addressable tier-1
//! devices (directly mapped) and block-oriented tier-2 devices:
//!
//! - the redundant on-disk device table and its validation ([`table`]),
//! - device resolution with exclusive ownership ([`device`]),
//! - the built volume with O(1) block-to-device translation ([`set`]),
//! - tier-1 direct-access binding ([`dax`]),
//! - and the coalescing asynchronous I/O engine for tier-2 ([`engine`]).

pub mod dax;
pub mod device;
pub mod engine;
pub mod error;
pub mod page;
pub mod registry;
pub mod set;
pub mod table;

/// Warns unless the caller asked for a silent (probe) validation.
macro_rules! warn_cnd {
    ($silent:expr, $($arg:tt)*) => {
        if !$silent {
            tracing::warn!($($arg)*);
        }
    };
}
pub(crate) use warn_cnd;

pub use device::{
    BlockIoRequest, DaxMapping, Device, DeviceCatalog, DeviceHandle, FileDevice, IoCompletionFn,
    IoDirection, OwnerTag, PmemDevice, MAX_IO_VECTS,
};
pub use engine::{read_page, write_page, BatchOptions, IoBatch, IoDoneFn};
pub use error::{StorageError, StorageResult};
pub use page::{o2p, o2p_up, p2o, Page, PAGE_SHIFT, PAGE_SIZE};
pub use registry::{FsType, FsTypeRegistry};
pub use set::{DeviceInfo, DeviceSet, TierMap};
pub use table::{
    read_table, write_table, DeviceEntry, DeviceList, DeviceTable, TableCheck, ALLOC_ALIGN,
    FLAG_SIM_SHADOW, MAX_DEVICES, MINORS_PER_MAJOR, SHADOW_TABLE_OFFSET, TABLE_MAGIC,
    TABLE_MAJOR_VERSION, TABLE_MINOR_VERSION, TABLE_SIZE, TABLE_STATIC_SIZE,
};
