//! Error types for the tiered storage core.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for storage operations.
///
/// Construction-time errors (table, device-set build) abort the whole open
/// and release every resource acquired so far. Batch-time errors are recorded
/// in the batch and surface at `end`/synchronous-call boundaries.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Both copies of the device table failed validation.
    #[error("Corrupt device table: {reason}")]
    CorruptTable {
        /// Description of what failed.
        reason: String,
    },

    /// The table's format version is incompatible with this build.
    #[error("Device table version mismatch: on-disk {found_major}.{found_minor}, supported {want_major}.{want_minor}")]
    VersionMismatch {
        /// Major version found on disk.
        found_major: u16,
        /// Minor version found on disk.
        found_minor: u16,
        /// Major version this build expects.
        want_major: u16,
        /// Highest minor version this build supports.
        want_minor: u16,
    },

    /// A member device carries a table for a different volume.
    #[error("Volume uuid mismatch: main {main}, device {found}")]
    UuidMismatch {
        /// Uuid recorded by the main table.
        main: Uuid,
        /// Uuid found on the offending device.
        found: Uuid,
    },

    /// Summed per-device block counts disagree with the table's declared total.
    #[error("Block count mismatch on {tier}: table declares {declared} blocks, devices sum to {summed}")]
    BlockCountMismatch {
        /// Tier name ("t1" or "t2").
        tier: &'static str,
        /// Total declared by the table.
        declared: u64,
        /// Total summed over the member devices.
        summed: u64,
    },

    /// A device is smaller than the size the table declares for it.
    #[error("Device {device} too small: declares {declared} bytes, device exposes {actual}")]
    DeviceTooSmall {
        /// Device name.
        device: String,
        /// Bytes the table declares.
        declared: u64,
        /// Bytes the device actually exposes.
        actual: u64,
    },

    /// A direct-access mapping came back shorter than the declared range.
    #[error("Device {device} range mismatch: mapped {mapped} of {requested} bytes")]
    DeviceRangeMismatch {
        /// Device name.
        device: String,
        /// Bytes actually mapped.
        mapped: u64,
        /// Bytes requested.
        requested: u64,
    },

    /// A tier-1 entry names a device with no direct-access capability.
    #[error("Device {device} does not support direct access")]
    DirectAccessUnsupported {
        /// Device name.
        device: String,
    },

    /// A page was rejected by the device even after a fresh request was tried.
    #[error("Page rejected by device {device} at block {bn:#x}")]
    PageRejected {
        /// Device ordinal.
        device: u16,
        /// The block number that could not be appended.
        bn: u64,
    },

    /// Request allocation failed; the page was not delivered.
    #[error("Allocation failure while building an I/O request")]
    AllocationFailure,

    /// An asynchronous completion reported failure (last failure wins).
    #[error("I/O completion error on device {device}: {source}")]
    IoCompletion {
        /// Device ordinal the failing request targeted.
        device: u16,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The device is already claimed by another owner.
    #[error("Device {uuid} already owned by {owner:#x}")]
    AlreadyOwned {
        /// Uuid of the contested device.
        uuid: Uuid,
        /// Tag of the current owner.
        owner: u64,
    },

    /// No device with the requested uuid is known to the catalog.
    #[error("Device not found: {uuid}")]
    DeviceNotFound {
        /// The uuid that could not be resolved.
        uuid: Uuid,
    },

    /// A filesystem type with this name is already registered.
    #[error("Filesystem type already registered: {name}")]
    AlreadyRegistered {
        /// The contested type name.
        name: String,
    },
}
