//! Multi-device set: construction, GCD block maps, address translation.
//!
//! A [`DeviceSet`] concatenates the volume's tier-1 and tier-2 devices into
//! one ordered array (tier-1 first, matching the device table) and builds one
//! block-to-device map per tier. Each map's granularity is the greatest
//! common divisor of the tier's device sizes in blocks, so a single division
//! finds the owning device for any block number without requiring uniform or
//! power-of-two device sizes.
//!
//! Descriptors are read-only after construction; translation takes no locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dax;
use crate::device::{DaxMapping, Device, DeviceCatalog, DeviceHandle, IoDirection, OwnerTag};
use crate::error::{StorageError, StorageResult};
use crate::page::{o2p, p2o};
use crate::table::{self, DeviceTable, TableCheck, FLAG_SIM_SHADOW};
use crate::warn_cnd;

enum TierState {
    Dax {
        map: DaxMapping,
    },
    Block {
        // Best-effort dedup of failure logging; racy by design, never
        // correctness-bearing.
        err_read_reported: AtomicBool,
        err_write_reported: AtomicBool,
    },
}

/// Runtime descriptor of one member device.
pub struct DeviceInfo {
    handle: DeviceHandle,
    index: u16,
    nid: u8,
    size: u64,
    offset: u64,
    state: TierState,
}

impl DeviceInfo {
    /// The underlying device.
    #[inline]
    pub fn device(&self) -> &Arc<dyn Device> {
        self.handle.device()
    }

    /// Device name for diagnostics.
    #[inline]
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Ordinal within the full device array (tier-1 then tier-2).
    #[inline]
    pub fn index(&self) -> u16 {
        self.index
    }

    /// NUMA node this device's memory lives on.
    #[inline]
    pub fn nid(&self) -> u8 {
        self.nid
    }

    /// Declared size in bytes.
    #[inline]
    pub fn size_bytes(&self) -> u64 {
        self.size
    }

    /// Cumulative byte offset of this device within its tier.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Declared size in blocks.
    #[inline]
    pub fn blocks(&self) -> u64 {
        o2p(self.size)
    }

    /// First tier block number owned by this device.
    #[inline]
    pub fn start_bn(&self) -> u64 {
        o2p(self.offset)
    }

    /// The direct-access mapping, for tier-1 devices.
    pub fn dax(&self) -> Option<&DaxMapping> {
        match &self.state {
            TierState::Dax { map } => Some(map),
            TierState::Block { .. } => None,
        }
    }

    /// Returns whether this is a byte-addressable (tier-1) device.
    pub fn is_dax(&self) -> bool {
        matches!(self.state, TierState::Dax { .. })
    }

    /// Notes an I/O failure; returns true if this starts a new failure
    /// streak for the direction (the caller should log it).
    pub(crate) fn note_io_error(&self, dir: IoDirection) -> bool {
        let TierState::Block {
            err_read_reported,
            err_write_reported,
        } = &self.state
        else {
            return false;
        };
        let flag = match dir {
            IoDirection::Read => err_read_reported,
            IoDirection::Write => err_write_reported,
        };
        !flag.swap(true, Ordering::Relaxed)
    }

    /// Notes an I/O success, re-arming failure logging for the direction.
    pub(crate) fn note_io_success(&self, dir: IoDirection) {
        if let TierState::Block {
            err_read_reported,
            err_write_reported,
        } = &self.state
        {
            match dir {
                IoDirection::Read => err_read_reported.store(false, Ordering::Relaxed),
                IoDirection::Write => err_write_reported.store(false, Ordering::Relaxed),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn err_reported(&self, dir: IoDirection) -> bool {
        match &self.state {
            TierState::Block {
                err_read_reported,
                err_write_reported,
            } => match dir {
                IoDirection::Read => err_read_reported.load(Ordering::Relaxed),
                IoDirection::Write => err_write_reported.load(Ordering::Relaxed),
            },
            TierState::Dax { .. } => false,
        }
    }
}

/// Block-to-device lookup table for one tier, at GCD granularity.
pub struct TierMap {
    bn_gcd: u64,
    map: Vec<u16>,
}

impl TierMap {
    fn empty() -> Self {
        Self {
            bn_gcd: 1,
            map: Vec::new(),
        }
    }

    /// The map granularity: GCD of the tier's device sizes in blocks.
    #[inline]
    pub fn gcd(&self) -> u64 {
        self.bn_gcd
    }

    /// Number of map slots.
    #[inline]
    pub fn slots(&self) -> usize {
        self.map.len()
    }

    /// Ordinal of the device owning `bn`.
    ///
    /// # Panics
    /// Panics if `bn` is at or past the tier's declared total; range checking
    /// belongs to the caller, as on any translation hot path.
    #[inline]
    pub fn ordinal(&self, bn: u64) -> u16 {
        self.map[(bn / self.bn_gcd) as usize]
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Builds a tier's map: walk the slots, advancing a device cursor whenever
/// the slot's first block crosses the current device's cumulative boundary.
///
/// `dev_blocks` are the tier's per-device block counts in order; `first` is
/// the ordinal of the tier's first device in the full array.
fn build_map(
    dev_blocks: &[u64],
    first: usize,
    blocks: u64,
    bn_gcd: u64,
) -> StorageResult<TierMap> {
    if dev_blocks.is_empty() || blocks == 0 {
        return Ok(TierMap::empty());
    }

    let map_size = (blocks / bn_gcd) as usize;
    let mut map = Vec::with_capacity(map_size);

    let mut cursor = 0usize;
    let mut bn_end = dev_blocks[cursor];
    for i in 0..map_size {
        let bn = i as u64 * bn_gcd;
        while bn >= bn_end {
            cursor += 1;
            if cursor >= dev_blocks.len() {
                return Err(StorageError::CorruptTable {
                    reason: "device map overran the device list".to_string(),
                });
            }
            bn_end += dev_blocks[cursor];
        }
        map.push((first + cursor) as u16);
    }

    debug!(
        "tier map: {} devices, {} blocks, gcd {}, {} slots",
        dev_blocks.len(),
        blocks,
        bn_gcd,
        map_size
    );
    Ok(TierMap { bn_gcd, map })
}

/// The built volume: every member device, claimed and bound, plus the
/// per-tier block maps and the validated main table.
pub struct DeviceSet {
    devs: Vec<DeviceInfo>,
    t1_count: usize,
    t2_count: usize,
    t1a: TierMap,
    t2a: TierMap,
    table: DeviceTable,
}

impl DeviceSet {
    /// Opens the volume whose main table lives on the device `primary`.
    ///
    /// Resolves every declared member by uuid through `catalog`, claiming
    /// each for `owner`; binds tier-1 devices for direct access; re-validates
    /// each member's own table copy against the main one. Any failure aborts
    /// the open and releases everything already claimed.
    pub fn open(
        catalog: &Arc<DeviceCatalog>,
        primary: &Uuid,
        check: &TableCheck,
        owner: OwnerTag,
    ) -> StorageResult<DeviceSet> {
        let primary_handle = catalog.acquire(primary, owner)?;
        let table = table::read_table(&*primary_handle, check, None)?;
        let dev_list = table.dev_list.clone();
        let silent = check.silent;

        let mut primary_handle = Some(primary_handle);
        let mut devs: Vec<DeviceInfo> = Vec::with_capacity(dev_list.len());

        // Tier-1: claim, bind, validate, accumulate.
        let mut t1_gcd: u64 = 0;
        let mut total: u64 = 0;
        for (i, entry) in dev_list.t1_entries().iter().enumerate() {
            let handle = take_or_acquire(catalog, &mut primary_handle, entry.uuid, owner)?;
            let size = entry.size_bytes();

            let mapping = dax::bind(&*handle, size, silent)?;
            table::read_table(&*handle, check, Some(&table))?;

            if table.has_flag(FLAG_SIM_SHADOW) {
                restore_shadow(&handle, &mapping, size, silent)?;
            }

            // gcd(0, x) = x seeds the accumulator with the first device.
            t1_gcd = gcd(t1_gcd, entry.blocks());

            debug!(
                "t1 dev={} {} ({}) pfn={:#x} off={:#x} size={:#x}",
                i,
                entry.uuid,
                handle.name(),
                mapping.base_pfn(),
                total,
                size
            );

            devs.push(DeviceInfo {
                nid: mapping.node_first(),
                state: TierState::Dax { map: mapping },
                handle,
                index: i as u16,
                size,
                offset: total,
            });
            total += size;
        }

        if table.t1_blocks != o2p(total) {
            warn_cnd!(
                silent,
                "volume corrupted: table t1_blocks {:#x} != device total {:#x}",
                table.t1_blocks,
                o2p(total)
            );
            return Err(StorageError::BlockCountMismatch {
                tier: "t1",
                declared: table.t1_blocks,
                summed: o2p(total),
            });
        }
        let t1_count = dev_list.t1_count as usize;
        let t1_sizes: Vec<u64> = devs.iter().map(|d| d.blocks()).collect();
        let t1a = build_map(&t1_sizes, 0, table.t1_blocks, t1_gcd.max(1))?;

        // Tier-2: claim and validate; no binding.
        let mut t2_gcd: u64 = 0;
        let mut total: u64 = 0;
        for (i, entry) in dev_list.t2_entries().iter().enumerate() {
            let handle = take_or_acquire(catalog, &mut primary_handle, entry.uuid, owner)?;
            let size = entry.size_bytes();

            table::read_table(&*handle, check, Some(&table))?;

            t2_gcd = gcd(t2_gcd, entry.blocks());

            debug!(
                "t2 dev={} {} ({}) off={:#x} size={:#x}",
                i,
                entry.uuid,
                handle.name(),
                total,
                size
            );

            devs.push(DeviceInfo {
                nid: entry.nid(),
                state: TierState::Block {
                    err_read_reported: AtomicBool::new(false),
                    err_write_reported: AtomicBool::new(false),
                },
                handle,
                index: (t1_count + i) as u16,
                size,
                offset: total,
            });
            total += size;
        }

        if table.t2_blocks != o2p(total) {
            warn_cnd!(
                silent,
                "volume corrupted: table t2_blocks {:#x} != device total {:#x}",
                table.t2_blocks,
                o2p(total)
            );
            return Err(StorageError::BlockCountMismatch {
                tier: "t2",
                declared: table.t2_blocks,
                summed: o2p(total),
            });
        }
        let t2_count = dev_list.t2_count as usize;
        let t2_sizes: Vec<u64> = devs[t1_count..].iter().map(|d| d.blocks()).collect();
        let t2a = build_map(&t2_sizes, t1_count, table.t2_blocks, t2_gcd.max(1))?;

        info!(
            "opened volume {}: {} t1 + {} t2 devices, {:#x}/{:#x} blocks",
            table.uuid, t1_count, t2_count, table.t1_blocks, table.t2_blocks
        );

        Ok(DeviceSet {
            devs,
            t1_count,
            t2_count,
            t1a,
            t2a,
            table,
        })
    }

    /// The validated main table.
    #[inline]
    pub fn table(&self) -> &DeviceTable {
        &self.table
    }

    /// Number of tier-1 devices.
    #[inline]
    pub fn t1_count(&self) -> usize {
        self.t1_count
    }

    /// Number of tier-2 devices.
    #[inline]
    pub fn t2_count(&self) -> usize {
        self.t2_count
    }

    /// Total device count.
    #[inline]
    pub fn device_count(&self) -> usize {
        self.devs.len()
    }

    /// Descriptor by ordinal in the full array.
    #[inline]
    pub fn device_info(&self, ordinal: u16) -> &DeviceInfo {
        &self.devs[ordinal as usize]
    }

    /// The i-th tier-1 descriptor.
    #[inline]
    pub fn t1_dev(&self, i: usize) -> &DeviceInfo {
        &self.devs[i]
    }

    /// The i-th tier-2 descriptor.
    #[inline]
    pub fn t2_dev(&self, i: usize) -> &DeviceInfo {
        &self.devs[self.t1_count + i]
    }

    /// Total tier-1 blocks the volume declares.
    #[inline]
    pub fn t1_blocks(&self) -> u64 {
        self.table.t1_blocks
    }

    /// Total tier-2 blocks the volume declares.
    #[inline]
    pub fn t2_blocks(&self) -> u64 {
        self.table.t2_blocks
    }

    /// The tier-1 block map.
    #[inline]
    pub fn t1_map(&self) -> &TierMap {
        &self.t1a
    }

    /// The tier-2 block map.
    #[inline]
    pub fn t2_map(&self) -> &TierMap {
        &self.t2a
    }

    /// Tier-1 device owning block `bn`.
    #[inline]
    pub fn t1_device_for_block(&self, bn: u64) -> &DeviceInfo {
        &self.devs[self.t1a.ordinal(bn) as usize]
    }

    /// Tier-2 device owning block `bn`.
    #[inline]
    pub fn t2_device_for_block(&self, bn: u64) -> &DeviceInfo {
        &self.devs[self.t2a.ordinal(bn) as usize]
    }

    /// Tier-1 block number local to its owning device.
    #[inline]
    pub fn t1_local_bn(&self, bn: u64) -> u64 {
        bn - self.t1_device_for_block(bn).start_bn()
    }

    /// Tier-2 block number local to its owning device.
    #[inline]
    pub fn t2_local_bn(&self, bn: u64) -> u64 {
        bn - self.t2_device_for_block(bn).start_bn()
    }

    /// Physical frame number backing tier-1 block `bn`; what a fault handler
    /// installs for that single page.
    #[inline]
    pub fn pfn(&self, bn: u64) -> u64 {
        let mdi = self.t1_device_for_block(bn);
        let map = mdi.dax().expect("tier-1 descriptor always carries a mapping");
        map.base_pfn() + (bn - mdi.start_bn())
    }

    /// Virtual address of tier-1 byte `offset`.
    ///
    /// Offset 0 is reserved to mean "no value" and translates to null. The
    /// lookup is unchecked; callers must range-check untrusted offsets first
    /// (see [`DeviceSet::addr_checked`]).
    #[inline]
    pub fn addr(&self, offset: u64) -> *mut u8 {
        if offset == 0 {
            return std::ptr::null_mut();
        }
        let mdi = self.t1_device_for_block(o2p(offset));
        let map = mdi.dax().expect("tier-1 descriptor always carries a mapping");
        unsafe { map.base().add((offset - mdi.offset()) as usize) }
    }

    /// Range-checked variant of [`DeviceSet::addr`] for untrusted offsets.
    ///
    /// The tier's total byte count itself is rejected: it is one past the
    /// last mapped byte and owns no device.
    pub fn addr_checked(&self, offset: u64) -> Option<*mut u8> {
        if offset != 0 && offset >= p2o(self.t1_blocks()) {
            warn!("offset {:#x} >= max {:#x}", offset, p2o(self.t1_blocks()));
            return None;
        }
        Some(self.addr(offset))
    }

    /// Virtual address of tier-1 block `bn`.
    #[inline]
    pub fn baddr(&self, bn: u64) -> *mut u8 {
        self.addr(p2o(bn))
    }

    /// Tears the set down: unmaps tier-1 devices and releases every claim.
    pub fn close(self) {
        info!("closing volume {}", self.table.uuid);
        // Mappings and claims release on drop, exactly once.
    }
}

fn take_or_acquire(
    catalog: &Arc<DeviceCatalog>,
    primary: &mut Option<DeviceHandle>,
    uuid: Uuid,
    owner: OwnerTag,
) -> StorageResult<DeviceHandle> {
    if primary.as_ref().is_some_and(|h| h.uuid() == uuid) {
        return Ok(primary.take().expect("checked above"));
    }
    catalog.acquire(&uuid, owner)
}

/// Restores a tier-1 device's shadow image (its upper half) over the live
/// half, for volumes formatted with the simulate-cache-shadow flag.
fn restore_shadow(
    dev: &DeviceHandle,
    mapping: &DaxMapping,
    size: u64,
    silent: bool,
) -> StorageResult<()> {
    if dev.size_bytes() < 2 * size {
        warn_cnd!(
            silent,
            "shadow flag set but {} holds no shadow image",
            dev.name()
        );
        return Err(StorageError::DeviceTooSmall {
            device: dev.name().to_string(),
            declared: 2 * size,
            actual: dev.size_bytes(),
        });
    }

    const CHUNK: usize = 1 << 20;
    let mut buf = vec![0u8; CHUNK.min(size as usize)];
    let mut done = 0u64;
    while done < size {
        let n = buf.len().min((size - done) as usize);
        dev.read_at(size + done, &mut buf[..n])?;
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), mapping.base().add(done as usize), n);
        }
        done += n as u64;
    }
    debug!("restored shadow image on {} ({:#x} bytes)", dev.name(), size);
    Ok(())
}
