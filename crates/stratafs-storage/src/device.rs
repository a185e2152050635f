//! Device abstraction and exclusive ownership.
//!
//! A [`Device`] exposes random byte access (used by the table codec), an
//! optional direct-access mapping (tier-1 capability), and asynchronous block
//! submission (tier-2 path). Devices are resolved by uuid through a
//! [`DeviceCatalog`], which enforces single ownership: a device claimed by any
//! owner cannot be claimed again until the handle drops. This protects
//! against the same device being mounted twice or repeated in a device list.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::page::{p2o, Page, PAGE_SHIFT, PAGE_SIZE};

/// Platform ceiling on pages per device request (scatter-gather limit).
pub const MAX_IO_VECTS: usize = 256;

/// Direction of a block transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    /// Device to page.
    Read,
    /// Page to device.
    Write,
}

impl IoDirection {
    /// Lowercase name for log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            IoDirection::Read => "read",
            IoDirection::Write => "write",
        }
    }
}

/// Completion callback of a [`BlockIoRequest`]; fires exactly once.
pub type IoCompletionFn = Box<dyn FnOnce(&BlockIoRequest, io::Result<()>) + Send>;

/// One coalesced device request: a run of contiguous device-local blocks and
/// the pages that map onto them.
pub struct BlockIoRequest {
    dir: IoDirection,
    dev_index: Option<u16>,
    local_bn: Option<u64>,
    pages: Vec<Page>,
    max_vects: usize,
    completion: Option<IoCompletionFn>,
}

impl BlockIoRequest {
    /// Creates an empty request able to hold up to `max_vects` pages.
    ///
    /// The page vector is reserved up front so the append path never
    /// allocates; reservation failure is the batch's `AllocationFailure`.
    pub fn with_capacity(dir: IoDirection, max_vects: usize) -> StorageResult<Self> {
        let max_vects = max_vects.clamp(1, MAX_IO_VECTS);
        let mut pages = Vec::new();
        pages
            .try_reserve_exact(max_vects)
            .map_err(|_| StorageError::AllocationFailure)?;
        Ok(Self {
            dir,
            dev_index: None,
            local_bn: None,
            pages,
            max_vects,
            completion: None,
        })
    }

    /// Transfer direction.
    #[inline]
    pub fn dir(&self) -> IoDirection {
        self.dir
    }

    /// Ordinal of the device this request is bound to, if any yet.
    #[inline]
    pub fn dev_index(&self) -> Option<u16> {
        self.dev_index
    }

    /// Binds the request to a device ordinal.
    pub fn set_device(&mut self, index: u16) {
        self.dev_index = Some(index);
    }

    /// Starting device-local block number, set with the first page.
    #[inline]
    pub fn local_bn(&self) -> Option<u64> {
        self.local_bn
    }

    /// Records the starting device-local block number.
    pub fn set_local_bn(&mut self, bn: u64) {
        self.local_bn = Some(bn);
    }

    /// The pages appended so far, in submission order.
    #[inline]
    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    /// Number of pages appended so far.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Returns whether no page has been appended yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Appends a page; refuses once the vector limit is reached.
    #[must_use]
    pub fn push_page(&mut self, page: Page) -> bool {
        if self.pages.len() >= self.max_vects {
            return false;
        }
        self.pages.push(page);
        true
    }

    /// Installs the completion callback. Any previous callback is replaced.
    pub fn set_completion(&mut self, f: IoCompletionFn) {
        self.completion = Some(f);
    }

    /// Consumes the request, firing its completion callback with `res`.
    pub fn complete(mut self, res: io::Result<()>) {
        if let Some(f) = self.completion.take() {
            f(&self, res);
        }
    }
}

impl std::fmt::Debug for BlockIoRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockIoRequest")
            .field("dir", &self.dir)
            .field("dev_index", &self.dev_index)
            .field("local_bn", &self.local_bn)
            .field("pages", &self.pages.len())
            .field("max_vects", &self.max_vects)
            .finish()
    }
}

/// A live direct-access mapping of a tier-1 device.
///
/// The pointer stays valid for as long as the owning device is alive; the
/// device set keeps its handles for exactly that long.
#[derive(Debug)]
pub struct DaxMapping {
    base: *mut u8,
    len: u64,
    base_pfn: u64,
    node_first: u8,
    node_last: u8,
}

// Raw device memory; sharing across threads is inherent to direct access.
unsafe impl Send for DaxMapping {}
unsafe impl Sync for DaxMapping {}

impl DaxMapping {
    /// Wraps a mapped range. Frame numbers derive from the base address.
    pub fn new(base: *mut u8, len: u64, node_first: u8, node_last: u8) -> Self {
        Self {
            base,
            len,
            base_pfn: (base as u64) >> PAGE_SHIFT,
            node_first,
            node_last,
        }
    }

    /// Base virtual address of the mapping.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Mapped length in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns whether nothing was mapped.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Frame number of the first mapped page.
    #[inline]
    pub fn base_pfn(&self) -> u64 {
        self.base_pfn
    }

    /// NUMA node of the first mapped byte.
    #[inline]
    pub fn node_first(&self) -> u8 {
        self.node_first
    }

    /// NUMA node of the last mapped byte.
    #[inline]
    pub fn node_last(&self) -> u8 {
        self.node_last
    }
}

/// A storage medium participating in a volume.
pub trait Device: Send + Sync {
    /// Human-readable device name for diagnostics.
    fn name(&self) -> &str;

    /// Identity of this device, as recorded in the volume's device list.
    fn uuid(&self) -> Uuid;

    /// Bytes the device exposes.
    fn size_bytes(&self) -> u64;

    /// Reads `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes `buf` starting at `offset`.
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Requests a direct-access mapping of the first `len` bytes.
    ///
    /// `None` means the device has no such capability (block-only). A
    /// returned mapping may be shorter than requested; the binder decides
    /// what that means.
    fn direct_access(&self, len: u64) -> Option<io::Result<DaxMapping>> {
        let _ = len;
        None
    }

    /// NUMA node the device memory lives on.
    fn numa_node(&self) -> u8 {
        0
    }

    /// Queues an asynchronous block transfer. The request's completion
    /// callback fires exactly once, possibly inline before this returns.
    fn submit(&self, req: BlockIoRequest);
}

/// Transfers a request against a random-access backing, page by page.
fn transfer(dev: &dyn Device, req: &BlockIoRequest) -> io::Result<()> {
    let Some(start) = req.local_bn() else {
        return Ok(());
    };
    for (i, page) in req.pages().iter().enumerate() {
        let off = p2o(start + i as u64);
        match req.dir() {
            IoDirection::Write => page.with_read(|b| dev.write_at(off, b))?,
            IoDirection::Read => {
                let mut buf = vec![0u8; PAGE_SIZE];
                dev.read_at(off, &mut buf)?;
                page.copy_from(&buf);
            }
        }
    }
    Ok(())
}

/// A block-oriented device backed by a file or block special.
pub struct FileDevice {
    name: String,
    uuid: Uuid,
    file: File,
    size: u64,
}

impl FileDevice {
    /// Opens `path` read-write. `direct_io` bypasses the page cache.
    pub fn open(path: impl AsRef<Path>, uuid: Uuid, direct_io: bool) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(if direct_io { libc::O_DIRECT } else { 0 })
            .open(path)?;
        let size = file.metadata()?.len();
        info!("opened block device {} ({} bytes)", path.display(), size);
        Ok(Self {
            name: path.display().to_string(),
            uuid,
            file,
            size,
        })
    }
}

impl Device for FileDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn size_bytes(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    fn submit(&self, req: BlockIoRequest) {
        let res = transfer(self, &req);
        req.complete(res);
    }
}

/// A byte-addressable device: a file mapping standing in for persistent
/// memory, with the direct-access capability tier-1 binding requires.
pub struct PmemDevice {
    name: String,
    uuid: Uuid,
    map: UnsafeCell<memmap2::MmapMut>,
    size: u64,
    mappable: u64,
    node_first: u8,
    node_last: u8,
}

// The mapping is raw device memory handed out by `direct_access`; concurrent
// byte access is the nature of the medium, as with any DAX window.
unsafe impl Send for PmemDevice {}
unsafe impl Sync for PmemDevice {}

impl PmemDevice {
    /// Opens and maps `path` read-write for its full current length.
    pub fn open(path: impl AsRef<Path>, uuid: Uuid) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        let map = unsafe { memmap2::MmapMut::map_mut(&file)? };
        info!("mapped pmem device {} ({} bytes)", path.display(), size);
        Ok(Self {
            name: path.display().to_string(),
            uuid,
            map: UnsafeCell::new(map),
            size,
            mappable: size,
            node_first: 0,
            node_last: 0,
        })
    }

    /// Declares the NUMA nodes the mapped range begins and ends on.
    pub fn with_numa_span(mut self, first: u8, last: u8) -> Self {
        self.node_first = first;
        self.node_last = last;
        self
    }

    /// Caps how many bytes `direct_access` will hand out. Lets tests model a
    /// device whose mapping comes back short.
    pub fn limit_direct_access(mut self, bytes: u64) -> Self {
        self.mappable = bytes;
        self
    }

    fn base_ptr(&self) -> *mut u8 {
        unsafe { (*self.map.get()).as_mut_ptr() }
    }

    fn check_range(&self, offset: u64, len: usize) -> io::Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("access [{:#x}, +{:#x}) past device end {:#x}", offset, len, self.size),
            )),
        }
    }
}

impl Device for PmemDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn size_bytes(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.check_range(offset, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base_ptr().add(offset as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.check_range(offset, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                self.base_ptr().add(offset as usize),
                buf.len(),
            );
        }
        Ok(())
    }

    fn direct_access(&self, len: u64) -> Option<io::Result<DaxMapping>> {
        let granted = len.min(self.mappable);
        Some(Ok(DaxMapping::new(
            self.base_ptr(),
            granted,
            self.node_first,
            self.node_last,
        )))
    }

    fn numa_node(&self) -> u8 {
        self.node_first
    }

    fn submit(&self, req: BlockIoRequest) {
        let res = transfer(self, &req);
        req.complete(res);
    }
}

/// Tag identifying who claimed a device (one mount, one owner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerTag(
    /// Raw tag value; typically derived from the mount's identity.
    pub u64,
);

struct CatalogInner {
    devices: HashMap<Uuid, Arc<dyn Device>>,
    owners: HashMap<Uuid, OwnerTag>,
}

/// Uuid-keyed registry of known devices with exclusive-claim tracking.
pub struct DeviceCatalog {
    inner: Mutex<CatalogInner>,
}

impl DeviceCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(CatalogInner {
                devices: HashMap::new(),
                owners: HashMap::new(),
            }),
        })
    }

    /// Registers a device under its uuid. Replacing an entry is allowed only
    /// while the device is unclaimed.
    pub fn insert(&self, dev: Arc<dyn Device>) -> StorageResult<()> {
        let uuid = dev.uuid();
        let mut inner = self.inner.lock();
        if let Some(owner) = inner.owners.get(&uuid) {
            return Err(StorageError::AlreadyOwned {
                uuid,
                owner: owner.0,
            });
        }
        if inner.devices.insert(uuid, dev).is_some() {
            warn!("device {} re-registered in catalog", uuid);
        }
        Ok(())
    }

    /// Claims the device with `uuid` for `owner`.
    ///
    /// Fails with `AlreadyOwned` when any claim exists — including one by the
    /// same owner, which catches a device listed twice in a table.
    pub fn acquire(self: &Arc<Self>, uuid: &Uuid, owner: OwnerTag) -> StorageResult<DeviceHandle> {
        let mut inner = self.inner.lock();
        let dev = inner
            .devices
            .get(uuid)
            .cloned()
            .ok_or(StorageError::DeviceNotFound { uuid: *uuid })?;
        if let Some(existing) = inner.owners.get(uuid) {
            warn!(
                "device {} already owned by {:#x}, refusing claim by {:#x}",
                uuid, existing.0, owner.0
            );
            return Err(StorageError::AlreadyOwned {
                uuid: *uuid,
                owner: existing.0,
            });
        }
        inner.owners.insert(*uuid, owner);
        debug!("device {} claimed by {:#x}", uuid, owner.0);
        Ok(DeviceHandle {
            dev,
            uuid: *uuid,
            owner,
            catalog: Arc::clone(self),
        })
    }

    fn release(&self, uuid: &Uuid, owner: OwnerTag) {
        let mut inner = self.inner.lock();
        if inner.owners.get(uuid) == Some(&owner) {
            inner.owners.remove(uuid);
            debug!("device {} released by {:#x}", uuid, owner.0);
        }
    }

    /// Returns whether the device is currently claimed.
    pub fn is_owned(&self, uuid: &Uuid) -> bool {
        self.inner.lock().owners.contains_key(uuid)
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.inner.lock().devices.len()
    }

    /// Returns whether the catalog holds no devices.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An exclusive claim on a catalog device; released on drop.
pub struct DeviceHandle {
    dev: Arc<dyn Device>,
    uuid: Uuid,
    owner: OwnerTag,
    catalog: Arc<DeviceCatalog>,
}

impl DeviceHandle {
    /// The claimed device.
    #[inline]
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.dev
    }

    /// Uuid the claim is keyed on.
    #[inline]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Tag of the claim's owner.
    #[inline]
    pub fn owner(&self) -> OwnerTag {
        self.owner
    }
}

impl std::ops::Deref for DeviceHandle {
    type Target = dyn Device;

    fn deref(&self) -> &Self::Target {
        &*self.dev
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.catalog.release(&self.uuid, self.owner);
    }
}
