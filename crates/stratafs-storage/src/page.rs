//! Page-granular units and block/byte conversions.

use std::sync::Arc;

use parking_lot::RwLock;

/// Log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;
/// Page size in bytes; the unit of block addressing on both tiers.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Converts a block number to its byte offset.
#[inline]
pub fn p2o(bn: u64) -> u64 {
    bn << PAGE_SHIFT
}

/// Converts a byte offset to the block number containing it.
#[inline]
pub fn o2p(offset: u64) -> u64 {
    offset >> PAGE_SHIFT
}

/// Converts a byte offset to a block count, rounding up.
#[inline]
pub fn o2p_up(offset: u64) -> u64 {
    o2p(offset + PAGE_SIZE as u64 - 1)
}

/// A shared page-sized buffer carried through the I/O engine.
///
/// Cloning is cheap (reference counted); the backing bytes are shared.
/// Stands in for the page-cache page the batching engine coalesces.
#[derive(Clone)]
pub struct Page {
    buf: Arc<RwLock<Box<[u8]>>>,
}

impl Page {
    /// Creates a zero-filled page.
    pub fn new() -> Self {
        Self {
            buf: Arc::new(RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice())),
        }
    }

    /// Creates a page initialized from `data`, zero-padded to the page size.
    ///
    /// # Panics
    /// Panics if `data` is longer than a page.
    pub fn from_bytes(data: &[u8]) -> Self {
        assert!(data.len() <= PAGE_SIZE, "page data over a page long");
        let mut buf = vec![0u8; PAGE_SIZE];
        buf[..data.len()].copy_from_slice(data);
        Self {
            buf: Arc::new(RwLock::new(buf.into_boxed_slice())),
        }
    }

    /// Runs `f` with shared read access to the page bytes.
    pub fn with_read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.buf.read())
    }

    /// Runs `f` with exclusive write access to the page bytes.
    pub fn with_write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.buf.write())
    }

    /// Copies the page contents out into a fresh vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.buf.read().to_vec()
    }

    /// Overwrites the page with `data`.
    ///
    /// # Panics
    /// Panics if `data` is not exactly a page long.
    pub fn copy_from(&self, data: &[u8]) {
        assert_eq!(data.len(), PAGE_SIZE, "page copy length mismatch");
        self.buf.write().copy_from_slice(data);
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Page({:p})", Arc::as_ptr(&self.buf))
    }
}
