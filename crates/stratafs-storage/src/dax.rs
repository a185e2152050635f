//! Tier-1 direct-access binding.
//!
//! Maps a byte-addressable device's declared range into the address space and
//! hands back the [`DaxMapping`] translation works from. Binding failures are
//! fatal for the device's open; a mapping that spans NUMA nodes merely warns,
//! since it degrades placement but not addressing.

use tracing::{debug, warn};

use crate::device::{DaxMapping, Device};
use crate::error::{StorageError, StorageResult};
use crate::warn_cnd;

/// Binds `len` bytes of `dev` for direct access.
pub fn bind(dev: &dyn Device, len: u64, silent: bool) -> StorageResult<DaxMapping> {
    let Some(res) = dev.direct_access(len) else {
        warn_cnd!(silent, "device {} offers no direct access", dev.name());
        return Err(StorageError::DirectAccessUnsupported {
            device: dev.name().to_string(),
        });
    };

    let mapping = match res {
        Ok(mapping) => mapping,
        Err(e) => {
            warn_cnd!(silent, "direct access on {} failed: {}", dev.name(), e);
            return Err(e.into());
        }
    };

    if mapping.len() < len {
        warn_cnd!(
            silent,
            "unsupported direct-access device {} (range mismatch): {:#x} < {:#x}",
            dev.name(),
            mapping.len(),
            len
        );
        return Err(StorageError::DeviceRangeMismatch {
            device: dev.name().to_string(),
            mapped: mapping.len(),
            requested: len,
        });
    }

    if mapping.node_first() != mapping.node_last() {
        warn!("pmem {} crosses NUMA boundaries", dev.name());
    }

    debug!(
        "bound {}: base={:p} pfn={:#x} len={:#x}",
        dev.name(),
        mapping.base(),
        mapping.base_pfn(),
        mapping.len()
    );
    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::TestDevice;
    use crate::device::PmemDevice;
    use crate::page::PAGE_SIZE;
    use uuid::Uuid;

    fn pmem(pages: u64) -> (tempfile::NamedTempFile, PmemDevice) {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(pages * PAGE_SIZE as u64).unwrap();
        let dev = PmemDevice::open(file.path(), Uuid::new_v4()).unwrap();
        (file, dev)
    }

    #[test]
    fn test_bind_full_range() {
        let (_file, dev) = pmem(8);
        let mapping = bind(&dev, 8 * PAGE_SIZE as u64, false).unwrap();
        assert_eq!(mapping.len(), 8 * PAGE_SIZE as u64);
        assert!(!mapping.base().is_null());
    }

    #[test]
    fn test_bind_block_only_device_unsupported() {
        let dev = TestDevice::new("blk0", Uuid::new_v4(), 4 * PAGE_SIZE as u64);
        assert!(matches!(
            bind(&dev, PAGE_SIZE as u64, true),
            Err(StorageError::DirectAccessUnsupported { .. })
        ));
    }

    #[test]
    fn test_bind_short_mapping_is_range_mismatch() {
        let (_file, dev) = pmem(8);
        let dev = dev.limit_direct_access(4 * PAGE_SIZE as u64);
        assert!(matches!(
            bind(&dev, 8 * PAGE_SIZE as u64, true),
            Err(StorageError::DeviceRangeMismatch { .. })
        ));
    }

    #[test]
    fn test_bind_zero_mapping_is_range_mismatch() {
        let (_file, dev) = pmem(8);
        let dev = dev.limit_direct_access(0);
        assert!(matches!(
            bind(&dev, 8 * PAGE_SIZE as u64, true),
            Err(StorageError::DeviceRangeMismatch { mapped: 0, .. })
        ));
    }

    #[test]
    fn test_bind_numa_span_warns_but_succeeds() {
        let (_file, dev) = pmem(8);
        let dev = dev.with_numa_span(0, 1);
        let mapping = bind(&dev, 8 * PAGE_SIZE as u64, false).unwrap();
        assert_eq!(mapping.node_first(), 0);
        assert_eq!(mapping.node_last(), 1);
    }
}
