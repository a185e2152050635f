//! Property-based tests over the public volume API.
//!
//! These pin the invariants unit tests sample: GCD map ownership over
//! arbitrary device-size multisets, page I/O round trips at arbitrary
//! blocks, and table codec behavior under random corruption.

use std::io;
use std::sync::{Arc, RwLock};

use proptest::prelude::*;
use stratafs_storage::{
    read_table, write_table, BlockIoRequest, Device, DeviceCatalog, DeviceEntry, DeviceList,
    DeviceSet, DeviceTable, IoDirection, OwnerTag, Page, TableCheck, PAGE_SIZE,
    SHADOW_TABLE_OFFSET, TABLE_SIZE, TABLE_STATIC_SIZE,
};
use uuid::Uuid;

/// Blocks per 2 MiB, the device-size alignment unit.
const ALIGN_BLOCKS: u64 = 512;

/// In-memory block device for exercising the public API.
struct RamDisk {
    name: String,
    uuid: Uuid,
    data: RwLock<Vec<u8>>,
}

impl RamDisk {
    fn new(name: &str, uuid: Uuid, size: u64) -> Self {
        Self {
            name: name.to_string(),
            uuid,
            data: RwLock::new(vec![0u8; size as usize]),
        }
    }

    fn transfer(&self, req: &BlockIoRequest) -> io::Result<()> {
        let Some(start) = req.local_bn() else {
            return Ok(());
        };
        for (i, page) in req.pages().iter().enumerate() {
            let off = (start + i as u64) * PAGE_SIZE as u64;
            match req.dir() {
                IoDirection::Write => page.with_read(|b| self.write_at(off, b))?,
                IoDirection::Read => {
                    let mut buf = vec![0u8; PAGE_SIZE];
                    self.read_at(off, &mut buf)?;
                    page.copy_from(&buf);
                }
            }
        }
        Ok(())
    }
}

impl Device for RamDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn size_bytes(&self) -> u64 {
        self.data.read().unwrap().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let data = self.data.read().unwrap();
        let off = offset as usize;
        if off + buf.len() > data.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "past end"));
        }
        buf.copy_from_slice(&data[off..off + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut data = self.data.write().unwrap();
        let off = offset as usize;
        if off + buf.len() > data.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "past end"));
        }
        data[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn submit(&self, req: BlockIoRequest) {
        let res = self.transfer(&req);
        req.complete(res);
    }
}

/// Formats a tier-2-only volume across `dev_blocks`-sized ram disks.
fn format_volume(dev_blocks: &[u64]) -> (Arc<DeviceCatalog>, Uuid) {
    let catalog = DeviceCatalog::new();
    let entries: Vec<DeviceEntry> = dev_blocks
        .iter()
        .map(|&blocks| DeviceEntry::new(Uuid::new_v4(), blocks, 0))
        .collect();

    let mut table = DeviceTable::new(Uuid::new_v4());
    table.t2_blocks = dev_blocks.iter().sum();
    table.dev_list = DeviceList {
        self_index: 0,
        t1_count: 0,
        t2_count: dev_blocks.len() as u16,
        entries: entries.clone(),
    };

    for (i, entry) in entries.iter().enumerate() {
        table.dev_list.self_index = i as u16;
        let dev = RamDisk::new(
            &format!("ram{}", i),
            entry.uuid,
            entry.blocks() * PAGE_SIZE as u64,
        );
        write_table(&dev, &mut table).unwrap();
        catalog.insert(Arc::new(dev)).unwrap();
    }

    (catalog, entries[0].uuid)
}

fn open(catalog: &Arc<DeviceCatalog>, primary: &Uuid, owner: u64) -> DeviceSet {
    DeviceSet::open(catalog, primary, &TableCheck::default(), OwnerTag(owner)).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// `device_for_block` returns the device whose cumulative range holds
    /// the block, for every block in the volume.
    #[test]
    fn map_ownership_matches_prefix_sums(
        sizes in proptest::collection::vec(1u64..=4, 1..5),
    ) {
        let dev_blocks: Vec<u64> = sizes.iter().map(|s| s * ALIGN_BLOCKS).collect();
        let (catalog, primary) = format_volume(&dev_blocks);
        let set = open(&catalog, &primary, 1);

        let total: u64 = dev_blocks.iter().sum();
        prop_assert_eq!(set.t2_blocks(), total);
        prop_assert_eq!(set.t2_map().slots() as u64 * set.t2_map().gcd(), total);

        let mut offset = 0u64;
        for (i, &blocks) in dev_blocks.iter().enumerate() {
            for bn in offset..offset + blocks {
                let mdi = set.t2_device_for_block(bn);
                prop_assert_eq!(mdi.index() as usize, i);
                prop_assert_eq!(set.t2_local_bn(bn), bn - offset);
            }
            offset += blocks;
        }
    }

    /// A page written at any block reads back identically, across any
    /// device layout.
    #[test]
    fn page_roundtrip_at_arbitrary_block(
        sizes in proptest::collection::vec(1u64..=3, 1..4),
        bn_seed in any::<u64>(),
        fill in any::<u8>(),
    ) {
        let dev_blocks: Vec<u64> = sizes.iter().map(|s| s * ALIGN_BLOCKS).collect();
        let (catalog, primary) = format_volume(&dev_blocks);
        let set = Arc::new(open(&catalog, &primary, 2));

        let total: u64 = dev_blocks.iter().sum();
        let bn = bn_seed % total;

        let out = Page::from_bytes(&[fill; 64]);
        stratafs_storage::write_page(&set, bn, &out).unwrap();

        let back = Page::new();
        stratafs_storage::read_page(&set, bn, &back).unwrap();
        back.with_read(|b| {
            prop_assert_eq!(b[0], fill);
            prop_assert_eq!(b[63], fill);
            Ok(())
        })?;
    }

    /// Encode/decode round-trips arbitrary field values.
    #[test]
    fn table_codec_roundtrip(
        flags in any::<u64>(),
        t1_blocks in any::<u64>(),
        t2_blocks in any::<u64>(),
        n_devices in 1usize..8,
    ) {
        let mut table = DeviceTable::new(Uuid::new_v4());
        table.flags = flags;
        table.t1_blocks = t1_blocks;
        table.t2_blocks = t2_blocks;
        table.dev_list = DeviceList {
            self_index: 0,
            t1_count: 0,
            t2_count: n_devices as u16,
            entries: (0..n_devices)
                .map(|i| DeviceEntry::new(Uuid::new_v4(), (i as u64 + 1) * 7, i as u8))
                .collect(),
        };
        table.update_checksum();

        let decoded = DeviceTable::decode(&table.encode()).unwrap();
        prop_assert_eq!(decoded.flags, flags);
        prop_assert_eq!(decoded.t1_blocks, t1_blocks);
        prop_assert_eq!(decoded.t2_blocks, t2_blocks);
        prop_assert_eq!(decoded.dev_list, table.dev_list);
        prop_assert_eq!(decoded.checksum, table.checksum);
    }

    /// Flipping any single bit in the primary copy's static region is
    /// recovered from the shadow; flipping it in both copies is fatal.
    /// The version field is exempt: it is checked before the checksum, so
    /// corruption there surfaces as a version mismatch instead.
    #[test]
    fn single_bitflip_recovered_from_shadow(
        bit in (0usize..(TABLE_STATIC_SIZE * 8))
            .prop_filter("version field is checked before the checksum", |b| !(16..32).contains(b)),
    ) {
        let (catalog, primary) = format_volume(&[ALIGN_BLOCKS]);
        let handle = catalog.acquire(&primary, OwnerTag(3)).unwrap();
        let dev: &dyn Device = &**handle.device();
        let reference = read_table(dev, &TableCheck::default(), None).unwrap();
        let (byte, mask) = (bit / 8, 1u8 << (bit % 8));
        let mut b = [0u8; 1];
        dev.read_at(byte as u64, &mut b).unwrap();
        dev.write_at(byte as u64, &[b[0] ^ mask]).unwrap();

        let check = TableCheck { silent: true, ..Default::default() };
        let recovered = read_table(dev, &check, None).unwrap();
        prop_assert_eq!(recovered.uuid, reference.uuid);
        prop_assert_eq!(recovered.t2_blocks, reference.t2_blocks);
        prop_assert_eq!(recovered.dev_list, reference.dev_list);

        // Same flip in the shadow copy leaves nothing valid.
        let shadow_byte = SHADOW_TABLE_OFFSET + byte as u64;
        dev.read_at(shadow_byte, &mut b).unwrap();
        dev.write_at(shadow_byte, &[b[0] ^ mask]).unwrap();
        prop_assert!(read_table(dev, &check, None).is_err());
    }
}

#[test]
fn catalog_rejects_second_open_until_close() {
    let (catalog, primary) = format_volume(&[ALIGN_BLOCKS, ALIGN_BLOCKS]);

    let set = open(&catalog, &primary, 10);
    assert!(DeviceSet::open(&catalog, &primary, &TableCheck::default(), OwnerTag(11)).is_err());

    set.close();
    let set = open(&catalog, &primary, 11);
    assert_eq!(set.t2_count(), 2);
}

#[test]
fn unused_slot_bytes_do_not_affect_validation() {
    let (catalog, primary) = format_volume(&[ALIGN_BLOCKS]);
    let handle = catalog.acquire(&primary, OwnerTag(12)).unwrap();
    let dev: &dyn Device = &**handle.device();

    // Scribble over the padding past the dynamic region in both slots.
    let scribble = vec![0xEE; 64];
    dev.write_at(TABLE_SIZE as u64 - 64, &scribble).unwrap();
    dev.write_at(SHADOW_TABLE_OFFSET + TABLE_SIZE as u64 - 64, &scribble)
        .unwrap();

    assert!(read_table(dev, &TableCheck::default(), None).is_ok());
}
