//! stratafs-mkfs: format backing devices into a StrataFS volume.
//!
//! Writes the dual-copy device table to every member device. Each copy is
//! identical except for its index-of-self, which is how a device later knows
//! which entry describes it. Tier-1 devices may optionally be formatted with
//! a shadow image in their upper half.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use stratafs_storage::{
    write_table, Device, DeviceEntry, DeviceList, DeviceTable, FileDevice, ALLOC_ALIGN,
    FLAG_SIM_SHADOW, MAX_DEVICES, PAGE_SIZE, SHADOW_TABLE_OFFSET, TABLE_SIZE,
};

#[derive(Parser, Debug)]
#[command(name = "stratafs-mkfs", version, about = "Format a StrataFS volume")]
struct Cli {
    /// Tier-1 (byte-addressable) backing files, in volume order.
    #[arg(long = "t1", value_name = "PATH")]
    t1: Vec<PathBuf>,

    /// Tier-2 (block) backing files, in volume order.
    #[arg(long = "t2", value_name = "PATH")]
    t2: Vec<PathBuf>,

    /// Volume uuid; generated when omitted.
    #[arg(long)]
    uuid: Option<Uuid>,

    /// Format tier-1 devices with a shadow image in their upper half.
    #[arg(long)]
    shadow: bool,

    /// Emit a machine-readable volume description on stdout.
    #[arg(long)]
    json: bool,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Serialize)]
struct DeviceSummary {
    path: PathBuf,
    uuid: Uuid,
    blocks: u64,
    bytes: u64,
}

#[derive(Debug, Serialize)]
struct VolumeSummary {
    uuid: Uuid,
    t1_blocks: u64,
    t2_blocks: u64,
    shadow: bool,
    t1: Vec<DeviceSummary>,
    t2: Vec<DeviceSummary>,
}

/// Usable blocks of a backing file: its length (halved when it must also
/// hold a shadow image) rounded down to the 2 MiB alignment unit.
fn device_blocks(len: u64, shadow: bool) -> u64 {
    let usable = if shadow { len / 2 } else { len };
    (usable & !(ALLOC_ALIGN - 1)) / PAGE_SIZE as u64
}

fn summarize(paths: &[PathBuf], shadow: bool) -> Result<Vec<DeviceSummary>> {
    paths
        .iter()
        .map(|path| {
            let len = fs::metadata(path)
                .with_context(|| format!("stat {}", path.display()))?
                .len();
            let blocks = device_blocks(len, shadow);
            if blocks == 0 {
                bail!(
                    "{}: too small, need at least {} bytes{}",
                    path.display(),
                    ALLOC_ALIGN,
                    if shadow { " of live half" } else { "" }
                );
            }
            Ok(DeviceSummary {
                path: path.clone(),
                uuid: Uuid::new_v4(),
                blocks,
                bytes: blocks * PAGE_SIZE as u64,
            })
        })
        .collect()
}

fn format_volume(cli: &Cli) -> Result<VolumeSummary> {
    if cli.t1.is_empty() && cli.t2.is_empty() {
        bail!("no devices given; pass --t1 and/or --t2");
    }
    if cli.t1.len() + cli.t2.len() > MAX_DEVICES {
        bail!("too many devices; the table holds at most {}", MAX_DEVICES);
    }

    let t1 = summarize(&cli.t1, cli.shadow)?;
    let t2 = summarize(&cli.t2, false)?;

    let volume_uuid = cli.uuid.unwrap_or_else(Uuid::new_v4);
    let entries: Vec<DeviceEntry> = t1
        .iter()
        .chain(t2.iter())
        .map(|d| DeviceEntry::new(d.uuid, d.blocks, 0))
        .collect();

    let mut table = DeviceTable::new(volume_uuid);
    if cli.shadow {
        table.flags |= FLAG_SIM_SHADOW;
    }
    table.t1_blocks = t1.iter().map(|d| d.blocks).sum();
    table.t2_blocks = t2.iter().map(|d| d.blocks).sum();
    table.dev_list = DeviceList {
        self_index: 0,
        t1_count: t1.len() as u16,
        t2_count: t2.len() as u16,
        entries,
    };

    for (i, summary) in t1.iter().chain(t2.iter()).enumerate() {
        table.dev_list.self_index = i as u16;
        let dev = FileDevice::open(&summary.path, summary.uuid, false)
            .with_context(|| format!("open {}", summary.path.display()))?;
        write_table(&dev, &mut table)
            .with_context(|| format!("write table to {}", summary.path.display()))?;

        // A shadow-formatted tier-1 device starts with a coherent table in
        // its shadow half too, so the restore at first mount is a no-op.
        if cli.shadow && i < t1.len() {
            let mut slots = vec![0u8; TABLE_SIZE + SHADOW_TABLE_OFFSET as usize];
            dev.read_at(0, &mut slots)?;
            dev.write_at(summary.bytes, &slots)?;
        }

        info!(
            "formatted {} as device {} ({} blocks)",
            summary.path.display(),
            i,
            summary.blocks
        );
    }

    Ok(VolumeSummary {
        uuid: volume_uuid,
        t1_blocks: table.t1_blocks,
        t2_blocks: table.t2_blocks,
        shadow: cli.shadow,
        t1,
        t2,
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "stratafs_mkfs=debug,stratafs_storage=debug"
    } else {
        "stratafs_mkfs=info,stratafs_storage=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with_target(false)
        .init();

    let summary = format_volume(&cli)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "volume {}: {} t1 device(s) / {:#x} blocks, {} t2 device(s) / {:#x} blocks",
            summary.uuid,
            summary.t1.len(),
            summary.t1_blocks,
            summary.t2.len(),
            summary.t2_blocks
        );
        for (i, dev) in summary.t1.iter().chain(summary.t2.iter()).enumerate() {
            println!("  dev {}: {} {} ({} blocks)", i, dev.uuid, dev.path.display(), dev.blocks);
        }
    }
    Ok(())
}
