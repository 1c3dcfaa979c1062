//! Block device abstraction and the device registry.
//!
//! A device is a name plus a capability target: the raw AHCI disk, an
//! offset/length-scoped partition view of a parent device, or a RAM disk.
//! Partition I/O is a bounds-checking wrapper around the parent; no
//! dynamic dispatch is involved.

pub mod partition;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::{Mutex, RwLock};

use crate::drivers::ahci::{self, AhciError};

pub const SECTOR_SIZE: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    OutOfMemory,
    DeviceTimeout,
    DeviceError,
    InvalidArgument,
    NotReady,
    Unsupported,
}

impl BlockError {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OutOfMemory => "out of memory",
            Self::DeviceTimeout => "device timeout",
            Self::DeviceError => "device error",
            Self::InvalidArgument => "invalid argument",
            Self::NotReady => "device not ready",
            Self::Unsupported => "operation not supported",
        }
    }
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<AhciError> for BlockError {
    fn from(e: AhciError) -> Self {
        match e {
            AhciError::NotReady => BlockError::NotReady,
            AhciError::CommandTimeout
            | AhciError::CommandNotLatched
            | AhciError::PortStuckBusy => BlockError::DeviceTimeout,
            AhciError::OutOfMemory => BlockError::OutOfMemory,
            AhciError::ZeroSectorCount | AhciError::BufferSizeMismatch => {
                BlockError::InvalidArgument
            }
            _ => BlockError::DeviceError,
        }
    }
}

/// Where a partition entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionTable {
    Mbr { part_type: u8 },
    Gpt { type_guid: [u8; 16], unique_guid: [u8; 16] },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartTableKind {
    None,
    Mbr,
    Gpt,
}

pub enum BlockTarget {
    /// The selected AHCI disk.
    Ahci,
    /// A scoped view of `parent`: child LBA 0 is parent LBA `lba_start`,
    /// `lba_count == 0` means unbounded (parent size unknown).
    Partition {
        parent: Arc<BlockDevice>,
        lba_start: u64,
        lba_count: u64,
        provenance: PartitionTable,
    },
    /// Memory-backed disk; also what the unit tests run against.
    Ram(Mutex<Vec<u8>>),
}

static NEXT_DEVICE_ID: AtomicU32 = AtomicU32::new(1);

pub struct BlockDevice {
    id: u32,
    name: String,
    sector_size: u32,
    total_sectors: u64,
    target: BlockTarget,
}

impl BlockDevice {
    fn alloc_id() -> u32 {
        NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed)
    }

    pub fn new_ahci(name: &str, total_sectors: u64) -> Arc<Self> {
        Arc::new(BlockDevice {
            id: Self::alloc_id(),
            name: String::from(name),
            sector_size: SECTOR_SIZE,
            total_sectors,
            target: BlockTarget::Ahci,
        })
    }

    pub fn new_ram(name: &str, sectors: u64) -> Arc<Self> {
        let mut backing = Vec::new();
        backing.resize(sectors as usize * SECTOR_SIZE as usize, 0);
        Arc::new(BlockDevice {
            id: Self::alloc_id(),
            name: String::from(name),
            sector_size: SECTOR_SIZE,
            total_sectors: sectors,
            target: BlockTarget::Ram(Mutex::new(backing)),
        })
    }

    pub(crate) fn new_partition(
        parent: &Arc<BlockDevice>,
        number: u32,
        lba_start: u64,
        lba_count: u64,
        provenance: PartitionTable,
    ) -> Arc<Self> {
        Arc::new(BlockDevice {
            id: Self::alloc_id(),
            name: alloc::format!("{}p{}", parent.name, number),
            sector_size: parent.sector_size,
            total_sectors: lba_count,
            target: BlockTarget::Partition {
                parent: Arc::clone(parent),
                lba_start,
                lba_count,
                provenance,
            },
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Total sectors, 0 when unknown.
    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    pub fn provenance(&self) -> Option<&PartitionTable> {
        match &self.target {
            BlockTarget::Partition { provenance, .. } => Some(provenance),
            _ => None,
        }
    }

    /// Parent-relative extent for partition devices.
    pub fn extent(&self) -> Option<(u64, u64)> {
        match &self.target {
            BlockTarget::Partition { lba_start, lba_count, .. } => Some((*lba_start, *lba_count)),
            _ => None,
        }
    }

    fn check_io(&self, lba: u64, count: u32, len: usize) -> Result<(), BlockError> {
        if count == 0 || len != count as usize * self.sector_size as usize {
            return Err(BlockError::InvalidArgument);
        }
        if self.total_sectors != 0
            && (lba >= self.total_sectors || count as u64 > self.total_sectors - lba)
        {
            return Err(BlockError::InvalidArgument);
        }
        Ok(())
    }

    pub fn read(&self, lba: u64, count: u32, buffer: &mut [u8]) -> Result<(), BlockError> {
        self.check_io(lba, count, buffer.len())?;
        match &self.target {
            BlockTarget::Ahci => {
                for (i, chunk) in buffer.chunks_mut(u16::MAX as usize * 512).enumerate() {
                    let part = (chunk.len() / 512) as u16;
                    ahci::read(lba + i as u64 * u16::MAX as u64, part, chunk)?;
                }
                Ok(())
            }
            BlockTarget::Partition { parent, lba_start, .. } => {
                parent.read(lba_start + lba, count, buffer)
            }
            BlockTarget::Ram(backing) => {
                let offset = lba as usize * SECTOR_SIZE as usize;
                buffer.copy_from_slice(&backing.lock()[offset..offset + buffer.len()]);
                Ok(())
            }
        }
    }

    pub fn write(&self, lba: u64, count: u32, buffer: &[u8]) -> Result<(), BlockError> {
        self.check_io(lba, count, buffer.len())?;
        match &self.target {
            BlockTarget::Ahci => {
                for (i, chunk) in buffer.chunks(u16::MAX as usize * 512).enumerate() {
                    let part = (chunk.len() / 512) as u16;
                    ahci::write(lba + i as u64 * u16::MAX as u64, part, chunk)?;
                }
                Ok(())
            }
            BlockTarget::Partition { parent, lba_start, .. } => {
                parent.write(lba_start + lba, count, buffer)
            }
            BlockTarget::Ram(backing) => {
                let offset = lba as usize * SECTOR_SIZE as usize;
                backing.lock()[offset..offset + buffer.len()].copy_from_slice(buffer);
                Ok(())
            }
        }
    }

    pub fn flush(&self) -> Result<(), BlockError> {
        match &self.target {
            BlockTarget::Ahci => Ok(ahci::flush()?),
            BlockTarget::Partition { parent, .. } => parent.flush(),
            BlockTarget::Ram(_) => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------

static BOOT_DEVICE: RwLock<Option<Arc<BlockDevice>>> = RwLock::new(None);
static PARTITIONS: RwLock<Vec<Arc<BlockDevice>>> = RwLock::new(Vec::new());
static TABLE_KIND: Mutex<PartTableKind> = Mutex::new(PartTableKind::None);

/// Wrap the selected AHCI disk as the boot block device and probe its
/// partition table.
pub fn init() {
    if !ahci::disk_ready() {
        log_error!("block", "no AHCI disk ready; boot block device not available");
        return;
    }

    let boot = BlockDevice::new_ahci("ahci0", ahci::disk_sectors());
    log_ok!(
        "block",
        "boot block device: {} (sector={}, sectors={})",
        boot.name(),
        boot.sector_size(),
        boot.total_sectors()
    );

    let (kind, children) = match partition::probe(&boot) {
        Ok(result) => result,
        Err(e) => {
            log_error!("block", "partition probe failed: {}", e);
            (PartTableKind::None, Vec::new())
        }
    };

    *BOOT_DEVICE.write() = Some(boot);
    *PARTITIONS.write() = children;
    *TABLE_KIND.lock() = kind;
}

pub fn boot_device() -> Option<Arc<BlockDevice>> {
    BOOT_DEVICE.read().clone()
}

pub fn partition_count() -> usize {
    PARTITIONS.read().len()
}

pub fn partition(index: usize) -> Option<Arc<BlockDevice>> {
    PARTITIONS.read().get(index).cloned()
}

pub fn partition_table_kind() -> PartTableKind {
    *TABLE_KIND.lock()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_device_round_trips_sectors() {
        let dev = BlockDevice::new_ram("ram0", 64);
        let pattern: Vec<u8> = (0..1024).map(|i| (i * 7 % 251) as u8).collect();

        dev.write(8, 2, &pattern).unwrap();
        let mut out = alloc::vec![0u8; 1024];
        dev.read(8, 2, &mut out).unwrap();
        assert_eq!(out, pattern);
        assert!(dev.flush().is_ok());
    }

    #[test]
    fn io_arguments_are_validated() {
        let dev = BlockDevice::new_ram("ram0", 8);
        let mut buf = [0u8; 512];

        assert_eq!(dev.read(0, 0, &mut []), Err(BlockError::InvalidArgument));
        assert_eq!(dev.read(0, 2, &mut buf), Err(BlockError::InvalidArgument));
        assert_eq!(dev.read(8, 1, &mut buf), Err(BlockError::InvalidArgument));
        assert_eq!(dev.read(7, 2, &mut [0u8; 1024]), Err(BlockError::InvalidArgument));
        assert!(dev.read(7, 1, &mut buf).is_ok());
    }

    #[test]
    fn partition_views_offset_and_bound_their_parent() {
        let parent = BlockDevice::new_ram("ram0", 128);
        let child = BlockDevice::new_partition(
            &parent,
            1,
            32,
            16,
            PartitionTable::Mbr { part_type: 0x83 },
        );
        assert_eq!(child.name(), "ram0p1");
        assert_eq!(child.extent(), Some((32, 16)));

        let data = [0xA5u8; 512];
        child.write(0, 1, &data).unwrap();

        // The write landed at parent LBA 32.
        let mut out = [0u8; 512];
        parent.read(32, 1, &mut out).unwrap();
        assert_eq!(out, data);

        // Beyond the child's extent is rejected before reaching the parent.
        assert_eq!(child.write(16, 1, &data), Err(BlockError::InvalidArgument));
        assert_eq!(child.read(15, 2, &mut [0u8; 1024]), Err(BlockError::InvalidArgument));
    }

    #[test]
    fn ahci_without_disk_reports_not_ready() {
        let dev = BlockDevice::new_ahci("ahci0", 0);
        let mut buf = [0u8; 512];
        assert_eq!(dev.read(0, 1, &mut buf), Err(BlockError::NotReady));
    }

    #[test]
    fn device_ids_are_unique() {
        let a = BlockDevice::new_ram("a", 1);
        let b = BlockDevice::new_ram("b", 1);
        assert_ne!(a.id(), b.id());
    }
}
