//! Partition table probe: GPT preferred, MBR fallback.
//!
//! Children are numbered from 1 in discovery order and registered as
//! offset/length-scoped views of the parent device.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::{BlockDevice, BlockError, PartTableKind, PartitionTable, SECTOR_SIZE};

const MAX_PARTITIONS: usize = 16;

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_ENTRY_MIN_SIZE: u32 = 128;
const MBR_PROTECTIVE_TYPE: u8 = 0xEE;

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

/// Probe `parent` and build its child devices. Returns which table was
/// found along with the children; a disk with neither table yields
/// `(None, [])`.
pub fn probe(
    parent: &Arc<BlockDevice>,
) -> Result<(PartTableKind, Vec<Arc<BlockDevice>>), BlockError> {
    if parent.sector_size() != SECTOR_SIZE {
        log_error!("block", "partition probe: sector_size={} unsupported", parent.sector_size());
        return Err(BlockError::InvalidArgument);
    }

    if let Some(children) = probe_gpt(parent)? {
        log_ok!("block", "GPT probe: {} partitions registered", children.len());
        return Ok((PartTableKind::Gpt, children));
    }

    let children = probe_mbr(parent)?;
    if children.is_empty() {
        log_info!("block", "no partition table found on {}", parent.name());
        Ok((PartTableKind::None, Vec::new()))
    } else {
        log_ok!("block", "MBR probe: {} partitions registered", children.len());
        Ok((PartTableKind::Mbr, children))
    }
}

/// GPT primary header at LBA 1. `Ok(None)` means "no GPT here"; sanity
/// failures on a present signature are also treated as absence after a
/// diagnostic, so the MBR fallback still runs.
fn probe_gpt(parent: &Arc<BlockDevice>) -> Result<Option<Vec<Arc<BlockDevice>>>, BlockError> {
    let mut header = vec![0u8; SECTOR_SIZE as usize];
    parent.read(1, 1, &mut header).map_err(|e| {
        log_error!("block", "GPT probe: failed to read LBA 1 ({})", e);
        e
    })?;

    if &header[0..8] != GPT_SIGNATURE {
        return Ok(None);
    }

    let header_size = read_u32(&header, 12);
    let part_entry_lba = read_u64(&header, 72);
    let num_entries = read_u32(&header, 80);
    let entry_size = read_u32(&header, 84);

    if !(92..=512).contains(&header_size) {
        log_error!("block", "GPT header_size looks wrong: {}", header_size);
        return Ok(None);
    }
    if !(GPT_ENTRY_MIN_SIZE..=1024).contains(&entry_size) {
        log_error!("block", "GPT part_entry_size unsupported: {}", entry_size);
        return Ok(None);
    }
    if !(1..=4096).contains(&num_entries) {
        log_error!("block", "GPT num_part_entries suspicious: {}", num_entries);
        return Ok(None);
    }

    let total_bytes = entry_size as u64 * num_entries as u64;
    let sectors_needed = total_bytes.div_ceil(SECTOR_SIZE as u64);
    if sectors_needed > 1024 {
        log_error!("block", "GPT entry array too large ({} sectors)", sectors_needed);
        return Ok(None);
    }

    let mut entries = vec![0u8; sectors_needed as usize * SECTOR_SIZE as usize];
    parent.read(part_entry_lba, sectors_needed as u32, &mut entries).map_err(|e| {
        log_error!("block", "GPT probe: failed to read entry array ({})", e);
        e
    })?;

    let mut children = Vec::new();
    for i in 0..num_entries as usize {
        if children.len() >= MAX_PARTITIONS {
            break;
        }
        let entry = &entries[i * entry_size as usize..(i + 1) * entry_size as usize];

        let type_guid: [u8; 16] = entry[0..16].try_into().unwrap();
        if type_guid == [0; 16] {
            continue;
        }
        let unique_guid: [u8; 16] = entry[16..32].try_into().unwrap();
        let first_lba = read_u64(entry, 32);
        let last_lba = read_u64(entry, 40);
        if first_lba == 0 && last_lba == 0 {
            continue;
        }
        if last_lba < first_lba {
            continue;
        }

        let count = last_lba - first_lba + 1;
        let child = BlockDevice::new_partition(
            parent,
            children.len() as u32 + 1,
            first_lba,
            count,
            PartitionTable::Gpt { type_guid, unique_guid },
        );
        log_ok!(
            "block",
            "GPT partition {}: start={:#x} count={:#x} name={}",
            children.len(),
            first_lba,
            count,
            child.name()
        );
        children.push(child);
    }

    if children.is_empty() {
        log_info!("block", "GPT present but no partitions found");
    }
    Ok(Some(children))
}

/// Legacy MBR at LBA 0: four primary entries, protective entries skipped.
fn probe_mbr(parent: &Arc<BlockDevice>) -> Result<Vec<Arc<BlockDevice>>, BlockError> {
    let mut sector = vec![0u8; SECTOR_SIZE as usize];
    parent.read(0, 1, &mut sector).map_err(|e| {
        log_error!("block", "MBR probe: failed to read LBA 0 ({})", e);
        e
    })?;

    if sector[510] != 0x55 || sector[511] != 0xAA {
        log_info!("block", "no valid MBR signature; skipping MBR partitions");
        return Ok(Vec::new());
    }

    let mut children = Vec::new();
    for i in 0..4 {
        let entry = &sector[446 + i * 16..446 + (i + 1) * 16];
        let part_type = entry[4];
        let lba_start = read_u32(entry, 8);
        let lba_count = read_u32(entry, 12);

        if part_type == 0 || lba_count == 0 {
            continue;
        }
        if part_type == MBR_PROTECTIVE_TYPE {
            // GPT's guard entry; the GPT probe already had its chance.
            log_info!("block", "protective MBR entry (0xEE) ignored");
            continue;
        }

        let child = BlockDevice::new_partition(
            parent,
            children.len() as u32 + 1,
            lba_start as u64,
            lba_count as u64,
            PartitionTable::Mbr { part_type },
        );
        log_ok!(
            "block",
            "MBR partition {}: type={:#04x} start={} count={} name={}",
            children.len(),
            part_type,
            lba_start,
            lba_count,
            child.name()
        );
        children.push(child);
    }
    Ok(children)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_gpt_header(dev: &Arc<BlockDevice>, num_entries: u32, entry_size: u32) {
        let mut header = vec![0u8; 512];
        header[0..8].copy_from_slice(GPT_SIGNATURE);
        header[12..16].copy_from_slice(&92u32.to_le_bytes()); // header_size
        header[72..80].copy_from_slice(&2u64.to_le_bytes()); // part_entry_lba
        header[80..84].copy_from_slice(&num_entries.to_le_bytes());
        header[84..88].copy_from_slice(&entry_size.to_le_bytes());
        dev.write(1, 1, &header).unwrap();
    }

    fn gpt_entry(type_byte: u8, first: u64, last: u64) -> [u8; 128] {
        let mut entry = [0u8; 128];
        entry[0] = type_byte; // non-zero type GUID
        entry[15] = type_byte;
        entry[16] = 0xAB; // unique GUID
        entry[32..40].copy_from_slice(&first.to_le_bytes());
        entry[40..48].copy_from_slice(&last.to_le_bytes());
        entry
    }

    #[test]
    fn gpt_disk_yields_scoped_children() {
        let disk = BlockDevice::new_ram("ram0", 16384);
        write_gpt_header(&disk, 128, 128);

        // 128 entries of 128 bytes = 32 sectors at LBA 2; two are live.
        let mut array = vec![0u8; 32 * 512];
        array[0..128].copy_from_slice(&gpt_entry(0x11, 2048, 4095));
        array[128..256].copy_from_slice(&gpt_entry(0x22, 4096, 8191));
        disk.write(2, 32, &array).unwrap();

        let (kind, children) = probe(&disk).unwrap();
        assert_eq!(kind, PartTableKind::Gpt);
        assert_eq!(children.len(), 2);

        assert_eq!(children[0].name(), "ram0p1");
        assert_eq!(children[0].extent(), Some((2048, 2048)));
        assert_eq!(children[1].name(), "ram0p2");
        assert_eq!(children[1].extent(), Some((4096, 4096)));

        match children[0].provenance() {
            Some(PartitionTable::Gpt { type_guid, unique_guid }) => {
                assert_eq!(type_guid[0], 0x11);
                assert_eq!(unique_guid[0], 0xAB);
            }
            _ => panic!("expected GPT provenance"),
        }

        // Sibling extents are disjoint and inside the parent.
        let (s0, c0) = children[0].extent().unwrap();
        let (s1, c1) = children[1].extent().unwrap();
        assert!(s0 + c0 <= s1 || s1 + c1 <= s0);
        assert!(s1 + c1 <= disk.total_sectors());
    }

    #[test]
    fn gpt_skips_empty_and_inverted_entries() {
        let disk = BlockDevice::new_ram("ram0", 16384);
        write_gpt_header(&disk, 4, 128);

        let mut array = vec![0u8; 512];
        array[0..128].copy_from_slice(&gpt_entry(0x11, 2048, 4095));
        // Entry 1: zero type GUID (empty). Entry 2: last < first.
        array[256..384].copy_from_slice(&gpt_entry(0x33, 500, 400));
        disk.write(2, 1, &array).unwrap();

        let (kind, children) = probe(&disk).unwrap();
        assert_eq!(kind, PartTableKind::Gpt);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].extent(), Some((2048, 2048)));
    }

    #[test]
    fn gpt_with_bad_sizes_falls_back_to_mbr() {
        let disk = BlockDevice::new_ram("ram0", 8192);
        write_gpt_header(&disk, 128, 64); // entry_size below the minimum

        // Valid MBR behind it.
        let mut mbr = vec![0u8; 512];
        mbr[446 + 4] = 0x83;
        mbr[446 + 8..446 + 12].copy_from_slice(&2048u32.to_le_bytes());
        mbr[446 + 12..446 + 16].copy_from_slice(&1024u32.to_le_bytes());
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
        disk.write(0, 1, &mbr).unwrap();

        let (kind, children) = probe(&disk).unwrap();
        assert_eq!(kind, PartTableKind::Mbr);
        assert_eq!(children.len(), 1);
    }

    #[test]
    fn mbr_disk_yields_typed_children() {
        let disk = BlockDevice::new_ram("ram0", 8192);

        let mut mbr = vec![0u8; 512];
        mbr[446 + 4] = 0x83;
        mbr[446 + 8..446 + 12].copy_from_slice(&2048u32.to_le_bytes());
        mbr[446 + 12..446 + 16].copy_from_slice(&1024u32.to_le_bytes());
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
        disk.write(0, 1, &mbr).unwrap();

        let (kind, children) = probe(&disk).unwrap();
        assert_eq!(kind, PartTableKind::Mbr);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name(), "ram0p1");
        assert_eq!(children[0].extent(), Some((2048, 1024)));
        assert_eq!(
            children[0].provenance(),
            Some(&PartitionTable::Mbr { part_type: 0x83 })
        );
    }

    #[test]
    fn protective_mbr_entries_are_ignored() {
        let disk = BlockDevice::new_ram("ram0", 8192);

        let mut mbr = vec![0u8; 512];
        mbr[446 + 4] = MBR_PROTECTIVE_TYPE;
        mbr[446 + 8..446 + 12].copy_from_slice(&1u32.to_le_bytes());
        mbr[446 + 12..446 + 16].copy_from_slice(&8191u32.to_le_bytes());
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
        disk.write(0, 1, &mbr).unwrap();

        let (kind, children) = probe(&disk).unwrap();
        assert_eq!(kind, PartTableKind::None);
        assert!(children.is_empty());
    }

    #[test]
    fn blank_disk_has_no_table() {
        let disk = BlockDevice::new_ram("ram0", 64);
        let (kind, children) = probe(&disk).unwrap();
        assert_eq!(kind, PartTableKind::None);
        assert!(children.is_empty());
    }
}
