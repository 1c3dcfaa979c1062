// Basalt Operating System
// Copyright (C) 2026 Basalt Contributors
// SPDX-License-Identifier: MIT
//
//! Unit tests for the AHCI driver module.

use x86_64::{PhysAddr, VirtAddr};

use super::constants::*;
use super::io::{build_prdt_from_phys, build_prdt_from_virt};
use super::types::*;

fn empty_table() -> alloc::boxed::Box<CommandTable> {
    // SAFETY: CommandTable is plain-old-data; all-zeroes is a valid state.
    unsafe { alloc::boxed::Box::new_zeroed().assume_init() }
}

#[test]
fn command_header_is_32_bytes() {
    assert_eq!(core::mem::size_of::<CommandHeader>(), 32);
}

#[test]
fn prdt_entry_is_16_bytes() {
    assert_eq!(core::mem::size_of::<PrdtEntry>(), 16);
}

#[test]
fn command_table_is_128_byte_aligned_and_fits_a_page() {
    assert_eq!(core::mem::align_of::<CommandTable>(), 128);
    assert!(core::mem::size_of::<CommandTable>() <= 4096);
}

#[test]
fn register_fis_is_five_dwords() {
    assert_eq!(core::mem::size_of::<FisRegH2d>(), 20);
}

#[test]
fn header_flags_pack_cfl_and_write() {
    let read = header_flags(5, false);
    assert_eq!(read & 0x1F, 5);
    assert_eq!(read & (1 << 6), 0);

    let write = header_flags(5, true);
    assert_eq!(write & 0x1F, 5);
    assert_ne!(write & (1 << 6), 0);

    // CFL is five bits wide.
    assert_eq!(header_flags(32, false) & 0x1F, 0);
}

#[test]
fn command_fis_splits_the_lba_across_six_bytes() {
    let fis = FisRegH2d::command(ATA_CMD_READ_DMA_EXT, 0x0000_8877_6655_4433, 0x0102);
    assert_eq!(fis.fis_type, FIS_TYPE_REG_H2D);
    assert_eq!(fis.pmport_c, 1 << 7);
    assert_eq!(fis.command, 0x25);
    assert_eq!(
        [fis.lba0, fis.lba1, fis.lba2, fis.lba3, fis.lba4, fis.lba5],
        [0x33, 0x44, 0x55, 0x66, 0x77, 0x88]
    );
    assert_eq!(fis.device, ATA_DEVICE_LBA);
    assert_eq!(fis.count_low, 0x02);
    assert_eq!(fis.count_high, 0x01);
}

#[test]
fn prdt_from_virt_splits_on_page_boundaries() {
    let mut table = empty_table();
    // Identity-ish translation: virtual page N maps to physical page N + 16.
    let translate = |va: VirtAddr| Some(PhysAddr::new(va.as_u64() + 16 * 4096));

    // 0x3000 bytes starting 0x200 into a page: short head fragment, two
    // full pages, and a tail.
    let prdtl = build_prdt_from_virt(&mut table, VirtAddr::new(0x10_0200), 0x3000, translate);
    assert_eq!(prdtl, Some(4));

    assert_eq!(table.prdt[0].dba, 0x11_0200);
    assert_eq!(table.prdt[0].dbc & 0x3F_FFFF, 0x0E00 - 1);
    assert_eq!(table.prdt[1].dba, 0x11_1000);
    assert_eq!(table.prdt[1].dbc & 0x3F_FFFF, 0x1000 - 1);
    assert_eq!(table.prdt[3].dbc & 0x3F_FFFF, 0x0200 - 1);
    // Interrupt-on-completion set on every fragment.
    for i in 0..4 {
        assert_ne!(table.prdt[i].dbc & (1 << 31), 0);
    }
}

#[test]
fn prdt_from_virt_fails_on_untranslatable_pages() {
    let mut table = empty_table();
    let prdtl = build_prdt_from_virt(&mut table, VirtAddr::new(0x10_0000), 0x2000, |_| None);
    assert_eq!(prdtl, None);
}

#[test]
fn prdt_from_virt_fails_past_the_table_limit() {
    let mut table = empty_table();
    let bytes = (AHCI_MAX_PRDT as u32 + 1) * 4096;
    let prdtl = build_prdt_from_virt(&mut table, VirtAddr::new(0x10_0000), bytes, |va| {
        Some(PhysAddr::new(va.as_u64()))
    });
    assert_eq!(prdtl, None);
}

#[test]
fn prdt_from_phys_uses_large_fragments() {
    let mut table = empty_table();
    // 6 MiB contiguous: one 4 MiB fragment plus one 2 MiB fragment.
    let prdtl = build_prdt_from_phys(&mut table, PhysAddr::new(0x20_0000), 6 * 1024 * 1024);
    assert_eq!(prdtl, Some(2));
    assert_eq!(table.prdt[0].dbc & 0x3F_FFFF, 4 * 1024 * 1024 - 1);
    assert_eq!(table.prdt[1].dba, 0x60_0000);
}

#[test]
fn identify_strings_are_swap_decoded_and_trimmed() {
    // "QEMU HARDDISK" byte-swapped into words 27.., space padded.
    let text = b"QEMU HARDDISK                           ";
    let mut identify = [0u16; 256];
    for (i, pair) in text.chunks(2).enumerate() {
        identify[27 + i] = (pair[0] as u16) << 8 | pair[1] as u16;
    }
    assert_eq!(decode_identify_string(&identify, 27, 20), "QEMU HARDDISK");
}

#[test]
fn signature_names() {
    assert_eq!(signature_name(SATA_SIG_ATA), "SATA");
    assert_eq!(signature_name(SATA_SIG_ATAPI), "ATAPI");
    assert_eq!(signature_name(SATA_SIG_SEMB), "SEMB");
    assert_eq!(signature_name(SATA_SIG_PM), "PM");
    assert_eq!(signature_name(0xDEAD_BEEF), "Unknown");
}

#[test]
fn register_offsets_match_the_spec() {
    assert_eq!(HBA_CAP, 0x00);
    assert_eq!(HBA_GHC, 0x04);
    assert_eq!(HBA_PI, 0x0C);
    assert_eq!(PORT_BASE + PORT_STRIDE, 0x180);
    assert_eq!(PORT_TFD, 0x20);
    assert_eq!(PORT_SSTS, 0x28);
    assert_eq!(PORT_SERR, 0x30);
    assert_eq!(PORT_CI, 0x38);
    assert_eq!(CMD_ST | CMD_FRE | CMD_FR | CMD_CR, 0xC011);
}

#[test]
fn ata_commands_are_48_bit_variants() {
    assert_eq!(ATA_CMD_READ_DMA_EXT, 0x25);
    assert_eq!(ATA_CMD_WRITE_DMA_EXT, 0x35);
    assert_eq!(ATA_CMD_FLUSH_CACHE_EXT, 0xEA);
    assert_eq!(ATA_CMD_IDENTIFY, 0xEC);
}
