// Basalt Operating System
// Copyright (C) 2026 Basalt Contributors
// SPDX-License-Identifier: MIT
//
//! AHCI register offsets and protocol constants (AHCI 1.3.1).

// HBA global registers.
pub const HBA_CAP: u32 = 0x00;
pub const HBA_GHC: u32 = 0x04;
pub const HBA_PI: u32 = 0x0C;
pub const HBA_VS: u32 = 0x10;

/// GHC: AHCI Enable.
pub const GHC_AE: u32 = 1 << 31;

// Per-port register block: 0x100 + port * 0x80.
pub const PORT_BASE: u32 = 0x100;
pub const PORT_STRIDE: u32 = 0x80;

pub const PORT_CLB: u32 = 0x00;
pub const PORT_CLBU: u32 = 0x04;
pub const PORT_FB: u32 = 0x08;
pub const PORT_FBU: u32 = 0x0C;
pub const PORT_IS: u32 = 0x10;
pub const PORT_CMD: u32 = 0x18;
pub const PORT_TFD: u32 = 0x20;
pub const PORT_SIG: u32 = 0x24;
pub const PORT_SSTS: u32 = 0x28;
pub const PORT_SERR: u32 = 0x30;
pub const PORT_CI: u32 = 0x38;

// PxCMD bits.
pub const CMD_ST: u32 = 1 << 0;
pub const CMD_FRE: u32 = 1 << 4;
pub const CMD_FR: u32 = 1 << 14;
pub const CMD_CR: u32 = 1 << 15;

// PxTFD task-file bits.
pub const TFD_ERR: u32 = 0x01;
pub const TFD_DRQ: u32 = 0x08;
pub const TFD_BSY: u32 = 0x80;

// Device detection: DET=3 (device + phy), IPM=1 (active).
pub const SSTS_DET_PRESENT: u32 = 3;
pub const SSTS_IPM_ACTIVE: u32 = 1;

// Port signatures.
pub const SATA_SIG_ATA: u32 = 0x0000_0101;
pub const SATA_SIG_ATAPI: u32 = 0xEB14_0101;
pub const SATA_SIG_SEMB: u32 = 0xC33C_0101;
pub const SATA_SIG_PM: u32 = 0x9669_0101;

/// Register FIS, host to device.
pub const FIS_TYPE_REG_H2D: u8 = 0x27;

// ATA commands (48-bit LBA variants).
pub const ATA_CMD_IDENTIFY: u8 = 0xEC;
pub const ATA_CMD_READ_DMA_EXT: u8 = 0x25;
pub const ATA_CMD_WRITE_DMA_EXT: u8 = 0x35;
pub const ATA_CMD_FLUSH_CACHE_EXT: u8 = 0xEA;

/// ATA device register: LBA mode.
pub const ATA_DEVICE_LBA: u8 = 1 << 6;

/// PRDT entries per command table; one page-sized fragment each bounds a
/// single command to roughly `AHCI_MAX_PRDT * 4 KiB` of payload.
pub const AHCI_MAX_PRDT: usize = 128;

// Bounded spin budgets, per wait site.
pub const SPIN_ENGINE_STOP: u32 = 20_000;
pub const SPIN_TASK_FILE_IDLE: u32 = 200_000;
pub const SPIN_COMMAND_LATCH: u32 = 1_000;
pub const SPIN_COMMAND_COMPLETE: u32 = 400_000;

/// Fixed pool of virtual pages for HBA MMIO windows, so multiple
/// controllers never collide.
pub const MMIO_VIRT_BASE: u64 = 0xFFFF_FFFF_A000_0000;
pub const MMIO_SLOTS: usize = 16;
