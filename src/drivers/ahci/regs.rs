// Basalt Operating System
// Copyright (C) 2026 Basalt Contributors
// SPDX-License-Identifier: MIT
//
//! HBA MMIO mapping and register access.
//!
//! Controllers get their register window from a small fixed pool of
//! kernel virtual slots; two pages per slot cover the global registers
//! plus all 32 port blocks (0x1100 bytes).

use spin::Mutex;
use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

use super::constants::{MMIO_SLOTS, MMIO_VIRT_BASE, PORT_BASE, PORT_STRIDE};
use super::error::AhciError;
use crate::memory::{paging, PAGE_SIZE};

const SLOT_PAGES: u64 = 2;

static SLOTS: Mutex<[u64; MMIO_SLOTS]> = Mutex::new([0; MMIO_SLOTS]);

/// A mapped HBA register window.
#[derive(Clone, Copy)]
pub struct HbaMmio {
    base: VirtAddr,
}

impl HbaMmio {
    #[inline]
    pub fn read(&self, offset: u32) -> u32 {
        // SAFETY: the window was mapped uncached over the HBA's BAR5.
        unsafe { core::ptr::read_volatile((self.base + offset as u64).as_ptr::<u32>()) }
    }

    #[inline]
    pub fn write(&self, offset: u32, value: u32) {
        // SAFETY: as above.
        unsafe { core::ptr::write_volatile((self.base + offset as u64).as_mut_ptr::<u32>(), value) }
    }

    #[inline]
    pub fn port_read(&self, port: u32, reg: u32) -> u32 {
        self.read(PORT_BASE + port * PORT_STRIDE + reg)
    }

    #[inline]
    pub fn port_write(&self, port: u32, reg: u32, value: u32) {
        self.write(PORT_BASE + port * PORT_STRIDE + reg, value)
    }

    /// Spin until `reg & mask == 0`; false once the budget is spent.
    pub fn wait_port_clear(&self, port: u32, reg: u32, mask: u32, budget: u32) -> bool {
        for _ in 0..budget {
            if self.port_read(port, reg) & mask == 0 {
                return true;
            }
            core::hint::spin_loop();
        }
        false
    }
}

/// Map a controller's BAR5 into the slot pool. Re-probing the same
/// physical base returns the existing window.
pub fn map_hba(mmio_phys: u64) -> Result<HbaMmio, AhciError> {
    let phys_page = mmio_phys & !(PAGE_SIZE as u64 - 1);
    let offset = mmio_phys - phys_page;

    let mut slots = SLOTS.lock();
    if let Some(slot) = slots.iter().position(|&p| p == phys_page) {
        let base = MMIO_VIRT_BASE + slot as u64 * SLOT_PAGES * PAGE_SIZE as u64;
        return Ok(HbaMmio { base: VirtAddr::new(base + offset) });
    }

    let Some(slot) = slots.iter().position(|&p| p == 0) else {
        log_error!("ahci", "MMIO slot pool exhausted (have {})", MMIO_SLOTS);
        return Err(AhciError::MmioSlotsExhausted);
    };

    let virt_base = MMIO_VIRT_BASE + slot as u64 * SLOT_PAGES * PAGE_SIZE as u64;
    for page in 0..SLOT_PAGES {
        let virt = VirtAddr::new(virt_base + page * PAGE_SIZE as u64);
        let phys = PhysAddr::new(phys_page + page * PAGE_SIZE as u64);
        let flags = PageTableFlags::WRITABLE | PageTableFlags::NO_CACHE;
        if paging::kernel_map(virt, phys, flags).is_err() {
            log_error!("ahci", "failed to map HBA MMIO page {:#x}", phys.as_u64());
            return Err(AhciError::MmioMapFailed);
        }
    }

    slots[slot] = phys_page;
    Ok(HbaMmio { base: VirtAddr::new(virt_base + offset) })
}
