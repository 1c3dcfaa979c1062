// Basalt Operating System
// Copyright (C) 2026 Basalt Contributors
// SPDX-License-Identifier: MIT
//
//! PRDT construction and the bounce-buffer fallback.
//!
//! A caller's buffer is scattered into per-page PRDT fragments when every
//! spanned page has a resolvable physical address. When translation fails
//! or the fragment count would overflow the table, the transfer falls
//! back to one physically contiguous bounce allocation from the frame
//! allocator.

use x86_64::{PhysAddr, VirtAddr};

use super::constants::AHCI_MAX_PRDT;
use super::error::AhciError;
use super::types::CommandTable;
use crate::memory::{frame_alloc, hhdm, PAGE_SIZE};

/// One PRDT fragment may carry at most 4 MiB.
const MAX_FRAGMENT_BYTES: u32 = 4 * 1024 * 1024;

/// Scatter `bytes` of the virtual buffer into the PRDT. The first entry
/// may be short because of the page offset. `None` when a page does not
/// translate or the table would overflow.
pub fn build_prdt_from_virt(
    table: &mut CommandTable,
    buffer: VirtAddr,
    bytes: u32,
    translate: impl Fn(VirtAddr) -> Option<PhysAddr>,
) -> Option<u16> {
    if bytes == 0 {
        return None;
    }

    let mut va = buffer;
    let mut remaining = bytes;
    let mut entries = 0usize;

    while remaining > 0 {
        if entries >= AHCI_MAX_PRDT {
            return None;
        }

        let page = va.align_down(PAGE_SIZE as u64);
        let phys_page = translate(page)?;
        let offset = (va - page) as u32;
        let chunk = remaining.min(PAGE_SIZE as u32 - offset);

        table.prdt[entries].set(phys_page.as_u64() + offset as u64, chunk);
        entries += 1;
        va += chunk as u64;
        remaining -= chunk;
    }

    Some(entries as u16)
}

/// Fill the PRDT from one physically contiguous range.
pub fn build_prdt_from_phys(table: &mut CommandTable, phys: PhysAddr, bytes: u32) -> Option<u16> {
    if bytes == 0 {
        return None;
    }

    let mut pa = phys.as_u64();
    let mut remaining = bytes;
    let mut entries = 0usize;

    while remaining > 0 {
        if entries >= AHCI_MAX_PRDT {
            return None;
        }
        let chunk = remaining.min(MAX_FRAGMENT_BYTES);
        table.prdt[entries].set(pa, chunk);
        entries += 1;
        pa += chunk as u64;
        remaining -= chunk;
    }

    Some(entries as u16)
}

/// Physically contiguous DMA scratch memory, freed on drop.
pub struct DmaBounce {
    phys: PhysAddr,
    pages: u64,
    bytes: usize,
}

impl DmaBounce {
    pub fn alloc(bytes: usize) -> Result<Self, AhciError> {
        let pages = bytes.div_ceil(PAGE_SIZE) as u64;
        let phys = frame_alloc::alloc_contiguous(pages).map_err(|_| AhciError::OutOfMemory)?;
        Ok(DmaBounce { phys, pages, bytes })
    }

    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the frames are exclusively ours until drop, and the
        // HHDM maps them.
        unsafe {
            core::slice::from_raw_parts(hhdm::phys_to_virt(self.phys).as_ptr(), self.bytes)
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above.
        unsafe {
            core::slice::from_raw_parts_mut(hhdm::phys_to_virt(self.phys).as_mut_ptr(), self.bytes)
        }
    }
}

impl Drop for DmaBounce {
    fn drop(&mut self) {
        frame_alloc::free_contiguous(self.phys, self.pages);
    }
}
