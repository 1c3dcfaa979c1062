// Basalt Operating System
// Copyright (C) 2026 Basalt Contributors
// SPDX-License-Identifier: MIT
//
//! AHCI (SATA) disk driver.
//!
//! One disk is supported: the first port with an active SATA link and an
//! ATA signature. All I/O goes through command slot 0 and is fully
//! serialized behind the disk lock; waits on the hardware are bounded
//! spins that fail with a diagnostic rather than hanging the kernel.

pub mod constants;
pub mod error;
pub mod io;
pub mod regs;
pub mod types;

#[cfg(test)]
mod tests;

use alloc::string::String;

use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

use self::constants::*;
pub use self::error::AhciError;
use self::io::DmaBounce;
use self::regs::HbaMmio;
use self::types::{signature_name, CommandHeader, CommandTable, FisRegH2d};

use crate::memory::{frame_alloc, hhdm, paging, PAGE_SIZE};

const CFIS_LEN_DWORDS: u16 = (core::mem::size_of::<FisRegH2d>() / 4) as u16;

struct AhciDisk {
    mmio: HbaMmio,
    port: u32,
    clb_phys: PhysAddr,
    ct_phys: PhysAddr,
    #[allow(dead_code)]
    fb_phys: PhysAddr,
    sectors: u64,
    model: String,
}

static DISK: Mutex<Option<AhciDisk>> = Mutex::new(None);

pub fn disk_ready() -> bool {
    DISK.lock().is_some()
}

/// Total addressable sectors reported by IDENTIFY, 0 when unknown.
pub fn disk_sectors() -> u64 {
    DISK.lock().as_ref().map(|d| d.sectors).unwrap_or(0)
}

pub fn disk_model() -> Option<String> {
    DISK.lock().as_ref().map(|d| d.model.clone())
}

pub fn read(lba: u64, count: u16, buffer: &mut [u8]) -> Result<(), AhciError> {
    rw(ATA_CMD_READ_DMA_EXT, lba, count, buffer.as_mut_ptr(), buffer.len(), false)
}

pub fn write(lba: u64, count: u16, buffer: &[u8]) -> Result<(), AhciError> {
    rw(ATA_CMD_WRITE_DMA_EXT, lba, count, buffer.as_ptr() as *mut u8, buffer.len(), true)
}

pub fn flush() -> Result<(), AhciError> {
    nodata(ATA_CMD_FLUSH_CACHE_EXT)
}

// ---------------------------------------------------------------------
// Port engine helpers
// ---------------------------------------------------------------------

fn port_stop(mmio: &HbaMmio, port: u32) {
    let cmd = mmio.port_read(port, PORT_CMD);
    mmio.port_write(port, PORT_CMD, cmd & !CMD_ST);
    mmio.wait_port_clear(port, PORT_CMD, CMD_CR, SPIN_ENGINE_STOP);

    let cmd = mmio.port_read(port, PORT_CMD);
    mmio.port_write(port, PORT_CMD, cmd & !CMD_FRE);
    mmio.wait_port_clear(port, PORT_CMD, CMD_FR, SPIN_ENGINE_STOP);
}

fn port_start(mmio: &HbaMmio, port: u32) {
    let cmd = mmio.port_read(port, PORT_CMD);
    mmio.port_write(port, PORT_CMD, cmd | CMD_FRE);
    let cmd = mmio.port_read(port, PORT_CMD);
    mmio.port_write(port, PORT_CMD, cmd | CMD_ST);
}

fn wait_task_file_idle(mmio: &HbaMmio, port: u32) -> Result<(), AhciError> {
    if mmio.wait_port_clear(port, PORT_TFD, TFD_BSY | TFD_DRQ, SPIN_TASK_FILE_IDLE) {
        Ok(())
    } else {
        log_error!("ahci", "port {} stayed busy (TFD={:#x})", port, mmio.port_read(port, PORT_TFD));
        Err(AhciError::PortStuckBusy)
    }
}

/// Issue slot 0 and wait for completion: confirm the HBA latched the bit,
/// wait for it to clear, then check the task file for an error.
fn issue_and_wait(mmio: &HbaMmio, port: u32) -> Result<(), AhciError> {
    mmio.port_write(port, PORT_CI, 1);

    let mut latched = false;
    for _ in 0..SPIN_COMMAND_LATCH {
        if mmio.port_read(port, PORT_CI) & 1 != 0 {
            latched = true;
            break;
        }
        core::hint::spin_loop();
    }
    if !latched {
        log_error!(
            "ahci",
            "PxCI did not latch (CMD={:#x} CI={:#x})",
            mmio.port_read(port, PORT_CMD),
            mmio.port_read(port, PORT_CI)
        );
        return Err(AhciError::CommandNotLatched);
    }

    if !mmio.wait_port_clear(port, PORT_CI, 1, SPIN_COMMAND_COMPLETE) {
        log_error!(
            "ahci",
            "command timeout: CI={:#x} TFD={:#x} IS={:#x} SERR={:#x}",
            mmio.port_read(port, PORT_CI),
            mmio.port_read(port, PORT_TFD),
            mmio.port_read(port, PORT_IS),
            mmio.port_read(port, PORT_SERR)
        );
        return Err(AhciError::CommandTimeout);
    }

    let tfd = mmio.port_read(port, PORT_TFD);
    if tfd & TFD_ERR != 0 {
        log_error!(
            "ahci",
            "command error: TFD={:#x} IS={:#x} SERR={:#x}",
            tfd,
            mmio.port_read(port, PORT_IS),
            mmio.port_read(port, PORT_SERR)
        );
        return Err(AhciError::DeviceError);
    }

    Ok(())
}

// ---------------------------------------------------------------------
// Command setup
// ---------------------------------------------------------------------

/// Zero the command list and table, then fill header 0 and the command
/// FIS. Returns the table pointer for PRDT setup.
fn prepare_slot0(disk: &AhciDisk, fis: &FisRegH2d, prdtl: u16, write: bool) -> *mut CommandTable {
    let cmd_list = hhdm::phys_to_virt(disk.clb_phys).as_mut_ptr::<CommandHeader>();
    let table = hhdm::phys_to_virt(disk.ct_phys).as_mut_ptr::<CommandTable>();

    // SAFETY: both pages were allocated for this port at init and are
    // only touched under the disk lock.
    unsafe {
        core::ptr::write_bytes(cmd_list as *mut u8, 0, 32 * core::mem::size_of::<CommandHeader>());
        core::ptr::write_bytes(table as *mut u8, 0, PAGE_SIZE);

        let header = &mut *cmd_list;
        header.flags = types::header_flags(CFIS_LEN_DWORDS, write);
        header.prdtl = prdtl;
        header.prdbc = 0;
        header.ctba = disk.ct_phys.as_u64() as u32;
        header.ctbau = (disk.ct_phys.as_u64() >> 32) as u32;

        core::ptr::copy_nonoverlapping(
            fis as *const FisRegH2d as *const u8,
            (*table).cfis.as_mut_ptr(),
            core::mem::size_of::<FisRegH2d>(),
        );
    }
    table
}

fn ensure_running(mmio: &HbaMmio, port: u32) {
    // A reset elsewhere may have stopped the engine; restart it.
    if mmio.port_read(port, PORT_CMD) & (CMD_ST | CMD_FRE) != (CMD_ST | CMD_FRE) {
        port_start(mmio, port);
    }
}

fn clear_port_status(mmio: &HbaMmio, port: u32) {
    mmio.port_write(port, PORT_SERR, 0xFFFF_FFFF);
    mmio.port_write(port, PORT_IS, 0xFFFF_FFFF);
}

fn rw(
    ata_cmd: u8,
    lba: u64,
    count: u16,
    buffer: *mut u8,
    buffer_len: usize,
    is_write: bool,
) -> Result<(), AhciError> {
    if count == 0 {
        return Err(AhciError::ZeroSectorCount);
    }
    let bytes = count as u32 * 512;
    if buffer_len != bytes as usize {
        return Err(AhciError::BufferSizeMismatch);
    }

    let guard = DISK.lock();
    let disk = guard.as_ref().ok_or_else(|| {
        log_error!("ahci", "rw: no disk selected");
        AhciError::NotReady
    })?;
    let (mmio, port) = (&disk.mmio, disk.port);

    ensure_running(mmio, port);
    wait_task_file_idle(mmio, port)?;
    clear_port_status(mmio, port);

    let fis = FisRegH2d::command(ata_cmd, lba, count);
    let table = prepare_slot0(disk, &fis, 0, is_write);

    // Scatter the caller's buffer directly when every page translates;
    // otherwise stage the transfer through a contiguous bounce buffer.
    let mut bounce: Option<DmaBounce> = None;
    // SAFETY: `table` points at this port's command table page.
    let prdtl = unsafe {
        io::build_prdt_from_virt(&mut *table, VirtAddr::from_ptr(buffer), bytes, |va| {
            paging::kernel_translate(va)
        })
    };
    let prdtl = match prdtl {
        Some(n) => n,
        None => {
            let mut staged = DmaBounce::alloc(bytes as usize).map_err(|e| {
                log_error!("ahci", "rw: bounce alloc failed ({} bytes)", bytes);
                e
            })?;
            if is_write {
                // SAFETY: caller guarantees `buffer` covers `bytes`.
                unsafe {
                    core::ptr::copy_nonoverlapping(buffer, staged.as_mut_slice().as_mut_ptr(), bytes as usize)
                };
            } else {
                staged.as_mut_slice().fill(0);
            }
            // SAFETY: `table` as above.
            let n = unsafe { io::build_prdt_from_phys(&mut *table, staged.phys(), bytes) }
                .ok_or(AhciError::BufferSizeMismatch)?;
            bounce = Some(staged);
            n
        }
    };

    // SAFETY: slot 0's header lives at the front of the command list.
    unsafe {
        (*hhdm::phys_to_virt(disk.clb_phys).as_mut_ptr::<CommandHeader>()).prdtl = prdtl;
    }

    if let Err(e) = issue_and_wait(mmio, port) {
        log_error!(
            "ahci",
            "rw failed: cmd={:#x} lba={:#x} count={} ({})",
            ata_cmd,
            lba,
            count,
            e
        );
        return Err(e);
    }

    if let Some(staged) = bounce {
        if !is_write {
            // SAFETY: caller guarantees `buffer` covers `bytes`.
            unsafe {
                core::ptr::copy_nonoverlapping(staged.as_slice().as_ptr(), buffer, bytes as usize)
            };
        }
    }

    Ok(())
}

/// Data-less command path (cache flush): PRDT stays empty.
fn nodata(ata_cmd: u8) -> Result<(), AhciError> {
    let guard = DISK.lock();
    let disk = guard.as_ref().ok_or_else(|| {
        log_error!("ahci", "nodata: no disk selected");
        AhciError::NotReady
    })?;
    let (mmio, port) = (&disk.mmio, disk.port);

    ensure_running(mmio, port);
    wait_task_file_idle(mmio, port)?;
    clear_port_status(mmio, port);

    let fis = FisRegH2d::command(ata_cmd, 0, 0);
    prepare_slot0(disk, &fis, 0, false);

    issue_and_wait(mmio, port)
}

// ---------------------------------------------------------------------
// Discovery and bring-up
// ---------------------------------------------------------------------

fn alloc_zeroed_page() -> Result<PhysAddr, AhciError> {
    let phys = frame_alloc::alloc().map_err(|_| AhciError::OutOfMemory)?;
    // SAFETY: freshly allocated frame, HHDM-mapped.
    unsafe { core::ptr::write_bytes(hhdm::phys_to_virt(phys).as_mut_ptr::<u8>(), 0, PAGE_SIZE) };
    Ok(phys)
}

/// Stop the port, install fresh command list / FIS receive / command
/// table pages, and restart the engine.
fn init_port(mmio: HbaMmio, port: u32) -> Result<AhciDisk, AhciError> {
    let ssts = mmio.port_read(port, PORT_SSTS);
    let (det, ipm) = (ssts & 0xF, (ssts >> 8) & 0xF);
    if det != SSTS_DET_PRESENT || ipm != SSTS_IPM_ACTIVE {
        log_error!("ahci", "init port {}: link not active (SSTS={:#x})", port, ssts);
        return Err(AhciError::PortNotActive);
    }

    let sig = mmio.port_read(port, PORT_SIG);
    if sig != SATA_SIG_ATA {
        log_error!("ahci", "init port {}: not SATA (SIG={:#x} {})", port, sig, signature_name(sig));
        return Err(AhciError::NotSata);
    }

    port_stop(&mmio, port);
    clear_port_status(&mmio, port);

    let clb_phys = alloc_zeroed_page()?;
    let fb_phys = alloc_zeroed_page()?;
    let ct_phys = alloc_zeroed_page()?;

    mmio.port_write(port, PORT_CLB, clb_phys.as_u64() as u32);
    mmio.port_write(port, PORT_CLBU, (clb_phys.as_u64() >> 32) as u32);
    mmio.port_write(port, PORT_FB, fb_phys.as_u64() as u32);
    mmio.port_write(port, PORT_FBU, (fb_phys.as_u64() >> 32) as u32);

    port_start(&mmio, port);

    log_ok!(
        "ahci",
        "port {} initialized: CLB={:#x} FB={:#x} CT={:#x}",
        port,
        clb_phys.as_u64(),
        fb_phys.as_u64(),
        ct_phys.as_u64()
    );

    Ok(AhciDisk {
        mmio,
        port,
        clb_phys,
        ct_phys,
        fb_phys,
        sectors: 0,
        model: String::new(),
    })
}

/// ATA IDENTIFY through slot 0 into a scratch page: model string and the
/// 48-bit sector count.
fn identify(disk: &mut AhciDisk) -> Result<(), AhciError> {
    let (mmio, port) = (&disk.mmio, disk.port);

    wait_task_file_idle(mmio, port)?;
    clear_port_status(mmio, port);

    let scratch = alloc_zeroed_page()?;

    let fis = FisRegH2d {
        fis_type: FIS_TYPE_REG_H2D,
        pmport_c: 1 << 7,
        command: ATA_CMD_IDENTIFY,
        ..FisRegH2d::default()
    };
    let table = prepare_slot0(disk, &fis, 1, false);
    // SAFETY: `table` points at this port's command table page.
    unsafe { (*table).prdt[0].set(scratch.as_u64(), 512) };

    let result = issue_and_wait(mmio, port);
    if let Err(e) = result {
        frame_alloc::free(scratch);
        log_error!("ahci", "IDENTIFY failed ({})", e);
        return Err(e);
    }

    // SAFETY: the HBA just DMA-filled the scratch page with the 256-word
    // IDENTIFY block.
    let words =
        unsafe { core::slice::from_raw_parts(hhdm::phys_to_virt(scratch).as_ptr::<u16>(), 256) };

    disk.model = types::decode_identify_string(words, 27, 20);
    disk.sectors = words[100] as u64
        | (words[101] as u64) << 16
        | (words[102] as u64) << 32
        | (words[103] as u64) << 48;

    log_ok!("ahci", "IDENTIFY OK: model='{}' sectors={}", disk.model, disk.sectors);
    frame_alloc::free(scratch);
    Ok(())
}

/// Examine one HBA: enable AHCI mode, log every implemented port, and
/// select the first active SATA disk for I/O.
pub fn probe_controller(mmio_phys: u64) {
    let mmio = match regs::map_hba(mmio_phys) {
        Ok(mmio) => mmio,
        Err(_) => return,
    };

    let cap = mmio.read(HBA_CAP);
    let mut ghc = mmio.read(HBA_GHC);
    let pi = mmio.read(HBA_PI);
    let vs = mmio.read(HBA_VS);

    if ghc & GHC_AE == 0 {
        mmio.write(HBA_GHC, ghc | GHC_AE);
        ghc = mmio.read(HBA_GHC);
        log_info!("ahci", "enabled AHCI mode (GHC now {:#x})", ghc);
    }

    log_info!("ahci", "HBA mmio={:#x} CAP={:#x} GHC={:#x} PI={:#x} VS={:#x}", mmio_phys, cap, ghc, pi, vs);

    let n_ports = (cap & 0x1F) + 1;
    for port in 0..n_ports {
        if pi & (1 << port) == 0 {
            continue;
        }

        let ssts = mmio.port_read(port, PORT_SSTS);
        let sig = mmio.port_read(port, PORT_SIG);
        let (det, ipm) = (ssts & 0xF, (ssts >> 8) & 0xF);

        let presence = match det {
            3 if ipm == 1 => "ACTIVE",
            3 => "PRESENT",
            1 => "NO-COMM",
            _ => "EMPTY",
        };
        log_info!(
            "ahci",
            "port {}: SSTS={:#x} DET={} IPM={} SIG={:#x} ({}) [{}]",
            port,
            ssts,
            det,
            ipm,
            sig,
            signature_name(sig),
            presence
        );

        if det == SSTS_DET_PRESENT && ipm == SSTS_IPM_ACTIVE && sig == SATA_SIG_ATA {
            let mut disk_slot = DISK.lock();
            if disk_slot.is_some() {
                continue; // one disk in this kernel
            }
            log_info!("ahci", "selecting port {} for disk I/O", port);
            match init_port(mmio, port) {
                Ok(mut disk) => {
                    if let Err(e) = identify(&mut disk) {
                        log_warn!("ahci", "continuing without IDENTIFY data ({})", e);
                    }
                    *disk_slot = Some(disk);
                }
                Err(e) => log_error!("ahci", "port {} init failed ({})", port, e),
            }
        }
    }
}
