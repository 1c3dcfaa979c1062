//! Local APIC bring-up.
//!
//! The PIC stays remapped and masked underneath; when CPUID reports a
//! local APIC it is enabled through IA32_APIC_BASE and takes over EOI
//! delivery.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use x86_64::registers::model_specific::Msr;
use x86_64::PhysAddr;

use crate::memory::hhdm;

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_GLOBAL_ENABLE: u64 = 1 << 11;

const REG_TPR: u32 = 0x80;
const REG_EOI: u32 = 0xB0;
const REG_SPURIOUS: u32 = 0xF0;

const SPURIOUS_VECTOR: u32 = 0xFF;
const SPURIOUS_SW_ENABLE: u32 = 1 << 8;

static LAPIC_ENABLED: AtomicBool = AtomicBool::new(false);
static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn enabled() -> bool {
    LAPIC_ENABLED.load(Ordering::Relaxed)
}

#[inline]
unsafe fn reg_write(reg: u32, value: u32) {
    let base = LAPIC_BASE.load(Ordering::Relaxed);
    unsafe {
        core::ptr::write_volatile((base + reg as u64) as *mut u32, value);
    }
}

#[inline]
unsafe fn reg_read(reg: u32) -> u32 {
    let base = LAPIC_BASE.load(Ordering::Relaxed);
    unsafe { core::ptr::read_volatile((base + reg as u64) as *const u32) }
}

/// Promote from PIC to LAPIC if the CPU has one. Keeps running on the PIC
/// when CPUID says no.
pub fn try_enable() {
    let cpuid = unsafe { core::arch::x86_64::__cpuid(1) };
    if cpuid.edx & (1 << 9) == 0 {
        log_info!("apic", "local APIC not reported by CPUID; staying on PIC");
        return;
    }

    let mut msr = Msr::new(IA32_APIC_BASE);
    // SAFETY: IA32_APIC_BASE is architectural on any CPU that reports an
    // APIC, and the MMIO page is covered by the HHDM.
    unsafe {
        let apic_base = msr.read() | APIC_GLOBAL_ENABLE;
        msr.write(apic_base);

        let phys = PhysAddr::new(apic_base & 0xFFFF_F000);
        LAPIC_BASE.store(hhdm::phys_to_virt(phys).as_u64(), Ordering::SeqCst);
        LAPIC_ENABLED.store(true, Ordering::SeqCst);

        let svr = reg_read(REG_SPURIOUS);
        reg_write(REG_SPURIOUS, (svr & 0xFFFF_FF00) | SPURIOUS_VECTOR | SPURIOUS_SW_ENABLE);
        // Accept every priority class.
        reg_write(REG_TPR, 0);
    }

    log_ok!("apic", "local APIC enabled, spurious vector {:#x}", SPURIOUS_VECTOR);
}

/// Signal end-of-interrupt on the LAPIC.
#[inline]
pub fn eoi() {
    if enabled() {
        unsafe { reg_write(REG_EOI, 0) };
    }
}
