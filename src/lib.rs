//! Basalt kernel.
//!
//! A small x86-64 kernel: Limine boot, HHDM-based memory management,
//! cooperative kernel threads, AHCI block I/O, GPT/MBR partitions, and a
//! write-back buffer cache. Hardware-independent subsystems are unit
//! tested on the host, which is why the crate is `no_std` only outside
//! test builds.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[macro_use]
pub mod log;

pub mod boot;
pub mod drivers;
pub mod fs;
pub mod interrupts;
pub mod memory;
pub mod sched;
pub mod selftest;
pub mod storage;

/// Halt forever with interrupts off.
pub fn hcf() -> ! {
    let _ = interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

/// Bring the kernel up. Boot order matters: interrupts are installed
/// masked first so faults render properly, memory comes up before
/// anything that allocates, and PCI/block/cache follow once the heap and
/// VMM are live.
pub fn kernel_main(boot: &boot::BootInfo) -> ! {
    drivers::serial::init();
    log::set_serial_mirror(true);
    log_ok!("boot", "serial console up, log mirror enabled");

    memory::hhdm::set_offset(boot.hhdm_offset);
    log_info!("boot", "HHDM offset {:#x}, {} memory regions", boot.hhdm_offset, boot.region_count);

    if let Some(fb) = &boot.framebuffer {
        log_info!(
            "boot",
            "framebuffer {}x{} pitch={} bpp={} at {:#x}",
            fb.width,
            fb.height,
            fb.pitch,
            fb.bpp,
            fb.address
        );
    }

    let _ = interrupts::disable();
    interrupts::init();

    memory::frame_alloc::init(boot.memory_map());
    memory::paging::init();
    memory::heap::init();

    sched::init();
    interrupts::enable();
    log_info!("kernel", "interrupts enabled");

    drivers::pci::scan();
    storage::init();
    fs::bcache::init(128);

    sched::create("selftest", selftest::run_thread, 0, 0, 0);

    // The shell would take over here; without one, the bootstrap thread
    // becomes the idle loop.
    loop {
        sched::yield_now();
        x86_64::instructions::hlt();
    }
}
