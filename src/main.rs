//! Kernel binary entry point: Limine protocol requests and the handoff
//! into `basalt::kernel_main`. On a hosted target this compiles to an
//! empty stub so `cargo test` can build the workspace.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod entry {
    use core::panic::PanicInfo;

    use basalt::boot::{BootInfo, FramebufferInfo, MemoryRegion};
    use basalt::{log_error, log_info};
    use limine::request::{
        FramebufferRequest, HhdmRequest, MemoryMapRequest, RequestsEndMarker, RequestsStartMarker,
    };
    use limine::BaseRevision;

    #[used]
    #[link_section = ".requests_start_marker"]
    static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

    #[used]
    #[link_section = ".requests"]
    static BASE_REVISION: BaseRevision = BaseRevision::new();

    #[used]
    #[link_section = ".requests"]
    static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

    #[used]
    #[link_section = ".requests"]
    static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

    #[used]
    #[link_section = ".requests"]
    static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

    #[used]
    #[link_section = ".requests_end_marker"]
    static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

    #[no_mangle]
    unsafe extern "C" fn _start() -> ! {
        if !BASE_REVISION.is_supported() {
            basalt::hcf();
        }

        let mut info = BootInfo::empty();

        let Some(hhdm) = HHDM_REQUEST.get_response() else {
            basalt::hcf();
        };
        info.hhdm_offset = hhdm.offset();

        let Some(memory_map) = MEMORY_MAP_REQUEST.get_response() else {
            basalt::hcf();
        };
        for entry in memory_map.entries() {
            info.push_region(MemoryRegion {
                base: entry.base,
                length: entry.length,
                usable: entry.entry_type == limine::memory_map::EntryType::USABLE,
            });
        }

        if let Some(fb_response) = FRAMEBUFFER_REQUEST.get_response() {
            if let Some(fb) = fb_response.framebuffers().next() {
                info.framebuffer = Some(FramebufferInfo {
                    address: fb.addr() as u64,
                    width: fb.width(),
                    height: fb.height(),
                    pitch: fb.pitch(),
                    bpp: fb.bpp(),
                });
            }
        }

        basalt::kernel_main(&info)
    }

    /// Rust panics (as opposed to CPU exceptions) land here: log the
    /// location and halt.
    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        if let Some(location) = info.location() {
            log_error!(
                "panic",
                "kernel panic at {}:{}: {}",
                location.file(),
                location.line(),
                info.message()
            );
        } else {
            log_error!("panic", "kernel panic: {}", info.message());
        }
        log_info!("panic", "System Halted.");
        basalt::hcf()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
