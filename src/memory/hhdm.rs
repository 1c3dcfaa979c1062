//! Higher-half direct map.
//!
//! The bootloader maps all physical memory at a fixed virtual offset; every
//! physical pointer the kernel dereferences goes through this translation.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::{PhysAddr, VirtAddr};

static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Install the boot-supplied offset. Called once, before any translation.
pub fn set_offset(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::SeqCst);
}

#[inline]
pub fn offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Relaxed)
}

#[inline]
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(phys.as_u64() + offset())
}

/// Inverse translation; `None` for addresses outside the direct map.
#[inline]
pub fn virt_to_phys(virt: VirtAddr) -> Option<PhysAddr> {
    virt.as_u64().checked_sub(offset()).map(PhysAddr::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_is_offset_addition() {
        // Tests run with the offset left at zero, so translation must be
        // the identity in both directions.
        let phys = PhysAddr::new(0x1234_5000);
        let virt = phys_to_virt(phys);
        assert_eq!(virt.as_u64(), phys.as_u64() + offset());
        assert_eq!(virt_to_phys(virt), Some(phys));
    }
}
