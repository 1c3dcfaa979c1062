//! Four-level page-table management.
//!
//! The bootloader leaves a fully mapped higher half in CR3; the kernel
//! adopts that table as its own address space and edits it in place.
//! Fresh address spaces share the kernel's upper 256 PML4 entries, so
//! kernel mappings are visible everywhere by construction.

use spin::{Mutex, Once};
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::{FrameAllocator, PageTable, PageTableFlags, PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use crate::memory::{frame_alloc, hhdm, MemoryError};

/// An address space, identified by its PML4 frame.
pub struct AddressSpace {
    pml4: PhysFrame,
}

impl AddressSpace {
    /// Wrap the page table the CPU is currently using.
    ///
    /// # Safety
    ///
    /// The caller asserts CR3 points at a valid PML4 that this instance
    /// may mutate.
    pub unsafe fn adopt_current() -> Self {
        let (frame, _) = Cr3::read();
        AddressSpace { pml4: frame }
    }

    /// A fresh, completely empty address space.
    pub fn empty(fa: &mut impl FrameAllocator<Size4KiB>) -> Result<Self, MemoryError> {
        let frame = fa.allocate_frame().ok_or(MemoryError::OutOfMemory)?;
        unsafe { (*table_ptr(frame)).zero() };
        Ok(AddressSpace { pml4: frame })
    }

    /// A fresh address space sharing `parent`'s higher half (PML4 entries
    /// 256..511), i.e. all kernel mappings.
    pub fn derived_from(
        parent: &AddressSpace,
        fa: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<Self, MemoryError> {
        let space = AddressSpace::empty(fa)?;
        let src = unsafe { &*table_ptr(parent.pml4) };
        let dst = unsafe { &mut *table_ptr(space.pml4) };
        for i in 256..512 {
            let entry = &src[i];
            if !entry.is_unused() {
                dst[i].set_addr(entry.addr(), entry.flags());
            }
        }
        Ok(space)
    }

    pub fn pml4_frame(&self) -> PhysFrame {
        self.pml4
    }

    /// Load this address space into CR3.
    ///
    /// # Safety
    ///
    /// All code and data the CPU touches afterwards must be mapped here.
    pub unsafe fn switch(&self) {
        unsafe { Cr3::write(self.pml4, Cr3Flags::empty()) };
    }

    /// Map one 4 KiB page. Missing intermediate tables are allocated and
    /// zeroed; intermediates that lack USER_ACCESSIBLE are widened in
    /// place when the leaf requires it. The leaf is written only after the
    /// whole walk has succeeded.
    pub fn map(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
        fa: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<(), MemoryError> {
        let virt = virt.align_down(4096u64);
        let phys = phys.align_down(4096u64);
        let user = flags.contains(PageTableFlags::USER_ACCESSIBLE);

        let pml4 = unsafe { &mut *table_ptr(self.pml4) };
        let pdpt = get_or_create(&mut pml4[virt.p4_index()], user, fa)?;
        let pd = get_or_create(&mut pdpt[virt.p3_index()], user, fa)?;
        let pt = get_or_create(&mut pd[virt.p2_index()], user, fa)?;

        pt[virt.p1_index()].set_addr(phys, flags | PageTableFlags::PRESENT);
        flush(virt);
        Ok(())
    }

    /// Drop the mapping for `virt`, if any. Intermediate tables stay.
    pub fn unmap(&mut self, virt: VirtAddr) {
        let virt = virt.align_down(4096u64);
        let pml4 = unsafe { &mut *table_ptr(self.pml4) };
        let Some(pdpt) = walk(&mut pml4[virt.p4_index()]) else { return };
        let Some(pd) = walk(&mut pdpt[virt.p3_index()]) else { return };
        let Some(pt) = walk(&mut pd[virt.p2_index()]) else { return };
        pt[virt.p1_index()].set_unused();
        flush(virt);
    }

    /// Physical frame backing `virt`, or `None` when unmapped.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let virt = virt.align_down(4096u64);
        let pml4 = unsafe { &mut *table_ptr(self.pml4) };
        let pdpt = walk(&mut pml4[virt.p4_index()])?;
        let pd = walk(&mut pdpt[virt.p3_index()])?;
        let pt = walk(&mut pd[virt.p2_index()])?;
        let entry = &pt[virt.p1_index()];
        if entry.flags().contains(PageTableFlags::PRESENT) {
            Some(entry.addr())
        } else {
            None
        }
    }
}

fn table_ptr(frame: PhysFrame) -> *mut PageTable {
    hhdm::phys_to_virt(frame.start_address()).as_mut_ptr()
}

/// Follow a present entry to its table; `None` when the entry is empty.
fn walk(entry: &mut x86_64::structures::paging::page_table::PageTableEntry) -> Option<&'static mut PageTable> {
    if entry.flags().contains(PageTableFlags::PRESENT) {
        Some(unsafe { &mut *table_ptr(PhysFrame::containing_address(entry.addr())) })
    } else {
        None
    }
}

fn get_or_create(
    entry: &mut x86_64::structures::paging::page_table::PageTableEntry,
    user: bool,
    fa: &mut impl FrameAllocator<Size4KiB>,
) -> Result<&'static mut PageTable, MemoryError> {
    if entry.flags().contains(PageTableFlags::PRESENT) {
        // Permissions widen monotonically along a walk.
        if user && !entry.flags().contains(PageTableFlags::USER_ACCESSIBLE) {
            entry.set_flags(entry.flags() | PageTableFlags::USER_ACCESSIBLE);
        }
        return Ok(unsafe { &mut *table_ptr(PhysFrame::containing_address(entry.addr())) });
    }

    let frame = fa.allocate_frame().ok_or(MemoryError::OutOfMemory)?;
    let table = table_ptr(frame);
    unsafe { (*table).zero() };

    let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    if user {
        flags |= PageTableFlags::USER_ACCESSIBLE;
    }
    entry.set_addr(frame.start_address(), flags);
    Ok(unsafe { &mut *table })
}

#[cfg(not(test))]
#[inline]
fn flush(virt: VirtAddr) {
    x86_64::instructions::tlb::flush(virt);
}

#[cfg(test)]
fn flush(_virt: VirtAddr) {}

static KERNEL_SPACE: Once<Mutex<AddressSpace>> = Once::new();

/// Adopt the boot page table as the kernel address space.
pub fn init() {
    KERNEL_SPACE.call_once(|| {
        // SAFETY: called once during early boot while the bootloader's
        // table is live.
        let space = unsafe { AddressSpace::adopt_current() };
        log_ok!("vmm", "adopted boot page table, PML4 at {:#x}", space.pml4.start_address());
        Mutex::new(space)
    });
}

/// A fresh address space sharing the kernel's higher half.
pub fn create_address_space() -> Result<AddressSpace, MemoryError> {
    let kernel = KERNEL_SPACE.get().ok_or(MemoryError::InvalidArgument)?;
    AddressSpace::derived_from(&kernel.lock(), &mut frame_alloc::GlobalFrameSource)
}

/// Map a page into the kernel address space.
pub fn kernel_map(virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) -> Result<(), MemoryError> {
    let kernel = KERNEL_SPACE.get().ok_or(MemoryError::InvalidArgument)?;
    kernel.lock().map(virt, phys, flags, &mut frame_alloc::GlobalFrameSource)
}

/// Resolve a kernel virtual address to its backing frame.
pub fn kernel_translate(virt: VirtAddr) -> Option<PhysAddr> {
    let kernel = KERNEL_SPACE.get()?;
    kernel.lock().translate(virt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::alloc::{alloc_zeroed, Layout};
    use x86_64::structures::paging::FrameAllocator;

    /// Leaks page-aligned host allocations; with the HHDM offset at zero
    /// their addresses serve as both physical and virtual.
    struct TestFrames;

    unsafe impl FrameAllocator<Size4KiB> for TestFrames {
        fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
            let layout = Layout::from_size_align(4096, 4096).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                return None;
            }
            PhysFrame::from_start_address(PhysAddr::new(ptr as u64)).ok()
        }
    }

    #[test]
    fn map_translate_unmap_round_trip() {
        let mut fa = TestFrames;
        let mut space = AddressSpace::empty(&mut fa).unwrap();

        let virt = VirtAddr::new(0x40_0000);
        let frame = fa.allocate_frame().unwrap();
        let flags = PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

        space.map(virt, frame.start_address(), flags, &mut fa).unwrap();
        assert_eq!(space.translate(virt), Some(frame.start_address()));
        // Unaligned lookups resolve through the containing page.
        assert_eq!(space.translate(virt + 0x123u64), Some(frame.start_address()));

        space.unmap(virt);
        assert_eq!(space.translate(virt), None);
    }

    #[test]
    fn intermediate_permissions_widen_for_user() {
        let mut fa = TestFrames;
        let mut space = AddressSpace::empty(&mut fa).unwrap();

        let kernel_page = VirtAddr::new(0x40_0000);
        let user_page = VirtAddr::new(0x40_1000); // same PT as kernel_page
        let f1 = fa.allocate_frame().unwrap();
        let f2 = fa.allocate_frame().unwrap();

        space.map(kernel_page, f1.start_address(), PageTableFlags::WRITABLE, &mut fa).unwrap();
        space
            .map(
                user_page,
                f2.start_address(),
                PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
                &mut fa,
            )
            .unwrap();

        // The shared intermediates must now carry USER_ACCESSIBLE.
        let pml4 = unsafe { &*table_ptr(space.pml4) };
        let entry = &pml4[kernel_page.p4_index()];
        assert!(entry.flags().contains(PageTableFlags::USER_ACCESSIBLE));
    }

    #[test]
    fn derived_spaces_share_the_higher_half() {
        let mut fa = TestFrames;
        let mut parent = AddressSpace::empty(&mut fa).unwrap();

        let high = VirtAddr::new(0xFFFF_8000_0000_0000);
        let low = VirtAddr::new(0x40_0000);
        let f = fa.allocate_frame().unwrap();
        parent.map(high, f.start_address(), PageTableFlags::WRITABLE, &mut fa).unwrap();
        parent.map(low, f.start_address(), PageTableFlags::WRITABLE, &mut fa).unwrap();

        let child = AddressSpace::derived_from(&parent, &mut fa).unwrap();
        // Kernel-half mappings are visible, lower-half ones are not.
        assert_eq!(child.translate(high), Some(f.start_address()));
        assert_eq!(child.translate(low), None);

        let child_pml4 = unsafe { &*table_ptr(child.pml4) };
        let parent_pml4 = unsafe { &*table_ptr(parent.pml4) };
        for i in 256..512 {
            assert_eq!(child_pml4[i].addr(), parent_pml4[i].addr());
        }
    }

    #[test]
    fn map_failure_leaves_no_leaf_behind() {
        struct NoFrames;
        unsafe impl FrameAllocator<Size4KiB> for NoFrames {
            fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
                None
            }
        }

        let mut fa = TestFrames;
        let mut space = AddressSpace::empty(&mut fa).unwrap();
        let virt = VirtAddr::new(0x40_0000);

        let err = space.map(virt, PhysAddr::new(0x1000), PageTableFlags::WRITABLE, &mut NoFrames);
        assert_eq!(err, Err(MemoryError::OutOfMemory));
        assert_eq!(space.translate(virt), None);
    }
}
