//! Physical frame allocator.
//!
//! One bit per 4 KiB frame over the whole physical span the firmware map
//! reports, clear = free. Everything starts out reserved; only `usable`
//! regions are opened up, so a reserved region can never be handed out.
//! Frames are not zeroed on allocation; callers that need zeroed pages
//! clear them through the HHDM alias.

use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use crate::boot::MemoryRegion;
use crate::memory::{MemoryError, PAGE_SIZE};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// Bitmap over external word storage, so the allocator itself never
/// allocates. The kernel carves the storage out of a usable region and
/// re-reserves it; tests hand in a leaked slice.
pub struct FrameBitmap {
    words: &'static mut [u64],
    frames: u64,
    total: u64,
    used: u64,
}

impl FrameBitmap {
    /// Words needed to cover `frames` bits.
    pub const fn words_for(frames: u64) -> usize {
        frames.div_ceil(64) as usize
    }

    /// All frames start reserved; tail bits past `frames` stay set so the
    /// scan never walks off the span.
    pub fn new(words: &'static mut [u64], frames: u64) -> Self {
        assert!(words.len() >= Self::words_for(frames));
        for w in words.iter_mut() {
            *w = u64::MAX;
        }
        FrameBitmap { words, frames, total: 0, used: 0 }
    }

    #[inline]
    fn bit(&self, frame: u64) -> bool {
        self.words[(frame / 64) as usize] & (1 << (frame % 64)) != 0
    }

    #[inline]
    fn set(&mut self, frame: u64) {
        self.words[(frame / 64) as usize] |= 1 << (frame % 64);
    }

    #[inline]
    fn clear(&mut self, frame: u64) {
        self.words[(frame / 64) as usize] &= !(1 << (frame % 64));
    }

    /// Open a usable region. Partial frames at either edge are dropped.
    pub fn add_usable(&mut self, base: u64, length: u64) {
        let first = base.div_ceil(PAGE_SIZE as u64);
        let last = (base + length) / PAGE_SIZE as u64;
        for frame in first..last.min(self.frames) {
            if self.bit(frame) {
                self.clear(frame);
                self.total += 1;
            }
        }
    }

    /// Pull a range back out of the usable pool (bitmap storage, boot
    /// structures). Only affects frames that are currently free.
    pub fn reserve(&mut self, base: u64, length: u64) {
        let first = base / PAGE_SIZE as u64;
        let last = (base + length).div_ceil(PAGE_SIZE as u64);
        for frame in first..last.min(self.frames) {
            if !self.bit(frame) {
                self.set(frame);
                self.total -= 1;
            }
        }
    }

    pub fn alloc(&mut self) -> Result<PhysAddr, MemoryError> {
        for (wi, word) in self.words.iter().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as u64;
            let frame = wi as u64 * 64 + bit;
            self.set(frame);
            self.used += 1;
            return Ok(PhysAddr::new(frame * PAGE_SIZE as u64));
        }
        Err(MemoryError::OutOfMemory)
    }

    /// First-fit scan for a run of `count` clear bits.
    pub fn alloc_contiguous(&mut self, count: u64) -> Result<PhysAddr, MemoryError> {
        if count == 0 {
            return Err(MemoryError::InvalidArgument);
        }
        let mut run_start = 0u64;
        let mut run_len = 0u64;
        for frame in 0..self.frames {
            if self.bit(frame) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = frame;
            }
            run_len += 1;
            if run_len == count {
                for f in run_start..run_start + count {
                    self.set(f);
                }
                self.used += count;
                return Ok(PhysAddr::new(run_start * PAGE_SIZE as u64));
            }
        }
        Err(MemoryError::OutOfMemory)
    }

    pub fn free(&mut self, addr: PhysAddr) {
        let frame = addr.as_u64() / PAGE_SIZE as u64;
        debug_assert!(frame < self.frames && self.bit(frame));
        if frame < self.frames && self.bit(frame) {
            self.clear(frame);
            self.used -= 1;
        }
    }

    pub fn free_contiguous(&mut self, addr: PhysAddr, count: u64) {
        for i in 0..count {
            self.free(addr + i * PAGE_SIZE as u64);
        }
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats { total: self.total, used: self.used, free: self.total - self.used }
    }
}

static ALLOCATOR: Mutex<Option<FrameBitmap>> = Mutex::new(None);

/// Build the global allocator from the firmware map. The bitmap's own
/// storage is carved from the front of the first usable region that can
/// hold it, then reserved.
pub fn init(regions: &[MemoryRegion]) {
    let span = regions
        .iter()
        .filter(|r| r.usable)
        .map(|r| r.base + r.length)
        .max()
        .unwrap_or(0);
    let frames = span.div_ceil(PAGE_SIZE as u64);
    let words = FrameBitmap::words_for(frames);
    let storage_bytes = (words * 8) as u64;

    let storage_base = match regions
        .iter()
        .find(|r| r.usable && r.length >= storage_bytes + PAGE_SIZE as u64)
        .map(|r| r.base.next_multiple_of(8))
    {
        Some(base) => base,
        None => {
            log_error!("pmm", "no usable region can hold the frame bitmap ({} bytes)", storage_bytes);
            return;
        }
    };

    // SAFETY: the region is firmware-usable RAM, mapped by the HHDM, and
    // about to be reserved so nothing else will ever own it.
    let storage = unsafe {
        core::slice::from_raw_parts_mut(
            crate::memory::hhdm::phys_to_virt(PhysAddr::new(storage_base)).as_mut_ptr::<u64>(),
            words,
        )
    };

    let mut bitmap = FrameBitmap::new(storage, frames);
    for region in regions.iter().filter(|r| r.usable) {
        bitmap.add_usable(region.base, region.length);
    }
    bitmap.reserve(storage_base, storage_bytes);

    let stats = bitmap.stats();
    *ALLOCATOR.lock() = Some(bitmap);

    log_ok!(
        "pmm",
        "frame allocator ready: {} frames usable ({} MiB), bitmap {} KiB",
        stats.total,
        stats.total * PAGE_SIZE as u64 / (1024 * 1024),
        storage_bytes / 1024
    );
}

pub fn alloc() -> Result<PhysAddr, MemoryError> {
    ALLOCATOR.lock().as_mut().ok_or(MemoryError::OutOfMemory)?.alloc()
}

pub fn alloc_contiguous(count: u64) -> Result<PhysAddr, MemoryError> {
    ALLOCATOR.lock().as_mut().ok_or(MemoryError::OutOfMemory)?.alloc_contiguous(count)
}

pub fn free(addr: PhysAddr) {
    if let Some(bitmap) = ALLOCATOR.lock().as_mut() {
        bitmap.free(addr);
    }
}

pub fn free_contiguous(addr: PhysAddr, count: u64) {
    if let Some(bitmap) = ALLOCATOR.lock().as_mut() {
        bitmap.free_contiguous(addr, count);
    }
}

pub fn stats() -> FrameStats {
    ALLOCATOR.lock().as_ref().map(FrameBitmap::stats).unwrap_or_default()
}

/// Adapter feeding page-table walks from the global allocator.
pub struct GlobalFrameSource;

unsafe impl FrameAllocator<Size4KiB> for GlobalFrameSource {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        alloc().ok().map(|addr| PhysFrame::containing_address(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn bitmap_for(base: u64, length: u64) -> FrameBitmap {
        let frames = (base + length) / PAGE_SIZE as u64;
        let storage = vec![0u64; FrameBitmap::words_for(frames)].leak();
        let mut bitmap = FrameBitmap::new(storage, frames);
        bitmap.add_usable(base, length);
        bitmap
    }

    #[test]
    fn alloc_reuses_freed_frame_and_accounts() {
        // One usable region [0x100000, 0x200000): 256 frames of 4 KiB.
        let mut bitmap = bitmap_for(0x10_0000, 0x10_0000);
        assert_eq!(bitmap.stats().total, 256);

        let f1 = bitmap.alloc().unwrap();
        let f2 = bitmap.alloc().unwrap();
        let f3 = bitmap.alloc().unwrap();
        assert_eq!(f1, PhysAddr::new(0x10_0000));
        assert_eq!(f2, PhysAddr::new(0x10_1000));
        assert_eq!(f3, PhysAddr::new(0x10_2000));

        bitmap.free(f2);
        let f4 = bitmap.alloc().unwrap();
        assert_eq!(f4, f2);

        let stats = bitmap.stats();
        assert_eq!(stats.used, 3);
        assert_eq!(stats.used + stats.free, stats.total);
    }

    #[test]
    fn reserved_regions_are_never_returned() {
        let mut bitmap = bitmap_for(0x10_0000, 0x10_0000);
        bitmap.reserve(0x10_0000, 0x8000); // first 8 frames

        for _ in 0..bitmap.stats().total {
            let frame = bitmap.alloc().unwrap();
            assert!(frame.as_u64() >= 0x10_8000);
        }
        assert_eq!(bitmap.alloc(), Err(MemoryError::OutOfMemory));
    }

    #[test]
    fn contiguous_runs_are_first_fit() {
        let mut bitmap = bitmap_for(0x10_0000, 0x10_0000);

        let a = bitmap.alloc_contiguous(4).unwrap();
        assert_eq!(a, PhysAddr::new(0x10_0000));
        let b = bitmap.alloc().unwrap();

        // Freeing the first run leaves a 4-frame hole before `b`; a
        // 3-frame request fits in it, a 5-frame request must skip past.
        bitmap.free_contiguous(a, 4);
        assert_eq!(bitmap.alloc_contiguous(3).unwrap(), a);
        assert!(bitmap.alloc_contiguous(5).unwrap() > b);
    }

    #[test]
    fn contiguous_exhaustion_fails_cleanly() {
        let mut bitmap = bitmap_for(0x10_0000, 0x4000); // 4 frames
        assert_eq!(bitmap.alloc_contiguous(8), Err(MemoryError::OutOfMemory));
        assert_eq!(bitmap.stats().used, 0);
        assert_eq!(bitmap.alloc_contiguous(0), Err(MemoryError::InvalidArgument));
    }
}
