//! Boot-time self test.
//!
//! Exercises each subsystem once the kernel is up and logs a verdict per
//! check. Failures degrade the boot, they never halt it.

use core::sync::atomic::{AtomicUsize, Ordering};

use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

use crate::fs::bcache;
use crate::memory::{frame_alloc, paging};
use crate::{sched, storage};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn check(name: &str, ok: bool) -> bool {
    if ok {
        log_ok!("selftest", "{}", name);
    } else {
        log_error!("selftest", "{} FAILED", name);
    }
    ok
}

fn frames_check() -> bool {
    let before = frame_alloc::stats();
    let Ok(a) = frame_alloc::alloc() else { return false };
    let Ok(b) = frame_alloc::alloc_contiguous(2) else {
        frame_alloc::free(a);
        return false;
    };
    let during = frame_alloc::stats();
    frame_alloc::free(a);
    frame_alloc::free_contiguous(b, 2);
    let after = frame_alloc::stats();

    during.used == before.used + 3
        && after.used == before.used
        && after.used + after.free == after.total
}

fn paging_check() -> bool {
    let Ok(mut space) = paging::create_address_space() else { return false };
    let Ok(frame) = frame_alloc::alloc() else { return false };

    let virt = VirtAddr::new(0x40_0000);
    let mapped = space
        .map(virt, frame, PageTableFlags::WRITABLE, &mut frame_alloc::GlobalFrameSource)
        .is_ok();
    let translated = space.translate(virt) == Some(frame);
    space.unmap(virt);
    let unmapped = space.translate(virt).is_none();

    frame_alloc::free(frame);
    mapped && translated && unmapped
}

fn counting_thread(rounds: usize) {
    for _ in 0..rounds {
        COUNTER.fetch_add(1, Ordering::SeqCst);
        sched::yield_now();
    }
}

fn sched_check() -> bool {
    COUNTER.store(0, Ordering::SeqCst);
    let Some(t1) = sched::create("selftest-a", counting_thread, 100, 0, 0) else { return false };
    let Some(t2) = sched::create("selftest-b", counting_thread, 100, 0, 0) else { return false };

    let mut spins = 0u32;
    while sched::thread_state(t1) != Some(sched::ThreadState::Dead)
        || sched::thread_state(t2) != Some(sched::ThreadState::Dead)
    {
        sched::yield_now();
        spins += 1;
        if spins > 1_000_000 {
            return false;
        }
    }
    COUNTER.load(Ordering::SeqCst) == 200
}

fn cache_check() -> bool {
    // A scratch RAM disk keeps this check independent of what is on the
    // real disk.
    let dev = storage::BlockDevice::new_ram("selftest-ram", 64 * bcache::SECTORS_PER_BLOCK as u64);

    bcache::with_cache(|cache| {
        let Ok(id) = cache.get(&dev, 5) else { return false };
        cache.data_mut(id).fill(0xC3);
        cache.mark_dirty(id);
        cache.put(id);

        if cache.sync_dev(&dev).is_err() {
            return false;
        }

        let mut raw = alloc::vec![0u8; bcache::BLOCK_SIZE];
        if dev.read(5 * bcache::SECTORS_PER_BLOCK as u64, bcache::SECTORS_PER_BLOCK, &mut raw).is_err()
        {
            return false;
        }
        raw.iter().all(|&b| b == 0xC3)
    })
    .unwrap_or(false)
}

fn disk_check() -> bool {
    let Some(boot) = storage::boot_device() else {
        log_info!("selftest", "no boot disk; skipping disk read check");
        return true;
    };

    bcache::with_cache(|cache| {
        let before = cache.stats();
        let Ok(first) = cache.get(&boot, 0) else { return false };
        cache.put(first);
        let Ok(second) = cache.get(&boot, 0) else { return false };
        cache.put(second);
        let after = cache.stats();
        first == second && after.hits >= before.hits + 1
    })
    .unwrap_or(false)
}

pub fn run() -> bool {
    let mut ok = true;
    ok &= check("frame allocator accounting", frames_check());
    ok &= check("address space map/translate/unmap", paging_check());
    ok &= check("cooperative scheduling", sched_check());
    ok &= check("buffer cache write-through", cache_check());
    ok &= check("boot disk cached reads", disk_check());

    if ok {
        log_ok!("selftest", "all checks passed");
    } else {
        log_warn!("selftest", "one or more checks failed");
    }
    ok
}

/// Thread entry wrapper.
pub fn run_thread(_arg: usize) {
    run();
}
