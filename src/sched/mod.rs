//! Cooperative kernel thread scheduler.
//!
//! Fixed-slot thread table, round-robin pick on `yield_now`, and a timer
//! tick that only raises a flag. `yield_now` is the one and only
//! suspension point; every table mutation happens with interrupts
//! disabled, so the tick handler (which writes exactly one flag) is the
//! only asynchronous party and no lock ordering issues exist.

pub mod context;

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, Once};

use context::{switch_context, Context};
use crate::interrupts;
use crate::memory::PAGE_SIZE;

pub const MAX_THREADS: usize = 16;
const DEFAULT_STACK_PAGES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Unused,
    Ready,
    Running,
    Blocked,
    Dead,
}

pub type ThreadEntry = fn(usize);

pub struct Thread {
    pub id: usize,
    pub name: &'static str,
    pub priority: i32,
    pub state: ThreadState,
    context: Context,
    /// Owns the kernel stack; freed when the slot is reused.
    #[allow(dead_code)]
    stack: Option<Vec<u8>>,
    entry: Option<ThreadEntry>,
    arg: usize,
}

impl Thread {
    fn unused(id: usize) -> Self {
        Thread {
            id,
            name: "",
            priority: 0,
            state: ThreadState::Unused,
            context: Context::default(),
            stack: None,
            entry: None,
            arg: 0,
        }
    }
}

struct ThreadTable {
    threads: [Thread; MAX_THREADS],
    current: usize,
    count: usize,
}

static TABLE: Once<Mutex<ThreadTable>> = Once::new();
static RESCHEDULE_REQUESTED: AtomicBool = AtomicBool::new(false);

fn table() -> &'static Mutex<ThreadTable> {
    TABLE.get().expect("scheduler not initialized")
}

/// Adopt the currently executing stack as thread 0 ("bootstrap").
pub fn init() {
    TABLE.call_once(|| {
        let mut threads: [Thread; MAX_THREADS] = core::array::from_fn(Thread::unused);
        threads[0].name = "bootstrap";
        threads[0].state = ThreadState::Running;
        Mutex::new(ThreadTable { threads, current: 0, count: 1 })
    });
    log_ok!("sched", "scheduler ready, bootstrap thread adopted");
}

pub fn current_id() -> usize {
    table().lock().current
}

pub fn thread_state(id: usize) -> Option<ThreadState> {
    let table = table().lock();
    table.threads.get(id).map(|t| t.state)
}

/// Timer-tick hook: request a reschedule, nothing more. The switch itself
/// happens at the next `yield_now` call, never in IRQ context.
pub fn on_tick() {
    if TABLE.get().is_some() {
        RESCHEDULE_REQUESTED.store(true, Ordering::Relaxed);
    }
}

/// First thing a fresh thread returns into. Runs the entry function, then
/// marks the slot dead and gives the CPU away for good.
extern "C" fn thread_trampoline() -> ! {
    let (entry, arg) = {
        let table = table().lock();
        let thread = &table.threads[table.current];
        (thread.entry, thread.arg)
    };

    if let Some(entry) = entry {
        entry(arg);
    }

    {
        let were_enabled = interrupts::disable();
        let mut table = table().lock();
        let current = table.current;
        table.threads[current].state = ThreadState::Dead;
        table.count -= 1;
        drop(table);
        if were_enabled {
            interrupts::enable();
        }
    }
    yield_now();

    // A dead thread is never picked again; this spins only if the
    // scheduler is broken.
    loop {
        x86_64::instructions::hlt();
    }
}

/// Create a thread in state `Ready`. The slot search reuses `Unused` and
/// `Dead` entries; the stack is whole frames, its top seeded with the
/// trampoline return address (plus a null frame so the trampoline entry
/// sees an ABI-aligned stack).
pub fn create(
    name: &'static str,
    entry: ThreadEntry,
    arg: usize,
    stack_size: usize,
    priority: i32,
) -> Option<usize> {
    let mut pages = stack_size.div_ceil(PAGE_SIZE);
    if pages == 0 {
        pages = DEFAULT_STACK_PAGES;
    }
    let stack = vec![0u8; pages * PAGE_SIZE];

    let were_enabled = interrupts::disable();
    let mut table = table().lock();

    let slot = table
        .threads
        .iter()
        .position(|t| matches!(t.state, ThreadState::Unused | ThreadState::Dead));
    let Some(slot) = slot else {
        drop(table);
        if were_enabled {
            interrupts::enable();
        }
        log_error!("sched", "no free thread slots for '{}'", name);
        return None;
    };

    let base = stack.as_ptr() as u64;
    let mut top = (base + stack.len() as u64) & !0xF;
    // Null return slot keeps the unwind anchor and the 16-byte entry
    // alignment the SysV ABI expects, then the trampoline address.
    top -= 8;
    unsafe { core::ptr::write(top as *mut u64, 0) };
    top -= 8;
    unsafe { core::ptr::write(top as *mut u64, thread_trampoline as u64) };

    let thread = &mut table.threads[slot];
    *thread = Thread {
        id: slot,
        name,
        priority,
        state: ThreadState::Ready,
        context: Context { rsp: top, ..Context::default() },
        stack: Some(stack),
        entry: Some(entry),
        arg,
    };
    table.count += 1;
    drop(table);
    if were_enabled {
        interrupts::enable();
    }

    log_info!("sched", "thread '{}' created on slot {}", name, slot);
    Some(slot)
}

/// The scheduler's only suspension point.
///
/// Round-robin from the slot after the current one; without a pending
/// reschedule request and with no other runnable thread this is a no-op.
pub fn yield_now() {
    if TABLE.get().is_none() {
        return;
    }

    interrupts::disable();
    let mut guard = table().lock();

    let current = guard.current;
    let mut next = current;
    for off in 1..=MAX_THREADS {
        let idx = (current + off) % MAX_THREADS;
        if guard.threads[idx].state == ThreadState::Ready {
            next = idx;
            break;
        }
    }

    let requested = RESCHEDULE_REQUESTED.swap(false, Ordering::Relaxed);
    if next == current && !requested {
        drop(guard);
        interrupts::enable();
        return;
    }

    if guard.threads[current].state == ThreadState::Running {
        guard.threads[current].state = ThreadState::Ready;
    }
    guard.threads[next].state = ThreadState::Running;
    guard.current = next;

    let prev_ctx = &mut guard.threads[current].context as *mut Context;
    let next_ctx = &guard.threads[next].context as *const Context;
    drop(guard);
    interrupts::enable();

    // SAFETY: both contexts live in the fixed-slot table, which is never
    // moved; the incoming context was seeded by `create` or saved by a
    // previous switch.
    unsafe { switch_context(prev_ctx, next_ctx) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn counting_thread(rounds: usize) {
        for _ in 0..rounds {
            COUNTER.fetch_add(1, Ordering::SeqCst);
            yield_now();
        }
    }

    // One test drives the whole lifecycle: the thread table is
    // process-global, so splitting this up would race under the parallel
    // test runner.
    #[test]
    fn cooperative_scheduling_runs_threads_to_completion() {
        init();
        assert_eq!(current_id(), 0);
        assert_eq!(thread_state(0), Some(ThreadState::Running));

        let t1 = create("worker-a", counting_thread, 100, 0, 0).unwrap();
        let t2 = create("worker-b", counting_thread, 100, 0, 0).unwrap();
        assert_ne!(t1, 0);
        assert_ne!(t2, 0);
        assert_eq!(thread_state(t1), Some(ThreadState::Ready));

        // Callee-saved state must survive every switch for this loop's
        // locals to stay coherent.
        let marker = 0xDEAD_BEEFusize;
        let mut spins = 0usize;
        while thread_state(t1) != Some(ThreadState::Dead)
            || thread_state(t2) != Some(ThreadState::Dead)
        {
            yield_now();
            spins += 1;
            assert!(spins < 10_000, "threads never finished");
        }
        assert_eq!(marker, 0xDEAD_BEEF);

        assert_eq!(COUNTER.load(Ordering::SeqCst), 200);
        assert_eq!(current_id(), 0);
        assert_eq!(thread_state(0), Some(ThreadState::Running));

        // Dead slots are reused by the next create.
        let t3 = create("worker-c", counting_thread, 0, 0, 0).unwrap();
        assert!(t3 == t1 || t3 == t2);
        while thread_state(t3) != Some(ThreadState::Dead) {
            yield_now();
        }

        // With nothing runnable and no pending request, yield is a no-op.
        let before = current_id();
        yield_now();
        assert_eq!(current_id(), before);
    }
}
