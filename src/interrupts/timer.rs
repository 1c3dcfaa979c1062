//! Timer tick accounting.
//!
//! The handler for vector 32 only bumps the tick counter and asks the
//! scheduler for a reschedule; the actual thread switch happens at the
//! next `yield` point, never inside IRQ context.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::interrupts::TrapFrame;

static TICKS: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

pub fn tick_handler(_frame: &mut TrapFrame) {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::sched::on_tick();
}
