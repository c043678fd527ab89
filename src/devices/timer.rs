//! The timer tick hook and timer-driven sleep. The hardware timer
//! itself lives in the platform layer; its interrupt stub calls
//! [`tick`] once per tick with interrupts off.

use core::sync::atomic::{AtomicI64, Ordering};

use crate::interrupt;
use crate::threads;

/// Timer interrupts per second.
pub const TIMER_FREQ: i64 = 100;

static TICKS: AtomicI64 = AtomicI64::new(0);

/// Ticks since boot.
pub fn ticks() -> i64 {
    TICKS.load(Ordering::SeqCst)
}

/// The per-tick hook, run in external interrupt context: advance the
/// clock, drive the scheduler's statistics and sleep queue, and
/// request a yield when the time slice is up.
pub fn tick() {
    let now = TICKS.fetch_add(1, Ordering::SeqCst) + 1;
    let preempt = threads::SCHEDULER.lock().tick(now);
    if preempt {
        interrupt::yield_on_return();
    }
}

/// Sleep for at least `duration` ticks. The thread is released by the
/// tick hook once the global tick count reaches its wake time.
pub fn sleep(duration: i64) {
    if duration <= 0 {
        return;
    }
    let wake = ticks() + duration;
    assert!(interrupt::are_enabled());
    let old = interrupt::disable();
    {
        let mut sched = threads::SCHEDULER.lock();
        sched.sleep_current(wake);
        threads::schedule(sched);
    }
    interrupt::set_level(old);
}

/// Ticks elapsed since `start`.
pub fn elapsed(start: i64) -> i64 {
    ticks() - start
}
