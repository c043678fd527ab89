//! Semaphores, locks with priority donation, condition variables.
//!
//! All three sit directly on the scheduler: waiter queues hold `Tid`s
//! and mutual exclusion comes from disabling interrupts around the
//! critical sections. The `_core` variants operate on an explicit
//! scheduler, which is what the unit tests drive.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::thread::{Tid, PRI_MIN};
use super::{schedule, Scheduler, SCHEDULER};
use crate::interrupt;

/// Donation chains are walked at most this many hops.
const MAX_DONATION_DEPTH: usize = 8;

struct SemaInner {
    value: u32,
    /// Blocked waiters, highest priority first at insertion time; the
    /// queue is re-sorted when `up` picks a thread to wake.
    waiters: Vec<Tid>,
}

/// A counting semaphore.
pub struct Semaphore {
    inner: Mutex<SemaInner>,
}

impl Semaphore {
    pub const fn new(value: u32) -> Self {
        Semaphore {
            inner: Mutex::new(SemaInner {
                value,
                waiters: Vec::new(),
            }),
        }
    }

    pub fn value(&self) -> u32 {
        self.inner.lock().value
    }

    /// Down or "P": wait until the value is positive, then decrement.
    pub fn down(&self) {
        assert!(!interrupt::in_external());
        let old = interrupt::disable();
        loop {
            let mut sched = SCHEDULER.lock();
            if self.down_core(&mut sched) {
                break;
            }
            // Queued and blocked; switch away until an up() wakes us,
            // then retry.
            schedule(sched);
        }
        interrupt::set_level(old);
    }

    /// One attempt at `down` against `sched`. On success the value is
    /// consumed; otherwise the current thread is queued in priority
    /// order and marked blocked, and the caller must reschedule.
    pub(crate) fn down_core(&self, sched: &mut Scheduler) -> bool {
        let mut inner = self.inner.lock();
        if inner.value > 0 {
            inner.value -= 1;
            return true;
        }
        let current = sched.current_tid();
        let priority = sched.thread(current).priority;
        let pos = inner
            .waiters
            .iter()
            .position(|&t| sched.thread(t).priority < priority)
            .unwrap_or(inner.waiters.len());
        inner.waiters.insert(pos, current);
        drop(inner);
        sched.block_current();
        false
    }

    /// Down only if it cannot block.
    pub fn try_down(&self) -> bool {
        interrupt::without(|| self.try_down_core())
    }

    pub(crate) fn try_down_core(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.value > 0 {
            inner.value -= 1;
            true
        } else {
            false
        }
    }

    /// Up or "V": increment the value and wake the highest-priority
    /// waiter, yielding to it if it outranks the caller.
    pub fn up(&self) {
        let old = interrupt::disable();
        let preempt = {
            let mut sched = SCHEDULER.lock();
            match self.up_core(&mut sched) {
                Some(woken) => {
                    sched.thread(woken).priority > sched.thread(sched.current_tid()).priority
                }
                None => false,
            }
        };
        if preempt {
            if interrupt::in_external() {
                interrupt::yield_on_return();
            } else {
                interrupt::set_level(old);
                super::yield_now();
                return;
            }
        }
        interrupt::set_level(old);
    }

    /// Core of `up` against `sched`: bumps the value and unblocks the
    /// best waiter, who retries its own down. Waiters are re-sorted
    /// first — donation may have changed their priorities since they
    /// queued.
    pub(crate) fn up_core(&self, sched: &mut Scheduler) -> Option<Tid> {
        let mut inner = self.inner.lock();
        inner.value += 1;
        if inner.waiters.is_empty() {
            return None;
        }
        let mut waiters = core::mem::take(&mut inner.waiters);
        waiters.sort_by_key(|&t| core::cmp::Reverse(sched.thread(t).priority));
        let woken = waiters.remove(0);
        inner.waiters = waiters;
        drop(inner);
        sched.unblock(woken);
        Some(woken)
    }
}

/// Shared lock state; a blocked thread keeps a handle to the lock it
/// waits on, so the donation walk can hop from waiter to holder.
pub struct LockState {
    sema: Semaphore,
    holder: Mutex<Option<Tid>>,
}

impl LockState {
    pub(crate) fn holder(&self) -> Option<Tid> {
        *self.holder.lock()
    }
}

/// A mutual-exclusion lock. Non-recursive; the holder's effective
/// priority is raised to the best waiter's while contended.
pub struct Lock {
    state: Arc<LockState>,
}

impl Lock {
    pub fn new() -> Self {
        Lock {
            state: Arc::new(LockState {
                sema: Semaphore::new(1),
                holder: Mutex::new(None),
            }),
        }
    }

    pub fn holder(&self) -> Option<Tid> {
        self.state.holder()
    }

    pub fn held_by_current(&self) -> bool {
        self.holder() == Some(SCHEDULER.lock().current_tid())
    }

    /// Acquire the lock, donating priority along the holder chain and
    /// sleeping until it is free.
    pub fn acquire(&self) {
        assert!(!interrupt::in_external());
        let old = interrupt::disable();
        loop {
            let mut sched = SCHEDULER.lock();
            if self.acquire_core(&mut sched) {
                break;
            }
            schedule(sched);
        }
        interrupt::set_level(old);
    }

    /// One acquisition attempt against `sched`. Registers the donation
    /// before sleeping; on success the caller owns the lock.
    pub(crate) fn acquire_core(&self, sched: &mut Scheduler) -> bool {
        let current = sched.current_tid();
        assert_ne!(self.state.holder(), Some(current), "lock is not recursive");
        if !sched.mlfqs {
            if let Some(holder) = self.state.holder() {
                sched.thread_mut(current).waiting_on = Some(self.state.clone());
                sched.thread_mut(holder).donors.push(current);
                donate_chain(sched, current);
            } else {
                sched.thread_mut(current).waiting_on = None;
            }
        }
        let got = self.state.sema.down_core(sched);
        if got {
            *self.state.holder.lock() = Some(current);
            sched.thread_mut(current).waiting_on = None;
        }
        got
    }

    /// Acquire without sleeping. On failure the donation is still
    /// registered, exactly as a blocking attempt would have done.
    pub fn try_acquire(&self) -> bool {
        interrupt::without(|| {
            let mut sched = SCHEDULER.lock();
            self.try_acquire_core(&mut sched)
        })
    }

    pub(crate) fn try_acquire_core(&self, sched: &mut Scheduler) -> bool {
        let current = sched.current_tid();
        if self.state.sema.try_down_core() {
            *self.state.holder.lock() = Some(current);
            sched.thread_mut(current).waiting_on = None;
            true
        } else {
            if !sched.mlfqs {
                sched.thread_mut(current).waiting_on = Some(self.state.clone());
                if let Some(holder) = self.state.holder() {
                    sched.thread_mut(holder).donors.push(current);
                }
                donate_chain(sched, current);
            }
            false
        }
    }

    /// Release the lock: wake the best waiter, drop the donations that
    /// were tied to this lock, and settle back to base priority (or
    /// the best remaining donor). Yields if the releaser no longer
    /// outranks the ready queue.
    pub fn release(&self) {
        let old = interrupt::disable();
        let preempt = {
            let mut sched = SCHEDULER.lock();
            self.release_core(&mut sched);
            sched.preempt_needed()
        };
        interrupt::set_level(old);
        if preempt {
            super::yield_now();
        }
    }

    /// Core of `release` against `sched`. Returns the woken thread.
    pub(crate) fn release_core(&self, sched: &mut Scheduler) -> Option<Tid> {
        let current = sched.current_tid();
        assert_eq!(self.state.holder(), Some(current), "released by non-holder");
        *self.state.holder.lock() = None;
        let woken = self.state.sema.up_core(sched);
        if !sched.mlfqs {
            self.settle_donations(sched, current);
        }
        woken
    }

    /// Remove donors that were waiting on this lock and recompute the
    /// releaser's effective priority.
    fn settle_donations(&self, sched: &mut Scheduler, current: Tid) {
        let donors = core::mem::take(&mut sched.thread_mut(current).donors);
        let mut remaining = Vec::new();
        let mut best = PRI_MIN - 1;
        for donor in donors {
            let on_this_lock = sched
                .thread(donor)
                .waiting_on
                .as_ref()
                .map(|l| Arc::ptr_eq(l, &self.state))
                .unwrap_or(false);
            if on_this_lock {
                sched.thread_mut(donor).waiting_on = None;
            } else {
                best = best.max(sched.thread(donor).priority);
                remaining.push(donor);
            }
        }
        let t = sched.thread_mut(current);
        t.donors = remaining;
        t.priority = t.base_priority.max(best);
    }
}

/// Walk the chain "lock I wait on → its holder" from `start`, raising
/// each traversed holder to the walker's priority. Stops when the
/// chain ends, the holder already outranks the walker, or the depth
/// cap is reached.
fn donate_chain(sched: &mut Scheduler, start: Tid) {
    let mut tid = start;
    let mut depth = 0;
    while depth < MAX_DONATION_DEPTH {
        let lock = match sched.thread(tid).waiting_on.clone() {
            Some(lock) => lock,
            None => break,
        };
        let holder = match lock.holder() {
            Some(holder) => holder,
            None => break,
        };
        let priority = sched.thread(tid).priority;
        if priority > sched.thread(holder).priority {
            sched.thread_mut(holder).priority = priority;
            sched.reposition_ready(holder);
            tid = holder;
        } else {
            break;
        }
        depth += 1;
    }
}

struct CondWaiter {
    tid: Tid,
    sema: Arc<Semaphore>,
}

/// A Mesa-style condition variable: each waiter sleeps on its own
/// semaphore, queued by priority at the moment of wait.
pub struct Condvar {
    waiters: Mutex<Vec<CondWaiter>>,
}

impl Condvar {
    pub const fn new() -> Self {
        Condvar {
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Atomically release `lock` and wait to be signalled, then
    /// reacquire `lock` before returning.
    pub fn wait(&self, lock: &Lock) {
        assert!(!interrupt::in_external());
        assert!(lock.held_by_current());
        let old = interrupt::disable();
        let sema = {
            let sched = SCHEDULER.lock();
            self.enqueue_waiter(&sched, sched.current_tid())
        };
        lock.release();
        sema.down();
        lock.acquire();
        interrupt::set_level(old);
    }

    /// Queue a waiter in priority order and hand back its semaphore.
    pub(crate) fn enqueue_waiter(&self, sched: &Scheduler, tid: Tid) -> Arc<Semaphore> {
        let sema = Arc::new(Semaphore::new(0));
        let priority = sched.thread(tid).priority;
        let mut waiters = self.waiters.lock();
        let pos = waiters
            .iter()
            .position(|w| sched.thread(w.tid).priority < priority)
            .unwrap_or(waiters.len());
        waiters.insert(
            pos,
            CondWaiter {
                tid,
                sema: sema.clone(),
            },
        );
        sema
    }

    /// Wake the front-most waiter, if any.
    pub fn signal(&self, lock: &Lock) {
        assert!(lock.held_by_current());
        interrupt::without(|| {
            if let Some(waiter) = self.pop_waiter() {
                waiter.up();
            }
        });
    }

    /// Wake every waiter.
    pub fn broadcast(&self, lock: &Lock) {
        assert!(lock.held_by_current());
        interrupt::without(|| {
            while let Some(waiter) = self.pop_waiter() {
                waiter.up();
            }
        });
    }

    pub(crate) fn pop_waiter(&self) -> Option<Arc<Semaphore>> {
        let mut waiters = self.waiters.lock();
        if waiters.is_empty() {
            None
        } else {
            Some(waiters.remove(0).sema)
        }
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threads::thread::ThreadStatus;

    fn noop(_aux: usize) {}

    /// Block the running thread and let the queue pick the next one.
    fn run_next(sched: &mut Scheduler) -> Tid {
        sched.block_current();
        let (_, next) = sched.reschedule();
        next
    }

    /// Put the running thread back in the queue and reschedule.
    fn switch_away(sched: &mut Scheduler) -> Tid {
        sched.yield_current();
        let (_, next) = sched.reschedule();
        next
    }

    #[test]
    fn semaphore_conserves_permits() {
        // Downs minus ups never exceed the initial value and the
        // counter never goes negative.
        let mut sched = Scheduler::new();
        let sema = Semaphore::new(2);
        assert!(sema.down_core(&mut sched));
        assert!(sema.down_core(&mut sched));
        assert_eq!(sema.value(), 0);

        // A third down blocks the current thread.
        let t = sched.create("w", 40, noop, 0);
        assert!(!sema.down_core(&mut sched));
        let main = sched.current_tid();
        assert_eq!(sched.status_of(main), ThreadStatus::Blocked);
        let (_, next) = sched.reschedule();
        assert_eq!(next, t);

        // Up unblocks the waiter; the permit sits in the counter until
        // the waiter retries its down.
        assert_eq!(sema.up_core(&mut sched), Some(main));
        assert_eq!(sema.value(), 1);
        assert_eq!(sched.status_of(main), ThreadStatus::Ready);
    }

    #[test]
    fn semaphore_wakes_highest_priority_waiter() {
        let mut sched = Scheduler::new();
        let sema = Semaphore::new(0);
        let high = sched.create("high", 60, noop, 0);
        let mid = sched.create("mid", 31, noop, 0);
        let low = sched.create("low", 10, noop, 0);

        // Each thread runs in turn and blocks on the semaphore.
        for expected in [high, mid, low] {
            let t = run_next(&mut sched);
            assert_eq!(t, expected);
            assert!(!sema.down_core(&mut sched));
        }

        // Wake order is priority-descending.
        assert_eq!(sema.up_core(&mut sched), Some(high));
        assert_eq!(sema.up_core(&mut sched), Some(mid));
        assert_eq!(sema.up_core(&mut sched), Some(low));
    }

    #[test]
    fn semaphore_up_resorts_stale_waiters() {
        // A waiter whose priority was donated after queuing must win.
        let mut sched = Scheduler::new();
        let sema = Semaphore::new(0);
        let a = sched.create("a", 30, noop, 0);
        let b = sched.create("b", 20, noop, 0);

        let t = run_next(&mut sched);
        assert_eq!(t, a);
        assert!(!sema.down_core(&mut sched));
        let t = run_next(&mut sched);
        assert_eq!(t, b);
        assert!(!sema.down_core(&mut sched));

        // b gains priority while blocked.
        sched.thread_mut(b).priority = 50;
        assert_eq!(sema.up_core(&mut sched), Some(b));
    }

    #[test]
    fn lock_donates_priority_to_holder() {
        // The holder inherits the best blocked waiter's priority.
        let mut sched = Scheduler::new();
        let lock = Lock::new();
        let low = sched.create("low", 5, noop, 0);

        let t = run_next(&mut sched);
        assert_eq!(t, low);
        assert!(lock.acquire_core(&mut sched));

        let high = sched.create("high", 55, noop, 0);
        let t = switch_away(&mut sched);
        assert_eq!(t, high);
        assert!(!lock.acquire_core(&mut sched));

        assert_eq!(sched.priority_of(low), 55);
        assert_eq!(sched.thread(low).base_priority, 5);
    }

    #[test]
    fn lock_release_reverts_priority() {
        // With no donors left, priority returns to base.
        let mut sched = Scheduler::new();
        let lock = Lock::new();
        let low = sched.create("low", 5, noop, 0);

        let t = run_next(&mut sched);
        assert_eq!(t, low);
        assert!(lock.acquire_core(&mut sched));

        let high = sched.create("high", 55, noop, 0);
        let t = switch_away(&mut sched);
        assert_eq!(t, high);
        assert!(!lock.acquire_core(&mut sched));
        assert_eq!(sched.priority_of(low), 55);

        // Back to low (high is blocked), then release.
        let (_, t) = sched.reschedule();
        assert_eq!(t, low);
        let woken = lock.release_core(&mut sched);
        assert_eq!(woken, Some(high));
        assert_eq!(sched.priority_of(low), 5);
        // high is runnable again and outranks low.
        assert!(sched.preempt_needed());
    }

    #[test]
    fn nested_donation_raises_whole_chain() {
        // L holds a; M holds b and waits on a; H waits on b. H's
        // priority must flow through M to L.
        let mut sched = Scheduler::new();
        let lock_a = Lock::new();
        let lock_b = Lock::new();
        let l = sched.create("L", 0, noop, 0);

        let t = run_next(&mut sched);
        assert_eq!(t, l);
        assert!(lock_a.acquire_core(&mut sched));

        let m = sched.create("M", 32, noop, 0);
        let t = switch_away(&mut sched);
        assert_eq!(t, m);
        assert!(lock_b.acquire_core(&mut sched));
        assert!(!lock_a.acquire_core(&mut sched));
        assert_eq!(sched.priority_of(l), 32);

        let h = sched.create("H", 63, noop, 0);
        let (_, t) = sched.reschedule();
        assert_eq!(t, h);
        assert!(!lock_b.acquire_core(&mut sched));
        assert_eq!(sched.priority_of(m), 63);
        assert_eq!(sched.priority_of(l), 63);
    }

    #[test]
    fn multiple_donations_revert_in_release_order() {
        // L(0) holds a and b; M(32) blocks on b; H(63) blocks on a.
        // While both wait, L runs at 63. Releasing a hands the lock
        // to H and drops L to 32; releasing b drops L back to 0.
        let mut sched = Scheduler::new();
        let lock_a = Lock::new();
        let lock_b = Lock::new();
        let l = sched.create("L", 0, noop, 0);

        let t = run_next(&mut sched);
        assert_eq!(t, l);
        assert!(lock_a.acquire_core(&mut sched));
        assert!(lock_b.acquire_core(&mut sched));

        let m = sched.create("M", 32, noop, 0);
        let t = switch_away(&mut sched);
        assert_eq!(t, m);
        assert!(!lock_b.acquire_core(&mut sched));
        assert_eq!(sched.priority_of(l), 32);

        let h = sched.create("H", 63, noop, 0);
        let (_, t) = sched.reschedule();
        assert_eq!(t, h);
        assert!(!lock_a.acquire_core(&mut sched));
        assert_eq!(sched.priority_of(l), 63);

        // Back to L; the releases unwind the donations in order.
        let (_, t) = sched.reschedule();
        assert_eq!(t, l);
        assert_eq!(lock_a.release_core(&mut sched), Some(h));
        assert_eq!(sched.priority_of(l), 32);
        assert!(sched.preempt_needed());
        assert_eq!(lock_b.release_core(&mut sched), Some(m));
        assert_eq!(sched.priority_of(l), 0);
    }

    #[test]
    fn donation_chain_stops_at_depth_cap() {
        // A chain of 10 holders; the walk must stop after 8 hops.
        let mut sched = Scheduler::new();
        let locks: Vec<Lock> = (0..10).map(|_| Lock::new()).collect();
        let mut holders = Vec::new();
        for (i, lock) in locks.iter().enumerate() {
            let t = sched.create(&alloc::format!("h{}", i), 1, noop, 0);
            let got = run_next(&mut sched);
            assert_eq!(got, t);
            assert!(lock.acquire_core(&mut sched));
            if i > 0 {
                // Each holder blocks on the previous lock.
                assert!(!locks[i - 1].acquire_core(&mut sched));
            }
            holders.push(t);
        }
        // A top-priority donor blocks on the last lock.
        let donor = sched.create("donor", 63, noop, 0);
        let t = run_next(&mut sched);
        assert_eq!(t, donor);
        assert!(!locks[9].acquire_core(&mut sched));

        // Eight holders got the donation...
        for &h in holders.iter().rev().take(8) {
            assert_eq!(sched.priority_of(h), 63);
        }
        // ...the ninth did not.
        assert_eq!(sched.priority_of(holders[1]), 1);
    }

    #[test]
    fn release_keeps_other_locks_donations() {
        // Holder owns two contended locks; releasing one must keep the
        // other lock's donation.
        let mut sched = Scheduler::new();
        let lock_a = Lock::new();
        let lock_b = Lock::new();
        let holder = sched.create("holder", 10, noop, 0);

        let t = run_next(&mut sched);
        assert_eq!(t, holder);
        assert!(lock_a.acquire_core(&mut sched));
        assert!(lock_b.acquire_core(&mut sched));

        let wa = sched.create("wa", 40, noop, 0);
        let t = switch_away(&mut sched);
        assert_eq!(t, wa);
        assert!(!lock_a.acquire_core(&mut sched));

        let wb = sched.create("wb", 50, noop, 0);
        let (_, t) = sched.reschedule();
        assert_eq!(t, wb);
        assert!(!lock_b.acquire_core(&mut sched));

        let (_, t) = sched.reschedule();
        assert_eq!(t, holder);
        assert_eq!(sched.priority_of(holder), 50);

        lock_b.release_core(&mut sched);
        assert_eq!(sched.priority_of(holder), 40);
        lock_a.release_core(&mut sched);
        assert_eq!(sched.priority_of(holder), 10);
    }

    #[test]
    fn mlfqs_disables_donation() {
        let mut sched = Scheduler::new();
        sched.mlfqs = true;
        let lock = Lock::new();
        let first = sched.create("first", 31, noop, 0);
        let t = run_next(&mut sched);
        assert_eq!(t, first);
        let before = sched.priority_of(first);
        assert!(lock.acquire_core(&mut sched));
        let _second = sched.create("second", 31, noop, 0);
        switch_away(&mut sched);
        assert!(!lock.acquire_core(&mut sched));
        assert_eq!(sched.priority_of(first), before);
    }

    #[test]
    fn condvar_wakes_in_priority_order() {
        let mut sched = Scheduler::new();
        let cond = Condvar::new();
        let low = sched.create("low", 10, noop, 0);
        let high = sched.create("high", 50, noop, 0);

        let sema_low = cond.enqueue_waiter(&sched, low);
        let sema_high = cond.enqueue_waiter(&sched, high);

        // Signal order follows priority at wait time, not queue order.
        let first = cond.pop_waiter().unwrap();
        assert!(Arc::ptr_eq(&first, &sema_high));
        let second = cond.pop_waiter().unwrap();
        assert!(Arc::ptr_eq(&second, &sema_low));
        assert!(cond.pop_waiter().is_none());
    }
}
