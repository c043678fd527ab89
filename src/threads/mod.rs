pub mod context;
pub mod fixed_point;
pub mod sync;
pub mod thread;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::{Mutex, MutexGuard};

use crate::devices::timer::TIMER_FREQ;
use crate::interrupt;
use context::Context;
use fixed_point::Fixed;
pub use thread::{Thread, ThreadFunc, ThreadStatus, Tid, PRI_DEFAULT, PRI_MAX, PRI_MIN};

/// Timer ticks each thread may run before preemption.
pub const TIME_SLICE: u32 = 4;

/// Maximum niceness (MLFQ mode).
pub const NICE_MAX: i32 = 20;
/// Minimum niceness (MLFQ mode).
pub const NICE_MIN: i32 = -20;

/// The scheduler: thread arena, ready queue, sleep queue, and the
/// MLFQ statistics. One per CPU, of which there is one.
pub struct Scheduler {
    /// Multi-level feedback queue mode; disables priority donation.
    pub mlfqs: bool,
    threads: BTreeMap<Tid, alloc::boxed::Box<Thread>>,
    /// READY threads, highest effective priority first, FIFO among
    /// equals. The running thread is never in this queue.
    ready: VecDeque<Tid>,
    /// Threads in timer sleep, woken by the tick hook.
    sleepers: Vec<Tid>,
    current: Tid,
    idle: Option<Tid>,
    next_tid: u64,
    load_avg: Fixed,
    slice_ticks: u32,
    idle_ticks: i64,
    kernel_ticks: i64,
    user_ticks: i64,
}

impl Scheduler {
    /// Build a scheduler whose current thread is the caller ("main").
    pub fn new() -> Self {
        let mut sched = Scheduler {
            mlfqs: false,
            threads: BTreeMap::new(),
            ready: VecDeque::new(),
            sleepers: Vec::new(),
            current: Tid(0),
            idle: None,
            next_tid: 1,
            load_avg: Fixed::ZERO,
            slice_ticks: 0,
            idle_ticks: 0,
            kernel_ticks: 0,
            user_ticks: 0,
        };
        let tid = sched.allocate_tid();
        let mut main = Thread::new(tid, "main", PRI_DEFAULT);
        main.status = ThreadStatus::Running;
        sched.threads.insert(tid, alloc::boxed::Box::new(main));
        sched.current = tid;
        sched
    }

    fn allocate_tid(&mut self) -> Tid {
        let tid = Tid(self.next_tid);
        self.next_tid += 1;
        tid
    }

    /// Create a new kernel thread and make it READY. The caller is
    /// responsible for yielding if the new thread outranks it.
    pub fn create(&mut self, name: &str, priority: i32, func: ThreadFunc, aux: usize) -> Tid {
        let tid = self.allocate_tid();
        let mut t = Thread::new(tid, name, priority);
        if self.mlfqs {
            let cur = self.thread(self.current);
            t.nice = cur.nice;
            t.recent_cpu = cur.recent_cpu;
            let p = mlfq_priority(t.recent_cpu, t.nice);
            t.priority = p;
            t.base_priority = p;
        }
        t.arm(func, aux);
        self.threads.insert(tid, alloc::boxed::Box::new(t));
        self.unblock(tid);
        tid
    }

    /// Create the idle thread. It never enters the ready queue; it is
    /// scheduled only when nothing else is runnable.
    pub fn create_idle(&mut self, func: ThreadFunc) -> Tid {
        let tid = self.allocate_tid();
        let mut t = Thread::new(tid, "idle", PRI_MIN);
        t.arm(func, 0);
        self.threads.insert(tid, alloc::boxed::Box::new(t));
        self.idle = Some(tid);
        tid
    }

    pub fn current_tid(&self) -> Tid {
        self.current
    }

    pub fn idle_tid(&self) -> Option<Tid> {
        self.idle
    }

    pub fn is_idle(&self, tid: Tid) -> bool {
        self.idle == Some(tid)
    }

    pub(crate) fn thread(&self, tid: Tid) -> &Thread {
        self.threads.get(&tid).expect("no such thread")
    }

    pub(crate) fn thread_mut(&mut self, tid: Tid) -> &mut Thread {
        self.threads.get_mut(&tid).expect("no such thread")
    }

    pub fn contains(&self, tid: Tid) -> bool {
        self.threads.contains_key(&tid)
    }

    pub fn priority_of(&self, tid: Tid) -> i32 {
        self.thread(tid).priority
    }

    pub fn status_of(&self, tid: Tid) -> ThreadStatus {
        self.thread(tid).status
    }

    pub fn name_of(&self, tid: Tid) -> String {
        self.thread(tid).name.clone()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Insert `tid` into the ready queue: after every thread with
    /// priority greater than or equal to its own.
    fn insert_ready(&mut self, tid: Tid) {
        let priority = self.thread(tid).priority;
        let pos = self
            .ready
            .iter()
            .position(|&t| self.thread(t).priority < priority)
            .unwrap_or(self.ready.len());
        self.ready.insert(pos, tid);
    }

    /// Re-place a READY thread whose priority changed.
    pub(crate) fn reposition_ready(&mut self, tid: Tid) {
        if self.thread(tid).status == ThreadStatus::Ready {
            if let Some(pos) = self.ready.iter().position(|&t| t == tid) {
                self.ready.remove(pos);
                self.insert_ready(tid);
            }
        }
    }

    /// Transition a BLOCKED thread to READY. Does not preempt.
    pub fn unblock(&mut self, tid: Tid) {
        assert_eq!(self.thread(tid).status, ThreadStatus::Blocked);
        self.thread_mut(tid).status = ThreadStatus::Ready;
        self.insert_ready(tid);
    }

    /// Mark the current thread BLOCKED. The caller must reschedule.
    pub fn block_current(&mut self) {
        self.thread_mut(self.current).status = ThreadStatus::Blocked;
    }

    /// Put the current thread back into the ready queue.
    pub fn yield_current(&mut self) {
        let current = self.current;
        self.thread_mut(current).status = ThreadStatus::Ready;
        if !self.is_idle(current) {
            self.insert_ready(current);
        }
    }

    /// Mark the current thread DYING; it is reaped after the switch.
    pub fn exit_current(&mut self) {
        self.thread_mut(self.current).status = ThreadStatus::Dying;
    }

    /// Put the current thread into timer sleep until `wake_ticks`.
    pub fn sleep_current(&mut self, wake_ticks: i64) {
        let current = self.current;
        let t = self.thread_mut(current);
        t.wake_ticks = wake_ticks;
        t.status = ThreadStatus::Blocked;
        self.sleepers.push(current);
    }

    /// The next thread to run: front of the ready queue, or the idle
    /// thread when the queue is empty.
    pub fn next_thread_to_run(&mut self) -> Tid {
        match self.ready.pop_front() {
            Some(tid) => tid,
            None => self.idle.expect("no runnable thread"),
        }
    }

    /// Pick the next thread and make it current. Returns the previous
    /// and the new current thread; the caller performs the switch.
    pub fn reschedule(&mut self) -> (Tid, Tid) {
        let prev = self.current;
        assert_ne!(self.thread(prev).status, ThreadStatus::Running);
        let next = self.next_thread_to_run();
        self.thread_mut(next).status = ThreadStatus::Running;
        self.current = next;
        self.slice_ticks = 0;
        (prev, next)
    }

    /// Drop every DYING thread other than the current one, freeing
    /// records and stacks. Runs on the successor's stack.
    pub fn reap_dying(&mut self) {
        let current = self.current;
        self.threads
            .retain(|&tid, t| tid == current || t.status != ThreadStatus::Dying);
    }

    /// Whether the front of the ready queue outranks the current
    /// thread.
    pub fn preempt_needed(&self) -> bool {
        match self.ready.front() {
            Some(&front) => self.thread(front).priority > self.thread(self.current).priority,
            None => false,
        }
    }

    /// Set the current thread's base priority. The effective priority
    /// becomes the maximum of the new base and any donations. Returns
    /// true if the caller should yield.
    pub fn set_priority_current(&mut self, priority: i32) -> bool {
        assert!((PRI_MIN..=PRI_MAX).contains(&priority));
        if self.mlfqs {
            return false;
        }
        let current = self.current;
        let best_donor = self.best_donor_priority(current);
        let t = self.thread_mut(current);
        t.base_priority = priority;
        t.priority = priority.max(best_donor);
        self.preempt_needed()
    }

    pub fn get_priority(&self) -> i32 {
        self.thread(self.current).priority
    }

    pub(crate) fn best_donor_priority(&self, tid: Tid) -> i32 {
        self.thread(tid)
            .donors
            .iter()
            .map(|&d| self.thread(d).priority)
            .max()
            .unwrap_or(PRI_MIN - 1)
    }

    /// Set the current thread's niceness and recompute its priority.
    /// Returns true if the caller should yield.
    pub fn set_nice_current(&mut self, nice: i32) -> bool {
        let nice = nice.clamp(NICE_MIN, NICE_MAX);
        let current = self.current;
        let t = self.thread_mut(current);
        t.nice = nice;
        let p = mlfq_priority(t.recent_cpu, t.nice);
        t.priority = p;
        t.base_priority = p;
        self.preempt_needed()
    }

    pub fn get_nice(&self) -> i32 {
        self.thread(self.current).nice
    }

    /// 100 times the system load average, rounded to nearest.
    pub fn get_load_avg(&self) -> i32 {
        self.load_avg.mul_int(100).to_int_nearest()
    }

    /// 100 times the current thread's recent CPU, rounded to nearest.
    pub fn get_recent_cpu(&self) -> i32 {
        self.thread(self.current).recent_cpu.mul_int(100).to_int_nearest()
    }

    /// Per-tick hook: statistics, sleep wakeups, MLFQ recomputation,
    /// time-slice accounting. Returns true when the running thread
    /// should yield on return from the interrupt.
    pub fn tick(&mut self, now: i64) -> bool {
        let current = self.current;
        if self.is_idle(current) {
            self.idle_ticks += 1;
        } else if self.thread(current).user.is_some() {
            self.user_ticks += 1;
        } else {
            self.kernel_ticks += 1;
        }

        if self.mlfqs {
            if !self.is_idle(current) {
                let t = self.thread_mut(current);
                t.recent_cpu = t.recent_cpu.add_int(1);
            }
            if now % TIMER_FREQ == 0 {
                let ready_count = self.ready.len() as i32 + !self.is_idle(current) as i32;
                self.load_avg = Fixed::from_ratio(59, 60).mul(self.load_avg)
                    + Fixed::from_ratio(1, 60).mul_int(ready_count);
                let coef = self
                    .load_avg
                    .mul_int(2)
                    .div(self.load_avg.mul_int(2).add_int(1));
                for t in self.threads.values_mut() {
                    t.recent_cpu = coef.mul(t.recent_cpu).add_int(t.nice);
                }
            }
            if now % 4 == 0 {
                for t in self.threads.values_mut() {
                    let p = mlfq_priority(t.recent_cpu, t.nice);
                    t.priority = p;
                    t.base_priority = p;
                }
                self.resort_ready();
            }
        }

        let mut preempt = self.wake_sleepers(now);

        self.slice_ticks += 1;
        if self.slice_ticks >= TIME_SLICE {
            preempt = true;
        }
        preempt
    }

    /// Release every sleeper whose wake time has arrived. Returns true
    /// if a woken thread outranks the current one.
    fn wake_sleepers(&mut self, now: i64) -> bool {
        let mut woke_higher = false;
        let due: Vec<Tid> = self
            .sleepers
            .iter()
            .copied()
            .filter(|&t| self.thread(t).wake_ticks <= now)
            .collect();
        if due.is_empty() {
            return false;
        }
        self.sleepers.retain(|&t| !due.contains(&t));
        let cur_priority = self.thread(self.current).priority;
        for tid in due {
            self.unblock(tid);
            if self.thread(tid).priority > cur_priority {
                woke_higher = true;
            }
        }
        woke_higher
    }

    /// Stable re-sort of the ready queue after a bulk priority change.
    fn resort_ready(&mut self) {
        let mut ready: Vec<Tid> = self.ready.drain(..).collect();
        ready.sort_by_key(|&t| core::cmp::Reverse(self.thread(t).priority));
        self.ready = ready.into();
    }

    /// Print lifetime tick statistics to the console.
    pub fn print_stats(&self) {
        crate::println!(
            "Thread: {} idle ticks, {} kernel ticks, {} user ticks",
            self.idle_ticks,
            self.kernel_ticks,
            self.user_ticks
        );
    }
}

/// The MLFQ priority formula: PRI_MAX - recent_cpu/4 - 2*nice, rounded
/// to nearest and clamped.
fn mlfq_priority(recent_cpu: Fixed, nice: i32) -> i32 {
    let p = (Fixed::from_int(PRI_MAX) - recent_cpu.div_int(4) - Fixed::from_int(nice).mul_int(2))
        .to_int_nearest();
    p.clamp(PRI_MIN, PRI_MAX)
}

// ──────────────────────────────────────────────────────────────
//  Kernel path: the global scheduler and the switch discipline
// ──────────────────────────────────────────────────────────────

lazy_static! {
    pub static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());
}

/// Select the scheduling mode. Must run before any thread is created.
pub fn init(mlfqs: bool) {
    SCHEDULER.lock().mlfqs = mlfqs;
}

/// Create the idle thread and start preemptive scheduling.
pub fn start() {
    SCHEDULER.lock().create_idle(idle_loop);
    interrupt::enable();
}

fn idle_loop(_aux: usize) {
    loop {
        interrupt::disable();
        block();
        // Back when nothing else was runnable; wait for an interrupt.
        core::hint::spin_loop();
        interrupt::enable();
    }
}

/// Create a thread and yield if it outranks the caller.
pub fn create(name: &str, priority: i32, func: ThreadFunc, aux: usize) -> Tid {
    let (tid, preempt) = interrupt::without(|| {
        let mut sched = SCHEDULER.lock();
        let tid = sched.create(name, priority, func, aux);
        (tid, sched.preempt_needed())
    });
    if preempt {
        yield_now();
    }
    tid
}

pub fn current_tid() -> Tid {
    SCHEDULER.lock().current_tid()
}

pub fn current_name() -> String {
    let sched = SCHEDULER.lock();
    sched.name_of(sched.current_tid())
}

/// Block the current thread. Interrupts must be off; the thread runs
/// again only after [`unblock`].
pub fn block() {
    assert!(!interrupt::in_external());
    assert!(!interrupt::are_enabled());
    let mut sched = SCHEDULER.lock();
    sched.block_current();
    schedule(sched);
}

/// Make a blocked thread runnable. Does not preempt; callers that
/// need preemption check for it themselves.
pub fn unblock(tid: Tid) {
    interrupt::without(|| SCHEDULER.lock().unblock(tid));
}

/// Give up the CPU; the thread stays runnable.
pub fn yield_now() {
    assert!(!interrupt::in_external());
    interrupt::without(|| {
        let mut sched = SCHEDULER.lock();
        if sched.ready_len() == 0 {
            return;
        }
        sched.yield_current();
        schedule(sched);
    });
}

/// Yield if an interrupt handler requested it on the way out.
pub fn yield_if_requested() {
    if interrupt::take_yield_request() {
        yield_now();
    }
}

/// Terminate the current thread. Its record is reaped by a successor.
pub fn exit() -> ! {
    assert!(!interrupt::in_external());
    interrupt::disable();
    let mut sched = SCHEDULER.lock();
    sched.exit_current();
    schedule(sched);
    unreachable!("a dying thread was rescheduled");
}

pub fn set_priority(priority: i32) {
    let preempt = interrupt::without(|| SCHEDULER.lock().set_priority_current(priority));
    if preempt {
        yield_now();
    }
}

pub fn get_priority() -> i32 {
    interrupt::without(|| SCHEDULER.lock().get_priority())
}

pub fn set_nice(nice: i32) {
    let preempt = interrupt::without(|| SCHEDULER.lock().set_nice_current(nice));
    if preempt {
        yield_now();
    }
}

pub fn get_nice() -> i32 {
    interrupt::without(|| SCHEDULER.lock().get_nice())
}

pub fn get_load_avg() -> i32 {
    interrupt::without(|| SCHEDULER.lock().get_load_avg())
}

pub fn get_recent_cpu() -> i32 {
    interrupt::without(|| SCHEDULER.lock().get_recent_cpu())
}

/// Switch to the next runnable thread. Consumes the scheduler guard:
/// the lock must drop before the stack switch. Returns when this
/// thread is switched back in.
pub(crate) fn schedule(mut sched: MutexGuard<'static, Scheduler>) {
    let (prev, next) = sched.reschedule();
    if prev == next {
        return;
    }
    let prev_ctx: *mut Context = &mut sched.thread_mut(prev).context;
    let next_ctx: *const Context = &sched.thread(next).context;
    drop(sched);
    unsafe { context::switch_context(prev_ctx, next_ctx) };
    schedule_tail();
}

/// Completion of a switch, on the new thread's stack: destroy any
/// dying predecessor.
pub fn schedule_tail() {
    SCHEDULER.lock().reap_dying();
}
