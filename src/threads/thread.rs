use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::context::Context;
use super::fixed_point::Fixed;
use super::sync::LockState;
use crate::userprog::process::UserProc;

/// Unique thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tid(pub u64);

/// States in a thread's life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Running,
    Ready,
    Blocked,
    Dying,
}

/// Lowest possible priority.
pub const PRI_MIN: i32 = 0;
/// Priority assigned when the caller does not care.
pub const PRI_DEFAULT: i32 = 31;
/// Highest possible priority.
pub const PRI_MAX: i32 = 63;

/// Size of each thread's kernel stack (16 KiB).
pub const STACK_SIZE: usize = 4096 * 4;

pub type ThreadFunc = fn(usize);

/// A kernel execution context. The record lives in the scheduler's
/// thread arena; wait queues refer to it by `Tid`.
pub struct Thread {
    pub tid: Tid,
    pub name: String,
    pub status: ThreadStatus,

    /// Effective priority: base plus whatever donors push it to.
    pub priority: i32,
    pub base_priority: i32,
    pub nice: i32,
    pub recent_cpu: Fixed,

    /// Absolute tick at which a sleeping thread becomes runnable.
    pub wake_ticks: i64,

    /// Threads currently donating their priority to this one.
    pub donors: Vec<Tid>,
    /// The lock this thread is blocked on, if any. Shared state, so
    /// the donation walk can hop from waiter to holder.
    pub waiting_on: Option<Arc<LockState>>,

    /// User-process state; `None` for pure kernel threads.
    pub user: Option<Box<UserProc>>,

    /// Owned kernel stack, alive as long as the thread is.
    pub stack: Box<[u8]>,
    /// Saved callee-state for the context switch.
    pub context: Context,
}

impl Thread {
    pub(super) fn new(tid: Tid, name: &str, priority: i32) -> Self {
        assert!((PRI_MIN..=PRI_MAX).contains(&priority));
        Thread {
            tid,
            name: String::from(name),
            status: ThreadStatus::Blocked,
            priority,
            base_priority: priority,
            nice: 0,
            recent_cpu: Fixed::ZERO,
            wake_ticks: 0,
            donors: Vec::new(),
            waiting_on: None,
            user: None,
            stack: Box::new([]),
            context: Context::empty(),
        }
    }

    /// Attach a fresh stack and an initial context that enters
    /// `func(aux)` through the kernel-thread trampoline.
    pub(super) fn arm(&mut self, func: ThreadFunc, aux: usize) {
        let stack = vec![0u8; STACK_SIZE].into_boxed_slice();
        let mut stack_top = stack.as_ptr() as usize + STACK_SIZE;
        stack_top &= !0xF;
        self.stack = stack;
        self.context = Context::for_entry(func, aux, stack_top as u64);
    }
}
