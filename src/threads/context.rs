//! Saved-register context and the switch primitive.
//!
//! Only the callee-saved state of the System V x86_64 ABI is kept; the
//! rest is dead across the call into the scheduler. On other targets
//! the switch is a stub — the hosted test build never switches stacks.

use super::thread::ThreadFunc;

/// Callee-saved CPU state for one thread.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl Context {
    /// Context for a thread that has never run; filled in by the first
    /// switch away from it (also the boot thread's initial state).
    pub fn empty() -> Self {
        Context {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
        }
    }

    /// Context for a fresh kernel thread. The first switch lands in
    /// [`thread_entry`], which unpacks `func`/`aux` from r12/r13.
    pub fn for_entry(func: ThreadFunc, aux: usize, stack_top: u64) -> Self {
        // 16-byte aligned at the thunk, so its call leaves the stack
        // where the ABI wants it.
        let rsp = stack_top & !0xF;
        Context {
            rsp,
            rbp: 0,
            rbx: 0,
            r12: func as usize as u64,
            r13: aux as u64,
            r14: 0,
            r15: 0,
            rip: thread_entry_raw(),
        }
    }
}

/// First frame of every kernel thread: finish the switch bookkeeping,
/// run the thread function, then exit.
extern "C" fn thread_entry(func: u64, aux: u64) -> ! {
    crate::threads::schedule_tail();
    let func: ThreadFunc = unsafe { core::mem::transmute(func as usize) };
    func(aux as usize);
    crate::threads::exit()
}

#[cfg(target_arch = "x86_64")]
fn thread_entry_raw() -> u64 {
    thread_entry_thunk as usize as u64
}

/// Moves the r12/r13 payload into the argument registers and enters
/// [`thread_entry`]. Jumped to by the first switch into the thread.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
extern "C" fn thread_entry_thunk() {
    core::arch::naked_asm!(
        "mov rdi, r12",
        "mov rsi, r13",
        "call {entry}",
        "ud2",
        entry = sym thread_entry,
    );
}

/// Switch from `old` to `new`: save callee-saved registers into `old`,
/// restore from `new`, continue at the new context's saved rip.
///
/// # Safety
/// Both pointers must refer to valid, pinned `Context` records, and
/// `new` must describe a live stack.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(old: *mut Context, new: *const Context) {
    core::arch::naked_asm!(
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x38], rax",
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "jmp [rsi + 0x38]",
        "2:",
        "ret",
    );
}

/// Enter `new` without saving the current state; used when the current
/// thread is gone for good.
///
/// # Safety
/// `new` must describe a live stack.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub unsafe extern "C" fn restore_context(new: *const Context) -> ! {
    core::arch::naked_asm!(
        "mov rsp, [rdi + 0x00]",
        "mov rbp, [rdi + 0x08]",
        "mov rbx, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r13, [rdi + 0x20]",
        "mov r14, [rdi + 0x28]",
        "mov r15, [rdi + 0x30]",
        "jmp [rdi + 0x38]",
    );
}

#[cfg(not(target_arch = "x86_64"))]
fn thread_entry_raw() -> u64 {
    thread_entry as usize as u64
}

#[cfg(not(target_arch = "x86_64"))]
pub unsafe extern "C" fn switch_context(_old: *mut Context, _new: *const Context) {
    unimplemented!("context switching is only implemented for x86_64");
}

#[cfg(not(target_arch = "x86_64"))]
pub unsafe extern "C" fn restore_context(_new: *const Context) -> ! {
    unimplemented!("context switching is only implemented for x86_64");
}
