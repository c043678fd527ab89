//! User-process state and the process lifecycle contract: spawn,
//! wait, exit, and the child records that carry exit statuses between
//! them.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::fs::{Dir, File};
use crate::threads::sync::Semaphore;
use crate::threads::{self, Tid, PRI_DEFAULT};
use crate::{interrupt, vm};

/// Capacity of the per-process fd table. Slots 0 and 1 are the
/// console; user files and directories occupy 2..128.
pub const FD_TABLE_SIZE: usize = 128;
/// First fd handed out for files and directories.
pub const FD_MIN: usize = 2;

/// What an fd slot refers to.
pub enum FdEntry {
    File(File),
    Dir(Dir),
}

/// The record a parent keeps for each spawned child. Shared between
/// parent and child so the exit status survives either teardown
/// order; the last owner frees it.
pub struct ChildRecord {
    pub tid: Tid,
    exit_status: Mutex<i32>,
    waited: AtomicBool,
    pub wait_sema: Semaphore,
}

impl ChildRecord {
    pub fn new(tid: Tid) -> Arc<Self> {
        Arc::new(ChildRecord {
            tid,
            exit_status: Mutex::new(-1),
            waited: AtomicBool::new(false),
            wait_sema: Semaphore::new(0),
        })
    }

    pub fn set_exit_status(&self, status: i32) {
        *self.exit_status.lock() = status;
    }

    pub fn exit_status(&self) -> i32 {
        *self.exit_status.lock()
    }

    /// Claim the one allowed wait. False if already waited on.
    pub fn claim_wait(&self) -> bool {
        !self.waited.swap(true, Ordering::SeqCst)
    }

    pub fn was_waited(&self) -> bool {
        self.waited.load(Ordering::SeqCst)
    }
}

/// Per-process user state hanging off a thread.
pub struct UserProc {
    pub parent: Option<Tid>,
    /// This process's own record with its parent.
    pub child_rec: Option<Arc<ChildRecord>>,
    /// Records for children this process spawned.
    pub children: Vec<Arc<ChildRecord>>,
    fds: Vec<Option<FdEntry>>,
    pub cwd: Option<Dir>,
    /// The running executable, held open with writes denied.
    pub exec_file: Option<File>,
    pub next_map_id: i32,
    /// Active memory mappings.
    pub maps: Vec<i32>,
    /// User stack pointer captured at syscall entry, for the stack
    /// growth heuristic.
    pub esp: u64,
}

impl UserProc {
    pub fn new() -> Box<Self> {
        let mut fds = Vec::with_capacity(FD_TABLE_SIZE);
        fds.resize_with(FD_TABLE_SIZE, || None);
        Box::new(UserProc {
            parent: None,
            child_rec: None,
            children: Vec::new(),
            fds,
            cwd: None,
            exec_file: None,
            next_map_id: 0,
            maps: Vec::new(),
            esp: 0,
        })
    }

    /// Place `entry` in the lowest free slot; hands it back when the
    /// table is full so the caller can close it.
    pub fn alloc_fd(&mut self, entry: FdEntry) -> Result<usize, FdEntry> {
        for fd in FD_MIN..FD_TABLE_SIZE {
            if self.fds[fd].is_none() {
                self.fds[fd] = Some(entry);
                return Ok(fd);
            }
        }
        Err(entry)
    }

    /// Remove and return the entry at `fd`, leaving the slot free.
    pub fn take_fd(&mut self, fd: usize) -> Option<FdEntry> {
        if !(FD_MIN..FD_TABLE_SIZE).contains(&fd) {
            return None;
        }
        self.fds[fd].take()
    }

    /// Put an entry back into a slot vacated by [`take_fd`].
    pub fn restore_fd(&mut self, fd: usize, entry: FdEntry) {
        assert!(self.fds[fd].is_none());
        self.fds[fd] = Some(entry);
    }

    pub fn fd_is_dir(&self, fd: usize) -> bool {
        matches!(self.fds.get(fd), Some(Some(FdEntry::Dir(_))))
    }

    pub fn fd_in_use(&self, fd: usize) -> bool {
        matches!(self.fds.get(fd), Some(Some(_)))
    }

    /// Drain every fd entry for closing at exit.
    pub fn drain_fds(&mut self) -> Vec<FdEntry> {
        self.fds.iter_mut().filter_map(|slot| slot.take()).collect()
    }

    pub fn find_child(&self, tid: Tid) -> Option<&Arc<ChildRecord>> {
        self.children.iter().find(|rec| rec.tid == tid)
    }

    pub fn drop_child(&mut self, tid: Tid) {
        self.children.retain(|rec| rec.tid != tid);
    }
}

/// Run `f` over the current thread's user state, attaching an empty
/// one first if the thread has none (the boot thread waits on its
/// children like any parent).
pub fn with_current_user<R>(f: impl FnOnce(&mut UserProc) -> R) -> R {
    interrupt::without(|| {
        let mut sched = threads::SCHEDULER.lock();
        let tid = sched.current_tid();
        let thread = sched.thread_mut(tid);
        if thread.user.is_none() {
            thread.user = Some(UserProc::new());
        }
        f(thread.user.as_mut().unwrap())
    })
}

/// The first token of a command line names the program.
pub fn program_name(cmdline: &str) -> &str {
    cmdline.split_whitespace().next().unwrap_or("")
}

struct StartInfo {
    cmdline: String,
    /// Downed by the child until the parent finishes enrolling it.
    go: Semaphore,
    /// Upped by the child once startup succeeded or failed.
    started: Semaphore,
    success: AtomicBool,
}

/// Spawn a process running `cmdline`. The child record is enrolled
/// before success is reported; returns `None` when the child fails to
/// start.
pub fn exec(cmdline: &str) -> Option<Tid> {
    let info = Arc::new(StartInfo {
        cmdline: cmdline.to_string(),
        go: Semaphore::new(0),
        started: Semaphore::new(0),
        success: AtomicBool::new(false),
    });
    let aux = Arc::into_raw(info.clone()) as usize;
    let name = program_name(cmdline).to_string();
    if name.is_empty() {
        unsafe { drop(Arc::from_raw(aux as *const StartInfo)) };
        return None;
    }

    let parent = threads::current_tid();
    let tid = threads::create(&name, PRI_DEFAULT, start_process, aux);

    // Enroll the child record before reporting success.
    let record = ChildRecord::new(tid);
    with_current_user(|user| user.children.push(record.clone()));
    interrupt::without(|| {
        let mut sched = threads::SCHEDULER.lock();
        let thread = sched.thread_mut(tid);
        let user = thread.user.get_or_insert_with(UserProc::new);
        user.parent = Some(parent);
        user.child_rec = Some(record.clone());
    });
    info.go.up();

    info.started.down();
    if info.success.load(Ordering::SeqCst) {
        Some(tid)
    } else {
        let _ = wait(tid);
        None
    }
}

/// Entry point of a freshly spawned process: build the address space
/// and initial stack, hand off to the platform loader, and report
/// startup to the parent.
fn start_process(aux: usize) {
    let info = unsafe { Arc::from_raw(aux as *const StartInfo) };
    info.go.down();
    let fs = crate::fs::global();
    let vm = vm::global();
    let tid = threads::current_tid();

    vm.create_space(tid);
    let ok = vm.setup_stack(fs, tid).is_ok();
    info.success.store(ok, Ordering::SeqCst);
    info.started.up();
    if !ok {
        exit(-1);
    }
    // The ELF image itself is mapped by the platform loader; the
    // process then runs until its EXIT call tears it down.
    let status = run_user_program(&info.cmdline);
    exit(status)
}

/// Platform hook: execute the loaded user program and return its exit
/// status. The hosted build has no user mode, so the default is an
/// immediate clean exit.
fn run_user_program(_cmdline: &str) -> i32 {
    0
}

/// Wait for child `tid`: returns its exit status, or -1 if it is not
/// an unwaited child of the caller.
pub fn wait(tid: Tid) -> i32 {
    let record = with_current_user(|user| user.find_child(tid).cloned());
    let record = match record {
        Some(record) => record,
        None => return -1,
    };
    if !record.claim_wait() {
        return -1;
    }
    record.wait_sema.down();
    let status = record.exit_status();
    with_current_user(|user| user.drop_child(tid));
    status
}

/// Terminate the current process with `status`: publish the status to
/// the parent, print the exit banner, release every resource, and
/// kill the thread.
pub fn exit(status: i32) -> ! {
    let fs = crate::fs::global();
    let vm = vm::global();
    let tid = threads::current_tid();
    let name = threads::current_name();

    let user = interrupt::without(|| {
        let mut sched = threads::SCHEDULER.lock();
        sched.thread_mut(tid).user.take()
    });

    crate::println!("{}: exit({})", name, status);

    if let Some(mut user) = user {
        if let Some(record) = user.child_rec.take() {
            record.set_exit_status(status);
            record.wait_sema.up();
        }
        for entry in user.drain_fds() {
            match entry {
                FdEntry::File(file) => fs.close_file(&file),
                FdEntry::Dir(dir) => fs.dir_close(dir),
            }
        }
        if let Some(mut exec_file) = user.exec_file.take() {
            fs.file_allow_write(&mut exec_file);
            fs.close_file(&exec_file);
        }
        if vm.has_space(tid) {
            vm.destroy_space(fs, tid);
        }
        if let Some(cwd) = user.cwd.take() {
            fs.dir_close(cwd);
        }
    }
    threads::exit()
}

/// Platform power-off primitive.
pub fn halt() -> ! {
    panic!("machine power-off requested");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_record_carries_status_both_orders() {
        // Exit before wait: the semaphore remembers the up.
        let mut sched = crate::threads::Scheduler::new();
        let rec = ChildRecord::new(Tid(7));
        rec.set_exit_status(42);
        rec.wait_sema.up_core(&mut sched);
        assert!(rec.claim_wait());
        assert!(rec.wait_sema.try_down_core());
        assert_eq!(rec.exit_status(), 42);
    }

    #[test]
    fn second_wait_is_refused() {
        let rec = ChildRecord::new(Tid(9));
        assert!(rec.claim_wait());
        assert!(!rec.claim_wait());
    }

    #[test]
    fn fd_table_allocates_lowest_slot_and_caps_out() {
        let fs = crate::fs::Filesys::format(alloc::sync::Arc::new(
            crate::devices::block::MemDisk::new(4096),
        ))
        .unwrap();
        let mut user = UserProc::new();
        fs.create(None, "f", 0, true).unwrap();

        let first = user
            .alloc_fd(FdEntry::File(fs.open_file(None, "f").unwrap()))
            .ok()
            .expect("empty table must have room");
        assert_eq!(first, FD_MIN);

        let mut last = first;
        loop {
            match user.alloc_fd(FdEntry::File(fs.open_file(None, "f").unwrap())) {
                Ok(fd) => last = fd,
                Err(FdEntry::File(extra)) => {
                    fs.close_file(&extra);
                    break;
                }
                Err(FdEntry::Dir(_)) => unreachable!(),
            }
        }
        assert_eq!(last, FD_TABLE_SIZE - 1);

        // Freeing a slot makes it the next one handed out.
        let entry = user.take_fd(10).unwrap();
        if let FdEntry::File(file) = entry {
            fs.close_file(&file);
        }
        let reused = user
            .alloc_fd(FdEntry::File(fs.open_file(None, "f").unwrap()))
            .ok()
            .expect("slot 10 was freed");
        assert_eq!(reused, 10);

        for entry in user.drain_fds() {
            if let FdEntry::File(file) = entry {
                fs.close_file(&file);
            }
        }
        assert_eq!(fs.open_inode_count(), 0);
    }

    #[test]
    fn program_name_is_first_token() {
        assert_eq!(program_name("echo hello world"), "echo");
        assert_eq!(program_name("prog"), "prog");
        assert_eq!(program_name(""), "");
    }
}
