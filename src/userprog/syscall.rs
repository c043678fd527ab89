//! The system-call gate: validates every user pointer, then
//! dispatches into the filesystem, the VM layer, and the process
//! lifecycle. Results travel back in the frame's return-register
//! slot; an invalid user pointer terminates the process with -1.

use alloc::string::String;
use alloc::vec::Vec;
use lazy_static::lazy_static;

use super::process::{self, FdEntry, FD_MIN, FD_TABLE_SIZE};
use crate::fs::{Dir, Filesys, FsNode, NAME_MAX};
use crate::threads::sync::Lock;
use crate::threads::{self, Tid};
use crate::vm::Vm;
use crate::{console, fs, vm};

pub const SYS_HALT: u32 = 0;
pub const SYS_EXIT: u32 = 1;
pub const SYS_EXEC: u32 = 2;
pub const SYS_WAIT: u32 = 3;
pub const SYS_CREATE: u32 = 4;
pub const SYS_REMOVE: u32 = 5;
pub const SYS_OPEN: u32 = 6;
pub const SYS_FILESIZE: u32 = 7;
pub const SYS_READ: u32 = 8;
pub const SYS_WRITE: u32 = 9;
pub const SYS_SEEK: u32 = 10;
pub const SYS_TELL: u32 = 11;
pub const SYS_CLOSE: u32 = 12;
pub const SYS_MMAP: u32 = 13;
pub const SYS_MUNMAP: u32 = 14;
pub const SYS_CHDIR: u32 = 15;
pub const SYS_MKDIR: u32 = 16;
pub const SYS_READDIR: u32 = 17;
pub const SYS_ISDIR: u32 = 18;
pub const SYS_INUMBER: u32 = 19;

/// Longest path accepted from user space.
const PATH_MAX: usize = 512;

lazy_static! {
    /// Serializes every top-level filesystem operation, as the
    /// locking discipline requires.
    pub static ref FS_LOCK: Lock = Lock::new();
}

/// Register state handed in by the syscall trap stub: the user stack
/// pointer (number and arguments live on the user stack) and the
/// return-register slot.
pub struct SyscallFrame {
    pub esp: u64,
    pub eax: i32,
}

/// Main entry from the trap stub.
pub fn dispatch(frame: &mut SyscallFrame) {
    let fs = fs::global();
    let vm = vm::global();
    let tid = threads::current_tid();
    process::with_current_user(|user| user.esp = frame.esp);

    let ctx = Gate {
        fs,
        vm,
        tid,
        esp: frame.esp,
    };
    let number = ctx.user_word(frame.esp);
    frame.eax = ctx.run(number);
}

struct Gate {
    fs: &'static Filesys,
    vm: &'static Vm,
    tid: Tid,
    esp: u64,
}

impl Gate {
    fn run(&self, number: u32) -> i32 {
        match number {
            SYS_HALT => process::halt(),
            SYS_EXIT => process::exit(self.arg(0) as i32),
            SYS_EXEC => {
                let cmdline = self.user_string(self.arg(0) as u64);
                match process::exec(&cmdline) {
                    Some(tid) => tid.0 as i32,
                    None => -1,
                }
            }
            SYS_WAIT => process::wait(Tid(self.arg(0) as u64)),
            SYS_CREATE => {
                let path = self.user_string(self.arg(0) as u64);
                let size = self.arg(1);
                self.with_fs_lock(|gate| {
                    gate.with_cwd(|fs, cwd| fs.create(cwd, &path, size, true).is_ok()) as i32
                })
            }
            SYS_REMOVE => {
                let path = self.user_string(self.arg(0) as u64);
                self.with_fs_lock(|gate| {
                    gate.with_cwd(|fs, cwd| fs.remove(cwd, &path).is_ok()) as i32
                })
            }
            SYS_OPEN => {
                let path = self.user_string(self.arg(0) as u64);
                self.with_fs_lock(|gate| {
                    let node = gate.with_cwd(|fs, cwd| fs.open(cwd, &path));
                    let entry = match node {
                        Ok(FsNode::File(file)) => FdEntry::File(file),
                        Ok(FsNode::Dir(dir)) => FdEntry::Dir(dir),
                        Err(_) => return -1,
                    };
                    match process::with_current_user(|user| user.alloc_fd(entry)) {
                        Ok(fd) => fd as i32,
                        Err(entry) => {
                            gate.close_entry(entry);
                            -1
                        }
                    }
                })
            }
            SYS_FILESIZE => match self.take_fd(self.arg(0)) {
                Some((fd, FdEntry::File(file))) => {
                    let len = self.with_fs_lock(|gate| gate.fs.file_length(&file)) as i32;
                    self.restore_fd(fd, FdEntry::File(file));
                    len
                }
                Some((fd, entry)) => {
                    self.restore_fd(fd, entry);
                    0
                }
                None => 0,
            },
            SYS_READ => self.sys_read(),
            SYS_WRITE => self.sys_write(),
            SYS_SEEK => {
                let pos = self.arg(1);
                if let Some((fd, mut entry)) = self.take_fd(self.arg(0)) {
                    if let FdEntry::File(file) = &mut entry {
                        self.with_fs_lock(|gate| gate.fs.file_seek(file, pos));
                    }
                    self.restore_fd(fd, entry);
                }
                0
            }
            SYS_TELL => match self.take_fd(self.arg(0)) {
                Some((fd, FdEntry::File(file))) => {
                    let pos = self.with_fs_lock(|gate| gate.fs.file_tell(&file)) as i32;
                    self.restore_fd(fd, FdEntry::File(file));
                    pos
                }
                Some((fd, entry)) => {
                    self.restore_fd(fd, entry);
                    -1
                }
                None => -1,
            },
            SYS_CLOSE => {
                if let Some((_, entry)) = self.take_fd(self.arg(0)) {
                    self.with_fs_lock(|gate| gate.close_entry(entry));
                }
                0
            }
            SYS_MMAP => self.sys_mmap(),
            SYS_MUNMAP => {
                let map_id = self.arg(0) as i32;
                let known = process::with_current_user(|user| {
                    let known = user.maps.contains(&map_id);
                    user.maps.retain(|&m| m != map_id);
                    known
                });
                if known {
                    self.with_fs_lock(|gate| gate.vm.munmap(gate.fs, gate.tid, map_id));
                }
                0
            }
            SYS_CHDIR => {
                let path = self.user_string(self.arg(0) as u64);
                self.with_fs_lock(|gate| {
                    let new = gate.with_cwd(|fs, cwd| fs.chdir(cwd, &path));
                    match new {
                        Ok(dir) => {
                            let old = process::with_current_user(|user| user.cwd.replace(dir));
                            if let Some(old) = old {
                                gate.fs.dir_close(old);
                            }
                            1
                        }
                        Err(_) => 0,
                    }
                })
            }
            SYS_MKDIR => {
                let path = self.user_string(self.arg(0) as u64);
                self.with_fs_lock(|gate| {
                    gate.with_cwd(|fs, cwd| fs.mkdir(cwd, &path).is_ok()) as i32
                })
            }
            SYS_READDIR => self.sys_readdir(),
            SYS_ISDIR => {
                let fd = self.arg(0) as usize;
                process::with_current_user(|user| user.fd_is_dir(fd)) as i32
            }
            SYS_INUMBER => match self.take_fd(self.arg(0)) {
                Some((fd, entry)) => {
                    let sector = match &entry {
                        FdEntry::File(file) => file.inode().sector(),
                        FdEntry::Dir(dir) => dir.inode().sector(),
                    };
                    self.restore_fd(fd, entry);
                    sector as i32
                }
                None => -1,
            },
            _ => {
                log::warn!("unknown system call {}", number);
                -1
            }
        }
    }

    fn sys_read(&self) -> i32 {
        let fd = self.arg(0);
        let buf = self.arg(1) as u64;
        let size = self.arg(2) as usize;
        self.check_buffer(buf, size, true);

        if fd == 0 {
            // Console input: block until `size` bytes arrive.
            let mut data = Vec::with_capacity(size);
            while data.len() < size {
                match console::getc() {
                    Some(byte) => data.push(byte),
                    None => threads::yield_now(),
                }
            }
            self.copy_out(buf, &data);
            return size as i32;
        }

        match self.take_fd(fd) {
            Some((slot, FdEntry::File(mut file))) => {
                let mut data = alloc::vec![0u8; size];
                let n = self.with_fs_lock(|gate| gate.fs.file_read(&mut file, &mut data));
                self.restore_fd(slot, FdEntry::File(file));
                self.copy_out(buf, &data[..n]);
                n as i32
            }
            Some((slot, entry)) => {
                self.restore_fd(slot, entry);
                -1
            }
            None => -1,
        }
    }

    fn sys_write(&self) -> i32 {
        let fd = self.arg(0);
        let buf = self.arg(1) as u64;
        let size = self.arg(2) as usize;
        self.check_buffer(buf, size, false);

        let mut data = alloc::vec![0u8; size];
        if self.vm.read_user(self.fs, self.tid, buf, &mut data).is_err() {
            process::exit(-1);
        }

        if fd == 1 {
            if let Ok(text) = core::str::from_utf8(&data) {
                crate::print!("{}", text);
            }
            return size as i32;
        }

        match self.take_fd(fd) {
            Some((slot, FdEntry::File(mut file))) => {
                let n = self.with_fs_lock(|gate| gate.fs.file_write(&mut file, &data));
                self.restore_fd(slot, FdEntry::File(file));
                n as i32
            }
            Some((slot, entry)) => {
                self.restore_fd(slot, entry);
                -1
            }
            None => -1,
        }
    }

    fn sys_mmap(&self) -> i32 {
        let fd = self.arg(0);
        let addr = self.arg(1) as u64;

        let reopened = match self.take_fd(fd) {
            Some((slot, FdEntry::File(file))) => {
                let twin = self.with_fs_lock(|gate| gate.fs.file_reopen(&file));
                self.restore_fd(slot, FdEntry::File(file));
                twin
            }
            Some((slot, entry)) => {
                self.restore_fd(slot, entry);
                return -1;
            }
            None => return -1,
        };

        let map_id = process::with_current_user(|user| {
            user.next_map_id += 1;
            user.next_map_id
        });
        let mapped = self.with_fs_lock(|gate| {
            gate.vm.mmap(gate.fs, gate.tid, map_id, reopened, addr).is_ok()
        });
        if mapped {
            process::with_current_user(|user| user.maps.push(map_id));
            map_id
        } else {
            -1
        }
    }

    fn sys_readdir(&self) -> i32 {
        let fd = self.arg(0);
        let name_buf = self.arg(1) as u64;
        self.check_buffer(name_buf, NAME_MAX + 1, true);

        match self.take_fd(fd) {
            Some((slot, FdEntry::Dir(mut dir))) => {
                let name = self.with_fs_lock(|gate| gate.fs.dir_readdir(&mut dir));
                self.restore_fd(slot, FdEntry::Dir(dir));
                match name {
                    Some(name) => {
                        let mut bytes = name.into_bytes();
                        bytes.push(0);
                        self.copy_out(name_buf, &bytes);
                        1
                    }
                    None => 0,
                }
            }
            Some((slot, entry)) => {
                self.restore_fd(slot, entry);
                0
            }
            None => 0,
        }
    }

    // ── user-memory plumbing ─────────────────────────────────

    /// Read one 32-bit word of user memory; a bad address kills the
    /// process.
    fn user_word(&self, addr: u64) -> u32 {
        self.check_buffer(addr, 4, false);
        let mut bytes = [0u8; 4];
        if self.vm.read_user(self.fs, self.tid, addr, &mut bytes).is_err() {
            process::exit(-1);
        }
        u32::from_le_bytes(bytes)
    }

    /// The i-th syscall argument, one word above the number.
    fn arg(&self, i: u64) -> u32 {
        self.user_word(self.esp + 4 * (i + 1))
    }

    /// Validate and fetch a NUL-terminated user string.
    fn user_string(&self, addr: u64) -> String {
        match self.vm.read_user_cstr(self.fs, self.tid, addr, PATH_MAX) {
            Some(s) => s,
            None => process::exit(-1),
        }
    }

    /// Validate a user buffer page by page, demand-loading or growing
    /// the stack; kills the process on any unbacked byte.
    fn check_buffer(&self, addr: u64, size: usize, writable: bool) {
        if size == 0 {
            return;
        }
        let mut page = crate::vm::page::page_base(addr);
        let end = addr + size as u64 - 1;
        while page <= end {
            if !self.vm.check_user_access(self.fs, self.tid, page.max(addr), self.esp, writable) {
                process::exit(-1);
            }
            page += crate::memory::PAGE_SIZE as u64;
        }
    }

    fn copy_out(&self, addr: u64, data: &[u8]) {
        if self.vm.write_user(self.fs, self.tid, addr, data).is_err() {
            process::exit(-1);
        }
    }

    fn with_fs_lock<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        FS_LOCK.acquire();
        let r = f(self);
        FS_LOCK.release();
        r
    }

    /// Briefly take an fd entry out of the table for I/O; single
    /// threaded processes cannot observe the vacancy.
    fn take_fd(&self, fd: u32) -> Option<(usize, FdEntry)> {
        let fd = fd as usize;
        if !(FD_MIN..FD_TABLE_SIZE).contains(&fd) {
            return None;
        }
        process::with_current_user(|user| user.take_fd(fd)).map(|entry| (fd, entry))
    }

    fn restore_fd(&self, fd: usize, entry: FdEntry) {
        process::with_current_user(|user| user.restore_fd(fd, entry));
    }

    fn close_entry(&self, entry: FdEntry) {
        match entry {
            FdEntry::File(file) => self.fs.close_file(&file),
            FdEntry::Dir(dir) => self.fs.dir_close(dir),
        }
    }

    /// Run `f` with the process's working directory, without keeping
    /// the thread table locked across filesystem I/O.
    fn with_cwd<R>(&self, f: impl FnOnce(&Filesys, Option<&Dir>) -> R) -> R {
        let cwd = process::with_current_user(|user| user.cwd.take());
        let r = f(self.fs, cwd.as_ref());
        if let Some(cwd) = cwd {
            process::with_current_user(|user| {
                assert!(user.cwd.is_none());
                user.cwd = Some(cwd);
            });
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_are_stable() {
        // The gate's ABI: numbers are consecutive and fixed.
        assert_eq!(SYS_HALT, 0);
        assert_eq!(SYS_EXIT, 1);
        assert_eq!(SYS_MMAP, 13);
        assert_eq!(SYS_INUMBER, 19);
    }
}
