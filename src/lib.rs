//! PraxOS: the core of a small preemptive instructional kernel — a
//! priority scheduler with donation and an MLFQ mode, demand-paged
//! user memory with swap, and an indexed filesystem behind a
//! write-back block cache.
//!
//! The hardware layer (boot, interrupt stubs, timer and disk devices,
//! paging registers) is the platform shim's job; this crate exposes
//! the seams it drives: [`interrupt`], [`devices::block::BlockDevice`],
//! [`devices::timer::tick`], and [`console`]. The hosted test build
//! drives the same seams with an in-memory disk.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bitmap;
pub mod console;
pub mod devices;
pub mod fs;
pub mod interrupt;
pub mod memory;
pub mod threads;
pub mod userprog;
pub mod vm;

use alloc::sync::Arc;

use devices::block::BlockDevice;

/// Boot-time kernel configuration.
pub struct KernelConfig {
    /// Use the multi-level feedback queue scheduler instead of strict
    /// priority scheduling.
    pub mlfqs: bool,
    /// Pages in the user frame pool; exhausting them starts eviction.
    pub user_pages: usize,
    /// Format the filesystem device instead of mounting it.
    pub format: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            mlfqs: false,
            user_pages: 256,
            format: false,
        }
    }
}

/// Bring the kernel core up: console and logging, the scheduler in
/// the configured mode, the filesystem volume, the VM context, then
/// preemptive scheduling.
pub fn init(
    config: KernelConfig,
    fs_device: Arc<dyn BlockDevice>,
    swap_device: Arc<dyn BlockDevice>,
) {
    console::init();
    threads::init(config.mlfqs);
    fs::init(fs_device, config.format);
    vm::init(config.user_pages, swap_device);
    threads::start();
    log::info!(
        "kernel up: {} scheduling, {} user pages",
        if config.mlfqs { "mlfqs" } else { "priority" },
        config.user_pages
    );
}

/// Tear the kernel down: flush the filesystem and report statistics.
pub fn shutdown() {
    fs::global().done().expect("filesystem shutdown failed");
    interrupt::without(|| threads::SCHEDULER.lock().print_stats());
}
