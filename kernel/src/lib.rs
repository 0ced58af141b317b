// SPDX-License-Identifier: MPL-2.0

//! The execution core of the Kestrel kernel: physical and virtual memory
//! allocation, page-fault-driven lazy mapping, threads and processes,
//! per-core preemptive scheduling, the synchronization primitive family
//! and the bounded message queue.
//!
//! Builds for `aarch64-unknown-none` on hardware; on any other target the
//! `hosted` arch stand-ins let the pure-logic core compile and its tests
//! run on a development machine.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod error;

pub mod arch;
pub mod config;
pub mod ipc;
pub mod logger;
pub mod mm;
pub mod prelude;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod time;

#[cfg(test)]
mod tests;

use spin::Once;

use crate::{
    config::{KERNEL_VBLOCK_BASE, KERNEL_VBLOCK_FREE_L1, PMEM_LINEAR_OFFSET},
    mm::{KernelPageTable, LinearWindow, Paddr, PhysAllocator, VBlock, PAGE_SIZE},
    prelude::*,
    sync::{Condition, Mutex, RwLock, Semaphore},
    task::{
        registry::{CompletionList, IdRegistry, Kid},
        CleanupQueue, Process, Scheduler, Thread,
    },
    time::KernelClock,
};

/// The kernel's global mutable state, owned as one explicit object.
///
/// Construction is leaf-first: the physical allocator exists before
/// the page tables, which exist before anything that maps memory. The
/// boot path pins a single instance in [`init`]; tests build private
/// instances over synthetic DRAM.
pub struct Kernel {
    pub clock: KernelClock,
    pub window: LinearWindow,
    pub pmem: PhysAllocator,
    pub kernel_pt: KernelPageTable,
    pub kernel_vblock: VBlock,
    /// The fixed table linked into every process's topmost lower-half
    /// slot (clock page, shared interfaces).
    pub shared_user_table: Paddr,

    pub threads: IdRegistry<Thread>,
    pub processes: IdRegistry<Process>,
    pub mutexes: IdRegistry<Mutex>,
    pub conditions: IdRegistry<Condition>,
    pub rwlocks: IdRegistry<RwLock>,
    pub semaphores: IdRegistry<Semaphore>,

    pub sched: Scheduler,
    pub cleanup: CleanupQueue,

    pub process_exit_codes: CompletionList<Kid, i32>,
    pub thread_exit_codes: CompletionList<(Kid, Kid), u64>,
}

impl Kernel {
    /// Builds a kernel over the DRAM span `[dram_start, dram_end)`,
    /// reached through `window`.
    pub fn new(dram_start: Paddr, dram_end: Paddr, window: LinearWindow) -> Result<Self> {
        use crate::config::PMEM_MAX_BLOCK;

        let buddy_base = dram_start & !(PMEM_MAX_BLOCK - 1);
        let buddy_end = (dram_end + PMEM_MAX_BLOCK - 1) & !(PMEM_MAX_BLOCK - 1);
        let pmem = PhysAllocator::new(buddy_base, buddy_end - buddy_base);
        pmem.release_region(dram_start, dram_end);

        let kernel_pt = KernelPageTable::new(&pmem, window)?;
        let kernel_vblock = VBlock::new(KERNEL_VBLOCK_BASE, KERNEL_VBLOCK_FREE_L1, 2048);

        let shared_user_table = pmem.acquire(PAGE_SIZE)?.base;
        unsafe {
            core::ptr::write_bytes(window.paddr_to_ptr(shared_user_table), 0, PAGE_SIZE as usize);
        }

        Ok(Kernel {
            clock: KernelClock::new(),
            window,
            pmem,
            kernel_pt,
            kernel_vblock,
            shared_user_table,
            threads: IdRegistry::new(),
            processes: IdRegistry::new(),
            mutexes: IdRegistry::new(),
            conditions: IdRegistry::new(),
            rwlocks: IdRegistry::new(),
            semaphores: IdRegistry::new(),
            sched: Scheduler::new(),
            cleanup: CleanupQueue::new(),
            process_exit_codes: CompletionList::new(),
            thread_exit_codes: CompletionList::new(),
        })
    }

    /// The thread running on the calling core.
    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.sched.current(arch::cpu_id())
    }

    /// The process of the thread running on the calling core.
    pub fn current_process(&self) -> Option<Arc<Process>> {
        let thread = self.current_thread()?;
        self.processes.get(thread.process)
    }

    /// The preemption-timer interrupt body for `core`: re-elects, then
    /// re-arms the timer for the earlier of the new timeslice's end and
    /// the nearest higher-priority wake deadline. The exception glue
    /// context-switches to the returned thread.
    pub fn timer_tick(&self, core: usize) -> Option<Arc<Thread>> {
        let next = self.sched.reschedule(self, core);
        let now = self.clock.now();
        let wake = self.sched.next_wake(core);
        arch::set_preemption_timer_us(wake.saturating_duration_since(now).as_micros() as u64);
        next
    }
}

static KERNEL: Once<Kernel> = Once::new();

/// Boot entry: builds the global kernel instance over the DRAM map and
/// installs the logger. Call once, before anything schedules.
pub fn init(dram_start: Paddr, dram_end: Paddr) -> Result<&'static Kernel> {
    let window = LinearWindow::new(PMEM_LINEAR_OFFSET);
    let kernel = Kernel::new(dram_start, dram_end, window)?;
    let k = KERNEL.call_once(|| kernel);
    logger::init();
    log::info!(
        "kestrel: core up, {} MiB free",
        k.pmem.free_bytes() / (1024 * 1024)
    );
    Ok(k)
}

/// The global kernel. Panics before [`init`].
pub fn kernel() -> &'static Kernel {
    KERNEL.get().expect("kernel not initialized")
}

/// The global kernel, if booted.
pub fn try_kernel() -> Option<&'static Kernel> {
    KERNEL.get()
}
