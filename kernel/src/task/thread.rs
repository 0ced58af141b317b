// SPDX-License-Identifier: MPL-2.0

//! Threads: the schedulable entities.

use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use alloc::collections::BTreeMap;
use hashbrown::HashSet;

use crate::{
    arch::ThreadContext,
    config::{KERNEL_STACK_SIZE, PRIORITY_IDLE, PRIORITY_VHIGH, THREAD_NAME_MAX},
    mm::{
        is_upper_half, page_table::PageAttrs, GuardClass, TagFlags, VMemBlock, BLOCK_4M, PAGE_SIZE,
    },
    prelude::*,
    sync::{SimpleSignal, SpinLock},
    task::registry::Kid,
    time::KernelTime,
    Kernel,
};

use super::{cleanup::CleanupMessage, process::Process};

pub type ThreadId = Kid;

/// EL1 with the EL1 stack.
const SPSR_PRIVILEGED: u64 = 5;
/// EL0 with the EL0 stack.
const SPSR_USER: u64 = 0;

/// What a suspended thread is parked on. The scheduler only interprets
/// `Thread`; the rest is diagnostic, identifying the primitive kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockedOn {
    #[default]
    Nothing,
    Thread,
    Mutex,
    RwLock,
    Condition,
    Signal,
    Semaphore,
    Queue,
    Barrier,
    ProcessExit,
}

/// The per-thread blocking descriptor. The scheduler consults it to
/// decide runnability and to compute the next preemption timeout.
#[derive(Debug, Default)]
pub struct Blocking {
    indefinite: bool,
    until: Option<KernelTime>,
    on_thread: Option<ThreadId>,
    on: BlockedOn,
}

impl Blocking {
    /// Blocked on a primitive, optionally with an absolute deadline.
    /// No deadline means blocked until explicitly woken.
    pub fn block(&mut self, on: BlockedOn, until: Option<KernelTime>) {
        self.indefinite = until.is_none();
        self.until = until;
        self.on_thread = None;
        self.on = on;
    }

    /// Blocked on another thread (the priority-inheritance edge).
    pub fn block_on_thread(&mut self, owner: ThreadId, until: Option<KernelTime>) {
        self.indefinite = until.is_none();
        self.until = until;
        self.on_thread = Some(owner);
        self.on = BlockedOn::Thread;
    }

    /// Blocked forever; only `clear` (or thread death) ends this.
    pub fn block_indefinite(&mut self) {
        self.indefinite = true;
        self.until = None;
        self.on_thread = None;
        self.on = BlockedOn::Thread;
    }

    pub fn clear(&mut self) {
        *self = Blocking::default();
    }

    /// Whether the thread is still suspended at `now`. A passed deadline
    /// makes the thread runnable again; the interrupted operation notices
    /// and reports the timeout itself.
    pub fn is_blocking(&self, now: KernelTime) -> bool {
        if self.indefinite {
            return true;
        }
        match self.until {
            Some(until) => now < until,
            None => false,
        }
    }

    pub fn blocked_on_thread(&self) -> Option<ThreadId> {
        self.on_thread
    }

    pub fn wake_time(&self) -> Option<KernelTime> {
        if self.indefinite {
            None
        } else {
            self.until
        }
    }

    pub fn kind(&self) -> BlockedOn {
        self.on
    }
}

/// Join bookkeeping: at most one joiner, and the exit value once posted.
#[derive(Debug, Default)]
pub struct JoinState {
    pub joiner: Option<ThreadId>,
    pub retval: Option<u64>,
}

pub struct Thread {
    pub id: ThreadId,
    /// Owning process id; the process owns its threads, a thread only
    /// refers back by id.
    pub process: Kid,
    privileged: AtomicBool,

    pub name: SpinLock<String>,
    base_priority: AtomicU32,
    /// Core this thread must run on, if any.
    pub pinned_core: Option<usize>,
    /// Core currently executing this thread, -1 when none.
    running_on: AtomicI64,

    /// Saved register state; only touched with the thread off-core.
    pub ctx: SpinLock<ThreadContext>,
    pub kernel_stack: VMemBlock,
    pub user_stack: Option<VMemBlock>,
    pub tls_block: Option<VMemBlock>,

    /// pthread TLS values, keyed by the process's key registry.
    pub tls_values: SpinLock<BTreeMap<u32, u64>>,

    /// Userspace primitives currently held, released by force on abnormal
    /// termination.
    pub locked_mutexes: SpinLock<HashSet<Kid>>,
    pub locked_rwlocks: SpinLock<HashSet<Kid>>,

    /// Private signal for deferred returns (join, RPC results).
    pub signal: SimpleSignal,
    pub join: SpinLock<JoinState>,

    pub blocking: SpinLock<Blocking>,
    for_deletion: AtomicBool,

    /// Lower half temporarily adopted from an unprivileged thread, while
    /// a privileged thread runs TLS destructors on its behalf.
    pub adopted_lower_half: SpinLock<Option<ThreadId>>,
}

impl Thread {
    pub fn is_privileged(&self) -> bool {
        self.privileged.load(Ordering::Relaxed)
    }

    pub(crate) fn set_privileged(&self, privileged: bool) {
        self.privileged.store(privileged, Ordering::Relaxed);
    }

    pub fn priority(&self) -> u8 {
        self.base_priority.load(Ordering::Relaxed) as u8
    }

    pub(super) fn set_priority(&self, priority: u8) {
        self.base_priority.store(priority as u32, Ordering::Relaxed);
    }

    pub fn for_deletion(&self) -> bool {
        self.for_deletion.load(Ordering::Acquire)
    }

    pub fn mark_for_deletion(&self) {
        self.for_deletion.store(true, Ordering::Release);
    }

    pub fn running_on(&self) -> Option<usize> {
        let core = self.running_on.load(Ordering::Acquire);
        (core >= 0).then_some(core as usize)
    }

    pub(crate) fn set_running_on(&self, core: Option<usize>) {
        self.running_on
            .store(core.map_or(-1, |c| c as i64), Ordering::Release);
    }

    /// Runnable right now: not condemned and not (still) blocked.
    pub fn is_runnable(&self, now: KernelTime) -> bool {
        !self.for_deletion() && !self.blocking.lock().is_blocking(now)
    }

    pub fn set_name(&self, name: &str) -> Result<()> {
        if name.len() > THREAD_NAME_MAX {
            return_errno!(Errno::ERANGE);
        }
        *self.name.lock() = name.to_string();
        Ok(())
    }

    /// Whether `[buf, buf + len)` is reachable from this thread. Both
    /// halves are 4 TiB; anything larger is rejected before the addition
    /// can overflow.
    pub fn addr_is_valid(&self, buf: Vaddr, len: u64) -> bool {
        if len > crate::config::LOWER_HALF_END {
            return false;
        }
        let end = buf.saturating_add(len);
        if self.is_privileged() && is_upper_half(buf) && is_upper_half(end) {
            return true;
        }
        buf < crate::config::LOWER_HALF_END && end <= crate::config::LOWER_HALF_END
    }

    /// Temporarily takes over an unprivileged thread's lower half, so a
    /// privileged thread (the cleanup worker) can reach its user memory.
    /// Must be paired with [`Self::release_lower_half`].
    pub fn adopt_lower_half(&self, user_thread: &Arc<Thread>) -> Result<()> {
        if !self.is_privileged() {
            return_errno!(Errno::EPERM);
        }
        if user_thread.is_privileged() {
            return_errno!(Errno::EINVAL);
        }
        let mut adopted = self.adopted_lower_half.lock();
        let mut ctx = self.ctx.lock();
        if ctx.ttbr0 != 0 || adopted.is_some() {
            return_errno!(Errno::EBUSY);
        }
        ctx.ttbr0 = user_thread.ctx.lock().ttbr0;
        *adopted = Some(user_thread.id);
        drop(ctx);
        drop(adopted);
        crate::arch::tlb_invalidate_all();
        Ok(())
    }

    /// Drops a lower half taken with [`Self::adopt_lower_half`].
    pub fn release_lower_half(&self) -> Result<()> {
        let mut adopted = self.adopted_lower_half.lock();
        let mut ctx = self.ctx.lock();
        if adopted.is_none() || ctx.ttbr0 == 0 {
            return_errno!(Errno::EINVAL);
        }
        ctx.ttbr0 = 0;
        *adopted = None;
        drop(ctx);
        drop(adopted);
        crate::arch::tlb_invalidate_all();
        Ok(())
    }
}

/// Options for creating a thread. The entry point and arguments are plain
/// addresses/values: they end up in the crafted register state and are
/// first interpreted when the thread is dispatched.
pub struct ThreadOptions {
    pub name: String,
    pub entry: Vaddr,
    pub arg: u64,
    pub arg2: u64,
    pub is_privileged: bool,
    pub priority: u8,
    pub pinned_core: Option<usize>,
}

impl Kernel {
    /// Creates a thread owned by `process`, with its kernel stack mapped
    /// eagerly (the fault handler must never fault on it) and its initial
    /// register state crafted so the first dispatch lands in
    /// `entry(arg)`. The thread is registered and appended to the
    /// process, but *not* scheduled.
    pub fn thread_create(
        &self,
        process: &Arc<Process>,
        options: ThreadOptions,
    ) -> Result<Arc<Thread>> {
        // An unprivileged process cannot host privileged threads.
        let is_privileged = options.is_privileged && process.is_privileged;

        let kernel_stack = self.kernel_vblock.alloc(
            KERNEL_STACK_SIZE,
            crate::mm::BlockTag::new(TagFlags::WRITE, GuardClass::Guard64K, GuardClass::Guard64K),
        )?;
        {
            let mut pt = self.kernel_pt.table.lock();
            let mut vaddr = kernel_stack.data_start();
            while vaddr < kernel_stack.data_end() {
                pt.map(vaddr, 0, PageAttrs::from_block(&kernel_stack), &self.pmem)?;
                vaddr += PAGE_SIZE;
            }
        }

        let mut ctx = ThreadContext::zeroed();
        let sp_el1 = self.build_initial_frame(&kernel_stack, &options, is_privileged)?;
        ctx.sp_el1 = sp_el1;

        let mut user_stack = None;
        let mut tls_block = None;
        if !is_privileged {
            let um_guard = process.user_mem.lock();
            let Some(um) = um_guard.as_ref() else {
                return_errno_with_message!(Errno::EINVAL, "user thread in a kernel-only process");
            };
            let ustack = um.vblock.alloc(
                BLOCK_4M,
                crate::mm::BlockTag::new(
                    TagFlags::USER | TagFlags::WRITE,
                    GuardClass::Guard64K,
                    GuardClass::None,
                ),
            )?;
            ctx.sp_el0 = ustack.data_end();
            ctx.ttbr0 = um.pt.root_with_asid();
            user_stack = Some(ustack);

            // The template contents are copied in by the ELF loader on
            // first dispatch; the core only reserves the block.
            if let Some((_template, data_size)) = *process.tls_template.lock() {
                let tls = um.vblock.alloc(
                    crate::mm::VBlock::size_for(data_size + 16).ok_or(Error::new(Errno::EINVAL))?,
                    crate::mm::BlockTag::new(
                        TagFlags::USER | TagFlags::WRITE | TagFlags::TLS,
                        GuardClass::None,
                        GuardClass::None,
                    ),
                )?;
                ctx.tpidr_el0 = tls.data_start();
                tls_block = Some(tls);
            }
        }

        let thread = self.threads.create(|id| Thread {
            id,
            process: process.id,
            privileged: AtomicBool::new(is_privileged),
            name: SpinLock::new(options.name.clone()),
            base_priority: AtomicU32::new(options.priority as u32),
            pinned_core: options.pinned_core,
            running_on: AtomicI64::new(-1),
            ctx: SpinLock::new(ctx),
            kernel_stack,
            user_stack,
            tls_block,
            tls_values: SpinLock::new(BTreeMap::new()),
            locked_mutexes: SpinLock::new(HashSet::new()),
            locked_rwlocks: SpinLock::new(HashSet::new()),
            signal: SimpleSignal::new(0, u32::MAX),
            join: SpinLock::new(JoinState::default()),
            blocking: SpinLock::new(Blocking::default()),
            for_deletion: AtomicBool::new(false),
            adopted_lower_half: SpinLock::new(None),
        });

        process.threads.lock().push(thread.id);
        log::info!(
            "thread: created {} ({}) in process {}",
            thread.id,
            options.name,
            process.id
        );
        Ok(thread)
    }

    /// Writes the initial exception frame onto the freshly mapped kernel
    /// stack and returns the resulting SP_EL1.
    ///
    /// From the top down: a self-linked FP/LR pair, the Q-register save
    /// area, ELR/SPSR for the first exception return, and the GPR block
    /// with the entry arguments in x0/x1.
    fn build_initial_frame(
        &self,
        kernel_stack: &VMemBlock,
        options: &ThreadOptions,
        is_privileged: bool,
    ) -> Result<Vaddr> {
        const FRAME_WORDS: usize = 2 + 48 + 2 + 18 + 4;
        let mut frame = [0u64; FRAME_WORDS];
        let top = kernel_stack.data_end();
        let recursive_fp = top - 16;

        let mut w = FRAME_WORDS;
        let mut push = |frame: &mut [u64; FRAME_WORDS], val: u64| {
            w -= 1;
            frame[w] = val;
        };

        push(&mut frame, 0); // recursive lr
        push(&mut frame, recursive_fp); // fp links to itself
        for _ in 0..48 {
            push(&mut frame, 0); // Q8-Q31
        }
        push(&mut frame, options.entry); // ELR_EL1
        push(
            &mut frame,
            if is_privileged { SPSR_PRIVILEGED } else { SPSR_USER },
        );
        for _ in 0..18 {
            push(&mut frame, 0); // x2-x18 and the alignment slot
        }
        push(&mut frame, options.arg2); // x1
        push(&mut frame, options.arg); // x0
        push(&mut frame, 0); // lr
        push(&mut frame, recursive_fp); // fp

        let sp = top - (FRAME_WORDS as u64) * 8;
        let pt = self.kernel_pt.table.lock();
        let base_ptr = pt
            .data_ptr(sp)
            .ok_or(Error::with_message(Errno::EFAULT, "kernel stack unmapped"))?;
        // The frame fits inside the topmost 64 KiB page, so one linear
        // pointer covers it.
        unsafe {
            core::ptr::copy_nonoverlapping(frame.as_ptr(), base_ptr as *mut u64, FRAME_WORDS);
        }
        Ok(sp)
    }

    /// Marks a thread for deletion, delivers `retval` to its joiner,
    /// removes it from the run queues and hands it to the cleanup worker.
    pub fn thread_kill(&self, id: ThreadId, retval: u64) -> Result<()> {
        let Some(thread) = self.threads.get(id) else {
            return_errno!(Errno::ESRCH);
        };
        log::info!("thread: kill {} ({})", id, *thread.name.lock());

        thread.mark_for_deletion();
        self.thread_exit_codes.set((thread.process, id), retval);

        let joiner = {
            let mut join = thread.join.lock();
            join.retval = Some(retval);
            join.joiner.take()
        };
        if let Some(joiner_id) = joiner {
            if let Some(joiner) = self.threads.get(joiner_id) {
                joiner.blocking.lock().clear();
                joiner.signal.signal(self, crate::sync::SigOp::Set, 1);
            }
        }

        self.sched.unschedule(&thread);
        self.cleanup.push(self, CleanupMessage::Thread(thread))?;
        Ok(())
    }

    /// Exits the calling thread.
    pub fn thread_exit(&self, retval: u64) -> Result<()> {
        let current = self.current_thread().expect("exit without a current thread");
        self.thread_kill(current.id, retval)?;
        self.sched.yield_now();
        Ok(())
    }

    /// Waits for `target` to terminate and returns its exit value.
    ///
    /// The caller parks on its own private signal; the killer posts the
    /// result. Only one joiner may register; a second one gets
    /// `EDEADLK`, as does a self-join.
    pub fn thread_join(&self, target: ThreadId) -> Result<u64> {
        let current = self.current_thread().expect("join without a current thread");
        if current.id == target {
            return_errno!(Errno::EDEADLK);
        }

        let Some(thread) = self.threads.get(target) else {
            // Already cleaned up; the completion list may still know it.
            return self
                .thread_exit_codes
                .get(&(current.process, target))
                .ok_or(Error::new(Errno::ESRCH));
        };
        if thread.process != current.process {
            return_errno!(Errno::ESRCH);
        }

        {
            let mut join = thread.join.lock();
            if let Some(retval) = join.retval {
                return Ok(retval);
            }
            match join.joiner {
                Some(existing) if existing != current.id => return_errno!(Errno::EDEADLK),
                _ => join.joiner = Some(current.id),
            }
        }

        while current.signal.wait(self, crate::sync::SigOp::Set, 0, None).is_none() {
            if thread.join.lock().retval.is_some() {
                break;
            }
        }
        let retval = thread.join.lock().retval;
        retval.ok_or(Error::new(Errno::ESRCH))
    }

    /// Clamped priority update, re-queueing the thread atomically.
    pub fn thread_set_priority(&self, id: ThreadId, priority: u8) -> Result<()> {
        let priority = priority.clamp(PRIORITY_IDLE + 1, PRIORITY_VHIGH - 1);
        let Some(thread) = self.threads.get(id) else {
            return_errno!(Errno::ESRCH);
        };
        let old = thread.priority();
        if old != priority {
            self.sched.change_priority(&thread, old, priority);
        }
        Ok(())
    }
}

/// Temporarily grants a thread privileged status.
///
/// Used by the cleanup worker while it works on behalf of a dying
/// unprivileged thread. Restores the old status on drop.
pub struct PrivilegeEscalationGuard {
    thread: Arc<Thread>,
    old_privileged: bool,
}

impl PrivilegeEscalationGuard {
    pub fn new(thread: Arc<Thread>) -> Self {
        let old_privileged = thread.is_privileged();
        thread.set_privileged(true);
        PrivilegeEscalationGuard {
            thread,
            old_privileged,
        }
    }
}

impl Drop for PrivilegeEscalationGuard {
    fn drop(&mut self) {
        self.thread.set_privileged(self.old_privileged);
    }
}
