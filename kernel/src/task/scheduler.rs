// SPDX-License-Identifier: MPL-2.0

//! The per-core preemptive scheduler.
//!
//! One instance drives all cores. Each priority level keeps an ordered
//! run queue with a round-robin cursor; threads stay queued while blocked
//! and are merely skipped, so that a blocked high-priority thread can
//! still donate its slot to the thread it waits on (priority inheritance
//! by substitution).

use core::time::Duration;

use crate::{
    arch,
    config::{MAX_TIMESLICE_US, NR_CPUS, NR_PRIORITIES, PRIORITY_INHERIT_MAX_HOPS},
    prelude::*,
    sync::{lock_both, SpinLock},
    time::KernelTime,
    Kernel,
};

use super::thread::{BlockedOn, Thread};

struct RunQueue {
    threads: Vec<Arc<Thread>>,
    cursor: usize,
}

struct CoreState {
    current: Option<Arc<Thread>>,
    /// Priority of the slot being run, which may exceed the running
    /// thread's own priority after a priority-inheritance substitution.
    current_priority: u8,
    idle: Option<Arc<Thread>>,
    timeslice_start: KernelTime,
    idle_time_us: u64,
    busy_time_us: u64,
}

pub struct Scheduler {
    queues: [SpinLock<RunQueue>; NR_PRIORITIES],
    cores: [SpinLock<CoreState>; NR_CPUS],
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            queues: core::array::from_fn(|_| {
                SpinLock::new(RunQueue {
                    threads: Vec::new(),
                    cursor: 0,
                })
            }),
            cores: core::array::from_fn(|_| {
                SpinLock::new(CoreState {
                    current: None,
                    current_priority: 0,
                    idle: None,
                    timeslice_start: KernelTime::ZERO,
                    idle_time_us: 0,
                    busy_time_us: 0,
                })
            }),
        }
    }

    /// Registers the idle thread elected when a core has nothing to run.
    pub fn set_idle_thread(&self, core: usize, thread: Arc<Thread>) {
        self.cores[core].lock().idle = Some(thread);
    }

    /// Inserts a thread into the queue of its priority.
    pub fn schedule(&self, thread: &Arc<Thread>) {
        let mut queue = self.queues[thread.priority() as usize].lock();
        if !queue.threads.iter().any(|t| Arc::ptr_eq(t, thread)) {
            queue.threads.push(thread.clone());
        }
    }

    /// Removes a thread from its queue (killed or migrating).
    pub fn unschedule(&self, thread: &Arc<Thread>) {
        let mut queue = self.queues[thread.priority() as usize].lock();
        if let Some(pos) = queue.threads.iter().position(|t| Arc::ptr_eq(t, thread)) {
            queue.threads.remove(pos);
            if queue.cursor > pos {
                queue.cursor -= 1;
            }
        }
    }

    /// Moves a thread between priority queues atomically.
    pub fn change_priority(&self, thread: &Arc<Thread>, old: u8, new: u8) {
        if old == new {
            return;
        }
        let (mut from, mut to) = lock_both(
            &self.queues[old as usize],
            &self.queues[new as usize],
        );
        if let Some(pos) = from.threads.iter().position(|t| Arc::ptr_eq(t, thread)) {
            from.threads.remove(pos);
            if from.cursor > pos {
                from.cursor -= 1;
            }
            to.threads.push(thread.clone());
        }
        thread.set_priority(new);
    }

    pub fn current(&self, core: usize) -> Option<Arc<Thread>> {
        self.cores[core].lock().current.clone()
    }

    /// Elects the next thread for `core`: the first runnable (or
    /// substitutable) thread scanning priorities downward and each queue
    /// round-robin. Returns the thread plus the priority of the slot it
    /// won; `None` means the core should run its idle thread.
    pub fn get_next_thread(&self, k: &Kernel, core: usize) -> Option<(Arc<Thread>, u8)> {
        let now = k.clock.now();
        for prio in (0..NR_PRIORITIES).rev() {
            let mut queue = self.queues[prio].lock();
            let len = queue.threads.len();
            for step in 1..=len {
                let idx = (queue.cursor + step) % len;
                let thread = &queue.threads[idx];
                if thread.for_deletion() {
                    continue;
                }
                if !self.may_run_on(thread, core) {
                    continue;
                }
                let candidate = if thread.is_runnable(now) {
                    Some(thread.clone())
                } else {
                    self.resolve_blocker(k, thread, now, core)
                };
                if let Some(candidate) = candidate {
                    queue.cursor = idx;
                    return Some((candidate, prio as u8));
                }
            }
        }
        None
    }

    /// Follows a blocked thread's blocking chain for at most
    /// `PRIORITY_INHERIT_MAX_HOPS` hops. If the chain ends in a thread
    /// that could run here, that thread is promoted into the blocked
    /// thread's slot. Missing ids end the chain.
    fn resolve_blocker(
        &self,
        k: &Kernel,
        blocked: &Arc<Thread>,
        now: KernelTime,
        core: usize,
    ) -> Option<Arc<Thread>> {
        let mut cur = blocked.clone();
        for _ in 0..PRIORITY_INHERIT_MAX_HOPS {
            let target = cur.blocking.lock().blocked_on_thread()?;
            let next = k.threads.get(target)?;
            if next.for_deletion() {
                return None;
            }
            if next.is_runnable(now) {
                return (self.may_run_on(&next, core)).then_some(next);
            }
            cur = next;
        }
        None
    }

    fn may_run_on(&self, thread: &Arc<Thread>, core: usize) -> bool {
        if thread.pinned_core.is_some_and(|c| c != core) {
            return false;
        }
        // Running elsewhere right now; unless that is this very core.
        !thread.running_on().is_some_and(|c| c != core)
    }

    /// One full scheduling step for `core`: elects, accounts the expiring
    /// timeslice, and installs the choice as current. The caller performs
    /// the actual context switch with the returned thread.
    pub fn reschedule(&self, k: &Kernel, core: usize) -> Option<Arc<Thread>> {
        let elected = self.get_next_thread(k, core);
        let now = k.clock.now();

        let mut cs = self.cores[core].lock();
        let (next, slot_priority) = match elected {
            Some((t, p)) => (Some(t), p),
            None => (cs.idle.clone(), 0),
        };

        let elapsed = now.saturating_duration_since(cs.timeslice_start);
        let was_idle = match (&cs.current, &cs.idle) {
            (Some(cur), Some(idle)) => Arc::ptr_eq(cur, idle),
            (None, _) => true,
            _ => false,
        };
        if was_idle {
            cs.idle_time_us += elapsed.as_micros() as u64;
        } else {
            cs.busy_time_us += elapsed.as_micros() as u64;
        }

        if let Some(prev) = cs.current.take() {
            let retained = next.as_ref().is_some_and(|n| Arc::ptr_eq(n, &prev));
            if !retained {
                prev.set_running_on(None);
            }
        }
        if let Some(next) = &next {
            next.set_running_on(Some(core));
        }
        cs.current = next.clone();
        cs.current_priority = slot_priority;
        cs.timeslice_start = now;
        next
    }

    /// Installs `thread` as the current thread of `core` without an
    /// election; boot and the dispatch glue use this.
    pub fn adopt(&self, k: &Kernel, core: usize, thread: Arc<Thread>) {
        let mut cs = self.cores[core].lock();
        if let Some(prev) = cs.current.take() {
            if !Arc::ptr_eq(&prev, &thread) {
                prev.set_running_on(None);
            }
        }
        thread.set_running_on(Some(core));
        cs.current_priority = thread.priority();
        cs.current = Some(thread);
        cs.timeslice_start = k.clock.now();
    }

    /// The moment the preemption timer should next fire for `core`: the
    /// end of the running timeslice, or earlier if a higher-priority
    /// blocked thread has a nearer wake deadline.
    pub fn next_wake(&self, core: usize) -> KernelTime {
        let (mut wake, above) = {
            let cs = self.cores[core].lock();
            (
                cs.timeslice_start + Duration::from_micros(MAX_TIMESLICE_US),
                cs.current_priority,
            )
        };
        for prio in (above as usize + 1)..NR_PRIORITIES {
            let queue = self.queues[prio].lock();
            for thread in &queue.threads {
                if let Some(until) = thread.blocking.lock().wake_time() {
                    wake = wake.min(until);
                }
            }
        }
        wake
    }

    /// Requests an immediate reschedule of the calling core.
    pub fn yield_now(&self) {
        arch::reschedule_self();
    }

    /// Parks the calling thread and reschedules. `until == None` blocks
    /// until explicitly woken.
    pub fn block_current(&self, k: &Kernel, until: Option<KernelTime>, on: BlockedOn) {
        if let Some(current) = self.current(arch::cpu_id()) {
            current.blocking.lock().block(on, until);
        }
        self.yield_now();
    }

    /// Pokes every core running something of strictly lower priority
    /// than a freshly woken thread.
    pub fn signal_thread_woken(&self, thread: &Thread) {
        let self_core = arch::cpu_id();
        for core in 0..NR_CPUS {
            let running_priority = {
                let cs = self.cores[core].lock();
                cs.current.as_ref().map(|c| c.priority())
            };
            let preemptable = running_priority.is_none_or(|p| p < thread.priority());
            if !preemptable {
                continue;
            }
            if core == self_core {
                arch::reschedule_self();
            } else {
                arch::send_reschedule_ipi(core);
            }
        }
    }

    /// Busy share of a core since boot, in permille.
    pub fn cpu_usage_permille(&self, core: usize) -> u32 {
        let cs = self.cores[core].lock();
        let total = cs.busy_time_us + cs.idle_time_us;
        if total == 0 {
            return 0;
        }
        (cs.busy_time_us * 1000 / total) as u32
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
