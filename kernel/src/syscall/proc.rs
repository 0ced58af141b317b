// SPDX-License-Identifier: MPL-2.0

//! Process and thread syscalls.

use crate::{
    config::{PRIORITY_IDLE, PRIORITY_VHIGH},
    prelude::*,
    task::{registry::Kid, Thread, ThreadId, ThreadOptions},
    time::KernelTime,
    Kernel,
};

/// Creates a process running `entry` in its main thread. The thread
/// inherits the caller's priority and is scheduled immediately.
pub fn sys_process_create(
    k: &Kernel,
    name: &str,
    entry: Vaddr,
    arg: u64,
    is_privileged: bool,
) -> Result<Kid> {
    let parent = k.current_process();
    let process = k.process_create(name, is_privileged, parent.as_ref())?;

    let priority = k
        .current_thread()
        .map_or(crate::config::PRIORITY_NORMAL, |t| t.priority());
    let main = k.thread_create(
        &process,
        ThreadOptions {
            name: alloc::format!("{}_0", name),
            entry,
            arg,
            arg2: 0,
            is_privileged,
            priority,
            pinned_core: None,
        },
    )?;
    k.sched.schedule(&main);
    Ok(process.id)
}

pub fn sys_process_kill(k: &Kernel, pid: Kid, exit_code: i32) -> Result<()> {
    k.process_kill(pid, exit_code)
}

pub fn sys_process_wait(
    k: &Kernel,
    pid: Kid,
    block: bool,
    deadline: Option<KernelTime>,
) -> Result<i32> {
    k.process_wait(pid, block, deadline)
}

pub fn sys_getppid(k: &Kernel, pid: Kid) -> Result<Kid> {
    k.process_parent_id(pid)
}

/// Creates a thread in the caller's process and schedules it.
pub fn sys_thread_create(
    k: &Kernel,
    entry: Vaddr,
    arg: u64,
    arg2: u64,
    priority: u8,
) -> Result<ThreadId> {
    if entry == 0 {
        return_errno!(Errno::EINVAL);
    }
    let current = k.current_thread().ok_or(Error::new(Errno::ESRCH))?;
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;

    let thread = k.thread_create(
        &process,
        ThreadOptions {
            name: alloc::format!("{}_{}", *process.name.lock(), current.id),
            entry,
            arg,
            arg2,
            is_privileged: current.is_privileged(),
            priority,
            pinned_core: None,
        },
    )?;
    // Name it after its own id now that one is assigned.
    let _ = thread.set_name(&alloc::format!("{}_{}", *process.name.lock(), thread.id));
    k.sched.schedule(&thread);
    Ok(thread.id)
}

pub fn sys_thread_exit(k: &Kernel, retval: u64) -> Result<()> {
    k.thread_exit(retval)
}

pub fn sys_thread_join(k: &Kernel, target: ThreadId) -> Result<u64> {
    k.thread_join(target)
}

pub fn sys_thread_setname(k: &Kernel, target: ThreadId, name: &str) -> Result<()> {
    let thread = same_process_thread(k, target)?;
    thread.set_name(name)
}

pub fn sys_thread_set_priority(k: &Kernel, target: ThreadId, priority: u8) -> Result<()> {
    let thread = same_process_thread(k, target)?;
    k.thread_set_priority(thread.id, priority)
}

pub fn sys_thread_get_priority(k: &Kernel, target: ThreadId) -> Result<u8> {
    let thread = same_process_thread(k, target)?;
    Ok(thread.priority())
}

/// User threads may take any priority strictly between idle and the
/// topmost (kernel-worker) level.
pub fn sys_sched_get_priority_min(_k: &Kernel) -> Result<u8> {
    Ok(PRIORITY_IDLE + 1)
}

pub fn sys_sched_get_priority_max(_k: &Kernel) -> Result<u8> {
    Ok(PRIORITY_VHIGH - 1)
}

/// Threads are only visible to syscalls from their own process.
fn same_process_thread(k: &Kernel, target: ThreadId) -> Result<Arc<Thread>> {
    let current = k.current_thread().ok_or(Error::new(Errno::ESRCH))?;
    let thread = k.threads.get(target).ok_or(Error::new(Errno::ESRCH))?;
    if thread.process != current.process {
        return_errno!(Errno::ESRCH);
    }
    Ok(thread)
}
