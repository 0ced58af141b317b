// SPDX-License-Identifier: MPL-2.0

//! The cleanup worker: the far end of every kill.
//!
//! Threads and processes are never torn down in the context that killed
//! them; they are pushed onto a small queue and reclaimed by a dedicated
//! privileged worker thread, which is the only place where stacks are
//! unmapped and page-table trees are released.

use crate::{
    config::TLS_DTOR_ITERATIONS,
    ipc::FixedQueue,
    prelude::*,
    sync::SpinLock,
    task::thread::PrivilegeEscalationGuard,
    Kernel,
};

use super::{process::Process, thread::Thread};

pub enum CleanupMessage {
    Thread(Arc<Thread>),
    Process(Arc<Process>),
}

pub type CleanupQueue = FixedQueue<CleanupMessage, { crate::config::CLEANUP_QUEUE_DEPTH }>;

/// One pass worth of TLS destructors: (destructor entry point, value the
/// slot held).
pub type DtorBatch = Vec<(Vaddr, u64)>;

/// Runs one user-space destructor inside the adopted lower half.
///
/// Installed by the user-mode runtime glue at boot; it performs the
/// EL0 round trip and returns once the destructor has run.
pub type UserDtorTrampoline = fn(Vaddr, u64);

static USER_DTOR_TRAMPOLINE: SpinLock<Option<UserDtorTrampoline>> = SpinLock::new(None);

pub fn register_user_dtor_trampoline(trampoline: UserDtorTrampoline) {
    *USER_DTOR_TRAMPOLINE.lock() = Some(trampoline);
}

/// The worker body: drain the queue forever.
pub fn cleanup_service(k: &Kernel) -> ! {
    loop {
        match k.cleanup.pop(k, None) {
            Ok(msg) => reclaim(k, msg),
            Err(e) => log::error!("cleanup: pop failed: {:?}", e.error()),
        }
    }
}

/// Handles one cleanup message to completion.
pub fn reclaim(k: &Kernel, msg: CleanupMessage) {
    match msg {
        CleanupMessage::Thread(thread) => reclaim_thread(k, thread),
        CleanupMessage::Process(process) => reclaim_process(k, process),
    }
}

fn reclaim_thread(k: &Kernel, thread: Arc<Thread>) {
    debug_assert!(thread.for_deletion());
    log::info!("cleanup: reclaiming thread {}", thread.id);

    // Anything the thread still held is force-released so its waiters do
    // not starve.
    let mutexes: Vec<_> = thread.locked_mutexes.lock().iter().copied().collect();
    for id in mutexes {
        if let Some(m) = k.mutexes.get(id) {
            m.release_dead_owner(k, thread.id);
        }
    }
    let rwlocks: Vec<_> = thread.locked_rwlocks.lock().iter().copied().collect();
    for id in rwlocks {
        if let Some(l) = k.rwlocks.get(id) {
            let _ = l.unlock(k, Some(thread.id));
        }
    }

    let process = k.processes.get(thread.process);

    if let Some(process) = &process {
        run_tls_destructors(k, &thread, process);

        // User-side blocks go back to the process's lower half.
        let mut um_guard = process.user_mem.lock();
        if let Some(um) = um_guard.as_mut() {
            for block in [&thread.user_stack, &thread.tls_block]
                .into_iter()
                .flatten()
            {
                let freed = um
                    .pt
                    .unmap(block.data_start(), block.data_length(), true, &k.pmem);
                let mut owned = process.owned_pages.lock();
                for paddr in freed {
                    owned.remove(paddr, crate::mm::PAGE_SIZE);
                }
                if let Err(e) = um.vblock.free(block) {
                    log::warn!("cleanup: user block free failed: {:?}", e.error());
                }
            }
        }
    }

    // The kernel stack dies last; nothing may fault on it after this.
    {
        let mut pt = k.kernel_pt.table.lock();
        pt.unmap(
            thread.kernel_stack.data_start(),
            thread.kernel_stack.data_length(),
            true,
            &k.pmem,
        );
    }
    if let Err(e) = k.kernel_vblock.free(&thread.kernel_stack) {
        log::warn!("cleanup: kernel stack free failed: {:?}", e.error());
    }

    if let Some(process) = process {
        let last = {
            let mut threads = process.threads.lock();
            threads.retain(|&tid| tid != thread.id);
            threads.is_empty()
        };
        if last {
            // Last thread gone: the process itself is now garbage.
            if let Err(e) = k
                .cleanup
                .push(k, CleanupMessage::Process(process.clone()))
            {
                log::error!("cleanup: queue full, process {} leaked: {:?}", process.id, e.error());
            }
        }
    }

    k.threads.remove(thread.id);
}

/// One collection pass: clears every live slot that has a registered
/// destructor and records the (destructor, value) pairs.
fn collect_tls_destructor_batch(thread: &Thread, process: &Process) -> DtorBatch {
    let mut batch = DtorBatch::new();
    let keys = process.tls_keys.lock();
    let mut values = thread.tls_values.lock();
    for (key, value) in values.iter_mut() {
        if *value == 0 {
            continue;
        }
        if let Some(dtor) = keys.destructor(*key) {
            batch.push((dtor, *value));
            *value = 0;
        }
    }
    batch
}

fn has_pending_tls_destructors(thread: &Thread, process: &Process) -> bool {
    let keys = process.tls_keys.lock();
    let values = thread.tls_values.lock();
    values
        .iter()
        .any(|(key, value)| *value != 0 && keys.destructor(*key).is_some())
}

/// Runs the dying thread's TLS destructors, re-scanning the slots up to
/// `TLS_DTOR_ITERATIONS` times (a destructor may store fresh values) or
/// until every slot with a destructor is null.
///
/// Privileged threads registered kernel entry points, which are called
/// directly. Unprivileged destructors live in user memory, so the worker
/// escalates, adopts the dying thread's lower half and hands each one to
/// the user dispatch trampoline.
fn run_tls_destructors(k: &Kernel, dying: &Arc<Thread>, process: &Process) {
    if !has_pending_tls_destructors(dying, process) {
        return;
    }

    let mut adoption = None;
    let trampoline = if dying.is_privileged() {
        None
    } else {
        let Some(worker) = k.current_thread() else {
            log::warn!(
                "cleanup: no worker context, TLS destructors of thread {} dropped",
                dying.id
            );
            return;
        };
        let Some(trampoline) = *USER_DTOR_TRAMPOLINE.lock() else {
            log::warn!(
                "cleanup: no user dispatch trampoline, TLS destructors of thread {} dropped",
                dying.id
            );
            return;
        };
        let escalation = PrivilegeEscalationGuard::new(worker.clone());
        if let Err(e) = worker.adopt_lower_half(dying) {
            log::error!("cleanup: lower-half adoption failed: {:?}", e.error());
            return;
        }
        adoption = Some((worker, escalation));
        Some(trampoline)
    };

    for _ in 0..TLS_DTOR_ITERATIONS {
        let batch = collect_tls_destructor_batch(dying, process);
        if batch.is_empty() {
            break;
        }
        log::debug!(
            "cleanup: thread {} running {} TLS destructors",
            dying.id,
            batch.len()
        );
        for &(dtor, value) in &batch {
            match trampoline {
                Some(trampoline) => trampoline(dtor, value),
                // SAFETY: privileged keys are registered by the kernel
                // process and hold kernel entry points of this signature.
                None => unsafe {
                    let f: extern "C" fn(u64) = core::mem::transmute(dtor as usize);
                    f(value)
                },
            }
        }
    }

    if let Some((worker, _escalation)) = adoption {
        if let Err(e) = worker.release_lower_half() {
            log::error!("cleanup: lower-half release failed: {:?}", e.error());
        }
    }
}

fn reclaim_process(k: &Kernel, process: Arc<Process>) {
    log::info!("cleanup: reclaiming process {}", process.id);

    // Owned primitives die in creation order (ids are monotonic, the
    // sets are ordered).
    for id in core::mem::take(&mut *process.owned_mutexes.lock()) {
        if let Some(m) = k.mutexes.get(id) {
            let _ = m.try_delete(k);
        }
        k.mutexes.remove(id);
    }
    for id in core::mem::take(&mut *process.owned_conditions.lock()) {
        if let Some(c) = k.conditions.get(id) {
            let _ = c.try_delete(k);
        }
        k.conditions.remove(id);
    }
    for id in core::mem::take(&mut *process.owned_rwlocks.lock()) {
        if let Some(l) = k.rwlocks.get(id) {
            let _ = l.try_delete(k);
        }
        k.rwlocks.remove(id);
    }
    for id in core::mem::take(&mut *process.owned_semaphores.lock()) {
        if let Some(s) = k.semaphores.get(id) {
            let _ = s.try_delete(k);
        }
        k.semaphores.remove(id);
    }

    // Then the owned frames, then the page-table tree itself.
    let owned = process.owned_pages.lock().drain_owned();
    for block in owned {
        k.pmem.release(block);
    }
    if let Some(um) = process.user_mem.lock().take() {
        um.pt.release_tree(&k.pmem);
    }

    k.processes.remove(process.id);
}
