// SPDX-License-Identifier: MPL-2.0

//! The user-space counting semaphore.

use hashbrown::HashSet;

use crate::{
    prelude::*,
    task::{
        registry::Kid,
        thread::{BlockedOn, ThreadId},
    },
    time::KernelTime,
    Kernel,
};

use super::SpinLock;

struct SemInner {
    value: u32,
    waiters: HashSet<ThreadId>,
}

pub struct Semaphore {
    pub id: Kid,
    inner: SpinLock<SemInner>,
}

impl Semaphore {
    pub fn new(id: Kid, value: u32) -> Self {
        Semaphore {
            id,
            inner: SpinLock::new(SemInner {
                value,
                waiters: HashSet::with_capacity(8),
            }),
        }
    }

    pub fn value(&self) -> u32 {
        self.inner.lock().value
    }

    /// Decrements the counter if positive, otherwise blocks (when asked
    /// to) and reports `EBUSY`; the caller loops after resuming.
    pub fn try_wait(&self, k: &Kernel, block: bool, timeout: Option<KernelTime>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.value > 0 {
            inner.value -= 1;
            return Ok(());
        }
        if block {
            let current = k.current_thread().expect("sem wait without a current thread");
            inner.waiters.insert(current.id);
            current.blocking.lock().block(BlockedOn::Semaphore, timeout);
            drop(inner);
            k.sched.yield_now();
        }
        return_errno!(Errno::EBUSY)
    }

    /// Adds `n` and wakes up to `n` waiters.
    pub fn post(&self, k: &Kernel, n: u32) {
        let woken = {
            let mut inner = self.inner.lock();
            inner.value = inner.value.saturating_add(n);
            let ids: Vec<ThreadId> = inner.waiters.iter().copied().take(n as usize).collect();
            for id in &ids {
                inner.waiters.remove(id);
            }
            ids
        };
        for id in woken {
            super::wake_thread(k, id);
        }
    }

    /// Destruction wakes every waiter.
    pub fn try_delete(&self, k: &Kernel) -> Result<()> {
        let woken: Vec<ThreadId> = {
            let mut inner = self.inner.lock();
            inner.waiters.drain().collect()
        };
        for id in woken {
            super::wake_thread(k, id);
        }
        Ok(())
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}
