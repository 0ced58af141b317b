// SPDX-License-Identifier: MPL-2.0

//! The condition variable.
//!
//! The caller must release the associated mutex immediately before
//! waiting; the syscall layer enforces that ordering. Each waiter leaves
//! behind a shared "signalled" flag that the signaller stamps with a
//! non-zero token, so a timed-out waiter can tell wakeup from expiry.

use core::sync::atomic::{AtomicI32, Ordering};

use alloc::collections::BTreeMap;

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

/// The per-wait output slot: zero until a signal arrives.
pub struct SignalledFlag(AtomicI32);

impl SignalledFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(SignalledFlag(AtomicI32::new(0)))
    }

    pub fn was_signalled(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }

    fn stamp(&self) {
        self.0.store(1, Ordering::Release);
    }
}

struct CondWaiter {
    until: Option<KernelTime>,
    signalled: Arc<SignalledFlag>,
}

pub struct Condition {
    pub id: Kid,
    waiters: SpinLock<BTreeMap<ThreadId, CondWaiter>>,
}

impl Condition {
    pub fn new(id: Kid) -> Self {
        Condition {
            id,
            waiters: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Parks the caller until signalled or `timeout` passes.
    ///
    /// A deadline already in the past returns immediately with the flag
    /// still zero. Otherwise the caller is registered and blocked; after
    /// it resumes, `signalled` tells whether a signal (rather than the
    /// deadline) ended the wait.
    pub fn wait(
        &self,
        k: &Kernel,
        timeout: Option<KernelTime>,
        signalled: &Arc<SignalledFlag>,
    ) -> Result<()> {
        if let Some(deadline) = timeout {
            if k.clock.now() >= deadline {
                return Ok(());
            }
        }

        let current = k.current_thread().expect("cond wait without a current thread");
        {
            let mut waiters = self.waiters.lock();
            waiters.insert(
                current.id,
                CondWaiter {
                    until: timeout,
                    signalled: signalled.clone(),
                },
            );
            current.blocking.lock().block(BlockedOn::Condition, timeout);
        }
        k.sched.yield_now();

        if let Some(deadline) = timeout {
            // Expired without a signal: drop the stale registration.
            if k.clock.now() >= deadline && !signalled.was_signalled() {
                self.forget_waiter(current.id);
            }
        }
        Ok(())
    }

    /// Wakes one waiter (or all of them), stamping each one's flag.
    pub fn signal(&self, k: &Kernel, all: bool) {
        let woken = {
            let mut waiters = self.waiters.lock();
            if all {
                let drained: Vec<_> = core::mem::take(&mut *waiters).into_iter().collect();
                drained
            } else {
                match waiters.pop_first() {
                    Some(entry) => alloc::vec![entry],
                    None => Vec::new(),
                }
            }
        };

        for (id, waiter) in woken {
            waiter.signalled.stamp();
            super::wake_thread(k, id);
        }
    }

    /// The nearest deadline among the registered waiters.
    pub fn earliest_deadline(&self) -> Option<KernelTime> {
        self.waiters
            .lock()
            .values()
            .filter_map(|w| w.until)
            .min()
    }

    /// Destruction wakes every waiter (their flags stay zero).
    pub fn try_delete(&self, k: &Kernel) -> Result<()> {
        let woken: Vec<ThreadId> = {
            let mut waiters = self.waiters.lock();
            core::mem::take(&mut *waiters).into_keys().collect()
        };
        for id in woken {
            super::wake_thread(k, id);
        }
        Ok(())
    }

    /// Drops a waiter entry after its deadline passed without a signal.
    pub(crate) fn forget_waiter(&self, id: ThreadId) {
        self.waiters.lock().remove(&id);
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}
