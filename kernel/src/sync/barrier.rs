// SPDX-License-Identifier: MPL-2.0

//! The thread barrier.

use crate::{
    prelude::*,
    task::{
        registry::Kid,
        thread::{BlockedOn, ThreadId},
    },
    Kernel,
};

use super::SpinLock;

struct BarrierInner {
    required: u32,
    count: u32,
    /// Ordered, so the release token goes to exactly the releaser.
    waiters: Vec<ThreadId>,
}

pub struct Barrier {
    pub id: Kid,
    inner: SpinLock<BarrierInner>,
}

impl Barrier {
    pub fn new(id: Kid, required: u32) -> Self {
        Barrier {
            id,
            inner: SpinLock::new(BarrierInner {
                required,
                count: 0,
                waiters: Vec::new(),
            }),
        }
    }

    /// Arrives at the barrier. The arrival that completes the round wakes
    /// everyone, resets the barrier and returns `true` (the release
    /// token); every other arrival blocks indefinitely and returns
    /// `false` once released.
    pub fn wait(&self, k: &Kernel) -> bool {
        let current = k.current_thread().expect("barrier wait without a current thread");

        let woken = {
            let mut inner = self.inner.lock();
            inner.count += 1;
            if inner.count >= inner.required {
                inner.count = 0;
                Some(core::mem::take(&mut inner.waiters))
            } else {
                inner.waiters.push(current.id);
                current.blocking.lock().block(BlockedOn::Barrier, None);
                None
            }
        };

        match woken {
            Some(ids) => {
                for id in ids {
                    super::wake_thread(k, id);
                }
                true
            }
            None => {
                k.sched.yield_now();
                false
            }
        }
    }

    /// Destruction wakes every parked thread.
    pub fn destroy(&self, k: &Kernel) {
        let ids = {
            let mut inner = self.inner.lock();
            inner.count = 0;
            core::mem::take(&mut inner.waiters)
        };
        for id in ids {
            super::wake_thread(k, id);
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}
