// SPDX-License-Identifier: MPL-2.0

//! The bounded message queue: a fixed-capacity ring used for
//! producer/consumer hand-offs between kernel worker threads and their
//! clients.
//!
//! Producers never block: a full queue is an immediate error and the
//! caller decides whether to retry. Consumers may block with an absolute
//! deadline; every push wakes every registered consumer, and spurious
//! wakeups are benign because `pop` re-checks under the lock.

use hashbrown::HashSet;
use smallvec::SmallVec;

use crate::{
    arch,
    prelude::*,
    sync::SpinLock,
    task::thread::{BlockedOn, ThreadId},
    time::KernelTime,
    Kernel,
};

struct QueueInner<T, const N: usize> {
    buf: [Option<T>; N],
    wptr: usize,
    rptr: usize,
    waiters: HashSet<ThreadId>,
}

impl<T, const N: usize> QueueInner<T, N> {
    fn next(idx: usize) -> usize {
        let idx = idx + 1;
        if idx >= N {
            0
        } else {
            idx
        }
    }

    fn is_empty(&self) -> bool {
        self.wptr == self.rptr
    }

    fn is_full(&self) -> bool {
        Self::next(self.wptr) == self.rptr
    }

    fn take_front(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let v = self.buf[self.rptr].take();
        debug_assert!(v.is_some());
        self.rptr = Self::next(self.rptr);
        v
    }
}

/// A single-producer/multi-consumer ring of capacity `N - 1` items.
pub struct FixedQueue<T, const N: usize> {
    inner: SpinLock<QueueInner<T, N>>,
}

impl<T, const N: usize> FixedQueue<T, N> {
    pub fn new() -> Self {
        FixedQueue {
            inner: SpinLock::new(QueueInner {
                buf: [const { None }; N],
                wptr: 0,
                rptr: 0,
                waiters: HashSet::new(),
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().is_full()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        (inner.wptr + N - inner.rptr) % N
    }

    /// Enqueues `value` and wakes every blocked consumer. A full queue
    /// fails immediately; back-pressure is the caller's business.
    pub fn push(&self, k: &Kernel, value: T) -> Result<()> {
        let woken = {
            let mut inner = self.inner.lock();
            if inner.is_full() {
                return_errno_with_message!(Errno::ENOMEM, "queue full");
            }
            let slot = inner.wptr;
            inner.buf[slot] = Some(value);
            inner.wptr = QueueInner::<T, N>::next(slot);
            inner.waiters.drain().collect::<SmallVec<[ThreadId; 8]>>()
        };

        for id in woken {
            crate::sync::wake_thread(k, id);
        }
        Ok(())
    }

    /// Dequeues immediately or reports an empty queue.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().take_front()
    }

    /// Dequeues, blocking the caller (with an optional absolute
    /// deadline) while the queue is empty. Expiry returns `ETIMEDOUT`
    /// without dequeuing.
    pub fn pop(&self, k: &Kernel, deadline: Option<KernelTime>) -> Result<T> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(v) = inner.take_front() {
                    return Ok(v);
                }
                let current = k.current_thread().expect("queue pop without a current thread");
                inner.waiters.insert(current.id);
                current.blocking.lock().block(BlockedOn::Queue, deadline);
            }
            k.sched.yield_now();
            arch::memory_barrier();

            if let Some(deadline) = deadline {
                if k.clock.now() >= deadline {
                    // Deregister; a late push must not wake a ghost.
                    if let Some(current) = k.current_thread() {
                        self.inner.lock().waiters.remove(&current.id);
                        current.blocking.lock().clear();
                    }
                    return_errno!(Errno::ETIMEDOUT);
                }
            }
        }
    }

    /// Non-consuming read of the front item.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let inner = self.inner.lock();
        if inner.is_empty() {
            return None;
        }
        inner.buf[inner.rptr].clone()
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

impl<T, const N: usize> Default for FixedQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
