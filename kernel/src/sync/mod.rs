// SPDX-License-Identifier: MPL-2.0

//! Synchronization primitives.
//!
//! Every primitive guards its own metadata with an internal spin lock and
//! keeps its waiters as thread ids; waking resolves the ids through the
//! thread registry *after* the primitive's lock is dropped, so no wake
//! path ever nests a registry lookup under a primitive lock.

mod barrier;
mod condvar;
mod mutex;
mod rwlock;
mod semaphore;
mod signal;
mod spin;

pub use barrier::Barrier;
pub use condvar::{Condition, SignalledFlag};
pub use mutex::Mutex;
pub use rwlock::RwLock;
pub use semaphore::Semaphore;
pub use signal::{BinarySemaphore, CountingSemaphore, SigOp, SimpleSignal};
pub use spin::{lock_both, SpinLock, SpinLockGuard};

use crate::{task::thread::ThreadId, Kernel};

/// Clears a thread's blocking state and nudges the scheduler about it.
pub(crate) fn wake_thread(k: &Kernel, id: ThreadId) {
    if let Some(t) = k.threads.get(id) {
        t.blocking.lock().clear();
        k.sched.signal_thread_woken(&t);
    }
}
