// SPDX-License-Identifier: MPL-2.0

//! The userspace-visible mutex: normal, recursive or error-check.

use hashbrown::HashSet;
use smallvec::SmallVec;

use crate::{
    prelude::*,
    task::{registry::Kid, thread::ThreadId},
    time::KernelTime,
    Kernel,
};

use super::SpinLock;

struct MutexInner {
    owner: Option<ThreadId>,
    lockcount: u32,
    waiters: HashSet<ThreadId>,
}

pub struct Mutex {
    pub id: Kid,
    is_recursive: bool,
    error_check: bool,
    inner: SpinLock<MutexInner>,
}

impl Mutex {
    pub fn new(id: Kid, is_recursive: bool, error_check: bool) -> Self {
        Mutex {
            id,
            is_recursive,
            error_check,
            inner: SpinLock::new(MutexInner {
                owner: None,
                lockcount: 0,
                waiters: HashSet::with_capacity(8),
            }),
        }
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.inner.lock().owner
    }

    /// Loops on [`Self::try_lock`] until the mutex is held.
    pub fn lock(&self, k: &Kernel) {
        loop {
            match self.try_lock(k, true, None) {
                Ok(()) => return,
                Err(e) if e.error() == Errno::EBUSY => continue,
                Err(e) => {
                    // A deadlock diagnosed here cannot be recovered from.
                    panic!("mutex {}: lock failed with {:?}", self.id, e.error());
                }
            }
        }
    }

    /// One acquisition attempt.
    ///
    /// On contention with `block` set, the caller is pushed onto the
    /// waiter set, its blocking descriptor is pointed at the current
    /// owner (the priority-inheritance edge) and the core reschedules;
    /// `EBUSY` is still returned and the caller loops after resuming.
    pub fn try_lock(&self, k: &Kernel, block: bool, timeout: Option<KernelTime>) -> Result<()> {
        let current = k.current_thread().expect("mutex lock without a current thread");

        loop {
            let owner_id = self.inner.lock().owner;
            // Resolve the owner outside the mutex lock; registry lookups
            // never nest under a primitive lock.
            let owner = owner_id.and_then(|id| k.threads.get(id));

            let mut inner = self.inner.lock();
            if inner.owner != owner_id {
                continue; // raced with an unlock, resolve again
            }

            match owner {
                None => {
                    inner.owner = Some(current.id);
                    if self.is_recursive {
                        inner.lockcount = 1;
                    }
                    drop(inner);
                    current.locked_mutexes.lock().insert(self.id);
                    return Ok(());
                }
                Some(owner) if owner.id == current.id => {
                    if self.is_recursive {
                        inner.lockcount += 1;
                        return Ok(());
                    }
                    if self.error_check {
                        return_errno!(Errno::EDEADLK);
                    }
                    // A plain mutex re-locked by its owner deadlocks by
                    // contract; park the thread so the core stays usable.
                    log::warn!("mutex {}: recursive lock of non-recursive mutex", self.id);
                    current.blocking.lock().block_indefinite();
                    drop(inner);
                    k.sched.yield_now();
                    return_errno!(Errno::EDEADLK);
                }
                Some(owner) => {
                    if block {
                        inner.waiters.insert(current.id);
                        current.blocking.lock().block_on_thread(owner.id, timeout);
                        drop(inner);
                        k.sched.yield_now();
                    }
                    return_errno!(Errno::EBUSY);
                }
            }
        }
    }

    /// Releases the mutex and wakes every waiter.
    ///
    /// `force` lets the cleanup worker strip the mutex from a dying
    /// thread; even then a privileged owner is left alone.
    pub fn unlock(&self, k: &Kernel, force: bool) -> Result<()> {
        let current = k.current_thread();

        let woken = loop {
            let owner_id = self.inner.lock().owner;
            let Some(owner_id) = owner_id else {
                return_errno!(Errno::EPERM);
            };
            let owner = k.threads.get(owner_id);

            let mut inner = self.inner.lock();
            if inner.owner != Some(owner_id) {
                continue;
            }
            let Some(owner) = owner else {
                // Owner died without cleanup; treat as unowned.
                inner.owner = None;
                return_errno!(Errno::EPERM);
            };

            let is_owner = current.as_ref().is_some_and(|c| c.id == owner.id);
            if !is_owner && !force {
                return_errno!(Errno::EPERM);
            }
            if force && !is_owner && owner.is_privileged() {
                return_errno!(Errno::EPERM);
            }

            if self.is_recursive {
                inner.lockcount -= 1;
                if inner.lockcount > 0 {
                    return Ok(());
                }
            }
            inner.owner = None;
            owner.locked_mutexes.lock().remove(&self.id);
            break inner.waiters.drain().collect::<SmallVec<[ThreadId; 8]>>();
        };

        for id in woken {
            super::wake_thread(k, id);
        }
        Ok(())
    }

    /// Destroys the mutex if it is unowned or owned by the caller; every
    /// waiter is woken to observe the death.
    pub fn try_delete(&self, k: &Kernel) -> Result<()> {
        let current = k.current_thread();

        let woken = loop {
            let owner_id = self.inner.lock().owner;
            let owner_live = owner_id.is_some_and(|id| k.threads.get(id).is_some());

            let mut inner = self.inner.lock();
            if inner.owner != owner_id {
                continue;
            }
            if let Some(owner_id) = owner_id {
                let held_by_caller = current.as_ref().is_some_and(|c| c.id == owner_id);
                if owner_live && !held_by_caller {
                    return_errno!(Errno::EBUSY);
                }
                if held_by_caller {
                    if let Some(current) = &current {
                        current.locked_mutexes.lock().remove(&self.id);
                    }
                }
            }
            inner.owner = None;
            break inner.waiters.drain().collect::<SmallVec<[ThreadId; 8]>>();
        };

        for id in woken {
            super::wake_thread(k, id);
        }
        Ok(())
    }

    /// Strips ownership from a dead thread, waking every waiter. The
    /// cleanup worker calls this for each mutex a condemned thread still
    /// held; no permission checks apply to the dead.
    pub(crate) fn release_dead_owner(&self, k: &Kernel, owner_id: ThreadId) {
        let woken = {
            let mut inner = self.inner.lock();
            if inner.owner != Some(owner_id) {
                return;
            }
            inner.owner = None;
            inner.lockcount = 0;
            inner.waiters.drain().collect::<SmallVec<[ThreadId; 8]>>()
        };
        for id in woken {
            super::wake_thread(k, id);
        }
    }

    /// Waiters currently parked here (diagnostics and tests).
    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn has_waiter(&self, id: ThreadId) -> bool {
        self.inner.lock().waiters.contains(&id)
    }
}
