// SPDX-License-Identifier: MPL-2.0

//! The userspace-visible reader/writer lock: a single writer XOR any
//! number of readers.

use hashbrown::HashSet;

use crate::{
    prelude::*,
    task::{registry::Kid, thread::ThreadId},
    time::KernelTime,
    Kernel,
};

use super::SpinLock;

struct RwLockInner {
    write_owner: Option<ThreadId>,
    read_owners: HashSet<ThreadId>,
    waiters: HashSet<ThreadId>,
}

pub struct RwLock {
    pub id: Kid,
    inner: SpinLock<RwLockInner>,
}

impl RwLock {
    pub fn new(id: Kid) -> Self {
        RwLock {
            id,
            inner: SpinLock::new(RwLockInner {
                write_owner: None,
                read_owners: HashSet::with_capacity(8),
                waiters: HashSet::with_capacity(8),
            }),
        }
    }

    /// Takes the write side; fails while any reader or another writer
    /// holds the lock. Blocking callers park on one current holder.
    pub fn try_wrlock(&self, k: &Kernel, block: bool, timeout: Option<KernelTime>) -> Result<()> {
        let current = k.current_thread().expect("rwlock without a current thread");

        let mut inner = self.inner.lock();
        if inner.write_owner == Some(current.id) {
            return_errno!(Errno::EDEADLK);
        }
        let holder = inner
            .write_owner
            .or_else(|| inner.read_owners.iter().next().copied());
        match holder {
            None => {
                inner.write_owner = Some(current.id);
                drop(inner);
                current.locked_rwlocks.lock().insert(self.id);
                Ok(())
            }
            Some(holder) => {
                if block {
                    inner.waiters.insert(current.id);
                    current.blocking.lock().block_on_thread(holder, timeout);
                    drop(inner);
                    k.sched.yield_now();
                }
                return_errno!(Errno::EBUSY)
            }
        }
    }

    /// Takes the read side; fails only while a writer holds the lock.
    /// Readers never block each other.
    pub fn try_rdlock(&self, k: &Kernel, block: bool, timeout: Option<KernelTime>) -> Result<()> {
        let current = k.current_thread().expect("rwlock without a current thread");

        let mut inner = self.inner.lock();
        match inner.write_owner {
            Some(writer) if writer == current.id => return_errno!(Errno::EDEADLK),
            Some(writer) => {
                if block {
                    inner.waiters.insert(current.id);
                    current.blocking.lock().block_on_thread(writer, timeout);
                    drop(inner);
                    k.sched.yield_now();
                }
                return_errno!(Errno::EBUSY)
            }
            None => {
                inner.read_owners.insert(current.id);
                drop(inner);
                current.locked_rwlocks.lock().insert(self.id);
                Ok(())
            }
        }
    }

    /// Releases whichever side the caller holds; the mode is determined
    /// from the caller's presence in the writer slot or the reader set.
    pub fn unlock(&self, k: &Kernel, force_thread: Option<ThreadId>) -> Result<()> {
        let caller_id = match force_thread {
            Some(id) => id,
            None => {
                k.current_thread()
                    .expect("rwlock without a current thread")
                    .id
            }
        };

        let woken = {
            let mut inner = self.inner.lock();
            if inner.write_owner == Some(caller_id) {
                inner.write_owner = None;
            } else if inner.read_owners.remove(&caller_id) {
                if !inner.read_owners.is_empty() {
                    // Still read-held; a parked writer keeps waiting.
                    drop(inner);
                    if let Some(t) = k.threads.get(caller_id) {
                        t.locked_rwlocks.lock().remove(&self.id);
                    }
                    return Ok(());
                }
            } else {
                return_errno!(Errno::EPERM);
            }
            inner.waiters.drain().collect::<Vec<_>>()
        };

        if let Some(t) = k.threads.get(caller_id) {
            t.locked_rwlocks.lock().remove(&self.id);
        }
        for id in woken {
            super::wake_thread(k, id);
        }
        Ok(())
    }

    /// Destroys the lock if nobody live holds it (or only the caller
    /// does); every waiter is woken.
    pub fn try_delete(&self, k: &Kernel) -> Result<()> {
        let current_id = k.current_thread().map(|t| t.id);

        let woken = loop {
            let (writer, readers) = {
                let inner = self.inner.lock();
                (
                    inner.write_owner,
                    inner.read_owners.iter().copied().collect::<Vec<_>>(),
                )
            };
            // Liveness is resolved outside the lock, then re-checked.
            let writer_live = writer
                .is_some_and(|id| Some(id) != current_id && k.threads.get(id).is_some());
            let reader_live = readers
                .iter()
                .any(|&id| Some(id) != current_id && k.threads.get(id).is_some());

            let mut inner = self.inner.lock();
            if inner.write_owner != writer || inner.read_owners.len() != readers.len() {
                continue;
            }
            if writer_live || reader_live {
                return_errno!(Errno::EBUSY);
            }
            inner.write_owner = None;
            inner.read_owners.clear();
            break inner.waiters.drain().collect::<Vec<_>>();
        };

        if let Some(current) = k.current_thread() {
            current.locked_rwlocks.lock().remove(&self.id);
        }
        for id in woken {
            super::wake_thread(k, id);
        }
        Ok(())
    }

    pub fn write_owner(&self) -> Option<ThreadId> {
        self.inner.lock().write_owner
    }

    pub fn reader_count(&self) -> usize {
        self.inner.lock().read_owners.len()
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}
