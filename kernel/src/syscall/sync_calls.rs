// SPDX-License-Identifier: MPL-2.0

//! Synchronization and TLS syscalls.
//!
//! Userspace primitives are created into the global registries but owned
//! by the calling process: lookups go through the process's owned set
//! first, so one process can never address another's primitives.

use crate::{
    prelude::*,
    sync::{Condition, Mutex, RwLock, Semaphore, SignalledFlag},
    task::registry::Kid,
    time::KernelTime,
    Kernel,
};

pub fn sys_mutex_init(k: &Kernel, recursive: bool, error_check: bool) -> Result<Kid> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    let mutex = k.mutexes.create(|id| Mutex::new(id, recursive, error_check));
    process.owned_mutexes.lock().insert(mutex.id);
    Ok(mutex.id)
}

pub fn sys_mutex_destroy(k: &Kernel, id: Kid) -> Result<()> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    let mutex = owned(&process.owned_mutexes, &k.mutexes, id)?;
    mutex.try_delete(k)?;
    process.owned_mutexes.lock().remove(&id);
    k.mutexes.remove(id);
    Ok(())
}

pub fn sys_mutex_trylock(
    k: &Kernel,
    id: Kid,
    block: bool,
    deadline: Option<KernelTime>,
) -> Result<()> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    let mutex = owned(&process.owned_mutexes, &k.mutexes, id)?;
    mutex.try_lock(k, block, deadline)
}

pub fn sys_mutex_unlock(k: &Kernel, id: Kid) -> Result<()> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    let mutex = owned(&process.owned_mutexes, &k.mutexes, id)?;
    mutex.unlock(k, false)
}

pub fn sys_rwlock_init(k: &Kernel) -> Result<Kid> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    let lock = k.rwlocks.create(RwLock::new);
    process.owned_rwlocks.lock().insert(lock.id);
    Ok(lock.id)
}

pub fn sys_rwlock_destroy(k: &Kernel, id: Kid) -> Result<()> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    let lock = owned(&process.owned_rwlocks, &k.rwlocks, id)?;
    lock.try_delete(k)?;
    process.owned_rwlocks.lock().remove(&id);
    k.rwlocks.remove(id);
    Ok(())
}

pub fn sys_rwlock_tryrdlock(
    k: &Kernel,
    id: Kid,
    block: bool,
    deadline: Option<KernelTime>,
) -> Result<()> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    let lock = owned(&process.owned_rwlocks, &k.rwlocks, id)?;
    lock.try_rdlock(k, block, deadline)
}

pub fn sys_rwlock_trywrlock(
    k: &Kernel,
    id: Kid,
    block: bool,
    deadline: Option<KernelTime>,
) -> Result<()> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    let lock = owned(&process.owned_rwlocks, &k.rwlocks, id)?;
    lock.try_wrlock(k, block, deadline)
}

pub fn sys_rwlock_unlock(k: &Kernel, id: Kid) -> Result<()> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    let lock = owned(&process.owned_rwlocks, &k.rwlocks, id)?;
    lock.unlock(k, None)
}

pub fn sys_cond_init(k: &Kernel) -> Result<Kid> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    let cond = k.conditions.create(Condition::new);
    process.owned_conditions.lock().insert(cond.id);
    Ok(cond.id)
}

pub fn sys_cond_destroy(k: &Kernel, id: Kid) -> Result<()> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    let cond = owned(&process.owned_conditions, &k.conditions, id)?;
    cond.try_delete(k)?;
    process.owned_conditions.lock().remove(&id);
    k.conditions.remove(id);
    Ok(())
}

/// The caller must hold the named mutex; it is released here, immediately
/// before the wait registers.
pub fn sys_cond_timedwait(
    k: &Kernel,
    cond_id: Kid,
    mutex_id: Kid,
    deadline: Option<KernelTime>,
    signalled: &Arc<SignalledFlag>,
) -> Result<()> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    let cond = owned(&process.owned_conditions, &k.conditions, cond_id)?;
    let mutex = owned(&process.owned_mutexes, &k.mutexes, mutex_id)?;

    mutex.unlock(k, false)?;
    cond.wait(k, deadline, signalled)
}

pub fn sys_cond_signal(k: &Kernel, id: Kid, all: bool) -> Result<()> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    let cond = owned(&process.owned_conditions, &k.conditions, id)?;
    cond.signal(k, all);
    Ok(())
}

pub fn sys_sem_init(k: &Kernel, value: u32) -> Result<Kid> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    let sem = k.semaphores.create(|id| Semaphore::new(id, value));
    process.owned_semaphores.lock().insert(sem.id);
    Ok(sem.id)
}

pub fn sys_sem_destroy(k: &Kernel, id: Kid) -> Result<()> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    let sem = owned(&process.owned_semaphores, &k.semaphores, id)?;
    sem.try_delete(k)?;
    process.owned_semaphores.lock().remove(&id);
    k.semaphores.remove(id);
    Ok(())
}

pub fn sys_sem_getvalue(k: &Kernel, id: Kid) -> Result<u32> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    let sem = owned(&process.owned_semaphores, &k.semaphores, id)?;
    Ok(sem.value())
}

pub fn sys_sem_post(k: &Kernel, id: Kid) -> Result<()> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    let sem = owned(&process.owned_semaphores, &k.semaphores, id)?;
    sem.post(k, 1);
    Ok(())
}

pub fn sys_sem_trywait(
    k: &Kernel,
    id: Kid,
    block: bool,
    deadline: Option<KernelTime>,
) -> Result<()> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    let sem = owned(&process.owned_semaphores, &k.semaphores, id)?;
    sem.try_wait(k, block, deadline)
}

pub fn sys_tls_key_create(k: &Kernel, destructor: Option<Vaddr>) -> Result<u32> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    let key = process.tls_keys.lock().create(destructor);
    Ok(key)
}

pub fn sys_tls_key_delete(k: &Kernel, key: u32) -> Result<()> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    let result = process.tls_keys.lock().delete(key);
    result
}

pub fn sys_tls_setspecific(k: &Kernel, key: u32, value: u64) -> Result<()> {
    let current = k.current_thread().ok_or(Error::new(Errno::ESRCH))?;
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;
    if !process.tls_keys.lock().exists(key) {
        return_errno!(Errno::EINVAL);
    }
    current.tls_values.lock().insert(key, value);
    Ok(())
}

pub fn sys_tls_getspecific(k: &Kernel, key: u32) -> Result<u64> {
    let current = k.current_thread().ok_or(Error::new(Errno::ESRCH))?;
    let value = current.tls_values.lock().get(&key).copied().unwrap_or(0);
    Ok(value)
}

/// Resolves `id` through the process's owned set, then the registry.
fn owned<T>(
    set: &crate::sync::SpinLock<alloc::collections::BTreeSet<Kid>>,
    registry: &crate::task::registry::IdRegistry<T>,
    id: Kid,
) -> Result<Arc<T>> {
    if !set.lock().contains(&id) {
        return_errno!(Errno::EINVAL);
    }
    registry.get(id).ok_or(Error::new(Errno::EINVAL))
}
