// SPDX-License-Identifier: MPL-2.0

//! ID registries for kernel objects.
//!
//! Each kind of object (threads, processes, the four userspace sync
//! primitives) gets its own table mapping a monotonically increasing id to
//! a weak reference. The registry never keeps an object alive: destruction
//! is driven by the owner, and a stale id simply stops resolving.

use alloc::collections::BTreeMap;

use crate::{prelude::*, sync::SpinLock};

/// An object id. Ids start at 1 and are never reused; 0 is never handed
/// out, so it is free to act as "none" in wire formats.
pub type Kid = u32;

struct RegistryInner<T> {
    map: BTreeMap<Kid, Weak<T>>,
    next_id: Kid,
}

/// A per-kind table of weak references with monotonically increasing ids.
pub struct IdRegistry<T> {
    inner: SpinLock<RegistryInner<T>>,
}

impl<T> IdRegistry<T> {
    pub const fn new() -> Self {
        IdRegistry {
            inner: SpinLock::new(RegistryInner {
                map: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Constructs an object through `make` (which receives the assigned
    /// id) and registers it, atomically with respect to other lookups.
    pub fn create<F>(&self, make: F) -> Arc<T>
    where
        F: FnOnce(Kid) -> T,
    {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let obj = Arc::new(make(id));
        inner.map.insert(id, Arc::downgrade(&obj));
        obj
    }

    /// Resolves `id`, promoting the weak reference if the object is still
    /// live. Callers must tolerate `None` at all times.
    pub fn get(&self, id: Kid) -> Option<Arc<T>> {
        self.inner.lock().map.get(&id)?.upgrade()
    }

    pub fn exists(&self, id: Kid) -> bool {
        self.get(id).is_some()
    }

    /// Drops the table entry. The object itself lives on until its owner
    /// releases the last strong reference.
    pub fn remove(&self, id: Kid) {
        self.inner.lock().map.remove(&id);
    }

    /// Snapshot of the live objects, in id (= creation) order.
    pub fn live(&self) -> Vec<Arc<T>> {
        self.inner
            .lock()
            .map
            .values()
            .filter_map(|w| w.upgrade())
            .collect()
    }
}

impl<T> Default for IdRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A spin-locked completion map: exit codes posted by `kill`/`exit` and
/// consumed by `wait`/`join`.
pub struct CompletionList<K: Ord, V: Clone> {
    map: SpinLock<BTreeMap<K, V>>,
}

impl<K: Ord, V: Clone> CompletionList<K, V> {
    pub const fn new() -> Self {
        CompletionList {
            map: SpinLock::new(BTreeMap::new()),
        }
    }

    pub fn set(&self, key: K, val: V) {
        self.map.lock().insert(key, val);
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map.lock().get(key).cloned()
    }

    pub fn take(&self, key: &K) -> Option<V> {
        self.map.lock().remove(key)
    }
}

impl<K: Ord, V: Clone> Default for CompletionList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Dummy {
        id: Kid,
    }

    #[test]
    fn ids_are_monotonic_and_start_at_one() {
        let reg = IdRegistry::new();
        let a = reg.create(|id| Dummy { id });
        let b = reg.create(|id| Dummy { id });
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
    }

    #[test]
    fn dropped_objects_stop_resolving() {
        let reg = IdRegistry::new();
        let a = reg.create(|id| Dummy { id });
        let id = a.id;
        assert!(reg.get(id).is_some());
        drop(a);
        assert!(reg.get(id).is_none());
        assert!(!reg.exists(id));
        // The id is spent even though the object is gone.
        let b = reg.create(|id| Dummy { id });
        assert_eq!(b.id, id + 1);
    }

    #[test]
    fn live_iterates_in_creation_order() {
        let reg = IdRegistry::new();
        let keep: Vec<_> = (0..4).map(|_| reg.create(|id| Dummy { id })).collect();
        drop(keep[2].clone()); // clone drop must not affect liveness
        let ids: Vec<_> = reg.live().iter().map(|d| d.id).collect();
        assert_eq!(ids, alloc::vec![1, 2, 3, 4]);
    }

    #[test]
    fn completion_list_round_trip() {
        let list = CompletionList::new();
        list.set((3u32, 4u32), 42u64);
        assert_eq!(list.get(&(3, 4)), Some(42));
        assert_eq!(list.take(&(3, 4)), Some(42));
        assert_eq!(list.take(&(3, 4)), None);
    }
}
