// SPDX-License-Identifier: MPL-2.0

//! Processes: the owning containers for threads and their resources.

use alloc::collections::BTreeSet;

use hashbrown::HashSet;

use crate::{
    arch,
    config::{EVENT_QUEUE_DEPTH, NR_CPUS, USER_VBLOCK_FREE_L1},
    ipc::{Event, FixedQueue},
    mm::{BlockTag, GuardClass, PMemBlock, PageTable, TagFlags, VBlock, VMemBlock, BLOCK_64K, PAGE_SIZE},
    prelude::*,
    sync::SpinLock,
    task::{registry::Kid, thread::ThreadId},
    time::KernelTime,
    Kernel,
};

/// A capability handle to an open file object; the file systems and
/// drivers behind it live outside the core.
pub trait FileHandle: Send + Sync {
    fn description(&self) -> &str;
}

const NR_OPEN_MAX: usize = 256;

/// The ordered open-file table, indexed by small integers.
#[derive(Default)]
pub struct OpenFileTable {
    slots: Vec<Option<Arc<dyn FileHandle>>>,
}

impl OpenFileTable {
    /// Installs `file` at the lowest free descriptor at or above
    /// `start_fd`, growing the table if needed.
    pub fn install(&mut self, file: Arc<dyn FileHandle>, start_fd: usize) -> Result<usize> {
        for fd in start_fd..self.slots.len() {
            if self.slots[fd].is_none() {
                self.slots[fd] = Some(file);
                return Ok(fd);
            }
        }
        let fd = self.slots.len().max(start_fd);
        if fd >= NR_OPEN_MAX {
            return_errno!(Errno::EMFILE);
        }
        self.slots.resize(fd + 1, None);
        self.slots[fd] = Some(file);
        Ok(fd)
    }

    /// Installs `file` at exactly `fd`, closing whatever was there.
    pub fn install_at(&mut self, file: Arc<dyn FileHandle>, fd: usize) -> Result<usize> {
        if fd >= NR_OPEN_MAX {
            return_errno!(Errno::EMFILE);
        }
        if fd >= self.slots.len() {
            self.slots.resize(fd + 1, None);
        }
        self.slots[fd] = Some(file);
        Ok(fd)
    }

    pub fn get(&self, fd: usize) -> Option<Arc<dyn FileHandle>> {
        self.slots.get(fd)?.clone()
    }

    pub fn close(&mut self, fd: usize) -> Result<()> {
        let slot = self.slots.get_mut(fd).ok_or(Error::new(Errno::EINVAL))?;
        if slot.take().is_none() {
            return_errno!(Errno::EINVAL);
        }
        Ok(())
    }

    /// A child starts with its parent's descriptors.
    pub fn inherit(&self) -> OpenFileTable {
        OpenFileTable {
            slots: self.slots.clone(),
        }
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// argv and envp, owned as plain string lists.
#[derive(Default, Clone)]
pub struct Environment {
    pub args: Vec<String>,
    pub envs: Vec<String>,
}

/// The per-process pthread TLS key registry; values live on the threads.
#[derive(Default)]
pub struct TlsKeys {
    next_key: u32,
    dtors: alloc::collections::BTreeMap<u32, Option<Vaddr>>,
}

impl TlsKeys {
    pub fn create(&mut self, destructor: Option<Vaddr>) -> u32 {
        let key = self.next_key;
        self.next_key += 1;
        self.dtors.insert(key, destructor);
        key
    }

    pub fn delete(&mut self, key: u32) -> Result<()> {
        self.dtors
            .remove(&key)
            .map(|_| ())
            .ok_or(Error::new(Errno::EINVAL))
    }

    pub fn exists(&self, key: u32) -> bool {
        self.dtors.contains_key(&key)
    }

    pub fn destructor(&self, key: u32) -> Option<Vaddr> {
        self.dtors.get(&key).copied().flatten()
    }

    pub fn keys(&self) -> Vec<u32> {
        self.dtors.keys().copied().collect()
    }
}

/// Physical pages owned by the process, as 64 KiB page numbers; bit 31
/// marks a shared page (tracked, never freed twice).
#[derive(Default)]
pub struct OwnedPages {
    pages: HashSet<u32>,
}

const SHARED_PAGE_BIT: u32 = 0x8000_0000;

impl OwnedPages {
    pub fn add(&mut self, block: &PMemBlock) {
        let mut page = block.base & !(PAGE_SIZE - 1);
        let end = (block.base + block.length + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        while page < end {
            let mut val = (page >> 16) as u32;
            if block.is_shared {
                val |= SHARED_PAGE_BIT;
            }
            self.pages.insert(val);
            page += PAGE_SIZE;
        }
    }

    pub fn remove(&mut self, base: Paddr, length: u64) {
        let mut page = base & !(PAGE_SIZE - 1);
        let end = (base + length + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        while page < end {
            let val = (page >> 16) as u32;
            self.pages.remove(&val);
            self.pages.remove(&(val | SHARED_PAGE_BIT));
            page += PAGE_SIZE;
        }
    }

    /// Empties the set, yielding the uniquely owned frames for release.
    pub fn drain_owned(&mut self) -> Vec<PMemBlock> {
        self.pages
            .drain()
            .filter(|v| v & SHARED_PAGE_BIT == 0)
            .map(|v| PMemBlock {
                base: (v as u64) << 16,
                length: PAGE_SIZE,
                is_shared: false,
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.pages.len()
    }
}

/// The lazily grown heap window behind `brk`.
#[derive(Default)]
pub struct HeapState {
    pub block: Option<VMemBlock>,
    pub brk: Vaddr,
}

/// What the compositor needs to know about this process's surface.
pub struct ScreenState {
    pub width: u16,
    pub height: u16,
    pub pixel_format: u8,
    pub refresh_hz: u32,
    pub layer: u32,
}

impl Default for ScreenState {
    fn default() -> Self {
        ScreenState {
            width: 800,
            height: 480,
            pixel_format: 0,
            refresh_hz: 60,
            layer: 0,
        }
    }
}

/// The lower-half mapping state of an unprivileged process: its
/// page-table tree and the reservation allocator covering user space.
/// One lock serializes both, and dominates any per-block locking.
pub struct UserMem {
    pub pt: PageTable,
    pub vblock: VBlock,
}

pub struct Process {
    pub id: Kid,
    pub ppid: Kid,
    pub name: SpinLock<String>,
    pub is_privileged: bool,

    /// Thread ids owned by this process, in creation order.
    pub threads: SpinLock<Vec<ThreadId>>,

    /// `None` while privileged (kernel-only address space).
    pub user_mem: SpinLock<Option<UserMem>>,

    pub open_files: SpinLock<OpenFileTable>,
    pub owned_pages: SpinLock<OwnedPages>,
    pub env: SpinLock<Environment>,
    pub tls_keys: SpinLock<TlsKeys>,
    pub heap: SpinLock<HeapState>,
    pub screen: SpinLock<ScreenState>,

    /// ELF TLS template block and the byte count to copy per thread.
    pub tls_template: SpinLock<Option<(VMemBlock, u64)>>,

    /// Owned userspace sync primitives, in creation (= id) order.
    pub owned_mutexes: SpinLock<BTreeSet<Kid>>,
    pub owned_conditions: SpinLock<BTreeSet<Kid>>,
    pub owned_rwlocks: SpinLock<BTreeSet<Kid>>,
    pub owned_semaphores: SpinLock<BTreeSet<Kid>>,

    /// Input events bound for this process.
    pub events: FixedQueue<Event, EVENT_QUEUE_DEPTH>,

    /// Threads parked in `process_wait` on us.
    pub exit_waiters: SpinLock<HashSet<ThreadId>>,
}

impl Process {
    pub fn post_event(&self, k: &Kernel, event: Event) -> Result<()> {
        self.events.push(k, event)
    }

    pub fn next_event(&self, k: &Kernel, deadline: Option<KernelTime>) -> Result<Event> {
        self.events.pop(k, deadline)
    }
}

impl Kernel {
    /// Creates a process.
    ///
    /// Unprivileged processes get a fresh lower-half root with the
    /// topmost slot pre-linked to the shared kernel-interface table, a
    /// user-space reservation allocator, and a never-mapped page 0 so
    /// null dereferences always trap. A parent donates its open files
    /// and environment; an unprivileged parent cannot spawn privileged
    /// children.
    pub fn process_create(
        &self,
        name: &str,
        is_privileged: bool,
        parent: Option<&Arc<Process>>,
    ) -> Result<Arc<Process>> {
        let is_privileged = is_privileged && parent.is_none_or(|p| p.is_privileged);

        let process = self.processes.create(|id| Process {
            id,
            ppid: parent.map_or(0, |p| p.id),
            name: SpinLock::new(name.to_string()),
            is_privileged,
            threads: SpinLock::new(Vec::new()),
            user_mem: SpinLock::new(None),
            open_files: SpinLock::new(OpenFileTable::default()),
            owned_pages: SpinLock::new(OwnedPages::default()),
            env: SpinLock::new(Environment::default()),
            tls_keys: SpinLock::new(TlsKeys::default()),
            heap: SpinLock::new(HeapState::default()),
            screen: SpinLock::new(ScreenState::default()),
            tls_template: SpinLock::new(None),
            owned_mutexes: SpinLock::new(BTreeSet::new()),
            owned_conditions: SpinLock::new(BTreeSet::new()),
            owned_rwlocks: SpinLock::new(BTreeSet::new()),
            owned_semaphores: SpinLock::new(BTreeSet::new()),
            events: FixedQueue::new(),
            exit_waiters: SpinLock::new(HashSet::new()),
        });

        if !is_privileged {
            let user_mem = match self.build_user_mem(process.id) {
                Ok(um) => um,
                Err(e) => {
                    self.processes.remove(process.id);
                    return Err(e);
                }
            };
            *process.user_mem.lock() = Some(user_mem);
        }

        if let Some(parent) = parent {
            *process.open_files.lock() = parent.open_files.lock().inherit();
            *process.env.lock() = parent.env.lock().clone();
        }

        log::info!("process: created {} ({})", process.id, name);
        Ok(process)
    }

    fn build_user_mem(&self, pid: Kid) -> Result<UserMem> {
        let mut pt = PageTable::new(&self.pmem, self.window, pid as u16)?;
        pt.link_shared_table(8191, self.shared_user_table);

        let vblock = VBlock::new(0, USER_VBLOCK_FREE_L1, 8192);
        // Page 0 is reserved and never mapped: the fault handler turns
        // any touch of it into a thread fault.
        if let Err(e) = vblock.alloc_fixed(
            BLOCK_64K,
            0,
            BlockTag::new(TagFlags::empty(), GuardClass::None, GuardClass::None),
        ) {
            pt.release_tree(&self.pmem);
            return Err(e);
        }

        Ok(UserMem { pt, vblock })
    }

    /// Kills a process: every thread is condemned and parked, the exit
    /// code is posted, and everyone waiting on the exit is woken. The
    /// carcass is reclaimed by the cleanup worker as the threads drain.
    pub fn process_kill(&self, pid: Kid, exit_code: i32) -> Result<()> {
        let Some(process) = self.processes.get(pid) else {
            return_errno!(Errno::ESRCH);
        };
        log::info!("process: kill {} ({})", pid, *process.name.lock());

        let tids: Vec<ThreadId> = process.threads.lock().clone();
        for tid in tids {
            if let Some(thread) = self.threads.get(tid) {
                thread.mark_for_deletion();
                thread.blocking.lock().block_indefinite();
                self.sched.unschedule(&thread);
                if let Err(e) = self
                    .cleanup
                    .push(self, super::cleanup::CleanupMessage::Thread(thread))
                {
                    log::warn!("process: cleanup queue full while killing {}: {:?}", pid, e);
                }
            }
        }

        self.process_exit_codes.set(pid, exit_code);

        let waiters: Vec<ThreadId> = process.exit_waiters.lock().drain().collect();
        for id in waiters {
            crate::sync::wake_thread(self, id);
        }

        for core in 0..NR_CPUS {
            arch::send_reschedule_ipi(core);
        }
        Ok(())
    }

    /// Waits for a process to exit and returns its exit code.
    pub fn process_wait(
        &self,
        pid: Kid,
        block: bool,
        deadline: Option<KernelTime>,
    ) -> Result<i32> {
        loop {
            if let Some(code) = self.process_exit_codes.get(&pid) {
                return Ok(code);
            }
            let Some(process) = self.processes.get(pid) else {
                return_errno!(Errno::ESRCH);
            };
            if !block {
                return_errno!(Errno::EAGAIN);
            }

            {
                let current = self
                    .current_thread()
                    .expect("process wait without a current thread");
                process.exit_waiters.lock().insert(current.id);
                current
                    .blocking
                    .lock()
                    .block(super::thread::BlockedOn::ProcessExit, deadline);
            }
            self.sched.yield_now();
            arch::memory_barrier();

            if let Some(deadline) = deadline {
                if self.clock.now() >= deadline {
                    if let Some(current) = self.current_thread() {
                        process.exit_waiters.lock().remove(&current.id);
                        current.blocking.lock().clear();
                    }
                    return_errno!(Errno::ETIMEDOUT);
                }
            }
        }
    }

    pub fn process_parent_id(&self, pid: Kid) -> Result<Kid> {
        self.processes
            .get(pid)
            .map(|p| p.ppid)
            .ok_or(Error::new(Errno::ESRCH))
    }

    /// Queries or moves the current process's program break.
    ///
    /// The heap window is reserved lazily on first use (a process may
    /// conceivably mmap everything instead); pages inside it materialize
    /// through the fault handler like any other reservation.
    pub fn process_brk(&self, new_brk: Vaddr) -> Result<Vaddr> {
        let process = self.current_process().ok_or(Error::new(Errno::ESRCH))?;

        let mut heap = process.heap.lock();
        if heap.block.is_none() {
            let um_guard = process.user_mem.lock();
            let Some(um) = um_guard.as_ref() else {
                return_errno!(Errno::EINVAL);
            };
            let block = um.vblock.alloc(
                crate::mm::BLOCK_4M,
                BlockTag::new(
                    crate::mm::TagFlags::USER | crate::mm::TagFlags::WRITE,
                    GuardClass::None,
                    GuardClass::None,
                ),
            )?;
            heap.brk = block.data_start();
            heap.block = Some(block);
        }
        let block = heap.block.expect("heap window reserved above");

        if new_brk == 0 {
            return Ok(heap.brk);
        }
        if new_brk < block.data_start() || new_brk > block.data_end() {
            return_errno!(Errno::ENOMEM);
        }
        heap.brk = new_brk;
        Ok(new_brk)
    }
}
