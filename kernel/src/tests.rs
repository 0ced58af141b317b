// SPDX-License-Identifier: MPL-2.0

//! Cross-subsystem scenarios, run on the host over synthetic DRAM.

use core::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use alloc::{sync::Arc, vec, vec::Vec};

use crate::{
    config::{DRAM_BASE, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_NORMAL},
    error::Errno,
    ipc::FixedQueue,
    mm::{
        BlockTag, FaultAccess, FaultOutcome, GuardClass, LinearWindow, TagFlags, TranslationFault,
        BLOCK_4M, BLOCK_64K, PAGE_SIZE,
    },
    sync::{Mutex, SignalledFlag},
    syscall,
    task::{Process, Thread, ThreadOptions},
    time::KernelTime,
    Kernel,
};

struct TestKernel {
    k: Kernel,
    _arena: Vec<u64>,
}

impl core::ops::Deref for TestKernel {
    type Target = Kernel;

    fn deref(&self) -> &Kernel {
        &self.k
    }
}

fn test_kernel(pages: u64) -> TestKernel {
    let len = pages * PAGE_SIZE;
    let arena = vec![0u64; (len / 8) as usize];
    let window = LinearWindow::for_arena(DRAM_BASE, arena.as_ptr() as u64);
    let k = Kernel::new(DRAM_BASE, DRAM_BASE + len, window).unwrap();
    TestKernel { k, _arena: arena }
}

fn kernel_process(k: &Kernel) -> Arc<Process> {
    k.process_create("kernel", true, None).unwrap()
}

fn spawn(k: &Kernel, process: &Arc<Process>, name: &str, priority: u8) -> Arc<Thread> {
    let thread = k
        .thread_create(
            process,
            ThreadOptions {
                name: name.into(),
                entry: 0x9_0000,
                arg: 0x1234,
                arg2: 0,
                is_privileged: process.is_privileged,
                priority,
                pinned_core: None,
            },
        )
        .unwrap();
    k.sched.schedule(&thread);
    thread
}

fn adopt(k: &Kernel, thread: &Arc<Thread>) {
    k.sched.adopt(k, 0, thread.clone());
}

#[test]
fn kernel_stack_is_eagerly_mapped_with_guards() {
    let tk = test_kernel(256);
    let proc = kernel_process(&tk);
    let t = spawn(&tk, &proc, "worker", PRIORITY_NORMAL);

    let stack = &t.kernel_stack;
    let pt = tk.kernel_pt.table.lock();
    let mut vaddr = stack.data_start();
    while vaddr < stack.data_end() {
        assert_ne!(pt.vaddr_to_paddr(vaddr), 0, "stack page unmapped");
        vaddr += PAGE_SIZE;
    }
    // Both guards stay unmapped and are recognized as guards.
    assert_eq!(pt.vaddr_to_paddr(stack.base), 0);
    assert_eq!(pt.vaddr_to_paddr(stack.end() - 1), 0);
    assert!(stack.in_guard(stack.base));
    assert!(stack.in_guard(stack.end() - 1));
}

#[test]
fn initial_frame_lands_entry_and_argument() {
    let tk = test_kernel(256);
    let proc = kernel_process(&tk);
    let t = spawn(&tk, &proc, "worker", PRIORITY_NORMAL);

    let sp = t.ctx.lock().sp_el1;
    assert_eq!(sp % 16, 0);
    let pt = tk.kernel_pt.table.lock();
    let frame = pt.data_ptr(sp).unwrap() as *const u64;
    // Frame layout from the bottom: fp, lr, x0, x1, 18 further GPR
    // words, SPSR, ELR.
    unsafe {
        assert_eq!(frame.add(2).read(), 0x1234); // x0 = arg
        assert_eq!(frame.add(22).read(), 5); // SPSR: EL1, own stack
        assert_eq!(frame.add(23).read(), 0x9_0000); // ELR = entry
    }
}

#[test]
fn lazy_fault_mapping_installs_pages_on_demand() {
    let tk = test_kernel(128);
    let block = tk
        .kernel_vblock
        .alloc(
            BLOCK_4M,
            BlockTag::new(TagFlags::WRITE, GuardClass::None, GuardClass::None),
        )
        .unwrap();

    for offset in [0, 65536, BLOCK_4M - 1] {
        let fault = TranslationFault {
            vaddr: block.base + offset,
            access: FaultAccess::Write,
            from_user: false,
        };
        assert_eq!(tk.handle_translation_fault(&fault), FaultOutcome::Resolved);
    }

    let pt = tk.kernel_pt.table.lock();
    let mapped: u64 = (0..BLOCK_4M / PAGE_SIZE)
        .filter(|i| pt.vaddr_to_paddr(block.base + i * PAGE_SIZE) != 0)
        .count() as u64;
    assert_eq!(mapped, 3);

    // The installed pages hold data.
    let ptr = pt.data_ptr(block.base + 65536).unwrap();
    unsafe {
        ptr.write(0x5a);
        assert_eq!(ptr.read(), 0x5a);
    }
}

#[test]
fn guard_hit_and_unreserved_faults_are_fatal_in_kernel_context() {
    let tk = test_kernel(256);
    let stack = tk
        .kernel_vblock
        .alloc(
            BLOCK_4M,
            BlockTag::new(TagFlags::WRITE, GuardClass::Guard64K, GuardClass::Guard64K),
        )
        .unwrap();

    // Touch inside the lower guard: trapped, never mapped.
    let fault = TranslationFault {
        vaddr: stack.base,
        access: FaultAccess::Write,
        from_user: false,
    };
    assert_eq!(tk.handle_translation_fault(&fault), FaultOutcome::HaltCore);
    assert_eq!(tk.kernel_pt.table.lock().vaddr_to_paddr(stack.base), 0);

    // Unreserved upper-half address.
    let fault = TranslationFault {
        vaddr: crate::config::KERNEL_VBLOCK_BASE + 100 * crate::mm::BLOCK_512M,
        access: FaultAccess::Read,
        from_user: false,
    };
    assert_eq!(tk.handle_translation_fault(&fault), FaultOutcome::HaltCore);

    // User access to the kernel half is a thread fault, not a halt.
    let fault = TranslationFault {
        vaddr: stack.data_start(),
        access: FaultAccess::Read,
        from_user: true,
    };
    assert_eq!(tk.handle_translation_fault(&fault), FaultOutcome::ThreadFault);
}

#[test]
fn write_fault_on_readonly_reservation_is_rejected() {
    let tk = test_kernel(128);
    let block = tk
        .kernel_vblock
        .alloc(
            BLOCK_64K,
            BlockTag::new(TagFlags::empty(), GuardClass::None, GuardClass::None),
        )
        .unwrap();
    let fault = TranslationFault {
        vaddr: block.base,
        access: FaultAccess::Write,
        from_user: false,
    };
    assert_eq!(tk.handle_translation_fault(&fault), FaultOutcome::HaltCore);
}

#[test]
fn user_process_faults_resolve_inside_reservations_only() {
    let tk = test_kernel(256);
    let kproc = kernel_process(&tk);
    let _boot = spawn(&tk, &kproc, "boot", PRIORITY_NORMAL);

    let app = tk.process_create("app", false, None).unwrap();
    assert!(!app.is_privileged);
    let t = spawn(&tk, &app, "app_main", PRIORITY_NORMAL);
    adopt(&tk, &t);

    let addr = syscall::sys_mmap(&tk, BLOCK_64K, syscall::MmapProt::READ | syscall::MmapProt::WRITE, None, false)
        .unwrap();

    let fault = TranslationFault {
        vaddr: addr,
        access: FaultAccess::Write,
        from_user: true,
    };
    assert_eq!(tk.handle_translation_fault(&fault), FaultOutcome::Resolved);
    {
        let um = app.user_mem.lock();
        assert_ne!(um.as_ref().unwrap().pt.vaddr_to_paddr(addr), 0);
    }
    assert!(app.owned_pages.lock().count() > 0);

    // The never-mapped page 0 traps null dereferences.
    let fault = TranslationFault {
        vaddr: 16,
        access: FaultAccess::Read,
        from_user: true,
    };
    assert_eq!(tk.handle_translation_fault(&fault), FaultOutcome::ThreadFault);

    // Unreserved lower-half address.
    let fault = TranslationFault {
        vaddr: 0x7000_0000,
        access: FaultAccess::Read,
        from_user: true,
    };
    assert_eq!(tk.handle_translation_fault(&fault), FaultOutcome::ThreadFault);
}

#[test]
fn mprotect_reencodes_and_munmap_releases() {
    let tk = test_kernel(256);
    let app = tk.process_create("app", false, None).unwrap();
    let t = spawn(&tk, &app, "app_main", PRIORITY_NORMAL);
    adopt(&tk, &t);

    let addr = syscall::sys_mmap(&tk, BLOCK_64K, syscall::MmapProt::READ | syscall::MmapProt::WRITE, None, false)
        .unwrap();
    let fault = TranslationFault {
        vaddr: addr,
        access: FaultAccess::Write,
        from_user: true,
    };
    assert_eq!(tk.handle_translation_fault(&fault), FaultOutcome::Resolved);

    syscall::sys_mprotect(&tk, addr, syscall::MmapProt::READ).unwrap();
    {
        let um = app.user_mem.lock();
        let block = um.as_ref().unwrap().vblock.valid(addr).unwrap();
        assert!(!block.write());
        // The page stays mapped after the re-encode.
        assert_ne!(um.as_ref().unwrap().pt.vaddr_to_paddr(addr), 0);
    }

    let free_before = tk.pmem.free_bytes();
    syscall::sys_munmap(&tk, addr, BLOCK_64K).unwrap();
    assert!(tk.pmem.free_bytes() > free_before);
    let um = app.user_mem.lock();
    assert!(um.as_ref().unwrap().vblock.valid(addr).is_none());
}

#[test]
fn brk_reserves_lazily_and_moves_within_the_window() {
    let tk = test_kernel(256);
    let app = tk.process_create("app", false, None).unwrap();
    let t = spawn(&tk, &app, "app_main", PRIORITY_NORMAL);
    adopt(&tk, &t);

    let base = syscall::sys_brk(&tk, 0).unwrap();
    assert_ne!(base, 0);
    let moved = syscall::sys_brk(&tk, base + 4096).unwrap();
    assert_eq!(moved, base + 4096);
    assert_eq!(syscall::sys_brk(&tk, 0).unwrap(), base + 4096);
    // Outside the heap window.
    assert_eq!(
        syscall::sys_brk(&tk, base + 2 * BLOCK_4M).unwrap_err().error(),
        Errno::ENOMEM
    );
    // Touching the heap materializes pages via the fault handler.
    let fault = TranslationFault {
        vaddr: base,
        access: FaultAccess::Write,
        from_user: true,
    };
    assert_eq!(tk.handle_translation_fault(&fault), FaultOutcome::Resolved);
}

#[test]
fn mutex_handoff_between_two_threads() {
    let tk = test_kernel(256);
    let proc = kernel_process(&tk);
    let t1 = spawn(&tk, &proc, "t1", PRIORITY_NORMAL);
    let t2 = spawn(&tk, &proc, "t2", PRIORITY_NORMAL);
    let m = tk.mutexes.create(|id| Mutex::new(id, false, false));

    adopt(&tk, &t1);
    m.try_lock(&tk, true, None).unwrap();
    assert_eq!(m.owner(), Some(t1.id));

    adopt(&tk, &t2);
    let err = m.try_lock(&tk, true, None).unwrap_err();
    assert_eq!(err.error(), Errno::EBUSY);
    assert!(m.has_waiter(t2.id));
    assert_eq!(t2.blocking.lock().blocked_on_thread(), Some(t1.id));
    assert!(!t2.is_runnable(tk.clock.now()));

    adopt(&tk, &t1);
    m.unlock(&tk, false).unwrap();
    assert!(t2.is_runnable(tk.clock.now()));
    assert_eq!(m.waiter_count(), 0);

    adopt(&tk, &t2);
    m.try_lock(&tk, true, None).unwrap();
    assert_eq!(m.owner(), Some(t2.id));
}

#[test]
fn unlock_of_unowned_mutex_is_eperm() {
    let tk = test_kernel(256);
    let proc = kernel_process(&tk);
    let t = spawn(&tk, &proc, "t", PRIORITY_NORMAL);
    adopt(&tk, &t);

    let m = tk.mutexes.create(|id| Mutex::new(id, false, false));
    assert_eq!(m.unlock(&tk, false).unwrap_err().error(), Errno::EPERM);

    // Error-check mutexes diagnose the self-deadlock instead of parking.
    let ec = tk.mutexes.create(|id| Mutex::new(id, false, true));
    ec.try_lock(&tk, true, None).unwrap();
    assert_eq!(
        ec.try_lock(&tk, true, None).unwrap_err().error(),
        Errno::EDEADLK
    );

    // Recursive mutexes count their locks.
    let rec = tk.mutexes.create(|id| Mutex::new(id, true, false));
    rec.try_lock(&tk, true, None).unwrap();
    rec.try_lock(&tk, true, None).unwrap();
    rec.unlock(&tk, false).unwrap();
    assert_eq!(rec.owner(), Some(t.id));
    rec.unlock(&tk, false).unwrap();
    assert_eq!(rec.owner(), None);
}

#[test]
fn priority_inheritance_elects_the_blocker() {
    let tk = test_kernel(512);
    let proc = kernel_process(&tk);
    let t_low = spawn(&tk, &proc, "low", PRIORITY_LOW);
    let t_mid = spawn(&tk, &proc, "mid", PRIORITY_NORMAL);
    let t_high = spawn(&tk, &proc, "high", PRIORITY_HIGH);
    let m = tk.mutexes.create(|id| Mutex::new(id, false, false));

    adopt(&tk, &t_low);
    m.try_lock(&tk, true, None).unwrap();
    adopt(&tk, &t_high);
    assert!(m.try_lock(&tk, true, None).is_err());

    // Election: the high slot goes to the low thread holding the mutex,
    // ahead of the runnable middle thread.
    let _ = t_mid;
    let (elected, slot) = tk.sched.get_next_thread(&tk, 0).unwrap();
    assert_eq!(elected.id, t_low.id);
    assert_eq!(slot, PRIORITY_HIGH);

    // Once released, the high thread takes its slot back.
    adopt(&tk, &t_low);
    m.unlock(&tk, false).unwrap();
    let (elected, slot) = tk.sched.get_next_thread(&tk, 0).unwrap();
    assert_eq!(elected.id, t_high.id);
    assert_eq!(slot, PRIORITY_HIGH);

    // With the high thread parked again, the middle one runs next.
    t_high.blocking.lock().block_indefinite();
    let (elected, _) = tk.sched.get_next_thread(&tk, 0).unwrap();
    assert_eq!(elected.id, t_mid.id);
}

#[test]
fn scheduler_skips_condemned_and_pinned_threads() {
    let tk = test_kernel(512);
    let proc = kernel_process(&tk);
    let dead = spawn(&tk, &proc, "dead", PRIORITY_NORMAL);
    let elsewhere = {
        let t = tk
            .thread_create(
                &proc,
                ThreadOptions {
                    name: "pinned".into(),
                    entry: 0x9_0000,
                    arg: 0,
                    arg2: 0,
                    is_privileged: true,
                    priority: PRIORITY_NORMAL,
                    pinned_core: Some(1),
                },
            )
            .unwrap();
        tk.sched.schedule(&t);
        t
    };
    let runnable = spawn(&tk, &proc, "ok", PRIORITY_LOW);

    dead.mark_for_deletion();
    let (elected, _) = tk.sched.get_next_thread(&tk, 0).unwrap();
    assert_eq!(elected.id, runnable.id);
    let (elected, _) = tk.sched.get_next_thread(&tk, 1).unwrap();
    assert_eq!(elected.id, elsewhere.id);
}

#[test]
fn round_robin_rotates_within_a_priority() {
    let tk = test_kernel(512);
    let proc = kernel_process(&tk);
    let a = spawn(&tk, &proc, "a", PRIORITY_NORMAL);
    let b = spawn(&tk, &proc, "b", PRIORITY_NORMAL);
    let c = spawn(&tk, &proc, "c", PRIORITY_NORMAL);

    // The cursor starts before the first slot, so the walk begins at the
    // second insertion and wraps.
    let mut seen = Vec::new();
    for _ in 0..3 {
        let (t, _) = tk.sched.get_next_thread(&tk, 0).unwrap();
        seen.push(t.id);
    }
    assert_eq!(seen, vec![b.id, c.id, a.id]);
    let (t, _) = tk.sched.get_next_thread(&tk, 0).unwrap();
    assert_eq!(t.id, b.id);
}

#[test]
fn next_wake_honours_nearer_blocked_deadlines() {
    let tk = test_kernel(512);
    let proc = kernel_process(&tk);
    let low = spawn(&tk, &proc, "low", PRIORITY_LOW);
    let high = spawn(&tk, &proc, "high", PRIORITY_HIGH);

    adopt(&tk, &low);
    let soon = tk.clock.now() + Duration::from_millis(5);
    high.blocking
        .lock()
        .block(crate::task::BlockedOn::Condition, Some(soon));

    // The 5 ms deadline undercuts the 200 ms timeslice bound.
    assert_eq!(tk.sched.next_wake(0), soon);

    // After the deadline passes, the blocked thread is electable again.
    tk.clock.advance(Duration::from_millis(6));
    let (elected, _) = tk.sched.get_next_thread(&tk, 0).unwrap();
    assert_eq!(elected.id, high.id);
}

#[test]
fn reschedule_accounts_time_and_installs_current() {
    let tk = test_kernel(512);
    let proc = kernel_process(&tk);
    let idle = tk
        .thread_create(
            &proc,
            ThreadOptions {
                name: "idle0".into(),
                entry: 0x9_0000,
                arg: 0,
                arg2: 0,
                is_privileged: true,
                priority: 0,
                pinned_core: Some(0),
            },
        )
        .unwrap();
    tk.sched.set_idle_thread(0, idle.clone());
    let worker = spawn(&tk, &proc, "w", PRIORITY_NORMAL);

    let chosen = tk.sched.reschedule(&tk, 0).unwrap();
    assert_eq!(chosen.id, worker.id);
    assert_eq!(tk.current_thread().unwrap().id, worker.id);

    // The worker blocks after 10 ms; the core falls back to idle.
    tk.clock.advance(Duration::from_millis(10));
    worker.blocking.lock().block_indefinite();
    let chosen = tk.sched.reschedule(&tk, 0).unwrap();
    assert_eq!(chosen.id, idle.id);
    assert_eq!(tk.sched.cpu_usage_permille(0), 1000);

    // Ten idle milliseconds later the load halves.
    tk.clock.advance(Duration::from_millis(10));
    worker.blocking.lock().clear();
    let chosen = tk.sched.reschedule(&tk, 0).unwrap();
    assert_eq!(chosen.id, worker.id);
    assert_eq!(tk.sched.cpu_usage_permille(0), 500);
}

#[test]
fn queue_orders_and_bounds_items() {
    let tk = test_kernel(128);
    let q: FixedQueue<u32, 5> = FixedQueue::new();

    for i in 0..4 {
        q.push(&tk, i).unwrap();
    }
    assert!(q.is_full());
    assert_eq!(q.push(&tk, 99).unwrap_err().error(), Errno::ENOMEM);

    assert_eq!(q.peek(), Some(0));
    for i in 0..4 {
        assert_eq!(q.try_pop(), Some(i));
    }
    assert!(q.is_empty());
    assert_eq!(q.try_pop(), None);

    // Wrap-around across the ring seam.
    for i in 10..13 {
        q.push(&tk, i).unwrap();
    }
    assert_eq!(q.try_pop(), Some(10));
    q.push(&tk, 13).unwrap();
    q.push(&tk, 14).unwrap();
    for i in 11..15 {
        assert_eq!(q.try_pop(), Some(i));
    }
}

#[test]
fn queue_pop_times_out_and_deregisters() {
    let tk = test_kernel(256);
    let proc = kernel_process(&tk);
    let t = spawn(&tk, &proc, "consumer", PRIORITY_NORMAL);
    adopt(&tk, &t);

    let q: FixedQueue<u32, 5> = FixedQueue::new();
    let deadline = tk.clock.now();
    let err = q.pop(&tk, Some(deadline)).unwrap_err();
    assert_eq!(err.error(), Errno::ETIMEDOUT);
    assert_eq!(q.waiter_count(), 0);
    assert!(t.is_runnable(tk.clock.now()));
}

#[test]
fn queue_hands_off_between_host_threads_in_order() {
    let tk = test_kernel(256);
    let proc = kernel_process(&tk);
    let t = spawn(&tk, &proc, "consumer", PRIORITY_NORMAL);
    adopt(&tk, &t);

    let q: FixedQueue<u32, 5> = FixedQueue::new();
    let received = std::thread::scope(|s| {
        let consumer = s.spawn(|| {
            let mut got = Vec::new();
            for _ in 0..10 {
                got.push(q.pop(&tk, None).unwrap());
            }
            got
        });
        for i in 0..10u32 {
            // Producers take push failure as back-pressure and retry.
            while q.push(&tk, i).is_err() {
                std::thread::yield_now();
            }
        }
        consumer.join().unwrap()
    });
    assert_eq!(received, (0..10).collect::<Vec<_>>());
}

#[test]
fn condition_deadline_in_the_past_returns_unsignalled() {
    let tk = test_kernel(128);
    let cond = tk.conditions.create(crate::sync::Condition::new);
    let flag = SignalledFlag::new();
    cond.wait(&tk, Some(KernelTime::ZERO), &flag).unwrap();
    assert!(!flag.was_signalled());
    assert_eq!(cond.waiter_count(), 0);
}

#[test]
fn condition_signal_wakes_and_stamps() {
    let tk = test_kernel(256);
    let proc = kernel_process(&tk);
    let t1 = spawn(&tk, &proc, "w1", PRIORITY_NORMAL);
    let t2 = spawn(&tk, &proc, "w2", PRIORITY_NORMAL);
    let cond = tk.conditions.create(crate::sync::Condition::new);

    let f1 = SignalledFlag::new();
    let f2 = SignalledFlag::new();
    adopt(&tk, &t1);
    cond.wait(&tk, None, &f1).unwrap();
    adopt(&tk, &t2);
    cond.wait(&tk, None, &f2).unwrap();
    assert_eq!(cond.waiter_count(), 2);

    cond.signal(&tk, false);
    assert_eq!(cond.waiter_count(), 1);
    cond.signal(&tk, true);
    assert_eq!(cond.waiter_count(), 0);
    assert!(f1.was_signalled());
    assert!(f2.was_signalled());
    assert!(t1.is_runnable(tk.clock.now()));
    assert!(t2.is_runnable(tk.clock.now()));
}

#[test]
fn rwlock_is_writer_xor_readers() {
    let tk = test_kernel(512);
    let proc = kernel_process(&tk);
    let r1 = spawn(&tk, &proc, "r1", PRIORITY_NORMAL);
    let r2 = spawn(&tk, &proc, "r2", PRIORITY_NORMAL);
    let w = spawn(&tk, &proc, "w", PRIORITY_NORMAL);
    let lock = tk.rwlocks.create(crate::sync::RwLock::new);

    adopt(&tk, &r1);
    lock.try_rdlock(&tk, true, None).unwrap();
    adopt(&tk, &r2);
    lock.try_rdlock(&tk, true, None).unwrap();
    assert_eq!(lock.reader_count(), 2);

    adopt(&tk, &w);
    assert_eq!(
        lock.try_wrlock(&tk, true, None).unwrap_err().error(),
        Errno::EBUSY
    );
    assert!(!w.is_runnable(tk.clock.now()));

    adopt(&tk, &r1);
    lock.unlock(&tk, None).unwrap();
    adopt(&tk, &r2);
    lock.unlock(&tk, None).unwrap();
    assert!(w.is_runnable(tk.clock.now()));

    adopt(&tk, &w);
    lock.try_wrlock(&tk, true, None).unwrap();
    assert_eq!(lock.write_owner(), Some(w.id));

    // Readers now fail while the writer holds it.
    adopt(&tk, &r1);
    assert_eq!(
        lock.try_rdlock(&tk, true, None).unwrap_err().error(),
        Errno::EBUSY
    );
    adopt(&tk, &w);
    lock.unlock(&tk, None).unwrap();
    assert_eq!(lock.write_owner(), None);
}

#[test]
fn semaphore_blocks_at_zero_and_posts_wake() {
    let tk = test_kernel(256);
    let proc = kernel_process(&tk);
    let t = spawn(&tk, &proc, "waiter", PRIORITY_NORMAL);
    adopt(&tk, &t);

    let sem = tk.semaphores.create(|id| crate::sync::Semaphore::new(id, 1));
    sem.try_wait(&tk, true, None).unwrap();
    assert_eq!(
        sem.try_wait(&tk, true, None).unwrap_err().error(),
        Errno::EBUSY
    );
    assert_eq!(sem.waiter_count(), 1);
    assert!(!t.is_runnable(tk.clock.now()));

    sem.post(&tk, 1);
    assert_eq!(sem.waiter_count(), 0);
    assert!(t.is_runnable(tk.clock.now()));
    sem.try_wait(&tk, true, None).unwrap();
    assert_eq!(sem.value(), 0);
}

#[test]
fn barrier_releases_exactly_one_token() {
    let tk = test_kernel(512);
    let proc = kernel_process(&tk);
    let t1 = spawn(&tk, &proc, "b1", PRIORITY_NORMAL);
    let t2 = spawn(&tk, &proc, "b2", PRIORITY_NORMAL);
    let t3 = spawn(&tk, &proc, "b3", PRIORITY_NORMAL);
    let barrier = crate::sync::Barrier::new(1, 3);

    adopt(&tk, &t1);
    assert!(!barrier.wait(&tk));
    adopt(&tk, &t2);
    assert!(!barrier.wait(&tk));
    assert_eq!(barrier.waiter_count(), 2);
    assert!(!t1.is_runnable(tk.clock.now()));

    adopt(&tk, &t3);
    assert!(barrier.wait(&tk)); // the releaser
    assert_eq!(barrier.waiter_count(), 0);
    assert!(t1.is_runnable(tk.clock.now()));
    assert!(t2.is_runnable(tk.clock.now()));
}

#[test]
fn join_returns_the_exit_value() {
    let tk = test_kernel(512);
    let proc = kernel_process(&tk);
    let main = spawn(&tk, &proc, "main", PRIORITY_NORMAL);
    let worker = spawn(&tk, &proc, "worker", PRIORITY_NORMAL);

    adopt(&tk, &main);
    assert_eq!(
        tk.thread_join(main.id).unwrap_err().error(),
        Errno::EDEADLK
    );

    tk.thread_kill(worker.id, 0xdead_beef).unwrap();
    assert!(worker.for_deletion());
    assert_eq!(tk.thread_join(worker.id).unwrap(), 0xdead_beef);
}

#[test]
fn process_kill_cascades_and_cleanup_reclaims() {
    let tk = test_kernel(1024);
    let proc_a = kernel_process(&tk);
    let proc_b = tk.process_create("other", true, None).unwrap();

    let threads: Vec<_> = (0..3)
        .map(|i| spawn(&tk, &proc_a, &alloc::format!("a{}", i), PRIORITY_NORMAL))
        .collect();
    let bystander = spawn(&tk, &proc_b, "b0", PRIORITY_NORMAL);

    // Each thread of A holds one of A's mutexes.
    let mutexes: Vec<_> = (0..3)
        .map(|_| {
            let m = tk.mutexes.create(|id| Mutex::new(id, false, false));
            proc_a.owned_mutexes.lock().insert(m.id);
            m
        })
        .collect();
    for (t, m) in threads.iter().zip(&mutexes) {
        adopt(&tk, t);
        m.try_lock(&tk, true, None).unwrap();
    }

    // A thread of another process blocks on one of them.
    adopt(&tk, &bystander);
    assert!(mutexes[0].try_lock(&tk, true, None).is_err());
    assert!(!bystander.is_runnable(tk.clock.now()));

    tk.process_kill(proc_a.id, 7).unwrap();
    for t in &threads {
        assert!(t.for_deletion());
    }
    assert_eq!(tk.process_wait(proc_a.id, false, None).unwrap(), 7);

    // Drive the cleanup worker by hand.
    while let Some(msg) = tk.cleanup.try_pop() {
        crate::task::cleanup::reclaim(&tk, msg);
    }

    // Force-unlock woke the bystander; the primitives are gone.
    assert!(bystander.is_runnable(tk.clock.now()));
    for m in &mutexes {
        assert_eq!(m.owner(), None);
        assert!(tk.mutexes.get(m.id).is_none());
    }
    for t in &threads {
        assert!(tk.threads.get(t.id).is_none());
    }
    assert!(tk.processes.get(proc_a.id).is_none());
}

#[test]
fn kernel_tls_destructors_run_in_the_cleanup_pass() {
    static DTOR_SUM: AtomicU64 = AtomicU64::new(0);
    extern "C" fn record(value: u64) {
        DTOR_SUM.fetch_add(value, Ordering::SeqCst);
    }

    let tk = test_kernel(512);
    let kproc = kernel_process(&tk);
    let t = spawn(&tk, &kproc, "dying", PRIORITY_NORMAL);
    adopt(&tk, &t);

    let dtor = record as extern "C" fn(u64) as usize as u64;
    let key = syscall::sys_tls_key_create(&tk, Some(dtor)).unwrap();
    let silent = syscall::sys_tls_key_create(&tk, None).unwrap();
    syscall::sys_tls_setspecific(&tk, key, 5).unwrap();
    syscall::sys_tls_setspecific(&tk, silent, 9).unwrap();

    tk.thread_kill(t.id, 0).unwrap();
    while let Some(msg) = tk.cleanup.try_pop() {
        crate::task::cleanup::reclaim(&tk, msg);
    }

    assert_eq!(DTOR_SUM.load(Ordering::SeqCst), 5);
    // The destructed slot was cleared; keys without a destructor are
    // left alone.
    assert_eq!(t.tls_values.lock().get(&key).copied(), Some(0));
    assert_eq!(t.tls_values.lock().get(&silent).copied(), Some(9));
}

#[test]
fn user_tls_destructors_go_through_the_trampoline() {
    static DISPATCHED: AtomicU64 = AtomicU64::new(0);
    fn trampoline(dtor: crate::mm::Vaddr, value: u64) {
        DISPATCHED.fetch_add(dtor + value, Ordering::SeqCst);
    }

    let tk = test_kernel(512);
    crate::task::cleanup::register_user_dtor_trampoline(trampoline);
    let kproc = kernel_process(&tk);
    let worker = spawn(&tk, &kproc, "cleanup", PRIORITY_HIGH);
    let app = tk.process_create("app", false, None).unwrap();
    let t = spawn(&tk, &app, "app_main", PRIORITY_NORMAL);
    adopt(&tk, &t);

    let key = syscall::sys_tls_key_create(&tk, Some(0x4000)).unwrap();
    syscall::sys_tls_setspecific(&tk, key, 6).unwrap();

    tk.thread_kill(t.id, 0).unwrap();
    // The cleanup worker takes over the core and drains the queue.
    adopt(&tk, &worker);
    while let Some(msg) = tk.cleanup.try_pop() {
        crate::task::cleanup::reclaim(&tk, msg);
    }

    assert_eq!(DISPATCHED.load(Ordering::SeqCst), 0x4006);
    // The borrowed lower half was handed back.
    assert!(worker.adopted_lower_half.lock().is_none());
    assert_eq!(worker.ctx.lock().ttbr0, 0);
}

#[test]
fn syscall_surface_round_trips() {
    let tk = test_kernel(512);
    let app = tk.process_create("app", false, None).unwrap();
    let t = spawn(&tk, &app, "app_main", PRIORITY_NORMAL);
    adopt(&tk, &t);

    // Mutex lifecycle through the syscall layer.
    let mid = syscall::sys_mutex_init(&tk, false, false).unwrap();
    syscall::sys_mutex_trylock(&tk, mid, false, None).unwrap();
    syscall::sys_mutex_unlock(&tk, mid).unwrap();
    syscall::sys_mutex_destroy(&tk, mid).unwrap();
    assert!(tk.mutexes.get(mid).is_none());
    assert_eq!(
        syscall::sys_mutex_unlock(&tk, mid).unwrap_err().error(),
        Errno::EINVAL
    );

    // Semaphores keep their value visible.
    let sid = syscall::sys_sem_init(&tk, 2).unwrap();
    assert_eq!(syscall::sys_sem_getvalue(&tk, sid).unwrap(), 2);
    syscall::sys_sem_trywait(&tk, sid, false, None).unwrap();
    syscall::sys_sem_post(&tk, sid).unwrap();
    assert_eq!(syscall::sys_sem_getvalue(&tk, sid).unwrap(), 2);

    // TLS keys and values.
    let key = syscall::sys_tls_key_create(&tk, Some(0xdead)).unwrap();
    syscall::sys_tls_setspecific(&tk, key, 42).unwrap();
    assert_eq!(syscall::sys_tls_getspecific(&tk, key).unwrap(), 42);
    syscall::sys_tls_key_delete(&tk, key).unwrap();
    assert_eq!(
        syscall::sys_tls_setspecific(&tk, key, 1).unwrap_err().error(),
        Errno::EINVAL
    );

    // Priority window.
    assert_eq!(syscall::sys_sched_get_priority_min(&tk).unwrap(), 1);
    assert_eq!(syscall::sys_sched_get_priority_max(&tk).unwrap(), 3);
    syscall::sys_thread_set_priority(&tk, t.id, 200).unwrap();
    assert_eq!(syscall::sys_thread_get_priority(&tk, t.id).unwrap(), 3);

    // Names are clamped.
    let long = alloc::string::String::from_utf8(vec![b'x'; 65]).unwrap();
    assert_eq!(
        syscall::sys_thread_setname(&tk, t.id, &long).unwrap_err().error(),
        Errno::ERANGE
    );
    syscall::sys_thread_setname(&tk, t.id, "renamed").unwrap();
    assert_eq!(*t.name.lock(), "renamed");
}

#[test]
fn environment_and_files_are_inherited() {
    let tk = test_kernel(512);
    let parent = tk.process_create("parent", false, None).unwrap();
    parent.env.lock().args.push("arg0".into());
    parent.env.lock().envs.push("HOME=/data".into());

    struct NullFile;
    impl crate::task::process::FileHandle for NullFile {
        fn description(&self) -> &str {
            "null"
        }
    }
    let fd = parent
        .open_files
        .lock()
        .install(Arc::new(NullFile), 0)
        .unwrap();
    assert_eq!(fd, 0);

    let child = tk
        .process_create("child", true, Some(&parent))
        .unwrap();
    // An unprivileged parent cannot mint privileged children.
    assert!(!child.is_privileged);
    assert_eq!(child.ppid, parent.id);
    assert_eq!(tk.process_parent_id(child.id).unwrap(), parent.id);
    assert_eq!(child.env.lock().envs, vec!["HOME=/data".to_string()]);
    assert_eq!(child.open_files.lock().get(0).unwrap().description(), "null");

    // Page 0 of the child is reserved and non-user.
    let um = child.user_mem.lock();
    let null_block = um.as_ref().unwrap().vblock.valid(0).unwrap();
    assert!(!null_block.user());
}

#[test]
fn events_flow_through_the_process_queue() {
    let tk = test_kernel(256);
    let proc = kernel_process(&tk);
    let t = spawn(&tk, &proc, "ui", PRIORITY_NORMAL);
    adopt(&tk, &t);

    proc.post_event(&tk, crate::ipc::Event::KeyDown { code: 30 }).unwrap();
    proc.post_event(&tk, crate::ipc::Event::KeyUp { code: 30 }).unwrap();
    assert_eq!(
        proc.next_event(&tk, None).unwrap(),
        crate::ipc::Event::KeyDown { code: 30 }
    );
    assert_eq!(
        proc.next_event(&tk, None).unwrap(),
        crate::ipc::Event::KeyUp { code: 30 }
    );
}

#[test]
fn addr_validation_respects_privilege_and_overflow() {
    let tk = test_kernel(256);
    let kproc = kernel_process(&tk);
    let kt = spawn(&tk, &kproc, "kt", PRIORITY_NORMAL);
    let app = tk.process_create("app", false, None).unwrap();
    let ut = spawn(&tk, &app, "ut", PRIORITY_NORMAL);

    assert!(kt.addr_is_valid(crate::config::KERNEL_VBLOCK_BASE, 4096));
    assert!(kt.addr_is_valid(0x1000, 4096));
    assert!(!ut.addr_is_valid(crate::config::KERNEL_VBLOCK_BASE, 4096));
    assert!(ut.addr_is_valid(0x1000, 4096));
    assert!(!ut.addr_is_valid(u64::MAX - 10, u64::MAX));
}
