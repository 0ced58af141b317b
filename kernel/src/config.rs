// SPDX-License-Identifier: MPL-2.0

//! Compile-time tunables for the kernel core.

/// Number of physical cores the scheduler drives.
pub const NR_CPUS: usize = 2;

/// Priority ladder. 0 is reserved for the per-core idle threads.
pub const PRIORITY_IDLE: u8 = 0;
pub const PRIORITY_LOW: u8 = 1;
pub const PRIORITY_NORMAL: u8 = 2;
pub const PRIORITY_HIGH: u8 = 3;
pub const PRIORITY_VHIGH: u8 = 4;
pub const NR_PRIORITIES: usize = PRIORITY_VHIGH as usize + 1;

/// Upper bound on a single timeslice, in microseconds.
pub const MAX_TIMESLICE_US: u64 = 200_000;

/// Hops followed along a blocking chain when electing a substitute thread.
pub const PRIORITY_INHERIT_MAX_HOPS: usize = 4;

/// Passes over a dying thread's TLS slots before destructors are abandoned.
pub const TLS_DTOR_ITERATIONS: usize = 4;

/// Physical memory window managed by the buddy allocator.
pub const DRAM_BASE: u64 = 0x8000_0000;
pub const PMEM_MIN_BLOCK: u64 = 64 * 1024;
pub const PMEM_MAX_BLOCK: u64 = 512 * 1024 * 1024;

/// Offset of the linear window through which the kernel reaches DRAM.
pub const PMEM_LINEAR_OFFSET: u64 = 0xffff_fd00_0000_0000;

/// Start of the kernel's upper-half reservation region and the number of
/// free 512 MiB level-1 slots inside it. The topmost 4 GiB stay reserved
/// for the fixed kernel image and peripherals.
pub const KERNEL_VBLOCK_BASE: u64 = 0xffff_ff00_0000_0000;
pub const KERNEL_VBLOCK_FREE_L1: usize = 2040;

/// Lower-half (per-process) address space size: 4 TiB.
pub const LOWER_HALF_END: u64 = 0x400_0000_0000;

/// Lower-half level-1 slots handed to each process; the last slot is kept
/// for fixed shared mappings (frame buffers, the clock page).
pub const USER_VBLOCK_FREE_L1: usize = 8191;

/// Kernel stacks: one 4 MiB block with a 64 KiB guard on both sides.
pub const KERNEL_STACK_SIZE: u64 = 4 * 1024 * 1024;

/// Depth of the cleanup worker's message queue.
pub const CLEANUP_QUEUE_DEPTH: usize = 8;

/// Depth of each process's input-event queue.
pub const EVENT_QUEUE_DEPTH: usize = 32;

/// Thread names are clamped to this many bytes.
pub const THREAD_NAME_MAX: usize = 64;
