// SPDX-License-Identifier: MPL-2.0

//! The physical-frame allocator.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    config::{PMEM_MAX_BLOCK, PMEM_MIN_BLOCK},
    prelude::*,
    sync::SpinLock,
};

use super::buddy::BuddyLevels;

/// An aligned power-of-two physical block handed out by [`PhysAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PMemBlock {
    pub base: Paddr,
    pub length: u64,
    /// Tracked but not reference-counted; every block has exactly one
    /// owner who releases it once.
    pub is_shared: bool,
}

impl PMemBlock {
    pub fn end(&self) -> Paddr {
        self.base + self.length
    }
}

/// The buddy allocator over the contiguous DRAM span.
///
/// All bitmap updates happen under one spin lock with local IRQs disabled.
/// Out-of-memory is an error return, never a panic.
pub struct PhysAllocator {
    inner: SpinLock<BuddyLevels>,
    total: AtomicU64,
    free: AtomicU64,
}

impl PhysAllocator {
    /// Creates an allocator for `[base, base + total_len)` with no free
    /// memory; donate spans with [`Self::release_region`].
    pub fn new(base: Paddr, total_len: u64) -> Self {
        PhysAllocator {
            inner: SpinLock::new(BuddyLevels::new(
                base,
                total_len,
                PMEM_MIN_BLOCK,
                PMEM_MAX_BLOCK,
            )),
            total: AtomicU64::new(0),
            free: AtomicU64::new(0),
        }
    }

    /// Acquires the smallest buddy block large enough for `length` bytes.
    pub fn acquire(&self, length: u64) -> Result<PMemBlock> {
        if length == 0 {
            return_errno_with_message!(Errno::EINVAL, "zero-length frame request");
        }
        let mut inner = self.inner.lock();
        let length = inner.normalize(length);
        if length > PMEM_MAX_BLOCK {
            return_errno_with_message!(Errno::ENOMEM, "frame request above the maximum buddy size");
        }
        let Some(base) = inner.acquire(length) else {
            return_errno!(Errno::ENOMEM);
        };
        drop(inner);

        self.free.fetch_sub(length, Ordering::Relaxed);
        Ok(PMemBlock {
            base,
            length,
            is_shared: false,
        })
    }

    /// Returns `block` to the free lists, coalescing with its buddies.
    pub fn release(&self, block: PMemBlock) {
        let mut inner = self.inner.lock();
        let length = inner.normalize(block.length);
        inner.release(block.base, length);
        drop(inner);
        self.free.fetch_add(length, Ordering::Relaxed);
    }

    /// Donates the (possibly unaligned) span `[start, end)`, splitting it
    /// into maximal aligned chunks. Used when seeding from the boot DRAM
    /// map, after boot-time reservations have been carved off the front.
    pub fn release_region(&self, start: Paddr, end: Paddr) {
        let released = self.inner.lock().release_region(start, end);
        self.total.fetch_add(released, Ordering::Relaxed);
        self.free.fetch_add(released, Ordering::Relaxed);
        log::info!(
            "pmem: released {:#x} bytes from region {:#x}-{:#x}",
            released,
            start,
            end
        );
    }

    pub fn total_bytes(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::DRAM_BASE;

    fn allocator(len: u64) -> PhysAllocator {
        let pmem = PhysAllocator::new(DRAM_BASE, len);
        pmem.release_region(DRAM_BASE, DRAM_BASE + len);
        pmem
    }

    #[test]
    fn blocks_are_aligned_to_their_length() {
        let pmem = allocator(PMEM_MAX_BLOCK);
        for req in [1, PMEM_MIN_BLOCK, PMEM_MIN_BLOCK + 1, 1 << 20] {
            let b = pmem.acquire(req).unwrap();
            assert_eq!(b.base % b.length, 0);
            assert_eq!(b.length, req.next_power_of_two().max(PMEM_MIN_BLOCK));
            pmem.release(b);
        }
    }

    #[test]
    fn release_then_reacquire_same_length() {
        let pmem = allocator(PMEM_MAX_BLOCK);
        let b = pmem.acquire(1 << 20).unwrap();
        let free_before = pmem.free_bytes();
        pmem.release(b);
        let again = pmem.acquire(b.length).unwrap();
        assert_eq!(again.length, b.length);
        assert_eq!(pmem.free_bytes(), free_before);
    }

    #[test]
    fn zero_and_oversized_requests_fail() {
        let pmem = allocator(PMEM_MAX_BLOCK);
        assert_eq!(pmem.acquire(0).unwrap_err().error(), Errno::EINVAL);
        assert_eq!(
            pmem.acquire(PMEM_MAX_BLOCK * 2).unwrap_err().error(),
            Errno::ENOMEM
        );
    }

    #[test]
    fn exhaustion_is_enomem_not_panic() {
        let pmem = allocator(2 * PMEM_MIN_BLOCK);
        let _a = pmem.acquire(PMEM_MIN_BLOCK).unwrap();
        let _b = pmem.acquire(PMEM_MIN_BLOCK).unwrap();
        assert_eq!(
            pmem.acquire(PMEM_MIN_BLOCK).unwrap_err().error(),
            Errno::ENOMEM
        );
    }
}
