// SPDX-License-Identifier: MPL-2.0

//! The bitmap binary buddy underlying the physical allocator.
//!
//! One free bitmap per level; bit `i` of level `L` set means "block `i` of
//! size `min_size << L` is free". Acquisition clears a bit, splitting a
//! larger block when the level is empty; release sets a bit, coalescing
//! with the complementary buddy whenever it is also free.

use alloc::vec::Vec;

use align_ext::AlignExt;
use bitvec::prelude::{bitvec, BitVec, Lsb0};

pub(crate) struct BuddyLevels {
    base: u64,
    min_size: u64,
    levels: Vec<BitVec<u64, Lsb0>>,
}

impl BuddyLevels {
    /// Creates an allocator covering `[base, base + total_len)` with every
    /// block initially allocated. Memory is donated with [`Self::release`]
    /// or [`Self::release_region`].
    pub fn new(base: u64, total_len: u64, min_size: u64, max_size: u64) -> Self {
        debug_assert!(min_size.is_power_of_two());
        debug_assert!(max_size.is_power_of_two() && max_size >= min_size);
        debug_assert_eq!(base % max_size, 0);

        let nlevels = (max_size / min_size).trailing_zeros() as usize + 1;
        let mut levels = Vec::with_capacity(nlevels);
        for level in 0..nlevels {
            let block = min_size << level;
            let nbits = total_len.div_ceil(block) as usize;
            levels.push(bitvec![u64, Lsb0; 0; nbits]);
        }
        BuddyLevels {
            base,
            min_size,
            levels,
        }
    }

    fn level_size(&self, level: usize) -> u64 {
        self.min_size << level
    }

    fn level_for(&self, length: u64) -> Option<usize> {
        let level = (length / self.min_size).trailing_zeros() as usize;
        (level < self.levels.len()).then_some(level)
    }

    /// Rounds a request up to the smallest buddy size that can hold it.
    pub fn normalize(&self, length: u64) -> u64 {
        length.next_power_of_two().max(self.min_size)
    }

    /// Acquires a block of exactly `length` bytes (already normalized).
    /// Returns its base address.
    pub fn acquire(&mut self, length: u64) -> Option<u64> {
        let level = self.level_for(length)?;
        let bit = self.acquire_at_level(level)?;
        Some(self.base + bit as u64 * length)
    }

    fn acquire_at_level(&mut self, level: usize) -> Option<usize> {
        if let Some(bit) = self.levels[level].first_one() {
            self.levels[level].set(bit, false);
            return Some(bit);
        }

        if level + 1 >= self.levels.len() {
            return None;
        }
        // Split one block of the level above: take its lower half, leave
        // the complementary half free at this level.
        let above = self.acquire_at_level(level + 1)?;
        let bit = above * 2;
        self.levels[level].set(bit + 1, true);
        Some(bit)
    }

    /// Releases a block of exactly `length` bytes (already normalized) at
    /// `addr`, coalescing upwards while the complementary buddy is free.
    pub fn release(&mut self, addr: u64, length: u64) {
        let Some(level) = self.level_for(length) else {
            log::error!("buddy: release of invalid length {:#x}", length);
            return;
        };
        let bit = ((addr - self.base) / length) as usize;
        self.release_at_level(level, bit);
    }

    fn release_at_level(&mut self, level: usize, bit: usize) {
        let comp = bit ^ 1;
        if level + 1 < self.levels.len()
            && self.levels[level].get(comp).is_some_and(|b| *b)
        {
            self.levels[level].set(comp, false);
            self.release_at_level(level + 1, bit / 2);
        } else {
            self.levels[level].set(bit, true);
        }
    }

    /// Releases an unaligned `[start, end)` region by splitting it into
    /// maximal aligned buddy chunks. Used to seed the allocator from the
    /// boot DRAM map.
    pub fn release_region(&mut self, start: u64, end: u64) -> u64 {
        let max_size = self.level_size(self.levels.len() - 1);
        let mut cur = start.align_up(self.min_size);
        let mut released = 0;

        while cur + self.min_size <= end {
            let rel = cur - self.base;
            let mut size = if rel == 0 {
                max_size
            } else {
                (1u64 << rel.trailing_zeros()).min(max_size)
            };
            while cur + size > end {
                size >>= 1;
            }
            if size < self.min_size {
                break;
            }
            self.release(cur, size);
            released += size;
            cur += size;
        }
        released
    }

    /// Free bytes currently recorded across all levels.
    pub fn free_bytes(&self) -> u64 {
        self.levels
            .iter()
            .enumerate()
            .map(|(level, bits)| bits.count_ones() as u64 * self.level_size(level))
            .sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MIN: u64 = 64 * 1024;
    const MAX: u64 = 512 * 1024 * 1024;
    const BASE: u64 = 0x8000_0000;

    fn seeded(len: u64) -> BuddyLevels {
        let mut b = BuddyLevels::new(BASE, len, MIN, MAX);
        b.release_region(BASE, BASE + len);
        b
    }

    #[test]
    fn acquire_splits_down_from_larger_blocks() {
        let mut b = seeded(MAX);
        let addr = b.acquire(MIN).unwrap();
        assert_eq!(addr % MIN, 0);
        assert_eq!(b.free_bytes(), MAX - MIN);
    }

    #[test]
    fn release_coalesces_back_to_max() {
        let mut b = seeded(MAX);
        let addr = b.acquire(MIN).unwrap();
        b.release(addr, MIN);
        assert_eq!(b.free_bytes(), MAX);
        // The whole region must be available as one maximal block again.
        assert_eq!(b.acquire(MAX), Some(BASE));
    }

    #[test]
    fn distinct_blocks_never_overlap() {
        let mut b = seeded(4 * 1024 * 1024);
        let mut got = alloc::vec::Vec::new();
        while let Some(addr) = b.acquire(MIN) {
            got.push(addr);
        }
        got.sort_unstable();
        got.windows(2).for_each(|w| assert!(w[1] - w[0] >= MIN));
        assert_eq!(got.len(), 64);
    }

    #[test]
    fn unaligned_region_is_split_into_aligned_chunks() {
        let mut b = BuddyLevels::new(BASE, 4 * MAX, MIN, MAX);
        // A window starting 64 KiB into the space and ending off a large
        // boundary: everything page-aligned inside must become free.
        let released = b.release_region(BASE + MIN, BASE + MAX + 3 * MIN);
        assert_eq!(released, MAX + 2 * MIN);
        assert_eq!(b.free_bytes(), released);
        let addr = b.acquire(MIN).unwrap();
        assert!(addr >= BASE + MIN);
    }

    #[test]
    fn exhaustion_reports_none() {
        let mut b = seeded(2 * MIN);
        assert!(b.acquire(MIN).is_some());
        assert!(b.acquire(MIN).is_some());
        assert_eq!(b.acquire(MIN), None);
    }
}
