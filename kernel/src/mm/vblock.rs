// SPDX-License-Identifier: MPL-2.0

//! The virtual-address reservation allocator.
//!
//! A three-level structure carves a large region into 512 MiB, 4 MiB and
//! 64 KiB blocks. Level-1 slots are either unavailable, free, allocated as
//! a whole 512 MiB block, or point to a level-2 table of 128 x 4 MiB
//! slots; those in turn may point to level-3 tables of 64 x 64 KiB leaf
//! slots. Reservations are decoupled from physical backing: the
//! page-fault handler maps frames into them lazily.
//!
//! Freeing never coalesces upward; the levels differ by a factor of at
//! least 64, so table overhead only matters at maximal fragmentation.

use bit_field::BitField;
use bitflags::bitflags;

use crate::{prelude::*, sync::SpinLock};

use super::{GuardClass, MemoryType, BLOCK_4M, BLOCK_512M, BLOCK_64K};

const LEVEL2_COUNT: usize = 128;
const LEVEL3_COUNT: usize = 64;

bitflags! {
    /// Access and kind bits of a reservation.
    pub struct TagFlags: u32 {
        const USER          = 1 << 0;
        const WRITE         = 1 << 1;
        const EXEC          = 1 << 2;
        const TLS           = 1 << 7;
        const FILE_BACKED   = 1 << 8;
        const WRITE_THROUGH = 1 << 9;
    }
}

/// The packed 32-bit tag stored in an allocated slot: access bits plus the
/// guard classes for both ends (bits 3-4 lower, 5-6 upper).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTag(u32);

impl BlockTag {
    pub fn new(flags: TagFlags, lower_guard: GuardClass, upper_guard: GuardClass) -> Self {
        let mut bits = flags.bits();
        bits.set_bits(3..5, lower_guard as u32);
        bits.set_bits(5..7, upper_guard as u32);
        BlockTag(bits)
    }

    pub const fn from_bits(bits: u32) -> Self {
        BlockTag(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub fn flags(&self) -> TagFlags {
        TagFlags::from_bits_truncate(self.0)
    }

    pub fn lower_guard(&self) -> GuardClass {
        GuardClass::from_bits(self.0.get_bits(3..5))
    }

    pub fn upper_guard(&self) -> GuardClass {
        GuardClass::from_bits(self.0.get_bits(5..7))
    }

    pub fn memory_type(&self) -> MemoryType {
        if self.flags().contains(TagFlags::WRITE_THROUGH) {
            MemoryType::NormalWriteThrough
        } else {
            MemoryType::NormalWriteBack
        }
    }
}

impl Default for BlockTag {
    fn default() -> Self {
        BlockTag(0)
    }
}

/// A reserved virtual-address range. The data region is the block minus
/// its guard ranges; only the data region is ever mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VMemBlock {
    pub base: Vaddr,
    pub length: u64,
    pub tag: BlockTag,
}

impl VMemBlock {
    pub fn end(&self) -> Vaddr {
        self.base + self.length
    }

    pub fn data_start(&self) -> Vaddr {
        self.base + self.tag.lower_guard().size()
    }

    pub fn data_end(&self) -> Vaddr {
        self.end() - self.tag.upper_guard().size()
    }

    pub fn data_length(&self) -> u64 {
        self.data_end() - self.data_start()
    }

    pub fn contains(&self, addr: Vaddr) -> bool {
        addr >= self.base && addr < self.end()
    }

    pub fn in_guard(&self, addr: Vaddr) -> bool {
        self.contains(addr) && (addr < self.data_start() || addr >= self.data_end())
    }

    pub fn user(&self) -> bool {
        self.tag.flags().contains(TagFlags::USER)
    }

    pub fn write(&self) -> bool {
        self.tag.flags().contains(TagFlags::WRITE)
    }

    pub fn exec(&self) -> bool {
        self.tag.flags().contains(TagFlags::EXEC)
    }
}

enum L1Entry {
    Unavailable,
    Free,
    Allocated(BlockTag),
    Table(Box<Level2>),
}

enum L2Entry {
    Free,
    Allocated(BlockTag),
    Table(Box<Level3>),
}

struct Level2 {
    free_count: u32,
    last_block: usize,
    last_buddy: usize,
    slots: [L2Entry; LEVEL2_COUNT],
}

struct Level3 {
    free_count: u32,
    last_block: usize,
    slots: [Option<BlockTag>; LEVEL3_COUNT],
}

impl Level2 {
    fn new() -> Box<Self> {
        Box::new(Level2 {
            free_count: LEVEL2_COUNT as u32,
            last_block: 0,
            last_buddy: 0,
            slots: core::array::from_fn(|_| L2Entry::Free),
        })
    }
}

impl Level3 {
    fn new() -> Box<Self> {
        Box::new(Level3 {
            free_count: LEVEL3_COUNT as u32,
            last_block: 0,
            slots: [None; LEVEL3_COUNT],
        })
    }
}

struct VBlockInner {
    base: Vaddr,
    level1: Vec<L1Entry>,
    level1_free: usize,
    /// Cursor over level-1 blocks, for locality of fresh 512 MiB grants.
    last_block: usize,
    /// Cursor over level-1 slots that point at half-full tables.
    last_pointer: usize,
}

/// The three-level reservation allocator over one contiguous region.
pub struct VBlock {
    inner: SpinLock<VBlockInner>,
}

impl VBlock {
    /// Creates an allocator at `base` with `free_slots` usable 512 MiB
    /// level-1 entries; the remainder up to the table size stays
    /// permanently unavailable.
    pub fn new(base: Vaddr, free_slots: usize, table_slots: usize) -> Self {
        debug_assert!(table_slots <= 8192 && free_slots <= table_slots);
        let level1 = (0..table_slots)
            .map(|i| {
                if i < free_slots {
                    L1Entry::Free
                } else {
                    L1Entry::Unavailable
                }
            })
            .collect();
        VBlock {
            inner: SpinLock::new(VBlockInner {
                base,
                level1,
                level1_free: free_slots,
                last_block: 0,
                last_pointer: 0,
            }),
        }
    }

    /// Rounds a byte count up to the smallest representable block size.
    pub fn size_for(len: u64) -> Option<u64> {
        match len {
            0 => None,
            l if l <= BLOCK_64K => Some(BLOCK_64K),
            l if l <= BLOCK_4M => Some(BLOCK_4M),
            l if l <= BLOCK_512M => Some(BLOCK_512M),
            _ => None,
        }
    }

    /// Reserves a block of `size` bytes (one of the three block sizes).
    pub fn alloc(&self, size: u64, tag: BlockTag) -> Result<VMemBlock> {
        check_guards(size, tag)?;
        let mut inner = self.inner.lock();
        match size {
            BLOCK_64K => inner.alloc_level3(tag),
            BLOCK_4M => inner.alloc_level2(tag),
            BLOCK_512M => inner.alloc_level1(tag),
            _ => Err(Error::with_message(Errno::EINVAL, "invalid block size")),
        }
    }

    /// Reserves the block of `size` bytes containing `addr`.
    pub fn alloc_fixed(&self, size: u64, addr: Vaddr, tag: BlockTag) -> Result<VMemBlock> {
        check_guards(size, tag)?;
        let mut inner = self.inner.lock();
        let Some(rel) = addr.checked_sub(inner.base) else {
            return_errno!(Errno::EINVAL);
        };
        match size {
            BLOCK_64K => inner.alloc_fixed_level3(rel, tag),
            BLOCK_4M => inner.alloc_fixed_level2(rel, tag),
            BLOCK_512M => inner.alloc_fixed_level1(rel, tag),
            _ => Err(Error::with_message(Errno::EINVAL, "invalid block size")),
        }
    }

    /// Looks up the allocated block containing `addr`.
    pub fn valid(&self, addr: Vaddr) -> Option<VMemBlock> {
        let inner = self.inner.lock();
        let rel = addr.checked_sub(inner.base)?;
        let idx = (rel / BLOCK_512M) as usize;
        let base = inner.base;
        match inner.level1.get(idx)? {
            L1Entry::Unavailable | L1Entry::Free => None,
            L1Entry::Allocated(tag) => Some(VMemBlock {
                base: base + idx as u64 * BLOCK_512M,
                length: BLOCK_512M,
                tag: *tag,
            }),
            L1Entry::Table(l2) => {
                let idx2 = ((rel % BLOCK_512M) / BLOCK_4M) as usize;
                match &l2.slots[idx2] {
                    L2Entry::Free => None,
                    L2Entry::Allocated(tag) => Some(VMemBlock {
                        base: base + idx as u64 * BLOCK_512M + idx2 as u64 * BLOCK_4M,
                        length: BLOCK_4M,
                        tag: *tag,
                    }),
                    L2Entry::Table(l3) => {
                        let idx3 = ((rel % BLOCK_4M) / BLOCK_64K) as usize;
                        l3.slots[idx3].map(|tag| VMemBlock {
                            base: base
                                + idx as u64 * BLOCK_512M
                                + idx2 as u64 * BLOCK_4M
                                + idx3 as u64 * BLOCK_64K,
                            length: BLOCK_64K,
                            tag,
                        })
                    }
                }
            }
        }
    }

    /// Marks the matching level entry free again.
    pub fn free(&self, block: &VMemBlock) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(rel) = block.base.checked_sub(inner.base) else {
            return_errno!(Errno::EINVAL);
        };
        match block.length {
            BLOCK_64K => inner.free_level3(rel),
            BLOCK_4M => inner.free_level2(rel),
            BLOCK_512M => inner.free_level1(rel),
            _ => Err(Error::with_message(Errno::EINVAL, "invalid block size")),
        }
    }

    /// Replaces the tag of the allocated block containing `addr`,
    /// returning the updated block. Access-bit changes only; the
    /// caller re-encodes any live page mappings.
    pub fn update_tag(&self, addr: Vaddr, tag: BlockTag) -> Result<VMemBlock> {
        let mut inner = self.inner.lock();
        let Some(rel) = addr.checked_sub(inner.base) else {
            return_errno!(Errno::EINVAL);
        };
        let idx = (rel / BLOCK_512M) as usize;
        let base = inner.base;
        match inner.level1.get_mut(idx) {
            Some(L1Entry::Allocated(slot)) => {
                *slot = tag;
                Ok(VMemBlock {
                    base: base + idx as u64 * BLOCK_512M,
                    length: BLOCK_512M,
                    tag,
                })
            }
            Some(L1Entry::Table(l2)) => {
                let idx2 = ((rel % BLOCK_512M) / BLOCK_4M) as usize;
                match &mut l2.slots[idx2] {
                    L2Entry::Allocated(slot) => {
                        *slot = tag;
                        Ok(VMemBlock {
                            base: base + idx as u64 * BLOCK_512M + idx2 as u64 * BLOCK_4M,
                            length: BLOCK_4M,
                            tag,
                        })
                    }
                    L2Entry::Table(l3) => {
                        let idx3 = ((rel % BLOCK_4M) / BLOCK_64K) as usize;
                        match &mut l3.slots[idx3] {
                            Some(slot) => {
                                *slot = tag;
                                Ok(VMemBlock {
                                    base: base
                                        + idx as u64 * BLOCK_512M
                                        + idx2 as u64 * BLOCK_4M
                                        + idx3 as u64 * BLOCK_64K,
                                    length: BLOCK_64K,
                                    tag,
                                })
                            }
                            None => Err(Error::new(Errno::EINVAL)),
                        }
                    }
                    L2Entry::Free => Err(Error::new(Errno::EINVAL)),
                }
            }
            _ => Err(Error::new(Errno::EINVAL)),
        }
    }

    /// Count of free 512 MiB level-1 slots (diagnostics and tests).
    pub fn free_level1_slots(&self) -> usize {
        self.inner.lock().level1_free
    }
}

fn check_guards(size: u64, tag: BlockTag) -> Result<()> {
    let guard_bytes = tag.lower_guard().size() + tag.upper_guard().size();
    if guard_bytes >= size {
        return_errno_with_message!(Errno::EINVAL, "guards would swallow the data region");
    }
    Ok(())
}

impl VBlockInner {
    fn block(&self, idx: usize, idx2: usize, idx3: usize, length: u64, tag: BlockTag) -> VMemBlock {
        VMemBlock {
            base: self.base
                + idx as u64 * BLOCK_512M
                + idx2 as u64 * BLOCK_4M
                + idx3 as u64 * BLOCK_64K,
            length,
            tag,
        }
    }

    fn find_free_level1(&mut self) -> Option<usize> {
        if self.level1_free == 0 {
            return None;
        }
        let n = self.level1.len();
        for i in 0..n {
            let idx = (i + self.last_block) % n;
            if matches!(self.level1[idx], L1Entry::Free) {
                return Some(idx);
            }
        }
        log::error!("vblock: level1 free counter inaccurate");
        self.level1_free = 0;
        None
    }

    /// A level-1 slot pointing at a table that still has free 4 MiB slots,
    /// scanned from the pointer cursor.
    fn find_level1_with_free_level2(&self) -> Option<usize> {
        let n = self.level1.len();
        for i in 0..n {
            let idx = (i + self.last_pointer) % n;
            if let L1Entry::Table(l2) = &self.level1[idx] {
                if l2.free_count > 0 {
                    return Some(idx);
                }
            }
        }
        None
    }

    /// A (level-1, level-2) pair pointing at a level-3 table with free
    /// leaves; falls back to a table with a spare 4 MiB slot.
    fn find_level12_with_free_level3(&self) -> (Option<usize>, Option<usize>) {
        let n = self.level1.len();
        for i in 0..n {
            let idx = (i + self.last_pointer) % n;
            if let L1Entry::Table(l2) = &self.level1[idx] {
                for j in 0..LEVEL2_COUNT {
                    let idx2 = (j + l2.last_buddy) % LEVEL2_COUNT;
                    if let L2Entry::Table(l3) = &l2.slots[idx2] {
                        if l3.free_count > 0 {
                            return (Some(idx), Some(idx2));
                        }
                    }
                }
            }
        }
        (self.find_level1_with_free_level2(), None)
    }

    fn alloc_level1(&mut self, tag: BlockTag) -> Result<VMemBlock> {
        let Some(idx) = self.find_free_level1() else {
            return_errno!(Errno::ENOMEM);
        };
        self.level1[idx] = L1Entry::Allocated(tag);
        self.level1_free -= 1;
        self.last_block = idx + 1;
        Ok(self.block(idx, 0, 0, BLOCK_512M, tag))
    }

    fn alloc_level2(&mut self, tag: BlockTag) -> Result<VMemBlock> {
        let idx = match self.find_level1_with_free_level2() {
            Some(idx) => idx,
            None => {
                let Some(idx) = self.find_free_level1() else {
                    return_errno!(Errno::ENOMEM);
                };
                self.level1[idx] = L1Entry::Table(Level2::new());
                self.level1_free -= 1;
                idx
            }
        };

        let L1Entry::Table(l2) = &mut self.level1[idx] else {
            unreachable!()
        };
        let Some(idx2) = find_free_l2_slot(l2) else {
            log::error!("vblock: expected a free level2 slot but none available");
            return_errno!(Errno::ENOMEM);
        };
        l2.slots[idx2] = L2Entry::Allocated(tag);
        l2.free_count -= 1;
        l2.last_block = idx2 + 1;
        self.last_pointer = idx;
        Ok(self.block(idx, idx2, 0, BLOCK_4M, tag))
    }

    fn alloc_level3(&mut self, tag: BlockTag) -> Result<VMemBlock> {
        let (idx, idx2) = self.find_level12_with_free_level3();
        let idx = match idx {
            Some(idx) => idx,
            None => {
                let Some(idx) = self.find_free_level1() else {
                    return_errno!(Errno::ENOMEM);
                };
                self.level1[idx] = L1Entry::Table(Level2::new());
                self.level1_free -= 1;
                idx
            }
        };

        let L1Entry::Table(l2) = &mut self.level1[idx] else {
            unreachable!()
        };
        let idx2 = match idx2 {
            Some(idx2) => idx2,
            None => {
                let Some(idx2) = find_free_l2_slot(l2) else {
                    log::error!("vblock: expected a free level3 slot but none available");
                    return_errno!(Errno::ENOMEM);
                };
                l2.slots[idx2] = L2Entry::Table(Level3::new());
                l2.free_count -= 1;
                idx2
            }
        };

        let L2Entry::Table(l3) = &mut l2.slots[idx2] else {
            unreachable!()
        };
        let Some(idx3) = find_free_l3_slot(l3) else {
            return_errno!(Errno::ENOMEM);
        };
        l3.slots[idx3] = Some(tag);
        l3.free_count -= 1;
        l3.last_block = idx3 + 1;
        l2.last_buddy = idx2;
        self.last_pointer = idx;
        Ok(self.block(idx, idx2, idx3, BLOCK_64K, tag))
    }

    fn alloc_fixed_level1(&mut self, rel: Vaddr, tag: BlockTag) -> Result<VMemBlock> {
        let idx = (rel / BLOCK_512M) as usize;
        if !matches!(self.level1.get(idx), Some(L1Entry::Free)) {
            return_errno!(Errno::EBUSY);
        }
        self.level1[idx] = L1Entry::Allocated(tag);
        self.level1_free -= 1;
        self.last_block = idx + 1;
        Ok(self.block(idx, 0, 0, BLOCK_512M, tag))
    }

    /// Fixed allocations may upgrade a free level-1 slot into a table;
    /// the table is created lazily at that moment.
    fn upgrade_level1(&mut self, idx: usize) -> Result<()> {
        match self.level1.get(idx) {
            Some(L1Entry::Table(_)) => Ok(()),
            Some(L1Entry::Free) => {
                self.level1[idx] = L1Entry::Table(Level2::new());
                self.level1_free -= 1;
                Ok(())
            }
            _ => Err(Error::new(Errno::EBUSY)),
        }
    }

    fn alloc_fixed_level2(&mut self, rel: Vaddr, tag: BlockTag) -> Result<VMemBlock> {
        let idx = (rel / BLOCK_512M) as usize;
        self.upgrade_level1(idx)?;

        let idx2 = ((rel % BLOCK_512M) / BLOCK_4M) as usize;
        let L1Entry::Table(l2) = &mut self.level1[idx] else {
            unreachable!()
        };
        if !matches!(l2.slots[idx2], L2Entry::Free) {
            return_errno!(Errno::EBUSY);
        }
        l2.slots[idx2] = L2Entry::Allocated(tag);
        l2.free_count -= 1;
        l2.last_block = idx2 + 1;
        self.last_pointer = idx;
        Ok(self.block(idx, idx2, 0, BLOCK_4M, tag))
    }

    fn alloc_fixed_level3(&mut self, rel: Vaddr, tag: BlockTag) -> Result<VMemBlock> {
        let idx = (rel / BLOCK_512M) as usize;
        self.upgrade_level1(idx)?;

        let idx2 = ((rel % BLOCK_512M) / BLOCK_4M) as usize;
        let L1Entry::Table(l2) = &mut self.level1[idx] else {
            unreachable!()
        };
        match &l2.slots[idx2] {
            L2Entry::Free => {
                l2.slots[idx2] = L2Entry::Table(Level3::new());
                l2.free_count -= 1;
            }
            L2Entry::Table(_) => (),
            L2Entry::Allocated(_) => return_errno!(Errno::EBUSY),
        }

        let idx3 = ((rel % BLOCK_4M) / BLOCK_64K) as usize;
        let L2Entry::Table(l3) = &mut l2.slots[idx2] else {
            unreachable!()
        };
        if l3.slots[idx3].is_some() {
            return_errno!(Errno::EBUSY);
        }
        l3.slots[idx3] = Some(tag);
        l3.free_count -= 1;
        l3.last_block = idx3 + 1;
        l2.last_buddy = idx2;
        self.last_pointer = idx;
        Ok(self.block(idx, idx2, idx3, BLOCK_64K, tag))
    }

    fn free_level1(&mut self, rel: Vaddr) -> Result<()> {
        let idx = (rel / BLOCK_512M) as usize;
        if !matches!(self.level1.get(idx), Some(L1Entry::Allocated(_))) {
            return_errno!(Errno::EINVAL);
        }
        self.level1[idx] = L1Entry::Free;
        self.level1_free += 1;
        Ok(())
    }

    fn free_level2(&mut self, rel: Vaddr) -> Result<()> {
        let idx = (rel / BLOCK_512M) as usize;
        let Some(L1Entry::Table(l2)) = self.level1.get_mut(idx) else {
            return_errno!(Errno::EINVAL);
        };
        let idx2 = ((rel % BLOCK_512M) / BLOCK_4M) as usize;
        if !matches!(l2.slots[idx2], L2Entry::Allocated(_)) {
            return_errno!(Errno::EINVAL);
        }
        l2.slots[idx2] = L2Entry::Free;
        l2.free_count += 1;
        Ok(())
    }

    fn free_level3(&mut self, rel: Vaddr) -> Result<()> {
        let idx = (rel / BLOCK_512M) as usize;
        let Some(L1Entry::Table(l2)) = self.level1.get_mut(idx) else {
            return_errno!(Errno::EINVAL);
        };
        let idx2 = ((rel % BLOCK_512M) / BLOCK_4M) as usize;
        let L2Entry::Table(l3) = &mut l2.slots[idx2] else {
            return_errno!(Errno::EINVAL);
        };
        let idx3 = ((rel % BLOCK_4M) / BLOCK_64K) as usize;
        if l3.slots[idx3].take().is_none() {
            return_errno!(Errno::EINVAL);
        }
        l3.free_count += 1;
        Ok(())
    }
}

fn find_free_l2_slot(l2: &Level2) -> Option<usize> {
    if l2.free_count == 0 {
        return None;
    }
    (0..LEVEL2_COUNT)
        .map(|j| (j + l2.last_block) % LEVEL2_COUNT)
        .find(|&idx2| matches!(l2.slots[idx2], L2Entry::Free))
}

fn find_free_l3_slot(l3: &Level3) -> Option<usize> {
    if l3.free_count == 0 {
        return None;
    }
    (0..LEVEL3_COUNT)
        .map(|j| (j + l3.last_block) % LEVEL3_COUNT)
        .find(|&idx3| l3.slots[idx3].is_none())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{KERNEL_VBLOCK_BASE, KERNEL_VBLOCK_FREE_L1};

    fn vb() -> VBlock {
        VBlock::new(KERNEL_VBLOCK_BASE, KERNEL_VBLOCK_FREE_L1, 2048)
    }

    fn plain() -> BlockTag {
        BlockTag::new(TagFlags::WRITE, GuardClass::None, GuardClass::None)
    }

    #[test]
    fn tag_round_trips_through_its_packed_form() {
        let tag = BlockTag::new(
            TagFlags::USER | TagFlags::WRITE | TagFlags::TLS,
            GuardClass::Guard64K,
            GuardClass::Guard1M,
        );
        let back = BlockTag::from_bits(tag.bits());
        assert_eq!(back.flags(), TagFlags::USER | TagFlags::WRITE | TagFlags::TLS);
        assert_eq!(back.lower_guard(), GuardClass::Guard64K);
        assert_eq!(back.upper_guard(), GuardClass::Guard1M);
    }

    #[test]
    fn all_three_sizes_allocate_aligned_and_disjoint() {
        let vb = vb();
        let a = vb.alloc(BLOCK_64K, plain()).unwrap();
        let b = vb.alloc(BLOCK_4M, plain()).unwrap();
        let c = vb.alloc(BLOCK_512M, plain()).unwrap();
        for blk in [&a, &b, &c] {
            assert_eq!(blk.base % blk.length, 0);
        }
        assert!(a.end() <= b.base || b.end() <= a.base);
        assert!(b.end() <= c.base || c.end() <= b.base);
        assert!(a.end() <= c.base || c.end() <= a.base);
    }

    #[test]
    fn valid_finds_the_containing_block() {
        let vb = vb();
        let b = vb.alloc(BLOCK_4M, plain()).unwrap();
        let hit = vb.valid(b.base + 12345).unwrap();
        assert_eq!(hit, b);
        assert!(vb.valid(b.end()).is_none() || vb.valid(b.end()).unwrap().base != b.base);
    }

    #[test]
    fn free_restores_the_allocator_state() {
        let vb = vb();
        let l1_before = vb.free_level1_slots();
        let b = vb.alloc(BLOCK_64K, plain()).unwrap();
        vb.free(&b).unwrap();
        // A fresh 64 KiB alloc lands in the same (still-listed) table,
        // one slot past the cursor.
        let again = vb.alloc(BLOCK_64K, plain()).unwrap();
        assert_eq!(again.base, b.base + BLOCK_64K);
        vb.free(&again).unwrap();
        let big = vb.alloc(BLOCK_512M, plain()).unwrap();
        vb.free(&big).unwrap();
        assert_eq!(vb.free_level1_slots(), l1_before - 1); // the lazily made table stays
        assert!(vb.valid(b.base).is_none());
    }

    #[test]
    fn invalid_sizes_do_not_mutate_state() {
        let vb = vb();
        let before = vb.free_level1_slots();
        assert_eq!(
            vb.alloc(BLOCK_64K * 3, plain()).unwrap_err().error(),
            Errno::EINVAL
        );
        assert_eq!(
            vb.alloc(BLOCK_512M * 2, plain()).unwrap_err().error(),
            Errno::EINVAL
        );
        assert_eq!(vb.free_level1_slots(), before);
    }

    #[test]
    fn fixed_alloc_upgrades_and_detects_collisions() {
        let vb = vb();
        let addr = KERNEL_VBLOCK_BASE + 3 * BLOCK_512M + 5 * BLOCK_4M + 7 * BLOCK_64K;
        let b = vb.alloc_fixed(BLOCK_64K, addr, plain()).unwrap();
        assert_eq!(b.base, addr);
        assert_eq!(
            vb.alloc_fixed(BLOCK_64K, addr, plain()).unwrap_err().error(),
            Errno::EBUSY
        );
        // The enclosing 4 MiB slot now carries a table, not a block.
        assert_eq!(
            vb.alloc_fixed(BLOCK_4M, addr, plain()).unwrap_err().error(),
            Errno::EBUSY
        );
        // A sibling leaf in the same lazily created table still works.
        let sib = vb.alloc_fixed(BLOCK_64K, addr + BLOCK_64K, plain()).unwrap();
        assert_eq!(sib.base, addr + BLOCK_64K);
    }

    #[test]
    fn guards_shrink_the_data_region_only() {
        let vb = vb();
        let tag = BlockTag::new(TagFlags::WRITE, GuardClass::Guard64K, GuardClass::Guard64K);
        let b = vb.alloc(BLOCK_4M, tag).unwrap();
        assert_eq!(b.data_length(), BLOCK_4M - 2 * BLOCK_64K);
        assert!(b.in_guard(b.base));
        assert!(b.in_guard(b.end() - 1));
        assert!(!b.in_guard(b.data_start()));
        // Guards that leave no data are rejected.
        let bad = BlockTag::new(TagFlags::WRITE, GuardClass::Guard64K, GuardClass::None);
        assert_eq!(vb.alloc(BLOCK_64K, bad).unwrap_err().error(), Errno::EINVAL);
    }

    #[test]
    fn level1_exhaustion_is_enomem() {
        let vb = VBlock::new(KERNEL_VBLOCK_BASE, 2, 8);
        assert!(vb.alloc(BLOCK_512M, plain()).is_ok());
        assert!(vb.alloc(BLOCK_512M, plain()).is_ok());
        assert_eq!(
            vb.alloc(BLOCK_512M, plain()).unwrap_err().error(),
            Errno::ENOMEM
        );
    }
}
