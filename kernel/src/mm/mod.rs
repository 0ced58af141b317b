// SPDX-License-Identifier: MPL-2.0

//! Memory management: the physical buddy allocator, the virtual
//! reservation allocator, the hardware page tables and the
//! translation-fault policy.

pub mod buddy;
pub mod fault;
pub mod page_table;
pub mod pmem;
pub mod vblock;

pub use fault::{FaultAccess, FaultOutcome, TranslationFault};
pub use page_table::{KernelPageTable, MemoryType, PageTable};
pub use pmem::{PMemBlock, PhysAllocator};
pub use vblock::{BlockTag, TagFlags, VBlock, VMemBlock};

use bit_field::BitField;

/// A physical address.
pub type Paddr = u64;
/// A virtual address.
pub type Vaddr = u64;

/// The 64 KiB hardware granule: the unit of the page tables and the
/// smallest buddy/reservation block.
pub const PAGE_SIZE: u64 = 64 * 1024;

/// Virtual blocks come in exactly three sizes.
pub const BLOCK_64K: u64 = 64 * 1024;
pub const BLOCK_4M: u64 = 4 * 1024 * 1024;
pub const BLOCK_512M: u64 = 512 * 1024 * 1024;

/// Both halves are 4 TiB; the upper half occupies the top of the
/// canonical space and its table walk is relative to this base.
pub const UPPER_HALF_BASE: Vaddr = 0xffff_fc00_0000_0000;

pub fn is_upper_half(vaddr: Vaddr) -> bool {
    vaddr.get_bit(63)
}

/// The window through which the kernel reaches physical memory directly.
///
/// On hardware the whole DRAM span is mapped at a fixed offset; hosted
/// tests point the window at a heap-allocated arena instead, so the same
/// table-walking code reads and writes real memory in both worlds.
#[derive(Debug, Clone, Copy)]
pub struct LinearWindow {
    offset: u64,
}

impl LinearWindow {
    pub const fn new(offset: u64) -> Self {
        LinearWindow { offset }
    }

    /// Window for a hosted arena whose synthetic physical span starts at
    /// `phys_base` and actually lives at `host_base`.
    pub fn for_arena(phys_base: Paddr, host_base: u64) -> Self {
        LinearWindow {
            offset: host_base.wrapping_sub(phys_base),
        }
    }

    pub fn paddr_to_ptr(&self, paddr: Paddr) -> *mut u8 {
        paddr.wrapping_add(self.offset) as *mut u8
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use alloc::{vec, vec::Vec};

    use super::{LinearWindow, PhysAllocator, PAGE_SIZE};
    use crate::config::DRAM_BASE;

    /// A synthetic DRAM span for host tests: the physical addresses are
    /// the real window at `DRAM_BASE`, backed by a heap arena, so table
    /// walks and stack writes touch actual memory.
    pub(crate) struct TestDram {
        #[allow(dead_code)]
        buf: Vec<u64>,
        pub pmem: PhysAllocator,
        pub window: LinearWindow,
    }

    impl TestDram {
        pub fn new(pages: u64) -> Self {
            let len = pages * PAGE_SIZE;
            let buf = vec![0u64; (len / 8) as usize];
            let window = LinearWindow::for_arena(DRAM_BASE, buf.as_ptr() as u64);
            let pmem = PhysAllocator::new(DRAM_BASE, len);
            pmem.release_region(DRAM_BASE, DRAM_BASE + len);
            TestDram { buf, pmem, window }
        }
    }
}

/// Guard sizes are encoded as a 2-bit class in the block tag.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuardClass {
    #[default]
    None = 0,
    Guard64K = 1,
    Guard512K = 2,
    Guard1M = 3,
}

impl GuardClass {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            1 => GuardClass::Guard64K,
            2 => GuardClass::Guard512K,
            3 => GuardClass::Guard1M,
            _ => GuardClass::None,
        }
    }

    pub const fn size(self) -> u64 {
        match self {
            GuardClass::None => 0,
            GuardClass::Guard64K => 64 * 1024,
            GuardClass::Guard512K => 512 * 1024,
            GuardClass::Guard1M => 1024 * 1024,
        }
    }
}
