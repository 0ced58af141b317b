// SPDX-License-Identifier: MPL-2.0

//! The hardware page tables: two levels with a 64 KiB granule.
//!
//! A root table of 8192 entries covers 4 TiB in 512 MiB strides; each
//! entry either links a leaf table (8192 x 64 KiB pages) or is empty.
//! Upper-half mappings are global; lower-half mappings are tagged with the
//! owning process's ASID, which also rides in the top bits of the root
//! pointer handed to the hardware.
//!
//! The struct itself carries no lock. The kernel's upper-half instance
//! lives behind one spin lock; each process's lower-half instance is
//! serialized by that process's user-memory lock.

use bit_field::BitField;

use crate::{arch, prelude::*, sync::SpinLock};

use super::{
    is_upper_half, pmem::PhysAllocator, vblock::VMemBlock, LinearWindow, PAGE_SIZE,
    UPPER_HALF_BASE,
};

const TABLE_ENTRIES: u64 = 8192;

const DESC_VALID: u64 = 1 << 0;
const DESC_TABLE: u64 = 1 << 1;
/// Table links and leaf pages both carry 0b11 in the low bits; blocks
/// (unused here) would carry 0b01.
const DESC_KIND_MASK: u64 = 0b11;

const PTE_ATTR_INDEX_RANGE: core::ops::Range<usize> = 2..5;
const PTE_AP_RANGE: core::ops::Range<usize> = 6..8;
const PTE_SH_INNER: u64 = 0b11 << 8;
const PTE_ACCESS: u64 = 1 << 10;
const PTE_NOT_GLOBAL: u64 = 1 << 11;
const PTE_PXN: u64 = 1 << 53;
const PTE_UXN: u64 = 1 << 54;

const AP_PRIV_RW: u64 = 0b00;
const AP_USER_RW: u64 = 0b01;
const AP_PRIV_RO: u64 = 0b10;
const AP_USER_RO: u64 = 0b11;

/// 64 KiB granule output address field.
const PTE_PADDR_MASK: u64 = 0x0000_ffff_ffff_0000;

/// MAIR index assignments.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryType {
    #[default]
    NormalWriteBack = 0,
    NormalWriteThrough = 1,
    NormalNonCached = 2,
    Device = 3,
    DeviceNgnre = 4,
}

/// Attributes of one leaf mapping.
#[derive(Debug, Clone, Copy)]
pub struct PageAttrs {
    pub user: bool,
    pub write: bool,
    pub exec: bool,
    pub memory_type: MemoryType,
    pub global: bool,
}

impl PageAttrs {
    /// Attributes for lazily mapping a page of `block`. Upper-half blocks
    /// are global.
    pub fn from_block(block: &VMemBlock) -> Self {
        PageAttrs {
            user: block.user(),
            write: block.write(),
            exec: block.exec(),
            memory_type: block.tag.memory_type(),
            global: is_upper_half(block.base),
        }
    }

    fn encode(&self) -> u64 {
        let mut pte = DESC_VALID | DESC_TABLE | PTE_SH_INNER | PTE_ACCESS;
        pte.set_bits(PTE_ATTR_INDEX_RANGE, self.memory_type as u64);
        let ap = match (self.user, self.write) {
            (false, true) => AP_PRIV_RW,
            (false, false) => AP_PRIV_RO,
            (true, true) => AP_USER_RW,
            (true, false) => AP_USER_RO,
        };
        pte.set_bits(PTE_AP_RANGE, ap);
        if !self.exec {
            pte |= PTE_PXN | PTE_UXN;
        }
        if !self.global {
            pte |= PTE_NOT_GLOBAL;
        }
        pte
    }
}

/// One half's translation table tree.
pub struct PageTable {
    root: Paddr,
    asid: u16,
    window: LinearWindow,
}

impl PageTable {
    /// Allocates and zeroes a root table. `asid` is 0 for the global
    /// upper-half table and the owning process id for lower halves.
    pub fn new(pmem: &PhysAllocator, window: LinearWindow, asid: u16) -> Result<Self> {
        let root = pmem.acquire(PAGE_SIZE)?;
        zero_table(&window, root.base);
        Ok(PageTable {
            root: root.base,
            asid,
            window,
        })
    }

    /// The value the hardware wants in its root register: table address
    /// with the ASID in the top bits.
    pub fn root_with_asid(&self) -> u64 {
        self.root | (self.asid as u64) << 48
    }

    pub fn root_paddr(&self) -> Paddr {
        self.root
    }

    /// Links `table` into root slot `slot` (used to share the fixed
    /// kernel-interface table into every process's topmost slot).
    pub fn link_shared_table(&mut self, slot: usize, table: Paddr) {
        debug_assert!((slot as u64) < TABLE_ENTRIES);
        let entry = self.root_entry_ptr(slot as u64);
        unsafe { entry.write_volatile(table | DESC_VALID | DESC_TABLE | PTE_ACCESS) };
    }

    /// Installs a 64 KiB leaf for `vaddr`.
    ///
    /// A missing leaf table is allocated from `pmem` and linked first; a
    /// zero `paddr` means "back it with a fresh frame". Fails if the leaf
    /// is already mapped. Returns the physical address actually mapped.
    pub fn map(
        &mut self,
        vaddr: Vaddr,
        paddr: Paddr,
        attrs: PageAttrs,
        pmem: &PhysAllocator,
    ) -> Result<Paddr> {
        let (l2, l3) = Self::indices(vaddr);

        let root_entry = self.root_entry_ptr(l2);
        let table_paddr = {
            let entry = unsafe { root_entry.read_volatile() };
            if entry & DESC_VALID == 0 {
                let table = pmem.acquire(PAGE_SIZE)?;
                zero_table(&self.window, table.base);
                unsafe {
                    root_entry.write_volatile(table.base | DESC_VALID | DESC_TABLE | PTE_ACCESS)
                };
                table.base
            } else {
                entry & PTE_PADDR_MASK
            }
        };

        let leaf = self.entry_ptr(table_paddr, l3);
        if unsafe { leaf.read_volatile() } & DESC_VALID != 0 {
            return_errno_with_message!(Errno::EEXIST, "leaf already mapped");
        }

        let paddr = if paddr == 0 {
            pmem.acquire(PAGE_SIZE)?.base
        } else {
            paddr
        };
        unsafe { leaf.write_volatile((paddr & PTE_PADDR_MASK) | attrs.encode()) };
        Ok(paddr)
    }

    /// Clears every leaf in `[start, start + len)`, invalidating the TLB
    /// per page and, when `release_pages`, returning each frame to
    /// `pmem`. Returns the physical frames that were mapped there, so
    /// callers can settle their owned-page accounting.
    pub fn unmap(
        &mut self,
        start: Vaddr,
        len: u64,
        release_pages: bool,
        pmem: &PhysAllocator,
    ) -> Vec<Paddr> {
        let mut vaddr = start & !(PAGE_SIZE - 1);
        let end = (start + len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let mut freed = Vec::new();

        while vaddr < end {
            let (l2, l3) = Self::indices(vaddr);
            let root_entry = unsafe { self.root_entry_ptr(l2).read_volatile() };
            if root_entry & DESC_KIND_MASK == DESC_VALID | DESC_TABLE {
                let leaf = self.entry_ptr(root_entry & PTE_PADDR_MASK, l3);
                let pte = unsafe { leaf.read_volatile() };
                if pte & DESC_VALID != 0 {
                    unsafe { leaf.write_volatile(0) };
                    self.invalidate(vaddr);
                    let frame = pte & PTE_PADDR_MASK;
                    freed.push(frame);
                    if release_pages {
                        pmem.release(super::PMemBlock {
                            base: frame,
                            length: PAGE_SIZE,
                            is_shared: false,
                        });
                    }
                }
            }
            vaddr += PAGE_SIZE;
        }
        freed
    }

    /// Walks the tables for `vaddr`; 0 when nothing is mapped there.
    pub fn vaddr_to_paddr(&self, vaddr: Vaddr) -> Paddr {
        let (l2, l3) = Self::indices(vaddr);
        let root_entry = unsafe { self.root_entry_ptr(l2).read_volatile() };
        if root_entry & DESC_KIND_MASK != DESC_VALID | DESC_TABLE {
            return 0;
        }
        let pte = unsafe { self.entry_ptr(root_entry & PTE_PADDR_MASK, l3).read_volatile() };
        if pte & DESC_KIND_MASK != DESC_VALID | DESC_TABLE {
            return 0;
        }
        (pte & PTE_PADDR_MASK) | (vaddr & (PAGE_SIZE - 1))
    }

    /// Raw leaf descriptor for `vaddr`, 0 when unmapped.
    pub fn pte(&self, vaddr: Vaddr) -> u64 {
        let (l2, l3) = Self::indices(vaddr);
        let root_entry = unsafe { self.root_entry_ptr(l2).read_volatile() };
        if root_entry & DESC_KIND_MASK != DESC_VALID | DESC_TABLE {
            return 0;
        }
        unsafe { self.entry_ptr(root_entry & PTE_PADDR_MASK, l3).read_volatile() }
    }

    /// Issues the TLB invalidate for one page.
    pub fn invalidate(&self, vaddr: Vaddr) {
        arch::tlb_invalidate_page(vaddr, self.asid);
    }

    /// Host-reachable pointer for a mapped page, via the linear window.
    /// Used when the kernel needs to write through a mapping it just
    /// created (e.g. crafting a new thread's initial stack frame).
    pub fn data_ptr(&self, vaddr: Vaddr) -> Option<*mut u8> {
        let paddr = self.vaddr_to_paddr(vaddr);
        (paddr != 0).then(|| self.window.paddr_to_ptr(paddr))
    }

    /// Releases every frame still mapped plus the table tree itself.
    /// Called on process destruction after the owned-page sweep.
    pub fn release_tree(self, pmem: &PhysAllocator) {
        for l2 in 0..TABLE_ENTRIES {
            let entry = unsafe { self.root_entry_ptr(l2).read_volatile() };
            if entry & DESC_KIND_MASK == DESC_VALID | DESC_TABLE {
                pmem.release(super::PMemBlock {
                    base: entry & PTE_PADDR_MASK,
                    length: PAGE_SIZE,
                    is_shared: false,
                });
            }
        }
        pmem.release(super::PMemBlock {
            base: self.root,
            length: PAGE_SIZE,
            is_shared: false,
        });
    }

    fn indices(vaddr: Vaddr) -> (u64, u64) {
        let rel = if is_upper_half(vaddr) {
            vaddr.wrapping_sub(UPPER_HALF_BASE)
        } else {
            vaddr
        };
        ((rel >> 29) & 0x1fff, (rel >> 16) & 0x1fff)
    }

    fn root_entry_ptr(&self, index: u64) -> *mut u64 {
        self.entry_ptr(self.root, index)
    }

    fn entry_ptr(&self, table: Paddr, index: u64) -> *mut u64 {
        debug_assert!(index < TABLE_ENTRIES);
        unsafe { (self.window.paddr_to_ptr(table) as *mut u64).add(index as usize) }
    }
}

fn zero_table(window: &LinearWindow, paddr: Paddr) {
    unsafe { core::ptr::write_bytes(window.paddr_to_ptr(paddr), 0, PAGE_SIZE as usize) };
}

/// The upper-half mapping state: one table tree plus its lock. Lower-half
/// trees live inside each process's user-memory state instead.
pub struct KernelPageTable {
    pub table: SpinLock<PageTable>,
}

impl KernelPageTable {
    pub fn new(pmem: &PhysAllocator, window: LinearWindow) -> Result<Self> {
        Ok(KernelPageTable {
            table: SpinLock::new(PageTable::new(pmem, window, 0)?),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mm::testing::TestDram;

    #[test]
    fn map_translate_unmap_round_trip() {
        let dram = TestDram::new(64);
        let mut pt = PageTable::new(&dram.pmem, dram.window, 0).unwrap();
        let vaddr = UPPER_HALF_BASE + 0x1234_0000;
        let attrs = PageAttrs {
            user: false,
            write: true,
            exec: false,
            memory_type: MemoryType::NormalWriteBack,
            global: true,
        };

        let paddr = pt.map(vaddr, 0, attrs, &dram.pmem).unwrap();
        assert_ne!(paddr, 0);
        assert_eq!(pt.vaddr_to_paddr(vaddr + 0x42), paddr + 0x42);

        pt.unmap(vaddr, PAGE_SIZE, false, &dram.pmem);
        assert_eq!(pt.vaddr_to_paddr(vaddr), 0);

        // A fresh map of the same leaf must succeed again.
        pt.map(vaddr, paddr, attrs, &dram.pmem).unwrap();
        assert_eq!(pt.vaddr_to_paddr(vaddr), paddr);
    }

    #[test]
    fn double_map_fails() {
        let dram = TestDram::new(64);
        let mut pt = PageTable::new(&dram.pmem, dram.window, 0).unwrap();
        let vaddr = UPPER_HALF_BASE + 0x8000_0000;
        let attrs = PageAttrs {
            user: false,
            write: true,
            exec: false,
            memory_type: MemoryType::NormalWriteBack,
            global: true,
        };
        pt.map(vaddr, 0, attrs, &dram.pmem).unwrap();
        assert_eq!(
            pt.map(vaddr, 0, attrs, &dram.pmem).unwrap_err().error(),
            Errno::EEXIST
        );
    }

    #[test]
    fn lower_half_ptes_carry_asid_and_ng() {
        let dram = TestDram::new(64);
        let mut pt = PageTable::new(&dram.pmem, dram.window, 7).unwrap();
        let attrs = PageAttrs {
            user: true,
            write: true,
            exec: false,
            memory_type: MemoryType::NormalWriteBack,
            global: false,
        };
        pt.map(0x40_0000, 0, attrs, &dram.pmem).unwrap();
        let pte = pt.pte(0x40_0000);
        assert_ne!(pte & PTE_NOT_GLOBAL, 0);
        assert_ne!(pte & (PTE_PXN | PTE_UXN), 0);
        assert_eq!(pt.root_with_asid() >> 48, 7);
    }

    #[test]
    fn mapped_page_is_readable_through_the_window() {
        let dram = TestDram::new(64);
        let mut pt = PageTable::new(&dram.pmem, dram.window, 0).unwrap();
        let vaddr = UPPER_HALF_BASE + 0x10_0000;
        let attrs = PageAttrs {
            user: false,
            write: true,
            exec: false,
            memory_type: MemoryType::NormalWriteBack,
            global: true,
        };
        pt.map(vaddr, 0, attrs, &dram.pmem).unwrap();
        let ptr = pt.data_ptr(vaddr).unwrap();
        unsafe {
            ptr.write(0xa5);
            assert_eq!(ptr.read(), 0xa5);
        }
    }

    #[test]
    fn unmap_with_release_returns_frames() {
        let dram = TestDram::new(64);
        let mut pt = PageTable::new(&dram.pmem, dram.window, 0).unwrap();
        let vaddr = UPPER_HALF_BASE + 0x20_0000;
        let attrs = PageAttrs {
            user: false,
            write: true,
            exec: false,
            memory_type: MemoryType::NormalWriteBack,
            global: true,
        };
        pt.map(vaddr, 0, attrs, &dram.pmem).unwrap();
        let free_before = dram.pmem.free_bytes();
        pt.unmap(vaddr, PAGE_SIZE, true, &dram.pmem);
        assert_eq!(dram.pmem.free_bytes(), free_before + PAGE_SIZE);
    }
}
