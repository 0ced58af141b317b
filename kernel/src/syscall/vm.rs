// SPDX-License-Identifier: MPL-2.0

//! Virtual-memory syscalls.

use bitflags::bitflags;

use crate::{
    mm::{page_table::PageAttrs, BlockTag, GuardClass, TagFlags, VBlock, PAGE_SIZE},
    prelude::*,
    Kernel,
};

bitflags! {
    /// Protection bits of a user mapping.
    pub struct MmapProt: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

fn tag_for(prot: MmapProt, file_backed: bool) -> BlockTag {
    let mut flags = TagFlags::USER;
    if prot.contains(MmapProt::WRITE) {
        flags |= TagFlags::WRITE;
    }
    if prot.contains(MmapProt::EXEC) {
        flags |= TagFlags::EXEC;
    }
    if file_backed {
        flags |= TagFlags::FILE_BACKED;
    }
    BlockTag::new(flags, GuardClass::None, GuardClass::None)
}

/// Reserves a lower-half range; pages materialize on first touch through
/// the fault handler. Returns the base of the reservation.
pub fn sys_mmap(
    k: &Kernel,
    len: u64,
    prot: MmapProt,
    fixed_addr: Option<Vaddr>,
    file_backed: bool,
) -> Result<Vaddr> {
    let size = VBlock::size_for(len).ok_or(Error::new(Errno::EINVAL))?;
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;

    let um_guard = process.user_mem.lock();
    let Some(um) = um_guard.as_ref() else {
        return_errno_with_message!(Errno::EINVAL, "mmap in a process without user memory");
    };

    let tag = tag_for(prot, file_backed);
    let block = match fixed_addr {
        Some(addr) => um.vblock.alloc_fixed(size, addr, tag)?,
        None => um.vblock.alloc(size, tag)?,
    };
    Ok(block.base)
}

/// Drops the reservation containing `addr`, unmapping and releasing every
/// page that had materialized in it.
pub fn sys_munmap(k: &Kernel, addr: Vaddr, len: u64) -> Result<()> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;

    let mut um_guard = process.user_mem.lock();
    let Some(um) = um_guard.as_mut() else {
        return_errno!(Errno::EINVAL);
    };

    let Some(block) = um.vblock.valid(addr) else {
        return_errno!(Errno::EINVAL);
    };
    if block.base != addr || block.length < len {
        return_errno!(Errno::EINVAL);
    }

    let freed = um
        .pt
        .unmap(block.data_start(), block.data_length(), true, &k.pmem);
    {
        let mut owned = process.owned_pages.lock();
        for paddr in freed {
            owned.remove(paddr, PAGE_SIZE);
        }
    }
    um.vblock.free(&block)
}

/// Queries (`new_brk == 0`) or moves the program break.
pub fn sys_brk(k: &Kernel, new_brk: Vaddr) -> Result<Vaddr> {
    k.process_brk(new_brk)
}

/// Changes the access bits of the reservation containing `addr` and
/// re-encodes every page already materialized in it.
pub fn sys_mprotect(k: &Kernel, addr: Vaddr, prot: MmapProt) -> Result<()> {
    let process = k.current_process().ok_or(Error::new(Errno::ESRCH))?;

    let mut um_guard = process.user_mem.lock();
    let Some(um) = um_guard.as_mut() else {
        return_errno!(Errno::EINVAL);
    };

    let Some(old) = um.vblock.valid(addr) else {
        return_errno!(Errno::EINVAL);
    };
    let file_backed = old.tag.flags().contains(TagFlags::FILE_BACKED);
    let block = um.vblock.update_tag(addr, tag_for(prot, file_backed))?;

    let attrs = PageAttrs::from_block(&block);
    let mut vaddr = block.data_start();
    while vaddr < block.data_end() {
        let paddr = um.pt.vaddr_to_paddr(vaddr) & !(PAGE_SIZE - 1);
        if paddr != 0 {
            um.pt.unmap(vaddr, PAGE_SIZE, false, &k.pmem);
            um.pt.map(vaddr, paddr, attrs, &k.pmem)?;
        }
        vaddr += PAGE_SIZE;
    }
    Ok(())
}
