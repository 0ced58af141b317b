// SPDX-License-Identifier: MPL-2.0

//! Translation-fault handling.
//!
//! A fault is either satisfied by lazily installing a page into the
//! faulting reservation, or converted into a thread fault (unprivileged)
//! or a core halt (privileged, unrecoverable). The handler touches only
//! the upper-half mapping lock or the faulting process's user-memory
//! lock; it never takes primitive or scheduler locks and never blocks.

use crate::{prelude::*, Kernel};

use super::{is_upper_half, page_table::PageAttrs, VMemBlock, PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
    Execute,
}

/// A data/instruction translation fault as decoded by the exception glue.
#[derive(Debug, Clone, Copy)]
pub struct TranslationFault {
    pub vaddr: Vaddr,
    pub access: FaultAccess,
    /// Whether the faulting context was user mode.
    pub from_user: bool,
}

/// What the exception glue should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A page was installed; return to the faulting instruction.
    Resolved,
    /// Terminate the faulting thread with the fault exit code.
    ThreadFault,
    /// Unrecoverable in a privileged context: halt this core.
    HaltCore,
}

impl Kernel {
    pub fn handle_translation_fault(&self, fault: &TranslationFault) -> FaultOutcome {
        log::debug!(
            "fault: {:?} {} at {:#x} ({})",
            fault.access,
            if fault.from_user { "user" } else { "kernel" },
            fault.vaddr,
            if is_upper_half(fault.vaddr) { "upper" } else { "lower" },
        );

        if is_upper_half(fault.vaddr) {
            self.handle_upper_fault(fault)
        } else {
            self.handle_lower_fault(fault)
        }
    }

    fn handle_upper_fault(&self, fault: &TranslationFault) -> FaultOutcome {
        if fault.from_user {
            // User access to the kernel half is always fatal to the thread.
            return FaultOutcome::ThreadFault;
        }

        let Some(block) = self.kernel_vblock.valid(fault.vaddr) else {
            log::error!("fault: no kernel reservation covers {:#x}", fault.vaddr);
            return FaultOutcome::HaltCore;
        };
        if let Some(outcome) = check_block(&block, fault, FaultOutcome::HaltCore) {
            return outcome;
        }

        log::debug!("fault: lazy kernel map at {:#x}", fault.vaddr);
        let mut pt = self.kernel_pt.table.lock();
        match pt.map(
            fault.vaddr & !(PAGE_SIZE - 1),
            0,
            PageAttrs::from_block(&block),
            &self.pmem,
        ) {
            Ok(_) => FaultOutcome::Resolved,
            Err(e) => {
                log::error!("fault: kernel lazy map failed: {:?}", e.error());
                FaultOutcome::HaltCore
            }
        }
    }

    fn handle_lower_fault(&self, fault: &TranslationFault) -> FaultOutcome {
        let escalated = if fault.from_user {
            FaultOutcome::ThreadFault
        } else {
            FaultOutcome::HaltCore
        };

        let Some(process) = self.current_process() else {
            log::error!("fault: lower-half fault with no current process");
            return escalated;
        };

        let mut um_guard = process.user_mem.lock();
        let Some(um) = um_guard.as_mut() else {
            log::error!("fault: lower-half fault in a process without user memory");
            return escalated;
        };

        let Some(block) = um.vblock.valid(fault.vaddr) else {
            log::warn!("fault: no user reservation covers {:#x}", fault.vaddr);
            return escalated;
        };
        if let Some(outcome) = check_block(&block, fault, escalated) {
            return outcome;
        }

        log::debug!("fault: lazy user map at {:#x}", fault.vaddr);
        match um.pt.map(
            fault.vaddr & !(PAGE_SIZE - 1),
            0,
            PageAttrs::from_block(&block),
            &self.pmem,
        ) {
            Ok(paddr) => {
                process.owned_pages.lock().add(&super::PMemBlock {
                    base: paddr,
                    length: PAGE_SIZE,
                    is_shared: false,
                });
                FaultOutcome::Resolved
            }
            Err(e) => {
                log::error!("fault: user lazy map failed: {:?}", e.error());
                escalated
            }
        }
    }
}

/// Guard hits and access-kind mismatches are never mapped.
fn check_block(
    block: &VMemBlock,
    fault: &TranslationFault,
    escalated: FaultOutcome,
) -> Option<FaultOutcome> {
    if block.in_guard(fault.vaddr) {
        log::error!("fault: guard page hit at {:#x}", fault.vaddr);
        return Some(escalated);
    }
    let mismatch = match fault.access {
        FaultAccess::Read => false,
        FaultAccess::Write => !block.write(),
        FaultAccess::Execute => !block.exec(),
    };
    if mismatch || (fault.from_user && !block.user()) {
        log::error!(
            "fault: access {:?} disagrees with reservation at {:#x}",
            fault.access,
            fault.vaddr
        );
        return Some(escalated);
    }
    None
}
