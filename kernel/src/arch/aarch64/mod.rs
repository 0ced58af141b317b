// SPDX-License-Identifier: MPL-2.0

//! aarch64 (ARMv8-A, EL1) support: DAIF masking, barriers, TLB
//! maintenance, the generic timer and GICv3 SGIs.

mod switch;

use core::arch::asm;

pub use switch::context_switch;

/// SGI number used to request a reschedule on a core.
pub const SGI_RESCHEDULE: u64 = 1;

pub(super) fn irq_is_local_enabled() -> bool {
    let daif: u64;
    unsafe {
        asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack));
    }
    daif & (1 << 7) == 0
}

pub(super) fn irq_disable_local() {
    unsafe {
        asm!("msr daifset, #0b0010", options(nomem, nostack));
    }
}

pub(super) fn irq_enable_local() {
    unsafe {
        asm!("msr daifclr, #0b0010", options(nomem, nostack));
    }
}

/// Returns the id of the executing core (Aff0 of MPIDR_EL1).
pub fn cpu_id() -> usize {
    let mpidr: u64;
    unsafe {
        asm!("mrs {}, mpidr_el1", out(reg) mpidr, options(nomem, nostack));
    }
    (mpidr & 0xff) as usize
}

/// Reads the generic counter and its frequency.
pub fn counter() -> (u64, u64) {
    let cnt: u64;
    let frq: u64;
    unsafe {
        asm!(
            "isb",
            "mrs {cnt}, cntpct_el0",
            "mrs {frq}, cntfrq_el0",
            cnt = out(reg) cnt,
            frq = out(reg) frq,
            options(nomem, nostack)
        );
    }
    (cnt, frq)
}

/// Data memory barrier, inner shareable. Issued on lock release and before
/// waking a waiter so the woken core observes the protected writes.
pub fn memory_barrier() {
    unsafe {
        asm!("dmb ish", options(nostack));
    }
}

/// Invalidates the TLB entry for one 64 KiB page.
///
/// Upper-half pages are global, so `vae1is` ignores the ASID for them and
/// behaves like `vaae1is`.
pub fn tlb_invalidate_page(vaddr: u64, asid: u16) {
    let arg = (vaddr >> 12) | ((asid as u64) << 48);
    unsafe {
        asm!(
            "dsb ishst",
            "tlbi vae1is, {arg}",
            "dsb ish",
            "isb",
            arg = in(reg) arg,
            options(nostack)
        );
    }
}

/// Invalidates the whole TLB on every core of the inner shareable domain.
pub fn tlb_invalidate_all() {
    unsafe {
        asm!("dsb ishst", "tlbi vmalle1is", "dsb ish", "isb", options(nostack));
    }
}

/// Sends the reschedule SGI to one core (Aff0 = `core`, cluster 0).
pub fn send_reschedule_ipi(core: usize) {
    let val = (1u64 << (core & 0xf)) | (SGI_RESCHEDULE << 24);
    unsafe {
        asm!("msr icc_sgi1r_el1, {}", "isb", in(reg) val, options(nostack));
    }
}

/// Requests a reschedule on the executing core.
pub fn reschedule_self() {
    send_reschedule_ipi(cpu_id());
}

/// Programs the per-core timer to fire after `us` microseconds.
pub fn set_preemption_timer_us(us: u64) {
    let (_, frq) = counter();
    set_preemption_timer(us.saturating_mul(frq) / 1_000_000);
}

/// Programs the per-core timer to fire after `ticks` counter increments.
pub fn set_preemption_timer(ticks: u64) {
    unsafe {
        asm!(
            "msr cntp_tval_el0, {ticks}",
            "mov {tmp}, #1",
            "msr cntp_ctl_el0, {tmp}",
            ticks = in(reg) ticks,
            tmp = out(reg) _,
            options(nomem, nostack)
        );
    }
}

/// Installs the page-table roots for the executing core.
///
/// # Safety
///
/// `ttbr1` must point to a valid upper-half table; `ttbr0` must be zero or
/// point to a valid lower-half table with its ASID in the top bits.
pub unsafe fn install_page_table_roots(ttbr0: u64, ttbr1: u64) {
    unsafe {
        asm!(
            "msr ttbr0_el1, {t0}",
            "msr ttbr1_el1, {t1}",
            "isb",
            "tlbi vmalle1is",
            "dsb ish",
            "isb",
            t0 = in(reg) ttbr0,
            t1 = in(reg) ttbr1,
            options(nostack)
        );
    }
}
