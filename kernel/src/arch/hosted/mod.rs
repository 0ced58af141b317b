// SPDX-License-Identifier: MPL-2.0

//! Hosted stand-ins for the aarch64 layer.
//!
//! IRQ masking, TLB maintenance and IPIs are no-ops here; the memory
//! barrier maps to an atomic fence so the locking protocol stays sound
//! when unit tests run threaded on the host.

use core::sync::atomic::{fence, Ordering};

pub(super) fn irq_is_local_enabled() -> bool {
    false
}

pub(super) fn irq_disable_local() {}

pub(super) fn irq_enable_local() {}

pub fn cpu_id() -> usize {
    0
}

pub fn memory_barrier() {
    fence(Ordering::SeqCst);
}

pub fn tlb_invalidate_page(_vaddr: u64, _asid: u16) {}

pub fn tlb_invalidate_all() {}

pub fn send_reschedule_ipi(_core: usize) {}

pub fn reschedule_self() {}

pub fn set_preemption_timer(_ticks: u64) {}

pub fn set_preemption_timer_us(_us: u64) {}
