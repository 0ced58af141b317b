// SPDX-License-Identifier: MPL-2.0

use super::super::ThreadContext;

core::arch::global_asm!(
    "
    .global __kestrel_context_switch
    // x0: *mut ThreadContext (save), x1: *const ThreadContext (load)
__kestrel_context_switch:
    mrs x9, sp_el0
    mov x10, sp
    stp x9, x10, [x0, #0x00]
    stp x19, x20, [x0, #0x10]
    stp x21, x22, [x0, #0x20]
    stp x23, x24, [x0, #0x30]
    stp x25, x26, [x0, #0x40]
    stp x27, x28, [x0, #0x50]
    mrs x9, ttbr0_el1
    mrs x10, tpidr_el0
    stp x9, x10, [x0, #0x60]
    stp q8, q9, [x0, #0x80]
    stp q10, q11, [x0, #0xa0]
    stp q12, q13, [x0, #0xc0]
    stp q14, q15, [x0, #0xe0]
    stp q16, q17, [x0, #0x100]
    stp q18, q19, [x0, #0x120]
    stp q20, q21, [x0, #0x140]
    stp q22, q23, [x0, #0x160]
    stp q24, q25, [x0, #0x180]
    stp q26, q27, [x0, #0x1a0]
    stp q28, q29, [x0, #0x1c0]
    stp q30, q31, [x0, #0x1e0]

    ldp x9, x10, [x1, #0x00]
    msr sp_el0, x9
    mov sp, x10
    ldp x19, x20, [x1, #0x10]
    ldp x21, x22, [x1, #0x20]
    ldp x23, x24, [x1, #0x30]
    ldp x25, x26, [x1, #0x40]
    ldp x27, x28, [x1, #0x50]
    ldp x9, x10, [x1, #0x60]
    msr ttbr0_el1, x9
    msr tpidr_el0, x10
    ldp q8, q9, [x1, #0x80]
    ldp q10, q11, [x1, #0xa0]
    ldp q12, q13, [x1, #0xc0]
    ldp q14, q15, [x1, #0xe0]
    ldp q16, q17, [x1, #0x100]
    ldp q18, q19, [x1, #0x120]
    ldp q20, q21, [x1, #0x140]
    ldp q22, q23, [x1, #0x160]
    ldp q24, q25, [x1, #0x180]
    ldp q26, q27, [x1, #0x1a0]
    ldp q28, q29, [x1, #0x1c0]
    ldp q30, q31, [x1, #0x1e0]
    isb
    ret
"
);

extern "C" {
    fn __kestrel_context_switch(cur: *mut ThreadContext, next: *const ThreadContext);
}

/// Saves the callee-owned state into `cur` and resumes `next`.
///
/// # Safety
///
/// Both contexts must describe live kernel stacks, and `next` must have
/// been initialized by thread creation or a previous save.
pub unsafe fn context_switch(cur: *mut ThreadContext, next: *const ThreadContext) {
    unsafe { __kestrel_context_switch(cur, next) }
}
