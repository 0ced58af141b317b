// SPDX-License-Identifier: MPL-2.0

//! The numbered syscall vector.
//!
//! The dispatcher and user-memory marshalling live outside the core; this
//! module fixes the numbering and provides the typed handler behind each
//! number. Handlers return `Result`; the dispatcher encodes an `Err` as a
//! negative integer with the error kind in the caller's out-parameter.

mod proc;
mod sync_calls;
mod vm;

pub use proc::*;
pub use sync_calls::*;
pub use vm::*;

use crate::time::KernelTime;

/// The syscall numbers consumed by the dispatch table.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallNumber {
    ProcessCreate = 0x01,
    ProcessKill = 0x02,
    ProcessWait = 0x03,
    GetPpid = 0x04,

    ThreadCreate = 0x10,
    ThreadExit = 0x11,
    ThreadJoin = 0x12,
    ThreadSetName = 0x13,
    ThreadSetPriority = 0x14,
    ThreadGetPriority = 0x15,

    MutexInit = 0x20,
    MutexDestroy = 0x21,
    MutexTryLock = 0x22,
    MutexUnlock = 0x23,

    RwLockInit = 0x30,
    RwLockDestroy = 0x31,
    RwLockTryRdLock = 0x32,
    RwLockTryWrLock = 0x33,
    RwLockUnlock = 0x34,

    CondInit = 0x40,
    CondDestroy = 0x41,
    CondTimedWait = 0x42,
    CondSignal = 0x43,

    SemInit = 0x50,
    SemDestroy = 0x51,
    SemGetValue = 0x52,
    SemPost = 0x53,
    SemTryWait = 0x54,

    TlsKeyCreate = 0x60,
    TlsKeyDelete = 0x61,
    TlsSetSpecific = 0x62,
    TlsGetSpecific = 0x63,

    SchedGetPriorityMin = 0x70,
    SchedGetPriorityMax = 0x71,

    Mmap = 0x80,
    Munmap = 0x81,
    Mprotect = 0x82,
    Brk = 0x83,
}

impl TryFrom<u32> for SyscallNumber {
    type Error = crate::error::Error;

    fn try_from(no: u32) -> crate::prelude::Result<Self> {
        use SyscallNumber::*;
        Ok(match no {
            0x01 => ProcessCreate,
            0x02 => ProcessKill,
            0x03 => ProcessWait,
            0x04 => GetPpid,
            0x10 => ThreadCreate,
            0x11 => ThreadExit,
            0x12 => ThreadJoin,
            0x13 => ThreadSetName,
            0x14 => ThreadSetPriority,
            0x15 => ThreadGetPriority,
            0x20 => MutexInit,
            0x21 => MutexDestroy,
            0x22 => MutexTryLock,
            0x23 => MutexUnlock,
            0x30 => RwLockInit,
            0x31 => RwLockDestroy,
            0x32 => RwLockTryRdLock,
            0x33 => RwLockTryWrLock,
            0x34 => RwLockUnlock,
            0x40 => CondInit,
            0x41 => CondDestroy,
            0x42 => CondTimedWait,
            0x43 => CondSignal,
            0x50 => SemInit,
            0x51 => SemDestroy,
            0x52 => SemGetValue,
            0x53 => SemPost,
            0x54 => SemTryWait,
            0x60 => TlsKeyCreate,
            0x61 => TlsKeyDelete,
            0x62 => TlsSetSpecific,
            0x63 => TlsGetSpecific,
            0x70 => SchedGetPriorityMin,
            0x71 => SchedGetPriorityMax,
            0x80 => Mmap,
            0x81 => Munmap,
            0x82 => Mprotect,
            0x83 => Brk,
            _ => return Err(crate::error::Error::new(crate::error::Errno::ENOSYS)),
        })
    }
}

/// The clock against which a caller-supplied deadline is interpreted.
/// `TryOnce` means "do not block at all".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClock {
    TryOnce,
    Monotonic,
    Realtime,
}

/// Folds the (clock, deadline) pair of the syscall ABI into the core's
/// (block, absolute deadline) convention. Realtime deadlines are already
/// rebased to the monotonic clock by the dispatcher.
pub fn blocking_mode(
    clock: TimeoutClock,
    deadline: Option<KernelTime>,
) -> (bool, Option<KernelTime>) {
    match clock {
        TimeoutClock::TryOnce => (false, None),
        TimeoutClock::Monotonic | TimeoutClock::Realtime => (true, deadline),
    }
}
