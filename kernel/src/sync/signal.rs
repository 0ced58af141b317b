// SPDX-License-Identifier: MPL-2.0

//! The simple signal: a 32-bit value with a single designated waiter.
//!
//! Signals back the kernel's deferred-return protocol (a syscall parks the
//! caller on its private signal until a worker thread posts the result)
//! and, through thin wrappers, the binary and counting semaphores.

use crate::{
    task::thread::{BlockedOn, ThreadId},
    time::KernelTime,
    Kernel,
};

use super::SpinLock;

/// The read-modify-write applied to the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigOp {
    Noop,
    Set,
    Or,
    And,
    Xor,
    Add,
    Sub,
    /// Saturating add: only applied while the value is below the maximum.
    /// This is what a counting-semaphore post uses.
    AddIfLessThanMax,
}

struct SignalInner {
    value: u32,
    max_value: u32,
    waiter: Option<ThreadId>,
}

pub struct SimpleSignal {
    inner: SpinLock<SignalInner>,
}

impl SimpleSignal {
    pub const fn new(value: u32, max_value: u32) -> Self {
        SimpleSignal {
            inner: SpinLock::new(SignalInner {
                value,
                max_value,
                waiter: None,
            }),
        }
    }

    pub fn value(&self) -> u32 {
        self.inner.lock().value
    }

    /// Consumes the value if it is non-zero: applies `op` with `operand`
    /// and returns the pre-op value. Otherwise registers the caller as the
    /// single waiter, blocks it (until `timeout`) and returns `None`; the
    /// caller re-tries after it resumes.
    pub fn wait(
        &self,
        k: &Kernel,
        op: SigOp,
        operand: u32,
        timeout: Option<KernelTime>,
    ) -> Option<u32> {
        let mut inner = self.inner.lock();
        if inner.value != 0 {
            let pre = inner.value;
            apply(&mut inner, op, operand);
            return Some(pre);
        }

        let current = k.current_thread().expect("signal wait without a current thread");
        if let Some(other) = inner.waiter {
            if other != current.id {
                log::error!("signal: second waiter {} displaces {}", current.id, other);
            }
        }
        inner.waiter = Some(current.id);
        current.blocking.lock().block(BlockedOn::Signal, timeout);
        drop(inner);

        k.sched.yield_now();
        None
    }

    /// One non-blocking attempt: `Some(pre)` on a non-zero value.
    pub fn wait_once(&self, op: SigOp, operand: u32) -> Option<u32> {
        let mut inner = self.inner.lock();
        if inner.value == 0 {
            return None;
        }
        let pre = inner.value;
        apply(&mut inner, op, operand);
        Some(pre)
    }

    /// Mutates the value, then wakes the registered waiter if the value
    /// ended up non-zero (the wake edge is the transition to non-zero).
    pub fn signal(&self, k: &Kernel, op: SigOp, operand: u32) {
        let mut inner = self.inner.lock();
        apply(&mut inner, op, operand);
        let waiter = (inner.value != 0).then(|| inner.waiter.take()).flatten();
        drop(inner);

        if let Some(id) = waiter {
            super::wake_thread(k, id);
        }
    }
}

fn apply(inner: &mut SignalInner, op: SigOp, operand: u32) {
    let v = inner.value;
    inner.value = match op {
        SigOp::Noop => v,
        SigOp::Set => operand,
        SigOp::Or => v | operand,
        SigOp::And => v & operand,
        SigOp::Xor => v ^ operand,
        SigOp::Add => v.saturating_add(operand),
        SigOp::Sub => v.saturating_sub(operand),
        SigOp::AddIfLessThanMax => {
            if v < inner.max_value {
                v.saturating_add(operand).min(inner.max_value)
            } else {
                v
            }
        }
    };
}

/// A one-slot signal: set by `signal`, consumed whole by `wait`.
pub struct BinarySemaphore {
    ss: SimpleSignal,
}

impl BinarySemaphore {
    pub const fn new() -> Self {
        BinarySemaphore {
            ss: SimpleSignal::new(0, 1),
        }
    }

    pub fn wait(&self, k: &Kernel, timeout: Option<KernelTime>) -> bool {
        self.ss.wait(k, SigOp::Set, 0, timeout).is_some()
    }

    pub fn wait_once(&self) -> bool {
        self.ss.wait_once(SigOp::Set, 0).is_some()
    }

    pub fn signal(&self, k: &Kernel) {
        self.ss.signal(k, SigOp::Set, 1);
    }

    pub fn clear(&self) {
        self.ss.wait_once(SigOp::Set, 0);
    }

    pub fn value(&self) -> bool {
        self.ss.value() != 0
    }
}

/// A counter that saturates at `u32::MAX`; posts use the
/// add-if-less-than-max op so a flood of signals cannot wrap.
pub struct CountingSemaphore {
    ss: SimpleSignal,
}

impl CountingSemaphore {
    pub const fn new(value: u32) -> Self {
        CountingSemaphore {
            ss: SimpleSignal::new(value, u32::MAX),
        }
    }

    pub fn wait(&self, k: &Kernel, timeout: Option<KernelTime>) -> bool {
        self.ss.wait(k, SigOp::Sub, 1, timeout).is_some()
    }

    pub fn wait_once(&self) -> bool {
        self.ss.wait_once(SigOp::Sub, 1).is_some()
    }

    pub fn signal(&self, k: &Kernel) {
        self.ss.signal(k, SigOp::AddIfLessThanMax, 1);
    }

    pub fn value(&self) -> u32 {
        self.ss.value()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ops_apply_to_nonzero_values_only_on_wait() {
        let ss = SimpleSignal::new(0b1100, u32::MAX);
        assert_eq!(ss.wait_once(SigOp::And, 0b0100), Some(0b1100));
        assert_eq!(ss.value(), 0b0100);
        assert_eq!(ss.wait_once(SigOp::Set, 0), Some(0b0100));
        // Now zero: no consumption.
        assert_eq!(ss.wait_once(SigOp::Set, 7), None);
        assert_eq!(ss.value(), 0);
    }

    #[test]
    fn add_if_less_than_max_saturates() {
        let ss = SimpleSignal::new(0, 2);
        for _ in 0..5 {
            let mut inner = ss.inner.lock();
            apply(&mut inner, SigOp::AddIfLessThanMax, 1);
        }
        assert_eq!(ss.value(), 2);
    }

    #[test]
    fn counting_semaphore_counts_down() {
        let cs = CountingSemaphore::new(2);
        assert!(cs.wait_once());
        assert!(cs.wait_once());
        assert!(!cs.wait_once());
    }

    #[test]
    fn binary_semaphore_consumes_whole() {
        let bs = BinarySemaphore::new();
        assert!(!bs.wait_once());
        {
            let mut inner = bs.ss.inner.lock();
            apply(&mut inner, SigOp::Set, 1);
        }
        assert!(bs.value());
        assert!(bs.wait_once());
        assert!(!bs.value());
    }
}
