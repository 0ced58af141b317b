// SPDX-License-Identifier: MPL-2.0

//! Inter-thread message passing.

mod event;
mod queue;

pub use event::Event;
pub use queue::FixedQueue;
