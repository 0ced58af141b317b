// SPDX-License-Identifier: MPL-2.0

//! Input events delivered to a process through its bounded event queue.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    KeyDown { code: u16 },
    KeyUp { code: u16 },
    Pointer { x: u16, y: u16, buttons: u8 },
    FocusGained,
    FocusLost,
    Quit,
}
