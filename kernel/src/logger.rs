// SPDX-License-Identifier: MPL-2.0

//! Kernel logging: the `log` facade backend.
//!
//! Records are rendered with a monotonic timestamp and handed to a
//! registered console sink; the UART/RTT driver outside the core attaches
//! itself with [`register_console_sink`]. Without a sink, records are
//! dropped silently.

use log::{LevelFilter, Metadata, Record};

use crate::sync::SpinLock;

/// Where rendered log lines go.
pub type ConsoleSink = fn(&str);

static CONSOLE_SINK: SpinLock<Option<ConsoleSink>> = SpinLock::new(None);

pub fn register_console_sink(sink: ConsoleSink) {
    *CONSOLE_SINK.lock() = Some(sink);
}

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let sink = match *CONSOLE_SINK.lock() {
            Some(sink) => sink,
            None => return,
        };
        let us = crate::try_kernel().map_or(0, |k| k.clock.now().as_us());
        let line = alloc::format!(
            "[{:>6}.{:06}] {:<5}: {}\n",
            us / 1_000_000,
            us % 1_000_000,
            record.level(),
            record.args()
        );
        sink(&line);
    }

    fn flush(&self) {}
}

pub(crate) fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}
