//! Defines the debug console that logs to the serial port.

use core::{fmt::Write, sync::atomic::AtomicBool};

#[cfg(debug_assertions)]
use log::LevelFilter;
use spin::{Mutex, Once};

use crate::serial::SerialWriter;

pub struct Console {
    has_output: AtomicBool,
    serial: Mutex<Option<SerialWriter>>,
}

static DEFAULT: Once<Console> = Once::new();

impl Console {
    pub fn init() -> &'static Self {
        let console = Self::default();
        console.install();
        console
    }

    pub fn default() -> &'static Self {
        DEFAULT.call_once(|| Console {
            has_output: AtomicBool::new(false),
            serial: Mutex::new(None),
        })
    }

    pub fn install(&'static self) {
        log::set_logger(self).unwrap();

        #[cfg(debug_assertions)]
        log::set_max_level(LevelFilter::Trace);

        #[cfg(not(debug_assertions))]
        log::set_max_level(LevelFilter::Info);
    }

    pub fn has_output(&self) -> bool {
        self.has_output.load(core::sync::atomic::Ordering::SeqCst)
    }

    pub fn attach_serial(&self, serial: SerialWriter) {
        let _irqs_off = task::arch::disable_irqs();
        let mut guard = self.serial.lock();
        *guard = Some(serial);
        self.has_output
            .store(true, core::sync::atomic::Ordering::SeqCst);
    }

    /// Writes program output as-is, without the log line framing.
    pub fn write_bytes(&self, bytes: &[u8]) {
        let _irqs_off = task::arch::disable_irqs();
        if let Some(serial) = &mut *self.serial.lock() {
            serial.write_bytes(bytes);
        }
    }
}

impl log::Log for Console {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        // An interrupt taken while the lock is held would spin on it forever
        // on a single CPU, so holders keep IRQs off.
        let _irqs_off = task::arch::disable_irqs();
        if let Some(serial) = &mut *self.serial.lock() {
            write_log_entry_to(serial, record).unwrap();
        }
    }

    fn flush(&self) {}
}

fn write_log_entry_to(
    writer: &mut impl core::fmt::Write,
    record: &log::Record,
) -> core::fmt::Result {
    #[cfg(any(debug_assertions, feature = "detailed-logging"))]
    return writeln!(
        writer,
        "[{} {}:{} {}] {}",
        record.level(),
        record.file().unwrap_or("unknown"),
        record.line().unwrap_or(0),
        record.target(),
        record.args()
    );
    #[cfg(not(any(debug_assertions, feature = "detailed-logging")))]
    return writeln!(writer, "[{:5}] {}", record.level(), record.args());
}
