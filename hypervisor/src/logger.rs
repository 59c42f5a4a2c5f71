//! Provides a serial port logger implementation.
//!
//! Exit handlers run in host kernel context where there is no console to write
//! to, so `log` records are pushed out of a 16550 UART. The logger is installed
//! once and later calls to [`init`] only adjust the level.

use {
    alloc::boxed::Box,
    core::{fmt, fmt::Write},
    spin::{Mutex, Once},
};

/// UART register offsets
const UART_OFFSET_DATA: u16 = 0x0;
const UART_OFFSET_INTERRUPT_ENABLE: u16 = 0x1;
const UART_OFFSET_FIFO_CONTROL: u16 = 0x2;
const UART_OFFSET_LINE_CONTROL: u16 = 0x3;
const UART_OFFSET_MODEM_CONTROL: u16 = 0x4;
const UART_OFFSET_LINE_STATUS: u16 = 0x5;
const UART_OFFSET_TRANSMITTER_HOLDING_BUFFER: u16 = 0x0;

/// Line status: transmitter holding register empty.
const UART_LSR_THRE: u8 = 0x20;

static SERIAL_LOGGER: Once<&'static SerialLogger> = Once::new();

/// Initialize the serial logger and install it as the global `log` logger.
///
/// Idempotent: once a logger is installed, further calls only update the max level.
pub fn init(port: SerialPort, level: log::LevelFilter) {
    let mut installed_now = false;

    let logger = SERIAL_LOGGER.call_once(|| {
        installed_now = true;
        let logger: &'static SerialLogger = Box::leak(Box::new(SerialLogger::new(port)));
        logger.port.lock().init();
        logger
    });

    // Another logger may already own the facade; keep ours reachable through
    // `global_logger()` and just apply the level.
    if installed_now {
        let _ = log::set_logger(*logger);
    }

    log::set_max_level(level);
}

/// Serial ports supported by the logger.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SerialPort {
    /// COM1 (0x3F8)
    COM1 = 0x3F8,
    /// COM2 (0x2F8)
    COM2 = 0x2F8,
}

/// The logger installed into the `log` facade.
pub struct SerialLogger {
    port: Mutex<Serial>,
}

impl SerialLogger {
    fn new(port: SerialPort) -> Self {
        Self {
            port: Mutex::new(Serial { port }),
        }
    }
}

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let mut serial = self.port.lock();
            let _ = write_record(&mut *serial, apic_id(), record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Formats one log line as `cpu-<apic id> <LEVEL>: <message>`.
pub fn write_record<W: Write>(out: &mut W, cpu: u32, level: log::Level, args: &fmt::Arguments<'_>) -> fmt::Result {
    writeln!(out, "cpu-{} {}: {}", cpu, level, args)
}

/// Low-level serial writer.
struct Serial {
    port: SerialPort,
}

impl Serial {
    fn init(&mut self) {
        let base = self.port as u16;

        unsafe {
            // Disable interrupts
            x86::io::outb(base + UART_OFFSET_INTERRUPT_ENABLE, 0x00);
            // Enable DLAB
            x86::io::outb(base + UART_OFFSET_LINE_CONTROL, 0x80);
            // Divisor = 3 -> 38400 baud
            x86::io::outb(base + UART_OFFSET_DATA, 0x03);
            x86::io::outb(base + UART_OFFSET_INTERRUPT_ENABLE, 0x00);
            // 8 bits, no parity, one stop bit
            x86::io::outb(base + UART_OFFSET_LINE_CONTROL, 0x03);
            // Enable FIFO, clear, 14-byte threshold
            x86::io::outb(base + UART_OFFSET_FIFO_CONTROL, 0xC7);
            // IRQs enabled, RTS/DSR set
            x86::io::outb(base + UART_OFFSET_MODEM_CONTROL, 0x0B);
        }
    }

    fn write_byte(&mut self, byte: u8) {
        let base = self.port as u16;
        unsafe {
            while (x86::io::inb(base + UART_OFFSET_LINE_STATUS) & UART_LSR_THRE) == 0 {}
            x86::io::outb(base + UART_OFFSET_TRANSMITTER_HOLDING_BUFFER, byte);
        }
    }
}

impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            if b == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(b);
        }
        Ok(())
    }
}

/// Returns the current processor APIC ID so lines can be told apart per CPU.
fn apic_id() -> u32 {
    x86::cpuid::cpuid!(0x1).ebx >> 24
}

/// Convenience getter if some other part of the monitor wants to log manually.
pub fn global_logger() -> Option<&'static SerialLogger> {
    SERIAL_LOGGER.get().copied()
}
