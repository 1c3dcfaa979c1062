//! 16550 UART driver for the COM1 debug console.
//!
//! The serial console is a log sink only; line input and the mirrored
//! shell live outside the kernel core.

use core::fmt;

use spin::Mutex;
use x86_64::instructions::port::Port;

const COM1_BASE: u16 = 0x3F8;

pub struct SerialPort {
    data: Port<u8>,
    int_enable: Port<u8>,
    fifo_ctrl: Port<u8>,
    line_ctrl: Port<u8>,
    modem_ctrl: Port<u8>,
    line_status: Port<u8>,
}

impl SerialPort {
    const fn new(base: u16) -> Self {
        SerialPort {
            data: Port::new(base),
            int_enable: Port::new(base + 1),
            fifo_ctrl: Port::new(base + 2),
            line_ctrl: Port::new(base + 3),
            modem_ctrl: Port::new(base + 4),
            line_status: Port::new(base + 5),
        }
    }

    /// Program 115200 8N1 with FIFOs enabled.
    fn init(&mut self) {
        unsafe {
            self.int_enable.write(0x00);
            self.line_ctrl.write(0x80); // DLAB on
            self.data.write(0x01); // divisor low: 115200 baud
            self.int_enable.write(0x00); // divisor high
            self.line_ctrl.write(0x03); // 8N1, DLAB off
            self.fifo_ctrl.write(0xC7);
            self.modem_ctrl.write(0x0B);
        }
    }

    pub fn write_byte(&mut self, byte: u8) {
        unsafe {
            while self.line_status.read() & 0x20 == 0 {
                core::hint::spin_loop();
            }
            self.data.write(byte);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

static COM1: Mutex<Option<SerialPort>> = Mutex::new(None);

/// Initialize COM1. Safe to call more than once.
pub fn init() {
    let mut guard = COM1.lock();
    if guard.is_none() {
        let mut port = SerialPort::new(COM1_BASE);
        port.init();
        *guard = Some(port);
    }
}

/// Run `f` against the serial port if it has been initialized. Never
/// blocks: a record emitted from interrupt context while the interrupted
/// code holds the port is dropped instead of deadlocking.
pub fn with_port(f: impl FnOnce(&mut SerialPort)) {
    if let Some(mut guard) = COM1.try_lock() {
        if let Some(port) = guard.as_mut() {
            f(port);
        }
    }
}
