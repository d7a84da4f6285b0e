//! COM1 serial port, 8N1 at 115200 baud.
//!
//! This is the kernel log's first sink (§4.8); the framebuffer console is
//! an external collaborator (flanterm) the kernel core does not implement.

use core::fmt;

use spin::Mutex;

const COM1_BASE: u16 = 0x3F8;

pub static SERIAL1: Mutex<Option<uart_16550::SerialPort>> = Mutex::new(None);

/// Initialize COM1. Safe to call once, early, before interrupts are enabled.
pub fn init() {
    // SAFETY: 0x3F8 is the standard COM1 I/O base address; constructing and
    // initializing the port here happens once during single-threaded boot.
    let mut port = unsafe { uart_16550::SerialPort::new(COM1_BASE) };
    port.init();
    *SERIAL1.lock() = Some(port);
}

#[doc(hidden)]
pub fn _serial_print(args: fmt::Arguments) {
    use core::fmt::Write;
    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        if let Some(port) = SERIAL1.lock().as_mut() {
            let _ = port.write_fmt(args);
        }
    });
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_serial_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => {
        $crate::serial_print!("{}\n", format_args!($($arg)*))
    };
}
