//! Deliberately raises #UD to exercise `panic::kpanic_fault`'s register
//! dump and backtrace. There is no recovery from a real CPU exception, so
//! unlike the other integration tests this one never reaches `exit_qemu`;
//! the runner greps the serial log for the expected "vector=6", a
//! symbolized RIP, and at least two backtrace lines (§4.8, §8).

#![no_std]
#![no_main]

extern crate alloc;

mod common;

use axkrnl::testing::test_panic_handler;
use axkrnl::{kinfo, serial_println};

#[no_mangle]
extern "C" fn _start() -> ! {
    common::boot_minimal();
    kinfo!("fault_panic test: about to fault");
    serial_println!("ready to fault");

    // SAFETY: `ud2` is the dedicated "raise #UD" instruction; this is the
    // whole point of the test.
    unsafe {
        core::arch::asm!("ud2");
    }

    unreachable!("default_handler's kpanic_fault never returns");
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_panic_handler(info)
}
