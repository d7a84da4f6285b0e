//! Boots to the point `kernel_main` reaches just before falling into the
//! idle loop, with zero boot modules, and exits QEMU successfully (§2, §8).

#![no_std]
#![no_main]

extern crate alloc;

mod common;

use axkrnl::testing::{exit_qemu, test_panic_handler, QemuExitCode};
use axkrnl::{kinfo, sched};

#[no_mangle]
extern "C" fn _start() -> ! {
    common::boot_minimal();

    sched::init();
    kinfo!("boot test: no modules to load");
    kinfo!("Kernel boot complete");

    exit_qemu(QemuExitCode::Success)
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_panic_handler(info)
}
