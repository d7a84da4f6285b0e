//! Limine entry stub. The real boot sequence lives in `axkrnl::kernel_main`
//! so the library target stays the single source of truth for it.

#![no_std]
#![no_main]

use axkrnl::println;

#[no_mangle]
extern "C" fn _start() -> ! {
    axkrnl::kernel_main()
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("[early panic] {}", info);
    axkrnl::panic::kpanic("early panic before panic::install_panic_stop_handler ran");
}
