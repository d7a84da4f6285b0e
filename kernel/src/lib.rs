//! AurixOS kernel library.
//!
//! `main.rs`'s `_start` is a thin Limine entry stub; the boot sequence
//! itself lives here so it is reachable from both the bare-metal binary and
//! the host-target test harness (§2, §8).

#![no_std]
#![feature(abi_x86_interrupt)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

#[cfg(not(target_os = "none"))]
extern crate std;

// Bare metal: `mm::heap` installs the first-fit freed-list allocator over
// frames carved out by `mm::heap::init`. Host target: the system allocator,
// so `cargo test` can use `Vec`/`String`/`Box` without a mapped kernel heap.
#[cfg(not(target_os = "none"))]
#[global_allocator]
static HOST_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod acpi;
pub mod boot;
pub mod cpu;
pub mod elf;
pub mod error;
pub mod irq;
pub mod log;
pub mod mm;
pub mod panic;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod timer;
pub mod utils;

/// Bring the kernel from `_start` to the idle loop: early CPU setup, memory
/// management, ACPI/APIC discovery, the scheduler, SMP, the tick source,
/// and finally every boot module (§2's boot-flow sequence).
///
/// Never returns on the BSP: it falls into [`sched::idle_loop`] once the
/// last module has been submitted.
#[cfg(target_os = "none")]
pub fn kernel_main() -> ! {
    serial::init();
    log::init(::log::LevelFilter::Info);
    kinfo!("AurixOS kernel {} starting", env!("CARGO_PKG_VERSION"));

    let params = boot::init();

    cpu::gdt::init();
    cpu::idt::init();
    cpu::cpu_early_init(0);

    mm::pmm::init(params);
    mm::paging::init();
    mm::heap::init();
    mm::pmm::reclaim(params);

    panic::install_panic_stop_handler();
    irq::init();

    cpu::apic::init().unwrap_or_else(|e| panic::kpanic(&alloc::format!("APIC init failed: {e}")));
    cpu::cpu_init();
    let cpus = acpi::enumerate_cpus(params.rsdp_phys, cpu::current().id as u8);

    sched::init();
    timer::init();

    #[cfg(feature = "smp")]
    cpu::smp::start_aps(cpus.apic_ids(), cpu::current().id as u8);
    #[cfg(not(feature = "smp"))]
    let _ = &cpus;

    x86_64::instructions::interrupts::enable();

    load_boot_modules(params);

    kinfo!("Kernel boot complete");
    sched::idle_loop();
}

/// Load every module the bootloader handed us, in order, skipping any that
/// fail validation rather than aborting the whole boot (§4.7's per-module
/// failure isolation).
#[cfg(target_os = "none")]
fn load_boot_modules(params: &boot::BootParams) {
    for module in params.modules() {
        let image = mm::PhysAddr::new(module.addr);
        match elf::load_module(image, module.size) {
            Ok(loaded) => kinfo!("Loaded module: {}", loaded.name),
            Err(e) => kwarn!("failed to load module '{}': {:?}", module.name(), e),
        }
    }
}

/// QEMU `isa-debug-exit` harness for the `harness = false` integration
/// tests under `tests/` (§8). Each test binary runs `kernel_main`'s early
/// steps itself (it needs its own `_start`), exercises one scenario, then
/// exits QEMU with a status the runner script checks.
#[cfg(feature = "testing")]
pub mod testing {
    use x86_64::instructions::port::Port;

    const ISA_DEBUG_EXIT_PORT: u16 = 0xf4;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(u32)]
    pub enum QemuExitCode {
        Success = 0x10,
        Failed = 0x11,
    }

    /// Write the exit code to the `isa-debug-exit` device and halt. QEMU
    /// maps this to a real process exit status when booted with
    /// `-device isa-debug-exit,iobase=0xf4,iosize=0x04`; never returns.
    pub fn exit_qemu(code: QemuExitCode) -> ! {
        // SAFETY: 0xf4 is the standard isa-debug-exit I/O port; writing to
        // it is only meaningful (and only reachable) when QEMU was started
        // with the matching `-device` flag, which every `tests/` binary
        // assumes.
        unsafe {
            let mut port: Port<u32> = Port::new(ISA_DEBUG_EXIT_PORT);
            port.write(code as u32);
        }
        loop {
            x86_64::instructions::hlt();
        }
    }

    pub fn test_panic_handler(info: &core::panic::PanicInfo) -> ! {
        crate::serial_println!("[failed]\n{}", info);
        exit_qemu(QemuExitCode::Failed);
    }
}
