//! Shared boot-up sequence for the `harness = false` integration tests
//! under `tests/`. Mirrors `axkrnl::kernel_main`'s early steps up through
//! `cpu_init`, deliberately stopping short of starting APs, installing the
//! tick source, or enabling interrupts — each test starts only the pieces
//! it actually exercises instead of inheriting a preemptive, multi-CPU
//! kernel mid-assertion.

use axkrnl::{boot, cpu, irq, mm, panic, serial};

pub fn boot_minimal() {
    serial::init();
    axkrnl::log::init(::log::LevelFilter::Info);

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
}
