//! Single-shot, cross-CPU panic path (§4.8).
//!
//! The first CPU to call [`kpanic`] or [`kpanic_fault`] disables interrupts,
//! broadcasts the panic-stop IPI to every other online CPU, and prints a
//! dump. Any CPU arriving after that point (including the panic-stop IPI's
//! own recipients) just halts.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::cpu::context::Frame;

/// Reserved per §6's interrupt vector map ("0xFF: panic-stop IPI").
const PANIC_STOP_VECTOR: u8 = 0xFF;

static PANICKED: AtomicBool = AtomicBool::new(false);

/// Handler installed on [`PANIC_STOP_VECTOR`]: the receiving CPU has nothing
/// left to do but halt.
fn panic_stop_handler(_frame: &mut Frame) {
    halt_forever();
}

pub fn install_panic_stop_handler() {
    crate::cpu::idt::install_handler(PANIC_STOP_VECTOR, panic_stop_handler);
}

fn halt_forever() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

/// Stop every other CPU and print a dump with `reason` but no fault frame.
/// Used for contract violations detected in ordinary kernel code (bad boot
/// protocol revision, unsupported ELF class, and the like — §7 tier 4).
pub fn kpanic(reason: &str) -> ! {
    panic_common(reason, None)
}

/// Same as [`kpanic`], but for a CPU exception: includes the full register
/// snapshot, CR2/CR3, and a backtrace.
pub fn kpanic_fault(reason: &str, frame: &Frame) -> ! {
    panic_common(reason, Some(frame))
}

fn panic_common(reason: &str, frame: Option<&Frame>) -> ! {
    x86_64::instructions::interrupts::disable();

    if PANICKED.swap(true, Ordering::AcqRel) {
        halt_forever();
    }

    broadcast_stop();
    dump(reason, frame);
    halt_forever();
}

fn broadcast_stop() {
    let this = crate::cpu::current().id as u8;
    for cpu_id in 0..crate::cpu::online_count() {
        let lapic_id = crate::cpu::cpu_local(cpu_id).id as u8;
        if lapic_id == this {
            continue;
        }
        let _ = crate::cpu::apic::send_ipi(lapic_id, crate::cpu::apic::IpiMode::Fixed, PANIC_STOP_VECTOR);
    }
}

fn dump(reason: &str, frame: Option<&Frame>) {
    let cpu = crate::cpu::current();
    crate::kerror!("panic: {}", reason);
    crate::kerror!("CPU {}", cpu.id);
    if let Some(thread) = cpu.running {
        let tcb = thread.get();
        let pid = tcb.owning_process.get().pid;
        crate::kerror!("pid={} tid={}", pid, tcb.tid);
    }

    if let Some(frame) = frame {
        crate::kerror!(
            "vector={} error_code={:#x} cr2={:#x} cr3={:#x}",
            frame.vector,
            frame.error_code,
            Frame::cr2(),
            Frame::cr3(),
        );
        crate::kerror!(
            "rax={:#018x} rbx={:#018x} rcx={:#018x} rdx={:#018x}",
            frame.rax, frame.rbx, frame.rcx, frame.rdx
        );
        crate::kerror!(
            "rsi={:#018x} rdi={:#018x} rbp={:#018x} rsp={:#018x}",
            frame.rsi, frame.rdi, frame.rbp, frame.rsp
        );
        crate::kerror!(
            "r8={:#018x} r9={:#018x} r10={:#018x} r11={:#018x}",
            frame.r8, frame.r9, frame.r10, frame.r11
        );
        crate::kerror!(
            "r12={:#018x} r13={:#018x} r14={:#018x} r15={:#018x}",
            frame.r12, frame.r13, frame.r14, frame.r15
        );
        crate::kerror!(
            "rip={:#018x} cs={:#x} rflags={:#x} ss={:#x}",
            frame.rip, frame.cs, frame.rflags, frame.ss
        );
        crate::kerror!("{}", symbolize(frame.rip));

        backtrace(frame.rbp);
    }
}

fn symbolize(addr: u64) -> alloc::string::String {
    match crate::elf::symbolize_loaded(addr) {
        Some(name) => alloc::format!("{:#018x} in {}", addr, name),
        None => alloc::format!("{:#018x} in <kernel>", addr),
    }
}

/// Walk saved RBP frames, stopping at the first misaligned, unmapped, or
/// null frame pointer (§4.8).
fn backtrace(start_rbp: u64) {
    crate::kerror!("backtrace:");
    let mut rbp = start_rbp;
    let pagemap = crate::mm::paging::kernel_pagemap();

    for _ in 0..32 {
        if rbp == 0 || rbp % 8 != 0 {
            break;
        }
        let rbp_virt = crate::mm::VirtAddr::new(rbp);
        if crate::mm::paging::translate(pagemap, rbp_virt).is_none() {
            break;
        }

        // SAFETY: `rbp` was just checked for 8-byte alignment and mapped
        // backing, so the saved-rbp/return-address pair at
        // [rbp], [rbp+8] is readable.
        let (saved_rbp, return_addr): (u64, u64) = unsafe {
            let ptr = rbp as *const u64;
            (core::ptr::read(ptr), core::ptr::read(ptr.add(1)))
        };
        if return_addr == 0 {
            break;
        }
        crate::kerror!("  {}", symbolize(return_addr));

        if saved_rbp <= rbp {
            break;
        }
        rbp = saved_rbp;
    }
}
