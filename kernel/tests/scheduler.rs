//! Exercises the tick-driven round-robin rotation end to end: two threads on
//! one CPU should each get `DEFAULT_SLICE` ticks per turn, in strict
//! alternation, and every switch must actually install the new thread's
//! saved frame into the live interrupt frame (§4.6, §8).

#![no_std]
#![no_main]

extern crate alloc;

mod common;

use axkrnl::cpu::context::Frame;
use axkrnl::sched::queue::on_tick;
use axkrnl::sched::task::DEFAULT_SLICE;
use axkrnl::testing::{exit_qemu, test_panic_handler, QemuExitCode};
use axkrnl::{cpu, kinfo, sched};

const ITERATIONS: u32 = 2000;

#[no_mangle]
extern "C" fn _start() -> ! {
    common::boot_minimal();
    sched::init();

    let cpu_id = cpu::current().id as usize;
    let process = sched::proc_create("sched-fairness");
    let t1 = sched::thread_create(process, 0x1000).expect("thread 1");
    let t2 = sched::thread_create(process, 0x1000).expect("thread 2");

    // Stands in for the live frame the IDT stub would hand `on_tick`; a real
    // switch overwrites it with the incoming thread's `saved_frame`.
    let mut frame = Frame::default();

    let mut ticks_t1 = 0u32;
    let mut ticks_t2 = 0u32;
    for _ in 0..ITERATIONS {
        on_tick(&mut frame);
        match cpu::cpu_local(cpu_id).running {
            Some(t) if t == t1 => {
                ticks_t1 += 1;
                if frame.rip != t1.get().saved_frame.rip || frame.rsp != t1.get().saved_frame.rsp {
                    kinfo!("live frame was not updated to thread 1's saved frame");
                    exit_qemu(QemuExitCode::Failed);
                }
            }
            Some(t) if t == t2 => {
                ticks_t2 += 1;
                if frame.rip != t2.get().saved_frame.rip || frame.rsp != t2.get().saved_frame.rsp {
                    kinfo!("live frame was not updated to thread 2's saved frame");
                    exit_qemu(QemuExitCode::Failed);
                }
            }
            _ => {}
        }
    }

    kinfo!("t1 ticks={} t2 ticks={}", ticks_t1, ticks_t2);

    let total = ticks_t1 + ticks_t2;
    let diff = ticks_t1.abs_diff(ticks_t2);
    if total != ITERATIONS || diff > DEFAULT_SLICE {
        kinfo!("unfair rotation: total={} diff={}", total, diff);
        exit_qemu(QemuExitCode::Failed);
    }

    exit_qemu(QemuExitCode::Success)
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_panic_handler(info)
}
