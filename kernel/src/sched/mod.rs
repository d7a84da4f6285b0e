//! Process/thread creation and the tick-driven round-robin scheduler (§4.6).

pub mod queue;
pub mod task;

use task::{Pcb, ProcessHandle, Tcb, ThreadHandle, NAME_LEN};

const KERNEL_STACK_PAGES: u64 = 4; // 16 KiB, matching the AP stack size in §4.4.
const PID_KIND_KERNEL: u8 = 0x01;

/// Allocate a PCB, a fresh address space, an empty thread list, and a pid.
/// The thread list stays empty until [`thread_create`] appends to it.
pub fn proc_create(name: &str) -> ProcessHandle {
    let mut name_buf = [0u8; NAME_LEN];
    let bytes = name.as_bytes();
    let len = bytes.len().min(NAME_LEN - 1);
    name_buf[..len].copy_from_slice(&bytes[..len]);

    let pcb = Pcb {
        pid: task::alloc_pid(PID_KIND_KERNEL),
        address_space: crate::mm::vmm::Vctx::vinit(),
        thread_list_head: None,
        image_elf_ptr: 0,
        name: name_buf,
    };
    ProcessHandle::new(pcb)
}

/// Allocate a TCB, give it a fresh kernel stack and an initial frame at
/// `entry`, append it to `process`'s thread list, and enqueue it on the
/// least-loaded online CPU (the BSP, at startup, since it is the only one
/// online). Returns `None` if no frames remain for the stack — the module
/// loader treats that as a hard error and aborts the load (§4.6's
/// failure mode).
pub fn thread_create(process: ProcessHandle, entry: u64) -> Option<ThreadHandle> {
    let stack_frame = crate::mm::pmm::alloc(KERNEL_STACK_PAGES)?;
    let stack_top = stack_frame.to_virt().as_u64() + KERNEL_STACK_PAGES * crate::mm::PAGE_SIZE as u64;

    let tcb = Tcb::new(process, entry, stack_top);
    let thread = ThreadHandle::new(tcb);

    thread.get_mut().proc_next = process.get().thread_list_head;
    process.get_mut().thread_list_head = Some(thread);

    let cpu_id = queue::least_loaded_cpu();
    thread.get_mut().owning_cpu = cpu_id as u32;
    crate::cpu::cpu_local_mut(cpu_id).thread_count += 1;
    queue::enqueue(cpu_id, thread);

    Some(thread)
}

/// Mark `thread` DEAD and unlink it from its process's thread list. It
/// remains reachable from a CPU's ready queue or running slot only until
/// the next tick, at which point the scheduler simply never selects it
/// again; the TCB itself is reclaimed once removal is certain.
pub fn thread_exit(thread: ThreadHandle) {
    let process = thread.get().owning_process;
    unlink_from_process(process, thread);

    let cpu_id = thread.get().owning_cpu as usize;
    queue::remove(cpu_id, thread);
    let cpu = crate::cpu::cpu_local_mut(cpu_id);
    if cpu.running == Some(thread) {
        cpu.running = None;
    }
    cpu.thread_count = cpu.thread_count.saturating_sub(1);

    // SAFETY: `thread` has just been unlinked from its process's thread
    // list, its CPU's ready queue, and its CPU's running slot above, so no
    // remaining path can dereference this handle after reclaim.
    unsafe {
        thread.reclaim();
    }
}

fn unlink_from_process(process: ProcessHandle, thread: ThreadHandle) {
    let pcb = process.get_mut();
    match pcb.thread_list_head {
        Some(head) if head == thread => {
            pcb.thread_list_head = thread.get().proc_next;
        }
        _ => {
            let mut cursor = pcb.thread_list_head;
            while let Some(node) = cursor {
                if node.get().proc_next == Some(thread) {
                    node.get_mut().proc_next = thread.get().proc_next;
                    break;
                }
                cursor = node.get().proc_next;
            }
        }
    }
}

/// Force a reschedule at the next safe point.
pub fn sched_yield() {
    queue::sched_yield();
}

/// Entry point for a CPU with nothing else to do: halt with interrupts
/// enabled until the next tick hands it a thread. Never returns.
pub fn idle_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Route IRQ 0 to every online CPU so the tick installed by
/// [`crate::timer::init`] fires on all of them (§4.5: "IRQ 0 is steered to
/// all CPUs, others to the BSP").
pub fn init() {
    for cpu_id in 0..crate::cpu::online_count() {
        let lapic_id = crate::cpu::cpu_local(cpu_id).id as u8;
        crate::irq::route(0, lapic_id);
    }
}
