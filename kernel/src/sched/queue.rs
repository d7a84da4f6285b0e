//! Per-CPU ready queues and the tick-driven round-robin scheduler (§4.6).

use crate::cpu::context::Frame;
use crate::cpu::{current_mut, CpuLocal, MAX_CPUS};
use crate::sched::task::{ThreadHandle, DEFAULT_SLICE};
use crate::sync::IrqLock;

/// Tail pointers, one per CPU, so `enqueue` is O(1). Not part of the
/// per-CPU descriptor itself (§3 lists only a ready-queue head) — purely an
/// implementation detail of this module, touched under the same IRQ-lock
/// as every other cross-CPU ready-queue access.
static READY_TAILS: IrqLock<[Option<ThreadHandle>; MAX_CPUS]> = IrqLock::new([None; MAX_CPUS]);

/// Append `thread` to CPU `cpu_id`'s ready queue. Callable from any CPU
/// (thread creation), hence the IRQ-lock.
pub fn enqueue(cpu_id: usize, thread: ThreadHandle) {
    thread.get_mut().cpu_next = None;
    let mut tails = READY_TAILS.lock();
    match tails[cpu_id] {
        Some(tail) => tail.get_mut().cpu_next = Some(thread),
        None => set_head(cpu_id, Some(thread)),
    }
    tails[cpu_id] = Some(thread);
}

/// Pop the head of CPU `cpu_id`'s ready queue, if any.
fn dequeue(cpu_id: usize) -> Option<ThreadHandle> {
    let mut tails = READY_TAILS.lock();
    let head = ready_head(cpu_id)?;
    let next = head.get().cpu_next;
    set_head(cpu_id, next);
    if next.is_none() {
        tails[cpu_id] = None;
    }
    Some(head)
}

/// Unlink `thread` from CPU `cpu_id`'s ready queue if it is present there.
/// Used by `thread_exit` (§4.6: "removes it from ... the CPU queue").
pub fn remove(cpu_id: usize, thread: ThreadHandle) -> bool {
    let mut tails = READY_TAILS.lock();
    match ready_head(cpu_id) {
        Some(head) if head == thread => {
            set_head(cpu_id, head.get().cpu_next);
            if head.get().cpu_next.is_none() {
                tails[cpu_id] = None;
            }
            true
        }
        Some(mut cursor) => loop {
            let next = cursor.get().cpu_next;
            match next {
                Some(n) if n == thread => {
                    cursor.get_mut().cpu_next = n.get().cpu_next;
                    if n.get().cpu_next.is_none() {
                        tails[cpu_id] = Some(cursor);
                    }
                    break true;
                }
                Some(n) => cursor = n,
                None => break false,
            }
        },
        None => false,
    }
}

fn ready_head(cpu_id: usize) -> Option<ThreadHandle> {
    crate::cpu::cpu_local(cpu_id).ready_head
}

fn set_head(cpu_id: usize, head: Option<ThreadHandle>) {
    crate::cpu::cpu_local_mut(cpu_id).ready_head = head;
}

/// Find the least-loaded online CPU by ready-queue length (§4.6's simplest
/// creation policy). Falls back to the BSP (CPU 0) if nothing else is
/// online yet.
pub fn least_loaded_cpu() -> usize {
    let mut best = 0usize;
    let mut best_count = u32::MAX;
    for cpu_id in 0..crate::cpu::online_count() {
        let count = crate::cpu::cpu_local(cpu_id).thread_count;
        if count < best_count {
            best = cpu_id;
            best_count = count;
        }
    }
    best
}

/// The IRQ-0 tick callback, installed once per online CPU. Runs with
/// interrupts already masked (we're in interrupt context). `frame` is the
/// live interrupt frame the common stub is about to `iretq` with; a switch
/// rewrites it in place so that `iretq` resumes into whichever thread ends
/// up current, not necessarily the one the tick interrupted.
pub fn on_tick(frame: &mut Frame) {
    let cpu = current_mut();
    let cpu_id = cpu.id as usize;

    match cpu.running {
        None => {
            if let Some(next) = dequeue(cpu_id) {
                switch_to(cpu, frame, next);
            }
        }
        Some(running) => {
            running.get_mut().time_slice = running.get().time_slice.saturating_sub(1);
            if running.get().time_slice == 0 {
                enqueue(cpu_id, running);
                if let Some(next) = dequeue(cpu_id) {
                    switch_to(cpu, frame, next);
                }
            }
        }
    }
}

/// Save the outgoing thread's architectural state into its TCB, load
/// `next`'s into the live interrupt frame, and make it current. The common
/// stub pops registers out of `frame` and `iretq`s, so this is the entire
/// context switch; nothing else needs to touch the stack.
fn switch_to(cpu: &mut CpuLocal, frame: &mut Frame, next: ThreadHandle) {
    if let Some(running) = cpu.running {
        running.get_mut().saved_frame = *frame;
    }
    next.get_mut().time_slice = DEFAULT_SLICE;
    *frame = next.get().saved_frame;
    cpu.running = Some(next);
}

/// Force a reschedule at the next safe point by draining the running
/// thread's time slice; the next tick performs the actual switch.
pub fn sched_yield() {
    let cpu = current_mut();
    if let Some(running) = cpu.running {
        running.get_mut().time_slice = 0;
    }
}
