//! Process and thread control blocks (§3).
//!
//! Both are arena-owned: created with `Box::leak` and referenced everywhere
//! else through a raw, non-owning handle. The single owning direction is
//! "process owns its threads" via `thread_list_head`/`proc_next`; everything
//! else (`owning_process`, `owning_cpu`, the per-CPU `cpu_next` link) is a
//! look-aside pointer that does not control the object's lifetime.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::cpu::context::Frame;
use crate::mm::vmm::Vctx;

pub const NAME_LEN: usize = 32;
pub const DEFAULT_SLICE: u32 = 5;

/// `magic` cycles through these two sentinels so a stale pointer into freed
/// memory is caught rather than silently followed.
const MAGIC_ALIVE: u32 = 0x4154_4C49;
const MAGIC_DEAD: u32 = 0x4445_4144;

static NEXT_PID_SEQ: AtomicU32 = AtomicU32::new(1);
static NEXT_TID_SEQ: AtomicU32 = AtomicU32::new(1);

/// `pid = (kind << 24) ^ sequence`, per §3.
pub fn alloc_pid(kind: u8) -> u32 {
    let seq = NEXT_PID_SEQ.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF;
    ((kind as u32) << 24) ^ seq
}

fn alloc_tid() -> u32 {
    NEXT_TID_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Process control block.
pub struct Pcb {
    pub pid: u32,
    pub address_space: Vctx,
    pub thread_list_head: Option<ThreadHandle>,
    pub image_elf_ptr: usize,
    pub name: [u8; NAME_LEN],
}

/// Non-owning handle to an arena-allocated [`Pcb`]. Valid as long as the
/// process has not been torn down; nothing currently reclaims processes
/// before shutdown, matching the "every boot is cold, no persisted state"
/// design (§6).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle(NonNull<Pcb>);

// SAFETY: `Pcb`s are only mutated by their owning process's threads or by
// the loader during setup (§5); the handle itself carries no thread-unsafe
// state beyond the pointer.
unsafe impl Send for ProcessHandle {}
unsafe impl Sync for ProcessHandle {}

impl ProcessHandle {
    pub fn new(pcb: Pcb) -> Self {
        let leaked = alloc::boxed::Box::leak(alloc::boxed::Box::new(pcb));
        Self(NonNull::from(leaked))
    }

    pub fn get(&self) -> &Pcb {
        // SAFETY: the pointee is leaked for the process's lifetime and
        // mutation is confined to the owning process or the loader.
        unsafe { self.0.as_ref() }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn get_mut(&self) -> &mut Pcb {
        // SAFETY: see `get`.
        unsafe { &mut *self.0.as_ptr() }
    }
}

/// Thread control block (§3's "Thread (TCB)").
pub struct Tcb {
    magic: AtomicU32,
    pub tid: u32,
    pub saved_frame: Frame,
    pub time_slice: u32,
    pub owning_process: ProcessHandle,
    pub owning_cpu: u32,
    pub proc_next: Option<ThreadHandle>,
    pub cpu_next: Option<ThreadHandle>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ThreadHandle(NonNull<Tcb>);

// SAFETY: a `Tcb` is touched only by its owning CPU's tick handler or
// through the IRQ-locked ready-queue operations in `crate::sched::queue`.
unsafe impl Send for ThreadHandle {}
unsafe impl Sync for ThreadHandle {}

impl ThreadHandle {
    pub fn new(tcb: Tcb) -> Self {
        let leaked = alloc::boxed::Box::leak(alloc::boxed::Box::new(tcb));
        Self(NonNull::from(leaked))
    }

    pub fn get(&self) -> &Tcb {
        // SAFETY: see `ProcessHandle::get`; `Tcb`s are never moved once
        // leaked.
        unsafe { self.0.as_ref() }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn get_mut(&self) -> &mut Tcb {
        // SAFETY: see above.
        unsafe { &mut *self.0.as_ptr() }
    }

    pub fn is_alive(&self) -> bool {
        self.get().magic.load(Ordering::Acquire) == MAGIC_ALIVE
    }

    /// Free the backing storage after the thread has been unlinked from
    /// every queue. Poisoning `magic` first means a dangling handle still
    /// reachable from a bug elsewhere reads DEAD instead of freed memory
    /// being reinterpreted as a live TCB.
    ///
    /// # Safety
    /// The caller must guarantee `self` has already been removed from its
    /// process's thread list and its owning CPU's ready queue, and that no
    /// other handle to this TCB will be dereferenced afterward.
    pub unsafe fn reclaim(self) {
        self.get().magic.store(MAGIC_DEAD, Ordering::Release);
        // SAFETY: forwarded from the caller's contract above; this handle
        // was the last reference, created via `Box::leak` in `Tcb::new`.
        unsafe {
            drop(alloc::boxed::Box::from_raw(self.0.as_ptr()));
        }
    }
}

impl Tcb {
    /// Build a fresh TCB ready to be appended to a process's thread list
    /// and a CPU's ready queue. `stack_top` is the initial RSP.
    pub fn new(process: ProcessHandle, entry: u64, stack_top: u64) -> Self {
        Self {
            magic: AtomicU32::new(MAGIC_ALIVE),
            tid: alloc_tid(),
            saved_frame: Frame::new_thread(entry, stack_top),
            time_slice: DEFAULT_SLICE,
            owning_process: process,
            owning_cpu: 0,
            proc_next: None,
            cpu_next: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_high_byte_carries_the_kind_tag() {
        let pid = alloc_pid(0x42);
        assert_eq!(pid >> 24, 0x42);
    }

    #[test]
    fn successive_pids_with_the_same_kind_differ() {
        let a = alloc_pid(1);
        let b = alloc_pid(1);
        assert_ne!(a, b);
        assert_eq!(a >> 24, 1);
        assert_eq!(b >> 24, 1);
    }
}
