//! Tick source for uptime and the scheduler (§4.6, §4.8, §9).
//!
//! [`TimeSource`] is a trait object so the PIT backend below can be swapped
//! for an HPET one later without touching callers; only one is registered
//! at a time. Ticks drive both [`uptime_ms`] and the scheduler's IRQ-0
//! callback, grounded in the teacher's `arch/x86_64/timer.rs` PIT
//! programming sequence.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::instructions::port::Port;

use crate::cpu::context::Frame;
use crate::sync::Spinlock;

/// Ticks per second. 1 kHz gives millisecond-granularity uptime and a
/// DEFAULT_SLICE of a few ticks' worth of real time per thread.
const TICK_HZ: u32 = 1000;
const PIT_FREQUENCY: u32 = 1_193_182;

const PIT_CHANNEL0_DATA: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
const PIT_CMD_CHANNEL0_RATE_GENERATOR: u8 = 0x36;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// A hardware tick source. Only [`Pit`] is implemented; an HPET backend
/// would implement the same trait and be registered in its place.
pub trait TimeSource: Send + Sync {
    /// Program the source to interrupt at `hz` Hz on IRQ 0.
    fn program(&self, hz: u32);
}

struct Pit;

impl TimeSource for Pit {
    fn program(&self, hz: u32) {
        let divisor = (PIT_FREQUENCY / hz) as u16;
        // SAFETY: 0x40/0x43 are the standard PIT ports; this sequence runs
        // once at boot before interrupts are unmasked.
        unsafe {
            let mut cmd: Port<u8> = Port::new(PIT_COMMAND);
            let mut data: Port<u8> = Port::new(PIT_CHANNEL0_DATA);
            cmd.write(PIT_CMD_CHANNEL0_RATE_GENERATOR);
            data.write((divisor & 0xFF) as u8);
            data.write((divisor >> 8) as u8);
        }
    }
}

static SOURCE: Spinlock<Option<&'static dyn TimeSource>> = Spinlock::new(None);

/// Program the default tick source and wire it to the scheduler. Called
/// once, from the BSP, after [`crate::irq::init`].
pub fn init() {
    let pit: &'static dyn TimeSource = alloc::boxed::Box::leak(alloc::boxed::Box::new(Pit));
    pit.program(TICK_HZ);
    *SOURCE.lock() = Some(pit);
    crate::irq::install_handler(0, tick, 0);
}

/// Swap in a different tick source (e.g. an HPET backend), reprogramming it
/// at the same rate `init` used.
pub fn set_source(source: &'static dyn TimeSource) {
    source.program(TICK_HZ);
    *SOURCE.lock() = Some(source);
}

fn tick(frame: &mut Frame, _context: usize) {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::sched::queue::on_tick(frame);
}

/// Monotonic uptime since [`init`], in milliseconds.
pub fn uptime_ms() -> u64 {
    TICKS.load(Ordering::Relaxed) * (1000 / TICK_HZ as u64)
}

/// Spin, yielding the CPU between polls, until at least `ms` milliseconds
/// have passed. Used by AP bring-up, where sleeping on a condition variable
/// isn't available (§4.4).
pub fn busy_wait_ms(ms: u64) {
    let deadline = uptime_ms() + ms;
    while uptime_ms() < deadline {
        x86_64::instructions::hlt();
    }
}
