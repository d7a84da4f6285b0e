//! Kernel error taxonomy.
//!
//! Four tiers, matching the propagation rules each subsystem follows:
//! out-of-resource and invalid-argument conditions are recoverable and
//! returned to the caller; invariant-corruption conditions are logged and
//! refused but do not stop the kernel; fatal contract violations are routed
//! to [`crate::panic::kpanic`] instead of being represented here at all.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Tier 1: out-of-resource.
    OutOfMemory { requested: usize, available: usize },
    NoFreeFrames,
    HeapExhausted { requested: usize },

    /// Tier 2: invalid argument.
    InvalidAddress { addr: usize },
    UnmappedMemory { addr: usize },
    InvalidArgument { name: &'static str, value: &'static str },
    OutOfRangeIrq { irq: u8 },

    /// Tier 2/3: process and scheduling.
    ProcessNotFound { pid: u64 },
    ThreadNotFound { tid: u64 },
    ThreadCreateFailed,

    /// Tier 3: invariant corruption, refused but non-fatal.
    HeapCorruption { addr: usize },
    ThreadMagicMismatch { tid: u64 },

    /// Generic bookkeeping, used by subsystems that track named resources.
    AlreadyExists { resource: &'static str, id: u64 },
    NotFound { resource: &'static str, id: u64 },
    Timeout { operation: &'static str, duration_ms: u64 },
    NotInitialized { subsystem: &'static str },

    /// ELF / module loader.
    MalformedElf { reason: &'static str },
    UnresolvedImport,
}

pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested, available } => write!(
                f,
                "out of memory: requested {} bytes, {} available",
                requested, available
            ),
            Self::NoFreeFrames => write!(f, "no free physical frames"),
            Self::HeapExhausted { requested } => {
                write!(f, "heap exhausted: requested {} bytes", requested)
            }
            Self::InvalidAddress { addr } => write!(f, "invalid address: {:#x}", addr),
            Self::UnmappedMemory { addr } => write!(f, "unmapped memory at {:#x}", addr),
            Self::InvalidArgument { name, value } => {
                write!(f, "invalid argument '{}': {}", name, value)
            }
            Self::OutOfRangeIrq { irq } => write!(f, "IRQ {} out of range", irq),
            Self::ProcessNotFound { pid } => write!(f, "process {} not found", pid),
            Self::ThreadNotFound { tid } => write!(f, "thread {} not found", tid),
            Self::ThreadCreateFailed => write!(f, "thread creation failed"),
            Self::HeapCorruption { addr } => write!(f, "heap corruption detected near {:#x}", addr),
            Self::ThreadMagicMismatch { tid } => {
                write!(f, "thread {} magic mismatch (use-after-free?)", tid)
            }
            Self::AlreadyExists { resource, id } => {
                write!(f, "{} {} already exists", resource, id)
            }
            Self::NotFound { resource, id } => write!(f, "{} {} not found", resource, id),
            Self::Timeout { operation, duration_ms } => {
                write!(f, "timeout during {}: {} ms", operation, duration_ms)
            }
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
            Self::MalformedElf { reason } => write!(f, "malformed ELF image: {}", reason),
            Self::UnresolvedImport => write!(f, "unresolved AXAPI import"),
        }
    }
}
