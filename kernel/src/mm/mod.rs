//! Memory management: physical frames, page tables, per-process address
//! space regions, and the kernel heap (§3, §4.2).

pub mod heap;
pub mod paging;
pub mod pmm;
pub mod vmm;

/// Native page size on x86_64.
pub const PAGE_SIZE: usize = 4096;

/// Physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Translate via the HHDM offset established by `boot::init`.
    pub fn to_virt(&self) -> VirtAddr {
        VirtAddr::new(self.0 + crate::boot::params().hhdm_offset)
    }
}

/// Virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    pub const fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }
}

/// Initialize physical memory, paging, and the kernel heap, in that order.
/// Mirrors the boot sequence in §2: PMM must see the memory map before
/// paging can borrow frames for new page tables, and the heap allocator
/// needs a mapped, writable region before `alloc` is usable.
pub fn init() {
    pmm::init(crate::boot::params());
    paging::init();
    heap::init();
}
