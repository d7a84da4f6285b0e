//! First-fit kernel heap over a region obtained from the VMM (§4.3).
//!
//! Each block is preceded by a header whose `check` field XORs the other
//! three fields against a fixed magic; every header access revalidates it
//! before trusting `prev`/`next`/`block_size`. A 64-bit canary sits
//! immediately past the user-visible region so `kfree` can catch a
//! trailing overrun as well as header corruption.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use crate::sync::Spinlock;

const ALIGN: usize = 16;
const CHECK_MAGIC: u64 = 0x4158_4B52_4E4C_4846; // "AXKRNLHF"
const CANARY: u64 = 0xC0FF_EEC0_FFEE_C0DE;

/// Pages reserved for the kernel heap pool.
const FF_POOL_PAGES: u64 = 4096; // 16 MiB

#[repr(C)]
struct BlockHeader {
    prev: *mut BlockHeader,
    next: *mut BlockHeader,
    block_size: usize,
    user_size: usize,
    check: u64,
    free: bool,
}

impl BlockHeader {
    fn compute_check(prev: *mut BlockHeader, next: *mut BlockHeader, block_size: usize) -> u64 {
        (prev as u64) ^ (next as u64) ^ (block_size as u64) ^ CHECK_MAGIC
    }

    fn stamp(&mut self) {
        self.check = Self::compute_check(self.prev, self.next, self.block_size);
    }

    fn is_valid(&self) -> bool {
        self.check == Self::compute_check(self.prev, self.next, self.block_size)
    }
}

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();
const CANARY_SIZE: usize = core::mem::size_of::<u64>();

struct FreeListHeap {
    head: *mut BlockHeader,
    pool_start: usize,
    pool_end: usize,
}

// SAFETY: the heap is only ever touched through `HEAP`'s spinlock.
unsafe impl Send for FreeListHeap {}

impl FreeListHeap {
    const fn new() -> Self {
        Self {
            head: core::ptr::null_mut(),
            pool_start: 0,
            pool_end: 0,
        }
    }

    /// # Safety
    /// `pool` must be a writable region of at least `size` bytes, not
    /// aliased by anything else.
    unsafe fn init(&mut self, pool: *mut u8, size: usize) {
        self.pool_start = pool as usize;
        self.pool_end = pool as usize + size;

        let header = pool as *mut BlockHeader;
        // SAFETY: `header` is valid for writes per this fn's safety contract.
        unsafe {
            (*header).prev = core::ptr::null_mut();
            (*header).next = core::ptr::null_mut();
            (*header).block_size = size;
            (*header).user_size = 0;
            (*header).free = true;
            (*header).stamp();
        }
        self.head = header;
    }

    fn align_up(n: usize, align: usize) -> usize {
        (n + align - 1) & !(align - 1)
    }

    fn find_fit(&self, need: usize) -> Option<*mut BlockHeader> {
        let mut cur = self.head;
        while !cur.is_null() {
            // SAFETY: `cur` always points at a header installed by this
            // allocator and validated on the previous hop.
            let block = unsafe { &*cur };
            if !block.is_valid() {
                crate::kerror!("heap corruption: invalid header at {:p}", cur);
                return None;
            }
            if block.free && block.block_size >= need {
                return Some(cur);
            }
            cur = block.next;
        }
        None
    }

    /// Split `block` if there's enough room left over for another header
    /// plus a minimal payload, leaving a new free block after it.
    fn maybe_split(&mut self, block: *mut BlockHeader, need: usize) {
        // SAFETY: `block` is a validated header owned by this heap.
        unsafe {
            let b = &mut *block;
            let remaining = b.block_size - need;
            if remaining <= HEADER_SIZE + ALIGN {
                return;
            }
            let new_block = (block as usize + need) as *mut BlockHeader;
            let next = b.next;
            (*new_block).prev = block;
            (*new_block).next = next;
            (*new_block).block_size = remaining;
            (*new_block).user_size = 0;
            (*new_block).free = true;
            (*new_block).stamp();

            if !next.is_null() {
                (*next).prev = new_block;
                (*next).stamp();
            }

            b.next = new_block;
            b.block_size = need;
            b.stamp();
        }
    }

    fn coalesce(&mut self, block: *mut BlockHeader) {
        // SAFETY: `block` and its neighbors, when present, are headers
        // owned by this heap.
        unsafe {
            let b = &mut *block;
            if !b.next.is_null() && (*b.next).free {
                let next = b.next;
                let next_block = &*next;
                b.block_size += next_block.block_size;
                b.next = next_block.next;
                if !b.next.is_null() {
                    (*b.next).prev = block;
                    (*b.next).stamp();
                }
                b.stamp();
            }
            if !b.prev.is_null() && (*b.prev).free {
                let prev = b.prev;
                let prev_block = &mut *prev;
                prev_block.block_size += b.block_size;
                prev_block.next = b.next;
                if !prev_block.next.is_null() {
                    (*prev_block.next).prev = prev;
                    (*prev_block.next).stamp();
                }
                prev_block.stamp();
            }
        }
    }

    fn alloc(&mut self, layout: Layout) -> *mut u8 {
        let align = layout.align().max(ALIGN);
        let user_size = Self::align_up(layout.size(), align);
        let need = HEADER_SIZE + user_size + CANARY_SIZE;

        let Some(block) = self.find_fit(need) else {
            return core::ptr::null_mut();
        };

        self.maybe_split(block, need);

        // SAFETY: `block` was just validated and sized for `need`.
        unsafe {
            let b = &mut *block;
            b.free = false;
            b.user_size = user_size;
            b.stamp();

            let user_ptr = (block as usize + HEADER_SIZE) as *mut u8;
            let canary_ptr = (user_ptr as usize + user_size) as *mut u64;
            canary_ptr.write_unaligned(CANARY);
            user_ptr
        }
    }

    fn dealloc(&mut self, ptr: *mut u8) {
        if (ptr as usize) < self.pool_start + HEADER_SIZE || (ptr as usize) >= self.pool_end {
            crate::kerror!("heap: free of out-of-range pointer {:p}", ptr);
            return;
        }
        let block = (ptr as usize - HEADER_SIZE) as *mut BlockHeader;
        // SAFETY: `block` lies within the pool and is checked below.
        unsafe {
            let b = &mut *block;
            if !b.is_valid() {
                crate::kerror!("heap corruption: bad header at free of {:p}", ptr);
                return;
            }
            let canary_ptr = (ptr as usize + b.user_size) as *mut u64;
            if canary_ptr.read_unaligned() != CANARY {
                crate::kerror!("heap corruption: canary overwritten past {:p}", ptr);
                return;
            }
            if b.free {
                crate::kerror!("heap: double free of {:p}", ptr);
                return;
            }
            b.free = true;
            b.user_size = 0;
            b.stamp();
        }
        self.coalesce(block);
    }
}

static HEAP: Spinlock<FreeListHeap> = Spinlock::new(FreeListHeap::new());

struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        HEAP.lock().alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        HEAP.lock().dealloc(ptr);
    }
}

// Only the bare-metal target runs this allocator; host unit tests (`cargo
// test` without `target_os = "none"`) use the system allocator instead, so
// pure-logic tests elsewhere in the crate don't need a mapped heap region.
#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    crate::panic::kpanic(&alloc::format!(
        "allocation of {} bytes (align {}) failed: heap exhausted",
        layout.size(),
        layout.align()
    ))
}

/// Carve the heap pool out of the kernel address space and hand it to the
/// global allocator.
pub fn init() {
    let pagemap = super::paging::kernel_pagemap();
    let hint = crate::mm::VirtAddr::new(0xFFFF_9000_0000_0000);
    let pool_start = NonNull::new(hint.as_mut_ptr::<u8>()).unwrap();

    for i in 0..FF_POOL_PAGES {
        let frame = super::pmm::alloc(1).expect("out of memory initializing kernel heap");
        super::paging::map_page(
            pagemap,
            crate::mm::VirtAddr::new(hint.as_u64() + i * super::PAGE_SIZE as u64),
            frame,
            super::paging::PageFlags::WRITABLE,
        );
    }

    // SAFETY: the pages above were just mapped, writable, and are not
    // referenced by anything else.
    unsafe {
        HEAP.lock()
            .init(pool_start.as_ptr(), (FF_POOL_PAGES as usize) * super::PAGE_SIZE);
    }

    crate::kinfo!(
        "kernel heap: {} MiB at {:#x}",
        FF_POOL_PAGES * super::PAGE_SIZE as u64 / (1024 * 1024),
        hint.as_u64()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A plain heap-backed byte buffer stands in for the mapped pool: the
    /// header/canary logic under test never touches paging.
    fn new_heap(pool_size: usize) -> (FreeListHeap, alloc::vec::Vec<u8>) {
        let mut pool = alloc::vec![0u8; pool_size];
        let mut heap = FreeListHeap::new();
        // SAFETY: `pool` outlives `heap` within this test, is writable, and
        // is not aliased elsewhere.
        unsafe {
            heap.init(pool.as_mut_ptr(), pool.len());
        }
        (heap, pool)
    }

    #[test]
    fn alloc_then_free_is_idempotent_for_capacity() {
        let (mut heap, _pool) = new_heap(64 * 1024);
        let layout = Layout::from_size_align(128, 16).unwrap();
        for _ in 0..1000 {
            let ptr = heap.alloc(layout);
            assert!(!ptr.is_null());
            heap.dealloc(ptr);
        }
        // A single surviving free block means every split was coalesced back.
        assert!(!heap.head.is_null());
        let block = unsafe { &*heap.head };
        assert!(block.free);
        assert!(block.next.is_null());
    }

    #[test]
    fn canary_overwrite_is_detected_without_corrupting_future_allocations() {
        let (mut heap, _pool) = new_heap(64 * 1024);
        let layout = Layout::from_size_align(32, 16).unwrap();
        let ptr = heap.alloc(layout);
        assert!(!ptr.is_null());

        // Stomp one byte past the user region, into the canary.
        unsafe {
            ptr.add(32).write(0xFF);
        }
        heap.dealloc(ptr); // logs corruption, must not free the block

        let block = unsafe { &*((ptr as usize - HEADER_SIZE) as *mut BlockHeader) };
        assert!(!block.free, "corrupted block must not be returned to the free list");

        // The allocator must still work for unrelated requests.
        let other = heap.alloc(Layout::from_size_align(64, 16).unwrap());
        assert!(!other.is_null());
    }

    #[test]
    fn header_check_catches_corrupted_bookkeeping() {
        let (mut heap, _pool) = new_heap(4096);
        let ptr = heap.alloc(Layout::from_size_align(16, 16).unwrap());
        let block = unsafe { &mut *((ptr as usize - HEADER_SIZE) as *mut BlockHeader) };
        block.block_size += 1; // corrupt without restamping
        assert!(!block.is_valid());
    }
}
