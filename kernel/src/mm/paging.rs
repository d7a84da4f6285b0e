//! Four-level x86_64 page tables (§3, §4.2).
//!
//! Every table is addressed through the HHDM: an entry's frame field is
//! `phys & frame_mask`, and reading/writing it from kernel context means
//! dereferencing `(phys & frame_mask) + H` where `H` is the boot-reported
//! HHDM offset. There is no recursive mapping trick here; the direct map
//! makes one unnecessary.

use bitflags::bitflags;

use super::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::mm::pmm;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT      = 1 << 0;
        const WRITABLE     = 1 << 1;
        const USER         = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE     = 1 << 4;
        const ACCESSED     = 1 << 5;
        const DIRTY        = 1 << 6;
        const HUGE         = 1 << 7;
        const GLOBAL       = 1 << 8;
        const NO_EXECUTE   = 1 << 63;
    }
}

/// Link-time base of the higher half, matching `linker-x86_64.ld`'s
/// `. = 0xffffffff80000000`.
const KERNEL_VIRT_BASE: u64 = 0xffffffff80000000;

// Section boundaries, defined by `linker-x86_64.ld`. These bracket the
// kernel image's own mapping: text is R+X, rodata is R only, data/bss are
// RW (and gain NO_EXECUTE from `enforce_wx`).
unsafe extern "C" {
    static __text_start: u8;
    static __text_end: u8;
    static __rodata_start: u8;
    static __rodata_end: u8;
    static __data_start: u8;
    static __data_end: u8;
}

const FRAME_MASK: u64 = 0x000F_FFFF_FFFF_F000;

#[derive(Clone, Copy)]
#[repr(transparent)]
struct Entry(u64);

impl Entry {
    const fn empty() -> Self {
        Self(0)
    }

    fn is_present(&self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    fn frame(&self) -> PhysAddr {
        PhysAddr::new(self.0 & FRAME_MASK)
    }

    fn set(&mut self, frame: PhysAddr, flags: PageFlags) {
        self.0 = (frame.as_u64() & FRAME_MASK) | flags.bits();
    }

    fn clear(&mut self) {
        self.0 = 0;
    }
}

#[repr(C, align(4096))]
struct Table {
    entries: [Entry; 512],
}

impl Table {
    /// Borrow the table at `phys` through the HHDM.
    ///
    /// # Safety
    /// `phys` must be a frame this code owns as a page table.
    unsafe fn at<'a>(phys: PhysAddr) -> &'a mut Table {
        // SAFETY: `phys` is a frame this code owns as a page table, per
        // this fn's safety contract.
        unsafe { &mut *phys.to_virt().as_mut_ptr::<Table>() }
    }
}

struct VaIndices {
    l4: usize,
    l3: usize,
    l2: usize,
    l1: usize,
}

/// A writable leaf must never also be executable, regardless of what the
/// caller asked for.
fn enforce_wx(mut flags: PageFlags) -> PageFlags {
    if flags.contains(PageFlags::WRITABLE) {
        flags |= PageFlags::NO_EXECUTE;
    }
    flags
}

fn split(va: VirtAddr) -> VaIndices {
    let a = va.as_u64();
    VaIndices {
        l4: ((a >> 39) & 0x1FF) as usize,
        l3: ((a >> 30) & 0x1FF) as usize,
        l2: ((a >> 21) & 0x1FF) as usize,
        l1: ((a >> 12) & 0x1FF) as usize,
    }
}

/// A standalone address-space root, created for the kernel at boot and for
/// every process thereafter (§3 "Address space").
pub struct PageMap {
    pub l4_phys: PhysAddr,
}

static mut KERNEL_PAGEMAP: Option<PageMap> = None;

fn descend_or_create(parent: &mut Table, index: usize) -> &mut Table {
    let entry = &mut parent.entries[index];
    if !entry.is_present() {
        let frame = pmm::alloc(1).expect("out of memory allocating page table frame");
        entry.set(frame, PageFlags::PRESENT | PageFlags::WRITABLE);
    }
    // SAFETY: either just allocated and zeroed by the PMM, or previously
    // installed by this same code path.
    unsafe { Table::at(entry.frame()) }
}

/// Map `page` to `frame` in the given address space.
///
/// W^X is enforced unconditionally: a `WRITABLE` request silently gains
/// `NO_EXECUTE`, regardless of what the caller passed.
pub fn map_page(pagemap: &PageMap, page: VirtAddr, frame: PhysAddr, flags: PageFlags) {
    debug_assert!(page.is_page_aligned());
    let flags = enforce_wx(flags);

    let idx = split(page);
    // SAFETY: `l4_phys` is a valid page-table root owned by this pagemap.
    let l4 = unsafe { Table::at(pagemap.l4_phys) };
    let l3 = descend_or_create(l4, idx.l4);
    let l2 = descend_or_create(l3, idx.l3);
    let l1 = descend_or_create(l2, idx.l2);

    l1.entries[idx.l1].set(frame, flags | PageFlags::PRESENT);
    invalidate_if_current(pagemap, page);
}

/// Map `count` contiguous pages starting at `page` to `count` contiguous
/// frames starting at `frame`.
pub fn map_pages(pagemap: &PageMap, page: VirtAddr, frame: PhysAddr, count: u64, flags: PageFlags) {
    for i in 0..count {
        map_page(
            pagemap,
            VirtAddr::new(page.as_u64() + i * PAGE_SIZE as u64),
            PhysAddr::new(frame.as_u64() + i * PAGE_SIZE as u64),
            flags,
        );
    }
}

/// Unmap `page`. Unmapping an absent page is logged and returned, not
/// treated as fatal (§4.2).
pub fn unmap_page(pagemap: &PageMap, page: VirtAddr) -> Option<PhysAddr> {
    let idx = split(page);
    // SAFETY: root is a valid table owned by this pagemap.
    let l4 = unsafe { Table::at(pagemap.l4_phys) };
    let l4e = &l4.entries[idx.l4];
    if !l4e.is_present() {
        crate::kwarn!("unmap_page: {:#x} has no L4 entry", page.as_u64());
        return None;
    }
    let l3 = unsafe { Table::at(l4e.frame()) };
    let l3e = &l3.entries[idx.l3];
    if !l3e.is_present() {
        crate::kwarn!("unmap_page: {:#x} has no L3 entry", page.as_u64());
        return None;
    }
    let l2 = unsafe { Table::at(l3e.frame()) };
    let l2e = &l2.entries[idx.l2];
    if !l2e.is_present() {
        crate::kwarn!("unmap_page: {:#x} has no L2 entry", page.as_u64());
        return None;
    }
    let l1 = unsafe { Table::at(l2e.frame()) };
    let l1e = &mut l1.entries[idx.l1];
    if !l1e.is_present() {
        crate::kwarn!("unmap_page: {:#x} already unmapped", page.as_u64());
        return None;
    }
    let frame = l1e.frame();
    l1e.clear();
    invalidate_if_current(pagemap, page);
    Some(frame)
}

/// Resolve a mapped page to its backing frame without altering the
/// mapping, for `vmm::Vctx::vget_phys`.
pub fn translate(pagemap: &PageMap, page: VirtAddr) -> Option<PhysAddr> {
    let idx = split(page);
    // SAFETY: root is a valid table owned by this pagemap.
    let l4 = unsafe { Table::at(pagemap.l4_phys) };
    let l4e = &l4.entries[idx.l4];
    if !l4e.is_present() {
        return None;
    }
    let l3 = unsafe { Table::at(l4e.frame()) };
    let l3e = &l3.entries[idx.l3];
    if !l3e.is_present() {
        return None;
    }
    let l2 = unsafe { Table::at(l3e.frame()) };
    let l2e = &l2.entries[idx.l2];
    if !l2e.is_present() {
        return None;
    }
    let l1 = unsafe { Table::at(l2e.frame()) };
    let l1e = &l1.entries[idx.l1];
    if !l1e.is_present() {
        return None;
    }
    Some(l1e.frame())
}

pub fn unmap_pages(pagemap: &PageMap, page: VirtAddr, count: u64) {
    for i in 0..count {
        unmap_page(pagemap, VirtAddr::new(page.as_u64() + i * PAGE_SIZE as u64));
    }
}

fn invalidate_if_current(pagemap: &PageMap, page: VirtAddr) {
    let current = x86_64::registers::control::Cr3::read().0.start_address().as_u64();
    if current == pagemap.l4_phys.as_u64() {
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(page.as_u64()));
    }
}

/// Allocate a fresh, zeroed L4 table for a new address space.
pub fn create_pagemap() -> PageMap {
    let frame = pmm::alloc(1).expect("out of memory creating address space");
    PageMap { l4_phys: frame }
}

/// Free an address space's L4 table and every table it owns. Does not free
/// leaf data frames; those belong to the region list (`vmm`), not to the
/// raw page table.
pub fn destroy_pagemap(pagemap: PageMap) {
    // SAFETY: caller guarantees no other CPU is walking this pagemap.
    let l4 = unsafe { Table::at(pagemap.l4_phys) };
    for l4e in l4.entries.iter() {
        if !l4e.is_present() {
            continue;
        }
        let l3 = unsafe { Table::at(l4e.frame()) };
        for l3e in l3.entries.iter() {
            if !l3e.is_present() {
                continue;
            }
            let l2 = unsafe { Table::at(l3e.frame()) };
            for l2e in l2.entries.iter() {
                if l2e.is_present() {
                    pmm::free(l2e.frame(), 1);
                }
            }
            pmm::free(l3e.frame(), 1);
        }
        pmm::free(l4e.frame(), 1);
    }
    pmm::free(pagemap.l4_phys, 1);
}

/// Map the kernel image's own sections at their link-time higher-half
/// addresses, each with the permissions its contents require: `.text` stays
/// executable and non-writable, `.rodata` loses both write and execute,
/// `.data`/`.bss` are writable (and pick up `NO_EXECUTE` from `enforce_wx`).
///
/// Without this, the only mapping for kernel code is the HHDM mirror built
/// by the loop in `init` below; the kernel does not execute from there, so
/// the very first instruction fetch after the `Cr3::write` in `init` would
/// fault.
fn map_kernel_image(pagemap: &PageMap, kernel_phys_base: u64) {
    // SAFETY: these name linker-provided boundary symbols, not storage; only
    // their addresses are taken, never read through.
    let (text_start, text_end, rodata_start, rodata_end, data_start, data_end) = unsafe {
        (
            &__text_start as *const u8 as u64,
            &__text_end as *const u8 as u64,
            &__rodata_start as *const u8 as u64,
            &__rodata_end as *const u8 as u64,
            &__data_start as *const u8 as u64,
            &__data_end as *const u8 as u64,
        )
    };

    let sections = [
        (text_start, text_end, PageFlags::PRESENT),
        (rodata_start, rodata_end, PageFlags::PRESENT | PageFlags::NO_EXECUTE),
        (data_start, data_end, PageFlags::PRESENT | PageFlags::WRITABLE),
    ];

    for (start, end, flags) in sections {
        let start_page = start & !(PAGE_SIZE as u64 - 1);
        let pages = (end - start_page).div_ceil(PAGE_SIZE as u64);
        let phys = PhysAddr::new(kernel_phys_base + (start_page - KERNEL_VIRT_BASE));
        map_pages(pagemap, VirtAddr::new(start_page), phys, pages, flags);
    }
}

/// Build the kernel's page table root: map every non-reserved memory-map
/// region into the HHDM window, map the kernel image with section-exact
/// permissions at its link-time higher-half addresses, then load the
/// result into CR3.
pub fn init() {
    let params = crate::boot::params();
    let pagemap = create_pagemap();

    for entry in params.memory_map() {
        if matches!(entry.kind, crate::boot::MemoryKind::Reserved) {
            continue;
        }
        let pages = entry.size.div_ceil(PAGE_SIZE as u64);
        let phys = PhysAddr::new(entry.base);

        map_pages(
            &pagemap,
            VirtAddr::new(phys.to_virt().as_u64()),
            phys,
            pages,
            PageFlags::WRITABLE,
        );
    }

    map_kernel_image(&pagemap, params.kernel_phys_base);

    // SAFETY: single-threaded boot context; nothing else observes the
    // kernel pagemap before this point.
    unsafe {
        KERNEL_PAGEMAP = Some(pagemap);
    }
    let kernel_pagemap = kernel_pagemap();

    // SAFETY: the new root maps the kernel image at its link-time higher-half
    // addresses (`map_kernel_image`, above), so the instruction fetch right
    // after this CR3 switch — and the stack touch it implies — both stay
    // inside mappings this same root just installed.
    unsafe {
        x86_64::registers::control::Cr3::write(
            x86_64::structures::paging::PhysFrame::containing_address(x86_64::PhysAddr::new(
                kernel_pagemap.l4_phys.as_u64(),
            )),
            x86_64::registers::control::Cr3Flags::empty(),
        );
    }

    crate::kinfo!("kernel page tables installed, HHDM at {:#x}", params.hhdm_offset);
}

/// The kernel address space's page table root, installed by [`init`].
pub fn kernel_pagemap() -> &'static PageMap {
    #[allow(static_mut_refs)]
    unsafe {
        KERNEL_PAGEMAP.as_ref().expect("paging::init not called yet")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_decodes_the_four_nine_bit_indices() {
        // L4=1, L3=2, L2=3, L1=4, all shifted into place.
        let va = VirtAddr::new((1u64 << 39) | (2 << 30) | (3 << 21) | (4 << 12));
        let idx = split(va);
        assert_eq!(idx.l4, 1);
        assert_eq!(idx.l3, 2);
        assert_eq!(idx.l2, 3);
        assert_eq!(idx.l1, 4);
    }

    #[test]
    fn writable_request_always_gains_no_execute() {
        let flags = enforce_wx(PageFlags::WRITABLE | PageFlags::USER);
        assert!(flags.contains(PageFlags::NO_EXECUTE));
        assert!(flags.contains(PageFlags::WRITABLE));
    }

    #[test]
    fn read_only_request_is_left_alone() {
        let flags = enforce_wx(PageFlags::PRESENT);
        assert!(!flags.contains(PageFlags::NO_EXECUTE));
    }

    #[test]
    fn entry_round_trips_frame_and_flags_modulo_frame_mask() {
        let mut entry = Entry::empty();
        assert!(!entry.is_present());
        let frame = PhysAddr::new(0x1234_5000);
        entry.set(frame, PageFlags::PRESENT | PageFlags::WRITABLE);
        assert!(entry.is_present());
        assert_eq!(entry.frame().as_u64(), frame.as_u64());
    }
}
