//! Region-tracking layer over a page table: `vctx` owns a sorted list of
//! non-overlapping virtual regions on top of a `PageMap` (§3 "Address
//! space", §4.2).

use alloc::vec::Vec;

use super::paging::{self, PageFlags, PageMap};
use super::{pmm, PhysAddr, VirtAddr, PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Frames were allocated by this region and are owned by it.
    Owned,
    /// Frames are caller-owned (MMIO, framebuffer); this region only
    /// records the mapping.
    Borrowed,
}

#[derive(Debug, Clone, Copy)]
struct Region {
    start: VirtAddr,
    pages: u64,
    flags: PageFlags,
    kind: RegionKind,
}

/// An address space's page table plus the region list tracking what is
/// mapped into it.
pub struct Vctx {
    pub pagemap: PageMap,
    regions: Vec<Region>,
}

fn overlaps(a_start: u64, a_pages: u64, b_start: u64, b_pages: u64) -> bool {
    let a_end = a_start + a_pages * PAGE_SIZE as u64;
    let b_end = b_start + b_pages * PAGE_SIZE as u64;
    a_start < b_end && b_start < a_end
}

impl Vctx {
    /// Create a region-tracking context over a fresh page table.
    pub fn vinit() -> Self {
        Self {
            pagemap: paging::create_pagemap(),
            regions: Vec::new(),
        }
    }

    fn insert_sorted(&mut self, region: Region) {
        let pos = self
            .regions
            .iter()
            .position(|r| r.start.as_u64() > region.start.as_u64())
            .unwrap_or(self.regions.len());
        self.regions.insert(pos, region);
    }

    fn find_free_range(&self, pages: u64, hint: VirtAddr) -> VirtAddr {
        let mut candidate = hint.as_u64();
        loop {
            if !self
                .regions
                .iter()
                .any(|r| overlaps(candidate, pages, r.start.as_u64(), r.pages))
            {
                return VirtAddr::new(candidate);
            }
            let bumped = self
                .regions
                .iter()
                .find(|r| overlaps(candidate, pages, r.start.as_u64(), r.pages))
                .map(|r| r.start.as_u64() + r.pages * PAGE_SIZE as u64)
                .unwrap_or(candidate + PAGE_SIZE as u64);
            candidate = bumped;
        }
    }

    /// Allocate `pages` fresh physical frames and map them starting near
    /// `hint`. The region owns the frames it allocated.
    pub fn valloc(&mut self, hint: VirtAddr, pages: u64, flags: PageFlags) -> Option<VirtAddr> {
        let start = self.find_free_range(pages, hint);
        for i in 0..pages {
            let frame = pmm::alloc(1)?;
            paging::map_page(
                &self.pagemap,
                VirtAddr::new(start.as_u64() + i * PAGE_SIZE as u64),
                frame,
                flags,
            );
        }
        self.insert_sorted(Region {
            start,
            pages,
            flags,
            kind: RegionKind::Owned,
        });
        Some(start)
    }

    /// Map `pages` frames starting at `phys` at a freshly chosen virtual
    /// range; the region owns the virtual range but not the frames.
    pub fn vallocat(
        &mut self,
        hint: VirtAddr,
        phys: PhysAddr,
        pages: u64,
        flags: PageFlags,
    ) -> VirtAddr {
        let start = self.find_free_range(pages, hint);
        paging::map_pages(&self.pagemap, start, phys, pages, flags);
        self.insert_sorted(Region {
            start,
            pages,
            flags,
            kind: RegionKind::Borrowed,
        });
        start
    }

    /// Record a mapping to caller-owned physical memory at a caller-chosen
    /// virtual address (MMIO, framebuffer). Neither frames nor, unlike
    /// `vallocat`, the virtual placement are chosen by this layer.
    pub fn vadd(&mut self, virt: VirtAddr, phys: PhysAddr, pages: u64, flags: PageFlags) {
        paging::map_pages(&self.pagemap, virt, phys, pages, flags);
        self.insert_sorted(Region {
            start: virt,
            pages,
            flags,
            kind: RegionKind::Borrowed,
        });
    }

    /// Unmap and, for owned regions, free the backing frames of the region
    /// starting at `start`.
    pub fn vfree(&mut self, start: VirtAddr) {
        let Some(pos) = self.regions.iter().position(|r| r.start.as_u64() == start.as_u64())
        else {
            crate::kwarn!("vfree: no region at {:#x}", start.as_u64());
            return;
        };
        let region = self.regions.remove(pos);
        for i in 0..region.pages {
            let page = VirtAddr::new(region.start.as_u64() + i * PAGE_SIZE as u64);
            if let Some(frame) = paging::unmap_page(&self.pagemap, page) {
                if region.kind == RegionKind::Owned {
                    pmm::free(frame, 1);
                }
            }
        }
    }

    /// Look up the region containing `addr`, if any.
    pub fn vget(&self, addr: VirtAddr) -> Option<(VirtAddr, u64, PageFlags)> {
        self.regions
            .iter()
            .find(|r| {
                let start = r.start.as_u64();
                let end = start + r.pages * PAGE_SIZE as u64;
                (start..end).contains(&addr.as_u64())
            })
            .map(|r| (r.start, r.pages, r.flags))
    }

    /// Resolve `addr` to its backing physical address, if mapped.
    pub fn vget_phys(&self, addr: VirtAddr) -> Option<PhysAddr> {
        self.vget(addr)?;
        let page = VirtAddr::new(addr.as_u64() & !(PAGE_SIZE as u64 - 1));
        let offset = addr.as_u64() - page.as_u64();
        // A lookup must not mutate the mapping it inspects; re-derive the
        // frame by walking the same tables `unmap_page` would, without
        // clearing the entry.
        paging::translate(&self.pagemap, page).map(|f| PhysAddr::new(f.as_u64() + offset))
    }
}

impl Drop for Vctx {
    fn drop(&mut self) {
        let starts: Vec<VirtAddr> = self.regions.iter().map(|r| r.start).collect();
        for start in starts {
            self.vfree(start);
        }
        // SAFETY: `PageMap` carries no Drop impl of its own and nothing
        // else can reach this pagemap once `Vctx` is being dropped, so
        // reading it out here and handing it to `destroy_pagemap` does not
        // produce a double-free.
        let pagemap = unsafe { core::ptr::read(&self.pagemap) };
        paging::destroy_pagemap(pagemap);
    }
}
