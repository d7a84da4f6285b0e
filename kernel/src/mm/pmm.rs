//! Physical frame allocator: a bitmap over every usable page, with a small
//! freed-frame cache for the hot single-frame path (§4.1).

use core::sync::atomic::{AtomicU64, Ordering};

use crate::boot::{BootParams, MemoryKind};
use crate::mm::PAGE_SIZE;
use crate::sync::Spinlock;

/// Depth of the single-frame freed cache.
const FREE_CACHE_DEPTH: usize = 32;

struct Bitmap {
    /// HHDM virtual pointer to the bitmap words; backing frames are
    /// carved out of the first usable region large enough to hold them.
    words: *mut u64,
    word_count: usize,
    /// One past the highest usable frame number.
    frame_count: u64,
    free_frames: u64,
}

// SAFETY: `words` always points at HHDM-mapped physical memory reserved for
// the lifetime of the kernel; all access goes through `PMM`'s spinlock.
unsafe impl Send for Bitmap {}

struct Pmm {
    bitmap: Option<Bitmap>,
    free_cache: [u64; FREE_CACHE_DEPTH],
    free_cache_len: usize,
}

impl Pmm {
    const fn new() -> Self {
        Self {
            bitmap: None,
            free_cache: [0; FREE_CACHE_DEPTH],
            free_cache_len: 0,
        }
    }

    fn bit(&self, frame: u64) -> bool {
        let bm = self.bitmap.as_ref().unwrap();
        let word = frame / 64;
        let bit = frame % 64;
        // SAFETY: `word` is checked by callers against `word_count`.
        unsafe { (*bm.words.add(word as usize) >> bit) & 1 == 1 }
    }

    fn set_bit(&mut self, frame: u64) {
        let bm = self.bitmap.as_ref().unwrap();
        let word = frame / 64;
        let bit = frame % 64;
        unsafe {
            *bm.words.add(word as usize) |= 1 << bit;
        }
    }

    fn clear_bit(&mut self, frame: u64) {
        let bm = self.bitmap.as_ref().unwrap();
        let word = frame / 64;
        let bit = frame % 64;
        unsafe {
            *bm.words.add(word as usize) &= !(1u64 << bit);
        }
    }

    /// Scan for `n` consecutive clear bits across word boundaries, skipping
    /// all-ones words outright.
    fn find_run(&self, n: u64) -> Option<u64> {
        let bm = self.bitmap.as_ref()?;
        let mut run_start = None;
        let mut run_len = 0u64;
        for word_idx in 0..bm.word_count {
            let word = unsafe { *bm.words.add(word_idx) };
            if word == u64::MAX {
                run_start = None;
                run_len = 0;
                continue;
            }
            for bit in 0..64u64 {
                let frame = word_idx as u64 * 64 + bit;
                if frame >= bm.frame_count {
                    return None;
                }
                if word & (1 << bit) == 0 {
                    if run_len == 0 {
                        run_start = Some(frame);
                    }
                    run_len += 1;
                    if run_len == n {
                        return run_start;
                    }
                } else {
                    run_len = 0;
                    run_start = None;
                }
            }
        }
        None
    }

    fn alloc_one_cached(&mut self) -> Option<u64> {
        if self.free_cache_len == 0 {
            return None;
        }
        self.free_cache_len -= 1;
        let frame = self.free_cache[self.free_cache_len];
        self.set_bit(frame);
        self.bitmap.as_mut().unwrap().free_frames -= 1;
        Some(frame)
    }
}

static PMM: Spinlock<Pmm> = Spinlock::new(Pmm::new());

/// Highest frame number across usable regions, used to size the bitmap.
fn highest_usable_frame(params: &BootParams) -> u64 {
    let mut max_frame = 0u64;
    for entry in params.memory_map() {
        if matches!(entry.kind, MemoryKind::Usable) {
            let end_frame = (entry.base + entry.size) / PAGE_SIZE as u64;
            max_frame = max_frame.max(end_frame);
        }
    }
    max_frame
}

/// Build the bitmap from the boot memory map: set every bit, clear the
/// ones covered by usable regions, then reserve frame 0 and the frames the
/// bitmap itself occupies.
pub fn init(params: &BootParams) {
    let frame_count = highest_usable_frame(params);
    if frame_count == 0 {
        crate::kerror!("no usable memory regions in boot map");
        return;
    }

    let word_count = frame_count.div_ceil(64) as usize;
    let bitmap_bytes = word_count * 8;
    let bitmap_frames = bitmap_bytes.div_ceil(PAGE_SIZE) as u64;

    let region = params
        .memory_map()
        .iter()
        .find(|e| matches!(e.kind, MemoryKind::Usable) && e.size >= bitmap_bytes as u64)
        .expect("no usable region large enough to hold the frame bitmap");

    let bitmap_phys = region.base;
    let bitmap_virt = crate::mm::PhysAddr::new(bitmap_phys).to_virt();

    // SAFETY: `bitmap_virt` is within the HHDM over memory the boot map
    // reports usable and not yet claimed by anything else.
    unsafe {
        core::ptr::write_bytes(bitmap_virt.as_mut_ptr::<u8>(), 0xFF, word_count * 8);
    }

    let mut pmm = PMM.lock();
    pmm.bitmap = Some(Bitmap {
        words: bitmap_virt.as_mut_ptr(),
        word_count,
        frame_count,
        free_frames: 0,
    });

    for entry in params.memory_map() {
        if !matches!(entry.kind, MemoryKind::Usable) {
            continue;
        }
        let start_frame = entry.base / PAGE_SIZE as u64;
        let end_frame = (entry.base + entry.size) / PAGE_SIZE as u64;
        for frame in start_frame..end_frame.min(frame_count) {
            pmm.clear_bit(frame);
            pmm.bitmap.as_mut().unwrap().free_frames += 1;
        }
    }

    // Frame 0 is always reserved: a zero physical address must stay invalid.
    pmm.set_bit(0);
    pmm.bitmap.as_mut().unwrap().free_frames =
        pmm.bitmap.as_ref().unwrap().free_frames.saturating_sub(1);

    // The bitmap's own backing frames can never be handed out.
    let bitmap_start_frame = bitmap_phys / PAGE_SIZE as u64;
    for frame in bitmap_start_frame..bitmap_start_frame + bitmap_frames {
        if !pmm.bit(frame) {
            pmm.set_bit(frame);
            pmm.bitmap.as_mut().unwrap().free_frames =
                pmm.bitmap.as_ref().unwrap().free_frames.saturating_sub(1);
        }
    }

    crate::kinfo!(
        "frame bitmap: {} frames ({} MiB usable), bitmap at {:#x}",
        frame_count,
        pmm.bitmap.as_ref().unwrap().free_frames * PAGE_SIZE as u64 / (1024 * 1024),
        bitmap_phys
    );
}

/// Total bytes freed by `pmm_reclaim`, exposed for diagnostics.
static RECLAIMED_BYTES: AtomicU64 = AtomicU64::new(0);

/// Convert bootloader-reclaimable and ACPI-reclaimable regions into usable
/// ones, skipping anything overlapping the bitmap's own backing frames.
pub fn reclaim(params: &BootParams) {
    let mut pmm = PMM.lock();
    let Some(bm) = pmm.bitmap.as_ref() else {
        return;
    };
    let frame_count = bm.frame_count;
    let mut reclaimed = 0u64;

    for entry in params.memory_map() {
        if !matches!(
            entry.kind,
            MemoryKind::BootloaderReclaimable | MemoryKind::AcpiReclaimable
        ) {
            continue;
        }
        let start_frame = entry.base / PAGE_SIZE as u64;
        let end_frame = (entry.base + entry.size) / PAGE_SIZE as u64;
        for frame in start_frame..end_frame.min(frame_count) {
            if pmm.bit(frame) {
                pmm.clear_bit(frame);
                pmm.bitmap.as_mut().unwrap().free_frames += 1;
                reclaimed += PAGE_SIZE as u64;
            }
        }
    }

    RECLAIMED_BYTES.fetch_add(reclaimed, Ordering::Relaxed);
    crate::kinfo!("reclaimed {} KiB of bootloader/ACPI memory", reclaimed / 1024);
}

/// Allocate `n` contiguous physical frames, zeroed, or return `None` on
/// exhaustion.
pub fn alloc(n: u64) -> Option<crate::mm::PhysAddr> {
    if n == 0 {
        return None;
    }
    let mut pmm = PMM.lock();

    if n == 1 {
        if let Some(frame) = pmm.alloc_one_cached() {
            let addr = crate::mm::PhysAddr::new(frame * PAGE_SIZE as u64);
            drop(pmm);
            zero_frame(addr, 1);
            return Some(addr);
        }
    }

    let Some(start) = pmm.find_run(n) else {
        return None;
    };
    for frame in start..start + n {
        pmm.set_bit(frame);
    }
    pmm.bitmap.as_mut().unwrap().free_frames -= n;
    let addr = crate::mm::PhysAddr::new(start * PAGE_SIZE as u64);
    drop(pmm);
    zero_frame(addr, n);
    Some(addr)
}

fn zero_frame(addr: crate::mm::PhysAddr, n: u64) {
    let virt = addr.to_virt();
    // SAFETY: the frames were just claimed from the bitmap and are not
    // referenced by anyone else yet.
    unsafe {
        core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, (n as usize) * PAGE_SIZE);
    }
}

/// Release `n` frames starting at `addr`. An unaligned address or an
/// out-of-range run is a silent no-op (§4.1's defensive failure mode).
pub fn free(addr: crate::mm::PhysAddr, n: u64) {
    if n == 0 || addr.as_u64() % PAGE_SIZE as u64 != 0 {
        return;
    }
    let start = addr.as_u64() / PAGE_SIZE as u64;
    let mut pmm = PMM.lock();
    let Some(bm) = pmm.bitmap.as_ref() else {
        return;
    };
    if start == 0 || start + n > bm.frame_count {
        return;
    }

    if n == 1 && pmm.free_cache_len < FREE_CACHE_DEPTH {
        let idx = pmm.free_cache_len;
        pmm.free_cache[idx] = start;
        pmm.free_cache_len += 1;
        return;
    }

    for frame in start..start + n {
        pmm.clear_bit(frame);
    }
    pmm.bitmap.as_mut().unwrap().free_frames += n;
}

/// Free frame count, for diagnostics and the scheduler's idle-load logging.
pub fn free_frames() -> u64 {
    PMM.lock().bitmap.as_ref().map(|b| b.free_frames).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Exercises the bitmap bookkeeping directly, bypassing `alloc`/`free`'s
    /// HHDM-backed zeroing so the test doesn't need `boot::init` to have run.
    fn new_bitmap(word_count: usize) -> Bitmap {
        let words: &'static mut [u64] = alloc::vec![0u64; word_count].leak();
        let frame_count = (word_count * 64) as u64;
        Bitmap {
            words: words.as_mut_ptr(),
            word_count,
            frame_count,
            free_frames: frame_count,
        }
    }

    #[test]
    fn ten_thousand_alloc_free_cycles_leave_free_count_unchanged() {
        let mut pmm = Pmm::new();
        pmm.bitmap = Some(new_bitmap(4));
        pmm.set_bit(0);
        pmm.bitmap.as_mut().unwrap().free_frames -= 1;

        let steady = pmm.alloc_one_cached().or_else(|| pmm.find_run(1)).unwrap();
        pmm.set_bit(steady);
        pmm.bitmap.as_mut().unwrap().free_frames -= 1;

        let before = pmm.bitmap.as_ref().unwrap().free_frames;
        for _ in 0..10_000 {
            let frame = pmm.find_run(1).unwrap();
            pmm.set_bit(frame);
            pmm.bitmap.as_mut().unwrap().free_frames -= 1;
            pmm.clear_bit(frame);
            pmm.bitmap.as_mut().unwrap().free_frames += 1;
        }
        assert_eq!(pmm.bitmap.as_ref().unwrap().free_frames, before);
        assert!(pmm.bit(0), "frame 0 stays reserved");
        assert!(pmm.bit(steady));
    }

    #[test]
    fn find_run_returns_a_run_of_clear_bits() {
        let mut pmm = Pmm::new();
        pmm.bitmap = Some(new_bitmap(2));
        let start = pmm.find_run(8).unwrap();
        for frame in start..start + 8 {
            assert!(!pmm.bit(frame));
        }
    }
}
