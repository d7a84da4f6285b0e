//! Kernel-export (AXAPI) resolution table (§3 "AXAPI tables", §6 "AXAPI
//! ABI for modules").
//!
//! The exports side is a read-only array linked into the kernel image at
//! `.axapi.exports` (see `linker-x86_64.ld`); modules never add to it.
//! Declaring an export is `#[used] #[link_section = ".axapi.exports"]`
//! on a `static AxapiExport`, by convention grouped in the subsystem that
//! owns the exported function.

use crate::elf::types::{AxapiExport, AxapiImport};
use crate::mm::PhysAddr;

unsafe extern "C" {
    static __axapi_exports_start: AxapiExport;
    static __axapi_exports_end: AxapiExport;
}

fn exports() -> &'static [AxapiExport] {
    // SAFETY: both symbols bound the `.axapi.exports` output section,
    // which the linker script packs as a contiguous array of
    // `AxapiExport`; the range is valid for the kernel's entire lifetime.
    unsafe {
        let start = &__axapi_exports_start as *const AxapiExport;
        let end = &__axapi_exports_end as *const AxapiExport;
        let len = end.offset_from(start) as usize;
        core::slice::from_raw_parts(start, len)
    }
}

/// Compare two NUL-terminated C strings by address, without allocating.
/// Both pointers are either kernel rodata (the export table) or a module
/// image mapped read-only through the HHDM; the loader validates ELF
/// section bounds before either pointer reaches this function.
fn c_str_eq(a: u64, b: u64) -> bool {
    // SAFETY: see above.
    unsafe {
        let mut i = 0isize;
        loop {
            let ca = *(a as *const u8).offset(i);
            let cb = *(b as *const u8).offset(i);
            if ca != cb {
                return false;
            }
            if ca == 0 {
                return true;
            }
            i += 1;
        }
    }
}

fn c_str(ptr: u64) -> alloc::string::String {
    let mut s = alloc::string::String::new();
    let mut i = 0usize;
    loop {
        // SAFETY: see `c_str_eq`; import/export names are NUL-terminated
        // by the AXAPI ABI.
        let b = unsafe { *(ptr as *const u8).add(i) };
        if b == 0 {
            break;
        }
        s.push(b as char);
        i += 1;
    }
    s
}

/// Linear scan of `.axapi.exports` for a matching name, per §4.7 step 5.
pub fn resolve(name_ptr: u64) -> Option<u64> {
    exports()
        .iter()
        .find(|e| c_str_eq(e.name_ptr, name_ptr))
        .map(|e| e.symbol_addr)
}

/// Patch every slot in a module's `.axapi.imports` section against the
/// kernel's exports, walking `pagemap` to find each slot's backing frame
/// and writing through the HHDM. Returns the name of the first unresolved
/// import, if any — the loader logs it and refuses to start `mod_init`.
pub fn resolve_imports(
    pagemap: &crate::mm::paging::PageMap,
    imports: &[AxapiImport],
) -> Result<(), alloc::string::String> {
    for import in imports {
        // `name_vaddr`/`slot_vaddr` are addresses in the module's own
        // address space, not the kernel's, so both need translating
        // through that module's page table before they're dereferenced.
        let name_virt = crate::mm::VirtAddr::new(import.name_vaddr);
        let Some(name_phys) = crate::mm::paging::translate(pagemap, name_virt) else {
            return Err(alloc::string::String::from("<unmapped import name>"));
        };
        let name_ptr = name_phys.to_virt().as_u64();

        let Some(addr) = resolve(name_ptr) else {
            return Err(c_str(name_ptr));
        };
        let slot_virt = crate::mm::VirtAddr::new(import.slot_vaddr);
        let Some(slot_phys) = crate::mm::paging::translate(pagemap, slot_virt) else {
            return Err(c_str(name_ptr));
        };
        write_u64(slot_phys, addr);
    }
    Ok(())
}

fn write_u64(phys: PhysAddr, value: u64) {
    let ptr = phys.to_virt().as_mut_ptr::<u64>();
    // SAFETY: `phys` was just resolved from a mapped page in the module's
    // address space; the HHDM alias is writable kernel memory.
    unsafe {
        ptr.write_unaligned(value);
    }
}
