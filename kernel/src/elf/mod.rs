//! ELF64 module loader: validates an image, maps its segments into a fresh
//! address space, resolves AXAPI imports against the kernel's exports, and
//! submits the module's init thread (§4.7).

pub mod axapi;
pub mod types;

use alloc::vec::Vec;

use crate::mm::paging::PageFlags;
use crate::mm::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::sched::task::ProcessHandle;
use crate::sched::task::ThreadHandle;
use types::{
    AxapiImport, Elf64Header, Elf64ProgramHeader, Elf64SectionHeader, Elf64Symbol, ElfError,
    ModInfo, ELFCLASS64, ELF_MAGIC, EM_X86_64, PF_W, PF_X, PT_LOAD, SHT_SYMTAB, STT_FUNC,
};

/// Result of a successful load: the process the module now runs in and its
/// submitted init thread.
pub struct LoadedModule {
    pub process: ProcessHandle,
    pub thread: ThreadHandle,
    pub name: alloc::string::String,
}

struct LoadedImage {
    image: PhysAddr,
    header: Elf64Header,
    base_vaddr: u64,
    end_vaddr: u64,
}

/// Every module's image and load range, kept around for the panic path's
/// address-to-symbol lookup (§4.7, §4.8).
static LOADED_IMAGES: crate::sync::Spinlock<Vec<LoadedImage>> = crate::sync::Spinlock::new(Vec::new());

/// Resolve `addr` against whichever loaded module's range contains it, per
/// §4.7's "Address-to-symbol lookup ... for panic traces".
pub fn symbolize_loaded(addr: u64) -> Option<alloc::string::String> {
    let images = LOADED_IMAGES.lock();
    let img = images
        .iter()
        .find(|i| addr >= i.base_vaddr && addr < i.end_vaddr)?;
    symbolize(img.image, &img.header, addr)
}

/// Read a value of type `T` at byte offset `off` within a physical region,
/// through the HHDM. The loader never assumes the image's own virtual
/// addresses are active yet (§4.7 step 4).
unsafe fn read_at<T: Copy>(base: PhysAddr, off: u64) -> T {
    let ptr = base.to_virt().as_u64() + off;
    // SAFETY: forwarded from the caller, who has checked `off + size_of::<T>()`
    // lies within the image's mapped physical region.
    unsafe { core::ptr::read_unaligned(ptr as *const T) }
}

fn read_c_str(base: PhysAddr, off: u64) -> alloc::string::String {
    let mut s = alloc::string::String::new();
    let mut i = 0u64;
    loop {
        // SAFETY: string tables are NUL-terminated and lie within the
        // image region validated by the caller before this is reached.
        let b: u8 = unsafe { read_at(base, off + i) };
        if b == 0 {
            break;
        }
        s.push(b as char);
        i += 1;
    }
    s
}

/// Validate the ELF header, load every PT_LOAD segment into a fresh
/// physical allocation and address space, resolve AXAPI imports, and
/// submit the init thread. `image` is a physical region containing the
/// whole ELF file.
pub fn load_module(image: PhysAddr, size: u64) -> Result<LoadedModule, ElfError> {
    let header: Elf64Header = unsafe { read_at(image, 0) };
    if header.magic != ELF_MAGIC {
        return Err(ElfError::InvalidMagic);
    }
    if header.class != ELFCLASS64 {
        return Err(ElfError::InvalidClass);
    }
    if header.machine != EM_X86_64 {
        return Err(ElfError::UnsupportedMachine);
    }
    let phtab_end = header.phoff + header.phnum as u64 * header.phentsize as u64;
    let shtab_end = header.shoff + header.shnum as u64 * header.shentsize as u64;
    if phtab_end > size || shtab_end > size {
        return Err(ElfError::NoLoadSegments);
    }

    let program_headers = read_program_headers(image, &header);
    let loads: Vec<&Elf64ProgramHeader> = program_headers
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD)
        .collect();
    if loads.is_empty() {
        return Err(ElfError::NoLoadSegments);
    }

    let base_vaddr = loads.iter().map(|ph| ph.p_vaddr).min().unwrap() & !(PAGE_SIZE as u64 - 1);
    let end_vaddr = loads
        .iter()
        .map(|ph| (ph.p_vaddr + ph.p_memsz).div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64)
        .max()
        .unwrap();
    let span_pages = (end_vaddr - base_vaddr) / PAGE_SIZE as u64;

    let Some(phys) = crate::mm::pmm::alloc(span_pages) else {
        return Err(ElfError::OutOfMemory);
    };

    for ph in &loads {
        let dest_off = ph.p_vaddr - base_vaddr;
        copy_segment(image, ph, phys, dest_off);
    }

    let process = crate::sched::proc_create("module");
    let pagemap = &process.get().address_space.pagemap;
    for ph in &loads {
        map_segment(pagemap, ph, base_vaddr, phys);
    }

    let Some(modinfo) = find_symbol_value(image, &header, "modinfo") else {
        pmm_free_span(phys, span_pages);
        return Err(ElfError::MissingModInfo);
    };
    let modinfo_phys = phys_of(phys, base_vaddr, modinfo);
    let info: ModInfo = unsafe { read_at(modinfo_phys, 0) };
    // `name`/`desc`/`author` are pointers within the module's own image,
    // same as the `modinfo` symbol above, so they need the same
    // vaddr-to-loaded-phys translation rather than being raw phys addrs.
    let name = read_c_str(phys_of(phys, base_vaddr, info.name), 0);
    let desc = read_c_str(phys_of(phys, base_vaddr, info.desc), 0);
    let author = read_c_str(phys_of(phys, base_vaddr, info.author), 0);
    crate::kinfo!("module '{}': {} (by {})", name, desc, author);

    if let Some(imports_section) = find_section(image, &header, ".axapi.imports") {
        let imports = read_imports(image, &imports_section);
        if let Err(unresolved) = axapi::resolve_imports(pagemap, &imports) {
            crate::kwarn!("Unresolved AXAPI import: {}", unresolved);
            pmm_free_span(phys, span_pages);
            return Err(ElfError::UnresolvedImport);
        }
    }

    let entry = if info.mod_init != 0 { info.mod_init } else { header.entry };
    let Some(thread) = crate::sched::thread_create(process, entry) else {
        pmm_free_span(phys, span_pages);
        return Err(ElfError::OutOfMemory);
    };

    LOADED_IMAGES.lock().push(LoadedImage {
        image,
        header,
        base_vaddr,
        end_vaddr,
    });

    Ok(LoadedModule { process, thread, name })
}

fn pmm_free_span(phys: PhysAddr, pages: u64) {
    crate::mm::pmm::free(phys, pages);
}

fn read_program_headers(image: PhysAddr, header: &Elf64Header) -> Vec<Elf64ProgramHeader> {
    (0..header.phnum as u64)
        .map(|i| unsafe { read_at(image, header.phoff + i * header.phentsize as u64) })
        .collect()
}

fn read_section_headers(image: PhysAddr, header: &Elf64Header) -> Vec<Elf64SectionHeader> {
    (0..header.shnum as u64)
        .map(|i| unsafe { read_at(image, header.shoff + i * header.shentsize as u64) })
        .collect()
}

fn section_name(image: PhysAddr, header: &Elf64Header, section: &Elf64SectionHeader) -> alloc::string::String {
    let sections = read_section_headers(image, header);
    let strtab = &sections[header.shstrndx as usize];
    read_c_str(image, strtab.sh_offset + section.sh_name as u64)
}

fn find_section(
    image: PhysAddr,
    header: &Elf64Header,
    name: &str,
) -> Option<Elf64SectionHeader> {
    read_section_headers(image, header)
        .into_iter()
        .find(|s| section_name(image, header, s) == name)
}

/// Find `name` in `.symtab`/`.strtab` and return its `st_value` (§4.7 step 4).
fn find_symbol_value(image: PhysAddr, header: &Elf64Header, name: &str) -> Option<u64> {
    let sections = read_section_headers(image, header);
    let symtab = sections.iter().find(|s| s.sh_type == SHT_SYMTAB)?;
    let strtab = &sections[symtab.sh_link as usize];
    let count = symtab.sh_size / symtab.sh_entsize.max(1);
    for i in 0..count {
        let sym: Elf64Symbol = unsafe { read_at(image, symtab.sh_offset + i * symtab.sh_entsize) };
        let sym_name = read_c_str(image, strtab.sh_offset + sym.st_name as u64);
        if sym_name == name {
            return Some(sym.st_value);
        }
    }
    None
}

/// Address-to-symbol lookup for panic traces (§4.7): the greatest-addressed
/// `STT_FUNC` symbol with `st_value <= addr`.
pub fn symbolize(image: PhysAddr, header: &Elf64Header, addr: u64) -> Option<alloc::string::String> {
    let sections = read_section_headers(image, header);
    let symtab = sections.iter().find(|s| s.sh_type == SHT_SYMTAB)?;
    let strtab = &sections[symtab.sh_link as usize];
    let count = symtab.sh_size / symtab.sh_entsize.max(1);

    let mut best: Option<(u64, u64)> = None;
    for i in 0..count {
        let sym: Elf64Symbol = unsafe { read_at(image, symtab.sh_offset + i * symtab.sh_entsize) };
        if sym.symbol_type() != STT_FUNC || sym.st_value > addr {
            continue;
        }
        if best.is_none_or(|(best_value, _)| sym.st_value > best_value) {
            best = Some((sym.st_value, sym.st_name as u64));
        }
    }
    best.map(|(_, name_off)| read_c_str(image, strtab.sh_offset + name_off))
}

fn read_imports(image: PhysAddr, section: &Elf64SectionHeader) -> Vec<AxapiImport> {
    let count = section.sh_size / core::mem::size_of::<AxapiImport>() as u64;
    (0..count)
        .map(|i| unsafe {
            read_at(image, section.sh_offset + i * core::mem::size_of::<AxapiImport>() as u64)
        })
        .collect()
}

fn copy_segment(image: PhysAddr, ph: &Elf64ProgramHeader, dest_phys: PhysAddr, dest_off: u64) {
    let src = (image.to_virt().as_u64() + ph.p_offset) as *const u8;
    let dst = (dest_phys.to_virt().as_u64() + dest_off) as *mut u8;
    // SAFETY: `src` lies within the validated image region for
    // `p_filesz` bytes; `dst` lies within the freshly allocated,
    // zero-filled `span_pages`-sized region at an offset computed from the
    // same base used to size that allocation.
    unsafe {
        core::ptr::copy_nonoverlapping(src, dst, ph.p_filesz as usize);
    }
}

fn map_segment(pagemap: &crate::mm::paging::PageMap, ph: &Elf64ProgramHeader, base_vaddr: u64, phys_base: PhysAddr) {
    let mut flags = PageFlags::PRESENT | PageFlags::USER;
    if ph.p_flags & PF_W != 0 {
        flags |= PageFlags::WRITABLE;
    }
    if ph.p_flags & PF_X == 0 {
        flags |= PageFlags::NO_EXECUTE;
    }

    let start_page = ph.p_vaddr & !(PAGE_SIZE as u64 - 1);
    let end_page = (ph.p_vaddr + ph.p_memsz).div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64;
    let pages = (end_page - start_page) / PAGE_SIZE as u64;
    let phys_off = start_page - base_vaddr;

    crate::mm::paging::map_pages(
        pagemap,
        VirtAddr::new(start_page),
        PhysAddr::new(phys_base.as_u64() + phys_off),
        pages,
        flags,
    );
}

fn phys_of(phys_base: PhysAddr, base_vaddr: u64, vaddr: u64) -> PhysAddr {
    PhysAddr::new(phys_base.as_u64() + (vaddr - base_vaddr))
}
