//! Hand-builds minimal ELF64 module images and drives `elf::load_module`
//! directly: a valid module with no imports loads successfully, and one
//! with an `.axapi.imports` entry naming an export that doesn't exist is
//! rejected with the unresolved-import error (§4.7, §8).

#![no_std]
#![no_main]

extern crate alloc;

mod common;

use alloc::vec::Vec;
use core::mem::size_of;

use axkrnl::elf::types::{
    AxapiImport, Elf64Header, Elf64ProgramHeader, Elf64SectionHeader, Elf64Symbol, ElfError,
    ModInfo, ELFCLASS64, ELF_MAGIC, EM_X86_64, PF_W, PT_LOAD, SHT_SYMTAB,
};
use axkrnl::mm::{PhysAddr, PAGE_SIZE};
use axkrnl::testing::{exit_qemu, test_panic_handler, QemuExitCode};
use axkrnl::{elf, kinfo};

const BASE_VADDR: u64 = 0x0020_0000;

/// Append `v`'s raw bytes (its `repr(C)` layout) to `buf`, returning the
/// offset it was written at.
fn append<T: Copy>(buf: &mut Vec<u8>, v: &T) -> u64 {
    let off = buf.len() as u64;
    // SAFETY: `T` is `repr(C)` and `Copy`; reading its bytes for an
    // in-memory ELF image never observes uninitialized padding as anything
    // but opaque bytes the loader itself never interprets.
    let bytes = unsafe { core::slice::from_raw_parts((v as *const T).cast::<u8>(), size_of::<T>()) };
    buf.extend_from_slice(bytes);
    off
}

fn append_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> u64 {
    let off = buf.len() as u64;
    buf.extend_from_slice(bytes);
    off
}

/// Build a single-segment ELF64 module image. `unresolved_import` adds an
/// `.axapi.imports` entry naming an export nothing provides.
fn build_module(unresolved_import: bool) -> Vec<u8> {
    let hdr_len = size_of::<Elf64Header>() as u64;
    let phdr_len = size_of::<Elf64ProgramHeader>() as u64;

    // Body starts right after the header and the single program header;
    // every offset below is relative to the final file, not this buffer.
    let mut body: Vec<u8> = Vec::new();
    let body_base = hdr_len + phdr_len;
    let vaddr_of = |body_off: u64| BASE_VADDR + body_base + body_off;

    let name_off = append_bytes(&mut body, b"selftest\0");
    let desc_off = append_bytes(&mut body, b"integration test module\0");
    let author_off = append_bytes(&mut body, b"axkrnl\0");

    let modinfo = ModInfo {
        name: vaddr_of(name_off),
        desc: vaddr_of(desc_off),
        author: vaddr_of(author_off),
        mod_init: vaddr_of(name_off), // never executed by this test; any mapped address will do
        mod_exit: 0,
    };
    let modinfo_off = append(&mut body, &modinfo);

    let strtab_bytes: &[u8] = b"\0modinfo\0";
    let strtab_off = append_bytes(&mut body, strtab_bytes);

    let symtab_off = append(&mut body, &Elf64Symbol { st_name: 0, st_info: 0, st_other: 0, st_shndx: 0, st_value: 0, st_size: 0 });
    append(
        &mut body,
        &Elf64Symbol {
            st_name: 1, // offset of "modinfo" within strtab_bytes
            st_info: 0x11, // GLOBAL/OBJECT; find_symbol_value only matches by name
            st_other: 0,
            st_shndx: 1,
            st_value: vaddr_of(modinfo_off),
            st_size: size_of::<ModInfo>() as u64,
        },
    );
    let symtab_size = 2 * size_of::<Elf64Symbol>() as u64;

    let (imports_off, imports_size) = if unresolved_import {
        let missing_name_off = append_bytes(&mut body, b"definitely_not_exported\0");
        let slot_off = append(&mut body, &0u64);
        let off = append(
            &mut body,
            &AxapiImport {
                name_vaddr: vaddr_of(missing_name_off),
                slot_vaddr: vaddr_of(slot_off),
            },
        );
        (off, size_of::<AxapiImport>() as u64)
    } else {
        (0, 0)
    };

    let mut shstr: Vec<u8> = alloc::vec![0u8]; // index 0: empty name
    let symtab_name = shstr.len() as u32;
    shstr.extend_from_slice(b".symtab\0");
    let strtab_name = shstr.len() as u32;
    shstr.extend_from_slice(b".strtab\0");
    let shstrtab_name = shstr.len() as u32;
    shstr.extend_from_slice(b".shstrtab\0");
    let imports_name = shstr.len() as u32;
    if unresolved_import {
        shstr.extend_from_slice(b".axapi.imports\0");
    }
    let shstrtab_off = append_bytes(&mut body, &shstr);
    let shstrtab_size = shstr.len() as u64;

    let sh_zero = Elf64SectionHeader { sh_name: 0, sh_type: 0, sh_flags: 0, sh_addr: 0, sh_offset: 0, sh_size: 0, sh_link: 0, sh_info: 0, sh_addralign: 0, sh_entsize: 0 };
    let sh_symtab = Elf64SectionHeader {
        sh_name: symtab_name,
        sh_type: SHT_SYMTAB,
        sh_flags: 0,
        sh_addr: 0,
        sh_offset: body_base + symtab_off,
        sh_size: symtab_size,
        sh_link: 2, // .strtab's section index
        sh_info: 1,
        sh_addralign: 8,
        sh_entsize: size_of::<Elf64Symbol>() as u64,
    };
    let sh_strtab = Elf64SectionHeader {
        sh_name: strtab_name,
        sh_type: 3, // SHT_STRTAB
        sh_flags: 0,
        sh_addr: 0,
        sh_offset: body_base + strtab_off,
        sh_size: strtab_bytes.len() as u64,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 1,
        sh_entsize: 0,
    };
    let sh_shstrtab = Elf64SectionHeader {
        sh_name: shstrtab_name,
        sh_type: 3,
        sh_flags: 0,
        sh_addr: 0,
        sh_offset: body_base + shstrtab_off,
        sh_size: shstrtab_size,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 1,
        sh_entsize: 0,
    };

    let shoff_placeholder = body_base + body.len() as u64;
    append(&mut body, &sh_zero);
    append(&mut body, &sh_symtab);
    append(&mut body, &sh_strtab);
    append(&mut body, &sh_shstrtab);
    let mut shnum = 4u16;
    if unresolved_import {
        let sh_imports = Elf64SectionHeader {
            sh_name: imports_name,
            sh_type: 0,
            sh_flags: 0,
            sh_addr: 0,
            sh_offset: body_base + imports_off,
            sh_size: imports_size,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 8,
            sh_entsize: size_of::<AxapiImport>() as u64,
        };
        append(&mut body, &sh_imports);
        shnum += 1;
    }

    let total_size = body_base + body.len() as u64;

    let phdr = Elf64ProgramHeader {
        p_type: PT_LOAD,
        p_flags: PF_W,
        p_offset: 0,
        p_vaddr: BASE_VADDR,
        p_paddr: BASE_VADDR,
        p_filesz: total_size,
        p_memsz: total_size,
        p_align: PAGE_SIZE as u64,
    };

    let header = Elf64Header {
        magic: ELF_MAGIC,
        class: ELFCLASS64,
        data: 1,
        version: 1,
        os_abi: 0,
        abi_version: 0,
        padding: [0; 7],
        elf_type: 2,
        machine: EM_X86_64,
        version2: 1,
        entry: modinfo.mod_init,
        phoff: hdr_len,
        shoff: shoff_placeholder,
        flags: 0,
        ehsize: hdr_len as u16,
        phentsize: phdr_len as u16,
        phnum: 1,
        shentsize: size_of::<Elf64SectionHeader>() as u16,
        shnum,
        shstrndx: 3,
    };

    let mut file: Vec<u8> = Vec::with_capacity(total_size as usize);
    append(&mut file, &header);
    append(&mut file, &phdr);
    file.extend_from_slice(&body);
    file
}

/// Copy `image` into a fresh physical allocation and return its base.
fn load_into_memory(image: &[u8]) -> PhysAddr {
    let pages = (image.len() as u64).div_ceil(PAGE_SIZE as u64);
    let phys = axkrnl::mm::pmm::alloc(pages).expect("out of memory staging module image");
    let dst = phys.to_virt().as_mut_ptr::<u8>();
    // SAFETY: `dst` is a freshly allocated, exclusively-owned region at
    // least `image.len()` bytes long.
    unsafe {
        core::ptr::copy_nonoverlapping(image.as_ptr(), dst, image.len());
    }
    phys
}

#[no_mangle]
extern "C" fn _start() -> ! {
    common::boot_minimal();

    let valid = build_module(false);
    let valid_phys = load_into_memory(&valid);
    match elf::load_module(valid_phys, valid.len() as u64) {
        Ok(loaded) => kinfo!("Loaded module: {}", loaded.name),
        Err(e) => {
            kinfo!("expected successful load, got {:?}", e);
            exit_qemu(QemuExitCode::Failed);
        }
    }

    let broken = build_module(true);
    let broken_phys = load_into_memory(&broken);
    match elf::load_module(broken_phys, broken.len() as u64) {
        Err(ElfError::UnresolvedImport) => kinfo!("unresolved import correctly rejected"),
        Ok(_) => {
            kinfo!("expected UnresolvedImport, module loaded instead");
            exit_qemu(QemuExitCode::Failed);
        }
        Err(e) => {
            kinfo!("expected UnresolvedImport, got {:?}", e);
            exit_qemu(QemuExitCode::Failed);
        }
    }

    exit_qemu(QemuExitCode::Success)
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_panic_handler(info)
}
