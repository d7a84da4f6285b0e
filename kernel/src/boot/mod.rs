//! Boot parameter block (§6).
//!
//! AxBoot hands control to `_start` with nothing but the Limine boot
//! protocol's request/response mechanism available: the kernel places
//! statically-allocated request structures in a `.requests` section, and
//! the bootloader fills in the matching response before jumping to our
//! entry point. This module normalizes those responses into the flat
//! `BootParams` shape spec.md §6 describes and enforces the protocol
//! revision check (revision != 1 halts with a critical log line).

use limine::{
    request::{
        FramebufferRequest, HhdmRequest, KernelAddressRequest, MemoryMapRequest, ModuleRequest,
        RsdpRequest, SmbiosRequest,
    },
    BaseRevision,
};

#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".requests"]
static MEMMAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests"]
static MODULE_REQUEST: ModuleRequest = ModuleRequest::new();

#[used]
#[link_section = ".requests"]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

#[used]
#[link_section = ".requests"]
static RSDP_REQUEST: RsdpRequest = RsdpRequest::new();

#[used]
#[link_section = ".requests"]
static SMBIOS_REQUEST: SmbiosRequest = SmbiosRequest::new();

#[used]
#[link_section = ".requests"]
static KERNEL_ADDRESS_REQUEST: KernelAddressRequest = KernelAddressRequest::new();

/// Memory-map region type, matching spec.md §6's enum exactly. `AcpiMmio`
/// and `AcpiMmioPortspace` are part of AurixOS's own vocabulary for
/// platforms whose boot loader reports MMIO/port-space windows explicitly;
/// the Limine backend that `boot::init` targets never emits them, since
/// Limine folds MMIO into `Reserved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Reserved,
    AcpiReclaimable,
    AcpiMmio,
    AcpiMmioPortspace,
    AcpiNvs,
    Kernel,
    Framebuffer,
    BootloaderReclaimable,
    Usable,
    BadMemory,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub size: u64,
    pub kind: MemoryKind,
}

#[derive(Debug, Clone, Copy)]
pub struct ModuleInfo {
    pub filename: [u8; 32],
    pub addr: u64,
    pub size: u64,
}

impl ModuleInfo {
    pub fn name(&self) -> &str {
        let len = self.filename.iter().position(|&b| b == 0).unwrap_or(32);
        core::str::from_utf8(&self.filename[..len]).unwrap_or("<invalid>")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferFormat {
    Rgba,
    Bgra,
}

#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub addr: u64,
    pub width: u64,
    pub height: u64,
    pub bpp: u16,
    pub pitch: u64,
    pub format: FramebufferFormat,
}

/// Maximum number of memory-map entries and modules the fixed-size
/// `BootParams` arrays can hold. The real Limine response owns unbounded
/// slices; we copy into these bounded arrays once, at boot, so later code
/// never has to track a borrow into bootloader-owned memory.
pub const MAX_MEMMAP_ENTRIES: usize = 256;
pub const MAX_MODULES: usize = 32;

pub struct BootParams {
    pub revision: u64,
    pub memory_map: [MemoryMapEntry; MAX_MEMMAP_ENTRIES],
    pub memory_map_len: usize,
    pub kernel_phys_base: u64,
    pub hhdm_offset: u64,
    pub rsdp_phys: Option<u64>,
    pub smbios_phys: Option<u64>,
    pub modules: [ModuleInfo; MAX_MODULES],
    pub modules_len: usize,
    pub framebuffer: Option<FramebufferInfo>,
}

impl BootParams {
    pub fn memory_map(&self) -> &[MemoryMapEntry] {
        &self.memory_map[..self.memory_map_len]
    }

    pub fn modules(&self) -> &[ModuleInfo] {
        &self.modules[..self.modules_len]
    }
}

static mut BOOT_PARAMS: Option<BootParams> = None;

fn map_kind(kind: limine::memory_map::EntryType) -> MemoryKind {
    use limine::memory_map::EntryType;
    match kind {
        EntryType::USABLE => MemoryKind::Usable,
        EntryType::RESERVED => MemoryKind::Reserved,
        EntryType::ACPI_RECLAIMABLE => MemoryKind::AcpiReclaimable,
        EntryType::ACPI_NVS => MemoryKind::AcpiNvs,
        EntryType::BAD_MEMORY => MemoryKind::BadMemory,
        EntryType::BOOTLOADER_RECLAIMABLE => MemoryKind::BootloaderReclaimable,
        EntryType::KERNEL_AND_MODULES => MemoryKind::Kernel,
        EntryType::FRAMEBUFFER => MemoryKind::Framebuffer,
        _ => MemoryKind::Reserved,
    }
}

/// Read every Limine response and assemble the normalized `BootParams`.
///
/// Revision mismatch is a tier-4 fatal contract violation (§7): it is
/// reported with a critical log line and the CPU is halted, since nothing
/// downstream can be trusted to have the shape this kernel expects.
pub fn init() -> &'static BootParams {
    if !BASE_REVISION.is_supported() {
        crate::println!("[BOOT] CRITICAL: unsupported Limine base revision, halting");
        loop {
            x86_64::instructions::hlt();
        }
    }

    let hhdm = HHDM_REQUEST
        .get_response()
        .expect("limine: no HHDM response");
    let kernel_addr = KERNEL_ADDRESS_REQUEST
        .get_response()
        .expect("limine: no kernel address response");
    let memmap = MEMMAP_REQUEST
        .get_response()
        .expect("limine: no memory map response");

    let mut params = BootParams {
        revision: 1,
        memory_map: [MemoryMapEntry {
            base: 0,
            size: 0,
            kind: MemoryKind::Reserved,
        }; MAX_MEMMAP_ENTRIES],
        memory_map_len: 0,
        kernel_phys_base: kernel_addr.physical_base(),
        hhdm_offset: hhdm.offset(),
        rsdp_phys: RSDP_REQUEST.get_response().map(|r| r.address() as u64),
        smbios_phys: SMBIOS_REQUEST.get_response().and_then(|r| {
            r.entry_32()
                .map(|a| a.get() as u64)
                .or_else(|| r.entry_64().map(|a| a.get() as u64))
        }),
        modules: [ModuleInfo {
            filename: [0; 32],
            addr: 0,
            size: 0,
        }; MAX_MODULES],
        modules_len: 0,
        framebuffer: None,
    };

    for entry in memmap.entries().iter().take(MAX_MEMMAP_ENTRIES) {
        params.memory_map[params.memory_map_len] = MemoryMapEntry {
            base: entry.base,
            size: entry.length,
            kind: map_kind(entry.entry_type),
        };
        params.memory_map_len += 1;
    }

    if let Some(modules) = MODULE_REQUEST.get_response() {
        for m in modules.modules().iter().take(MAX_MODULES) {
            let path = m.path().to_str().unwrap_or("");
            let name = path.rsplit('/').next().unwrap_or(path);
            let mut filename = [0u8; 32];
            let bytes = name.as_bytes();
            let n = bytes.len().min(31);
            filename[..n].copy_from_slice(&bytes[..n]);
            params.modules[params.modules_len] = ModuleInfo {
                filename,
                addr: m.addr() as u64,
                size: m.size(),
            };
            params.modules_len += 1;
        }
    }

    if let Some(fb_resp) = FRAMEBUFFER_REQUEST.get_response() {
        if let Some(fb) = fb_resp.framebuffers().next() {
            let format = if fb.red_mask_shift() == 0 {
                FramebufferFormat::Bgra
            } else {
                FramebufferFormat::Rgba
            };
            params.framebuffer = Some(FramebufferInfo {
                addr: fb.addr() as u64,
                width: fb.width(),
                height: fb.height(),
                bpp: fb.bpp(),
                pitch: fb.pitch(),
                format,
            });
        }
    }

    // SAFETY: single-threaded boot context, written exactly once before any
    // other CPU is started.
    unsafe {
        BOOT_PARAMS = Some(params);
        #[allow(static_mut_refs)]
        BOOT_PARAMS.as_ref().unwrap()
    }
}

/// Returns the boot parameters assembled by [`init`]. Panics if called
/// before `init`.
pub fn params() -> &'static BootParams {
    // SAFETY: read-only after `init` runs once during single-threaded boot.
    #[allow(static_mut_refs)]
    unsafe {
        BOOT_PARAMS.as_ref().expect("boot::init not called yet")
    }
}
