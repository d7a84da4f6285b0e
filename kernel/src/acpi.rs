//! RSDP → MADT walk: just enough ACPI to hand `cpu::smp::start_aps` a list
//! of Local APIC ids (§2, §4.4's "For each LAPIC in the MADT").
//!
//! Full ACPI (AML, namespace, SRAT/SLIT/MCFG/DMAR) stays out of scope —
//! NUMA awareness and PCI enumeration are both non-goals (§1) — so this
//! module reads exactly one table family and nothing else.

use crate::error::{KernelError, KernelResult};
use crate::mm::PhysAddr;

const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";
const RSDT_SIGNATURE: &[u8; 4] = b"RSDT";
const XSDT_SIGNATURE: &[u8; 4] = b"XSDT";
const MADT_SIGNATURE: &[u8; 4] = b"APIC";
const MADT_ENTRY_LOCAL_APIC: u8 = 0;

/// `cpu::MAX_CPUS`, duplicated as a plain const since this module is parsed
/// long before `cpu::cpu_early_init` touches anything CPU-local.
const MAX_CPUS: usize = 256;

#[repr(C, packed)]
struct Rsdp {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_address: u32,
}

#[repr(C, packed)]
struct Rsdp2 {
    base: Rsdp,
    length: u32,
    xsdt_address: u64,
    extended_checksum: u8,
    _reserved: [u8; 3],
}

#[repr(C, packed)]
struct SdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

#[repr(C, packed)]
struct MadtHeader {
    sdt: SdtHeader,
    local_apic_address: u32,
    flags: u32,
}

#[repr(C, packed)]
struct MadtEntryHeader {
    entry_type: u8,
    length: u8,
}

#[repr(C, packed)]
struct MadtLocalApicEntry {
    header: MadtEntryHeader,
    acpi_processor_id: u8,
    apic_id: u8,
    flags: u32,
}

/// Enabled-or-online-capable Local APIC ids, in MADT order, BSP included.
pub struct MadtCpus {
    ids: [u8; MAX_CPUS],
    len: usize,
}

impl MadtCpus {
    pub fn apic_ids(&self) -> &[u8] {
        &self.ids[..self.len]
    }

    fn push(&mut self, id: u8) {
        if self.len < MAX_CPUS {
            self.ids[self.len] = id;
            self.len += 1;
        }
    }
}

fn checksum_ok(vaddr: usize, len: usize) -> bool {
    let mut sum: u8 = 0;
    for i in 0..len {
        // SAFETY: `vaddr..vaddr+len` was just resolved from a boot-reported
        // physical ACPI table address through the HHDM.
        sum = sum.wrapping_add(unsafe { *((vaddr + i) as *const u8) });
    }
    sum == 0
}

fn parse_madt(vaddr: usize, cpus: &mut MadtCpus) {
    // SAFETY: `vaddr` was just matched against the "APIC" signature by the
    // caller and lies within a table the boot memory map reports usable.
    let madt = unsafe { &*(vaddr as *const MadtHeader) };
    let table_len = { madt.sdt.length } as usize;
    let entries_start = vaddr + core::mem::size_of::<MadtHeader>();
    let entries_end = vaddr + table_len;

    let mut offset = entries_start;
    while offset + 2 <= entries_end {
        // SAFETY: `offset` is bounds-checked against `entries_end` below.
        let header = unsafe { &*(offset as *const MadtEntryHeader) };
        let entry_len = header.length as usize;
        if entry_len < 2 || offset + entry_len > entries_end {
            break;
        }

        if header.entry_type == MADT_ENTRY_LOCAL_APIC
            && entry_len >= core::mem::size_of::<MadtLocalApicEntry>()
        {
            // SAFETY: entry type and length were just checked above.
            let entry = unsafe { &*(offset as *const MadtLocalApicEntry) };
            let flags = { entry.flags };
            if flags & 0x3 != 0 {
                cpus.push(entry.apic_id);
            }
        }
        offset += entry_len;
    }
}

fn visit_table(phys: u64, cpus: &mut MadtCpus) {
    let vaddr = PhysAddr::new(phys).to_virt().as_u64() as usize;
    // SAFETY: `phys` came from a root table's own entry list, which the
    // firmware guarantees names a valid SDT.
    let sdt = unsafe { &*(vaddr as *const SdtHeader) };
    if &{ sdt.signature } == MADT_SIGNATURE {
        if !checksum_ok(vaddr, { sdt.length } as usize) {
            crate::kwarn!("MADT checksum invalid, using it anyway");
        }
        parse_madt(vaddr, cpus);
    }
}

fn walk_rsdt(vaddr: usize, cpus: &mut MadtCpus) -> KernelResult<()> {
    // SAFETY: `vaddr` was resolved from the RSDP's `rsdt_address` field.
    let sdt = unsafe { &*(vaddr as *const SdtHeader) };
    if &{ sdt.signature } != RSDT_SIGNATURE {
        return Err(KernelError::InvalidArgument { name: "RSDT signature", value: "mismatch" });
    }
    let len = { sdt.length } as usize;
    let header_size = core::mem::size_of::<SdtHeader>();
    let count = (len.saturating_sub(header_size)) / 4;
    for i in 0..count {
        let ptr_addr = vaddr + header_size + i * 4;
        // SAFETY: `ptr_addr` lies within the RSDT's own declared length.
        let phys = unsafe { *(ptr_addr as *const u32) } as u64;
        visit_table(phys, cpus);
    }
    Ok(())
}

fn walk_xsdt(vaddr: usize, cpus: &mut MadtCpus) -> KernelResult<()> {
    // SAFETY: `vaddr` was resolved from the RSDP2's `xsdt_address` field.
    let sdt = unsafe { &*(vaddr as *const SdtHeader) };
    if &{ sdt.signature } != XSDT_SIGNATURE {
        return Err(KernelError::InvalidArgument { name: "XSDT signature", value: "mismatch" });
    }
    let len = { sdt.length } as usize;
    let header_size = core::mem::size_of::<SdtHeader>();
    let count = (len.saturating_sub(header_size)) / 8;
    for i in 0..count {
        let ptr_addr = vaddr + header_size + i * 8;
        // SAFETY: `ptr_addr` lies within the XSDT's own declared length.
        let phys = unsafe { *(ptr_addr as *const u64) };
        visit_table(phys, cpus);
    }
    Ok(())
}

fn try_enumerate(rsdp_phys: u64, cpus: &mut MadtCpus) -> KernelResult<()> {
    let rsdp_vaddr = PhysAddr::new(rsdp_phys).to_virt().as_u64() as usize;
    // SAFETY: `rsdp_phys` is the boot-reported RSDP physical address, always
    // below 1 MiB and mapped by the HHDM like the rest of low memory.
    let rsdp = unsafe { &*(rsdp_vaddr as *const Rsdp) };
    if &rsdp.signature != RSDP_SIGNATURE {
        return Err(KernelError::InvalidArgument {
            name: "RSDP signature",
            value: "not 'RSD PTR '",
        });
    }
    if !checksum_ok(rsdp_vaddr, 20) {
        crate::kwarn!("RSDP checksum invalid, using it anyway");
    }

    if rsdp.revision >= 2 {
        // SAFETY: an ACPI 2.0+ RSDP is at least `size_of::<Rsdp2>()` bytes.
        let rsdp2 = unsafe { &*(rsdp_vaddr as *const Rsdp2) };
        let xsdt_phys = { rsdp2.xsdt_address };
        if xsdt_phys != 0 {
            let xsdt_vaddr = PhysAddr::new(xsdt_phys).to_virt().as_u64() as usize;
            return walk_xsdt(xsdt_vaddr, cpus);
        }
    }

    let rsdt_phys = rsdp.rsdt_address as u64;
    let rsdt_vaddr = PhysAddr::new(rsdt_phys).to_virt().as_u64() as usize;
    walk_rsdt(rsdt_vaddr, cpus)
}

/// Walk the RSDP down to the MADT and collect every enabled Local APIC id.
/// Falls back to a single-entry `[bsp_apic_id]` list — leaving SMP bring-up
/// to skip every AP — if `rsdp_phys` is absent, malformed, or has no MADT,
/// since a missing topology table must not prevent boot (§4.4's "a core
/// that fails to come up is left offline", extended to "no MADT at all").
pub fn enumerate_cpus(rsdp_phys: Option<u64>, bsp_apic_id: u8) -> MadtCpus {
    let mut cpus = MadtCpus { ids: [0; MAX_CPUS], len: 0 };

    let parsed = match rsdp_phys {
        Some(phys) => try_enumerate(phys, &mut cpus),
        None => Err(KernelError::NotInitialized { subsystem: "ACPI (no RSDP)" }),
    };

    if let Err(e) = parsed {
        crate::kwarn!("ACPI/MADT unavailable ({}), assuming single CPU", e);
    }
    if cpus.len == 0 {
        cpus.push(bsp_apic_id);
    }
    cpus
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apic_ids_reflects_pushed_entries() {
        let mut cpus = MadtCpus { ids: [0; MAX_CPUS], len: 0 };
        cpus.push(0);
        cpus.push(2);
        assert_eq!(cpus.apic_ids(), &[0, 2]);
    }

    #[test]
    fn push_past_capacity_is_ignored() {
        let mut cpus = MadtCpus { ids: [0; MAX_CPUS], len: 0 };
        for i in 0..MAX_CPUS + 10 {
            cpus.push((i % 256) as u8);
        }
        assert_eq!(cpus.apic_ids().len(), MAX_CPUS);
    }
}
