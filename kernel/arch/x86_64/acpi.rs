//! ACPI table parsing
//!
//! Just enough ACPI to bring up SMP: locate the MADT through the
//! RSDP/RSDT/XSDT chain and enumerate the LAPICs that are usable. A
//! LAPIC is usable when exactly one of the "enabled" or
//! "online-capable" flag bits is set.

use alloc::vec::Vec;

use crate::mm::phys_to_virt;

/// One usable CPU as reported by the MADT.
#[derive(Debug, Clone, Copy)]
pub struct MadtCpu {
    pub acpi_id: u32,
    pub apic_id: u32,
}

/// Result of the MADT scan.
pub struct AcpiInfo {
    /// LAPIC MMIO base (after any address-override entry).
    pub lapic_addr: u64,
    /// Usable CPUs in table order; the BSP is among them.
    pub cpus: Vec<MadtCpu>,
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
struct Rsdp {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_addr: u32,
    // ACPI 2.0+ fields
    length: u32,
    xsdt_addr: u64,
    ext_checksum: u8,
    _reserved: [u8; 3],
}

const MADT_LAPIC: u8 = 0;
const MADT_LAPIC_OVERRIDE: u8 = 5;

const LAPIC_ENABLED: u32 = 1 << 0;
const LAPIC_ONLINE_CAPABLE: u32 = 1 << 1;

fn header_at(phys: u64) -> &'static SdtHeader {
    unsafe { &*(phys_to_virt(phys) as *const SdtHeader) }
}

/// Walk RSDP → (X)SDT looking for the table with `signature`.
fn find_table(rsdp_phys: u64, signature: &[u8; 4]) -> Option<u64> {
    let rsdp = unsafe { &*(phys_to_virt(rsdp_phys) as *const Rsdp) };

    if rsdp.revision >= 2 && { rsdp.xsdt_addr } != 0 {
        let xsdt_addr = { rsdp.xsdt_addr };
        let count = ({ header_at(xsdt_addr).length } as usize - core::mem::size_of::<SdtHeader>()) / 8;
        for i in 0..count {
            let entry_ptr =
                phys_to_virt(xsdt_addr + core::mem::size_of::<SdtHeader>() as u64 + i as u64 * 8);
            let phys = unsafe { ::core::ptr::read_unaligned(entry_ptr as *const u64) };
            let sig = { header_at(phys).signature };
            if &sig == signature {
                return Some(phys);
            }
        }
    } else {
        let rsdt_addr = { rsdp.rsdt_addr } as u64;
        let count = ({ header_at(rsdt_addr).length } as usize - core::mem::size_of::<SdtHeader>()) / 4;
        for i in 0..count {
            let entry_ptr =
                phys_to_virt(rsdt_addr + core::mem::size_of::<SdtHeader>() as u64 + i as u64 * 4);
            let phys = unsafe { ::core::ptr::read_unaligned(entry_ptr as *const u32) } as u64;
            let sig = { header_at(phys).signature };
            if &sig == signature {
                return Some(phys);
            }
        }
    }
    None
}

/// Parse the MADT and return the usable-CPU list.
///
/// Returns `None` when the RSDP chain does not lead to a MADT; the
/// caller then runs uniprocessor.
pub fn scan_madt(rsdp_phys: u64) -> Option<AcpiInfo> {
    let madt_phys = find_table(rsdp_phys, b"APIC")?;
    let madt_len = { header_at(madt_phys).length } as usize;

    // MADT body: u32 lapic address, u32 flags, then variable entries
    let body = phys_to_virt(madt_phys + core::mem::size_of::<SdtHeader>() as u64);
    let mut lapic_addr =
        unsafe { ::core::ptr::read_unaligned(body as *const u32) } as u64;

    let mut cpus = Vec::new();
    let entries_start = unsafe { body.add(8) };
    let entries_len = madt_len - core::mem::size_of::<SdtHeader>() - 8;

    let mut offset = 0usize;
    while offset + 2 <= entries_len {
        let kind = unsafe { *entries_start.add(offset) };
        let len = unsafe { *entries_start.add(offset + 1) } as usize;
        if len < 2 || offset + len > entries_len {
            break;
        }

        match kind {
            MADT_LAPIC if len >= 8 => {
                let acpi_id = unsafe { *entries_start.add(offset + 2) } as u32;
                let apic_id = unsafe { *entries_start.add(offset + 3) } as u32;
                let flags = unsafe {
                    ::core::ptr::read_unaligned(entries_start.add(offset + 4) as *const u32)
                };
                if cpu_usable(flags) {
                    cpus.push(MadtCpu { acpi_id, apic_id });
                }
            }
            MADT_LAPIC_OVERRIDE if len >= 12 => {
                lapic_addr = unsafe {
                    ::core::ptr::read_unaligned(entries_start.add(offset + 4) as *const u64)
                };
            }
            _ => {}
        }

        offset += len;
    }

    Some(AcpiInfo { lapic_addr, cpus })
}

/// A LAPIC is usable when enabled XOR online-capable.
fn cpu_usable(flags: u32) -> bool {
    (flags & LAPIC_ENABLED != 0) ^ (flags & LAPIC_ONLINE_CAPABLE != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_needs_exactly_one_flag() {
        assert!(!cpu_usable(0));
        assert!(cpu_usable(LAPIC_ENABLED));
        assert!(cpu_usable(LAPIC_ONLINE_CAPABLE));
        assert!(!cpu_usable(LAPIC_ENABLED | LAPIC_ONLINE_CAPABLE));
    }
}
