//! Multiboot2 boot information
//!
//! The alternate boot protocol: a tag list handed over in memory.
//! Only the tags the kernel consumes are parsed — command line,
//! memory map, and boot modules.

use alloc::string::String;
use alloc::vec::Vec;

const TAG_END: u32 = 0;
const TAG_CMDLINE: u32 = 1;
const TAG_MODULE: u32 = 3;
const TAG_MEMORY_MAP: u32 = 6;

const MEMORY_AVAILABLE: u32 = 1;

/// One usable memory region.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
}

/// One boot module (a RAM file).
#[derive(Debug, Clone)]
pub struct BootModule {
    pub start: u64,
    pub end: u64,
    pub name: String,
}

/// Everything the kernel takes from the tag list.
pub struct BootInfo {
    pub cmdline: Option<String>,
    pub memory: Vec<MemoryRegion>,
    pub modules: Vec<BootModule>,
}

unsafe fn read_u32(addr: u64) -> u32 {
    unsafe { ::core::ptr::read_unaligned(addr as *const u32) }
}

unsafe fn read_u64(addr: u64) -> u64 {
    unsafe { ::core::ptr::read_unaligned(addr as *const u64) }
}

unsafe fn read_cstr(addr: u64, cap: usize) -> String {
    let mut out = String::new();
    for i in 0..cap as u64 {
        let byte = unsafe { *((addr + i) as *const u8) };
        if byte == 0 {
            break;
        }
        out.push(byte as char);
    }
    out
}

/// Allocation-free first pass: the largest usable memory region, for
/// seeding the heap before anything else can run.
///
/// # Safety
/// As for [`parse`].
pub unsafe fn largest_usable(info_addr: u64) -> Option<(u64, u64)> {
    let total_size = unsafe { read_u32(info_addr) } as u64;
    let mut at = info_addr + 8;
    let end = info_addr + total_size;
    let mut best: Option<(u64, u64)> = None;

    while at + 8 <= end {
        let tag_type = unsafe { read_u32(at) };
        let tag_size = unsafe { read_u32(at + 4) } as u64;
        if tag_type == TAG_END || tag_size < 8 {
            break;
        }
        if tag_type == TAG_MEMORY_MAP {
            let entry_size = unsafe { read_u32(at + 8) } as u64;
            if entry_size >= 24 {
                let mut entry = at + 16;
                while entry + entry_size <= at + tag_size {
                    let base = unsafe { read_u64(entry) };
                    let length = unsafe { read_u64(entry + 8) };
                    let kind = unsafe { read_u32(entry + 16) };
                    if kind == MEMORY_AVAILABLE
                        && best.map(|(_, l)| length > l).unwrap_or(true)
                    {
                        best = Some((base, length));
                    }
                    entry += entry_size;
                }
            }
        }
        at += tag_size.next_multiple_of(8);
    }
    best
}

/// Walk the tag list at `info_addr`.
///
/// # Safety
/// The address must point at a Multiboot2 information structure that
/// stays mapped (identity or physical-window) for the walk.
pub unsafe fn parse(info_addr: u64) -> BootInfo {
    let mut boot = BootInfo {
        cmdline: None,
        memory: Vec::new(),
        modules: Vec::new(),
    };

    let total_size = unsafe { read_u32(info_addr) } as u64;
    let mut at = info_addr + 8;
    let end = info_addr + total_size;

    while at + 8 <= end {
        let tag_type = unsafe { read_u32(at) };
        let tag_size = unsafe { read_u32(at + 4) } as u64;
        if tag_type == TAG_END || tag_size < 8 {
            break;
        }

        match tag_type {
            TAG_CMDLINE => {
                boot.cmdline = Some(unsafe { read_cstr(at + 8, (tag_size - 8) as usize) });
            }
            TAG_MODULE => {
                let start = unsafe { read_u32(at + 8) } as u64;
                let mod_end = unsafe { read_u32(at + 12) } as u64;
                let name = unsafe { read_cstr(at + 16, (tag_size - 16) as usize) };
                boot.modules.push(BootModule {
                    start,
                    end: mod_end,
                    name,
                });
            }
            TAG_MEMORY_MAP => {
                let entry_size = unsafe { read_u32(at + 8) } as u64;
                if entry_size >= 24 {
                    let mut entry = at + 16;
                    while entry + entry_size <= at + tag_size {
                        let base = unsafe { read_u64(entry) };
                        let length = unsafe { read_u64(entry + 8) };
                        let kind = unsafe { read_u32(entry + 16) };
                        if kind == MEMORY_AVAILABLE {
                            boot.memory.push(MemoryRegion { base, length });
                        }
                        entry += entry_size;
                    }
                }
            }
            _ => {}
        }

        // Tags are 8-byte aligned
        at += tag_size.next_multiple_of(8);
    }

    boot
}
