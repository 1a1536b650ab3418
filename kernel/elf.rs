//! ELF loading
//!
//! Minimal ELF64 loader: validates the identification, walks the
//! program headers, and materializes PT_LOAD segments into a target
//! address space. Position-independent executables are shifted by the
//! caller's ASLR base. Shebang scripts are recognized here and handed
//! back for exec to restart with the interpreter.

use alloc::string::String;

use crate::arch::paging::MapPermissions;
use crate::error::{Errno, KResult};
use crate::mm::{phys_to_virt, AddressSpace, PAGE_SIZE};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const CLASS_64: u8 = 2;
const TYPE_EXEC: u16 = 2;
const TYPE_DYN: u16 = 3;
const PT_LOAD: u32 = 1;

const PF_X: u32 = 1 << 0;
const PF_W: u32 = 1 << 1;

/// Result of loading an image.
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    /// Entry point, relocation applied.
    pub entry: u64,
    /// Base shift applied (zero for fixed-position executables).
    pub base: u64,
}

fn read_u16(data: &[u8], at: usize) -> KResult<u16> {
    let bytes = data.get(at..at + 2).ok_or(Errno::InvalidValue)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], at: usize) -> KResult<u32> {
    let bytes = data.get(at..at + 4).ok_or(Errno::InvalidValue)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(data: &[u8], at: usize) -> KResult<u64> {
    let bytes = data.get(at..at + 8).ok_or(Errno::InvalidValue)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

/// Copy bytes into a not-necessarily-active address space through the
/// physical window. The destination pages must already be mapped.
fn write_to_space(space: &AddressSpace, vaddr: u64, data: &[u8]) -> KResult<()> {
    let mut written = 0usize;
    while written < data.len() {
        let va = vaddr + written as u64;
        let t = space.translate(va);
        if !t.mapped {
            return Err(Errno::WouldFault);
        }
        let in_page = (PAGE_SIZE - (va & (PAGE_SIZE - 1))) as usize;
        let chunk = in_page.min(data.len() - written);
        unsafe {
            ::core::ptr::copy_nonoverlapping(
                data[written..].as_ptr(),
                phys_to_virt(t.phys),
                chunk,
            );
        }
        written += chunk;
    }
    Ok(())
}

/// Load an ELF64 image into `space`, shifting ET_DYN images by
/// `base`.
pub fn load(space: &AddressSpace, image: &[u8], base: u64) -> KResult<LoadedImage> {
    if image.len() < 64 || image[..4] != ELF_MAGIC || image[4] != CLASS_64 {
        return Err(Errno::InvalidValue);
    }
    let elf_type = read_u16(image, 16)?;
    let shift = match elf_type {
        TYPE_EXEC => 0,
        TYPE_DYN => base,
        _ => return Err(Errno::InvalidValue),
    };

    let entry = read_u64(image, 24)?;
    let phoff = read_u64(image, 32)? as usize;
    let phentsize = read_u16(image, 54)? as usize;
    let phnum = read_u16(image, 56)? as usize;
    if phentsize < 56 || phnum > 64 {
        return Err(Errno::InvalidValue);
    }

    for i in 0..phnum {
        let at = phoff + i * phentsize;
        if read_u32(image, at)? != PT_LOAD {
            continue;
        }
        let flags = read_u32(image, at + 4)?;
        let offset = read_u64(image, at + 8)? as usize;
        let vaddr = read_u64(image, at + 16)?.wrapping_add(shift);
        let filesz = read_u64(image, at + 32)? as usize;
        let memsz = read_u64(image, at + 40)?;

        if memsz == 0 {
            continue;
        }
        if offset + filesz > image.len() {
            return Err(Errno::InvalidValue);
        }

        let map_start = vaddr & !(PAGE_SIZE - 1);
        let map_end = vaddr
            .checked_add(memsz)
            .ok_or(Errno::InvalidValue)?
            .next_multiple_of(PAGE_SIZE);
        if !crate::mm::check_userland_mappability(map_start, map_end - map_start) {
            return Err(Errno::InvalidValue);
        }

        // Map writable first so the copy can go through, then drop
        // to the segment's real permissions.
        space.map_allocated_range(
            map_start,
            map_end - map_start,
            MapPermissions::USER | MapPermissions::WRITE,
        )?;
        write_to_space(space, vaddr, &image[offset..offset + filesz])?;

        let mut perms = MapPermissions::USER;
        if flags & PF_W != 0 {
            perms |= MapPermissions::WRITE;
        }
        if flags & PF_X != 0 {
            perms |= MapPermissions::EXEC;
        }
        space.remap_range(map_start, map_end - map_start, perms)?;
    }

    Ok(LoadedImage {
        entry: entry.wrapping_add(shift),
        base: shift,
    })
}

/// Recognize a `#!interpreter [argument]` header.
///
/// Returns the interpreter path and the optional single argument.
pub fn parse_shebang(image: &[u8]) -> Option<(String, Option<String>)> {
    if image.len() < 3 || &image[..2] != b"#!" {
        return None;
    }
    let line_end = image.iter().position(|&b| b == b'\n')?;
    let line = core::str::from_utf8(&image[2..line_end]).ok()?.trim();
    if line.is_empty() {
        return None;
    }
    let mut parts = line.splitn(2, ' ');
    let interpreter = parts.next()?.trim();
    if interpreter.is_empty() {
        return None;
    }
    let argument = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);
    Some((String::from(interpreter), argument))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shebang_with_and_without_argument() {
        assert_eq!(
            parse_shebang(b"#!/bin/sh\necho hi"),
            Some((String::from("/bin/sh"), None))
        );
        assert_eq!(
            parse_shebang(b"#!/usr/bin/env python\n"),
            Some((
                String::from("/usr/bin/env"),
                Some(String::from("python"))
            ))
        );
        assert_eq!(parse_shebang(b"#!\n"), None);
        assert_eq!(parse_shebang(b"\x7FELF..."), None);
    }

    #[test]
    fn non_elf_rejected() {
        let space = AddressSpace::kernel();
        assert_eq!(
            load(&space, b"not an elf image", 0).unwrap_err(),
            Errno::InvalidValue
        );
    }
}
