//! Userland memory access
//!
//! Every pointer argument a syscall receives passes through here
//! before any byte is moved. The caller's page table is the single
//! source of truth: each page of the span is translated, checked for
//! user accessibility, and the copy itself goes through the physical
//! window, so the kernel never dereferences a user virtual address.

use alloc::string::String;

use crate::error::{Errno, KResult};
use crate::mm::{phys_to_virt, AddressSpace, PAGE_SIZE};

/// Longest C string accepted from userland (paths, hostnames).
pub const MAX_USER_STRING: usize = 1024;

/// Validate that `[addr, addr+len)` is mapped and user-accessible in
/// `space`, with write permission when `write` is set.
pub fn check_access(space: &AddressSpace, addr: u64, len: u64, write: bool) -> bool {
    if len == 0 {
        return true;
    }
    let Some(end) = addr.checked_add(len) else {
        return false;
    };

    let mut page = addr & !(PAGE_SIZE - 1);
    while page < end {
        let t = space.translate(page);
        if !t.mapped || !t.user || (write && !t.writable) {
            return false;
        }
        page += PAGE_SIZE;
    }
    true
}

/// Copy `buf.len()` bytes from userland `addr` into `buf`.
pub fn copy_from_user(space: &AddressSpace, addr: u64, buf: &mut [u8]) -> KResult<()> {
    if !check_access(space, addr, buf.len() as u64, false) {
        return Err(Errno::WouldFault);
    }

    let mut copied = 0usize;
    while copied < buf.len() {
        let va = addr + copied as u64;
        let t = space.translate(va);
        let in_page = (PAGE_SIZE - (va & (PAGE_SIZE - 1))) as usize;
        let chunk = in_page.min(buf.len() - copied);
        unsafe {
            ::core::ptr::copy_nonoverlapping(
                phys_to_virt(t.phys),
                buf[copied..].as_mut_ptr(),
                chunk,
            );
        }
        copied += chunk;
    }
    Ok(())
}

/// Copy `data` to userland `addr`.
pub fn copy_to_user(space: &AddressSpace, addr: u64, data: &[u8]) -> KResult<()> {
    if !check_access(space, addr, data.len() as u64, true) {
        return Err(Errno::WouldFault);
    }

    let mut copied = 0usize;
    while copied < data.len() {
        let va = addr + copied as u64;
        let t = space.translate(va);
        let in_page = (PAGE_SIZE - (va & (PAGE_SIZE - 1))) as usize;
        let chunk = in_page.min(data.len() - copied);
        unsafe {
            ::core::ptr::copy_nonoverlapping(data[copied..].as_ptr(), phys_to_virt(t.phys), chunk);
        }
        copied += chunk;
    }
    Ok(())
}

/// Read a NUL-terminated string, scanning at most `cap` bytes.
///
/// `WouldFault` when the scan crosses into unmapped memory before the
/// terminator, `StringTooLong` when no terminator shows up in `cap`.
pub fn read_user_string(space: &AddressSpace, addr: u64, cap: usize) -> KResult<String> {
    let mut out = String::new();

    for i in 0..cap as u64 {
        let va = addr.checked_add(i).ok_or(Errno::WouldFault)?;
        let t = space.translate(va);
        if !t.mapped || !t.user {
            return Err(Errno::WouldFault);
        }
        let byte = unsafe { *phys_to_virt(t.phys) };
        if byte == 0 {
            return Ok(out);
        }
        out.push(byte as char);
    }

    Err(Errno::StringTooLong)
}

/// Read one `u64` from userland.
pub fn read_user_u64(space: &AddressSpace, addr: u64) -> KResult<u64> {
    let mut buf = [0u8; 8];
    copy_from_user(space, addr, &mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

/// Write one `u64` to userland.
pub fn write_user_u64(space: &AddressSpace, addr: u64, value: u64) -> KResult<()> {
    copy_to_user(space, addr, &value.to_ne_bytes())
}
