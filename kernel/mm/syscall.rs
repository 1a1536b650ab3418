//! Memory-management syscalls

use crate::error::{Errno, KResult};
use crate::task::proc;

use super::{check_userland_mappability, MapPermissions, PAGE_SIZE};

pub const PROT_READ: u64 = 1 << 0;
pub const PROT_WRITE: u64 = 1 << 1;
pub const PROT_EXEC: u64 = 1 << 2;

pub const MAP_PRIVATE: u64 = 1 << 0;
pub const MAP_SHARED: u64 = 1 << 1;
pub const MAP_ANONYMOUS: u64 = 1 << 2;
pub const MAP_FIXED: u64 = 1 << 3;

/// PROT bits to page permissions; mappings are always user-visible.
fn prot_to_permissions(prot: u64) -> MapPermissions {
    let mut perms = MapPermissions::USER;
    if prot & PROT_WRITE != 0 {
        perms |= MapPermissions::WRITE;
    }
    if prot & PROT_EXEC != 0 {
        perms |= MapPermissions::EXEC;
    }
    perms
}

/// mmap. Anonymous mappings allocate fresh frames; device mappings
/// delegate to the device's hook (root only). File-backed private
/// mappings do not exist here: the offset argument is accepted and
/// the combination is refused.
pub fn sys_mmap(hint: u64, length: u64, prot: u64, flags: u64, fd: i64, _offset: u64) -> KResult<u64> {
    if length == 0 {
        return Err(Errno::InvalidValue);
    }
    let length = length.next_multiple_of(PAGE_SIZE);

    let addr = if hint == 0 {
        crate::random::aslr_base()
    } else {
        hint & !(PAGE_SIZE - 1)
    };
    if !check_userland_mappability(addr, length) {
        return Err(Errno::InvalidValue);
    }

    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;
    let memory_limit = proc::with_process(pid, |p| p.limits.memory_size)?;
    if length > memory_limit {
        return Err(Errno::NoMemory);
    }

    if flags & MAP_ANONYMOUS != 0 {
        space.map_allocated_range(addr, length, prot_to_permissions(prot))?;
        return Ok(addr);
    }

    if fd >= 0 {
        let description = proc::with_process(pid, |p| p.fds.get(fd as usize))??;
        if let crate::fs::fd::Description::Device { device, .. } = &*description {
            // Device windows are privileged
            let euid = proc::with_process(pid, |p| p.effective_uid)?;
            if euid != 0 {
                return Err(Errno::BadAccess);
            }
            device.mmap(&space, addr, length)?;
            return Ok(addr);
        }
        // File-backed private mappings are not carried
        return Err(Errno::NotImplemented);
    }

    Err(Errno::InvalidValue)
}

/// munmap: unmap the exact range.
pub fn sys_munmap(addr: u64, length: u64) -> KResult<u64> {
    if length == 0 || addr % PAGE_SIZE != 0 {
        return Err(Errno::InvalidValue);
    }
    if !check_userland_mappability(addr, length) {
        return Err(Errno::InvalidValue);
    }
    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;
    space.unmap_range(addr, length)?;
    Ok(0)
}

/// mprotect: reprotect an existing range; holes fail the whole call.
pub fn sys_mprotect(addr: u64, length: u64, prot: u64) -> KResult<u64> {
    if length == 0 || addr % PAGE_SIZE != 0 {
        return Err(Errno::InvalidValue);
    }
    if !check_userland_mappability(addr, length) {
        return Err(Errno::InvalidValue);
    }
    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;
    space.remap_range(addr, length, prot_to_permissions(prot))?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::KERNEL_HALF_START;

    #[test]
    fn zero_length_mapping_is_invalid() {
        assert_eq!(
            sys_mmap(0x40_0000, 0, PROT_READ, MAP_ANONYMOUS, -1, 0),
            Err(Errno::InvalidValue)
        );
    }

    #[test]
    fn kernel_half_hint_is_invalid() {
        assert_eq!(
            sys_mmap(KERNEL_HALF_START, 4096, PROT_READ, MAP_ANONYMOUS, -1, 0),
            Err(Errno::InvalidValue)
        );
    }

    #[test]
    fn misaligned_unmap_is_invalid() {
        assert_eq!(sys_munmap(0x40_0001, 4096), Err(Errno::InvalidValue));
        assert_eq!(sys_munmap(0x40_0000, 0), Err(Errno::InvalidValue));
    }

    #[test]
    fn prot_bits_translate() {
        let rw = prot_to_permissions(PROT_READ | PROT_WRITE);
        assert!(rw.contains(MapPermissions::USER | MapPermissions::WRITE));
        assert!(!rw.contains(MapPermissions::EXEC));

        let rx = prot_to_permissions(PROT_READ | PROT_EXEC);
        assert!(rx.contains(MapPermissions::EXEC));
        assert!(!rx.contains(MapPermissions::WRITE));
    }
}
