//! Virtual-memory management
//!
//! `AddressSpace` is the per-process view over the arch page map. The
//! physical-memory window (`phys_to_virt`) is the only way kernel code
//! touches frame contents; its offset comes from the boot protocol
//! (HHDM under Limine, identity under Multiboot2).

pub mod syscall;

use ::core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::paging::{self, PageMap};
use crate::error::KResult;

pub use crate::arch::paging::{
    MapPermissions, Translation, KERNEL_HALF_START, PAGE_SIZE, USER_SPACE_END,
};

/// Offset of the direct physical-memory window.
static PHYS_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Record the physical window offset reported by the bootloader.
pub fn set_phys_offset(offset: u64) {
    PHYS_OFFSET.store(offset, Ordering::SeqCst);
}

/// Kernel-virtual pointer for a physical address.
#[inline]
pub fn phys_to_virt(phys: u64) -> *mut u8 {
    (PHYS_OFFSET.load(Ordering::Relaxed) + phys) as *mut u8
}

/// Whether `[addr, addr+len)` is a well-formed userland range: no
/// wraparound, non-empty, and entirely below the kernel half.
pub fn check_userland_mappability(addr: u64, len: u64) -> bool {
    if len == 0 {
        return false;
    }
    match addr.checked_add(len) {
        Some(end) => end <= USER_SPACE_END,
        None => false,
    }
}

/// A process's page table plus the kernel's bookkeeping for it.
pub struct AddressSpace {
    map: PageMap,
}

impl AddressSpace {
    /// Fresh user address space sharing the kernel half.
    pub fn new_user() -> Option<Self> {
        Some(Self {
            map: PageMap::new_user()?,
        })
    }

    /// The boot kernel map, wrapped for the idle threads.
    pub fn kernel() -> Self {
        Self {
            map: PageMap::kernel(),
        }
    }

    /// Physical root frame (CR3 / satp payload).
    pub fn root(&self) -> u64 {
        self.map.root()
    }

    /// Activate on the calling core.
    pub fn make_active(&self) {
        self.map.make_active();
    }

    /// Map fresh zeroed frames at `virt`.
    pub fn map_allocated_range(&self, virt: u64, len: u64, perms: MapPermissions) -> KResult<()> {
        self.map.map_allocated_range(virt, len, perms)
    }

    /// Map an existing physical extent at `virt`.
    pub fn map_range(&self, virt: u64, phys: u64, len: u64, perms: MapPermissions) -> KResult<()> {
        self.map.map_range(virt, phys, len, perms)
    }

    /// Unmap the exact range, freeing owned frames.
    pub fn unmap_range(&self, virt: u64, len: u64) -> KResult<()> {
        self.map.unmap_range(virt, len)
    }

    /// Re-protect an existing range.
    pub fn remap_range(&self, virt: u64, len: u64, perms: MapPermissions) -> KResult<()> {
        self.map.remap_range(virt, len, perms)
    }

    /// Translate a single address.
    pub fn translate(&self, virt: u64) -> Translation {
        self.map.translate(virt)
    }

    /// Eagerly duplicate the user half for a forked child.
    pub fn fork(&self) -> Option<Self> {
        Some(Self {
            map: self.map.fork()?,
        })
    }

}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // The kernel map is shared and never torn down; user maps
        // free their frames with the last reference.
        if self.map.root() != paging::kernel_root() {
            self.map.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_range_is_not_mappable() {
        assert!(!check_userland_mappability(0x1000, 0));
    }

    #[test]
    fn kernel_half_is_not_mappable() {
        assert!(!check_userland_mappability(KERNEL_HALF_START, 4096));
        assert!(!check_userland_mappability(u64::MAX - 4096, 4096));
    }

    #[test]
    fn range_straddling_the_boundary_is_rejected() {
        assert!(!check_userland_mappability(USER_SPACE_END - 4096, 8192));
        assert!(check_userland_mappability(USER_SPACE_END - 4096, 4096));
    }

    #[test]
    fn wrapping_range_is_rejected() {
        assert!(!check_userland_mappability(u64::MAX, 2));
    }

    #[test]
    fn ordinary_user_range_is_mappable() {
        assert!(check_userland_mappability(0x40_0000, 0x1_0000));
    }
}
