//! Four-level page tables
//!
//! `PageMap` owns a PML4 root frame. The kernel half (PML4 slots
//! 256..512) is shared by reference with the boot page table, so every
//! map sees the same kernel; the user half is private. Frames obtained
//! through `map_allocated_range` are tagged with a software PTE bit
//! and returned to the frame allocator on unmap/destroy; frames mapped
//! with `map_range` (device windows) are never freed here.

use crate::error::{Errno, KResult};
use crate::frame_alloc;
use crate::mm::phys_to_virt;

/// Virtual page size.
pub const PAGE_SIZE: u64 = 4096;

/// First address of the shared kernel half.
pub const KERNEL_HALF_START: u64 = 0xFFFF_8000_0000_0000;
/// One past the last userland-mappable address.
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 2;
const PTE_HUGE: u64 = 1 << 7;
/// Software bit: the mapped frame belongs to this map.
const PTE_OWNED: u64 = 1 << 9;
const PTE_NX: u64 = 1 << 63;
const PTE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags::bitflags! {
    /// Mapping permissions, translated to PTE bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapPermissions: u8 {
        const WRITE = 1 << 0;
        const EXEC = 1 << 1;
        const USER = 1 << 2;
    }
}

/// Result of translating one virtual address.
#[derive(Debug, Clone, Copy, Default)]
pub struct Translation {
    pub phys: u64,
    pub mapped: bool,
    pub user: bool,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

/// Root of the boot (kernel) page table, captured once at startup.
static KERNEL_ROOT: ::core::sync::atomic::AtomicU64 = ::core::sync::atomic::AtomicU64::new(0);

/// Record the boot page table as the canonical kernel map.
pub fn capture_kernel_root() {
    KERNEL_ROOT.store(current_root(), ::core::sync::atomic::Ordering::SeqCst);
}

/// Physical root of the kernel map (the trampoline CR3).
pub fn kernel_root() -> u64 {
    KERNEL_ROOT.load(::core::sync::atomic::Ordering::SeqCst)
}

/// Read CR3.
pub fn current_root() -> u64 {
    let cr3: u64;
    unsafe {
        ::core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
    }
    cr3 & PTE_ADDR_MASK
}

/// Activate a page table by its physical root, skipping the write
/// when it is already live (the scheduler's fast path).
pub fn activate_phys_root(root: u64) {
    if current_root() != root {
        write_cr3(root);
    }
}

fn write_cr3(root: u64) {
    unsafe {
        ::core::arch::asm!("mov cr3, {}", in(reg) root, options(nostack, preserves_flags));
    }
}

#[inline]
fn invlpg(virt: u64) {
    unsafe {
        ::core::arch::asm!("invlpg [{}]", in(reg) virt, options(nostack, preserves_flags));
    }
}

fn table(phys: u64) -> &'static mut [u64; 512] {
    unsafe { &mut *(phys_to_virt(phys) as *mut [u64; 512]) }
}

fn perm_bits(perms: MapPermissions) -> u64 {
    let mut bits = PTE_PRESENT;
    if perms.contains(MapPermissions::WRITE) {
        bits |= PTE_WRITE;
    }
    if perms.contains(MapPermissions::USER) {
        bits |= PTE_USER;
    }
    if !perms.contains(MapPermissions::EXEC) {
        bits |= PTE_NX;
    }
    bits
}

const fn index(virt: u64, level: usize) -> usize {
    ((virt >> (12 + 9 * level)) & 0x1FF) as usize
}

/// A per-process page table.
pub struct PageMap {
    root: u64,
}

impl PageMap {
    /// Fresh user map: empty lower half, kernel half shared with the
    /// boot table.
    pub fn new_user() -> Option<Self> {
        let root = frame_alloc::alloc_frame()?;
        let new = table(root);
        let kernel = table(kernel_root());
        for slot in 0..256 {
            new[slot] = 0;
        }
        for slot in 256..512 {
            new[slot] = kernel[slot];
        }
        Some(Self { root })
    }

    /// Wrap the kernel map itself (used before the first process).
    pub fn kernel() -> Self {
        Self {
            root: kernel_root(),
        }
    }

    /// Physical root frame, for CR3 and the SMP trampoline.
    pub fn root(&self) -> u64 {
        self.root
    }

    /// Load this map on the calling core.
    pub fn make_active(&self) {
        if current_root() != self.root {
            write_cr3(self.root);
        }
    }

    /// Walk to the PTE for `virt`, optionally creating intermediate
    /// tables. Returns None on a hole (when not creating) or on a
    /// huge-page conflict.
    fn walk(&self, virt: u64, create: bool) -> Option<*mut u64> {
        let mut table_phys = self.root;
        for level in (1..4).rev() {
            let entry = &mut table(table_phys)[index(virt, level)];
            if *entry & PTE_PRESENT == 0 {
                if !create {
                    return None;
                }
                let frame = frame_alloc::alloc_frame()?;
                table(frame).fill(0);
                // Intermediate entries stay permissive; the leaf
                // carries the real permissions.
                *entry = frame | PTE_PRESENT | PTE_WRITE | PTE_USER;
            } else if *entry & PTE_HUGE != 0 {
                return None;
            }
            table_phys = *entry & PTE_ADDR_MASK;
        }
        Some(&mut table(table_phys)[index(virt, 0)] as *mut u64)
    }

    /// Map `len` bytes at `virt` to the physical extent at `phys`.
    pub fn map_range(
        &self,
        virt: u64,
        phys: u64,
        len: u64,
        perms: MapPermissions,
    ) -> KResult<()> {
        self.map_inner(virt, phys, len, perms, false)
    }

    /// Map `len` bytes at `virt` to freshly allocated, zeroed frames.
    pub fn map_allocated_range(&self, virt: u64, len: u64, perms: MapPermissions) -> KResult<()> {
        let pages = len.div_ceil(PAGE_SIZE);
        for page in 0..pages {
            let frame = frame_alloc::alloc_frame().ok_or(Errno::NoMemory)?;
            unsafe {
                ::core::ptr::write_bytes(phys_to_virt(frame), 0, PAGE_SIZE as usize);
            }
            if let Err(e) = self.map_inner(
                virt + page * PAGE_SIZE,
                frame,
                PAGE_SIZE,
                perms,
                true,
            ) {
                frame_alloc::free_frame(frame);
                // Unwind the pages mapped so far
                let _ = self.unmap_range(virt, page * PAGE_SIZE);
                return Err(e);
            }
        }
        Ok(())
    }

    fn map_inner(
        &self,
        virt: u64,
        phys: u64,
        len: u64,
        perms: MapPermissions,
        owned: bool,
    ) -> KResult<()> {
        if virt % PAGE_SIZE != 0 || phys % PAGE_SIZE != 0 || len == 0 {
            return Err(Errno::InvalidValue);
        }
        let bits = perm_bits(perms) | if owned { PTE_OWNED } else { 0 };
        let pages = len.div_ceil(PAGE_SIZE);
        for page in 0..pages {
            let va = virt + page * PAGE_SIZE;
            let pte = self.walk(va, true).ok_or(Errno::NoMemory)?;
            unsafe {
                *pte = (phys + page * PAGE_SIZE) | bits;
            }
            if current_root() == self.root {
                invlpg(va);
            }
        }
        Ok(())
    }

    /// Unmap the exact range, returning owned frames to the allocator.
    pub fn unmap_range(&self, virt: u64, len: u64) -> KResult<()> {
        if virt % PAGE_SIZE != 0 {
            return Err(Errno::InvalidValue);
        }
        let pages = len.div_ceil(PAGE_SIZE);
        for page in 0..pages {
            let va = virt + page * PAGE_SIZE;
            if let Some(pte) = self.walk(va, false) {
                let entry = unsafe { *pte };
                if entry & PTE_PRESENT != 0 {
                    if entry & PTE_OWNED != 0 {
                        frame_alloc::free_frame(entry & PTE_ADDR_MASK);
                    }
                    unsafe {
                        *pte = 0;
                    }
                    if current_root() == self.root {
                        invlpg(va);
                    }
                }
            }
        }
        Ok(())
    }

    /// Change permissions on an existing range. Any unmapped page in
    /// the range fails the whole call.
    pub fn remap_range(&self, virt: u64, len: u64, perms: MapPermissions) -> KResult<()> {
        if virt % PAGE_SIZE != 0 {
            return Err(Errno::InvalidValue);
        }
        let pages = len.div_ceil(PAGE_SIZE);
        // Verify first so a partial failure changes nothing
        for page in 0..pages {
            let va = virt + page * PAGE_SIZE;
            let mapped = self
                .walk(va, false)
                .map(|pte| unsafe { *pte } & PTE_PRESENT != 0)
                .unwrap_or(false);
            if !mapped {
                return Err(Errno::WouldFault);
            }
        }
        for page in 0..pages {
            let va = virt + page * PAGE_SIZE;
            let pte = self.walk(va, false).ok_or(Errno::WouldFault)?;
            unsafe {
                let frame = *pte & PTE_ADDR_MASK;
                let owned = *pte & PTE_OWNED;
                *pte = frame | perm_bits(perms) | owned;
            }
            if current_root() == self.root {
                invlpg(va);
            }
        }
        Ok(())
    }

    /// Translate one virtual address.
    pub fn translate(&self, virt: u64) -> Translation {
        let mut table_phys = self.root;
        for level in (1..4).rev() {
            let entry = table(table_phys)[index(virt, level)];
            if entry & PTE_PRESENT == 0 {
                return Translation::default();
            }
            if entry & PTE_HUGE != 0 {
                // 1 GiB or 2 MiB leaf
                let page_bits = 12 + 9 * level;
                let offset = virt & ((1u64 << page_bits) - 1);
                return Translation {
                    phys: (entry & PTE_ADDR_MASK & !((1u64 << page_bits) - 1)) | offset,
                    mapped: true,
                    user: entry & PTE_USER != 0,
                    readable: true,
                    writable: entry & PTE_WRITE != 0,
                    executable: entry & PTE_NX == 0,
                };
            }
            table_phys = entry & PTE_ADDR_MASK;
        }
        let entry = table(table_phys)[index(virt, 0)];
        if entry & PTE_PRESENT == 0 {
            return Translation::default();
        }
        Translation {
            phys: (entry & PTE_ADDR_MASK) | (virt & (PAGE_SIZE - 1)),
            mapped: true,
            user: entry & PTE_USER != 0,
            readable: true,
            writable: entry & PTE_WRITE != 0,
            executable: entry & PTE_NX == 0,
        }
    }

    /// Duplicate this map for a forked process.
    ///
    /// The kernel half is shared; every present user page is copied
    /// eagerly into a fresh owned frame with the same permissions.
    pub fn fork(&self) -> Option<Self> {
        let child = Self::new_user()?;

        let mut ok = true;
        self.walk_user_pages(|va, entry| {
            let src_phys = entry & PTE_ADDR_MASK;
            let Some(frame) = frame_alloc::alloc_frame() else {
                ok = false;
                return;
            };
            unsafe {
                ::core::ptr::copy_nonoverlapping(
                    phys_to_virt(src_phys),
                    phys_to_virt(frame),
                    PAGE_SIZE as usize,
                );
            }
            let flags = entry & !PTE_ADDR_MASK | PTE_OWNED;
            if let Some(pte) = child.walk(va, true) {
                unsafe {
                    *pte = frame | (flags & !PTE_ADDR_MASK);
                }
            } else {
                frame_alloc::free_frame(frame);
                ok = false;
            }
        });

        if !ok {
            child.destroy();
            return None;
        }
        Some(child)
    }

    /// Visit every present 4 KiB user page.
    fn walk_user_pages(&self, mut f: impl FnMut(u64, u64)) {
        let pml4 = table(self.root);
        for i4 in 0..256 {
            if pml4[i4] & PTE_PRESENT == 0 {
                continue;
            }
            let pdpt = table(pml4[i4] & PTE_ADDR_MASK);
            for i3 in 0..512 {
                if pdpt[i3] & PTE_PRESENT == 0 || pdpt[i3] & PTE_HUGE != 0 {
                    continue;
                }
                let pd = table(pdpt[i3] & PTE_ADDR_MASK);
                for i2 in 0..512 {
                    if pd[i2] & PTE_PRESENT == 0 || pd[i2] & PTE_HUGE != 0 {
                        continue;
                    }
                    let pt = table(pd[i2] & PTE_ADDR_MASK);
                    for i1 in 0..512 {
                        let entry = pt[i1];
                        if entry & PTE_PRESENT != 0 {
                            let va = ((i4 as u64) << 39)
                                | ((i3 as u64) << 30)
                                | ((i2 as u64) << 21)
                                | ((i1 as u64) << 12);
                            f(va, entry);
                        }
                    }
                }
            }
        }
    }

    /// Tear the map down: free owned user frames, the user-half
    /// intermediate tables, and the root. The map must not be active
    /// on any core, and must not be used afterwards.
    pub fn destroy(&self) {
        let pml4 = table(self.root);
        for i4 in 0..256 {
            if pml4[i4] & PTE_PRESENT == 0 {
                continue;
            }
            let pdpt_phys = pml4[i4] & PTE_ADDR_MASK;
            let pdpt = table(pdpt_phys);
            for i3 in 0..512 {
                if pdpt[i3] & PTE_PRESENT == 0 || pdpt[i3] & PTE_HUGE != 0 {
                    continue;
                }
                let pd_phys = pdpt[i3] & PTE_ADDR_MASK;
                let pd = table(pd_phys);
                for i2 in 0..512 {
                    if pd[i2] & PTE_PRESENT == 0 || pd[i2] & PTE_HUGE != 0 {
                        continue;
                    }
                    let pt_phys = pd[i2] & PTE_ADDR_MASK;
                    let pt = table(pt_phys);
                    for i1 in 0..512 {
                        let entry = pt[i1];
                        if entry & PTE_PRESENT != 0 && entry & PTE_OWNED != 0 {
                            frame_alloc::free_frame(entry & PTE_ADDR_MASK);
                        }
                        pt[i1] = 0;
                    }
                    frame_alloc::free_frame(pt_phys);
                }
                frame_alloc::free_frame(pd_phys);
            }
            frame_alloc::free_frame(pdpt_phys);
            pml4[i4] = 0;
        }
        frame_alloc::free_frame(self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_indices_split_the_address() {
        let va: u64 = 0x0000_7F8D_2A3B_4000;
        assert_eq!(index(va, 3), (va >> 39) as usize & 0x1FF);
        assert_eq!(index(va, 0), (va >> 12) as usize & 0x1FF);
    }

    #[test]
    fn permission_bits_follow_flags() {
        let rw = perm_bits(MapPermissions::WRITE | MapPermissions::USER);
        assert_ne!(rw & PTE_WRITE, 0);
        assert_ne!(rw & PTE_USER, 0);
        assert_ne!(rw & PTE_NX, 0);

        let rx = perm_bits(MapPermissions::EXEC);
        assert_eq!(rx & PTE_NX, 0);
        assert_eq!(rx & PTE_WRITE, 0);
    }
}
