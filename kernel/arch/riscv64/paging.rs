//! Sv39 page tables
//!
//! Same contract as the x86_64 map: shared kernel half (top half of
//! the 512-entry root), private user half, owned-frame tagging in a
//! software PTE bit, eager fork.

use crate::error::{Errno, KResult};
use crate::frame_alloc;
use crate::mm::phys_to_virt;

pub const PAGE_SIZE: u64 = 4096;

/// Sv39 sign-extends bit 38; the kernel half starts at the canonical
/// top half.
pub const KERNEL_HALF_START: u64 = 0xFFFF_FFC0_0000_0000;
pub const USER_SPACE_END: u64 = 0x0000_0040_0000_0000;

const PTE_VALID: u64 = 1 << 0;
const PTE_READ: u64 = 1 << 1;
const PTE_WRITE: u64 = 1 << 2;
const PTE_EXEC: u64 = 1 << 3;
const PTE_USER: u64 = 1 << 4;
const PTE_ACCESSED: u64 = 1 << 6;
const PTE_DIRTY: u64 = 1 << 7;
/// Software bit: frame owned by this map.
const PTE_OWNED: u64 = 1 << 8;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapPermissions: u8 {
        const WRITE = 1 << 0;
        const EXEC = 1 << 1;
        const USER = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Translation {
    pub phys: u64,
    pub mapped: bool,
    pub user: bool,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

static KERNEL_ROOT: ::core::sync::atomic::AtomicU64 = ::core::sync::atomic::AtomicU64::new(0);

pub fn capture_kernel_root() {
    KERNEL_ROOT.store(current_root(), ::core::sync::atomic::Ordering::SeqCst);
}

pub fn kernel_root() -> u64 {
    KERNEL_ROOT.load(::core::sync::atomic::Ordering::SeqCst)
}

pub fn current_root() -> u64 {
    let satp: u64;
    unsafe {
        ::core::arch::asm!("csrr {}, satp", out(reg) satp, options(nomem, nostack));
    }
    (satp & 0xFFF_FFFF_FFFF) << 12
}

/// Activate a page table by its physical root.
pub fn activate_phys_root(root: u64) {
    if current_root() != root {
        activate_root(root);
    }
}

const SATP_SV39: u64 = 8 << 60;

fn activate_root(root: u64) {
    unsafe {
        ::core::arch::asm!(
            "csrw satp, {}",
            "sfence.vma",
            in(reg) SATP_SV39 | (root >> 12),
            options(nostack)
        );
    }
}

fn table(phys: u64) -> &'static mut [u64; 512] {
    unsafe { &mut *(phys_to_virt(phys) as *mut [u64; 512]) }
}

fn perm_bits(perms: MapPermissions) -> u64 {
    let mut bits = PTE_VALID | PTE_READ | PTE_ACCESSED | PTE_DIRTY;
    if perms.contains(MapPermissions::WRITE) {
        bits |= PTE_WRITE;
    }
    if perms.contains(MapPermissions::EXEC) {
        bits |= PTE_EXEC;
    }
    if perms.contains(MapPermissions::USER) {
        bits |= PTE_USER;
    }
    bits
}

const fn index(virt: u64, level: usize) -> usize {
    ((virt >> (12 + 9 * level)) & 0x1FF) as usize
}

fn leaf(entry: u64) -> bool {
    entry & (PTE_READ | PTE_WRITE | PTE_EXEC) != 0
}

fn entry_phys(entry: u64) -> u64 {
    (entry >> 10) << 12
}

pub struct PageMap {
    root: u64,
}

impl PageMap {
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

    pub fn kernel() -> Self {
        Self {
            root: kernel_root(),
        }
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn make_active(&self) {
        if current_root() != self.root {
            activate_root(self.root);
        }
    }

    fn walk(&self, virt: u64, create: bool) -> Option<*mut u64> {
        let mut table_phys = self.root;
        for level in (1..3).rev() {
            let entry = &mut table(table_phys)[index(virt, level)];
            if *entry & PTE_VALID == 0 {
                if !create {
                    return None;
                }
                let frame = frame_alloc::alloc_frame()?;
                table(frame).fill(0);
                *entry = (frame >> 12) << 10 | PTE_VALID;
            } else if leaf(*entry) {
                return None;
            }
            table_phys = entry_phys(*entry);
        }
        Some(&mut table(table_phys)[index(virt, 0)] as *mut u64)
    }

    pub fn map_range(&self, virt: u64, phys: u64, len: u64, perms: MapPermissions) -> KResult<()> {
        self.map_inner(virt, phys, len, perms, false)
    }

    pub fn map_allocated_range(&self, virt: u64, len: u64, perms: MapPermissions) -> KResult<()> {
        let pages = len.div_ceil(PAGE_SIZE);
        for page in 0..pages {
            let frame = frame_alloc::alloc_frame().ok_or(Errno::NoMemory)?;
            unsafe {
                ::core::ptr::write_bytes(phys_to_virt(frame), 0, PAGE_SIZE as usize);
            }
            if let Err(e) = self.map_inner(virt + page * PAGE_SIZE, frame, PAGE_SIZE, perms, true) {
                frame_alloc::free_frame(frame);
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
            let pte = self
                .walk(virt + page * PAGE_SIZE, true)
                .ok_or(Errno::NoMemory)?;
            unsafe {
                *pte = ((phys + page * PAGE_SIZE) >> 12) << 10 | bits;
            }
        }
        sfence();
        Ok(())
    }

    pub fn unmap_range(&self, virt: u64, len: u64) -> KResult<()> {
        if virt % PAGE_SIZE != 0 {
            return Err(Errno::InvalidValue);
        }
        let pages = len.div_ceil(PAGE_SIZE);
        for page in 0..pages {
            if let Some(pte) = self.walk(virt + page * PAGE_SIZE, false) {
                let entry = unsafe { *pte };
                if entry & PTE_VALID != 0 {
                    if entry & PTE_OWNED != 0 {
                        frame_alloc::free_frame(entry_phys(entry));
                    }
                    unsafe {
                        *pte = 0;
                    }
                }
            }
        }
        sfence();
        Ok(())
    }

    pub fn remap_range(&self, virt: u64, len: u64, perms: MapPermissions) -> KResult<()> {
        if virt % PAGE_SIZE != 0 {
            return Err(Errno::InvalidValue);
        }
        let pages = len.div_ceil(PAGE_SIZE);
        for page in 0..pages {
            let mapped = self
                .walk(virt + page * PAGE_SIZE, false)
                .map(|pte| unsafe { *pte } & PTE_VALID != 0)
                .unwrap_or(false);
            if !mapped {
                return Err(Errno::WouldFault);
            }
        }
        for page in 0..pages {
            let pte = self
                .walk(virt + page * PAGE_SIZE, false)
                .ok_or(Errno::WouldFault)?;
            unsafe {
                let owned = *pte & PTE_OWNED;
                *pte = (entry_phys(*pte) >> 12) << 10 | perm_bits(perms) | owned;
            }
        }
        sfence();
        Ok(())
    }

    pub fn translate(&self, virt: u64) -> Translation {
        let mut table_phys = self.root;
        for level in (1..3).rev() {
            let entry = table(table_phys)[index(virt, level)];
            if entry & PTE_VALID == 0 {
                return Translation::default();
            }
            if leaf(entry) {
                let page_bits = 12 + 9 * level;
                let offset = virt & ((1u64 << page_bits) - 1);
                return Translation {
                    phys: (entry_phys(entry) & !((1u64 << page_bits) - 1)) | offset,
                    mapped: true,
                    user: entry & PTE_USER != 0,
                    readable: entry & PTE_READ != 0,
                    writable: entry & PTE_WRITE != 0,
                    executable: entry & PTE_EXEC != 0,
                };
            }
            table_phys = entry_phys(entry);
        }
        let entry = table(table_phys)[index(virt, 0)];
        if entry & PTE_VALID == 0 {
            return Translation::default();
        }
        Translation {
            phys: entry_phys(entry) | (virt & (PAGE_SIZE - 1)),
            mapped: true,
            user: entry & PTE_USER != 0,
            readable: entry & PTE_READ != 0,
            writable: entry & PTE_WRITE != 0,
            executable: entry & PTE_EXEC != 0,
        }
    }

    pub fn fork(&self) -> Option<Self> {
        let child = Self::new_user()?;
        let mut ok = true;

        let pml = table(self.root);
        for i3 in 0..256 {
            if pml[i3] & PTE_VALID == 0 || leaf(pml[i3]) {
                continue;
            }
            let pd = table(entry_phys(pml[i3]));
            for i2 in 0..512 {
                if pd[i2] & PTE_VALID == 0 || leaf(pd[i2]) {
                    continue;
                }
                let pt = table(entry_phys(pd[i2]));
                for i1 in 0..512 {
                    let entry = pt[i1];
                    if entry & PTE_VALID == 0 {
                        continue;
                    }
                    let va = ((i3 as u64) << 30) | ((i2 as u64) << 21) | ((i1 as u64) << 12);
                    let Some(frame) = frame_alloc::alloc_frame() else {
                        ok = false;
                        continue;
                    };
                    unsafe {
                        ::core::ptr::copy_nonoverlapping(
                            phys_to_virt(entry_phys(entry)),
                            phys_to_virt(frame),
                            PAGE_SIZE as usize,
                        );
                    }
                    if let Some(pte) = child.walk(va, true) {
                        unsafe {
                            *pte = (frame >> 12) << 10 | (entry & 0x3FF) | PTE_OWNED;
                        }
                    } else {
                        frame_alloc::free_frame(frame);
                        ok = false;
                    }
                }
            }
        }

        if !ok {
            child.destroy();
            return None;
        }
        Some(child)
    }

    pub fn destroy(&self) {
        let pml = table(self.root);
        for i3 in 0..256 {
            if pml[i3] & PTE_VALID == 0 || leaf(pml[i3]) {
                continue;
            }
            let pd_phys = entry_phys(pml[i3]);
            let pd = table(pd_phys);
            for i2 in 0..512 {
                if pd[i2] & PTE_VALID == 0 || leaf(pd[i2]) {
                    continue;
                }
                let pt_phys = entry_phys(pd[i2]);
                let pt = table(pt_phys);
                for i1 in 0..512 {
                    let entry = pt[i1];
                    if entry & PTE_VALID != 0 && entry & PTE_OWNED != 0 {
                        frame_alloc::free_frame(entry_phys(entry));
                    }
                    pt[i1] = 0;
                }
                frame_alloc::free_frame(pt_phys);
            }
            frame_alloc::free_frame(pd_phys);
            pml[i3] = 0;
        }
        frame_alloc::free_frame(self.root);
    }
}

#[inline]
fn sfence() {
    unsafe {
        ::core::arch::asm!("sfence.vma", options(nostack));
    }
}
