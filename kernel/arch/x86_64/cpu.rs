//! CPU state: GDT, TSS, interrupt flag, identification
//!
//! The GDT layout is fixed so the syscall MSRs can be programmed with
//! constants: kernel code/data at 0x08/0x10, user data/code at
//! 0x38/0x40 (0x3B/0x43 with RPL 3), per-core TSS descriptor at 0x48.
//! Each core owns a private GDT copy because the TSS descriptor in it
//! points at that core's TSS.

use ::core::mem::size_of;

/// Kernel code selector.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
/// Kernel data selector.
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
/// Userland data selector (RPL 3).
pub const USER_DATA_SELECTOR: u16 = 0x38 | 3;
/// Userland 64-bit code selector (RPL 3).
pub const USER_CODE_SELECTOR: u16 = 0x40 | 3;
/// TSS descriptor selector.
pub const TSS_SELECTOR: u16 = 0x48;

/// Number of 8-byte GDT slots (TSS descriptor takes two).
pub const GDT_ENTRIES: usize = 11;

/// 64-bit task-state segment.
///
/// Only `rsp0` (stack loaded on ring transition) and the I/O bitmap
/// offset are consulted by hardware in long mode.
#[repr(C, packed)]
pub struct TaskStateSegment {
    _reserved0: u32,
    /// Stack pointer loaded when entering ring 0 from ring 3.
    pub rsp0: u64,
    pub rsp1: u64,
    pub rsp2: u64,
    _reserved1: u64,
    /// Interrupt stack table.
    pub ist: [u64; 7],
    _reserved2: u64,
    _reserved3: u16,
    /// Offset of the I/O permission bitmap (none: size of the TSS).
    pub iomap_base: u16,
}

impl TaskStateSegment {
    pub const fn new() -> Self {
        Self {
            _reserved0: 0,
            rsp0: 0,
            rsp1: 0,
            rsp2: 0,
            _reserved1: 0,
            ist: [0; 7],
            _reserved2: 0,
            _reserved3: 0,
            iomap_base: size_of::<TaskStateSegment>() as u16,
        }
    }
}

const GDT_PRESENT: u64 = 1 << 47;
const GDT_DPL3: u64 = 3 << 45;
const GDT_CODE_DATA: u64 = 1 << 44;
const GDT_EXEC: u64 = 1 << 43;
const GDT_RW: u64 = 1 << 41;
const GDT_LONG: u64 = 1 << 53;
const GDT_DB: u64 = 1 << 54;
const GDT_GRAN: u64 = 1 << 55;
const GDT_LIMIT_MAX: u64 = 0x000F_0000_0000_FFFF;

const KERNEL_CODE: u64 = GDT_LIMIT_MAX | GDT_PRESENT | GDT_CODE_DATA | GDT_EXEC | GDT_RW | GDT_LONG | GDT_GRAN;
const KERNEL_DATA: u64 = GDT_LIMIT_MAX | GDT_PRESENT | GDT_CODE_DATA | GDT_RW | GDT_DB | GDT_GRAN;
const USER_CODE: u64 = KERNEL_CODE | GDT_DPL3;
const USER_DATA: u64 = KERNEL_DATA | GDT_DPL3;

/// Build a GDT embedding the given TSS.
///
/// Slots: 0 null, 1 kernel code, 2 kernel data, 3-6 unused (layout
/// padding so the user selectors land at 0x38/0x40), 7 user data,
/// 8 user code, 9-10 TSS descriptor.
pub fn build_gdt(tss: &TaskStateSegment) -> [u64; GDT_ENTRIES] {
    let base = tss as *const TaskStateSegment as u64;
    let limit = (size_of::<TaskStateSegment>() - 1) as u64;

    // 16-byte system descriptor, type 0x9 = available 64-bit TSS
    let tss_low = (limit & 0xFFFF)
        | ((base & 0xFF_FFFF) << 16)
        | (0x9u64 << 40)
        | GDT_PRESENT
        | ((limit & 0xF_0000) << 32)
        | ((base & 0xFF00_0000) << 32);
    let tss_high = base >> 32;

    [
        0,
        KERNEL_CODE,
        KERNEL_DATA,
        0,
        0,
        0,
        0,
        USER_DATA,
        USER_CODE,
        tss_low,
        tss_high,
    ]
}

#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u64,
}

/// Load a GDT and reload all segment registers.
///
/// # Safety
/// `gdt` must stay alive and immovable for as long as it is loaded
/// (it lives in the core-local block).
pub unsafe fn load_gdt(gdt: &[u64; GDT_ENTRIES]) {
    let ptr = DescriptorPointer {
        limit: (size_of::<[u64; GDT_ENTRIES]>() - 1) as u16,
        base: gdt.as_ptr() as u64,
    };
    unsafe {
        ::core::arch::asm!(
            "lgdt [{ptr}]",
            // Far-return to reload CS, then refresh the data segments
            "lea {tmp}, [rip + 2f]",
            "push {cs}",
            "push {tmp}",
            "retfq",
            "2:",
            "mov ds, {ds:x}",
            "mov es, {ds:x}",
            "mov ss, {ds:x}",
            ptr = in(reg) &ptr,
            tmp = out(reg) _,
            cs = in(reg) KERNEL_CODE_SELECTOR as u64,
            ds = in(reg) KERNEL_DATA_SELECTOR as u32,
            options(preserves_flags)
        );
    }
}

/// Load the task register with the TSS selector from the current GDT.
///
/// # Safety
/// The GDT loaded on this core must contain a valid TSS descriptor at
/// `TSS_SELECTOR`.
pub unsafe fn load_tss() {
    unsafe {
        ::core::arch::asm!(
            "ltr {sel:x}",
            sel = in(reg) TSS_SELECTOR,
            options(nomem, nostack, preserves_flags)
        );
    }
}

/// Save RFLAGS and disable interrupts; returns the saved flags.
#[inline]
pub fn irq_save_disable() -> u64 {
    let flags: u64;
    unsafe {
        ::core::arch::asm!(
            "pushfq",
            "pop {}",
            "cli",
            out(reg) flags,
        );
    }
    flags
}

/// Restore a previously saved RFLAGS interrupt state.
#[inline]
pub fn irq_restore(saved: u64) {
    if saved & (1 << 9) != 0 {
        enable_interrupts();
    }
}

/// Set the interrupt flag.
#[inline]
pub fn enable_interrupts() {
    unsafe {
        ::core::arch::asm!("sti", options(nomem, nostack));
    }
}

/// Clear the interrupt flag.
#[inline]
pub fn disable_interrupts() {
    unsafe {
        ::core::arch::asm!("cli", options(nomem, nostack));
    }
}

/// Halt until the next interrupt.
#[inline]
pub fn halt() {
    unsafe {
        ::core::arch::asm!("hlt", options(nomem, nostack));
    }
}

/// Stop this core permanently.
pub fn halt_forever() -> ! {
    loop {
        disable_interrupts();
        halt();
    }
}

/// Execute CPUID with the given leaf; returns (eax, ebx, ecx, edx).
pub fn cpuid(leaf: u32) -> (u32, u32, u32, u32) {
    let eax: u32;
    let ebx: u32;
    let ecx: u32;
    let edx: u32;
    unsafe {
        ::core::arch::asm!(
            "push rbx",
            "cpuid",
            "mov {ebx:e}, ebx",
            "pop rbx",
            inout("eax") leaf => eax,
            ebx = out(reg) ebx,
            inout("ecx") 0u32 => ecx,
            out("edx") edx,
        );
    }
    (eax, ebx, ecx, edx)
}

/// Read the time-stamp counter.
#[inline]
pub fn rdtsc() -> u64 {
    let low: u32;
    let high: u32;
    unsafe {
        ::core::arch::asm!(
            "rdtsc",
            out("eax") low,
            out("edx") high,
            options(nomem, nostack, preserves_flags)
        );
    }
    ((high as u64) << 32) | (low as u64)
}
