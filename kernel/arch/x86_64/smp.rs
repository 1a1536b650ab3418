//! Secondary-core bring-up
//!
//! The BSP copies a real-mode trampoline to a fixed page below 1 MiB,
//! patches it with the kernel CR3, a fresh stack, the target's core
//! number and LAPIC ID, and a zeroed booted flag, then kicks the core
//! with INIT + SIPI. A core that never sets the flag within the poll
//! window is dropped from the core list and the system continues
//! without it.

use ::core::sync::atomic::{AtomicBool, Ordering};

use super::{cpu, interrupts, io, lapic, percpu};
use crate::mm::phys_to_virt;

/// Physical address the trampoline executes at (SIPI vector 8).
const TRAMPOLINE_ADDR: u64 = 0x8000;
const SIPI_VECTOR: u8 = (TRAMPOLINE_ADDR / 0x1000) as u8;

/// Stack handed to each application processor.
const AP_STACK_SIZE: usize = 16 * 1024;

// Trampoline blob; the patch block layout must match `TrampPatch`.
::core::arch::global_asm!(
    r#"
.global __tramp_start
.global __tramp_patch
.global __tramp_end
.section .text
.align 4096
__tramp_start:
.code16
    cli
    cld
    lgdtl 0x8000 + tramp_gdtr - __tramp_start
    movl %cr0, %eax
    orl $1, %eax
    movl %eax, %cr0
    ljmpl $0x08, $0x8000 + tramp_pm - __tramp_start
.code32
tramp_pm:
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss
    movl %cr4, %eax
    orl $0x20, %eax
    movl %eax, %cr4
    movl 0x8000 + tramp_cr3 - __tramp_start, %eax
    movl %eax, %cr3
    movl $0xC0000080, %ecx
    rdmsr
    orl $0x100, %eax
    wrmsr
    movl %cr0, %eax
    orl $0x80000000, %eax
    movl %eax, %cr0
    ljmpl $0x18, $0x8000 + tramp_lm - __tramp_start
.code64
tramp_lm:
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss
    movq 0x8000 + tramp_stack - __tramp_start, %rsp
    movl 0x8000 + tramp_core - __tramp_start, %edi
    movl 0x8000 + tramp_lapic - __tramp_start, %esi
    movq 0x8000 + tramp_entry - __tramp_start, %rax
    callq *%rax
2:  hlt
    jmp 2b
.align 8
tramp_gdtr:
    .word tramp_gdt_end - tramp_gdt - 1
    .long 0x8000 + tramp_gdt - __tramp_start
tramp_gdt:
    .quad 0
    .quad 0x00CF9A000000FFFF
    .quad 0x00CF92000000FFFF
    .quad 0x00AF9A000000FFFF
tramp_gdt_end:
.align 8
__tramp_patch:
tramp_cr3:
    .quad 0
tramp_stack:
    .quad 0
tramp_entry:
    .quad 0
tramp_core:
    .long 0
tramp_lapic:
    .long 0
tramp_flag:
    .quad 0
__tramp_end:
"#,
    options(att_syntax)
);

unsafe extern "C" {
    static __tramp_start: u8;
    static __tramp_patch: u8;
    static __tramp_end: u8;
}

/// Values patched into the trampoline for one AP. Layout mirrors the
/// data block at `__tramp_patch`.
#[repr(C)]
struct TrampPatch {
    cr3: u64,
    stack: u64,
    entry: u64,
    core: u32,
    lapic: u32,
    booted_flag: u64,
}

/// Set by the BSP once timer calibration results are published and
/// APs may enter their idle loops.
static SCHEDULING_READY: AtomicBool = AtomicBool::new(false);

/// Allow application processors to proceed into `idle_core`.
pub fn release_cores() {
    SCHEDULING_READY.store(true, Ordering::Release);
}

fn patch_block() -> *mut TrampPatch {
    let (start, patch) = unsafe {
        (
            ::core::ptr::addr_of!(__tramp_start) as usize,
            ::core::ptr::addr_of!(__tramp_patch) as usize,
        )
    };
    phys_to_virt(TRAMPOLINE_ADDR + (patch - start) as u64) as *mut TrampPatch
}

/// Bring up every usable non-BSP LAPIC from the MADT scan.
///
/// Returns the number of cores online afterwards, BSP included.
pub fn start_secondary_cores(cpus: &[super::acpi::MadtCpu], kernel_cr3: u64) -> usize {
    let bsp_lapic = lapic::id();

    let (start, end) = unsafe {
        (
            ::core::ptr::addr_of!(__tramp_start) as usize,
            ::core::ptr::addr_of!(__tramp_end) as usize,
        )
    };
    let blob_len = end - start;

    let mut core_number = 1u32;
    for cpu_info in cpus {
        if cpu_info.apic_id == bsp_lapic {
            continue;
        }
        if core_number as usize >= percpu::configured_cores() {
            break;
        }

        let stack_top = match allocate_ap_stack() {
            Some(top) => top,
            None => continue,
        };

        // Fresh trampoline copy per core: the patch block is consumed
        // by the target before it sets the booted flag.
        unsafe {
            ::core::ptr::copy_nonoverlapping(
                start as *const u8,
                phys_to_virt(TRAMPOLINE_ADDR),
                blob_len,
            );
            let patch = patch_block();
            (*patch).cr3 = kernel_cr3;
            (*patch).stack = stack_top;
            (*patch).entry = ap_entry as usize as u64;
            (*patch).core = core_number;
            (*patch).lapic = cpu_info.apic_id;
            ::core::ptr::write_volatile(&raw mut (*patch).booted_flag, 0);
        }

        lapic::send_init(cpu_info.apic_id);
        delay_ms(10);
        lapic::send_sipi(cpu_info.apic_id, SIPI_VECTOR);

        if wait_for_boot() {
            core_number += 1;
        }
        // A core that missed the window is omitted; its number is
        // reused for the next candidate.
    }

    percpu::online_cores()
}

/// Poll the booted flag for up to 100 x ~10 ms.
fn wait_for_boot() -> bool {
    for _ in 0..100 {
        let flag = unsafe {
            ::core::ptr::read_volatile(&raw const (*patch_block()).booted_flag)
        };
        if flag != 0 {
            return true;
        }
        delay_ms(10);
    }
    false
}

fn allocate_ap_stack() -> Option<u64> {
    let frames = AP_STACK_SIZE / crate::frame_alloc::FRAME_SIZE;
    let base = crate::frame_alloc::alloc_contiguous(frames)?;
    unsafe {
        ::core::ptr::write_bytes(phys_to_virt(base), 0, AP_STACK_SIZE);
    }
    Some(phys_to_virt(base) as u64 + AP_STACK_SIZE as u64)
}

/// Busy-wait using PIT channel 0's free-running count.
pub fn delay_ms(ms: u32) {
    const TICKS_PER_MS: u16 = 1193;

    for _ in 0..ms {
        let start = read_pit();
        loop {
            let now = read_pit();
            // The counter counts down and wraps
            if start.wrapping_sub(now) >= TICKS_PER_MS {
                break;
            }
            core::hint::spin_loop();
        }
    }
}

fn read_pit() -> u16 {
    io::outb(0x43, 0x00);
    let low = io::inb(0x40) as u16;
    let high = io::inb(0x40) as u16;
    (high << 8) | low
}

/// First Rust code on an application processor.
///
/// Arrives from the trampoline in long mode on its patched stack with
/// the kernel page table active.
extern "C" fn ap_entry(core_number: u32, lapic_id: u32) -> ! {
    interrupts::load_idt();

    let stack_top: u64;
    unsafe {
        ::core::arch::asm!("mov {}, rsp", out(reg) stack_top);
    }

    let block = percpu::init_current(core_number as usize, lapic_id, stack_top);

    lapic::enable();
    block.timer_hz = lapic::calibrate_timer();

    super::syscall::init();

    // Publish: the BSP stops polling once this is non-zero.
    unsafe {
        ::core::ptr::write_volatile(&raw mut (*patch_block()).booted_flag, 1);
    }

    while !SCHEDULING_READY.load(Ordering::Acquire) {
        core::hint::spin_loop();
    }

    lapic::start_timer(block.timer_hz, crate::task::sched::TICK_HZ);
    cpu::enable_interrupts();

    crate::task::sched::idle_core()
}
