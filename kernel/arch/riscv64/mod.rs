//! riscv64 architecture support
//!
//! The RISC-V port mirrors the x86_64 surface at reduced depth: SBI
//! provides the console, timer, and hart bring-up (no trampoline or
//! descriptor tables exist here), hart-locals ride in `tp`, and the
//! page map is Sv39. Secondary harts are started with
//! `sbi_hart_start` instead of INIT/SIPI.

use ::core::sync::atomic::{AtomicU64, Ordering};

pub mod context;
pub mod paging;
pub mod percpu;

// ---------------------------------------------------------------------------
// SBI calls
// ---------------------------------------------------------------------------

fn sbi_call(ext: usize, func: usize, a0: usize, a1: usize, a2: usize) -> (isize, usize) {
    let error: isize;
    let value: usize;
    unsafe {
        ::core::arch::asm!(
            "ecall",
            inout("a0") a0 => error,
            inout("a1") a1 => value,
            in("a2") a2,
            in("a6") func,
            in("a7") ext,
        );
    }
    (error, value)
}

/// Legacy console putchar.
pub fn console_put(byte: u8) {
    sbi_call(0x01, 0, byte as usize, 0, 0);
}

/// The SBI console needs no setup.
pub fn console_init() {}

/// No speaker on this platform; the panic diagnostic is silent.
pub fn panic_beep() {}

/// Program the next timer interrupt (TIME extension).
pub fn set_timer(when: u64) {
    sbi_call(0x54494D45, 0, when as usize, 0, 0);
}

/// Start a secondary hart at `entry` with `opaque` in a1.
pub fn hart_start(hart: usize, entry: u64, opaque: u64) -> bool {
    let (error, _) = sbi_call(0x48534D, 0, hart, entry as usize, opaque as usize);
    error == 0
}

// ---------------------------------------------------------------------------
// Interrupt flag
// ---------------------------------------------------------------------------

const SSTATUS_SIE: u64 = 1 << 1;

/// Save sstatus and clear SIE; returns the saved word.
#[inline]
pub fn irq_save_disable() -> u64 {
    let prev: u64;
    unsafe {
        ::core::arch::asm!(
            "csrrc {}, sstatus, {}",
            out(reg) prev,
            in(reg) SSTATUS_SIE,
            options(nomem, nostack)
        );
    }
    prev
}

/// Restore a saved sstatus interrupt state.
#[inline]
pub fn irq_restore(saved: u64) {
    if saved & SSTATUS_SIE != 0 {
        enable_interrupts();
    }
}

/// Set SIE.
#[inline]
pub fn enable_interrupts() {
    unsafe {
        ::core::arch::asm!(
            "csrs sstatus, {}",
            in(reg) SSTATUS_SIE,
            options(nomem, nostack)
        );
    }
}

/// Clear SIE.
#[inline]
pub fn disable_interrupts() {
    unsafe {
        ::core::arch::asm!(
            "csrc sstatus, {}",
            in(reg) SSTATUS_SIE,
            options(nomem, nostack)
        );
    }
}

/// Wait for an interrupt.
#[inline]
pub fn halt() {
    unsafe {
        ::core::arch::asm!("wfi", options(nomem, nostack));
    }
}

/// Stop this hart permanently.
pub fn halt_forever() -> ! {
    loop {
        disable_interrupts();
        halt();
    }
}

// ---------------------------------------------------------------------------
// Trap handling
// ---------------------------------------------------------------------------

/// Install the trap vector on the calling hart. `sscratch` carries
/// the kernel stack pointer while in user mode and zero while in the
/// kernel, which is how the entry stub picks its stack.
pub fn init_traps() {
    unsafe {
        ::core::arch::asm!(
            "csrw stvec, {}",
            "csrw sscratch, zero",
            in(reg) trap_entry as usize,
            options(nostack)
        );
    }
}

/// Trap entry: select a stack, spill the register file into a
/// `TrapFrame`, dispatch, unspill, return.
#[unsafe(naked)]
unsafe extern "C" fn trap_entry() {
    core::arch::naked_asm!(
        // sscratch is zero for traps from the kernel, the kernel
        // stack pointer for traps from user mode.
        ".align 2",
        "csrrw sp, sscratch, sp",
        "bnez sp, 2f",
        "csrrw sp, sscratch, sp",
        "2:",
        "addi sp, sp, -272",
        "sd x1, 0(sp)",
        // x2 (the old sp) is parked in sscratch; stored below
        "sd x3, 16(sp)",
        "sd x4, 24(sp)",
        "sd x5, 32(sp)",
        "sd x6, 40(sp)",
        "sd x7, 48(sp)",
        "sd x8, 56(sp)",
        "sd x9, 64(sp)",
        "sd x10, 72(sp)",
        "sd x11, 80(sp)",
        "sd x12, 88(sp)",
        "sd x13, 96(sp)",
        "sd x14, 104(sp)",
        "sd x15, 112(sp)",
        "sd x16, 120(sp)",
        "sd x17, 128(sp)",
        "sd x18, 136(sp)",
        "sd x19, 144(sp)",
        "sd x20, 152(sp)",
        "sd x21, 160(sp)",
        "sd x22, 168(sp)",
        "sd x23, 176(sp)",
        "sd x24, 184(sp)",
        "sd x25, 192(sp)",
        "sd x26, 200(sp)",
        "sd x27, 208(sp)",
        "sd x28, 216(sp)",
        "sd x29, 224(sp)",
        "sd x30, 232(sp)",
        "sd x31, 240(sp)",
        "csrr t0, sscratch",
        "sd t0, 8(sp)", // the interrupted sp
        "csrr t0, sepc",
        "sd t0, 248(sp)",
        "csrr t0, sstatus",
        "sd t0, 256(sp)",
        "csrw sscratch, zero",
        "mv a0, sp",
        "call {dispatch}",
        "ld t0, 248(sp)",
        "csrw sepc, t0",
        "ld t0, 256(sp)",
        "csrw sstatus, t0",
        "ld x1, 0(sp)",
        "ld x3, 16(sp)",
        "ld x4, 24(sp)",
        "ld x5, 32(sp)",
        "ld x6, 40(sp)",
        "ld x7, 48(sp)",
        "ld x8, 56(sp)",
        "ld x9, 64(sp)",
        "ld x10, 72(sp)",
        "ld x11, 80(sp)",
        "ld x12, 88(sp)",
        "ld x13, 96(sp)",
        "ld x14, 104(sp)",
        "ld x15, 112(sp)",
        "ld x16, 120(sp)",
        "ld x17, 128(sp)",
        "ld x18, 136(sp)",
        "ld x19, 144(sp)",
        "ld x20, 152(sp)",
        "ld x21, 160(sp)",
        "ld x22, 168(sp)",
        "ld x23, 176(sp)",
        "ld x24, 184(sp)",
        "ld x25, 192(sp)",
        "ld x26, 200(sp)",
        "ld x27, 208(sp)",
        "ld x28, 216(sp)",
        "ld x29, 224(sp)",
        "ld x30, 232(sp)",
        "ld x31, 240(sp)",
        "ld sp, 8(sp)",
        "sret",
        dispatch = sym trap_dispatch,
    );
}

const SCAUSE_INTERRUPT: u64 = 1 << 63;
const IRQ_S_TIMER: u64 = 5;
const EXC_ECALL_USER: u64 = 8;

extern "C" fn trap_dispatch(frame: &mut context::TrapFrame) {
    let scause: u64;
    unsafe {
        ::core::arch::asm!("csrr {}, scause", out(reg) scause, options(nomem, nostack));
    }

    if scause & SCAUSE_INTERRUPT != 0 {
        if scause & !SCAUSE_INTERRUPT == IRQ_S_TIMER {
            crate::task::sched::timer_interrupt();
        }
        return;
    }

    match scause {
        EXC_ECALL_USER => {
            frame.sepc += 4;
            crate::syscall::syscall_dispatch(frame);
        }
        _ if frame.from_user() => {
            crate::task::syscall::fatal_exception(frame);
        }
        _ => {
            panic!("kernel trap, scause {:#x} at {:#x}", scause, frame.sepc);
        }
    }

    // Returning to user mode: re-arm sscratch with this thread's
    // kernel stack for the next trap.
    if frame.from_user() {
        arm_sscratch();
    }
}

/// Point sscratch at the running thread's kernel stack.
pub fn arm_sscratch() {
    let top = percpu::current_core().kernel_stack_top;
    unsafe {
        ::core::arch::asm!("csrw sscratch, {}", in(reg) top, options(nomem, nostack));
    }
}

/// Ticks-per-second of the platform timer, from the device tree or
/// the QEMU default.
pub static TIMEBASE_HZ: AtomicU64 = AtomicU64::new(10_000_000);

/// Read the monotonic time CSR.
#[inline]
pub fn read_time() -> u64 {
    let time: u64;
    unsafe {
        ::core::arch::asm!("csrr {}, time", out(reg) time, options(nomem, nostack));
    }
    time
}

/// Arm the next scheduler tick.
pub fn schedule_tick(hz: u64) {
    let step = TIMEBASE_HZ.load(Ordering::Relaxed) / hz.max(1);
    set_timer(read_time() + step);
}
