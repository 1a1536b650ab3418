//! Interrupt descriptor table and vector stubs
//!
//! Every vector funnels through one naked common stub that builds a
//! `TrapFrame`, calls `trap_dispatch`, and returns with `iretq`. The
//! scheduler runs from the LAPIC timer vector by rewriting the frame
//! in place; the panic IPI vector parks remote cores.

use ::core::mem::size_of;
use ::core::sync::atomic::{AtomicU64, Ordering};

use super::context::TrapFrame;
use super::cpu::KERNEL_CODE_SELECTOR;
use super::lapic;

/// LAPIC timer interrupt vector.
pub const TIMER_VECTOR: u8 = 0x40;
/// Cross-core panic vector: receiving cores halt in place.
pub const PANIC_VECTOR: u8 = 0xFE;
/// LAPIC spurious vector.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// Per-boot count of unexpected vectors, for the panic diagnostic.
static STRAY_INTERRUPTS: AtomicU64 = AtomicU64::new(0);

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    _reserved: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0,
            offset_mid: 0,
            offset_high: 0,
            _reserved: 0,
        }
    }

    fn set(&mut self, handler: u64) {
        self.offset_low = handler as u16;
        self.selector = KERNEL_CODE_SELECTOR;
        self.ist = 0;
        self.type_attr = 0x8E; // present, DPL 0, interrupt gate
        self.offset_mid = (handler >> 16) as u16;
        self.offset_high = (handler >> 32) as u32;
    }
}

/// The IDT is shared by every core; each core executes `lidt` on it.
static mut IDT: [IdtEntry; 256] = [IdtEntry::missing(); 256];

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u64,
}

/// Common stub: conditional swapgs, full register save, dispatch.
///
/// On entry the stack holds (low to high): vector, error code, then
/// the hardware frame. CS sits at rsp+24 and selects whether we came
/// from ring 3 and need `swapgs`.
#[unsafe(naked)]
unsafe extern "C" fn interrupt_common() {
    core::arch::naked_asm!(
        "cmp qword ptr [rsp + 24], 0x08",
        "je 2f",
        "swapgs",
        "2:",
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "cmp qword ptr [rsp + 24], 0x08",
        "je 3f",
        "swapgs",
        "3:",
        "add rsp, 16",
        "iretq",
        dispatch = sym trap_dispatch,
    );
}

macro_rules! vector_stub {
    ($name:ident, $vec:literal) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "push 0",
                concat!("push ", $vec),
                "jmp {common}",
                common = sym interrupt_common,
            );
        }
    };
    ($name:ident, $vec:literal, err) => {
        // Hardware already pushed the error code; the vector goes
        // below it, which is exactly the frame layout.
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                concat!("push ", $vec),
                "jmp {common}",
                common = sym interrupt_common,
            );
        }
    };
}

vector_stub!(vec_divide, 0);
vector_stub!(vec_debug, 1);
vector_stub!(vec_nmi, 2);
vector_stub!(vec_breakpoint, 3);
vector_stub!(vec_overflow, 4);
vector_stub!(vec_bound, 5);
vector_stub!(vec_opcode, 6);
vector_stub!(vec_fpu_missing, 7);
vector_stub!(vec_double_fault, 8, err);
vector_stub!(vec_bad_tss, 10, err);
vector_stub!(vec_no_segment, 11, err);
vector_stub!(vec_stack_fault, 12, err);
vector_stub!(vec_gpf, 13, err);
vector_stub!(vec_page_fault, 14, err);
vector_stub!(vec_fpu_error, 16);
vector_stub!(vec_alignment, 17, err);
vector_stub!(vec_machine_check, 18);
vector_stub!(vec_simd, 19);
vector_stub!(vec_timer, 0x40);
vector_stub!(vec_panic_ipi, 0xFE);
vector_stub!(vec_spurious, 0xFF);
vector_stub!(vec_unknown, 0xDD);

const EXCEPTION_NAMES: [&str; 20] = [
    "division by zero",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range",
    "invalid opcode",
    "FPU not present",
    "double fault",
    "coprocessor overrun",
    "bad TSS",
    "segment not present",
    "stack fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 error",
    "alignment check",
    "machine check",
    "SIMD error",
];

/// Populate the shared IDT. Called once, on the BSP, before `lidt`.
pub fn init_idt() {
    let idt = unsafe { &mut *core::ptr::addr_of_mut!(IDT) };

    for entry in idt.iter_mut() {
        entry.set(vec_unknown as usize as u64);
    }

    idt[0].set(vec_divide as usize as u64);
    idt[1].set(vec_debug as usize as u64);
    idt[2].set(vec_nmi as usize as u64);
    idt[3].set(vec_breakpoint as usize as u64);
    idt[4].set(vec_overflow as usize as u64);
    idt[5].set(vec_bound as usize as u64);
    idt[6].set(vec_opcode as usize as u64);
    idt[7].set(vec_fpu_missing as usize as u64);
    idt[8].set(vec_double_fault as usize as u64);
    idt[10].set(vec_bad_tss as usize as u64);
    idt[11].set(vec_no_segment as usize as u64);
    idt[12].set(vec_stack_fault as usize as u64);
    idt[13].set(vec_gpf as usize as u64);
    idt[14].set(vec_page_fault as usize as u64);
    idt[16].set(vec_fpu_error as usize as u64);
    idt[17].set(vec_alignment as usize as u64);
    idt[18].set(vec_machine_check as usize as u64);
    idt[19].set(vec_simd as usize as u64);
    idt[TIMER_VECTOR as usize].set(vec_timer as usize as u64);
    idt[PANIC_VECTOR as usize].set(vec_panic_ipi as usize as u64);
    idt[SPURIOUS_VECTOR as usize].set(vec_spurious as usize as u64);
}

/// Load the shared IDT on the calling core.
pub fn load_idt() {
    let ptr = IdtPointer {
        limit: (size_of::<[IdtEntry; 256]>() - 1) as u16,
        base: core::ptr::addr_of!(IDT) as u64,
    };
    unsafe {
        ::core::arch::asm!(
            "lidt [{}]",
            in(reg) &ptr,
            options(nostack, preserves_flags)
        );
    }
}

/// Central interrupt dispatch, called from the common stub.
extern "C" fn trap_dispatch(frame: &mut TrapFrame) {
    match frame.vector as u8 {
        TIMER_VECTOR => {
            // Ticks, EOIs, and possibly switches away; we resume here
            // whenever this thread is next scheduled.
            crate::task::sched::timer_interrupt();
        }
        PANIC_VECTOR => {
            // Another core is panicking; park quietly.
            super::cpu::halt_forever();
        }
        SPURIOUS_VECTOR => {}
        vec if (vec as usize) < 32 => exception(vec, frame),
        _ => {
            STRAY_INTERRUPTS.fetch_add(1, Ordering::Relaxed);
            lapic::eoi();
        }
    }
}

/// CPU exception: fatal in the kernel, fatal-to-process from ring 3.
fn exception(vec: u8, frame: &mut TrapFrame) {
    let name = EXCEPTION_NAMES
        .get(vec as usize)
        .copied()
        .unwrap_or("reserved");

    if frame.from_user() {
        let pid = super::percpu::current_core().current_pid;
        crate::printkln!(
            "PID {} {} at {:#x} (error {:#x})",
            pid,
            name,
            frame.rip,
            frame.error_code
        );
        crate::task::syscall::fatal_exception(frame);
    }

    let cr2: u64;
    unsafe {
        ::core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
    }
    panic!(
        "kernel {} at {:#x}, error {:#x}, cr2 {:#x}",
        name, frame.rip, frame.error_code, cr2
    );
}
