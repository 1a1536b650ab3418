//! Saved execution context
//!
//! `TrapFrame` is the register image every interrupt and syscall entry
//! builds on the kernel stack. The scheduler switches threads by
//! copying frames in and out of the thread table and letting the
//! normal `iretq` return path resume whichever thread's image is in
//! place; the only assembly is the entry/exit stubs and the FPU area
//! save/restore.

use super::cpu::{USER_CODE_SELECTOR, USER_DATA_SELECTOR};

/// RFLAGS interrupt-enable bit.
pub const RFLAGS_IF: u64 = 1 << 9;
/// RFLAGS reserved always-one bit.
pub const RFLAGS_RESERVED: u64 = 1 << 1;

/// General-purpose register image.
///
/// Field order matches the push sequence in the interrupt stubs; the
/// trailing five fields are the hardware-pushed interrupt frame.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    /// Interrupt vector, or `SYSCALL_VECTOR_MARK` for syscall frames.
    pub vector: u64,
    /// Hardware error code, zero when the vector pushes none.
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// Zeroed frame.
    pub const fn zeroed() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            vector: 0,
            error_code: 0,
            rip: 0,
            cs: 0,
            rflags: RFLAGS_RESERVED | RFLAGS_IF,
            rsp: 0,
            ss: 0,
        }
    }

    /// Fresh ring-3 frame starting at `entry` on stack `stack_top`.
    pub fn new_user(entry: u64, stack_top: u64) -> Self {
        let mut frame = Self::zeroed();
        frame.rip = entry;
        frame.rsp = stack_top;
        frame.cs = USER_CODE_SELECTOR as u64;
        frame.ss = USER_DATA_SELECTOR as u64;
        frame.rflags = RFLAGS_RESERVED | RFLAGS_IF;
        frame
    }

    /// Whether the frame was captured in ring 3.
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

/// 512-byte fxsave area for the FP/SSE state of one thread.
#[derive(Clone)]
#[repr(C, align(16))]
pub struct FpuArea {
    data: [u8; 512],
}

impl FpuArea {
    /// Area representing freshly initialized FPU state.
    pub const fn new() -> Self {
        let mut data = [0u8; 512];
        // FCW = 0x037F, MXCSR = 0x1F80: the after-finit defaults
        data[0] = 0x7F;
        data[1] = 0x03;
        data[24] = 0x80;
        data[25] = 0x1F;
        Self { data }
    }

    /// Capture the core's FP/SSE state into this area.
    #[inline]
    pub fn save(&mut self) {
        unsafe {
            ::core::arch::asm!(
                "fxsave64 [{}]",
                in(reg) self.data.as_mut_ptr(),
                options(nostack, preserves_flags)
            );
        }
    }

    /// Load this area into the core's FP/SSE state.
    #[inline]
    pub fn restore(&self) {
        unsafe {
            ::core::arch::asm!(
                "fxrstor64 [{}]",
                in(reg) self.data.as_ptr(),
                options(nostack, preserves_flags)
            );
        }
    }
}

impl Default for FpuArea {
    fn default() -> Self {
        Self::new()
    }
}

/// Saved kernel-mode execution point of a suspended thread.
///
/// Everything except the callee-saved registers lives on the thread's
/// kernel stack; the context is just the stack pointer.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct KernelContext {
    pub rsp: u64,
}

impl KernelContext {
    pub const fn empty() -> Self {
        Self { rsp: 0 }
    }
}

/// Switch kernel stacks: save the callee-saved state of the caller
/// into `old`, resume `new` where it last suspended.
///
/// Returns (to the caller) only when something later switches back.
///
/// # Safety
/// Both contexts must reference live, correctly seeded kernel stacks.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(old: *mut KernelContext, new: *const KernelContext) {
    core::arch::naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// Seed a fresh kernel stack so the first `switch_context` into it
/// lands in `entry`. Returns the context to switch to.
///
/// # Safety
/// `stack_top` must be the writable top of a 16-byte-aligned stack.
pub unsafe fn seed_kernel_stack(stack_top: u64, entry: extern "C" fn() -> !) -> KernelContext {
    // Frame popped by switch_context: six callee-saved registers,
    // the return address, and one pad word so the entry function
    // starts with the ABI stack alignment.
    let rsp = stack_top - 8 * 8;
    let slots = rsp as *mut u64;
    unsafe {
        for i in 0..6 {
            slots.add(i).write(0);
        }
        slots.add(6).write(entry as usize as u64);
        slots.add(7).write(0);
    }
    KernelContext { rsp }
}

/// Enter ring 3 for the first time on this core.
///
/// Copies the frame onto the stack in `iretq` layout and restores all
/// general-purpose registers from it. Never returns.
///
/// # Safety
/// The frame must describe a valid ring-3 context whose page table is
/// already active on this core.
pub unsafe fn enter_user(frame: &TrapFrame) -> ! {
    unsafe {
        ::core::arch::asm!(
            // Switch to the frame as a stack and pop everything
            "mov rsp, {frame}",
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
            "add rsp, 16", // vector + error code
            "swapgs",
            "iretq",
            frame = in(reg) frame as *const TrapFrame,
            options(noreturn)
        );
    }
}
