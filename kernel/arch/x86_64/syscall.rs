//! Syscall entry and exit
//!
//! Userspace executes `syscall`: number in rax, up to six arguments in
//! rdi rsi rdx r10 r8 r9. The entry stub swaps GS, parks the user
//! stack pointer in the core-local scratch slot, switches to the
//! current thread's kernel stack, and builds a full `TrapFrame` so the
//! dispatcher (and `clone`) see the complete register image. Results
//! come back as a `(value, errno)` pair in rax and rdx, value all-ones
//! on failure.

use super::cpu::{KERNEL_CODE_SELECTOR, USER_DATA_SELECTOR};
use super::msr;

/// `TrapFrame.vector` value marking a frame built by syscall entry.
pub const SYSCALL_FRAME_MARK: u64 = 0x100;

/// RFLAGS bits cleared on entry: TF, IF, DF, AC.
const SFMASK_BITS: u64 = 0x4_0700;

/// Program the syscall MSRs on the calling core.
pub fn init() {
    unsafe {
        let efer = msr::rdmsr(msr::MSR_EFER);
        msr::wrmsr(msr::MSR_EFER, efer | msr::EFER_SCE);

        // sysret adds 16 to the selector base for CS and 8 for SS, so
        // the base must sit one slot below the user data selector.
        let star = ((KERNEL_CODE_SELECTOR as u64) << 32)
            | (((USER_DATA_SELECTOR as u64) - 8) << 48);
        msr::wrmsr(msr::MSR_STAR, star);
        msr::wrmsr(msr::MSR_LSTAR, syscall_entry as *const () as u64);
        msr::wrmsr(msr::MSR_SFMASK, SFMASK_BITS);
    }
}

/// Syscall entry stub.
///
/// Core-local offsets used: gs:8 = user RSP scratch, gs:16 = kernel
/// stack top of the running thread (kept current by the scheduler).
#[unsafe(naked)]
unsafe extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        "swapgs",
        "mov gs:[8], rsp",
        "mov rsp, gs:[16]",
        // Build a TrapFrame, highest field first
        "push 0x3B",          // ss: user data, RPL 3
        "push qword ptr gs:[8]", // user rsp
        "push r11",           // rflags saved by syscall
        "push 0x43",          // cs: user code, RPL 3
        "push rcx",           // rip saved by syscall
        "push 0",             // error code
        "push 0x100",         // vector: syscall marker
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
        // The dispatcher wrote the return pair into rax/rdx slots
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
        "add rsp, 16",        // vector + error code
        "pop rcx",            // user rip
        "add rsp, 8",         // cs
        "pop r11",            // user rflags
        "pop rsp",            // user rsp (ss slot abandoned with the stack)
        "swapgs",
        "sysretq",
        dispatch = sym crate::syscall::syscall_dispatch,
    );
}
