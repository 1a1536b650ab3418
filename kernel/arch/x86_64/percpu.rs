//! Core-local storage
//!
//! One `CoreLocal` block per CPU, reachable in two instructions via
//! the GS segment base (`mov rax, gs:0` reads the self-pointer). The
//! array is sized at SMP bring-up from the MADT CPU count and never
//! freed. Both `IA32_GS_BASE` and `IA32_KERNEL_GS_BASE` are pointed
//! at the block so the `swapgs` discipline starts consistent.
//!
//! The first three fields are read from assembly in the syscall entry
//! stub; their offsets are load-bearing.

use ::core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::cpu::{self, TaskStateSegment, GDT_ENTRIES};
use super::msr;
use crate::task::{Pid, Tid};

/// Per-CPU state block.
#[repr(C)]
pub struct CoreLocal {
    /// Self-pointer; `gs:0` in kernel mode. Offset 0.
    pub self_ptr: *mut CoreLocal,
    /// Scratch slot for the user RSP across syscall entry. Offset 8.
    pub user_rsp_scratch: u64,
    /// Kernel stack loaded by the syscall entry stub. Offset 16.
    /// Repointed to the running thread's stack at every switch.
    pub kernel_stack_top: u64,

    /// This core's own boot/idle stack, never repointed.
    pub idle_stack_top: u64,

    /// Logical core number (0 = BSP).
    pub core_number: u32,
    /// This core's LAPIC ID.
    pub lapic_id: u32,
    /// Measured LAPIC timer ticks per second.
    pub timer_hz: u64,
    /// Thread currently executing on this core (0 = idle).
    pub current_tid: Tid,
    /// Process owning `current_tid` (0 = none).
    pub current_pid: Pid,
    /// Scheduler tick counter for this core.
    pub ticks: AtomicU64,

    /// Hardware task-state segment; rsp0 is kept equal to
    /// `kernel_stack_top` so ring transitions land on the same stack.
    pub tss: TaskStateSegment,
    /// This core's private GDT (it embeds the TSS descriptor).
    pub gdt: [u64; GDT_ENTRIES],
}

/// All core-local blocks, allocated once during bring-up.
static mut CORE_LOCALS: Option<&'static mut [CoreLocal]> = None;

/// Number of cores that completed bring-up.
pub static ONLINE_CORES: AtomicU32 = AtomicU32::new(0);

impl CoreLocal {
    fn blank() -> Self {
        Self {
            self_ptr: ::core::ptr::null_mut(),
            user_rsp_scratch: 0,
            kernel_stack_top: 0,
            idle_stack_top: 0,
            core_number: 0,
            lapic_id: 0,
            timer_hz: 0,
            current_tid: 0,
            current_pid: 0,
            ticks: AtomicU64::new(0),
            tss: TaskStateSegment::new(),
            gdt: [0; GDT_ENTRIES],
        }
    }
}

/// Allocate the core-local array for `count` CPUs.
///
/// Must run before any AP is started and after the heap is live.
pub fn allocate(count: usize) {
    let mut blocks = alloc::vec::Vec::with_capacity(count);
    for _ in 0..count {
        blocks.push(CoreLocal::blank());
    }
    unsafe {
        CORE_LOCALS = Some(alloc::boxed::Box::leak(blocks.into_boxed_slice()));
    }
}

fn slot(core: usize) -> &'static mut CoreLocal {
    unsafe {
        let locals = (*core::ptr::addr_of_mut!(CORE_LOCALS))
            .as_deref_mut()
            .expect("core locals not allocated");
        &mut locals[core]
    }
}

/// Number of configured core-local slots.
pub fn configured_cores() -> usize {
    unsafe {
        (*core::ptr::addr_of!(CORE_LOCALS))
            .as_deref()
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

/// Initialize the calling core's slot and publish it through GS.
///
/// Loads the private GDT + TSS and writes both GS base MSRs. Returns
/// the block for further setup.
pub fn init_current(core: usize, lapic_id: u32, kernel_stack_top: u64) -> &'static mut CoreLocal {
    let block = slot(core);
    block.self_ptr = block as *mut CoreLocal;
    block.core_number = core as u32;
    block.lapic_id = lapic_id;
    block.kernel_stack_top = kernel_stack_top;
    block.idle_stack_top = kernel_stack_top;
    block.tss.rsp0 = kernel_stack_top;
    block.gdt = cpu::build_gdt(&block.tss);

    unsafe {
        cpu::load_gdt(&block.gdt);
        cpu::load_tss();
    }

    let addr = block.self_ptr as u64;
    msr::set_gs_base(addr);
    msr::set_kernel_gs_base(addr);

    ONLINE_CORES.fetch_add(1, Ordering::SeqCst);
    block
}

/// The calling core's block.
///
/// GS must have been published by `init_current` on this core.
#[inline]
pub fn current_core() -> &'static mut CoreLocal {
    let ptr: *mut CoreLocal;
    unsafe {
        ::core::arch::asm!(
            "mov {}, gs:0",
            out(reg) ptr,
            options(pure, readonly, nostack, preserves_flags)
        );
        &mut *ptr
    }
}

/// Another core's block, for the panic broadcast and CPU listings.
pub fn core(n: usize) -> Option<&'static CoreLocal> {
    unsafe {
        (*core::ptr::addr_of!(CORE_LOCALS))
            .as_deref()
            .and_then(|l| l.get(n))
    }
}

/// Count of cores that finished bring-up.
pub fn online_cores() -> usize {
    ONLINE_CORES.load(Ordering::Acquire) as usize
}
