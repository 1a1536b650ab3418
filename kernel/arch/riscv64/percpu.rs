//! Hart-local storage
//!
//! The riscv64 equivalent of the GS-based core-local block: the block
//! address rides in `tp` while in supervisor mode. Same shape as the
//! x86_64 block minus descriptor-table state.

use ::core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::task::{Pid, Tid};

/// Per-hart state block.
#[repr(C)]
pub struct CoreLocal {
    /// Self-pointer, for parity with the x86_64 layout.
    pub self_ptr: *mut CoreLocal,
    /// Scratch for the user stack pointer across trap entry.
    pub user_sp_scratch: u64,
    /// Kernel stack loaded by the trap entry. Repointed at every
    /// thread switch.
    pub kernel_stack_top: u64,

    /// This hart's own boot/idle stack, never repointed.
    pub idle_stack_top: u64,

    pub core_number: u32,
    /// Hart id (the platform interrupt-controller identity).
    pub lapic_id: u32,
    /// Platform timer frequency.
    pub timer_hz: u64,
    pub current_tid: Tid,
    pub current_pid: Pid,
    pub ticks: AtomicU64,
}

static mut CORE_LOCALS: Option<&'static mut [CoreLocal]> = None;

pub static ONLINE_CORES: AtomicU32 = AtomicU32::new(0);

impl CoreLocal {
    fn blank() -> Self {
        Self {
            self_ptr: ::core::ptr::null_mut(),
            user_sp_scratch: 0,
            kernel_stack_top: 0,
            idle_stack_top: 0,
            core_number: 0,
            lapic_id: 0,
            timer_hz: 0,
            current_tid: 0,
            current_pid: 0,
            ticks: AtomicU64::new(0),
        }
    }
}

/// Allocate hart-local blocks for `count` harts.
pub fn allocate(count: usize) {
    let mut blocks = alloc::vec::Vec::with_capacity(count);
    for _ in 0..count {
        blocks.push(CoreLocal::blank());
    }
    unsafe {
        CORE_LOCALS = Some(alloc::boxed::Box::leak(blocks.into_boxed_slice()));
    }
}

pub fn configured_cores() -> usize {
    unsafe {
        (*core::ptr::addr_of!(CORE_LOCALS))
            .as_deref()
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

/// Initialize the calling hart's block and point `tp` at it.
pub fn init_current(core: usize, hart_id: u32, kernel_stack_top: u64) -> &'static mut CoreLocal {
    let block = unsafe {
        let locals = (*core::ptr::addr_of_mut!(CORE_LOCALS))
            .as_deref_mut()
            .expect("hart locals not allocated");
        &mut locals[core]
    };
    block.self_ptr = block as *mut CoreLocal;
    block.core_number = core as u32;
    block.lapic_id = hart_id;
    block.kernel_stack_top = kernel_stack_top;
    block.idle_stack_top = kernel_stack_top;

    unsafe {
        ::core::arch::asm!(
            "mv tp, {}",
            in(reg) block.self_ptr,
            options(nomem, nostack)
        );
    }

    ONLINE_CORES.fetch_add(1, Ordering::SeqCst);
    block
}

/// The calling hart's block.
#[inline]
pub fn current_core() -> &'static mut CoreLocal {
    let ptr: *mut CoreLocal;
    unsafe {
        ::core::arch::asm!("mv {}, tp", out(reg) ptr, options(nomem, nostack));
        &mut *ptr
    }
}

pub fn core(n: usize) -> Option<&'static CoreLocal> {
    unsafe {
        (*core::ptr::addr_of!(CORE_LOCALS))
            .as_deref()
            .and_then(|l| l.get(n))
    }
}

pub fn online_cores() -> usize {
    ONLINE_CORES.load(Ordering::Acquire) as usize
}
