//! Architecture selection
//!
//! Each port exposes the same surface: interrupt-flag save/restore,
//! console bytes, per-core locals, the page-map type, the trap frame,
//! and the kernel context switch. Generic kernel code reaches all of
//! it through this module; under `cfg(test)` the privileged leaves are
//! replaced with inert stubs so logic tests run on the host.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "riscv64")]
pub mod riscv64;

#[cfg(target_arch = "x86_64")]
pub use x86_64::{
    console_init, console_put, context, paging, panic_beep, percpu,
};

#[cfg(target_arch = "riscv64")]
pub use riscv64::{
    console_init, console_put, context, paging, panic_beep, percpu,
};

#[cfg(all(target_arch = "x86_64", not(test)))]
pub use x86_64::cpu::{
    disable_interrupts, enable_interrupts, halt, halt_forever, irq_restore, irq_save_disable,
};

#[cfg(all(target_arch = "riscv64", not(test)))]
pub use riscv64::{
    disable_interrupts, enable_interrupts, halt, halt_forever, irq_restore, irq_save_disable,
};

// Host-test stubs: interrupt state is a no-op and the console is
// swallowed (printk keeps everything in its buffer).
#[cfg(test)]
mod test_stubs {
    pub fn irq_save_disable() -> u64 {
        0
    }
    pub fn irq_restore(_saved: u64) {}
    pub fn enable_interrupts() {}
    pub fn disable_interrupts() {}
    pub fn halt() {}
    pub fn halt_forever() -> ! {
        panic!("halt_forever in test");
    }
}

#[cfg(test)]
pub use test_stubs::{
    disable_interrupts, enable_interrupts, halt, halt_forever, irq_restore, irq_save_disable,
};
