//! Local APIC
//!
//! Register access through the physical-memory window, timer
//! calibration against PIT channel 2, and the IPI primitives used by
//! SMP bring-up and the panic path.

use ::core::sync::atomic::{AtomicU64, Ordering};

use super::io;
use crate::mm::phys_to_virt;

/// LAPIC MMIO base (default; the MADT can relocate it).
static LAPIC_BASE: AtomicU64 = AtomicU64::new(0xFEE0_0000);

const REG_ID: usize = 0x020;
const REG_EOI: usize = 0x0B0;
const REG_SPURIOUS: usize = 0x0F0;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;
const REG_LVT_TIMER: usize = 0x320;
const REG_TIMER_INIT: usize = 0x380;
const REG_TIMER_CURRENT: usize = 0x390;
const REG_TIMER_DIVIDE: usize = 0x3E0;

const SPURIOUS_ENABLE: u32 = 1 << 8;
const TIMER_PERIODIC: u32 = 1 << 17;
const TIMER_MASKED: u32 = 1 << 16;
const DIVIDE_BY_16: u32 = 0b0011;

const ICR_INIT: u32 = 0b101 << 8;
const ICR_STARTUP: u32 = 0b110 << 8;
const ICR_LEVEL_ASSERT: u32 = 1 << 14;
const ICR_DELIVERY_PENDING: u32 = 1 << 12;
const ICR_ALL_EXCLUDING_SELF: u32 = 0b11 << 18;

/// Record the LAPIC base reported by the MADT.
pub fn set_base(phys: u64) {
    LAPIC_BASE.store(phys & !0xFFF, Ordering::Relaxed);
}

fn reg(offset: usize) -> *mut u32 {
    let base = LAPIC_BASE.load(Ordering::Relaxed);
    phys_to_virt(base + offset as u64) as *mut u32
}

fn read(offset: usize) -> u32 {
    unsafe { ::core::ptr::read_volatile(reg(offset)) }
}

fn write(offset: usize, value: u32) {
    unsafe { ::core::ptr::write_volatile(reg(offset), value) }
}

/// This core's LAPIC ID.
pub fn id() -> u32 {
    read(REG_ID) >> 24
}

/// Software-enable the LAPIC with the spurious vector installed.
pub fn enable() {
    write(
        REG_SPURIOUS,
        SPURIOUS_ENABLE | super::interrupts::SPURIOUS_VECTOR as u32,
    );
}

/// Signal end-of-interrupt for the in-service vector.
#[inline]
pub fn eoi() {
    write(REG_EOI, 0);
}

fn wait_for_delivery() {
    while read(REG_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
        core::hint::spin_loop();
    }
}

/// Send an INIT IPI to the given LAPIC.
pub fn send_init(apic_id: u32) {
    write(REG_ICR_HIGH, apic_id << 24);
    write(REG_ICR_LOW, ICR_INIT | ICR_LEVEL_ASSERT);
    wait_for_delivery();
}

/// Send a startup IPI pointing at `vector * 0x1000`.
pub fn send_sipi(apic_id: u32, vector: u8) {
    write(REG_ICR_HIGH, apic_id << 24);
    write(REG_ICR_LOW, ICR_STARTUP | vector as u32);
    wait_for_delivery();
}

/// Send a fixed-delivery IPI to one core.
pub fn send_ipi(apic_id: u32, vector: u8) {
    write(REG_ICR_HIGH, apic_id << 24);
    write(REG_ICR_LOW, vector as u32);
    wait_for_delivery();
}

/// Send a fixed-delivery IPI to every core but this one.
pub fn broadcast_ipi(vector: u8) {
    write(REG_ICR_HIGH, 0);
    write(REG_ICR_LOW, ICR_ALL_EXCLUDING_SELF | vector as u32);
}

/// Measure the LAPIC timer tick rate against PIT channel 2.
///
/// Runs the timer at divide-by-16 over a 10 ms PIT gate and scales.
/// Returns ticks per second at that divider.
pub fn calibrate_timer() -> u64 {
    // Gate PIT channel 2 off, program 10ms one-shot
    const PIT_HZ: u64 = 1_193_182;
    let reload = (PIT_HZ / 100) as u16;

    let gate = io::inb(0x61);
    io::outb(0x61, (gate & !0x02) | 0x01);
    io::outb(0x43, 0xB0); // channel 2, lobyte/hibyte, mode 0
    io::outb(0x42, reload as u8);
    io::outb(0x42, (reload >> 8) as u8);

    write(REG_TIMER_DIVIDE, DIVIDE_BY_16);
    write(REG_LVT_TIMER, TIMER_MASKED);
    write(REG_TIMER_INIT, u32::MAX);

    // Wait for the PIT output to go high
    while io::inb(0x61) & 0x20 == 0 {
        core::hint::spin_loop();
    }

    let remaining = read(REG_TIMER_CURRENT);
    write(REG_TIMER_INIT, 0);
    io::outb(0x61, gate);

    let elapsed = (u32::MAX - remaining) as u64;
    elapsed * 100
}

/// Start the periodic scheduler timer at `hz` interrupts per second.
///
/// `ticks_per_second` is the value this core measured (or inherited
/// from the BSP) with `calibrate_timer`.
pub fn start_timer(ticks_per_second: u64, hz: u64) {
    let count = (ticks_per_second / hz).max(1) as u32;
    write(REG_TIMER_DIVIDE, DIVIDE_BY_16);
    write(
        REG_LVT_TIMER,
        TIMER_PERIODIC | super::interrupts::TIMER_VECTOR as u32,
    );
    write(REG_TIMER_INIT, count);
}
