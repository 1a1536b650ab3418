//! kestrel kernel entry point
//!
//! Boots under Limine (primary) or Multiboot2, brings up every usable
//! core, mounts the root filesystem from the first RAM device, and
//! execs `/init` as PID 1. Hosted test builds compile the same tree
//! with the privileged leaves stubbed, so the logic runs under the
//! standard harness.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]

extern crate alloc;

pub mod arch;
pub mod cmdline;
pub mod devices;
pub mod elf;
pub mod error;
pub mod frame_alloc;
pub mod fs;
pub mod heap;
pub mod ipc;
pub mod mac;
pub mod mm;
#[cfg(target_arch = "x86_64")]
pub mod multiboot2;
pub mod poll;
pub mod printk;
pub mod random;
pub mod sync;
pub mod syscall;
pub mod sysinfo;
pub mod task;
pub mod uaccess;

#[cfg(not(test))]
use ::core::panic::PanicInfo;

/// Kernel heap size, carved from the largest usable region.
#[cfg(not(test))]
const KERNEL_HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Conventional memory stays reserved for the SMP trampoline.
#[cfg(not(test))]
const LOW_MEMORY_LIMIT: u64 = 0x10_0000;

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: heap::Heap = heap::Heap::new();

// ---------------------------------------------------------------------------
// Limine boot protocol
// ---------------------------------------------------------------------------

#[cfg(not(test))]
mod limine_boot {
    use limine::request::{
        HhdmRequest, MemoryMapRequest, ModuleRequest, RequestsEndMarker, RequestsStartMarker,
        RsdpRequest,
    };
    use limine::BaseRevision;

    #[used]
    #[unsafe(link_section = ".requests")]
    pub static BASE_REVISION: BaseRevision = BaseRevision::new();

    #[used]
    #[unsafe(link_section = ".requests")]
    pub static HHDM: HhdmRequest = HhdmRequest::new();

    #[used]
    #[unsafe(link_section = ".requests")]
    pub static MEMORY_MAP: MemoryMapRequest = MemoryMapRequest::new();

    #[used]
    #[unsafe(link_section = ".requests")]
    pub static MODULES: ModuleRequest = ModuleRequest::new();

    #[used]
    #[unsafe(link_section = ".requests")]
    pub static RSDP: RsdpRequest = RsdpRequest::new();

    #[used]
    #[unsafe(link_section = ".requests_start_marker")]
    pub static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

    #[used]
    #[unsafe(link_section = ".requests_end_marker")]
    pub static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();
}

/// Limine entry point.
#[cfg(not(test))]
#[unsafe(no_mangle)]
unsafe extern "C" fn _start() -> ! {
    assert!(limine_boot::BASE_REVISION.is_supported());

    let hhdm_offset = limine_boot::HHDM
        .get_response()
        .map(|r| r.offset())
        .unwrap_or(0);
    mm::set_phys_offset(hhdm_offset);

    printkln!("kestrel kernel starting...");

    // Memory: carve the heap out of the largest usable entry, feed
    // the rest to the frame allocator.
    let mut heap_base = 0u64;
    let mut heap_len = 0u64;
    if let Some(map) = limine_boot::MEMORY_MAP.get_response() {
        for entry in map.entries() {
            if entry.entry_type != limine::memory_map::EntryType::USABLE {
                continue;
            }
            let (base, length) = clip_low(entry.base, entry.length);
            if length > heap_len {
                heap_base = base;
                heap_len = length;
            }
        }
        if heap_len as usize >= KERNEL_HEAP_SIZE {
            unsafe {
                ALLOCATOR.init(mm::phys_to_virt(heap_base) as usize, KERNEL_HEAP_SIZE);
            }
        }
        for entry in map.entries() {
            if entry.entry_type != limine::memory_map::EntryType::USABLE {
                continue;
            }
            let (mut base, mut length) = clip_low(entry.base, entry.length);
            if base == heap_base {
                base += KERNEL_HEAP_SIZE as u64;
                length = length.saturating_sub(KERNEL_HEAP_SIZE as u64);
            }
            if length > 0 {
                frame_alloc::add_region(base, length);
            }
        }
    }

    printk::attach_console();

    // RAM files become ramdev0..N
    if let Some(modules) = limine_boot::MODULES.get_response() {
        for (index, module) in modules.modules().iter().enumerate() {
            let virt = module.addr() as u64;
            let phys = virt.wrapping_sub(hhdm_offset);
            let _ = devices::register_ram_device(index, phys, module.size() as usize);
        }
    }

    let rsdp = limine_boot::RSDP.get_response().map(|r| {
        let addr = r.address() as u64;
        if addr >= hhdm_offset && hhdm_offset != 0 {
            addr - hhdm_offset
        } else {
            addr
        }
    });

    kmain(rsdp)
}

/// Multiboot2 entry point: `eax` magic already verified by the stub,
/// `rdi` carries the info pointer. The loader leaves physical memory
/// identity-mapped, so the physical window offset is zero.
#[cfg(all(target_arch = "x86_64", not(test)))]
#[unsafe(no_mangle)]
unsafe extern "C" fn _start_mb2(info_addr: u64) -> ! {
    mm::set_phys_offset(0);

    printkln!("kestrel kernel starting (multiboot2)...");

    // The heap has to exist before the tag list can be parsed into
    // owned structures, so the largest region is found without
    // allocating.
    let (heap_base, heap_len) = unsafe { multiboot2::largest_usable(info_addr) }
        .map(|(base, length)| clip_low(base, length))
        .unwrap_or((0, 0));
    if heap_len as usize >= KERNEL_HEAP_SIZE {
        unsafe {
            ALLOCATOR.init(mm::phys_to_virt(heap_base) as usize, KERNEL_HEAP_SIZE);
        }
    }

    let info = unsafe { multiboot2::parse(info_addr) };

    for region in &info.memory {
        let (mut base, mut length) = clip_low(region.base, region.length);
        if base == heap_base {
            base += KERNEL_HEAP_SIZE as u64;
            length = length.saturating_sub(KERNEL_HEAP_SIZE as u64);
        }
        if length > 0 {
            frame_alloc::add_region(base, length);
        }
    }

    printk::attach_console();

    if let Some(cmdline) = &info.cmdline {
        printkln!("cmdline: {}", cmdline);
        cmdline::parse(cmdline);
    }

    for (index, module) in info.modules.iter().enumerate() {
        let _ = devices::register_ram_device(
            index,
            module.start,
            (module.end - module.start) as usize,
        );
    }

    kmain(None)
}

/// Keep allocations out of conventional memory.
#[cfg(not(test))]
fn clip_low(base: u64, length: u64) -> (u64, u64) {
    if base >= LOW_MEMORY_LIMIT {
        (base, length)
    } else {
        let clipped = LOW_MEMORY_LIMIT.min(base + length);
        (LOW_MEMORY_LIMIT, length - (clipped - base))
    }
}

/// Common initialization once memory and the console are up.
#[cfg(all(target_arch = "x86_64", not(test)))]
fn kmain(rsdp: Option<u64>) -> ! {
    use arch::x86_64::{acpi, cpu, interrupts, lapic, percpu, smp, syscall as arch_syscall};

    arch::paging::capture_kernel_root();
    random::seed(cpu::rdtsc());

    interrupts::init_idt();
    interrupts::load_idt();

    // MADT scan decides how many core-local slots exist
    let acpi_info = rsdp.and_then(acpi::scan_madt);
    let cpu_count = acpi_info.as_ref().map(|i| i.cpus.len().max(1)).unwrap_or(1);
    if let Some(info) = &acpi_info {
        lapic::set_base(info.lapic_addr);
    }
    printkln!("{} usable CPU(s) reported", cpu_count);

    percpu::allocate(cpu_count.min(task::sched::MAX_CORES));

    let stack_top: u64;
    unsafe {
        ::core::arch::asm!("mov {}, rsp", out(reg) stack_top);
    }
    let block = percpu::init_current(0, lapic::id(), stack_top);

    arch_syscall::init();
    lapic::enable();
    block.timer_hz = lapic::calibrate_timer();
    printkln!("LAPIC timer at {} Hz", block.timer_hz);

    task::sched::init();
    task::proc::init();
    let _ = devices::register(
        alloc::string::String::from("console"),
        alloc::sync::Arc::new(devices::ConsoleDevice),
    );

    // Secondary cores
    if let Some(info) = &acpi_info {
        let online = smp::start_secondary_cores(&info.cpus, arch::paging::kernel_root());
        printkln!("{} core(s) online", online);
    }

    // Root filesystem from the first RAM device
    let root_device = cmdline::get("root").unwrap_or(alloc::string::String::from("ramdev0"));
    match fs::mount::mount(&root_device, "/", None) {
        Ok(_) => printkln!("root mounted from {}", root_device),
        Err(e) => printkln!("no root filesystem ({:?})", e),
    }

    spawn_init();

    lapic::start_timer(block.timer_hz, task::sched::TICK_HZ);
    smp::release_cores();
    task::sched::idle_core()
}

#[cfg(all(target_arch = "riscv64", not(test)))]
fn kmain(_rsdp: Option<u64>) -> ! {
    arch::paging::capture_kernel_root();
    random::seed(arch::riscv64::read_time());

    arch::percpu::allocate(1);
    let stack_top: u64;
    unsafe {
        ::core::arch::asm!("mv {}, sp", out(reg) stack_top);
    }
    arch::percpu::init_current(0, 0, stack_top);
    arch::riscv64::init_traps();

    task::sched::init();
    task::proc::init();

    let root_device = cmdline::get("root").unwrap_or(alloc::string::String::from("ramdev0"));
    match fs::mount::mount(&root_device, "/", None) {
        Ok(_) => printkln!("root mounted from {}", root_device),
        Err(e) => printkln!("no root filesystem ({:?})", e),
    }

    spawn_init();

    arch::riscv64::schedule_tick(task::sched::TICK_HZ);
    task::sched::idle_core()
}

/// Create PID 1 and exec the init program into it.
#[cfg(not(test))]
fn spawn_init() {
    use alloc::string::String;
    use alloc::sync::Arc;

    let init_path = cmdline::get("init").unwrap_or(String::from("/init"));

    let record = task::proc::Process::fresh(1, 0, Arc::new(mm::AddressSpace::kernel()));
    if task::proc::with_procs(|procs| procs.insert(record)).is_err() {
        printkln!("init process slot unavailable");
        return;
    }

    match task::exec::exec_process(1, &init_path, alloc::vec![init_path.clone()], alloc::vec![]) {
        Ok(tid) => printkln!("init started: {} (tid {})", init_path, tid),
        Err(e) => {
            task::proc::with_procs(|procs| procs.remove(1));
            printkln!("failed to start {}: {:?}", init_path, e);
        }
    }
}

/// Fatal-path panic: park the other cores, beep, one diagnostic
/// line, halt.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    arch::disable_interrupts();
    printk::set_oops_in_progress();

    #[cfg(target_arch = "x86_64")]
    arch::x86_64::lapic::broadcast_ipi(arch::x86_64::interrupts::PANIC_VECTOR);

    arch::panic_beep();

    if let Some(location) = info.location() {
        printkln!(
            "kernel panic at {}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        );
    } else {
        printkln!("kernel panic: {}", info.message());
    }

    arch::halt_forever()
}

#[cfg(test)]
fn main() {}
