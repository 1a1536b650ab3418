//! Process and system syscalls

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::context::TrapFrame;
use crate::error::{Errno, KResult};
use crate::mac::{Capabilities, Enforcement, Permissions};
use crate::sysinfo;
use crate::task::{Pid, Tid};
use crate::uaccess;

use super::proc;
use super::sched;

/// clone flag: new thread in the calling process.
pub const CLONE_THREAD: u64 = 1 << 0;
/// clone flag: attribute the child to the caller's parent.
pub const CLONE_PARENT: u64 = 1 << 1;

/// wait option: don't block.
pub const WNOHANG: u64 = 1 << 0;
/// Status word bit: the child exited normally.
pub const STATUS_EXITED: u32 = 0x100;

pub const REBOOT_HALT: u64 = 1;
pub const REBOOT_POWEROFF: u64 = 2;
pub const REBOOT_RESTART: u64 = 3;
/// reboot flag: report failure instead of panicking.
pub const REBOOT_ERROR_RET: u64 = 1 << 0;

/// exit(status). Never returns.
pub fn sys_exit(status: u64) -> ! {
    exit_with(proc::current_pid(), (status & 0xFF) as u32)
}

/// Terminate a process: threads die, descriptors close, the zombie
/// waits for its parent. Never returns when `pid` is the caller.
pub fn exit_with(pid: Pid, code: u32) -> ! {
    let tids = proc::with_procs(|procs| procs.mark_exited(pid, code));
    let current = proc::current_tid();
    for tid in tids {
        if tid != current {
            let _ = sched::delete_thread(tid);
        }
    }
    sched::bail()
}

/// A ring-3 CPU exception lands here: the process dies, the system
/// keeps going.
pub fn fatal_exception(_frame: &TrapFrame) -> ! {
    exit_with(proc::current_pid(), 0xFF)
}

/// yield: reschedule immediately.
pub fn sys_yield() -> KResult<u64> {
    sched::yield_now();
    Ok(0)
}

/// clone(flags): fork-like without CLONE_THREAD, thread creation
/// with it. The caller's saved frame becomes the child's initial
/// register image, with the return-value register zeroed.
pub fn sys_clone(flags: u64, frame: &TrapFrame) -> KResult<u64> {
    let pid = proc::current_pid();

    let allowed = proc::with_process(pid, |p| p.mac.has_capability(Capabilities::SPAWN))?;
    if !allowed {
        return Err(crate::syscall::mac_violation(pid, "clone"));
    }

    let mut child_frame = *frame;
    zero_return_registers(&mut child_frame);

    let cluster = sched::with_sched(|s| {
        s.threads
            .get(proc::current_tid())
            .map(|t| t.cluster)
            .unwrap_or(1)
    });
    let tcb = current_tcb();

    if flags & CLONE_THREAD != 0 {
        let root = proc::with_process(pid, |p| p.space.root())?;
        let tid = sched::create_user_thread(pid, root, child_frame, cluster, tcb);
        if tid == 0 {
            return Err(Errno::NoMemory);
        }
        proc::with_process(pid, |p| p.threads.push(tid))?;
        return Ok(tid as u64);
    }

    // Fork: new process, eagerly copied user half
    let parent_for_child = if flags & CLONE_PARENT != 0 {
        proc::with_process(pid, |p| p.parent)?
    } else {
        pid
    };

    let parent_space = proc::current_space(pid)?;
    let child_space = Arc::new(parent_space.fork().ok_or(Errno::NoMemory)?);

    let child_pid = proc::with_procs(|procs| -> KResult<Pid> {
        let child_pid = procs.allocate_pid();
        if child_pid == 0 {
            return Err(Errno::NoMemory);
        }
        let parent = procs.get(pid).ok_or(Errno::NoEntity)?;
        let record = parent.clone_for_fork(child_pid, parent_for_child, child_space.clone());
        procs.insert(record)?;
        Ok(child_pid)
    })?;

    let tid = sched::create_user_thread(child_pid, child_space.root(), child_frame, cluster, tcb);
    if tid == 0 {
        proc::with_procs(|procs| procs.remove(child_pid));
        return Err(Errno::NoMemory);
    }
    proc::with_process(child_pid, |p| p.threads.push(tid))?;

    Ok(child_pid as u64)
}

fn zero_return_registers(frame: &mut TrapFrame) {
    #[cfg(target_arch = "x86_64")]
    {
        frame.rax = 0;
        frame.rdx = 0;
    }
    #[cfg(target_arch = "riscv64")]
    {
        frame.regs[9] = 0;
        frame.regs[10] = 0;
    }
}

fn current_tcb() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        crate::arch::x86_64::msr::fs_base()
    }
    #[cfg(target_arch = "riscv64")]
    {
        0
    }
}

/// exec(path, argv, envp): argv and envp are NUL-terminated pointer
/// arrays. Replaces the process image; only returns on failure.
pub fn sys_exec(path_addr: u64, argv_addr: u64, envp_addr: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;

    let path = {
        let raw = uaccess::read_user_string(&space, path_addr, crate::fs::path::PATH_MAX + 1)?;
        if raw.len() > crate::fs::path::PATH_MAX {
            return Err(Errno::StringTooLong);
        }
        let cwd = proc::with_process(pid, |p| p.cwd.clone())?;
        crate::fs::path::compound_path(&cwd, &raw, crate::fs::path::PATH_MAX)
            .ok_or(Errno::StringTooLong)?
    };

    let argv = read_string_array(&space, argv_addr)?;
    let envp = read_string_array(&space, envp_addr)?;

    super::exec::exec_process(pid, &path, argv, envp)?;

    // The process has a new image; this thread is no longer part of
    // it.
    sched::bail()
}

/// Read a NUL-terminated array of string pointers.
fn read_string_array(space: &crate::mm::AddressSpace, addr: u64) -> KResult<Vec<String>> {
    const MAX_ENTRIES: usize = 64;

    let mut out = Vec::new();
    if addr == 0 {
        return Ok(out);
    }
    for i in 0..MAX_ENTRIES as u64 {
        let ptr = uaccess::read_user_u64(space, addr + i * 8)?;
        if ptr == 0 {
            return Ok(out);
        }
        out.push(uaccess::read_user_string(
            space,
            ptr,
            crate::fs::path::PATH_MAX,
        )?);
    }
    Err(Errno::StringTooLong)
}

/// wait(pid, status, options).
///
/// Blocks until the named child (or any, for -1) exits. WNOHANG
/// returns 0 when children exist but none has exited. Waiting on a
/// process group (pid 0 or < -1) is unsupported.
pub fn sys_wait(target: i64, status_addr: u64, options: u64) -> KResult<u64> {
    if target == 0 || target < -1 {
        return Err(Errno::InvalidValue);
    }
    let pid = proc::current_pid();

    loop {
        let reaped = proc::with_procs(|procs| procs.try_reap(pid, target))?;
        match reaped {
            Some((child, code)) => {
                if status_addr != 0 {
                    let space = proc::current_space(pid)?;
                    let status = STATUS_EXITED | (code & 0xFF);
                    uaccess::copy_to_user(&space, status_addr, &status.to_ne_bytes())?;
                }
                return Ok(child as u64);
            }
            None if options & WNOHANG != 0 => return Ok(0),
            None => sched::yield_now(),
        }
    }
}

pub fn sys_getpid() -> KResult<u64> {
    Ok(proc::current_pid() as u64)
}

pub fn sys_getppid() -> KResult<u64> {
    let pid = proc::current_pid();
    proc::with_process(pid, |p| p.parent as u64)
}

pub fn sys_gettid() -> KResult<u64> {
    Ok(proc::current_tid() as u64)
}

/// Scheduler control: install a deadline reservation.
pub fn sys_set_deadlines(tid: u64, runtime: u64, period: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let allowed = proc::with_process(pid, |p| p.mac.has_capability(Capabilities::SCHED))?;
    if !allowed {
        return Err(crate::syscall::mac_violation(pid, "set_deadlines"));
    }
    sched::set_deadlines(tid as Tid, runtime, period)?;
    Ok(0)
}

/// Scheduler control: pin a thread to the calling core.
pub fn sys_set_mono_thread(tid: u64, pinned: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let allowed = proc::with_process(pid, |p| p.mac.has_capability(Capabilities::SCHED))?;
    if !allowed {
        return Err(crate::syscall::mac_violation(pid, "set_mono_thread"));
    }
    let core = current_core_number();
    sched::set_mono_thread(tid as Tid, pinned != 0, core)?;
    Ok(0)
}

/// Scheduler control: remove a thread outright.
pub fn sys_delete_thread(tid: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let allowed = proc::with_process(pid, |p| p.mac.has_capability(Capabilities::SCHED))?;
    if !allowed {
        return Err(crate::syscall::mac_violation(pid, "delete_thread"));
    }
    sched::delete_thread(tid as Tid)?;
    proc::with_process(pid, |p| p.threads.retain(|&t| t != tid as Tid))?;
    Ok(0)
}

/// exit_thread: retire the calling thread only. Never returns.
pub fn sys_exit_thread() -> ! {
    let pid = proc::current_pid();
    let tid = proc::current_tid();
    let _ = proc::with_process(pid, |p| p.threads.retain(|&t| t != tid));
    sched::bail()
}

fn current_core_number() -> u32 {
    #[cfg(not(test))]
    {
        crate::arch::percpu::current_core().core_number
    }
    #[cfg(test)]
    {
        0
    }
}

/// prctl: architecture-specific thread state. On x86_64, codes 1-4
/// set/get the FS and GS bases.
pub fn sys_prctl(code: u64, argument: u64) -> KResult<u64> {
    #[cfg(target_arch = "x86_64")]
    {
        use crate::arch::x86_64::msr;

        let pid = proc::current_pid();
        let space = proc::current_space(pid)?;
        match code {
            1 => {
                // Set FS base, in the thread record too so the value
                // survives context switches
                if argument >= crate::mm::USER_SPACE_END {
                    return Err(Errno::InvalidValue);
                }
                let tid = proc::current_tid();
                sched::with_sched(|s| {
                    if let Some(thread) = s.threads.get_mut(tid) {
                        thread.tcb = argument;
                    }
                });
                msr::set_fs_base(argument);
                Ok(0)
            }
            2 => {
                // Get FS base into *argument
                uaccess::write_user_u64(&space, argument, msr::fs_base())?;
                Ok(0)
            }
            3 => {
                // Set GS base (the user-visible one)
                if argument >= crate::mm::USER_SPACE_END {
                    return Err(Errno::InvalidValue);
                }
                msr::set_kernel_gs_base(argument);
                Ok(0)
            }
            4 => {
                uaccess::write_user_u64(&space, argument, msr::kernel_gs_base())?;
                Ok(0)
            }
            _ => Err(Errno::InvalidValue),
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (code, argument);
        Err(Errno::NotImplemented)
    }
}

/// reboot(command, flags): SYS_PWR gated. On a failed action, either
/// panic or hand the reason back per ERROR_RET.
pub fn sys_reboot(command: u64, flags: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let allowed = proc::with_process(pid, |p| p.mac.has_capability(Capabilities::SYS_PWR))?;
    if !allowed {
        return Err(crate::syscall::mac_violation(pid, "reboot"));
    }

    let result = match command {
        REBOOT_HALT => {
            crate::printkln!("system halted");
            crate::arch::halt_forever();
        }
        REBOOT_RESTART => platform_restart(),
        REBOOT_POWEROFF => platform_poweroff(),
        _ => Err(Errno::InvalidValue),
    };

    match result {
        Err(e) if flags & REBOOT_ERROR_RET != 0 => Err(e),
        Err(e) => panic!("reboot failed: {:?}", e),
        Ok(v) => Ok(v),
    }
}

fn platform_restart() -> KResult<u64> {
    #[cfg(target_arch = "x86_64")]
    {
        // Keyboard-controller pulse; if the CPU comes back the
        // platform did not honor it.
        crate::arch::x86_64::io::outb(0x64, 0xFE);
        crate::arch::x86_64::smp::delay_ms(50);
        Err(Errno::Io)
    }
    #[cfg(target_arch = "riscv64")]
    {
        Err(Errno::NotImplemented)
    }
}

fn platform_poweroff() -> KResult<u64> {
    #[cfg(target_arch = "x86_64")]
    {
        // QEMU/Bochs ACPI PM1a; real boards need an ACPI interpreter
        // this kernel does not carry.
        crate::arch::x86_64::io::outw(0x604, 0x2000);
        crate::arch::x86_64::smp::delay_ms(50);
        Err(Errno::Io)
    }
    #[cfg(target_arch = "riscv64")]
    {
        Err(Errno::NotImplemented)
    }
}

/// set_hostname(name, len): SYS_NET gated.
pub fn sys_set_hostname(addr: u64, len: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let allowed = proc::with_process(pid, |p| p.mac.has_capability(Capabilities::SYS_NET))?;
    if !allowed {
        return Err(crate::syscall::mac_violation(pid, "set_hostname"));
    }

    if len as usize > sysinfo::HOST_NAME_MAX {
        return Err(Errno::StringTooLong);
    }
    let space = proc::current_space(pid)?;
    let mut raw = alloc::vec![0u8; len as usize];
    uaccess::copy_from_user(&space, addr, &mut raw)?;
    let name = core::str::from_utf8(&raw).map_err(|_| Errno::InvalidValue)?;
    if !sysinfo::set_hostname(name) {
        return Err(Errno::StringTooLong);
    }
    Ok(0)
}

/// getrandom(buf, len): ENTROPY gated; hands out at most 256 bytes
/// per call.
pub fn sys_getrandom(addr: u64, len: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let allowed = proc::with_process(pid, |p| p.mac.has_capability(Capabilities::ENTROPY))?;
    if !allowed {
        return Err(crate::syscall::mac_violation(pid, "getrandom"));
    }

    let n = (len as usize).min(256);
    let mut bytes = alloc::vec![0u8; n];
    crate::random::fill(&mut bytes);
    let space = proc::current_space(pid)?;
    uaccess::copy_to_user(&space, addr, &bytes)?;
    Ok(n as u64)
}

/// sysconf(request, addr, len): scalar answers return directly;
/// list requests fill the caller's buffer and return the row count.
pub fn sys_sysconf(request: u64, addr: u64, len: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    match request {
        sysinfo::SC_PAGESIZE => Ok(crate::mm::PAGE_SIZE),
        sysinfo::SC_OPEN_MAX => proc::with_process(pid, |p| p.fds.limit() as u64),
        sysinfo::SC_HOST_NAME_MAX => Ok(sysinfo::HOST_NAME_MAX as u64),
        sysinfo::SC_PHYS_PAGES => Ok(crate::frame_alloc::stats().total_frames as u64),
        sysinfo::SC_NPROC_ONLN => Ok(online_core_count()),
        sysinfo::SC_UNAME => {
            let uts = sysinfo::uname();
            let bytes = unsafe {
                ::core::slice::from_raw_parts(
                    &uts as *const sysinfo::UtsName as *const u8,
                    ::core::mem::size_of::<sysinfo::UtsName>(),
                )
            };
            if (bytes.len() as u64) > len {
                return Err(Errno::NotBigEnough);
            }
            let space = proc::current_space(pid)?;
            uaccess::copy_to_user(&space, addr, bytes)?;
            Ok(bytes.len() as u64)
        }
        sysinfo::SC_LIST_PROCS => {
            let rows: Vec<sysinfo::ProcListEntry> = proc::with_procs(|procs| {
                procs
                    .iter()
                    .map(|p| {
                        sysinfo::ProcListEntry::new(
                            p.pid,
                            p.parent,
                            p.effective_uid,
                            p.has_exited,
                            &p.identifier,
                        )
                    })
                    .collect()
            });
            write_rows(pid, addr, len, &rows)
        }
        sysinfo::SC_LIST_MOUNTS => {
            let rows: Vec<sysinfo::MountListEntry> = crate::fs::mount::list()
                .into_iter()
                .map(|(device, kind, path)| {
                    sysinfo::MountListEntry::new(kind as u32, &device, &path)
                })
                .collect();
            write_rows(pid, addr, len, &rows)
        }
        _ => Err(Errno::InvalidValue),
    }
}

fn online_core_count() -> u64 {
    #[cfg(not(test))]
    {
        crate::arch::percpu::online_cores() as u64
    }
    #[cfg(test)]
    {
        1
    }
}

fn write_rows<T: Copy>(pid: Pid, addr: u64, len: u64, rows: &[T]) -> KResult<u64> {
    let row = ::core::mem::size_of::<T>();
    let fits = (len as usize / row).min(rows.len());
    let space = proc::current_space(pid)?;
    for (i, entry) in rows[..fits].iter().enumerate() {
        let bytes =
            unsafe { ::core::slice::from_raw_parts(entry as *const T as *const u8, row) };
        uaccess::copy_to_user(&space, addr + (i * row) as u64, bytes)?;
    }
    Ok(fits as u64)
}

/// set_mac_capabilities(bits): transitions are clear-only, so no
/// gate is needed; a process can only weaken itself.
pub fn sys_set_mac_capabilities(bits: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let wanted = Capabilities::from_bits_truncate(bits as u32);
    proc::with_process(pid, |p| p.mac.restrict_capabilities(wanted))?;
    Ok(0)
}

/// add_mac_permissions(path, bits): grants rights, so SYS_MAC gated.
pub fn sys_add_mac_permissions(path_addr: u64, bits: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let allowed = proc::with_process(pid, |p| p.mac.has_capability(Capabilities::SYS_MAC))?;
    if !allowed {
        return Err(crate::syscall::mac_violation(pid, "add_mac_permissions"));
    }

    let space = proc::current_space(pid)?;
    let path = uaccess::read_user_string(&space, path_addr, crate::fs::path::PATH_MAX)?;
    if !crate::fs::path::is_canonical(&path) {
        return Err(Errno::InvalidValue);
    }
    let rights = Permissions::from_bits_truncate(bits as u32);
    let added = proc::with_process(pid, |p| p.mac.add_permission(path, rights))?;
    if !added {
        return Err(Errno::NoMemory);
    }
    Ok(0)
}

/// set_mac_enforcement(mode): 0 deny, 1 deny-and-scream, 2 kill.
pub fn sys_set_mac_enforcement(mode: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let allowed = proc::with_process(pid, |p| p.mac.has_capability(Capabilities::SYS_MAC))?;
    if !allowed {
        return Err(crate::syscall::mac_violation(pid, "set_mac_enforcement"));
    }

    let action = match mode {
        0 => Enforcement::Deny,
        1 => Enforcement::DenyAndScream,
        2 => Enforcement::Kill,
        _ => return Err(Errno::InvalidValue),
    };
    proc::with_process(pid, |p| p.mac.enforcement = action)?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_group_waits_are_unsupported() {
        assert_eq!(sys_wait(0, 0, 0), Err(Errno::InvalidValue));
        assert_eq!(sys_wait(-2, 0, 0), Err(Errno::InvalidValue));
    }
}
