//! Syscall dispatch
//!
//! The arch entry stub hands a full register frame to
//! `syscall_dispatch`; the number and arguments are pulled from the
//! frame per the ABI, the matching body runs, and the `(value, errno)`
//! pair is written back into the return registers. All-ones in the
//! value register marks failure.
//!
//! The MAC enforcement hook and the tracer-FIFO frame dump live here
//! so every syscall path shares them.

use crate::arch::context::TrapFrame;
use crate::error::{sysret, Errno, KResult};
use crate::mac::Enforcement;
use crate::task::proc;
use crate::task::{syscall as task_sys, Pid};
use crate::{fs, ipc, mm, poll};

pub const SYS_EXIT: u64 = 0;
pub const SYS_YIELD: u64 = 1;
pub const SYS_OPEN: u64 = 2;
pub const SYS_CLOSE: u64 = 3;
pub const SYS_READ: u64 = 4;
pub const SYS_WRITE: u64 = 5;
pub const SYS_PREAD: u64 = 6;
pub const SYS_PWRITE: u64 = 7;
pub const SYS_SEEK: u64 = 8;
pub const SYS_MMAP: u64 = 9;
pub const SYS_MUNMAP: u64 = 10;
pub const SYS_MPROTECT: u64 = 11;
pub const SYS_CLONE: u64 = 12;
pub const SYS_EXEC: u64 = 13;
pub const SYS_WAIT: u64 = 14;
pub const SYS_PIPE: u64 = 15;
pub const SYS_SOCKET: u64 = 16;
pub const SYS_BIND: u64 = 17;
pub const SYS_CONNECT: u64 = 18;
pub const SYS_LISTEN: u64 = 19;
pub const SYS_ACCEPT: u64 = 20;
pub const SYS_STAT: u64 = 21;
pub const SYS_FSTAT: u64 = 22;
pub const SYS_TRUNCATE: u64 = 23;
pub const SYS_UNLINK: u64 = 24;
pub const SYS_RENAME: u64 = 25;
pub const SYS_LINK: u64 = 26;
pub const SYS_SYMLINK: u64 = 27;
pub const SYS_READLINK: u64 = 28;
pub const SYS_MKNOD: u64 = 29;
pub const SYS_CHDIR: u64 = 30;
pub const SYS_GETCWD: u64 = 31;
pub const SYS_IOCTL: u64 = 32;
pub const SYS_GETDENTS: u64 = 33;
pub const SYS_POLL: u64 = 34;
pub const SYS_SYSCONF: u64 = 35;
pub const SYS_MOUNT: u64 = 36;
pub const SYS_UMOUNT: u64 = 37;
pub const SYS_PRCTL: u64 = 38;
pub const SYS_REBOOT: u64 = 39;
pub const SYS_SET_MAC_CAPABILITIES: u64 = 40;
pub const SYS_ADD_MAC_PERMISSIONS: u64 = 41;
pub const SYS_SET_MAC_ENFORCEMENT: u64 = 42;
pub const SYS_DUP: u64 = 43;
pub const SYS_GETPID: u64 = 44;
pub const SYS_GETPPID: u64 = 45;
pub const SYS_GETTID: u64 = 46;
pub const SYS_SET_HOSTNAME: u64 = 47;
pub const SYS_GETRANDOM: u64 = 48;
pub const SYS_SYNC: u64 = 49;
pub const SYS_FSYNC: u64 = 50;
pub const SYS_FCNTL: u64 = 51;
pub const SYS_SET_DEADLINES: u64 = 52;
pub const SYS_SET_MONO_THREAD: u64 = 53;
pub const SYS_DELETE_THREAD: u64 = 54;
pub const SYS_EXIT_THREAD: u64 = 55;
pub const SYS_TRACE: u64 = 56;

/// Apply the caller's MAC enforcement to a failed check. Returns the
/// errno for the Deny modes; the Kill mode does not return.
pub fn mac_violation(pid: Pid, name: &str) -> Errno {
    let action = proc::with_process(pid, |p| p.mac.enforcement).unwrap_or(Enforcement::Deny);
    match action {
        Enforcement::Deny => Errno::BadAccess,
        Enforcement::DenyAndScream => {
            crate::printkln!("PID {} MAC failure {}", pid, name);
            Errno::BadAccess
        }
        Enforcement::Kill => task_sys::exit_with(pid, 42),
    }
}

/// Dump a register frame to the tracer FIFO and wait for the tracer
/// to drain it.
fn trace_hook(pid: Pid, frame: &TrapFrame) {
    let Ok(Some(fd)) = proc::with_process(pid, |p| p.tracer_fd) else {
        return;
    };
    let Ok(Ok(description)) = proc::with_process(pid, |p| p.fds.get(fd)) else {
        return;
    };
    if let fs::fd::Description::FifoWriter(fifo) = &*description {
        let bytes = unsafe {
            ::core::slice::from_raw_parts(
                frame as *const TrapFrame as *const u8,
                ::core::mem::size_of::<TrapFrame>(),
            )
        };
        let _ = fifo.write(bytes);
        while fifo.buffered() > 0 {
            crate::task::sched::yield_now();
        }
    }
}

/// trace(pid, fd, enable): aim a process's syscall frames at a
/// writer FIFO held by the caller.
fn sys_trace(target: u64, fd: u64, enable: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let allowed =
        proc::with_process(pid, |p| p.mac.has_capability(crate::mac::Capabilities::PTRACE))?;
    if !allowed {
        return Err(mac_violation(pid, "trace"));
    }

    proc::with_process(target as Pid, |p| {
        p.tracer_fd = if enable != 0 { Some(fd as usize) } else { None };
    })?;
    Ok(0)
}

fn dispatch(num: u64, args: [u64; 6], frame: &TrapFrame) -> (u64, u64) {
    let pid = proc::current_pid();
    trace_hook(pid, frame);

    let result: KResult<u64> = match num {
        SYS_EXIT => task_sys::sys_exit(args[0]),
        SYS_YIELD => task_sys::sys_yield(),
        SYS_OPEN => fs::syscall::sys_open(args[0] as i64, args[1], args[2]),
        SYS_CLOSE => fs::syscall::sys_close(args[0]),
        SYS_READ => fs::syscall::sys_read(args[0], args[1], args[2]),
        SYS_WRITE => fs::syscall::sys_write(args[0], args[1], args[2]),
        SYS_PREAD => fs::syscall::sys_pread(args[0], args[1], args[2], args[3]),
        SYS_PWRITE => fs::syscall::sys_pwrite(args[0], args[1], args[2], args[3]),
        SYS_SEEK => fs::syscall::sys_seek(args[0], args[1] as i64, args[2]),
        SYS_MMAP => mm::syscall::sys_mmap(
            args[0],
            args[1],
            args[2],
            args[3],
            args[4] as i64,
            args[5],
        ),
        SYS_MUNMAP => mm::syscall::sys_munmap(args[0], args[1]),
        SYS_MPROTECT => mm::syscall::sys_mprotect(args[0], args[1], args[2]),
        SYS_CLONE => task_sys::sys_clone(args[0], frame),
        SYS_EXEC => task_sys::sys_exec(args[0], args[1], args[2]),
        SYS_WAIT => task_sys::sys_wait(args[0] as i64, args[1], args[2]),
        SYS_PIPE => ipc::syscall::sys_pipe(args[0], args[1]),
        SYS_SOCKET => ipc::syscall::sys_socket(args[0], args[1], args[2]),
        SYS_BIND => ipc::syscall::sys_bind(args[0], args[1], args[2]),
        SYS_CONNECT => ipc::syscall::sys_connect(args[0], args[1], args[2]),
        SYS_LISTEN => ipc::syscall::sys_listen(args[0], args[1]),
        SYS_ACCEPT => ipc::syscall::sys_accept(args[0]),
        SYS_STAT => fs::syscall::sys_stat(args[0], args[1]),
        SYS_FSTAT => fs::syscall::sys_fstat(args[0], args[1]),
        SYS_TRUNCATE => fs::syscall::sys_truncate(args[0], args[1]),
        SYS_UNLINK => fs::syscall::sys_unlink(args[0]),
        SYS_RENAME => fs::syscall::sys_rename(args[0], args[1]),
        SYS_LINK => fs::syscall::sys_link(args[0], args[1]),
        SYS_SYMLINK => fs::syscall::sys_symlink(args[0], args[1]),
        SYS_READLINK => fs::syscall::sys_readlink(args[0], args[1], args[2]),
        SYS_MKNOD => fs::syscall::sys_mknod(args[0], args[1]),
        SYS_CHDIR => fs::syscall::sys_chdir(args[0]),
        SYS_GETCWD => fs::syscall::sys_getcwd(args[0], args[1]),
        SYS_IOCTL => fs::syscall::sys_ioctl(args[0], args[1], args[2]),
        SYS_GETDENTS => fs::syscall::sys_getdents(args[0], args[1], args[2]),
        SYS_POLL => poll::sys_poll(args[0], args[1], args[2] as i64),
        SYS_SYSCONF => task_sys::sys_sysconf(args[0], args[1], args[2]),
        SYS_MOUNT => fs::syscall::sys_mount(args[0], args[1], args[2], args[3]),
        SYS_UMOUNT => fs::syscall::sys_umount(args[0], args[1]),
        SYS_PRCTL => task_sys::sys_prctl(args[0], args[1]),
        SYS_REBOOT => task_sys::sys_reboot(args[0], args[1]),
        SYS_SET_MAC_CAPABILITIES => task_sys::sys_set_mac_capabilities(args[0]),
        SYS_ADD_MAC_PERMISSIONS => task_sys::sys_add_mac_permissions(args[0], args[1]),
        SYS_SET_MAC_ENFORCEMENT => task_sys::sys_set_mac_enforcement(args[0]),
        SYS_DUP => fs::syscall::sys_dup(args[0]),
        SYS_GETPID => task_sys::sys_getpid(),
        SYS_GETPPID => task_sys::sys_getppid(),
        SYS_GETTID => task_sys::sys_gettid(),
        SYS_SET_HOSTNAME => task_sys::sys_set_hostname(args[0], args[1]),
        SYS_GETRANDOM => task_sys::sys_getrandom(args[0], args[1]),
        SYS_SYNC => fs::syscall::sys_sync(),
        SYS_FSYNC => fs::syscall::sys_fsync(args[0]),
        SYS_FCNTL => fs::syscall::sys_fcntl(args[0], args[1], args[2]),
        SYS_SET_DEADLINES => task_sys::sys_set_deadlines(args[0], args[1], args[2]),
        SYS_SET_MONO_THREAD => task_sys::sys_set_mono_thread(args[0], args[1]),
        SYS_DELETE_THREAD => task_sys::sys_delete_thread(args[0]),
        SYS_EXIT_THREAD => task_sys::sys_exit_thread(),
        SYS_TRACE => sys_trace(args[0], args[1], args[2]),
        _ => Err(Errno::NotImplemented),
    };

    sysret(result)
}

/// Entry point the x86_64 syscall stub calls with the saved frame.
///
/// The entry mask cleared IF; syscall bodies may block, so the flag
/// comes back on for the duration and off again before the register
/// restore sequence (which must not be interrupted once the user
/// stack pointer is live).
#[cfg(target_arch = "x86_64")]
pub extern "C" fn syscall_dispatch(frame: &mut TrapFrame) {
    let num = frame.rax;
    let args = [
        frame.rdi, frame.rsi, frame.rdx, frame.r10, frame.r8, frame.r9,
    ];

    crate::arch::enable_interrupts();
    let (value, errno) = dispatch(num, args, frame);
    trace_hook(proc::current_pid(), frame);
    crate::arch::disable_interrupts();

    frame.rax = value;
    frame.rdx = errno;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::AddressSpace;
    use crate::task::proc::{with_procs, Process};
    use alloc::sync::Arc;

    #[test]
    fn deny_modes_fail_the_call_and_spare_the_process() {
        let pid = with_procs(|procs| {
            let pid = procs.allocate_pid();
            procs
                .insert(Process::fresh(pid, 0, Arc::new(AddressSpace::kernel())))
                .unwrap();
            pid
        });

        assert_eq!(mac_violation(pid, "set_hostname"), Errno::BadAccess);

        let _ = proc::with_process(pid, |p| {
            p.mac.enforcement = Enforcement::DenyAndScream;
        });
        // Scream mode logs and still only fails the call
        assert_eq!(mac_violation(pid, "set_hostname"), Errno::BadAccess);

        // The process is alive afterwards
        assert!(with_procs(|procs| procs.get(pid).is_some()));
        with_procs(|procs| procs.remove(pid));
    }
}

/// riscv64 flavor: number in a7, arguments in a0-a5, results in
/// a0/a1.
#[cfg(target_arch = "riscv64")]
pub extern "C" fn syscall_dispatch(frame: &mut TrapFrame) {
    let num = frame.regs[16]; // a7
    let args = [
        frame.regs[9],
        frame.regs[10],
        frame.regs[11],
        frame.regs[12],
        frame.regs[13],
        frame.regs[14],
    ];

    crate::arch::enable_interrupts();
    let (value, errno) = dispatch(num, args, frame);
    trace_hook(proc::current_pid(), frame);
    crate::arch::disable_interrupts();

    frame.regs[9] = value;
    frame.regs[10] = errno;
}
