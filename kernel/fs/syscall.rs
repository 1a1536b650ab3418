//! Filesystem syscalls
//!
//! Every body follows the same shape: pull arguments across the user
//! boundary (pointers validated against the caller's page table),
//! consult the MAC permission list, dispatch to the device layer or
//! the mounted driver, translate the typed status, install or update
//! descriptors.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use ::core::sync::atomic::AtomicU64;

use crate::devices;
use crate::error::{Errno, KResult};
use crate::mac::{Capabilities, Permissions};
use crate::mm::AddressSpace;
use crate::task::proc;
use crate::task::Pid;
use crate::uaccess;

use super::fd::Description;
use super::mount::{self, MountKind};
use super::path::{compound_path, PATH_MAX};
use super::vfs::apply_umask;
use super::{fs_result, DirEntry, FsStatus, Stat};

/// The only accepted `dirfd` value: paths resolve against the CWD.
pub const AT_FDCWD: i64 = -100;

bitflags::bitflags! {
    /// open(2) flag set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u64 {
        const RDONLY = 1 << 0;
        const WRONLY = 1 << 1;
        const NOFOLLOW = 1 << 2;
        const APPEND = 1 << 3;
        const CLOEXEC = 1 << 4;
    }
}

/// Symlink resolution bound in open.
const MAX_LINK_DEPTH: usize = 8;

/// Read and canonicalize a path argument against the caller's CWD.
fn user_path(pid: Pid, space: &AddressSpace, addr: u64) -> KResult<String> {
    let raw = uaccess::read_user_string(space, addr, PATH_MAX + 1)?;
    if raw.len() > PATH_MAX {
        return Err(Errno::StringTooLong);
    }
    let cwd = proc::with_process(pid, |p| p.cwd.clone())?;
    compound_path(&cwd, &raw, PATH_MAX).ok_or(Errno::StringTooLong)
}

/// MAC rights wanted for an open with `flags`.
fn wanted_rights(flags: OpenFlags) -> Permissions {
    let mut rights = Permissions::CONTENTS;
    if flags.contains(OpenFlags::RDONLY) {
        rights |= Permissions::READ;
    }
    if flags.contains(OpenFlags::WRONLY) {
        rights |= Permissions::WRITE;
    }
    if flags.contains(OpenFlags::APPEND) {
        rights |= Permissions::APPEND;
    }
    rights
}

/// open(dirfd, path, flags).
pub fn sys_open(dirfd: i64, path_addr: u64, flags_raw: u64) -> KResult<u64> {
    if dirfd != AT_FDCWD {
        return Err(Errno::InvalidValue);
    }
    let flags = OpenFlags::from_bits(flags_raw).ok_or(Errno::InvalidValue)?;

    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;
    let path = user_path(pid, &space, path_addr)?;

    let allowed = proc::with_process(pid, |p| p.mac.check_path(&path, wanted_rights(flags)))?;
    if !allowed {
        return Err(Errno::BadAccess);
    }

    let can_read = flags.contains(OpenFlags::RDONLY);
    let can_write = flags.contains(OpenFlags::WRONLY) || flags.contains(OpenFlags::APPEND);

    // Device namespace
    if let Some(name) = path.strip_prefix("/dev/") {
        let dev_ok = proc::with_process(pid, |p| p.mac.check_path(&path, Permissions::DEV))?;
        if !dev_ok {
            return Err(Errno::BadAccess);
        }
        let device = devices::lookup(name).ok_or(Errno::NoEntity)?;
        let description = Arc::new(Description::Device {
            device,
            can_read,
            can_write,
            position: AtomicU64::new(0),
        });
        let fd = proc::with_process(pid, |p| {
            p.fds
                .install(description, flags.contains(OpenFlags::CLOEXEC), 0)
        })??;
        return Ok(fd as u64);
    }

    // Filesystem namespace, following symlinks unless told not to
    let mut current = path;
    for _ in 0..MAX_LINK_DEPTH {
        let (handle, fs, relative) = mount::resolve(&current)?;
        let ino = fs.open(&relative).map_err(|_| Errno::NoEntity)?;
        let stat = fs.stat(ino).map_err(Errno::from)?;

        if super::mode_type(stat.mode) == super::IFLNK && !flags.contains(OpenFlags::NOFOLLOW) {
            let mut target = String::new();
            fs_result(fs.read_symbolic_link(ino, &mut target))?;
            fs.close(ino);
            let parent = super::path::split_final(&current)
                .map(|(p, _)| String::from(p))
                .unwrap_or_else(|| String::from("/"));
            current = compound_path(&parent, &target, PATH_MAX).ok_or(Errno::StringTooLong)?;
            continue;
        }

        let description = Arc::new(Description::Inode {
            handle,
            ino,
            can_read,
            can_write,
            append: flags.contains(OpenFlags::APPEND),
            position: AtomicU64::new(0),
        });
        let fd = proc::with_process(pid, |p| {
            p.fds
                .install(description, flags.contains(OpenFlags::CLOEXEC), 0)
        })??;
        return Ok(fd as u64);
    }
    Err(Errno::NoEntity)
}

/// close(fd).
pub fn sys_close(fd: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    proc::with_process(pid, |p| p.fds.close(fd as usize))??;
    Ok(0)
}

/// read(fd, buf, count).
pub fn sys_read(fd: u64, buf: u64, count: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;
    let count = (count as usize).min(isize::MAX as usize);
    if !uaccess::check_access(&space, buf, count as u64, true) {
        return Err(Errno::WouldFault);
    }

    let description = proc::with_process(pid, |p| p.fds.get(fd as usize))??;
    let mut data = alloc::vec![0u8; count];
    let n = description.read(&mut data)?;
    uaccess::copy_to_user(&space, buf, &data[..n as usize])?;
    Ok(n)
}

/// write(fd, buf, count).
pub fn sys_write(fd: u64, buf: u64, count: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;
    let count = (count as usize).min(isize::MAX as usize);
    // Validate the span before sizing a kernel buffer after it, so
    // the allocation is bounded by what the caller actually mapped.
    if !uaccess::check_access(&space, buf, count as u64, false) {
        return Err(Errno::WouldFault);
    }

    let mut data = alloc::vec![0u8; count];
    uaccess::copy_from_user(&space, buf, &mut data)?;

    let limit = proc::with_process(pid, |p| p.limits.file_size)?;
    let description = proc::with_process(pid, |p| p.fds.get(fd as usize))??;
    description.write(&data, limit)
}

/// pread(fd, buf, count, offset).
pub fn sys_pread(fd: u64, buf: u64, count: u64, offset: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;
    let count = (count as usize).min(isize::MAX as usize);
    if !uaccess::check_access(&space, buf, count as u64, true) {
        return Err(Errno::WouldFault);
    }

    let description = proc::with_process(pid, |p| p.fds.get(fd as usize))??;
    let mut data = alloc::vec![0u8; count];
    let n = description.pread(&mut data, offset)?;
    uaccess::copy_to_user(&space, buf, &data[..n as usize])?;
    Ok(n)
}

/// pwrite(fd, buf, count, offset).
pub fn sys_pwrite(fd: u64, buf: u64, count: u64, offset: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;
    let count = (count as usize).min(isize::MAX as usize);
    if !uaccess::check_access(&space, buf, count as u64, false) {
        return Err(Errno::WouldFault);
    }

    let mut data = alloc::vec![0u8; count];
    uaccess::copy_from_user(&space, buf, &mut data)?;

    let limit = proc::with_process(pid, |p| p.limits.file_size)?;
    let description = proc::with_process(pid, |p| p.fds.get(fd as usize))??;
    description.pwrite(&data, offset, limit)
}

/// seek(fd, offset, whence).
pub fn sys_seek(fd: u64, offset: i64, whence: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let description = proc::with_process(pid, |p| p.fds.get(fd as usize))??;
    description.seek(offset, whence as u32)
}

fn copy_stat_out(space: &AddressSpace, stat: &Stat, out: u64) -> KResult<()> {
    let bytes = unsafe {
        ::core::slice::from_raw_parts(
            stat as *const Stat as *const u8,
            ::core::mem::size_of::<Stat>(),
        )
    };
    uaccess::copy_to_user(space, out, bytes)
}

/// stat(path, out).
pub fn sys_stat(path_addr: u64, out: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;
    let path = user_path(pid, &space, path_addr)?;

    let allowed = proc::with_process(pid, |p| p.mac.check_path(&path, Permissions::CONTENTS))?;
    if !allowed {
        return Err(Errno::BadAccess);
    }

    let (_handle, fs, relative) = mount::resolve(&path)?;
    let ino = fs.open(&relative).map_err(|_| Errno::NoEntity)?;
    let stat = fs.stat(ino).map_err(Errno::from)?;
    fs.close(ino);

    copy_stat_out(&space, &stat, out)?;
    Ok(0)
}

/// fstat(fd, out).
pub fn sys_fstat(fd: u64, out: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;
    let description = proc::with_process(pid, |p| p.fds.get(fd as usize))??;
    let stat = description.stat()?;
    copy_stat_out(&space, &stat, out)?;
    Ok(0)
}

/// truncate(fd, size).
pub fn sys_truncate(fd: u64, size: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let description = proc::with_process(pid, |p| p.fds.get(fd as usize))??;
    match &*description {
        Description::Inode {
            handle,
            ino,
            can_write,
            ..
        } => {
            if !can_write {
                return Err(Errno::BadAccess);
            }
            let fs = mount::fs_for(*handle)?;
            fs_result(fs.truncate(*ino, size))?;
            Ok(0)
        }
        _ => Err(Errno::InvalidValue),
    }
}

/// Shared body for the path-pair calls (rename, link).
fn two_path_op(
    from_addr: u64,
    to_addr: u64,
    rights: Permissions,
    op: impl FnOnce(&dyn super::vfs::Filesystem, &str, &str) -> FsStatus,
) -> KResult<u64> {
    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;
    let from = user_path(pid, &space, from_addr)?;
    let to = user_path(pid, &space, to_addr)?;

    let allowed = proc::with_process(pid, |p| {
        p.mac.check_path(&from, rights) && p.mac.check_path(&to, rights)
    })?;
    if !allowed {
        return Err(Errno::BadAccess);
    }

    let (from_handle, fs, from_rel) = mount::resolve(&from)?;
    let (to_handle, _, to_rel) = mount::resolve(&to)?;
    if from_handle != to_handle {
        // No cross-mount moves or links
        return Err(Errno::InvalidValue);
    }
    fs_result(op(&*fs, &from_rel, &to_rel))?;
    Ok(0)
}

/// unlink(path).
pub fn sys_unlink(path_addr: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;
    let path = user_path(pid, &space, path_addr)?;

    let allowed = proc::with_process(pid, |p| p.mac.check_path(&path, Permissions::WRITE))?;
    if !allowed {
        return Err(Errno::BadAccess);
    }
    let (_handle, fs, relative) = mount::resolve(&path)?;
    fs_result(fs.unlink(&relative))?;
    Ok(0)
}

/// rename(from, to).
pub fn sys_rename(from_addr: u64, to_addr: u64) -> KResult<u64> {
    two_path_op(from_addr, to_addr, Permissions::WRITE, |fs, from, to| {
        fs.rename(from, to)
    })
}

/// link(target, new).
pub fn sys_link(from_addr: u64, to_addr: u64) -> KResult<u64> {
    two_path_op(from_addr, to_addr, Permissions::WRITE, |fs, from, to| {
        fs.create_hard_link(to, from)
    })
}

/// symlink(target, new). The target is an arbitrary string, not
/// resolved here.
pub fn sys_symlink(target_addr: u64, path_addr: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;
    let target = uaccess::read_user_string(&space, target_addr, PATH_MAX)?;
    let path = user_path(pid, &space, path_addr)?;

    let allowed = proc::with_process(pid, |p| p.mac.check_path(&path, Permissions::WRITE))?;
    if !allowed {
        return Err(Errno::BadAccess);
    }
    let (_handle, fs, relative) = mount::resolve(&path)?;
    fs_result(fs.create_symbolic_link(&relative, &target))?;
    Ok(0)
}

/// readlink(path, buf, len).
pub fn sys_readlink(path_addr: u64, buf: u64, len: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;
    let path = user_path(pid, &space, path_addr)?;

    let (_handle, fs, relative) = mount::resolve(&path)?;
    let ino = fs.open(&relative).map_err(|_| Errno::NoEntity)?;
    let mut target = String::new();
    let status = fs.read_symbolic_link(ino, &mut target);
    fs.close(ino);
    fs_result(status)?;

    let bytes = target.as_bytes();
    let n = bytes.len().min(len as usize);
    uaccess::copy_to_user(&space, buf, &bytes[..n])?;
    Ok(n as u64)
}

/// mknod(path, mode): creates regular files and directories, with
/// the caller's umask applied.
pub fn sys_mknod(path_addr: u64, mode: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;
    let path = user_path(pid, &space, path_addr)?;

    let allowed = proc::with_process(pid, |p| p.mac.check_path(&path, Permissions::WRITE))?;
    if !allowed {
        return Err(Errno::BadAccess);
    }
    let umask = proc::with_process(pid, |p| p.umask)?;
    let (_handle, fs, relative) = mount::resolve(&path)?;
    fs_result(fs.create_node(&relative, apply_umask(mode as u32, umask)))?;
    Ok(0)
}

/// chdir(path): the target must resolve to a directory.
pub fn sys_chdir(path_addr: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;
    let path = user_path(pid, &space, path_addr)?;

    let (_handle, fs, relative) = mount::resolve(&path)?;
    let ino = fs.open(&relative).map_err(|_| Errno::NoEntity)?;
    let stat = fs.stat(ino).map_err(Errno::from)?;
    fs.close(ino);
    if super::mode_type(stat.mode) != super::IFDIR {
        return Err(Errno::InvalidValue);
    }

    proc::with_process(pid, |p| p.cwd = path)?;
    Ok(0)
}

/// getcwd(buf, len).
pub fn sys_getcwd(buf: u64, len: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;
    let cwd = proc::with_process(pid, |p| p.cwd.clone())?;

    if (cwd.len() + 1) as u64 > len {
        return Err(Errno::NotBigEnough);
    }
    uaccess::copy_to_user(&space, buf, cwd.as_bytes())?;
    uaccess::copy_to_user(&space, buf + cwd.len() as u64, &[0])?;
    Ok(cwd.len() as u64)
}

/// getdents(fd, buf, len): fills fixed-layout records, advancing the
/// descriptor's position by entries consumed.
pub fn sys_getdents(fd: u64, buf: u64, len: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;
    let description = proc::with_process(pid, |p| p.fds.get(fd as usize))??;

    let (handle, ino, position) = match &*description {
        Description::Inode {
            handle,
            ino,
            position,
            ..
        } => (*handle, *ino, position),
        _ => return Err(Errno::InvalidValue),
    };

    let offset = position.load(::core::sync::atomic::Ordering::Relaxed);
    let fs = mount::fs_for(handle)?;
    let mut entries = Vec::new();
    fs_result(fs.read_entries(ino, offset, &mut entries))?;

    let record = ::core::mem::size_of::<DirEntry>();
    let fits = (len as usize / record).min(entries.len());

    let mut written = 0usize;
    for entry in &entries[..fits] {
        let bytes = unsafe {
            ::core::slice::from_raw_parts(entry as *const DirEntry as *const u8, record)
        };
        uaccess::copy_to_user(&space, buf + written as u64, bytes)?;
        written += record;
    }
    position.store(
        offset + fits as u64,
        ::core::sync::atomic::Ordering::Relaxed,
    );
    Ok(written as u64)
}

/// ioctl(fd, request, argument): fans out by descriptor kind.
pub fn sys_ioctl(fd: u64, request: u64, argument: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;
    let description = proc::with_process(pid, |p| p.fds.get(fd as usize))??;

    match &*description {
        Description::Device { device, .. } => device.ioctl(request, argument),
        Description::Inode { handle, ino, .. } => {
            let fs = mount::fs_for(*handle)?;
            fs.io_control(*ino, request, argument).map_err(Errno::from)
        }
        Description::PrimaryPty(pty) | Description::SecondaryPty(pty) => {
            use crate::ipc::pty::{Termios, WindowSize};
            pty.io_control(
                request,
                &mut || -> KResult<Termios> {
                    let mut raw = [0u8; ::core::mem::size_of::<Termios>()];
                    uaccess::copy_from_user(&space, argument, &mut raw)?;
                    Ok(unsafe { ::core::ptr::read_unaligned(raw.as_ptr() as *const Termios) })
                },
                &mut |t: Termios| -> KResult<()> {
                    let raw = unsafe {
                        ::core::slice::from_raw_parts(
                            &t as *const Termios as *const u8,
                            ::core::mem::size_of::<Termios>(),
                        )
                    };
                    uaccess::copy_to_user(&space, argument, raw)
                },
                &mut || -> KResult<WindowSize> {
                    let mut raw = [0u8; ::core::mem::size_of::<WindowSize>()];
                    uaccess::copy_from_user(&space, argument, &mut raw)?;
                    Ok(unsafe { ::core::ptr::read_unaligned(raw.as_ptr() as *const WindowSize) })
                },
                &mut |w: WindowSize| -> KResult<()> {
                    let raw = unsafe {
                        ::core::slice::from_raw_parts(
                            &w as *const WindowSize as *const u8,
                            ::core::mem::size_of::<WindowSize>(),
                        )
                    };
                    uaccess::copy_to_user(&space, argument, raw)
                },
            )
        }
        _ => Err(Errno::NotATty),
    }
}

/// dup(fd): lowest free slot, close-on-exec clear.
pub fn sys_dup(fd: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let new = proc::with_process(pid, |p| p.fds.dup(fd as usize, 0))??;
    Ok(new as u64)
}

pub const F_GETFD: u64 = 1;
pub const F_SETFD: u64 = 2;
pub const F_GETFL: u64 = 3;
pub const F_SETFL: u64 = 4;
pub const FD_CLOEXEC_BIT: u64 = 1;
pub const FL_NONBLOCK: u64 = 1;

/// fcntl(fd, command, argument): descriptor-flag maintenance.
pub fn sys_fcntl(fd: u64, command: u64, argument: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    match command {
        F_GETFD => {
            let cloexec =
                proc::with_process(pid, |p| p.fds.entry(fd as usize).map(|e| e.close_on_exec))??;
            Ok(if cloexec { FD_CLOEXEC_BIT } else { 0 })
        }
        F_SETFD => {
            proc::with_process(pid, |p| {
                p.fds
                    .set_close_on_exec(fd as usize, argument & FD_CLOEXEC_BIT != 0)
            })??;
            Ok(0)
        }
        F_GETFL => {
            let description = proc::with_process(pid, |p| p.fds.get(fd as usize))??;
            let nonblock = match &*description {
                Description::FifoReader(fifo) => !fifo.reader_blocking(),
                Description::FifoWriter(fifo) => !fifo.writer_blocking(),
                Description::Socket(sock) => sock.nonblocking(),
                _ => false,
            };
            Ok(if nonblock { FL_NONBLOCK } else { 0 })
        }
        F_SETFL => {
            let description = proc::with_process(pid, |p| p.fds.get(fd as usize))??;
            let nonblock = argument & FL_NONBLOCK != 0;
            match &*description {
                Description::FifoReader(fifo) => fifo.set_reader_blocking(!nonblock),
                Description::FifoWriter(fifo) => fifo.set_writer_blocking(!nonblock),
                Description::Socket(sock) => sock.set_nonblocking(nonblock),
                _ => return Err(Errno::InvalidValue),
            }
            Ok(0)
        }
        _ => Err(Errno::InvalidValue),
    }
}

/// mount(source, target, kind, flags): SYS_MNT gated; kind 0 probes
/// EXT then FAT.
pub fn sys_mount(source_addr: u64, target_addr: u64, kind_raw: u64, _flags: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let allowed = proc::with_process(pid, |p| p.mac.has_capability(Capabilities::SYS_MNT))?;
    if !allowed {
        return Err(crate::syscall::mac_violation(pid, "mount"));
    }

    let space = proc::current_space(pid)?;
    let source = user_path(pid, &space, source_addr)?;
    let target = user_path(pid, &space, target_addr)?;

    let device_name = source.strip_prefix("/dev/").ok_or(Errno::InvalidValue)?;
    let kind = if kind_raw == 0 {
        None
    } else {
        Some(MountKind::from_raw(kind_raw as u32).ok_or(Errno::InvalidValue)?)
    };

    mount::mount(device_name, &target, kind)?;
    Ok(0)
}

/// umount(target, flags): flag bit 0 forces.
pub fn sys_umount(target_addr: u64, flags: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let allowed = proc::with_process(pid, |p| p.mac.has_capability(Capabilities::SYS_MNT))?;
    if !allowed {
        return Err(crate::syscall::mac_violation(pid, "umount"));
    }

    let space = proc::current_space(pid)?;
    let target = user_path(pid, &space, target_addr)?;
    mount::unmount(&target, flags & 1 != 0)?;
    Ok(0)
}

/// sync(): flush every mounted filesystem.
pub fn sys_sync() -> KResult<u64> {
    mount::synchronize_all();
    Ok(0)
}

/// fsync(fd): flush one inode.
pub fn sys_fsync(fd: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let description = proc::with_process(pid, |p| p.fds.get(fd as usize))??;
    match &*description {
        Description::Inode { handle, ino, .. } => {
            let fs = mount::fs_for(*handle)?;
            fs_result(fs.synchronize_inode(*ino))?;
            Ok(0)
        }
        _ => Err(Errno::InvalidValue),
    }
}
