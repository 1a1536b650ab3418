//! IPC syscalls: pipes and sockets

use alloc::sync::Arc;

use crate::error::{Errno, KResult};
use crate::fs::fd::Description;
use crate::fs::path::PATH_MAX;
use crate::mac::Capabilities;
use crate::task::proc;
use crate::uaccess;

use super::fifo::Fifo;
use super::socket::{SockStatus, SockType, UnixSocket};

pub const AF_UNIX: u64 = 1;
pub const SOCK_STREAM: u64 = 1;
pub const SOCK_DGRAM: u64 = 2;
const SOCK_TYPE_MASK: u64 = 0xFF;
pub const SOCK_NONBLOCK: u64 = 0x800;
pub const SOCK_CLOEXEC: u64 = 0x8_0000;

/// pipe flag: descriptors start close-on-exec.
pub const PIPE_CLOEXEC: u64 = 1 << 0;
/// pipe flag: both endpoints non-blocking.
pub const PIPE_NONBLOCK: u64 = 1 << 1;

fn sock_errno(status: SockStatus) -> Errno {
    match status {
        SockStatus::PlainSuccess => Errno::NoError,
        SockStatus::IsBadType => Errno::InvalidValue,
        SockStatus::WouldBlock => Errno::WouldBlock,
    }
}

/// pipe: create a FIFO and install reader/writer descriptors,
/// reader in the lower-numbered slot.
pub fn sys_pipe(fds_out: u64, flags: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;

    let fifo = Fifo::new();
    if flags & PIPE_NONBLOCK != 0 {
        fifo.set_reader_blocking(false);
        fifo.set_writer_blocking(false);
    }
    let cloexec = flags & PIPE_CLOEXEC != 0;

    let reader = Arc::new(Description::FifoReader(fifo.clone()));
    let writer = Arc::new(Description::FifoWriter(fifo));

    let (rfd, wfd) = proc::with_process(pid, |p| -> KResult<(usize, usize)> {
        let rfd = p.fds.install(reader, cloexec, 0)?;
        match p.fds.install(writer, cloexec, 0) {
            Ok(wfd) => Ok((rfd, wfd)),
            Err(e) => {
                let _ = p.fds.close(rfd);
                Err(e)
            }
        }
    })??;

    let mut pair = [0u8; 8];
    pair[..4].copy_from_slice(&(rfd as u32).to_ne_bytes());
    pair[4..].copy_from_slice(&(wfd as u32).to_ne_bytes());
    uaccess::copy_to_user(&space, fds_out, &pair)?;
    Ok(0)
}

/// socket: AF_UNIX stream or datagram, default protocol only.
pub fn sys_socket(domain: u64, type_and_flags: u64, protocol: u64) -> KResult<u64> {
    let pid = proc::current_pid();
    let allowed = proc::with_process(pid, |p| p.mac.has_capability(Capabilities::USE_NET))?;
    if !allowed {
        return Err(crate::syscall::mac_violation(pid, "socket"));
    }

    if domain != AF_UNIX || protocol != 0 {
        return Err(Errno::InvalidValue);
    }
    let kind = match type_and_flags & SOCK_TYPE_MASK {
        SOCK_STREAM => SockType::Stream,
        SOCK_DGRAM => SockType::Datagram,
        _ => return Err(Errno::InvalidValue),
    };

    let socket = UnixSocket::new(kind, type_and_flags & SOCK_NONBLOCK != 0);
    let cloexec = type_and_flags & SOCK_CLOEXEC != 0;
    let description = Arc::new(Description::Socket(socket));

    let fd = proc::with_process(pid, |p| p.fds.install(description, cloexec, 0))??;
    Ok(fd as u64)
}

fn socket_of(fd: u64) -> KResult<Arc<UnixSocket>> {
    let pid = proc::current_pid();
    let description = proc::with_process(pid, |p| p.fds.get(fd as usize))??;
    match &*description {
        Description::Socket(sock) => Ok(sock.clone()),
        _ => Err(Errno::InvalidValue),
    }
}

fn read_path_arg(addr: u64) -> KResult<alloc::string::String> {
    let pid = proc::current_pid();
    let space = proc::current_space(pid)?;
    uaccess::read_user_string(&space, addr, PATH_MAX)
}

/// bind(fd, path).
pub fn sys_bind(fd: u64, path_addr: u64, _len: u64) -> KResult<u64> {
    let socket = socket_of(fd)?;
    let path = read_path_arg(path_addr)?;
    match socket.bind(&path) {
        SockStatus::PlainSuccess => Ok(0),
        status => Err(sock_errno(status)),
    }
}

/// connect(fd, path).
pub fn sys_connect(fd: u64, path_addr: u64, _len: u64) -> KResult<u64> {
    let socket = socket_of(fd)?;
    let path = read_path_arg(path_addr)?;
    match socket.connect(&path) {
        SockStatus::PlainSuccess => Ok(0),
        status => Err(sock_errno(status)),
    }
}

/// listen(fd, backlog).
pub fn sys_listen(fd: u64, backlog: u64) -> KResult<u64> {
    let socket = socket_of(fd)?;
    match socket.listen(backlog as usize) {
        SockStatus::PlainSuccess => Ok(0),
        status => Err(sock_errno(status)),
    }
}

/// accept(fd): blocks unless the listener is non-blocking.
pub fn sys_accept(fd: u64) -> KResult<u64> {
    let socket = socket_of(fd)?;
    let connection = loop {
        match socket.accept() {
            Ok(conn) => break conn,
            Err(SockStatus::WouldBlock) if !socket.nonblocking() => {
                crate::task::sched::yield_now();
            }
            Err(status) => return Err(sock_errno(status)),
        }
    };

    let pid = proc::current_pid();
    let description = Arc::new(Description::Socket(connection));
    let new_fd = proc::with_process(pid, |p| p.fds.install(description, false, 0))??;
    Ok(new_fd as u64)
}
