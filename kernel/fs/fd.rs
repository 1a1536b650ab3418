//! File descriptors
//!
//! A descriptor names an open description: a tagged record over the
//! seven kinds of object a process can hold open. Descriptions are
//! reference-counted (`dup` and fork share them, offsets included);
//! endpoint bookkeeping for FIFOs runs when the last reference drops.
//! The per-process table is a bounded array indexed by fd number.

use alloc::sync::Arc;
use alloc::vec::Vec;

use ::core::sync::atomic::{AtomicU64, Ordering};

use crate::devices::Device;
use crate::error::{Errno, KResult};
use crate::ipc::fifo::{Fifo, PipeStatus};
use crate::ipc::pty::Pty;
use crate::ipc::socket::{SockStatus, UnixSocket};
use crate::poll::PollStatus;

use super::mount::FsHandle;

/// The open object behind a descriptor.
pub enum Description {
    Device {
        device: Arc<dyn Device>,
        can_read: bool,
        can_write: bool,
        position: AtomicU64,
    },
    Inode {
        handle: FsHandle,
        ino: u64,
        can_read: bool,
        can_write: bool,
        append: bool,
        position: AtomicU64,
    },
    FifoReader(Arc<Fifo>),
    FifoWriter(Arc<Fifo>),
    PrimaryPty(Arc<Pty>),
    SecondaryPty(Arc<Pty>),
    Socket(Arc<UnixSocket>),
}

impl Drop for Description {
    fn drop(&mut self) {
        match self {
            Description::FifoReader(fifo) => fifo.remove_reader(),
            Description::FifoWriter(fifo) => fifo.remove_writer(),
            Description::Socket(sock) => sock.unbind(),
            Description::Inode { handle, ino, .. } => {
                if let Ok(fs) = super::mount::fs_for(*handle) {
                    fs.close(*ino);
                }
            }
            _ => {}
        }
    }
}

fn pipe_result(pair: (usize, PipeStatus)) -> KResult<u64> {
    match pair {
        (n, PipeStatus::Success) => Ok(n as u64),
        (_, PipeStatus::Broken) => Ok(0),
        (_, PipeStatus::WouldBlock) => Err(Errno::WouldBlock),
    }
}

fn sock_result(res: Result<usize, SockStatus>) -> KResult<u64> {
    match res {
        Ok(n) => Ok(n as u64),
        Err(SockStatus::WouldBlock) => Err(Errno::WouldBlock),
        Err(_) => Err(Errno::InvalidValue),
    }
}

impl Description {
    /// Read at the stored position, advancing it.
    pub fn read(&self, buf: &mut [u8]) -> KResult<u64> {
        match self {
            Description::Device {
                device,
                can_read,
                position,
                ..
            } => {
                if !can_read {
                    return Err(Errno::BadAccess);
                }
                let pos = position.load(Ordering::Relaxed);
                let n = device.read(pos, buf)? as u64;
                position.store(pos + n, Ordering::Relaxed);
                Ok(n)
            }
            Description::Inode { position, .. } => {
                let pos = position.load(Ordering::Relaxed);
                let n = self.pread(buf, pos)?;
                position.store(pos + n, Ordering::Relaxed);
                Ok(n)
            }
            Description::FifoReader(fifo) => pipe_result(fifo.read(buf)),
            Description::FifoWriter(_) => Err(Errno::BadAccess),
            Description::PrimaryPty(pty) => pipe_result(pty.primary_read(buf)),
            Description::SecondaryPty(pty) => pipe_result(pty.secondary_read(buf)),
            Description::Socket(sock) => sock_result(sock.receive(buf)),
        }
    }

    /// Write at the stored position, advancing it. `size_limit` is
    /// the caller's file-size resource limit.
    pub fn write(&self, data: &[u8], size_limit: u64) -> KResult<u64> {
        match self {
            Description::Device {
                device,
                can_write,
                position,
                ..
            } => {
                if !can_write {
                    return Err(Errno::BadAccess);
                }
                let pos = position.load(Ordering::Relaxed);
                let n = device.write(pos, data)? as u64;
                position.store(pos + n, Ordering::Relaxed);
                Ok(n)
            }
            Description::Inode {
                position, append, ..
            } => {
                let pos = if *append {
                    self.stat()?.byte_size
                } else {
                    position.load(Ordering::Relaxed)
                };
                let n = self.pwrite(data, pos, size_limit)?;
                position.store(pos + n, Ordering::Relaxed);
                Ok(n)
            }
            Description::FifoReader(_) => Err(Errno::BadAccess),
            Description::FifoWriter(fifo) => match fifo.write(data) {
                (n, PipeStatus::Success) => Ok(n as u64),
                (_, PipeStatus::Broken) => Err(Errno::Io),
                (_, PipeStatus::WouldBlock) => Err(Errno::WouldBlock),
            },
            Description::PrimaryPty(pty) => pipe_result(pty.primary_write(data)),
            Description::SecondaryPty(pty) => pipe_result(pty.secondary_write(data)),
            Description::Socket(sock) => sock_result(sock.send(data, None)),
        }
    }

    /// Positioned read; the stored position is untouched.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> KResult<u64> {
        match self {
            Description::Device {
                device, can_read, ..
            } => {
                if !can_read {
                    return Err(Errno::BadAccess);
                }
                Ok(device.read(offset, buf)? as u64)
            }
            Description::Inode {
                handle,
                ino,
                can_read,
                ..
            } => {
                if !can_read {
                    return Err(Errno::BadAccess);
                }
                let fs = super::mount::fs_for(*handle)?;
                match fs.read(*ino, offset, buf) {
                    Ok(n) => Ok(n as u64),
                    Err(status) => Err(status.into()),
                }
            }
            _ => Err(Errno::InvalidSeek),
        }
    }

    /// Positioned write; the stored position is untouched.
    pub fn pwrite(&self, data: &[u8], offset: u64, size_limit: u64) -> KResult<u64> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(Errno::InvalidValue)?;
        if end > size_limit {
            return Err(Errno::FileTooBig);
        }
        match self {
            Description::Device {
                device, can_write, ..
            } => {
                if !can_write {
                    return Err(Errno::BadAccess);
                }
                Ok(device.write(offset, data)? as u64)
            }
            Description::Inode {
                handle,
                ino,
                can_write,
                ..
            } => {
                if !can_write {
                    return Err(Errno::BadAccess);
                }
                let fs = super::mount::fs_for(*handle)?;
                match fs.write(*ino, offset, data) {
                    Ok(n) => Ok(n as u64),
                    Err(status) => Err(status.into()),
                }
            }
            _ => Err(Errno::InvalidSeek),
        }
    }

    /// Stat for descriptors that have one.
    pub fn stat(&self) -> KResult<super::Stat> {
        match self {
            Description::Inode { handle, ino, .. } => {
                let fs = super::mount::fs_for(*handle)?;
                fs.stat(*ino).map_err(Errno::from)
            }
            Description::Device { device, .. } => Ok(super::Stat {
                mode: if device.is_block() {
                    super::IFBLK | 0o600
                } else {
                    super::IFCHR | 0o600
                },
                byte_size: device.block_count() * device.block_size(),
                block_size: device.block_size(),
                block_count: device.block_count(),
                ..super::Stat::default()
            }),
            Description::FifoReader(_) | Description::FifoWriter(_) => Ok(super::Stat {
                mode: super::IFIFO | 0o600,
                ..super::Stat::default()
            }),
            Description::PrimaryPty(_) | Description::SecondaryPty(_) => Ok(super::Stat {
                mode: super::IFCHR | 0o600,
                ..super::Stat::default()
            }),
            Description::Socket(_) => Ok(super::Stat {
                mode: super::ISOCK | 0o600,
                ..super::Stat::default()
            }),
        }
    }

    /// Seek; only inodes and block devices are seekable.
    pub fn seek(&self, offset: i64, whence: u32) -> KResult<u64> {
        const SEEK_SET: u32 = 0;
        const SEEK_CURRENT: u32 = 1;
        const SEEK_END: u32 = 2;

        let (position, end) = match self {
            Description::Inode { position, .. } => (position, self.stat()?.byte_size),
            Description::Device {
                device, position, ..
            } => {
                if !device.is_block() {
                    return Err(Errno::InvalidSeek);
                }
                (position, device.block_count() * device.block_size())
            }
            _ => return Err(Errno::InvalidSeek),
        };

        let base = match whence {
            SEEK_SET => 0i64,
            SEEK_CURRENT => position.load(Ordering::Relaxed) as i64,
            SEEK_END => end as i64,
            _ => return Err(Errno::InvalidValue),
        };
        let target = base.checked_add(offset).ok_or(Errno::InvalidValue)?;
        if target < 0 {
            return Err(Errno::InvalidValue);
        }
        position.store(target as u64, Ordering::Relaxed);
        Ok(target as u64)
    }

    /// Readiness for poll.
    pub fn poll_status(&self) -> PollStatus {
        match self {
            Description::Device { device, .. } => device.poll_status(),
            Description::Inode { .. } => PollStatus {
                can_read: true,
                can_write: true,
                is_error: false,
                is_broken: false,
            },
            Description::FifoReader(fifo) => fifo.reader_poll(),
            Description::FifoWriter(fifo) => fifo.writer_poll(),
            Description::PrimaryPty(pty) => pty.primary_poll(),
            Description::SecondaryPty(pty) => pty.secondary_poll(),
            Description::Socket(sock) => sock.poll_status(),
        }
    }
}

/// One slot of the descriptor table.
#[derive(Clone)]
pub struct FdEntry {
    pub description: Arc<Description>,
    pub close_on_exec: bool,
}

/// The bounded per-process descriptor table.
pub struct FdTable {
    slots: Vec<Option<FdEntry>>,
}

impl FdTable {
    /// Table bounded to `limit` descriptors.
    pub fn new(limit: usize) -> Self {
        let mut slots = Vec::with_capacity(limit);
        slots.resize_with(limit, || None);
        Self { slots }
    }

    /// Install a description at the lowest free index at or above
    /// `start`.
    pub fn install(
        &mut self,
        description: Arc<Description>,
        close_on_exec: bool,
        start: usize,
    ) -> KResult<usize> {
        for fd in start..self.slots.len() {
            if self.slots[fd].is_none() {
                self.slots[fd] = Some(FdEntry {
                    description,
                    close_on_exec,
                });
                return Ok(fd);
            }
        }
        Err(Errno::TooManyFiles)
    }

    pub fn get(&self, fd: usize) -> KResult<Arc<Description>> {
        self.slots
            .get(fd)
            .and_then(|slot| slot.as_ref())
            .map(|entry| entry.description.clone())
            .ok_or(Errno::BadFile)
    }

    pub fn entry(&self, fd: usize) -> KResult<&FdEntry> {
        self.slots
            .get(fd)
            .and_then(|slot| slot.as_ref())
            .ok_or(Errno::BadFile)
    }

    pub fn set_close_on_exec(&mut self, fd: usize, value: bool) -> KResult<()> {
        self.slots
            .get_mut(fd)
            .and_then(|slot| slot.as_mut())
            .map(|entry| entry.close_on_exec = value)
            .ok_or(Errno::BadFile)
    }

    /// Release a descriptor. The description itself goes when its
    /// last holder does.
    pub fn close(&mut self, fd: usize) -> KResult<()> {
        match self.slots.get_mut(fd) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(Errno::BadFile),
        }
    }

    /// Duplicate `fd` into the lowest free slot at or above `start`.
    /// The new descriptor shares the description (offset included)
    /// and starts with close-on-exec clear.
    pub fn dup(&mut self, fd: usize, start: usize) -> KResult<usize> {
        let description = self.get(fd)?;
        self.install(description, false, start)
    }

    /// Structural copy for fork: same indices, same close-on-exec
    /// bits, shared descriptions.
    pub fn duplicate(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }

    /// Drop every close-on-exec descriptor (the exec transition).
    pub fn exec_sweep(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().map(|e| e.close_on_exec).unwrap_or(false) {
                *slot = None;
            }
        }
    }

    /// Number of live descriptors.
    pub fn open_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// The table's bound.
    pub fn limit(&self) -> usize {
        self.slots.len()
    }

    /// Structural equality with another table: same indices occupied,
    /// same descriptions, same flags.
    pub fn structurally_equal(&self, other: &FdTable) -> bool {
        self.slots.len() == other.slots.len()
            && self.slots.iter().zip(other.slots.iter()).all(|(a, b)| {
                match (a, b) {
                    (None, None) => true,
                    (Some(x), Some(y)) => {
                        Arc::ptr_eq(&x.description, &y.description)
                            && x.close_on_exec == y.close_on_exec
                    }
                    _ => false,
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fifo_pair() -> (Arc<Description>, Arc<Description>) {
        let fifo = Fifo::new();
        (
            Arc::new(Description::FifoReader(fifo.clone())),
            Arc::new(Description::FifoWriter(fifo)),
        )
    }

    #[test]
    fn install_returns_lowest_free_at_or_above_start() {
        let mut table = FdTable::new(8);
        let (r, w) = fifo_pair();
        assert_eq!(table.install(r.clone(), false, 0).unwrap(), 0);
        assert_eq!(table.install(w.clone(), false, 0).unwrap(), 1);
        table.close(0).unwrap();
        assert_eq!(table.install(r.clone(), false, 0).unwrap(), 0);
        // Starting above a free slot skips it
        assert_eq!(table.install(w, false, 3).unwrap(), 3);
    }

    #[test]
    fn table_is_bounded() {
        let mut table = FdTable::new(3);
        let (r, _w) = fifo_pair();
        for _ in 0..3 {
            table.install(r.clone(), false, 0).unwrap();
        }
        assert_eq!(table.install(r, false, 0), Err(Errno::TooManyFiles));
        assert_eq!(table.open_count(), 3);
    }

    #[test]
    fn fork_copy_is_structurally_equal_then_diverges() {
        let mut parent = FdTable::new(8);
        let (r, w) = fifo_pair();
        parent.install(r, true, 0).unwrap();
        parent.install(w, false, 0).unwrap();

        let mut child = parent.duplicate();
        assert!(parent.structurally_equal(&child));

        child.close(0).unwrap();
        assert!(!parent.structurally_equal(&child));
        // Parent unaffected
        assert!(parent.get(0).is_ok());
    }

    #[test]
    fn exec_sweep_drops_only_cloexec() {
        let mut table = FdTable::new(8);
        let (r, w) = fifo_pair();
        table.install(r, true, 0).unwrap();
        table.install(w, false, 0).unwrap();

        table.exec_sweep();
        assert!(table.get(0).is_err());
        assert!(table.get(1).is_ok());
        assert_eq!(table.open_count(), 1);
    }

    #[test]
    fn dup_shares_description_and_clears_cloexec() {
        let mut table = FdTable::new(8);
        let (r, _w) = fifo_pair();
        table.install(r, true, 0).unwrap();

        let dup_fd = table.dup(0, 0).unwrap();
        assert_eq!(dup_fd, 1);
        assert!(Arc::ptr_eq(
            &table.get(0).unwrap(),
            &table.get(dup_fd).unwrap()
        ));
        assert!(!table.entry(dup_fd).unwrap().close_on_exec);
        assert!(table.entry(0).unwrap().close_on_exec);
    }

    #[test]
    fn last_close_breaks_the_fifo() {
        let fifo = Fifo::new();
        let reader = Arc::new(Description::FifoReader(fifo.clone()));
        let writer = Arc::new(Description::FifoWriter(fifo.clone()));

        let mut table = FdTable::new(8);
        let wfd = table.install(writer, false, 0).unwrap();
        let dup_fd = table.dup(wfd, 0).unwrap();

        // Closing one of two writer descriptors keeps the fifo alive
        table.close(wfd).unwrap();
        assert!(fifo.has_writers());

        table.close(dup_fd).unwrap();
        assert!(!fifo.has_writers());

        drop(reader);
        drop(table);
    }

    #[test]
    fn seek_rejected_on_pipes_and_sockets() {
        let (r, _w) = fifo_pair();
        assert_eq!(r.seek(0, 0), Err(Errno::InvalidSeek));

        let sock = Arc::new(Description::Socket(UnixSocket::new(
            crate::ipc::socket::SockType::Stream,
            false,
        )));
        assert_eq!(sock.seek(10, 0), Err(Errno::InvalidSeek));
    }

    #[test]
    fn size_limit_caps_positioned_writes() {
        let fifo = Fifo::new();
        let writer = Description::FifoWriter(fifo);
        // Even non-inode writes go through the limit check in pwrite
        assert_eq!(writer.pwrite(b"abc", 100, 64), Err(Errno::FileTooBig));
    }
}
