//! FIFOs
//!
//! The buffer behind `pipe` and tracer descriptors: a bounded ring
//! with independent reader and writer endpoints. Endpoint counts track
//! dup'd descriptors; when the last endpoint of one side closes, the
//! other side observes the broken bit (EOF for readers, failure for
//! writers). Blocking endpoints spin on `yield` until progress is
//! possible.

use alloc::sync::Arc;
use ::core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use crate::poll::PollStatus;

/// Ring capacity in bytes.
pub const FIFO_CAPACITY: usize = 4096;

/// Outcome of a FIFO operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeStatus {
    Success,
    /// The opposite side is fully closed.
    Broken,
    /// Non-blocking endpoint, no progress possible now.
    WouldBlock,
}

struct Ring {
    buf: [u8; FIFO_CAPACITY],
    head: usize,
    len: usize,
}

impl Ring {
    const fn new() -> Self {
        Self {
            buf: [0; FIFO_CAPACITY],
            head: 0,
            len: 0,
        }
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(FIFO_CAPACITY - self.len);
        for &b in &data[..n] {
            self.buf[(self.head + self.len) % FIFO_CAPACITY] = b;
            self.len += 1;
        }
        n
    }

    fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        for slot in out[..n].iter_mut() {
            *slot = self.buf[self.head];
            self.head = (self.head + 1) % FIFO_CAPACITY;
            self.len -= 1;
        }
        n
    }
}

/// The shared FIFO object both endpoints reference.
pub struct Fifo {
    ring: Mutex<Ring>,
    readers: AtomicU32,
    writers: AtomicU32,
    reader_blocking: AtomicBool,
    writer_blocking: AtomicBool,
}

impl Fifo {
    /// Create a FIFO with one reader and one writer endpoint.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ring: Mutex::new(Ring::new()),
            readers: AtomicU32::new(1),
            writers: AtomicU32::new(1),
            reader_blocking: AtomicBool::new(true),
            writer_blocking: AtomicBool::new(true),
        })
    }

    pub fn add_reader(&self) {
        self.readers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove_reader(&self) {
        self.readers.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn add_writer(&self) {
        self.writers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove_writer(&self) {
        self.writers.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn has_readers(&self) -> bool {
        self.readers.load(Ordering::Acquire) > 0
    }

    pub fn has_writers(&self) -> bool {
        self.writers.load(Ordering::Acquire) > 0
    }

    /// Blocking mode of the reader endpoint.
    pub fn set_reader_blocking(&self, blocking: bool) {
        self.reader_blocking.store(blocking, Ordering::Relaxed);
    }

    /// Blocking mode of the writer endpoint.
    pub fn set_writer_blocking(&self, blocking: bool) {
        self.writer_blocking.store(blocking, Ordering::Relaxed);
    }

    pub fn reader_blocking(&self) -> bool {
        self.reader_blocking.load(Ordering::Relaxed)
    }

    pub fn writer_blocking(&self) -> bool {
        self.writer_blocking.load(Ordering::Relaxed)
    }

    /// Bytes queued right now.
    pub fn buffered(&self) -> usize {
        self.ring.lock().len
    }

    /// Non-blocking read attempt.
    pub fn try_read(&self, out: &mut [u8]) -> (usize, PipeStatus) {
        let mut ring = self.ring.lock();
        if ring.len == 0 {
            return if self.has_writers() {
                (0, PipeStatus::WouldBlock)
            } else {
                (0, PipeStatus::Broken)
            };
        }
        (ring.read(out), PipeStatus::Success)
    }

    /// Non-blocking write attempt.
    pub fn try_write(&self, data: &[u8]) -> (usize, PipeStatus) {
        if !self.has_readers() {
            return (0, PipeStatus::Broken);
        }
        let mut ring = self.ring.lock();
        let n = ring.write(data);
        if n == 0 {
            (0, PipeStatus::WouldBlock)
        } else {
            (n, PipeStatus::Success)
        }
    }

    /// Read honoring the endpoint's blocking mode: wait for bytes or
    /// for the write side to vanish.
    pub fn read(&self, out: &mut [u8]) -> (usize, PipeStatus) {
        loop {
            let (n, status) = self.try_read(out);
            match status {
                PipeStatus::WouldBlock if self.reader_blocking() => {
                    crate::task::sched::yield_now();
                }
                _ => return (n, status),
            }
        }
    }

    /// Write honoring the endpoint's blocking mode: wait for space.
    pub fn write(&self, data: &[u8]) -> (usize, PipeStatus) {
        loop {
            let (n, status) = self.try_write(data);
            match status {
                PipeStatus::WouldBlock if self.writer_blocking() => {
                    crate::task::sched::yield_now();
                }
                _ => return (n, status),
            }
        }
    }

    /// Readiness as seen from the reader endpoint.
    pub fn reader_poll(&self) -> PollStatus {
        PollStatus {
            can_read: self.buffered() > 0,
            can_write: false,
            is_error: false,
            is_broken: !self.has_writers() && self.buffered() == 0,
        }
    }

    /// Readiness as seen from the writer endpoint.
    pub fn writer_poll(&self) -> PollStatus {
        PollStatus {
            can_read: false,
            can_write: self.buffered() < FIFO_CAPACITY && self.has_readers(),
            is_error: !self.has_readers(),
            is_broken: !self.has_readers(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips() {
        let fifo = Fifo::new();
        let (n, status) = fifo.try_write(b"hello");
        assert_eq!((n, status), (5, PipeStatus::Success));

        let mut out = [0u8; 8];
        let (n, status) = fifo.try_read(&mut out);
        assert_eq!((n, status), (5, PipeStatus::Success));
        assert_eq!(&out[..5], b"hello");
    }

    #[test]
    fn capacity_is_bounded() {
        let fifo = Fifo::new();
        let big = [0xABu8; FIFO_CAPACITY + 100];
        let (n, status) = fifo.try_write(&big);
        assert_eq!((n, status), (FIFO_CAPACITY, PipeStatus::Success));

        let (n, status) = fifo.try_write(b"x");
        assert_eq!((n, status), (0, PipeStatus::WouldBlock));
    }

    #[test]
    fn wraparound_preserves_order() {
        let fifo = Fifo::new();
        let mut out = [0u8; 3000];

        // Fill, drain part, refill across the wrap point
        assert_eq!(fifo.try_write(&[1u8; 3000]).0, 3000);
        assert_eq!(fifo.try_read(&mut out).0, 3000);
        assert_eq!(fifo.try_write(&[2u8; 3000]).0, 3000);

        let mut tail = [0u8; 3000];
        assert_eq!(fifo.try_read(&mut tail).0, 3000);
        assert!(tail.iter().all(|&b| b == 2));
    }

    #[test]
    fn reader_sees_broken_after_writers_leave() {
        let fifo = Fifo::new();
        let _ = fifo.try_write(b"tail");
        fifo.remove_writer();

        // Queued bytes still drain
        let mut out = [0u8; 8];
        let (n, status) = fifo.try_read(&mut out);
        assert_eq!((n, status), (4, PipeStatus::Success));

        // Then EOF
        let (n, status) = fifo.try_read(&mut out);
        assert_eq!((n, status), (0, PipeStatus::Broken));
        assert!(fifo.reader_poll().is_broken);
    }

    #[test]
    fn writer_fails_without_readers() {
        let fifo = Fifo::new();
        fifo.remove_reader();
        let (n, status) = fifo.try_write(b"x");
        assert_eq!((n, status), (0, PipeStatus::Broken));
        assert!(fifo.writer_poll().is_error);
    }

    #[test]
    fn poll_reflects_buffered_bytes() {
        let fifo = Fifo::new();
        assert!(!fifo.reader_poll().can_read);
        assert!(fifo.writer_poll().can_write);

        fifo.try_write(b"data");
        assert!(fifo.reader_poll().can_read);
    }
}
