//! Kernel console logging
//!
//! Messages printed before the serial console is attached are kept in
//! a fixed ring buffer and replayed on `flush()`. After attach, output
//! goes straight through. The panic path switches to `try_lock` so a
//! core that dies while holding the log lock cannot deadlock the
//! diagnostic line.

use ::core::fmt::{self, Write};
use ::core::sync::atomic::{AtomicBool, Ordering};

use crate::sync::IrqLock;

/// Size of the early-boot message buffer.
const LOG_BUF_SIZE: usize = 8192;

struct LogBuf {
    buf: [u8; LOG_BUF_SIZE],
    head: usize,
    len: usize,
}

impl LogBuf {
    const fn new() -> Self {
        Self {
            buf: [0; LOG_BUF_SIZE],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        let tail = (self.head + self.len) % LOG_BUF_SIZE;
        self.buf[tail] = byte;
        if self.len < LOG_BUF_SIZE {
            self.len += 1;
        } else {
            // Overwrite oldest
            self.head = (self.head + 1) % LOG_BUF_SIZE;
        }
    }
}

static LOG: IrqLock<LogBuf> = IrqLock::new(LogBuf::new());

/// Set once the serial console can accept bytes.
static CONSOLE_READY: AtomicBool = AtomicBool::new(false);

/// Set when a panic is in progress; switches logging to try_lock.
static OOPS: AtomicBool = AtomicBool::new(false);

struct Sink;

impl Write for Sink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if CONSOLE_READY.load(Ordering::Acquire) {
            for b in s.bytes() {
                if b == b'\n' {
                    crate::arch::console_put(b'\r');
                }
                crate::arch::console_put(b);
            }
        } else if let Some(mut log) = LOG.try_lock() {
            for b in s.bytes() {
                log.push(b);
            }
        }
        Ok(())
    }
}

/// Attach the console and replay buffered output.
pub fn attach_console() {
    crate::arch::console_init();
    CONSOLE_READY.store(true, Ordering::Release);
    flush();
}

/// Replay the early-boot buffer to the console.
pub fn flush() {
    if !CONSOLE_READY.load(Ordering::Acquire) {
        return;
    }
    let mut log = LOG.lock();
    for i in 0..log.len {
        let b = log.buf[(log.head + i) % LOG_BUF_SIZE];
        if b == b'\n' {
            crate::arch::console_put(b'\r');
        }
        crate::arch::console_put(b);
    }
    log.len = 0;
}

/// Mark the panic path active. Logging stops taking blocking locks.
pub fn set_oops_in_progress() {
    OOPS.store(true, Ordering::SeqCst);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    // In oops mode nothing below may block
    if OOPS.load(Ordering::Relaxed) {
        let _ = Sink.write_fmt(args);
        return;
    }
    let _ = Sink.write_fmt(args);
}

/// Print a line to the kernel console.
#[macro_export]
macro_rules! printkln {
    () => { $crate::printk::_print(format_args!("\n")) };
    ($($arg:tt)*) => {
        $crate::printk::_print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

/// Print to the kernel console without a trailing newline.
#[macro_export]
macro_rules! printk {
    ($($arg:tt)*) => { $crate::printk::_print(format_args!($($arg)*)) };
}
