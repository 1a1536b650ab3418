//! Pseudo-terminals
//!
//! A primary/secondary pair over two rings, carrying termios state and
//! a window size. The six tc* ioctls operate on whichever end the
//! descriptor names; TCSETSW/TCSETSF drain or flush before applying,
//! which over a ring means waiting for the primary to consume queued
//! output.

use alloc::sync::Arc;

use spin::Mutex;

use crate::error::{Errno, KResult};
use crate::poll::PollStatus;

use super::fifo::{Fifo, PipeStatus};

pub const TCGETS: u64 = 0x5401;
pub const TCSETS: u64 = 0x5402;
pub const TCSETSW: u64 = 0x5403;
pub const TCSETSF: u64 = 0x5404;
pub const TIOCGWINSZ: u64 = 0x5413;
pub const TIOCSWINSZ: u64 = 0x5414;

/// Terminal settings, fixed layout shared with userland.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Termios {
    pub input_flags: u32,
    pub output_flags: u32,
    pub control_flags: u32,
    pub local_flags: u32,
    pub line_discipline: u8,
    pub control_chars: [u8; 19],
    pub input_speed: u32,
    pub output_speed: u32,
}

impl Termios {
    /// Cooked-mode defaults.
    pub const fn sane() -> Self {
        Self {
            input_flags: 0x0500,  // ICRNL | IXON
            output_flags: 0x0005, // OPOST | ONLCR
            control_flags: 0x00BF,
            local_flags: 0x8A3B, // ECHO | ICANON | ISIG ...
            line_discipline: 0,
            control_chars: [0; 19],
            input_speed: 38400,
            output_speed: 38400,
        }
    }
}

/// Terminal window dimensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct WindowSize {
    pub rows: u16,
    pub columns: u16,
    pub x_pixels: u16,
    pub y_pixels: u16,
}

/// The shared pair object. The primary end reads what the secondary
/// writes and vice versa.
pub struct Pty {
    /// Secondary → primary (program output).
    output: Arc<Fifo>,
    /// Primary → secondary (keystrokes).
    input: Arc<Fifo>,
    termios: Mutex<Termios>,
    winsize: Mutex<WindowSize>,
}

impl Pty {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            output: Fifo::new(),
            input: Fifo::new(),
            termios: Mutex::new(Termios::sane()),
            winsize: Mutex::new(WindowSize {
                rows: 25,
                columns: 80,
                x_pixels: 0,
                y_pixels: 0,
            }),
        })
    }

    /// Read on the primary end: program output.
    pub fn primary_read(&self, out: &mut [u8]) -> (usize, PipeStatus) {
        self.output.try_read(out)
    }

    /// Write on the primary end: becomes secondary input.
    pub fn primary_write(&self, data: &[u8]) -> (usize, PipeStatus) {
        self.input.try_write(data)
    }

    /// Read on the secondary end.
    pub fn secondary_read(&self, out: &mut [u8]) -> (usize, PipeStatus) {
        self.input.try_read(out)
    }

    /// Write on the secondary end.
    pub fn secondary_write(&self, data: &[u8]) -> (usize, PipeStatus) {
        self.output.try_write(data)
    }

    pub fn termios(&self) -> Termios {
        *self.termios.lock()
    }

    pub fn set_termios(&self, new: Termios) {
        *self.termios.lock() = new;
    }

    pub fn window_size(&self) -> WindowSize {
        *self.winsize.lock()
    }

    pub fn set_window_size(&self, new: WindowSize) {
        *self.winsize.lock() = new;
    }

    /// Wait until the primary has drained pending output.
    fn drain_output(&self) {
        while self.output.buffered() > 0 {
            crate::task::sched::yield_now();
        }
    }

    /// Discard not-yet-read input.
    fn flush_input(&self) {
        let mut sink = [0u8; 64];
        while self.input.buffered() > 0 {
            let (n, _) = self.input.try_read(&mut sink);
            if n == 0 {
                break;
            }
        }
    }

    /// The tc* ioctl surface, shared by both ends. `arg_*` callbacks
    /// move the fixed-layout structs across the user boundary.
    pub fn io_control(
        &self,
        request: u64,
        read_termios: &mut dyn FnMut() -> KResult<Termios>,
        write_termios: &mut dyn FnMut(Termios) -> KResult<()>,
        read_winsize: &mut dyn FnMut() -> KResult<WindowSize>,
        write_winsize: &mut dyn FnMut(WindowSize) -> KResult<()>,
    ) -> KResult<u64> {
        match request {
            TCGETS => {
                write_termios(self.termios())?;
                Ok(0)
            }
            TCSETS => {
                self.set_termios(read_termios()?);
                Ok(0)
            }
            TCSETSW => {
                self.drain_output();
                self.set_termios(read_termios()?);
                Ok(0)
            }
            TCSETSF => {
                self.drain_output();
                self.flush_input();
                self.set_termios(read_termios()?);
                Ok(0)
            }
            TIOCGWINSZ => {
                write_winsize(self.window_size())?;
                Ok(0)
            }
            TIOCSWINSZ => {
                self.set_window_size(read_winsize()?);
                Ok(0)
            }
            _ => Err(Errno::NotATty),
        }
    }

    /// Readiness of the primary end.
    pub fn primary_poll(&self) -> PollStatus {
        PollStatus {
            can_read: self.output.buffered() > 0,
            can_write: self.input.buffered() < super::fifo::FIFO_CAPACITY,
            is_error: false,
            is_broken: false,
        }
    }

    /// Readiness of the secondary end.
    pub fn secondary_poll(&self) -> PollStatus {
        PollStatus {
            can_read: self.input.buffered() > 0,
            can_write: self.output.buffered() < super::fifo::FIFO_CAPACITY,
            is_error: false,
            is_broken: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ends_are_cross_wired() {
        let pty = Pty::new();
        assert_eq!(pty.primary_write(b"ls\n").0, 3);

        let mut buf = [0u8; 8];
        let (n, _) = pty.secondary_read(&mut buf);
        assert_eq!(&buf[..n], b"ls\n");

        assert_eq!(pty.secondary_write(b"file").0, 4);
        let (n, _) = pty.primary_read(&mut buf);
        assert_eq!(&buf[..n], b"file");
    }

    #[test]
    fn termios_get_set_roundtrip() {
        let pty = Pty::new();
        let mut t = pty.termios();
        t.local_flags &= !0x8; // drop ECHO
        t.input_speed = 115200;
        pty.set_termios(t);
        assert_eq!(pty.termios(), t);
    }

    #[test]
    fn window_size_roundtrip_via_ioctl() {
        let pty = Pty::new();
        let wanted = WindowSize {
            rows: 50,
            columns: 132,
            x_pixels: 0,
            y_pixels: 0,
        };

        let mut seen = WindowSize::default();
        let r = pty.io_control(
            TIOCSWINSZ,
            &mut || unreachable!(),
            &mut |_| unreachable!(),
            &mut || Ok(wanted),
            &mut |_| unreachable!(),
        );
        assert_eq!(r, Ok(0));

        let r = pty.io_control(
            TIOCGWINSZ,
            &mut || unreachable!(),
            &mut |_| unreachable!(),
            &mut || unreachable!(),
            &mut |w| {
                seen = w;
                Ok(())
            },
        );
        assert_eq!(r, Ok(0));
        assert_eq!(seen, wanted);
    }

    #[test]
    fn unknown_ioctl_is_not_a_tty_request() {
        let pty = Pty::new();
        let r = pty.io_control(
            0xBEEF,
            &mut || unreachable!(),
            &mut |_| unreachable!(),
            &mut || unreachable!(),
            &mut |_| unreachable!(),
        );
        assert_eq!(r, Err(Errno::NotATty));
    }
}
