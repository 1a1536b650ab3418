//! Unified kernel error type
//!
//! `Errno` uses `#[repr(i64)]` so the discriminant IS the value handed
//! back to userland in the errno register. Subsystems with their own
//! status enums (filesystems, pipes, sockets) convert at the syscall
//! boundary via `From` impls kept next to those enums.

/// Kernel error type returned through the syscall errno register.
///
/// `NoError` is the success value; a syscall that fails returns
/// all-ones in the value register and one of the other variants here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum Errno {
    /// Operation completed
    NoError = 0,
    /// Bad file descriptor
    BadFile = 1,
    /// Access denied (permissions or MAC)
    BadAccess = 2,
    /// No child processes to wait for
    Child = 3,
    /// Device or filesystem I/O failure
    Io = 4,
    /// Seek on an unseekable descriptor
    InvalidSeek = 5,
    /// Invalid argument
    InvalidValue = 6,
    /// ioctl on a descriptor that is not a terminal
    NotATty = 7,
    /// Per-process open file limit reached
    TooManyFiles = 8,
    /// Path or string argument exceeds the bounded buffer
    StringTooLong = 9,
    /// Userland pointer not mapped/accessible over the full span
    WouldFault = 10,
    /// Non-blocking operation would have blocked
    WouldBlock = 11,
    /// No such file, directory, or object
    NoEntity = 12,
    /// Allocation failure
    NoMemory = 13,
    /// Operation not implemented for this object
    NotImplemented = 14,
    /// Write to a read-only filesystem
    ReadOnlyFs = 15,
    /// Operation not permitted for the caller
    BadPermissions = 16,
    /// Write would exceed the file size limit
    FileTooBig = 17,
    /// Resource busy (mounted device, bound path)
    Busy = 18,
    /// Caller-supplied buffer too small for the result
    NotBigEnough = 19,
}

impl Errno {
    /// Raw errno value for the secondary return register.
    #[inline]
    pub const fn value(self) -> u64 {
        self as i64 as u64
    }
}

/// Syscall failure marker: all-ones in the value register.
pub const SYSCALL_FAILURE: u64 = u64::MAX;

/// Result alias used throughout the kernel.
pub type KResult<T> = Result<T, Errno>;

/// Pack a `KResult<u64>` into the `(value, errno)` register pair.
#[inline]
pub fn sysret(res: KResult<u64>) -> (u64, u64) {
    match res {
        Ok(v) => (v, Errno::NoError.value()),
        Err(e) => (SYSCALL_FAILURE, e.value()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_is_zero() {
        assert_eq!(Errno::NoError.value(), 0);
        assert_eq!(sysret(Ok(7)), (7, 0));
    }

    #[test]
    fn failure_is_all_ones() {
        let (v, e) = sysret(Err(Errno::WouldFault));
        assert_eq!(v, SYSCALL_FAILURE);
        assert_eq!(e, Errno::WouldFault.value());
    }

    #[test]
    fn errnos_are_distinct() {
        let all = [
            Errno::NoError,
            Errno::BadFile,
            Errno::BadAccess,
            Errno::Child,
            Errno::Io,
            Errno::InvalidSeek,
            Errno::InvalidValue,
            Errno::NotATty,
            Errno::TooManyFiles,
            Errno::StringTooLong,
            Errno::WouldFault,
            Errno::WouldBlock,
            Errno::NoEntity,
            Errno::NoMemory,
            Errno::NotImplemented,
            Errno::ReadOnlyFs,
            Errno::BadPermissions,
            Errno::FileTooBig,
            Errno::Busy,
            Errno::NotBigEnough,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.value(), b.value());
            }
        }
    }
}
