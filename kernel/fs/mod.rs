//! Filesystem layer: shared types
//!
//! The typed status every driver operation returns, the fixed on-wire
//! layouts handed to userland (`Stat`, `DirEntry`), and the mode
//! constants. The errno translation for `FsStatus` lives here so the
//! syscall layer never interprets driver statuses itself.

pub mod ext;
pub mod fat;
pub mod fd;
pub mod mount;
pub mod path;
pub mod qnx;
pub mod syscall;
pub mod vfs;

use crate::error::Errno;

/// Status of a filesystem driver operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsStatus {
    Success,
    /// Malformed argument (bad inode number, bad offset).
    InvalidValue,
    /// The driver does not implement this operation.
    NotSupported,
    /// Write-side operation on a read-only filesystem.
    RoFailure,
    /// The underlying device failed.
    IoFailure,
    /// Caller lacks rights on the object.
    NotAllowed,
}

impl From<FsStatus> for Errno {
    fn from(status: FsStatus) -> Errno {
        match status {
            FsStatus::Success => Errno::NoError,
            FsStatus::InvalidValue => Errno::InvalidValue,
            FsStatus::NotSupported => Errno::NotImplemented,
            FsStatus::RoFailure => Errno::ReadOnlyFs,
            FsStatus::IoFailure => Errno::Io,
            FsStatus::NotAllowed => Errno::BadAccess,
        }
    }
}

/// Shorthand: map a non-success status to `Err`.
pub fn fs_result(status: FsStatus) -> Result<(), Errno> {
    match status {
        FsStatus::Success => Ok(()),
        other => Err(other.into()),
    }
}

// ---------------------------------------------------------------------------
// Mode bits
// ---------------------------------------------------------------------------

/// Permission mask (low twelve bits of `mode`).
pub const MODE_PERM_MASK: u32 = 0o7777;

pub const IFREG: u32 = 0o100000;
pub const IFDIR: u32 = 0o040000;
pub const IFLNK: u32 = 0o120000;
pub const IFCHR: u32 = 0o020000;
pub const IFBLK: u32 = 0o060000;
pub const IFIFO: u32 = 0o010000;
pub const ISOCK: u32 = 0o140000;

const IFMT: u32 = 0o170000;

/// File type extracted from a mode word.
pub fn mode_type(mode: u32) -> u32 {
    mode & IFMT
}

// ---------------------------------------------------------------------------
// Stat
// ---------------------------------------------------------------------------

/// Seconds/nanoseconds pair in the stat layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TimeSpec {
    pub seconds: u64,
    pub nanoseconds: u64,
}

/// The stat record returned to userland. Fixed layout.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Stat {
    pub device: u64,
    pub inode: u64,
    pub mode: u32,
    pub link_count: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdevice: u64,
    pub byte_size: u64,
    pub access_time: TimeSpec,
    pub modify_time: TimeSpec,
    pub change_time: TimeSpec,
    pub block_size: u64,
    pub block_count: u64,
}

// ---------------------------------------------------------------------------
// Directory entries
// ---------------------------------------------------------------------------

/// Directory entry type codes.
pub const DT_REG: u8 = 1;
pub const DT_DIR: u8 = 2;
pub const DT_LNK: u8 = 3;
pub const DT_CHR: u8 = 4;
pub const DT_BLK: u8 = 5;

/// Bytes reserved for a directory entry name, NUL padding included.
pub const DIRENT_NAME_LEN: usize = 60;

/// The fixed-layout record `getdents` writes per entry.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DirEntry {
    pub d_ino: u64,
    pub d_off: u64,
    pub d_reclen: u64,
    pub d_type: u8,
    pub d_name: [u8; DIRENT_NAME_LEN],
}

impl DirEntry {
    /// Build an entry, truncating the name to the fixed buffer.
    pub fn new(ino: u64, off: u64, kind: u8, name: &str) -> Self {
        let mut d_name = [0u8; DIRENT_NAME_LEN];
        let bytes = name.as_bytes();
        let n = bytes.len().min(DIRENT_NAME_LEN - 1);
        d_name[..n].copy_from_slice(&bytes[..n]);
        Self {
            d_ino: ino,
            d_off: off,
            d_reclen: ::core::mem::size_of::<DirEntry>() as u64,
            d_type: kind,
            d_name,
        }
    }

    /// Entry type for a mode word.
    pub fn type_for_mode(mode: u32) -> u8 {
        match mode_type(mode) {
            IFDIR => DT_DIR,
            IFLNK => DT_LNK,
            IFCHR => DT_CHR,
            IFBLK => DT_BLK,
            _ => DT_REG,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_translation_table() {
        assert_eq!(Errno::from(FsStatus::Success), Errno::NoError);
        assert_eq!(Errno::from(FsStatus::NotSupported), Errno::NotImplemented);
        assert_eq!(Errno::from(FsStatus::RoFailure), Errno::ReadOnlyFs);
        assert_eq!(Errno::from(FsStatus::NotAllowed), Errno::BadAccess);
    }

    #[test]
    fn mode_type_extraction() {
        assert_eq!(mode_type(IFREG | 0o644), IFREG);
        assert_eq!(mode_type(IFDIR | 0o755), IFDIR);
        assert_eq!((IFLNK | 0o777) & MODE_PERM_MASK, 0o777);
    }

    #[test]
    fn dirent_name_is_nul_padded() {
        let e = DirEntry::new(5, 1, DT_REG, "hello.txt");
        assert_eq!(&e.d_name[..9], b"hello.txt");
        assert!(e.d_name[9..].iter().all(|&b| b == 0));
        assert_eq!(e.d_reclen as usize, ::core::mem::size_of::<DirEntry>());
    }

    #[test]
    fn dirent_name_truncates() {
        let long = "x".repeat(100);
        let e = DirEntry::new(1, 0, DT_REG, &long);
        assert_eq!(e.d_name[DIRENT_NAME_LEN - 1], 0);
        assert!(e.d_name[..DIRENT_NAME_LEN - 1].iter().all(|&b| b == b'x'));
    }
}
