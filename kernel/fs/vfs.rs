//! VFS driver contract
//!
//! Every filesystem driver implements `Filesystem`. Paths handed to a
//! driver are relative to its mount point and already canonical;
//! inode numbers are driver-assigned and only meaningful within one
//! mount. Any operation a driver does not support keeps the default
//! `NotSupported` body, which the syscall layer translates uniformly.

use alloc::string::String;
use alloc::vec::Vec;

use super::{DirEntry, FsStatus, Stat, MODE_PERM_MASK};

/// The uniform per-filesystem operation set.
pub trait Filesystem: Send + Sync {
    /// Release driver state; called with the mount row already gone.
    fn unmount(&self) {}

    /// Resolve a mount-relative path to an inode number.
    fn open(&self, _path: &str) -> Result<u64, FsStatus> {
        Err(FsStatus::NotSupported)
    }

    /// Release any per-open state for an inode.
    fn close(&self, _ino: u64) {}

    fn create_node(&self, _path: &str, _mode: u32) -> FsStatus {
        FsStatus::NotSupported
    }

    fn create_symbolic_link(&self, _path: &str, _target: &str) -> FsStatus {
        FsStatus::NotSupported
    }

    fn create_hard_link(&self, _path: &str, _target: &str) -> FsStatus {
        FsStatus::NotSupported
    }

    fn rename(&self, _from: &str, _to: &str) -> FsStatus {
        FsStatus::NotSupported
    }

    fn unlink(&self, _path: &str) -> FsStatus {
        FsStatus::NotSupported
    }

    /// Append the entries of directory `ino` starting at `offset`.
    fn read_entries(
        &self,
        _ino: u64,
        _offset: u64,
        _entries: &mut Vec<DirEntry>,
    ) -> FsStatus {
        FsStatus::NotSupported
    }

    fn read_symbolic_link(&self, _ino: u64, _target: &mut String) -> FsStatus {
        FsStatus::NotSupported
    }

    fn read(&self, _ino: u64, _offset: u64, _buf: &mut [u8]) -> Result<usize, FsStatus> {
        Err(FsStatus::NotSupported)
    }

    fn write(&self, _ino: u64, _offset: u64, _data: &[u8]) -> Result<usize, FsStatus> {
        Err(FsStatus::NotSupported)
    }

    fn stat(&self, _ino: u64) -> Result<Stat, FsStatus> {
        Err(FsStatus::NotSupported)
    }

    fn truncate(&self, _ino: u64, _size: u64) -> FsStatus {
        FsStatus::NotSupported
    }

    fn io_control(&self, _ino: u64, _request: u64, _argument: u64) -> Result<u64, FsStatus> {
        Err(FsStatus::NotSupported)
    }

    /// Flush everything the driver holds.
    fn synchronize(&self) -> FsStatus {
        FsStatus::NotSupported
    }

    /// Flush one inode.
    fn synchronize_inode(&self, _ino: u64) -> FsStatus {
        FsStatus::NotSupported
    }

    fn change_mode(&self, _ino: u64, _mode: u32) -> FsStatus {
        FsStatus::NotSupported
    }

    fn change_owner(&self, _ino: u64, _uid: u32, _gid: u32) -> FsStatus {
        FsStatus::NotSupported
    }
}

/// Apply a umask to a requested creation mode: the permission bits in
/// the mask are removed, the type bits pass through.
pub fn apply_umask(mode: u32, umask: u32) -> u32 {
    mode & !(umask & MODE_PERM_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Inert;
    impl Filesystem for Inert {}

    #[test]
    fn defaults_are_not_supported() {
        let fs = Inert;
        assert_eq!(fs.unlink("/x"), FsStatus::NotSupported);
        assert_eq!(fs.truncate(1, 0), FsStatus::NotSupported);
        assert!(matches!(fs.open("/x"), Err(FsStatus::NotSupported)));
        assert!(matches!(fs.stat(1), Err(FsStatus::NotSupported)));
    }

    #[test]
    fn umask_strips_permission_bits_only() {
        assert_eq!(apply_umask(0o100666, 0o022), 0o100644);
        assert_eq!(apply_umask(0o40777, 0o077), 0o40700);
        // Type bits survive even a full mask
        assert_eq!(apply_umask(0o100644, 0o7777), 0o100000);
    }
}
