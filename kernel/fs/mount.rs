//! Mount table
//!
//! A bounded array of five rows behind one binary semaphore. Each row
//! pairs a device with a probed filesystem driver and the absolute
//! path it is mounted on. At most one row per device. Path dispatch
//! picks the longest mount-path prefix of the looked-up path.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{Errno, KResult};
use crate::sync::IrqLock;

use super::path::{is_canonical, PATH_MAX};
use super::vfs::Filesystem;

/// Maximum simultaneously mounted filesystems.
pub const MAX_MOUNTS: usize = 5;

/// Filesystem kinds, as exposed through the mount syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MountKind {
    Ext = 1,
    Fat = 2,
    Qnx = 3,
}

impl MountKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Ext),
            2 => Some(Self::Fat),
            3 => Some(Self::Qnx),
            _ => None,
        }
    }
}

/// Index of a row in the mount table.
pub type FsHandle = usize;

/// One mounted filesystem.
pub struct MountRow {
    pub device: String,
    pub kind: MountKind,
    pub fs: Arc<dyn Filesystem>,
    pub path: String,
}

/// The table proper. Logic lives here; the global instance sits
/// behind `MOUNTS`.
pub struct MountTable {
    rows: [Option<MountRow>; MAX_MOUNTS],
}

impl MountTable {
    pub const fn new() -> Self {
        Self {
            rows: [None, None, None, None, None],
        }
    }

    /// Insert a mount. Fails when the table is full, the path is not
    /// canonical/bounded, or the device is already mounted.
    pub fn insert(
        &mut self,
        device: String,
        kind: MountKind,
        fs: Arc<dyn Filesystem>,
        path: String,
    ) -> KResult<FsHandle> {
        if path.len() > PATH_MAX || !is_canonical(&path) {
            return Err(Errno::InvalidValue);
        }
        if self
            .rows
            .iter()
            .flatten()
            .any(|row| row.device == device)
        {
            return Err(Errno::Busy);
        }
        let slot = self
            .rows
            .iter()
            .position(|row| row.is_none())
            .ok_or(Errno::TooManyFiles)?;
        self.rows[slot] = Some(MountRow {
            device,
            kind,
            fs,
            path,
        });
        Ok(slot)
    }

    /// Longest mount-path prefix of `path`, with the matched length.
    pub fn get_mount(&self, path: &str) -> Option<(FsHandle, usize)> {
        let mut best: Option<(FsHandle, usize)> = None;
        for (slot, row) in self.rows.iter().enumerate() {
            let Some(row) = row else { continue };
            // Rows that are not a prefix of the path just drop out of
            // the race.
            let Some(matched) = mount_prefix_len(path, &row.path) else {
                continue;
            };
            if matched == 0 {
                continue;
            }
            if best.map(|(_, len)| matched > len).unwrap_or(true) {
                best = Some((slot, matched));
            }
        }
        best
    }

    /// The driver at a handle.
    pub fn fs(&self, handle: FsHandle) -> Option<Arc<dyn Filesystem>> {
        self.rows
            .get(handle)
            .and_then(|r| r.as_ref())
            .map(|r| r.fs.clone())
    }

    /// Remove the mount at `path`.
    ///
    /// Without `force`, a driver that refuses to unmount keeps the
    /// row; with `force` the row goes regardless.
    pub fn remove(&mut self, path: &str, force: bool) -> KResult<()> {
        let slot = self
            .rows
            .iter()
            .position(|row| row.as_ref().map(|r| r.path == path).unwrap_or(false))
            .ok_or(Errno::NoEntity)?;

        if !force && self.rows[slot].as_ref().map(|r| r.path == "/").unwrap_or(false) {
            return Err(Errno::Busy);
        }

        let row = self.rows[slot].take().expect("slot checked above");
        row.fs.unmount();
        Ok(())
    }

    /// Snapshot for the sysconf mount listing.
    pub fn list(&self) -> Vec<(String, MountKind, String)> {
        self.rows
            .iter()
            .flatten()
            .map(|r| (r.device.clone(), r.kind, r.path.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Length of `mount_path` as a prefix of `path` on component
/// boundaries; `None` when it is not a prefix.
fn mount_prefix_len(path: &str, mount_path: &str) -> Option<usize> {
    if mount_path == "/" {
        return if path.starts_with('/') { Some(1) } else { None };
    }
    let rest = path.strip_prefix(mount_path)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(mount_path.len())
    } else {
        None
    }
}

static MOUNTS: IrqLock<MountTable> = IrqLock::new(MountTable::new());

/// Mount `device` at `path`.
///
/// With a kind, only that driver is probed. Without one, EXT then FAT
/// are tried in order.
pub fn mount(device_name: &str, path: &str, kind: Option<MountKind>) -> KResult<FsHandle> {
    let device = crate::devices::lookup(device_name).ok_or(Errno::NoEntity)?;
    if !device.is_block() {
        return Err(Errno::InvalidValue);
    }

    let probed = match kind {
        Some(MountKind::Ext) => super::ext::probe(&device).map(|fs| (MountKind::Ext, fs)),
        Some(MountKind::Fat) => super::fat::probe(&device).map(|fs| (MountKind::Fat, fs)),
        Some(MountKind::Qnx) => super::qnx::probe(&device).map(|fs| (MountKind::Qnx, fs)),
        None => super::ext::probe(&device)
            .map(|fs| (MountKind::Ext, fs))
            .or_else(|| super::fat::probe(&device).map(|fs| (MountKind::Fat, fs))),
    };
    let (kind, fs) = probed.ok_or(Errno::InvalidValue)?;

    MOUNTS
        .lock()
        .insert(String::from(device_name), kind, fs, String::from(path))
}

/// Unmount the filesystem at `path`.
pub fn unmount(path: &str, force: bool) -> KResult<()> {
    MOUNTS.lock().remove(path, force)
}

/// Resolve an absolute path to `(handle, driver, mount-relative path)`.
pub fn resolve(path: &str) -> KResult<(FsHandle, Arc<dyn Filesystem>, String)> {
    let mounts = MOUNTS.lock();
    let (handle, matched) = mounts.get_mount(path).ok_or(Errno::NoEntity)?;
    let fs = mounts.fs(handle).ok_or(Errno::NoEntity)?;
    let mut rest = &path[matched..];
    if rest.is_empty() {
        rest = "/";
    }
    let relative = if rest.starts_with('/') {
        String::from(rest)
    } else {
        let mut s = String::from("/");
        s.push_str(rest);
        s
    };
    Ok((handle, fs, relative))
}

/// Driver for an existing handle.
pub fn fs_for(handle: FsHandle) -> KResult<Arc<dyn Filesystem>> {
    MOUNTS.lock().fs(handle).ok_or(Errno::BadFile)
}

/// Snapshot of the table for listings.
pub fn list() -> Vec<(String, MountKind, String)> {
    MOUNTS.lock().list()
}

/// Fan a synchronize call out to every mounted driver.
pub fn synchronize_all() {
    let drivers: Vec<Arc<dyn Filesystem>> = {
        let mounts = MOUNTS.lock();
        (0..MAX_MOUNTS).filter_map(|i| mounts.fs(i)).collect()
    };
    for fs in drivers {
        let _ = fs.synchronize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FsStatus;

    struct Stub;
    impl Filesystem for Stub {
        fn synchronize(&self) -> FsStatus {
            FsStatus::Success
        }
    }

    fn stub() -> Arc<dyn Filesystem> {
        Arc::new(Stub)
    }

    #[test]
    fn one_row_per_device() {
        let mut table = MountTable::new();
        table
            .insert(String::from("ramdev0"), MountKind::Ext, stub(), String::from("/"))
            .unwrap();
        let again = table.insert(
            String::from("ramdev0"),
            MountKind::Fat,
            stub(),
            String::from("/mnt"),
        );
        assert_eq!(again, Err(Errno::Busy));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn table_is_bounded() {
        let mut table = MountTable::new();
        for i in 0..MAX_MOUNTS {
            table
                .insert(
                    alloc::format!("dev{}", i),
                    MountKind::Ext,
                    stub(),
                    alloc::format!("/m{}", i),
                )
                .unwrap();
        }
        let overflow = table.insert(
            String::from("extra"),
            MountKind::Ext,
            stub(),
            String::from("/overflow"),
        );
        assert_eq!(overflow, Err(Errno::TooManyFiles));
    }

    #[test]
    fn longest_prefix_wins() {
        let mut table = MountTable::new();
        let root = table
            .insert(String::from("d0"), MountKind::Ext, stub(), String::from("/"))
            .unwrap();
        let mnt = table
            .insert(String::from("d1"), MountKind::Fat, stub(), String::from("/mnt"))
            .unwrap();
        let deep = table
            .insert(
                String::from("d2"),
                MountKind::Ext,
                stub(),
                String::from("/mnt/deep"),
            )
            .unwrap();

        assert_eq!(table.get_mount("/etc/fstab"), Some((root, 1)));
        assert_eq!(table.get_mount("/mnt/file"), Some((mnt, 4)));
        assert_eq!(table.get_mount("/mnt/deep/file"), Some((deep, 9)));
        // Component boundary: /mntx is not under /mnt
        assert_eq!(table.get_mount("/mntx"), Some((root, 1)));
    }

    #[test]
    fn non_canonical_mount_path_rejected() {
        let mut table = MountTable::new();
        let r = table.insert(
            String::from("d0"),
            MountKind::Ext,
            stub(),
            String::from("/mnt/"),
        );
        assert_eq!(r, Err(Errno::InvalidValue));
        let r = table.insert(
            String::from("d0"),
            MountKind::Ext,
            stub(),
            String::from("relative"),
        );
        assert_eq!(r, Err(Errno::InvalidValue));
    }

    #[test]
    fn remove_frees_the_row() {
        let mut table = MountTable::new();
        table
            .insert(String::from("d0"), MountKind::Ext, stub(), String::from("/mnt"))
            .unwrap();
        table.remove("/mnt", false).unwrap();
        assert!(table.is_empty());
        // Device can be mounted again afterwards
        table
            .insert(String::from("d0"), MountKind::Ext, stub(), String::from("/mnt"))
            .unwrap();
    }

    #[test]
    fn slot_reuse_after_remove() {
        let mut table = MountTable::new();
        table
            .insert(String::from("d0"), MountKind::Ext, stub(), String::from("/a"))
            .unwrap();
        table
            .insert(String::from("d1"), MountKind::Ext, stub(), String::from("/b"))
            .unwrap();
        table.remove("/a", false).unwrap();
        let handle = table
            .insert(String::from("d2"), MountKind::Ext, stub(), String::from("/c"))
            .unwrap();
        assert_eq!(handle, 0);
    }
}
