//! System-wide information
//!
//! The hostname registry, the uname record, and the scalar values
//! behind sysconf. List requests (processes, mounts) are filled by
//! the syscall layer from the respective tables; the fixed layouts
//! live here.

use alloc::string::String;

use spin::RwLock;

/// Longest accepted hostname.
pub const HOST_NAME_MAX: usize = 64;

/// Bytes per field of the uname record.
pub const UTS_FIELD_LEN: usize = 65;

static HOSTNAME: RwLock<Option<String>> = RwLock::new(None);

/// Default node name before anyone set one.
const DEFAULT_HOSTNAME: &str = "kestrel";

/// Set the hostname. Fails (false) when the name exceeds the bound.
pub fn set_hostname(name: &str) -> bool {
    if name.len() > HOST_NAME_MAX {
        return false;
    }
    *HOSTNAME.write() = Some(String::from(name));
    true
}

/// The current hostname.
pub fn hostname() -> String {
    HOSTNAME
        .read()
        .clone()
        .unwrap_or_else(|| String::from(DEFAULT_HOSTNAME))
}

/// The uname record, each field NUL-terminated in a fixed buffer.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct UtsName {
    pub sysname: [u8; UTS_FIELD_LEN],
    pub nodename: [u8; UTS_FIELD_LEN],
    pub release: [u8; UTS_FIELD_LEN],
    pub version: [u8; UTS_FIELD_LEN],
    pub machine: [u8; UTS_FIELD_LEN],
}

fn fill_field(field: &mut [u8; UTS_FIELD_LEN], value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(UTS_FIELD_LEN - 1);
    field[..n].copy_from_slice(&bytes[..n]);
    field[n..].fill(0);
}

/// Assemble the current uname record.
pub fn uname() -> UtsName {
    let mut uts = UtsName {
        sysname: [0; UTS_FIELD_LEN],
        nodename: [0; UTS_FIELD_LEN],
        release: [0; UTS_FIELD_LEN],
        version: [0; UTS_FIELD_LEN],
        machine: [0; UTS_FIELD_LEN],
    };
    fill_field(&mut uts.sysname, "kestrel");
    fill_field(&mut uts.nodename, &hostname());
    fill_field(&mut uts.release, env!("CARGO_PKG_VERSION"));
    fill_field(&mut uts.version, "kestrel");
    #[cfg(target_arch = "x86_64")]
    fill_field(&mut uts.machine, "x86_64");
    #[cfg(target_arch = "riscv64")]
    fill_field(&mut uts.machine, "riscv64");
    uts
}

/// Scalar sysconf requests.
pub const SC_PAGESIZE: u64 = 1;
pub const SC_OPEN_MAX: u64 = 2;
pub const SC_HOST_NAME_MAX: u64 = 3;
pub const SC_PHYS_PAGES: u64 = 4;
pub const SC_NPROC_ONLN: u64 = 5;
/// Array fills.
pub const SC_LIST_PROCS: u64 = 6;
pub const SC_LIST_MOUNTS: u64 = 7;
pub const SC_UNAME: u64 = 8;

/// One row of the process listing.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ProcListEntry {
    pub pid: u32,
    pub parent: u32,
    pub uid: u32,
    pub flags: u32,
    pub identifier: [u8; 32],
}

/// One row of the mount listing.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MountListEntry {
    pub kind: u32,
    _pad: u32,
    pub device: [u8; 64],
    pub path: [u8; 64],
}

impl ProcListEntry {
    pub fn new(pid: u32, parent: u32, uid: u32, exited: bool, identifier: &str) -> Self {
        let mut ident = [0u8; 32];
        let bytes = identifier.as_bytes();
        let n = bytes.len().min(31);
        ident[..n].copy_from_slice(&bytes[..n]);
        Self {
            pid,
            parent,
            uid,
            flags: if exited { 1 } else { 0 },
            identifier: ident,
        }
    }
}

impl MountListEntry {
    pub fn new(kind: u32, device: &str, path: &str) -> Self {
        let mut entry = Self {
            kind,
            _pad: 0,
            device: [0; 64],
            path: [0; 64],
        };
        let n = device.len().min(63);
        entry.device[..n].copy_from_slice(&device.as_bytes()[..n]);
        let n = path.len().min(63);
        entry.path[..n].copy_from_slice(&path.as_bytes()[..n]);
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The hostname is global state, so its cases run as one test.
    #[test]
    fn hostname_bounds_and_uname_roundtrip() {
        let long = "h".repeat(HOST_NAME_MAX + 1);
        assert!(!set_hostname(&long));

        assert!(set_hostname("testbox"));
        let uts = uname();
        assert_eq!(&uts.nodename[..7], b"testbox");
        assert_eq!(uts.nodename[7], 0);
        assert_eq!(hostname(), "testbox");
    }

    #[test]
    fn uname_fields_are_terminated() {
        let uts = uname();
        assert_eq!(&uts.sysname[..7], b"kestrel");
        assert!(uts.sysname.contains(&0));
        assert!(uts.machine.contains(&0));
    }
}
