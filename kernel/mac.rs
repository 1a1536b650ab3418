//! Mandatory access control
//!
//! Every process carries a capability bitset, a bounded list of
//! path-prefix permissions, and an enforcement mode. Capabilities only
//! ever shrink: a process may clear bits from its own set but never
//! add one. The permission list grows one entry at a time and is
//! consulted by `open` and the VFS-facing syscalls.

use alloc::string::String;
use alloc::vec::Vec;

bitflags::bitflags! {
    /// Privileged operations a process may perform.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// Alter scheduling parameters (clusters, deadlines).
        const SCHED = 1 << 0;
        /// Create processes.
        const SPAWN = 1 << 1;
        /// Read the entropy pool.
        const ENTROPY = 1 << 2;
        /// Privileged memory operations (device mmap).
        const SYS_MEM = 1 << 3;
        /// Use network sockets.
        const USE_NET = 1 << 4;
        /// Administer network state (hostname).
        const SYS_NET = 1 << 5;
        /// Mount and unmount filesystems.
        const SYS_MNT = 1 << 6;
        /// Power control (reboot, halt).
        const SYS_PWR = 1 << 7;
        /// Trace other processes.
        const PTRACE = 1 << 8;
        /// Change credentials.
        const SETUID = 1 << 9;
        /// Administer MAC state of other processes.
        const SYS_MAC = 1 << 10;
    }
}

bitflags::bitflags! {
    /// Per-path-prefix access rights.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u32 {
        /// Access files beneath the prefix (directory traversal).
        const CONTENTS = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXEC = 1 << 3;
        const APPEND = 1 << 4;
        const FLOCK = 1 << 5;
        /// Open device nodes beneath the prefix.
        const DEV = 1 << 6;
    }
}

/// What happens when a check fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcement {
    /// Fail the call with bad-access.
    Deny,
    /// Fail the call and log the violation.
    DenyAndScream,
    /// Kill the offending process (exit code 42).
    Kill,
}

/// One path-prefix permission grant.
#[derive(Debug, Clone)]
pub struct PermissionEntry {
    pub prefix: String,
    pub rights: Permissions,
}

/// Upper bound on permission list entries per process.
pub const MAX_PERMISSION_ENTRIES: usize = 32;

/// The MAC state carried by each process.
#[derive(Debug, Clone)]
pub struct MacState {
    pub capabilities: Capabilities,
    pub permissions: Vec<PermissionEntry>,
    pub enforcement: Enforcement,
}

impl MacState {
    /// Full rights: PID 1 and the boot path start here.
    pub fn full() -> Self {
        Self {
            capabilities: Capabilities::all(),
            permissions: alloc::vec![PermissionEntry {
                prefix: String::from("/"),
                rights: Permissions::all(),
            }],
            enforcement: Enforcement::Deny,
        }
    }

    /// Empty rights.
    pub fn empty() -> Self {
        Self {
            capabilities: Capabilities::empty(),
            permissions: Vec::new(),
            enforcement: Enforcement::Deny,
        }
    }

    /// Whether the process holds `cap`.
    pub fn has_capability(&self, cap: Capabilities) -> bool {
        self.capabilities.contains(cap)
    }

    /// Restrict the capability set. Transitions are clear-only: bits
    /// absent from `new` are dropped, bits not already held are NOT
    /// acquired.
    pub fn restrict_capabilities(&mut self, new: Capabilities) {
        self.capabilities &= new;
    }

    /// Append one permission grant.
    pub fn add_permission(&mut self, prefix: String, rights: Permissions) -> bool {
        if self.permissions.len() >= MAX_PERMISSION_ENTRIES {
            return false;
        }
        self.permissions.push(PermissionEntry { prefix, rights });
        true
    }

    /// Rights granted for `path`: the union of every matching prefix.
    pub fn rights_for(&self, path: &str) -> Permissions {
        let mut rights = Permissions::empty();
        for entry in &self.permissions {
            if path_has_prefix(path, &entry.prefix) {
                rights |= entry.rights;
            }
        }
        rights
    }

    /// Check `wanted` against the list for `path`.
    pub fn check_path(&self, path: &str, wanted: Permissions) -> bool {
        self.rights_for(path).contains(wanted)
    }
}

/// Prefix match on path-component boundaries: `/usr` covers
/// `/usr/bin` but not `/usrlocal`.
fn path_has_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    if let Some(rest) = path.strip_prefix(prefix) {
        rest.is_empty() || rest.starts_with('/')
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_only_shrink() {
        let mut mac = MacState::empty();
        mac.capabilities = Capabilities::SPAWN | Capabilities::SYS_NET;

        // Attempt to keep SPAWN and gain SYS_PWR
        mac.restrict_capabilities(Capabilities::SPAWN | Capabilities::SYS_PWR);
        assert_eq!(mac.capabilities, Capabilities::SPAWN);

        mac.restrict_capabilities(Capabilities::empty());
        assert!(mac.capabilities.is_empty());
    }

    #[test]
    fn prefix_matching_respects_components() {
        assert!(path_has_prefix("/usr/bin/ls", "/usr"));
        assert!(path_has_prefix("/usr", "/usr"));
        assert!(!path_has_prefix("/usrlocal", "/usr"));
        assert!(path_has_prefix("/anything", "/"));
    }

    #[test]
    fn rights_union_over_matches() {
        let mut mac = MacState::empty();
        assert!(mac.add_permission(String::from("/data"), Permissions::READ));
        assert!(mac.add_permission(
            String::from("/data/logs"),
            Permissions::WRITE | Permissions::APPEND
        ));

        assert!(mac.check_path("/data/logs/today", Permissions::READ | Permissions::WRITE));
        assert!(!mac.check_path("/data/other", Permissions::WRITE));
        assert!(!mac.check_path("/etc", Permissions::READ));
    }

    #[test]
    fn permission_list_is_bounded() {
        let mut mac = MacState::empty();
        for i in 0..MAX_PERMISSION_ENTRIES {
            assert!(mac.add_permission(alloc::format!("/p{}", i), Permissions::READ));
        }
        assert!(!mac.add_permission(String::from("/overflow"), Permissions::READ));
    }

    #[test]
    fn full_state_grants_everything() {
        let mac = MacState::full();
        assert!(mac.has_capability(Capabilities::SYS_MNT));
        assert!(mac.check_path("/dev/ramdev0", Permissions::DEV | Permissions::READ));
    }
}
