//! Process table
//!
//! Fixed-slot arena indexed by PID. A process owns its address space
//! (shared with its threads through an `Arc`), its descriptor table,
//! working directory, credentials, MAC state, and resource limits. A
//! process that exits stays in the arena as a zombie holding only its
//! exit code until the parent reaps it with `wait`.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Lazy;

use crate::error::{Errno, KResult};
use crate::fs::fd::FdTable;
use crate::mac::MacState;
use crate::mm::AddressSpace;
use crate::poll::PollStatus;
use crate::sync::IrqLock;

use super::{Pid, Tid, MAX_PROCESSES};

/// Per-resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Bound on the descriptor table.
    pub opened_files: usize,
    /// Largest offset a write may reach.
    pub file_size: u64,
    /// Bound on mapped user memory.
    pub memory_size: u64,
    /// Bound on the main stack mapping.
    pub stack_size: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            opened_files: 100,
            file_size: 128 * 1024 * 1024,
            memory_size: 512 * 1024 * 1024,
            stack_size: 1024 * 1024,
        }
    }
}

/// One process.
pub struct Process {
    pub pid: Pid,
    pub parent: Pid,
    pub space: Arc<AddressSpace>,
    pub fds: FdTable,
    pub cwd: String,
    pub effective_uid: u32,
    pub real_uid: u32,
    pub effective_gid: u32,
    pub real_gid: u32,
    pub mac: MacState,
    pub limits: Limits,
    pub umask: u32,
    /// Short human-readable name, as listed by sysconf.
    pub identifier: String,
    pub exit_code: u32,
    pub has_exited: bool,
    /// Writer-FIFO descriptor the tracer reads syscall frames from.
    pub tracer_fd: Option<usize>,
    /// Threads belonging to this process.
    pub threads: Vec<Tid>,
}

impl Process {
    /// A fresh process with full-boot defaults.
    pub fn fresh(pid: Pid, parent: Pid, space: Arc<AddressSpace>) -> Self {
        let limits = Limits::default();
        Self {
            pid,
            parent,
            space,
            fds: FdTable::new(limits.opened_files),
            cwd: String::from("/"),
            effective_uid: 0,
            real_uid: 0,
            effective_gid: 0,
            real_gid: 0,
            mac: MacState::full(),
            limits,
            umask: 0o022,
            identifier: String::new(),
            exit_code: 0,
            has_exited: false,
            tracer_fd: None,
            threads: Vec::new(),
        }
    }

    /// Clone for fork: duplicated descriptor table, inherited
    /// everything else, no threads yet.
    pub fn clone_for_fork(&self, pid: Pid, parent: Pid, space: Arc<AddressSpace>) -> Self {
        Self {
            pid,
            parent,
            space,
            fds: self.fds.duplicate(),
            cwd: self.cwd.clone(),
            effective_uid: self.effective_uid,
            real_uid: self.real_uid,
            effective_gid: self.effective_gid,
            real_gid: self.real_gid,
            mac: self.mac.clone(),
            limits: self.limits,
            umask: self.umask,
            identifier: self.identifier.clone(),
            exit_code: 0,
            has_exited: false,
            tracer_fd: self.tracer_fd,
            threads: Vec::new(),
        }
    }
}

/// The arena. Slot `i` holds PID `i + 1`.
pub struct ProcessTable {
    slots: Box<[Option<Process>]>,
}

impl ProcessTable {
    pub fn new() -> Self {
        let mut slots = alloc::vec::Vec::with_capacity(MAX_PROCESSES);
        slots.resize_with(MAX_PROCESSES, || None);
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    /// Reserve the lowest free PID. Returns 0 when the arena is full.
    pub fn allocate_pid(&self) -> Pid {
        for (slot, entry) in self.slots.iter().enumerate() {
            if entry.is_none() {
                return slot as Pid + 1;
            }
        }
        0
    }

    pub fn insert(&mut self, process: Process) -> KResult<Pid> {
        let pid = process.pid;
        if pid == 0 || pid as usize > MAX_PROCESSES {
            return Err(Errno::InvalidValue);
        }
        let slot = &mut self.slots[pid as usize - 1];
        if slot.is_some() {
            return Err(Errno::Busy);
        }
        *slot = Some(process);
        Ok(pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        if pid == 0 {
            return None;
        }
        self.slots.get(pid as usize - 1).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        if pid == 0 {
            return None;
        }
        self.slots.get_mut(pid as usize - 1).and_then(|s| s.as_mut())
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        if pid == 0 {
            return None;
        }
        self.slots.get_mut(pid as usize - 1).and_then(|s| s.take())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.slots.iter().flatten()
    }

    pub fn count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Mark a process exited: threads die, descriptors close, only
    /// the zombie record (exit code, parent link) stays.
    pub fn mark_exited(&mut self, pid: Pid, code: u32) -> Vec<Tid> {
        let Some(process) = self.get_mut(pid) else {
            return Vec::new();
        };
        process.has_exited = true;
        process.exit_code = code;
        process.fds = FdTable::new(1);
        core::mem::take(&mut process.threads)
    }

    /// Look for a reapable child of `parent`.
    ///
    /// `target` is a specific PID or -1 for any child. Returns
    /// `Ok(Some((pid, code)))` when a zombie was found (the record is
    /// removed), `Ok(None)` when children exist but none has exited,
    /// `Err(Child)` when no matching child exists at all.
    pub fn try_reap(&mut self, parent: Pid, target: i64) -> KResult<Option<(Pid, u32)>> {
        let mut has_match = false;
        let mut zombie = None;

        for process in self.iter() {
            if process.parent != parent {
                continue;
            }
            if target != -1 && process.pid as i64 != target {
                continue;
            }
            has_match = true;
            if process.has_exited {
                zombie = Some(process.pid);
                break;
            }
        }

        if let Some(pid) = zombie {
            let process = self.remove(pid).expect("zombie exists");
            // The page table dies with the record here, at reap time
            return Ok(Some((pid, process.exit_code)));
        }
        if has_match {
            Ok(None)
        } else {
            Err(Errno::Child)
        }
    }
}

static PROCS: Lazy<IrqLock<ProcessTable>> = Lazy::new(|| IrqLock::new(ProcessTable::new()));

/// Force initialization at boot.
pub fn init() {
    Lazy::force(&PROCS);
}

/// Run `f` against the locked process table.
pub fn with_procs<R>(f: impl FnOnce(&mut ProcessTable) -> R) -> R {
    let mut procs = PROCS.lock();
    f(&mut procs)
}

/// Run `f` against one process.
pub fn with_process<R>(pid: Pid, f: impl FnOnce(&mut Process) -> R) -> KResult<R> {
    with_procs(|procs| procs.get_mut(pid).map(f).ok_or(Errno::NoEntity))
}

/// PID of the process running on this core.
#[cfg(not(test))]
pub fn current_pid() -> Pid {
    crate::arch::percpu::current_core().current_pid
}

/// Test builds pin the "current" process explicitly.
#[cfg(test)]
pub static TEST_CURRENT_PID: ::core::sync::atomic::AtomicU32 =
    ::core::sync::atomic::AtomicU32::new(1);

#[cfg(test)]
pub fn current_pid() -> Pid {
    TEST_CURRENT_PID.load(::core::sync::atomic::Ordering::Relaxed)
}

/// TID of the thread running on this core.
#[cfg(not(test))]
pub fn current_tid() -> Tid {
    crate::arch::percpu::current_core().current_tid
}

#[cfg(test)]
pub fn current_tid() -> Tid {
    1
}

/// The address space of a process, shared out of the lock.
pub fn current_space(pid: Pid) -> KResult<Arc<AddressSpace>> {
    with_process(pid, |p| p.space.clone())
}

/// Poll readiness of one descriptor of `pid`.
pub fn descriptor_poll_status(pid: Pid, fd: usize) -> Option<PollStatus> {
    with_process(pid, |p| p.fds.get(fd).ok().map(|d| d.poll_status()))
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(pid: Pid, parent: Pid) -> Process {
        Process::fresh(pid, parent, Arc::new(AddressSpace::kernel()))
    }

    #[test]
    fn pids_allocate_lowest_first() {
        let mut table = ProcessTable::new();
        let a = table.allocate_pid();
        assert_eq!(a, 1);
        table.insert(fresh(a, 0)).unwrap();
        let b = table.allocate_pid();
        assert_eq!(b, 2);
        table.insert(fresh(b, 1)).unwrap();

        table.remove(1);
        assert_eq!(table.allocate_pid(), 1);
    }

    #[test]
    fn exit_then_reap_returns_the_code() {
        let mut table = ProcessTable::new();
        table.insert(fresh(1, 0)).unwrap();
        table.insert(fresh(2, 1)).unwrap();

        // Not exited yet: children exist, nothing to reap
        assert_eq!(table.try_reap(1, -1), Ok(None));

        table.mark_exited(2, 7);
        assert_eq!(table.try_reap(1, -1), Ok(Some((2, 7))));
        // Gone after the reap
        assert!(table.get(2).is_none());
        assert_eq!(table.try_reap(1, -1), Err(Errno::Child));
    }

    #[test]
    fn reap_specific_child_only() {
        let mut table = ProcessTable::new();
        table.insert(fresh(1, 0)).unwrap();
        table.insert(fresh(2, 1)).unwrap();
        table.insert(fresh(3, 1)).unwrap();
        table.mark_exited(3, 1);

        // Waiting on pid 2 does not see pid 3's zombie
        assert_eq!(table.try_reap(1, 2), Ok(None));
        assert_eq!(table.try_reap(1, 3), Ok(Some((3, 1))));
    }

    #[test]
    fn reaping_anothers_child_fails() {
        let mut table = ProcessTable::new();
        table.insert(fresh(1, 0)).unwrap();
        table.insert(fresh(2, 0)).unwrap();
        table.insert(fresh(3, 2)).unwrap();
        table.mark_exited(3, 9);

        assert_eq!(table.try_reap(1, -1), Err(Errno::Child));
        assert_eq!(table.try_reap(2, -1), Ok(Some((3, 9))));
    }

    #[test]
    fn fork_clone_inherits_but_diverges() {
        let mut parent = fresh(1, 0);
        parent.cwd = String::from("/home");
        parent.umask = 0o077;
        parent.identifier = String::from("shell");

        let child = parent.clone_for_fork(2, 1, Arc::new(AddressSpace::kernel()));
        assert_eq!(child.cwd, "/home");
        assert_eq!(child.umask, 0o077);
        assert_eq!(child.identifier, "shell");
        assert_eq!(child.parent, 1);
        assert!(!child.has_exited);
        assert!(child.fds.structurally_equal(&parent.fds));
    }

    #[test]
    fn zombies_keep_only_the_exit_code() {
        let mut table = ProcessTable::new();
        table.insert(fresh(1, 0)).unwrap();
        table.insert(fresh(2, 1)).unwrap();
        {
            let child = table.get_mut(2).unwrap();
            child
                .fds
                .install(
                    Arc::new(crate::fs::fd::Description::FifoReader(
                        crate::ipc::fifo::Fifo::new(),
                    )),
                    false,
                    0,
                )
                .unwrap();
        }
        table.mark_exited(2, 3);
        let zombie = table.get(2).unwrap();
        assert!(zombie.has_exited);
        assert_eq!(zombie.exit_code, 3);
        assert_eq!(zombie.fds.open_count(), 0);
    }
}
