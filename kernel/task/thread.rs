//! Thread table
//!
//! Fixed-slot arena owning every thread's saved contexts and kernel
//! stack. Handles are small integers (slot + 1); the arena never
//! moves an entry, so the scheduler can hold raw pointers to a
//! thread's kernel context across a stack switch.

use alloc::boxed::Box;

use crate::arch::context::{FpuArea, KernelContext, TrapFrame};
use crate::frame_alloc;

use super::{Pid, Tcid, Tid, MAX_THREADS};

/// Kernel stack size per thread.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Queued in its cluster.
    Runnable,
    /// On a core right now.
    Running,
    /// Finished; slot reclaimed once off-core.
    Dead,
}

/// Deadline reservation: `runtime` ticks out of every `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub runtime: u64,
    pub period: u64,
}

/// One kernel-visible thread.
pub struct Thread {
    pub tid: Tid,
    /// Owning process; 0 for kernel-only threads.
    pub pid: Pid,
    pub cluster: Tcid,
    pub state: ThreadState,

    /// Bottom of the kernel stack (physical, contiguous).
    pub kstack_phys: u64,
    /// Saved kernel execution point while off-core.
    pub kctx: KernelContext,
    /// FP/SSE state while off-core.
    pub fpu: Box<FpuArea>,
    /// Userland TLS base.
    pub tcb: u64,
    /// Page-table root of the owning process.
    pub map_root: u64,

    /// Restricted to one core when set.
    pub mono_core: Option<u32>,
    /// Deadline parameters when the thread is deadline-scheduled.
    pub deadline: Option<Deadline>,
    /// Ticks consumed in the current period.
    pub deadline_spent: u64,
    /// Tick at which the current period began.
    pub period_start: u64,

    /// Ring-3 register image consumed on first dispatch.
    pub entry_frame: TrapFrame,
}

impl Thread {
    /// Top of this thread's kernel stack, as a kernel pointer.
    pub fn kstack_top(&self) -> u64 {
        crate::mm::phys_to_virt(self.kstack_phys) as u64 + KERNEL_STACK_SIZE as u64
    }
}

/// The arena. Slot `i` holds TID `i + 1`.
pub struct ThreadTable {
    slots: Box<[Option<Thread>]>,
}

impl ThreadTable {
    pub fn new() -> Self {
        let mut slots = alloc::vec::Vec::with_capacity(MAX_THREADS);
        slots.resize_with(MAX_THREADS, || None);
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    /// Insert a thread, assigning its TID. Returns 0 when the arena
    /// is full.
    pub fn insert(&mut self, mut thread: Thread) -> Tid {
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            if entry.is_none() {
                let tid = slot as Tid + 1;
                thread.tid = tid;
                *entry = Some(thread);
                return tid;
            }
        }
        0
    }

    pub fn get(&self, tid: Tid) -> Option<&Thread> {
        if tid == 0 {
            return None;
        }
        self.slots.get(tid as usize - 1).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        if tid == 0 {
            return None;
        }
        self.slots.get_mut(tid as usize - 1).and_then(|s| s.as_mut())
    }

    /// Remove a slot outright, returning the thread.
    pub fn take(&mut self, tid: Tid) -> Option<Thread> {
        if tid == 0 {
            return None;
        }
        self.slots.get_mut(tid as usize - 1).and_then(|s| s.take())
    }

    /// Iterate live threads.
    pub fn iter(&self) -> impl Iterator<Item = &Thread> {
        self.slots.iter().flatten()
    }

    pub fn count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

/// Allocate a kernel stack for a new thread.
pub fn allocate_kernel_stack() -> Option<u64> {
    let frames = KERNEL_STACK_SIZE / frame_alloc::FRAME_SIZE;
    let base = frame_alloc::alloc_contiguous(frames)?;
    unsafe {
        ::core::ptr::write_bytes(crate::mm::phys_to_virt(base), 0, KERNEL_STACK_SIZE);
    }
    Some(base)
}

/// Return a dead thread's kernel stack.
pub fn free_kernel_stack(base_phys: u64) {
    let frames = KERNEL_STACK_SIZE / frame_alloc::FRAME_SIZE;
    for i in 0..frames {
        frame_alloc::free_frame(base_phys + (i * frame_alloc::FRAME_SIZE) as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_thread() -> Thread {
        Thread {
            tid: 0,
            pid: 1,
            cluster: 1,
            state: ThreadState::Runnable,
            kstack_phys: 0,
            kctx: KernelContext::empty(),
            fpu: Box::new(FpuArea::new()),
            tcb: 0,
            map_root: 0,
            mono_core: None,
            deadline: None,
            deadline_spent: 0,
            period_start: 0,
            entry_frame: TrapFrame::zeroed(),
        }
    }

    #[test]
    fn tids_start_at_one_and_recycle() {
        let mut table = ThreadTable::new();
        let a = table.insert(bare_thread());
        let b = table.insert(bare_thread());
        assert_eq!((a, b), (1, 2));

        table.take(a).unwrap();
        let c = table.insert(bare_thread());
        assert_eq!(c, 1);
    }

    #[test]
    fn arena_is_bounded() {
        let mut table = ThreadTable::new();
        for _ in 0..MAX_THREADS {
            assert_ne!(table.insert(bare_thread()), 0);
        }
        assert_eq!(table.insert(bare_thread()), 0);
    }

    #[test]
    fn zero_is_never_valid() {
        let table = ThreadTable::new();
        assert!(table.get(0).is_none());
    }
}
