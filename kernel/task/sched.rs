//! The scheduler
//!
//! Dispatch policy lives in `SchedState`, plain data driven by either
//! the timer interrupt or a voluntary suspension point; the actual
//! stack switch is the arch `switch_context` leaf. Deadline threads
//! preempt everything while they hold budget; otherwise each cluster
//! rotates per its own algorithm. A thread that yields goes to the
//! back of its cluster queue, so every other runnable thread in the
//! cluster gets a turn first.

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::Lazy;

use crate::arch::context::{switch_context, KernelContext, TrapFrame};
use crate::arch::percpu;
use crate::error::{Errno, KResult};
use crate::sync::IrqLock;

use super::cluster::{Algorithm, ClusterTable};
use super::thread::{Deadline, Thread, ThreadState, ThreadTable, KERNEL_STACK_SIZE};
use super::{Pid, Tcid, Tid};

/// Scheduler tick rate.
pub const TICK_HZ: u64 = 100;

/// Sizing bound for per-core bookkeeping.
pub const MAX_CORES: usize = 32;

/// Why a switch is happening; decides where the outgoing thread goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchReason {
    Preempt,
    Yield,
    Bail,
}

/// All scheduler state behind the one lock.
pub struct SchedState {
    pub threads: ThreadTable,
    pub clusters: ClusterTable,
    /// Running thread per core (0 = idle).
    current: Vec<Tid>,
    /// Ticks the current thread has held each core.
    quantum_used: Vec<u64>,
    /// Saved idle-loop context per core.
    idle_ctx: Vec<KernelContext>,
    /// Thread most recently switched off each core. Its kernel stack
    /// may still be live until that core switches again, so the
    /// reaper must leave it alone.
    leaving: Vec<Tid>,
    /// Rotation pointer over cluster ids.
    next_cluster: usize,
    /// Global tick counter.
    ticks: u64,
}

impl SchedState {
    pub fn new(cores: usize) -> Self {
        Self {
            threads: ThreadTable::new(),
            clusters: ClusterTable::new(),
            current: alloc::vec![0; cores],
            quantum_used: alloc::vec![0; cores],
            idle_ctx: alloc::vec![KernelContext::empty(); cores],
            leaving: alloc::vec![0; cores],
            next_cluster: 0,
            ticks: 0,
        }
    }

    pub fn current_on(&self, core: usize) -> Tid {
        self.current.get(core).copied().unwrap_or(0)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Whether a runnable deadline thread with budget exists for
    /// `core`. Refills expired periods as a side effect.
    fn deadline_candidate(&mut self, core: usize) -> Option<Tid> {
        let now = self.ticks;
        let mut found = None;
        for thread in self.threads.iter() {
            let Some(deadline) = thread.deadline else {
                continue;
            };
            if thread.state != ThreadState::Runnable {
                continue;
            }
            if let Some(pinned) = thread.mono_core {
                if pinned as usize != core {
                    continue;
                }
            }
            let spent = if now.saturating_sub(thread.period_start) >= deadline.period {
                0
            } else {
                thread.deadline_spent
            };
            if spent < deadline.runtime {
                found = Some(thread.tid);
                break;
            }
        }
        // Apply the period refill observed above
        if let Some(tid) = found {
            let thread = self.threads.get_mut(tid).expect("candidate exists");
            let deadline = thread.deadline.expect("deadline candidate");
            if now.saturating_sub(thread.period_start) >= deadline.period {
                thread.deadline_spent = 0;
                thread.period_start = now;
            }
        }
        found
    }

    /// Account one tick on `core`; returns true when the core should
    /// switch threads.
    pub fn record_tick(&mut self, core: usize) -> bool {
        self.ticks += 1;
        let current = self.current_on(core);

        if current == 0 {
            return self.deadline_candidate(core).is_some() || self.any_runnable(core);
        }

        self.quantum_used[core] += 1;

        let (cluster_id, is_deadline) = match self.threads.get_mut(current) {
            Some(thread) => {
                if thread.state == ThreadState::Dead {
                    // Deleted while running: force it off the core
                    return true;
                }
                if thread.deadline.is_some() {
                    thread.deadline_spent += 1;
                }
                (thread.cluster, thread.deadline.is_some())
            }
            None => return true,
        };

        // A deadline thread runs until its budget is gone
        if is_deadline {
            let thread = self.threads.get(current).expect("checked");
            let deadline = thread.deadline.expect("checked");
            return thread.deadline_spent >= deadline.runtime;
        }

        // Deadline work trumps everything else
        if self.deadline_candidate(core).is_some() {
            return true;
        }

        let Some(cluster) = self.clusters.get(cluster_id) else {
            return true;
        };
        if !cluster.interruptible {
            return false;
        }
        match cluster.algorithm {
            Algorithm::RoundRobin => self.quantum_used[core] >= cluster.quantum,
            Algorithm::Cooperative => false,
        }
    }

    fn any_runnable(&self, core: usize) -> bool {
        self.threads.iter().any(|t| {
            t.state == ThreadState::Runnable
                && t.mono_core.map(|c| c as usize == core).unwrap_or(true)
        })
    }

    /// Choose the next thread for `core` and dequeue it. Deadline
    /// candidates first, then cluster rotation. Mono threads pinned
    /// elsewhere are skipped in place.
    pub fn pick_next(&mut self, core: usize) -> Option<Tid> {
        if let Some(tid) = self.deadline_candidate(core) {
            self.clusters.unqueue(tid);
            return Some(tid);
        }

        let ids: Vec<Tcid> = self.clusters.ids().collect();
        if ids.is_empty() {
            return None;
        }

        for round in 0..ids.len() {
            let cluster_id = ids[(self.next_cluster + round) % ids.len()];
            let queue_len = self
                .clusters
                .get(cluster_id)
                .map(|c| c.queue.len())
                .unwrap_or(0);

            for _ in 0..queue_len {
                let Some(tid) = self
                    .clusters
                    .get_mut(cluster_id)
                    .and_then(|c| c.queue.pop_front())
                else {
                    break;
                };
                let eligible = self
                    .threads
                    .get(tid)
                    .map(|t| {
                        t.state == ThreadState::Runnable
                            && t.mono_core.map(|c| c as usize == core).unwrap_or(true)
                    })
                    .unwrap_or(false);
                if eligible {
                    self.next_cluster = (self.next_cluster + round + 1) % ids.len();
                    return Some(tid);
                }
                // Dead entries drop out of the queue here; pinned
                // ones go to the back for their own core to find.
                if self.threads.get(tid).is_some() {
                    if let Some(c) = self.clusters.get_mut(cluster_id) {
                        c.queue.push_back(tid);
                    }
                }
            }
        }
        None
    }

    /// Move `outgoing` off `core` per `reason` and install `incoming`.
    fn switch_bookkeeping(&mut self, core: usize, incoming: Tid, reason: SwitchReason) {
        let outgoing = self.current_on(core);
        if outgoing != 0 {
            if let Some(thread) = self.threads.get_mut(outgoing) {
                match reason {
                    SwitchReason::Bail => thread.state = ThreadState::Dead,
                    _ => {
                        if thread.state == ThreadState::Running {
                            thread.state = ThreadState::Runnable;
                        }
                    }
                }
                let cluster = thread.cluster;
                let state = thread.state;
                if state == ThreadState::Runnable {
                    self.clusters.enqueue(cluster, outgoing);
                }
            }
        }

        if incoming != 0 {
            if let Some(thread) = self.threads.get_mut(incoming) {
                thread.state = ThreadState::Running;
            }
        }
        self.current[core] = incoming;
        self.quantum_used[core] = 0;
    }

    /// Admission control: total deadline utilization must stay ≤ 1.
    /// Returns false (and changes nothing) when the reservation does
    /// not fit.
    pub fn admit_deadline(&mut self, tid: Tid, runtime: u64, period: u64) -> bool {
        if runtime == 0 || period == 0 || runtime > period {
            return false;
        }
        let mut utilization: u64 = runtime * 1000 / period;
        for thread in self.threads.iter() {
            if thread.tid == tid {
                continue;
            }
            if let Some(d) = thread.deadline {
                utilization += d.runtime * 1000 / d.period;
            }
        }
        if utilization > 1000 {
            return false;
        }
        let now = self.ticks;
        if let Some(thread) = self.threads.get_mut(tid) {
            thread.deadline = Some(Deadline { runtime, period });
            thread.deadline_spent = 0;
            thread.period_start = now;
            true
        } else {
            false
        }
    }

    /// Reclaim dead threads that are not on any core. Returns their
    /// kernel stacks for the caller to free outside the lock.
    pub fn reap_dead(&mut self) -> Vec<u64> {
        let dead: Vec<Tid> = self
            .threads
            .iter()
            .filter(|t| {
                t.state == ThreadState::Dead
                    && !self.current.contains(&t.tid)
                    && !self.leaving.contains(&t.tid)
            })
            .map(|t| t.tid)
            .collect();
        let mut stacks = Vec::new();
        for tid in dead {
            self.clusters.unqueue(tid);
            if let Some(thread) = self.threads.take(tid) {
                if thread.kstack_phys != 0 {
                    stacks.push(thread.kstack_phys);
                }
            }
        }
        stacks
    }
}

static SCHED: Lazy<IrqLock<SchedState>> =
    Lazy::new(|| IrqLock::new(SchedState::new(MAX_CORES)));

/// Initialize scheduler state; call once on the BSP before any
/// thread exists.
pub fn init() {
    Lazy::force(&SCHED);
}

/// Run `f` against the locked scheduler state.
pub fn with_sched<R>(f: impl FnOnce(&mut SchedState) -> R) -> R {
    let mut sched = SCHED.lock();
    f(&mut sched)
}

/// Create a thread that will enter ring 3 through `entry_frame`.
/// Returns the TID, or 0 when the arena or stack allocation fails.
pub fn create_user_thread(
    pid: Pid,
    map_root: u64,
    entry_frame: TrapFrame,
    cluster: Tcid,
    tcb: u64,
) -> Tid {
    let Some(kstack_phys) = super::thread::allocate_kernel_stack() else {
        return 0;
    };
    let stack_top = crate::mm::phys_to_virt(kstack_phys) as u64 + KERNEL_STACK_SIZE as u64;
    let kctx = unsafe { crate::arch::context::seed_kernel_stack(stack_top, thread_bootstrap) };

    let thread = Thread {
        tid: 0,
        pid,
        cluster,
        state: ThreadState::Runnable,
        kstack_phys,
        kctx,
        fpu: Box::new(crate::arch::context::FpuArea::new()),
        tcb,
        map_root,
        mono_core: None,
        deadline: None,
        deadline_spent: 0,
        period_start: 0,
        entry_frame,
    };

    with_sched(|sched| {
        let tid = sched.threads.insert(thread);
        if tid != 0 {
            sched.clusters.enqueue(cluster, tid);
        } else {
            super::thread::free_kernel_stack(kstack_phys);
        }
        tid
    })
}

/// Remove a thread regardless of state. A running victim dies at its
/// core's next schedule point.
pub fn delete_thread(tid: Tid) -> KResult<()> {
    with_sched(|sched| {
        let Some(thread) = sched.threads.get_mut(tid) else {
            return Err(Errno::NoEntity);
        };
        thread.state = ThreadState::Dead;
        sched.clusters.unqueue(tid);
        Ok(())
    })
}

/// Pin or unpin a thread to the core it last ran on.
pub fn set_mono_thread(tid: Tid, pinned: bool, core: u32) -> KResult<()> {
    with_sched(|sched| {
        let Some(thread) = sched.threads.get_mut(tid) else {
            return Err(Errno::NoEntity);
        };
        thread.mono_core = if pinned { Some(core) } else { None };
        Ok(())
    })
}

/// Whether a thread is pinned.
pub fn is_mono_thread(tid: Tid) -> KResult<bool> {
    with_sched(|sched| {
        sched
            .threads
            .get(tid)
            .map(|t| t.mono_core.is_some())
            .ok_or(Errno::NoEntity)
    })
}

/// Install deadline parameters, subject to admission control.
pub fn set_deadlines(tid: Tid, runtime: u64, period: u64) -> KResult<()> {
    with_sched(|sched| {
        if sched.admit_deadline(tid, runtime, period) {
            Ok(())
        } else {
            Err(Errno::InvalidValue)
        }
    })
}

/// Timer interrupt body: account the tick, then possibly switch.
pub fn timer_interrupt() {
    let core = percpu::current_core();
    core.ticks.fetch_add(1, ::core::sync::atomic::Ordering::Relaxed);

    let needs_switch = with_sched(|sched| sched.record_tick(core.core_number as usize));

    #[cfg(target_arch = "x86_64")]
    crate::arch::x86_64::lapic::eoi();
    #[cfg(target_arch = "riscv64")]
    crate::arch::riscv64::schedule_tick(TICK_HZ);

    if needs_switch {
        do_switch(SwitchReason::Preempt);
    }
}

/// Voluntarily give the core away.
pub fn yield_now() {
    let saved = crate::arch::irq_save_disable();
    do_switch(SwitchReason::Yield);
    crate::arch::irq_restore(saved);
}

/// Terminate the calling thread. Never returns.
pub fn bail() -> ! {
    crate::arch::irq_save_disable();
    do_switch(SwitchReason::Bail);
    unreachable!("dead thread resumed");
}

/// The switch itself. Interrupts are off (ISR context or saved by
/// the caller).
fn do_switch(reason: SwitchReason) {
    let core_local = percpu::current_core();
    let core = core_local.core_number as usize;

    let mut sched = SCHED.lock();

    // This core is back under the lock, so whatever it switched off
    // last time is fully off its stack now.
    sched.leaving[core] = 0;

    // Opportunistic reclamation of threads that died elsewhere
    let stacks = sched.reap_dead();

    let outgoing = sched.current_on(core);
    let outgoing_dead = outgoing != 0
        && sched
            .threads
            .get(outgoing)
            .map(|t| t.state == ThreadState::Dead)
            .unwrap_or(true);

    let incoming = match sched.pick_next(core) {
        Some(tid) => tid,
        // A bailing or externally deleted thread must leave even
        // with nothing to run; the idle loop takes over.
        None if reason == SwitchReason::Bail || outgoing_dead => 0,
        None => {
            drop(sched);
            for stack in stacks {
                super::thread::free_kernel_stack(stack);
            }
            return;
        }
    };

    if incoming == outgoing && reason != SwitchReason::Bail {
        // Only runnable candidate is the caller; keep running it
        sched.switch_bookkeeping(core, incoming, SwitchReason::Preempt);
        drop(sched);
        for stack in stacks {
            super::thread::free_kernel_stack(stack);
        }
        return;
    }

    sched.switch_bookkeeping(core, incoming, reason);

    // Raw context pointers survive the unlock: arena slots are
    // fixed, and neither endpoint can be reaped while current.
    let old_ctx: *mut KernelContext = if outgoing != 0 {
        let t = sched.threads.get_mut(outgoing).expect("outgoing exists");
        t.fpu.save();
        &mut t.kctx as *mut KernelContext
    } else {
        &mut sched.idle_ctx[core] as *mut KernelContext
    };

    let (new_ctx, new_stack_top, new_pid, new_root): (*const KernelContext, u64, Pid, u64) =
        if incoming != 0 {
            let t = sched.threads.get(incoming).expect("incoming exists");
            t.fpu.restore();
            #[cfg(target_arch = "x86_64")]
            crate::arch::x86_64::msr::set_fs_base(t.tcb);
            (
                &t.kctx as *const KernelContext,
                t.kstack_top(),
                t.pid,
                t.map_root,
            )
        } else {
            (
                &sched.idle_ctx[core] as *const KernelContext,
                core_local.idle_stack_top,
                0,
                0,
            )
        };

    core_local.current_tid = incoming;
    core_local.current_pid = new_pid;
    core_local.kernel_stack_top = new_stack_top;
    #[cfg(target_arch = "x86_64")]
    {
        core_local.tss.rsp0 = new_stack_top;
    }

    if new_root != 0 {
        crate::arch::paging::activate_phys_root(new_root);
    }

    sched.leaving[core] = outgoing;

    drop(sched);
    for stack in stacks {
        super::thread::free_kernel_stack(stack);
    }

    unsafe {
        switch_context(old_ctx, new_ctx);
    }
}

/// First code of every new thread: builds its ring-3 frame and drops
/// to user mode.
extern "C" fn thread_bootstrap() -> ! {
    let core_local = percpu::current_core();
    let tid = core_local.current_tid;

    let (frame, tcb) = with_sched(|sched| {
        let thread = sched.threads.get(tid).expect("bootstrapping thread");
        (thread.entry_frame, thread.tcb)
    });

    #[cfg(target_arch = "x86_64")]
    if tcb != 0 {
        crate::arch::x86_64::msr::set_fs_base(tcb);
    }
    let _ = tcb;

    unsafe { crate::arch::context::enter_user(&frame) }
}

/// The per-core idle loop. Interrupts drive everything from here.
pub fn idle_core() -> ! {
    let core_local = percpu::current_core();
    core_local.current_tid = 0;
    core_local.current_pid = 0;

    loop {
        crate::arch::enable_interrupts();
        crate::arch::halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::context::FpuArea;

    fn spawn(sched: &mut SchedState, cluster: Tcid) -> Tid {
        let thread = Thread {
            tid: 0,
            pid: 1,
            cluster,
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
        };
        let tid = sched.threads.insert(thread);
        sched.clusters.enqueue(cluster, tid);
        tid
    }

    #[test]
    fn round_robin_rotates_on_quantum() {
        let mut sched = SchedState::new(1);
        let a = spawn(&mut sched, 1);
        let b = spawn(&mut sched, 1);

        let first = sched.pick_next(0).unwrap();
        sched.switch_bookkeeping(0, first, SwitchReason::Preempt);
        assert_eq!(first, a);

        let quantum = sched.clusters.get(1).unwrap().quantum;
        for _ in 0..quantum - 1 {
            assert!(!sched.record_tick(0));
        }
        assert!(sched.record_tick(0));

        let second = sched.pick_next(0).unwrap();
        sched.switch_bookkeeping(0, second, SwitchReason::Preempt);
        assert_eq!(second, b);

        // And back again: fair alternation
        for _ in 0..quantum {
            sched.record_tick(0);
        }
        let third = sched.pick_next(0).unwrap();
        assert_eq!(third, a);
    }

    #[test]
    fn rr_shares_evenly_over_a_window() {
        let mut sched = SchedState::new(1);
        let a = spawn(&mut sched, 1);
        let b = spawn(&mut sched, 1);

        let mut runtime = [0u64; 3];
        let first = sched.pick_next(0).unwrap();
        sched.switch_bookkeeping(0, first, SwitchReason::Preempt);

        // A long measurement window, many quanta
        for _ in 0..1000 {
            runtime[sched.current_on(0) as usize] += 1;
            if sched.record_tick(0) {
                if let Some(next) = sched.pick_next(0) {
                    sched.switch_bookkeeping(0, next, SwitchReason::Preempt);
                }
            }
        }

        let total = runtime[a as usize] + runtime[b as usize];
        assert_eq!(total, 1000);
        // Within 10% of an even split
        assert!(runtime[a as usize] >= 450 && runtime[a as usize] <= 550);
    }

    #[test]
    fn cooperative_threads_are_not_preempted() {
        let mut sched = SchedState::new(1);
        let coop = sched.clusters.insert(super::super::cluster::Cluster::new(
            Algorithm::Cooperative,
            2,
        ));
        let a = spawn(&mut sched, coop);
        let _b = spawn(&mut sched, coop);

        let first = sched.pick_next(0).unwrap();
        sched.switch_bookkeeping(0, first, SwitchReason::Preempt);
        assert_eq!(first, a);

        for _ in 0..100 {
            assert!(!sched.record_tick(0));
        }
    }

    #[test]
    fn yield_lets_cluster_peers_run_first() {
        let mut sched = SchedState::new(1);
        let a = spawn(&mut sched, 1);
        let b = spawn(&mut sched, 1);
        let c = spawn(&mut sched, 1);

        let first = sched.pick_next(0).unwrap();
        sched.switch_bookkeeping(0, first, SwitchReason::Preempt);
        assert_eq!(first, a);

        // a yields: both b and c run before a comes back
        let next = sched.pick_next(0).unwrap();
        sched.switch_bookkeeping(0, next, SwitchReason::Yield);
        assert_eq!(next, b);
        let next = sched.pick_next(0).unwrap();
        sched.switch_bookkeeping(0, next, SwitchReason::Yield);
        assert_eq!(next, c);
        let next = sched.pick_next(0).unwrap();
        assert_eq!(next, a);
    }

    #[test]
    fn mono_threads_only_run_on_their_core() {
        let mut sched = SchedState::new(2);
        let pinned = spawn(&mut sched, 1);
        sched.threads.get_mut(pinned).unwrap().mono_core = Some(1);

        // Core 0 refuses it
        assert_eq!(sched.pick_next(0), None);
        // Core 1 takes it
        assert_eq!(sched.pick_next(1), Some(pinned));
    }

    #[test]
    fn deadline_admission_caps_utilization() {
        let mut sched = SchedState::new(1);
        let a = spawn(&mut sched, 1);
        let b = spawn(&mut sched, 1);

        assert!(sched.admit_deadline(a, 6, 10)); // 0.6
        assert!(!sched.admit_deadline(b, 5, 10)); // 0.6 + 0.5 > 1
        assert!(sched.admit_deadline(b, 4, 10)); // exactly 1.0
    }

    #[test]
    fn deadline_threads_preempt_and_exhaust() {
        let mut sched = SchedState::new(1);
        let normal = spawn(&mut sched, 1);
        let urgent = spawn(&mut sched, 1);
        assert!(sched.admit_deadline(urgent, 2, 10));

        // Deadline work is chosen ahead of queue order
        let first = sched.pick_next(0).unwrap();
        sched.switch_bookkeeping(0, first, SwitchReason::Preempt);
        assert_eq!(first, urgent);

        // Runs its budget, then must give way
        assert!(!sched.record_tick(0));
        assert!(sched.record_tick(0));

        let next = sched.pick_next(0).unwrap();
        sched.switch_bookkeeping(0, next, SwitchReason::Preempt);
        assert_eq!(next, normal);

        // Budget refills after the period
        for _ in 0..10 {
            sched.record_tick(0);
        }
        let again = sched.pick_next(0).unwrap();
        assert_eq!(again, urgent);
    }

    #[test]
    fn dead_threads_get_reaped_off_core() {
        let mut sched = SchedState::new(1);
        let a = spawn(&mut sched, 1);
        sched.threads.get_mut(a).unwrap().state = ThreadState::Dead;

        assert_eq!(sched.pick_next(0), None);
        let stacks = sched.reap_dead();
        assert!(stacks.is_empty()); // no real stack was allocated
        assert!(sched.threads.get(a).is_none());
    }
}
