//! Scheduling clusters
//!
//! A cluster is a scheduling domain: an algorithm, a quantum, and a
//! FIFO of runnable threads. Round-robin clusters rotate when a
//! thread exhausts its quantum; cooperative clusters rotate only on
//! voluntary yield. Every runnable thread sits in exactly one
//! cluster's queue.

use alloc::boxed::Box;
use alloc::collections::VecDeque;

use super::{Tcid, Tid, MAX_CLUSTERS};

/// Intra-cluster scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    RoundRobin,
    Cooperative,
}

/// Default quantum in scheduler ticks.
pub const DEFAULT_QUANTUM: u64 = 4;

/// One scheduling domain.
pub struct Cluster {
    pub algorithm: Algorithm,
    /// Ticks a thread may run before rotation (round-robin only).
    pub quantum: u64,
    /// Whether timer interrupts may preempt threads of this cluster.
    pub interruptible: bool,
    /// Time-slice period handed to deadline accounting.
    pub period: u64,
    /// Runnable threads, dispatch order.
    pub queue: VecDeque<Tid>,
}

impl Cluster {
    pub fn new(algorithm: Algorithm, quantum: u64) -> Self {
        Self {
            algorithm,
            quantum,
            interruptible: true,
            period: quantum * 8,
            queue: VecDeque::new(),
        }
    }
}

/// Cluster arena. Slot `i` holds TCID `i + 1`; TCID 1 is the boot
/// cluster every thread starts in.
pub struct ClusterTable {
    slots: Box<[Option<Cluster>]>,
}

impl ClusterTable {
    /// Fresh table containing the boot cluster.
    pub fn new() -> Self {
        let mut slots = alloc::vec::Vec::with_capacity(MAX_CLUSTERS);
        slots.resize_with(MAX_CLUSTERS, || None);
        let mut table = Self {
            slots: slots.into_boxed_slice(),
        };
        table.insert(Cluster::new(Algorithm::RoundRobin, DEFAULT_QUANTUM));
        table
    }

    pub fn insert(&mut self, cluster: Cluster) -> Tcid {
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(cluster);
                return slot as Tcid + 1;
            }
        }
        0
    }

    pub fn get(&self, tcid: Tcid) -> Option<&Cluster> {
        if tcid == 0 {
            return None;
        }
        self.slots.get(tcid as usize - 1).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, tcid: Tcid) -> Option<&mut Cluster> {
        if tcid == 0 {
            return None;
        }
        self.slots
            .get_mut(tcid as usize - 1)
            .and_then(|s| s.as_mut())
    }

    /// Delete a cluster. Fails (false) while threads still queue in
    /// it or when it is the boot cluster.
    pub fn remove(&mut self, tcid: Tcid) -> bool {
        if tcid <= 1 {
            return false;
        }
        match self.slots.get_mut(tcid as usize - 1) {
            Some(slot @ Some(_)) => {
                if slot.as_ref().map(|c| c.queue.is_empty()).unwrap_or(false) {
                    *slot = None;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Enqueue a runnable thread at the back of its cluster.
    pub fn enqueue(&mut self, tcid: Tcid, tid: Tid) {
        if let Some(cluster) = self.get_mut(tcid) {
            if !cluster.queue.contains(&tid) {
                cluster.queue.push_back(tid);
            }
        }
    }

    /// Drop a thread from whatever queue holds it.
    pub fn unqueue(&mut self, tid: Tid) {
        for slot in self.slots.iter_mut().flatten() {
            slot.queue.retain(|&t| t != tid);
        }
    }

    /// Iterate cluster ids in dispatch order.
    pub fn ids(&self) -> impl Iterator<Item = Tcid> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i as Tcid + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_cluster_exists() {
        let table = ClusterTable::new();
        let boot = table.get(1).expect("boot cluster");
        assert_eq!(boot.algorithm, Algorithm::RoundRobin);
        assert_eq!(boot.quantum, DEFAULT_QUANTUM);
    }

    #[test]
    fn enqueue_is_fifo_without_duplicates() {
        let mut table = ClusterTable::new();
        table.enqueue(1, 7);
        table.enqueue(1, 9);
        table.enqueue(1, 7);
        let queue: alloc::vec::Vec<Tid> = table.get(1).unwrap().queue.iter().copied().collect();
        assert_eq!(queue, alloc::vec![7, 9]);
    }

    #[test]
    fn cannot_remove_boot_or_busy_cluster() {
        let mut table = ClusterTable::new();
        assert!(!table.remove(1));

        let extra = table.insert(Cluster::new(Algorithm::Cooperative, 10));
        table.enqueue(extra, 3);
        assert!(!table.remove(extra));

        table.unqueue(3);
        assert!(table.remove(extra));
        assert!(table.get(extra).is_none());
    }
}
