//! Cluster Barrier
//!
//! Records which processes reached each barrier phase. Arrivals can be
//! recorded before the local process reaches the phase itself (a fast
//! peer's arrival is simply remembered), so the two phases never mix.

use crate::messages::BarrierPhase;
use network::ProcessId;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use tracing::trace;

#[derive(Debug)]
pub struct ClusterBarrier {
    process_count: usize,
    arrivals: Mutex<[BTreeSet<ProcessId>; 2]>,
}

impl ClusterBarrier {
    pub fn new(process_count: usize) -> Self {
        Self {
            process_count,
            arrivals: Mutex::new([BTreeSet::new(), BTreeSet::new()]),
        }
    }

    /// Record that `from` reached `phase`; returns false for duplicates
    pub fn arrive(&self, phase: BarrierPhase, from: ProcessId) -> bool {
        let mut arrivals = self.arrivals.lock();
        let fresh = arrivals[phase.index()].insert(from);
        trace!(?phase, from = %from, arrived = arrivals[phase.index()].len(), "Barrier arrival");
        fresh
    }

    pub fn is_complete(&self, phase: BarrierPhase) -> bool {
        self.arrivals.lock()[phase.index()].len() >= self.process_count
    }

    /// Processes that have not reached `phase` yet
    pub fn missing(&self, phase: BarrierPhase) -> Vec<ProcessId> {
        let arrivals = self.arrivals.lock();
        (0..self.process_count as u32)
            .map(ProcessId::new)
            .filter(|p| !arrivals[phase.index()].contains(p))
            .collect()
    }
}
