//! Process Reports
//!
//! Serializable snapshots of a process and its workers, written as JSON at
//! the end of a run.

use crate::arena::NetState;
use crate::ids::{NetId, WorkerId};
use crate::quiescence::QuiescenceStats;
use network::{ProcessId, TransportStats, TransportType};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// One net owned by a worker
#[derive(Debug, Clone, Serialize)]
pub struct NetReport {
    pub net: NetId,
    pub state: NetState,
    pub report: serde_json::Value,
}

/// Final state of one worker
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerReport {
    pub worker: Option<WorkerId>,
    pub messages: u64,
    pub firings: u64,
    pub tokens_received: u64,
    pub forwarded: u64,
    pub dropped: u64,
    pub reclaimed: u64,
    pub nets: Vec<NetReport>,
}

/// Arena view of one net
#[derive(Debug, Clone, Serialize)]
pub struct NetSummary {
    pub net: NetId,
    pub template: String,
    pub owner: WorkerId,
    pub parent: Option<NetId>,
    pub global: bool,
    pub state: NetState,
}

/// Everything a process knows about its run
#[derive(Debug, Clone, Serialize)]
pub struct ProcessReport {
    pub process: ProcessId,
    pub process_count: usize,
    pub threads: usize,
    pub backend: TransportType,
    pub live_nets: usize,
    pub halting_nets: usize,
    pub retired_nets: usize,
    pub nets: Vec<NetSummary>,
    pub workers: Vec<WorkerReport>,
    pub stats: ProcessStats,
    pub transport: TransportStats,
    pub termination: QuiescenceStats,
}

/// Process counters
#[derive(Debug, Default)]
pub struct ProcessMetrics {
    pub nets_spawned: AtomicU64,
    pub nets_reclaimed: AtomicU64,
    /// Token deliveries handed straight to a local worker
    pub local_deliveries: AtomicU64,
    /// Token deliveries handed to the transport
    pub remote_deliveries: AtomicU64,
    /// Control messages dropped as malformed, duplicate or late
    pub protocol_errors: AtomicU64,
    pub transport_errors: AtomicU64,
}

impl ProcessMetrics {
    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> ProcessStats {
        ProcessStats {
            nets_spawned: self.nets_spawned.load(Ordering::Relaxed),
            nets_reclaimed: self.nets_reclaimed.load(Ordering::Relaxed),
            local_deliveries: self.local_deliveries.load(Ordering::Relaxed),
            remote_deliveries: self.remote_deliveries.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

/// Process counters snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessStats {
    pub nets_spawned: u64,
    pub nets_reclaimed: u64,
    pub local_deliveries: u64,
    pub remote_deliveries: u64,
    pub protocol_errors: u64,
    pub transport_errors: u64,
}
