//! In-Memory Recording Backend
//!
//! Test double for the transport contract: every accepted packet is kept
//! in a log, inbound packets are injected by the test, and individual
//! targets can be made to fail.

use super::{check_target, Transport, TransportMetrics, TransportType};
use crate::packet::{Packet, ProcessId};
use crate::{Result, TransportError};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

#[derive(Debug)]
pub struct MemoryTransport {
    local: ProcessId,
    process_count: usize,
    sent: Mutex<Vec<(ProcessId, Packet)>>,
    inbound: Mutex<VecDeque<Packet>>,
    failing: Mutex<HashSet<ProcessId>>,
    metrics: TransportMetrics,
}

impl MemoryTransport {
    pub fn new(local: ProcessId, process_count: usize) -> Self {
        Self {
            local,
            process_count,
            sent: Mutex::new(Vec::new()),
            inbound: Mutex::new(VecDeque::new()),
            failing: Mutex::new(HashSet::new()),
            metrics: TransportMetrics::new(),
        }
    }

    /// Make every later send to `target` fail
    pub fn fail_target(&self, target: ProcessId) {
        self.failing.lock().insert(target);
    }

    /// Queue a packet as if it had arrived from a peer
    pub fn inject(&self, packet: Packet) {
        self.inbound.lock().push_back(packet);
    }

    /// Everything accepted for delivery so far
    pub fn sent(&self) -> Vec<(ProcessId, Packet)> {
        self.sent.lock().clone()
    }

    /// Drain the sent log
    pub fn take_sent(&self) -> Vec<(ProcessId, Packet)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl Transport for MemoryTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Memory
    }

    fn local_process(&self) -> ProcessId {
        self.local
    }

    fn process_count(&self) -> usize {
        self.process_count
    }

    fn send(&self, target: ProcessId, packet: Packet) -> Result<()> {
        check_target(self.local, self.process_count, target).inspect_err(|_| {
            self.metrics.record_failure();
        })?;
        if self.failing.lock().contains(&target) {
            self.metrics.record_failure();
            return Err(TransportError::network(format!("injected failure for {}", target)));
        }
        self.metrics.record_send(&packet);
        self.sent.lock().push((target, packet));
        Ok(())
    }

    fn try_receive(&self) -> Result<Option<Packet>> {
        let packet = self.inbound.lock().pop_front();
        if let Some(packet) = &packet {
            self.metrics.record_receive(packet);
        }
        Ok(packet)
    }

    fn has_inbound(&self) -> bool {
        !self.inbound.lock().is_empty()
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }
}
