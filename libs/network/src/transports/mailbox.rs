//! Shared-Memory Mailbox Backend
//!
//! All processes of the cluster are hosted in one OS process. Each process
//! owns one mutex-protected packet queue; sending pushes into the target's
//! queue and receiving pops from the local one. The lock is only held for
//! the push or pop itself. Shutting an endpoint down closes only that
//! process's mailbox; peers sending to it afterwards get `Closed`.

use super::{check_target, Transport, TransportMetrics, TransportType};
use crate::packet::{Packet, ProcessId};
use crate::{Result, TransportError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// The set of mailboxes shared by every process of an in-process cluster
#[derive(Debug)]
pub struct MailboxHub {
    mailboxes: Vec<Mutex<VecDeque<Packet>>>,
    closed: Vec<AtomicBool>,
}

impl MailboxHub {
    pub fn new(process_count: usize) -> Result<Arc<Self>> {
        if process_count == 0 {
            return Err(TransportError::configuration(
                "Mailbox hub needs at least one process",
                Some("process_count"),
            ));
        }
        debug!(process_count, "Creating mailbox hub");
        Ok(Arc::new(Self {
            mailboxes: (0..process_count).map(|_| Mutex::new(VecDeque::new())).collect(),
            closed: (0..process_count).map(|_| AtomicBool::new(false)).collect(),
        }))
    }

    pub fn process_count(&self) -> usize {
        self.mailboxes.len()
    }

    /// Endpoint used by process `local`
    pub fn endpoint(self: &Arc<Self>, local: ProcessId) -> Result<MailboxTransport> {
        if local.index() >= self.mailboxes.len() {
            return Err(TransportError::configuration(
                format!("{} is outside a {}-process hub", local, self.mailboxes.len()),
                Some("process_id"),
            ));
        }
        Ok(MailboxTransport {
            hub: Arc::clone(self),
            local,
            metrics: TransportMetrics::new(),
        })
    }

    /// Packets currently queued for `process`
    pub fn queued(&self, process: ProcessId) -> usize {
        self.mailboxes
            .get(process.index())
            .map(|mailbox| mailbox.lock().len())
            .unwrap_or(0)
    }

    fn close(&self, process: ProcessId) {
        self.closed[process.index()].store(true, Ordering::Release);
    }

    /// Whether `process` has shut its endpoint down
    pub fn is_closed(&self, process: ProcessId) -> bool {
        self.closed
            .get(process.index())
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(true)
    }
}

/// One process's view of the mailbox hub
#[derive(Debug)]
pub struct MailboxTransport {
    hub: Arc<MailboxHub>,
    local: ProcessId,
    metrics: TransportMetrics,
}

impl MailboxTransport {
    pub fn hub(&self) -> &Arc<MailboxHub> {
        &self.hub
    }
}

impl Transport for MailboxTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Mailbox
    }

    fn local_process(&self) -> ProcessId {
        self.local
    }

    fn process_count(&self) -> usize {
        self.hub.process_count()
    }

    fn send(&self, target: ProcessId, packet: Packet) -> Result<()> {
        if self.hub.is_closed(self.local) {
            self.metrics.record_failure();
            return Err(TransportError::closed("mailbox endpoint shut down"));
        }
        if let Err(e) = check_target(self.local, self.hub.process_count(), target) {
            self.metrics.record_failure();
            return Err(e);
        }
        if self.hub.is_closed(target) {
            self.metrics.record_failure();
            return Err(TransportError::closed(format!("{} has shut down", target)));
        }
        trace!(from = %self.local, to = %target, tag = %packet.tag, "Posting packet to mailbox");
        self.metrics.record_send(&packet);
        self.hub.mailboxes[target.index()].lock().push_back(packet);
        Ok(())
    }

    fn try_receive(&self) -> Result<Option<Packet>> {
        let packet = self.hub.mailboxes[self.local.index()].lock().pop_front();
        if let Some(packet) = &packet {
            self.metrics.record_receive(packet);
        }
        Ok(packet)
    }

    fn has_inbound(&self) -> bool {
        !self.hub.mailboxes[self.local.index()].lock().is_empty()
    }

    fn is_healthy(&self) -> bool {
        !self.hub.is_closed(self.local)
    }

    fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }

    fn shutdown(&self) -> Result<()> {
        debug!(process = %self.local, "Closing mailbox endpoint");
        self.hub.close(self.local);
        Ok(())
    }
}
