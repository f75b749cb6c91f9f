//! Transport Metrics
//!
//! Lock-free counters updated on every send/receive so routing code can
//! verify which backend a packet actually travelled through.

use crate::packet::{Packet, Tag};
use std::sync::atomic::{AtomicU64, Ordering};

/// Transport counters
#[derive(Debug, Default)]
pub struct TransportMetrics {
    /// Token-delivery packets handed to the backend
    pub token_packets_sent: AtomicU64,
    /// Service packets handed to the backend
    pub service_packets_sent: AtomicU64,
    /// Packets taken out of the backend
    pub packets_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    /// Sends rejected synchronously or failed asynchronously
    pub send_failures: AtomicU64,
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted send
    #[inline]
    pub fn record_send(&self, packet: &Packet) {
        match packet.tag {
            Tag::Tokens => self.token_packets_sent.fetch_add(1, Ordering::Relaxed),
            Tag::Service => self.service_packets_sent.fetch_add(1, Ordering::Relaxed),
        };
        self.bytes_sent
            .fetch_add(packet.wire_len() as u64, Ordering::Relaxed);
    }

    /// Record a packet taken out of the backend
    #[inline]
    pub fn record_receive(&self, packet: &Packet) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(packet.wire_len() as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a consistent-enough snapshot for reports and tests
    pub fn get_stats(&self) -> TransportStats {
        TransportStats {
            token_packets_sent: self.token_packets_sent.load(Ordering::Relaxed),
            service_packets_sent: self.service_packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

/// Transport statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TransportStats {
    pub token_packets_sent: u64,
    pub service_packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_failures: u64,
}

impl TransportStats {
    pub fn packets_sent(&self) -> u64 {
        self.token_packets_sent + self.service_packets_sent
    }
}
