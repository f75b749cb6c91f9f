//! Control Messages
//!
//! Two message families:
//!
//! - [`ServiceMessage`]: process-to-process control traffic, bincode encoded
//!   and carried in service-tagged packets
//! - [`WorkerMessage`]: process-to-worker handoff inside one OS process,
//!   never serialised
//!
//! Every service message is consumed exactly once by the process that
//! pulls it from its backend.

use crate::ids::{NetId, PlaceIndex, TransitionIndex};
use crate::net::{Net, TokenBatch};
use crate::Result;
use bytes::Bytes;
use network::{Packet, ProcessId, Tag, TransportError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Cluster barrier phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BarrierPhase {
    /// Before any worker starts scheduling
    Start,
    /// After all workers stopped, before the backend shuts down
    Teardown,
}

impl BarrierPhase {
    pub(crate) fn index(self) -> usize {
        match self {
            BarrierPhase::Start => 0,
            BarrierPhase::Teardown => 1,
        }
    }
}

/// Process-to-process control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceMessage {
    /// A global net was spawned; the receiver creates its own copy with the same id
    NetSpawned {
        net: NetId,
        def_index: u32,
        parent: Option<NetId>,
        origin: ProcessId,
    },
    /// A global net halted on `origin`; the receiver halts its copy and acknowledges
    NetHalted { net: NetId, origin: ProcessId },
    /// `from` finished halting its copy of `net`
    HaltAck { net: NetId, from: ProcessId },
    /// Stop every worker
    Quit { origin: ProcessId },
    /// Barrier arrival
    Barrier { phase: BarrierPhase, from: ProcessId },
    /// Termination probe from the coordinator
    Probe { wave: u64 },
    /// Answer to a termination probe
    ProbeReply {
        wave: u64,
        from: ProcessId,
        idle: bool,
        sent: u64,
        received: u64,
    },
}

impl ServiceMessage {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(body)?)
    }

    /// Wrap into a service-tagged packet
    pub fn to_packet(&self, source: ProcessId) -> Result<Packet> {
        Ok(Packet::service(source, self.encode()?))
    }

    /// Unwrap a service-tagged packet
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if packet.tag != Tag::Service {
            return Err(TransportError::protocol(format!(
                "Expected service packet, got {}",
                packet.tag
            ))
            .into());
        }
        Self::decode(&packet.body)
    }

    /// Messages that carry work for the receiver and take part in
    /// termination accounting
    pub fn is_work(&self) -> bool {
        matches!(self, ServiceMessage::NetSpawned { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServiceMessage::NetSpawned { .. } => "net_spawned",
            ServiceMessage::NetHalted { .. } => "net_halted",
            ServiceMessage::HaltAck { .. } => "halt_ack",
            ServiceMessage::Quit { .. } => "quit",
            ServiceMessage::Barrier { .. } => "barrier",
            ServiceMessage::Probe { .. } => "probe",
            ServiceMessage::ProbeReply { .. } => "probe_reply",
        }
    }
}

/// Message queued in a worker's inbox
pub enum WorkerMessage {
    /// Take ownership of a net (fresh spawn or migration)
    Adopt(Box<dyn Net>),
    /// Deliver tokens to a place of an owned net
    Tokens {
        net: NetId,
        place: PlaceIndex,
        batch: TokenBatch,
    },
    /// Stop scheduling a net; `origin` is set when a peer's halt caused it
    Halt {
        net: NetId,
        origin: Option<ProcessId>,
    },
    /// Release a halted net after every acknowledgment arrived
    Reclaim(NetId),
    /// Fire one specific transition
    Fire {
        net: NetId,
        transition: TransitionIndex,
    },
    /// Open the worker's trace log
    StartLog(PathBuf),
    /// Close the worker's trace log
    StopLog,
}

impl WorkerMessage {
    /// Messages that keep their process from being idle while queued
    pub fn is_obligation(&self) -> bool {
        !matches!(self, WorkerMessage::StartLog(_) | WorkerMessage::StopLog)
    }

    /// Net the message concerns, if any
    pub fn net(&self) -> Option<NetId> {
        match self {
            WorkerMessage::Adopt(net) => Some(net.id()),
            WorkerMessage::Tokens { net, .. }
            | WorkerMessage::Halt { net, .. }
            | WorkerMessage::Fire { net, .. } => Some(*net),
            WorkerMessage::Reclaim(net) => Some(*net),
            WorkerMessage::StartLog(_) | WorkerMessage::StopLog => None,
        }
    }
}

impl fmt::Debug for WorkerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerMessage::Adopt(net) => write!(f, "Adopt({})", net.id()),
            WorkerMessage::Tokens { net, place, batch } => write!(
                f,
                "Tokens {{ net: {}, place: {}, tokens: {}, bytes: {} }}",
                net,
                place,
                batch.tokens_count,
                batch.payload.len()
            ),
            WorkerMessage::Halt { net, origin } => {
                write!(f, "Halt {{ net: {}, origin: {:?} }}", net, origin)
            }
            WorkerMessage::Reclaim(net) => write!(f, "Reclaim({})", net),
            WorkerMessage::Fire { net, transition } => {
                write!(f, "Fire {{ net: {}, transition: {} }}", net, transition)
            }
            WorkerMessage::StartLog(path) => write!(f, "StartLog({:?})", path),
            WorkerMessage::StopLog => f.write_str("StopLog"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_packet_roundtrip() {
        let msg = ServiceMessage::NetSpawned {
            net: NetId::new(4),
            def_index: 1,
            parent: Some(NetId::new(0)),
            origin: ProcessId::new(0),
        };
        let packet = msg.to_packet(ProcessId::new(0)).unwrap();
        assert_eq!(packet.tag, Tag::Service);
        assert_eq!(ServiceMessage::from_packet(&packet).unwrap(), msg);
        assert!(msg.is_work());
        assert_eq!(msg.kind(), "net_spawned");
    }

    #[test]
    fn test_garbage_is_a_protocol_error() {
        let packet = Packet::service(ProcessId::new(1), Bytes::from_static(&[0xff, 0xff, 0xff, 0xff, 9]));
        let err = ServiceMessage::from_packet(&packet).unwrap_err();
        assert_eq!(err.category(), "protocol");
    }

    #[test]
    fn test_token_packet_is_not_a_service_message() {
        let packet = Packet::new(Tag::Tokens, ProcessId::new(1), Bytes::from_static(b"abc"));
        let err = ServiceMessage::from_packet(&packet).unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn test_obligations() {
        assert!(WorkerMessage::Reclaim(NetId::new(1)).is_obligation());
        assert!(WorkerMessage::Halt {
            net: NetId::new(1),
            origin: None
        }
        .is_obligation());
        assert!(!WorkerMessage::StopLog.is_obligation());
        assert_eq!(
            WorkerMessage::Fire {
                net: NetId::new(3),
                transition: 0
            }
            .net(),
            Some(NetId::new(3))
        );
    }
}
