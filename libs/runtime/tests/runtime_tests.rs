//! Process and worker behaviour driven by hand over a recording transport

mod common;

use bytes::Bytes;
use common::{sink_tokens, templates, RingDef, RING, SINK};
use net_runtime::{
    NetId, NetState, Process, ProcessConfig, ProcessId, RuntimeError, ServiceMessage, TokenBatch,
    WorkerId, WorkerMessage,
};
use network::{MemoryTransport, Packet, Tag};
use std::sync::Arc;

const P0: ProcessId = ProcessId::new(0);
const P1: ProcessId = ProcessId::new(1);
const P2: ProcessId = ProcessId::new(2);
const W0: WorkerId = WorkerId::new(0);

fn manual_config() -> ProcessConfig {
    ProcessConfig {
        threads: 1,
        autohalt: false,
        ..ProcessConfig::default()
    }
}

fn process_on(local: ProcessId, count: usize, config: ProcessConfig) -> (Arc<Process>, Arc<MemoryTransport>) {
    let transport = Arc::new(MemoryTransport::new(local, count));
    let process = Process::new(config, templates(RingDef::new(3)), transport.clone()).unwrap();
    (process, transport)
}

fn service_messages(sent: &[(ProcessId, Packet)]) -> Vec<(ProcessId, ServiceMessage)> {
    sent.iter()
        .filter(|(_, packet)| packet.tag == Tag::Service)
        .map(|(target, packet)| (*target, ServiceMessage::from_packet(packet).unwrap()))
        .collect()
}

#[test]
fn test_local_delivery_never_touches_transport() {
    let (process, transport) = process_on(P0, 2, manual_config());
    let mut worker = process.worker(W0).unwrap();

    let net = worker.spawn_net(SINK, None).unwrap();
    assert_eq!(process.net_state(net), Some(NetState::Spawned));
    worker.process_messages();
    assert_eq!(process.net_state(net), Some(NetState::Active));

    worker
        .multisend(P0, net, 2, TokenBatch::new(5, Bytes::from_static(b"xyz")))
        .unwrap();
    worker.send(P0, net, 2, Bytes::new()).unwrap();
    assert!(transport.sent().is_empty());
    assert_eq!(process.queued_messages(W0), 2);

    worker.process_messages();
    let report = worker.get_net(net).unwrap().report();
    assert_eq!(sink_tokens(&report, 2), 6);
    assert_eq!(process.get_stats().local_deliveries, 2);
    assert_eq!(process.obligations(), 0);
}

#[test]
fn test_multicast_deduplicates_targets() {
    let (process, transport) = process_on(P0, 3, manual_config());
    let mut worker = process.worker(W0).unwrap();

    let net = worker.spawn_global(SINK, None).unwrap();
    let spawned = service_messages(&transport.take_sent());
    assert_eq!(spawned.len(), 2);
    assert!(spawned
        .iter()
        .all(|(_, msg)| matches!(msg, ServiceMessage::NetSpawned { net: n, def_index: 0, .. } if *n == net)));
    worker.process_messages();

    let report = worker.multisend_multicast(
        &[P0, P1, P1],
        net,
        3,
        TokenBatch::new(2, Bytes::from_static(&[1, 2])),
    );
    assert!(report.is_complete());
    assert_eq!(report.results.len(), 2);
    assert_eq!(report.delivered(), 2);

    let sent = transport.take_sent();
    assert_eq!(sent.len(), 1);
    let (target, packet) = &sent[0];
    assert_eq!(*target, P1);
    let (header, payload) = packet.decode_tokens().unwrap();
    assert_eq!(header.place_index, 3);
    assert_eq!(header.net_id, net.raw());
    assert_eq!(header.tokens_count, 2);
    assert_eq!(&payload[..], &[1, 2]);

    worker.process_messages();
    assert_eq!(sink_tokens(&worker.get_net(net).unwrap().report(), 3), 2);
}

#[test]
fn test_multicast_reports_partial_failure() {
    let (process, transport) = process_on(P0, 3, manual_config());
    let worker = process.worker(W0).unwrap();
    transport.fail_target(P2);

    let report = worker.send_multicast(&[P1, P2], NetId::new(30), 0, Bytes::from_static(b"t"));
    assert!(!report.is_complete());
    assert_eq!(report.delivered(), 1);
    let failures: Vec<_> = report.failures().map(|(target, _)| target).collect();
    assert_eq!(failures, vec![P2]);
    assert!(report.into_result().unwrap_err().is_transport());
    assert_eq!(transport.sent().len(), 1);
}

#[test]
fn test_send_to_missing_process_is_unroutable() {
    let (process, _transport) = process_on(P0, 2, manual_config());
    let worker = process.worker(W0).unwrap();
    let err = worker
        .send(ProcessId::new(9), NetId::new(0), 0, Bytes::new())
        .unwrap_err();
    assert_eq!(err.category(), "transport");
    assert_eq!(process.get_stats().transport_errors, 1);
}

#[test]
fn test_halt_is_asynchronous() {
    let (process, _transport) = process_on(P0, 1, manual_config());
    let mut worker = process.worker(W0).unwrap();
    let net = worker.spawn_net(SINK, None).unwrap();
    worker.process_messages();

    worker.halt(net).unwrap();
    assert_eq!(process.net_state(net), Some(NetState::Halting));
    // Still held until the halt message is handled
    assert!(worker.get_net(net).is_some());

    worker.process_messages();
    assert!(worker.get_net(net).is_none());
    worker.process_messages();
    assert_eq!(process.net_state(net), Some(NetState::Halted));
    assert_eq!(process.live_nets(), 0);

    // Halting again is harmless; tokens for a retired net are refused
    worker.halt(net).unwrap();
    assert!(matches!(
        worker.send(P0, net, 0, Bytes::new()),
        Err(RuntimeError::UnknownNet { .. })
    ));
}

#[test]
fn test_unknown_template_and_worker() {
    let (process, _transport) = process_on(P0, 1, manual_config());
    let worker = process.worker(W0).unwrap();
    assert!(matches!(
        worker.spawn_net(7, None),
        Err(RuntimeError::UnknownTemplate { index: 7, count: 2 })
    ));
    assert!(matches!(
        process.worker(WorkerId::new(4)),
        Err(RuntimeError::UnknownWorker { .. })
    ));
    assert_eq!(process.live_nets(), 0);
}

#[test]
fn test_duplicate_requested_id_is_rejected() {
    let (process, _transport) = process_on(P0, 1, manual_config());
    let net = process.spawn_net(W0, SINK, None, None, false).unwrap();
    assert!(matches!(
        process.spawn_net(W0, SINK, Some(net), None, false),
        Err(RuntimeError::DuplicateNet { .. })
    ));
}

#[test]
fn test_global_spawn_from_peer_creates_copy() {
    let (process, transport) = process_on(P1, 2, manual_config());
    let mut worker = process.worker(W0).unwrap();
    let net = NetId::new(0);

    let spawned = ServiceMessage::NetSpawned {
        net,
        def_index: SINK as u32,
        parent: None,
        origin: P0,
    };
    transport.inject(spawned.to_packet(P0).unwrap());
    transport.inject(Packet::tokens(
        P0,
        network::TokensHeader {
            place_index: 1,
            net_id: net.raw(),
            tokens_count: 4,
        },
        b"",
    ));
    assert_eq!(process.process_packets(), 2);
    worker.process_messages();
    assert_eq!(sink_tokens(&worker.get_net(net).unwrap().report(), 1), 4);
    assert!(process.arena().slot(net).unwrap().global);

    // A peer's halt stops the copy, acknowledges and reclaims it
    transport.inject(ServiceMessage::NetHalted { net, origin: P0 }.to_packet(P0).unwrap());
    process.process_packets();
    worker.process_messages();
    worker.process_messages();
    assert_eq!(process.net_state(net), Some(NetState::Halted));
    let acks = service_messages(&transport.take_sent());
    assert_eq!(acks, vec![(P0, ServiceMessage::HaltAck { net, from: P1 })]);
}

#[test]
fn test_global_halt_waits_for_every_ack() {
    let (process, transport) = process_on(P0, 3, manual_config());
    let mut worker = process.worker(W0).unwrap();
    let net = worker.spawn_global(SINK, None).unwrap();
    worker.process_messages();
    transport.take_sent();

    worker.halt(net).unwrap();
    worker.process_messages();
    let announced = service_messages(&transport.take_sent());
    assert_eq!(announced.len(), 2);
    assert!(announced
        .iter()
        .all(|(_, msg)| *msg == ServiceMessage::NetHalted { net, origin: P0 }));

    worker.process_messages();
    assert_eq!(process.net_state(net), Some(NetState::Halting));

    transport.inject(ServiceMessage::HaltAck { net, from: P1 }.to_packet(P1).unwrap());
    process.process_packets();
    worker.process_messages();
    assert_eq!(process.net_state(net), Some(NetState::Halting));

    transport.inject(ServiceMessage::HaltAck { net, from: P2 }.to_packet(P2).unwrap());
    process.process_packets();
    worker.process_messages();
    assert_eq!(process.net_state(net), Some(NetState::Halted));
    assert!(process.arena().is_drained());
}

#[test]
fn test_unreachable_peer_does_not_block_reclaim() {
    let (process, transport) = process_on(P0, 2, manual_config());
    let mut worker = process.worker(W0).unwrap();
    let net = worker.spawn_global(SINK, None).unwrap();
    worker.process_messages();

    transport.fail_target(P1);
    worker.halt(net).unwrap();
    worker.process_messages();
    worker.process_messages();
    assert_eq!(process.net_state(net), Some(NetState::Halted));
}

#[test]
fn test_malformed_and_stray_packets_are_dropped() {
    let (process, transport) = process_on(P0, 2, manual_config());
    transport.inject(Packet::service(P1, Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef, 0xff])));
    transport.inject(ServiceMessage::HaltAck { net: NetId::new(8), from: P1 }.to_packet(P1).unwrap());
    transport.inject(Packet::tokens(
        P1,
        network::TokensHeader {
            place_index: 0,
            net_id: 99,
            tokens_count: 1,
        },
        b"z",
    ));
    assert_eq!(process.process_packets(), 3);
    assert_eq!(process.get_stats().protocol_errors, 3);
    assert_eq!(process.obligations(), 0);
}

#[test]
fn test_unknown_halt_is_still_acknowledged() {
    let (process, transport) = process_on(P1, 2, manual_config());
    let net = NetId::new(40);
    transport.inject(ServiceMessage::NetHalted { net, origin: P0 }.to_packet(P0).unwrap());
    process.process_packets();
    assert_eq!(
        service_messages(&transport.take_sent()),
        vec![(P0, ServiceMessage::HaltAck { net, from: P1 })]
    );
    assert_eq!(process.obligations(), 0);
}

#[test]
fn test_autohalt_waits_for_live_nets() {
    let config = ProcessConfig {
        threads: 1,
        ..ProcessConfig::default()
    };
    let (process, _transport) = process_on(P0, 1, config);
    let mut worker = process.worker(W0).unwrap();
    let net = worker.spawn_net(SINK, None).unwrap();

    for _ in 0..10 {
        worker.run_once();
        assert!(!process.is_quitting());
    }

    worker.halt(net).unwrap();
    for _ in 0..3 {
        worker.run_once();
    }
    assert!(process.is_quitting());
}

#[test]
fn test_firing_consumes_tokens() {
    let (process, _transport) = process_on(P0, 1, manual_config());
    let mut worker = process.worker(W0).unwrap();
    let net = worker.spawn_net(SINK, None).unwrap();
    worker.process_messages();
    worker
        .multisend(P0, net, 0, TokenBatch::new(2, Bytes::new()))
        .unwrap();
    worker.process_messages();

    assert_eq!(worker.fire_ready(), 1);
    assert_eq!(worker.fire_ready(), 1);
    assert_eq!(worker.fire_ready(), 0);
    let report = worker.get_net(net).unwrap().report();
    assert_eq!(report["fired"], 2);

    // Explicit firing goes through the inbox
    process.fire_transition(net, 0).unwrap();
    worker.process_messages();
    assert_eq!(worker.report().firings, 2);
}

#[test]
fn test_migration_moves_ownership() {
    let config = ProcessConfig {
        threads: 2,
        autohalt: false,
        ..ProcessConfig::default()
    };
    let (process, _transport) = process_on(P0, 1, config);
    let mut w0 = process.worker(W0).unwrap();
    let mut w1 = process.worker(WorkerId::new(1)).unwrap();

    let net = w0.spawn_net(SINK, None).unwrap();
    w0.process_messages();
    w0.migrate_net(net, WorkerId::new(1)).unwrap();
    assert!(w0.get_net(net).is_none());
    assert_eq!(process.arena().live_owner(net), Some(WorkerId::new(1)));

    // Tokens follow the arena owner
    w0.send(P0, net, 5, Bytes::new()).unwrap();
    w1.process_messages();
    assert_eq!(sink_tokens(&w1.get_net(net).unwrap().report(), 5), 1);
    assert_eq!(w1.owned_nets(), vec![net]);
}

#[test]
fn test_lifecycle_order() {
    let config = ProcessConfig {
        threads: 2,
        ..ProcessConfig::default()
    };
    let (process, _transport) = process_on(P0, 1, config);
    assert!(matches!(process.join(), Err(RuntimeError::Lifecycle(_))));

    process.start().unwrap();
    assert!(matches!(process.start(), Err(RuntimeError::Lifecycle(_))));
    // Nothing to do: autohalt stops the process on its own
    process.join().unwrap();
    assert!(process.is_quitting());
    assert!(matches!(process.join(), Err(RuntimeError::Lifecycle(_))));

    let report = process.write_reports();
    assert_eq!(report.workers.len(), 2);
    assert_eq!(report.live_nets, 0);
}

#[test]
fn test_single_process_ring_runs_to_completion() {
    let ring = RingDef::new(5);
    let hops = Arc::clone(&ring.hops);
    let transport = Arc::new(MemoryTransport::new(P0, 1));
    let process = Process::new(ProcessConfig::default(), templates(ring), transport).unwrap();

    let net = process.spawn_initial(RING).unwrap().unwrap();
    process.run().unwrap();

    assert_eq!(hops.load(std::sync::atomic::Ordering::SeqCst), 5);
    assert_eq!(process.net_state(net), Some(NetState::Halted));
    let report = process.write_reports();
    assert_eq!(report.retired_nets, 1);
    assert_eq!(report.stats.local_deliveries, 5);
}

#[test]
fn test_halt_ahead_of_adoption_is_not_lost() {
    let config = ProcessConfig {
        threads: 2,
        autohalt: false,
        ..ProcessConfig::default()
    };
    let (process, _transport) = process_on(P0, 1, config);
    let w1_id = WorkerId::new(1);
    let mut w0 = process.worker(W0).unwrap();
    let mut w1 = process.worker(w1_id).unwrap();

    let net = w0.spawn_net(SINK, None).unwrap();
    w0.process_messages();

    // Ownership moves first, the halt lands before the instance does
    let instance = w0.remove_net(net).unwrap();
    process.arena().set_owner(net, w1_id).unwrap();
    process.halt(W0, net).unwrap();
    process.migrate_net(instance, w1_id).unwrap();
    assert_eq!(process.queued_messages(w1_id), 2);

    w1.process_messages();
    assert!(w1.get_net(net).is_some());
    assert_eq!(process.net_state(net), Some(NetState::Halting));
    assert_eq!(process.queued_messages(w1_id), 1);

    w1.process_messages();
    w1.process_messages();
    assert_eq!(process.net_state(net), Some(NetState::Halted));
    assert_eq!(process.obligations(), 0);
    assert_eq!(w1.report().reclaimed, 1);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "got a message for unknown")]
fn test_message_for_unknown_net_is_fatal_in_debug() {
    let (process, _transport) = process_on(P0, 1, manual_config());
    let mut worker = process.worker(W0).unwrap();
    process
        .post(
            W0,
            WorkerMessage::Tokens {
                net: NetId::new(999),
                place: 0,
                batch: TokenBatch::new(1, Bytes::new()),
            },
        )
        .unwrap();
    worker.process_messages();
}
