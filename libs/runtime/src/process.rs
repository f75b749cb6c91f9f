//! Process
//!
//! One member of the cluster. A process owns the template table, the net
//! arena, the per-worker inboxes and the transport endpoint, and is shared
//! by all of its worker threads behind an `Arc`.
//!
//! Routing rule: tokens for a net on this process go straight into the
//! owning worker's inbox; everything else is handed to the transport.
//! Service messages pulled from the transport are consumed here, exactly
//! once, by whichever worker happens to drain the backend.

use crate::arena::{AckOutcome, HaltOutcome, NetArena, NetState};
use crate::barrier::ClusterBarrier;
use crate::ids::{NetId, NetIdAllocator, PlaceIndex, TransitionIndex, WorkerId};
use crate::messages::{BarrierPhase, ServiceMessage, WorkerMessage};
use crate::net::{Net, NetDef, NetDefs, SpawnContext, TokenBatch};
use crate::quiescence::{ProbeSnapshot, Quiescence, Verdict};
use crate::report::{NetSummary, ProcessMetrics, ProcessReport, ProcessStats, WorkerReport};
use crate::trace::TraceLog;
use crate::worker::Worker;
use crate::{Result, RuntimeError};
use cluster_config::ClusterConfig;
use network::{Packet, ProcessId, Tag, TokensHeader, Transport, TransportError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Packets drained from the backend per call
const PACKET_BATCH: usize = 256;

/// Process-level settings
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Worker threads
    pub threads: usize,
    /// Stop the cluster once nothing is left to do
    pub autohalt: bool,
    /// Minimum spacing between termination waves
    pub probe_interval: Duration,
    /// Worker back-off when an iteration made no progress
    pub idle_sleep: Duration,
    /// Where worker trace logs go
    pub trace_dir: Option<PathBuf>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            threads: cluster_config::defaults::THREADS,
            autohalt: true,
            probe_interval: Duration::from_millis(cluster_config::defaults::PROBE_INTERVAL_MS),
            idle_sleep: Duration::from_micros(cluster_config::defaults::IDLE_SLEEP_US),
            trace_dir: None,
        }
    }
}

impl From<&ClusterConfig> for ProcessConfig {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            threads: config.threads,
            autohalt: config.autohalt,
            probe_interval: config.probe_interval(),
            idle_sleep: config.idle_sleep(),
            trace_dir: config.log.trace_dir.clone(),
        }
    }
}

/// Per-target outcome of a multicast
#[derive(Debug, Default)]
pub struct MulticastReport {
    pub results: Vec<(ProcessId, Result<()>)>,
}

impl MulticastReport {
    pub fn delivered(&self) -> usize {
        self.results.iter().filter(|(_, result)| result.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (ProcessId, &RuntimeError)> {
        self.results
            .iter()
            .filter_map(|(target, result)| result.as_ref().err().map(|err| (*target, err)))
    }

    /// Every target accepted the tokens
    pub fn is_complete(&self) -> bool {
        self.results.iter().all(|(_, result)| result.is_ok())
    }

    /// First failure, if any
    pub fn into_result(self) -> Result<()> {
        self.results
            .into_iter()
            .map(|(_, result)| result)
            .find(|result| result.is_err())
            .unwrap_or(Ok(()))
    }
}

/// Worker inbox
#[derive(Debug, Default)]
pub(crate) struct Inbox {
    queue: Mutex<VecDeque<WorkerMessage>>,
}

impl Inbox {
    fn push(&self, message: WorkerMessage) {
        self.queue.lock().push_back(message);
    }

    /// Take everything queued so far
    pub(crate) fn drain(&self) -> VecDeque<WorkerMessage> {
        std::mem::take(&mut *self.queue.lock())
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

pub struct Process {
    id: ProcessId,
    process_count: usize,
    config: ProcessConfig,
    defs: NetDefs,
    transport: Arc<dyn Transport>,
    ids: NetIdAllocator,
    arena: NetArena,
    inboxes: Vec<Inbox>,
    /// Queued obligation messages not yet fully handled
    obligations: AtomicUsize,
    quit: AtomicBool,
    quit_sent: AtomicBool,
    /// Serialises packet dispatch and idle snapshots
    receive_lock: Mutex<()>,
    next_owner: AtomicUsize,
    quiescence: Quiescence,
    barrier: ClusterBarrier,
    pub(crate) start_barrier: Barrier,
    pub(crate) teardown_barrier: Barrier,
    threads: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    joined: AtomicBool,
    worker_reports: Mutex<Vec<WorkerReport>>,
    metrics: ProcessMetrics,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("process_count", &self.process_count)
            .field("threads", &self.config.threads)
            .field("templates", &self.defs.len())
            .field("transport", &self.transport.transport_type())
            .finish()
    }
}

impl Process {
    /// Build a process around a transport endpoint
    pub fn new(config: ProcessConfig, defs: NetDefs, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        if config.threads == 0 {
            return Err(RuntimeError::configuration(
                "a process needs at least one worker thread",
                Some("threads"),
            ));
        }
        if defs.is_empty() {
            warn!("Process created with an empty template table");
        }

        let id = transport.local_process();
        let process_count = transport.process_count();
        let ids = NetIdAllocator::new(id, process_count)?;

        info!(
            process = %id,
            process_count,
            threads = config.threads,
            templates = defs.len(),
            backend = %transport.transport_type(),
            "Process created"
        );

        Ok(Arc::new(Self {
            id,
            process_count,
            ids,
            arena: NetArena::new(),
            inboxes: (0..config.threads).map(|_| Inbox::default()).collect(),
            obligations: AtomicUsize::new(0),
            quit: AtomicBool::new(false),
            quit_sent: AtomicBool::new(false),
            receive_lock: Mutex::new(()),
            next_owner: AtomicUsize::new(0),
            quiescence: Quiescence::new(id, process_count, config.probe_interval),
            barrier: ClusterBarrier::new(process_count),
            start_barrier: Barrier::new(config.threads),
            teardown_barrier: Barrier::new(config.threads),
            threads: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            joined: AtomicBool::new(false),
            worker_reports: Mutex::new(Vec::new()),
            metrics: ProcessMetrics::default(),
            config,
            defs,
            transport,
        }))
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn process_count(&self) -> usize {
        self.process_count
    }

    pub fn threads(&self) -> usize {
        self.config.threads
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn arena(&self) -> &NetArena {
        &self.arena
    }

    pub fn templates(&self) -> &NetDefs {
        &self.defs
    }

    pub fn is_quitting(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    pub fn net_state(&self, net: NetId) -> Option<NetState> {
        self.arena.state(net)
    }

    pub fn live_nets(&self) -> usize {
        self.arena.live_count()
    }

    /// Obligation messages queued or being handled
    pub fn obligations(&self) -> usize {
        self.obligations.load(Ordering::Acquire)
    }

    /// Messages waiting in one worker's inbox
    pub fn queued_messages(&self, worker: WorkerId) -> usize {
        self.inboxes.get(worker.index()).map_or(0, Inbox::len)
    }

    pub fn get_stats(&self) -> ProcessStats {
        self.metrics.get_stats()
    }

    pub(crate) fn inbox(&self, worker: WorkerId) -> Result<&Inbox> {
        self.inboxes
            .get(worker.index())
            .ok_or(RuntimeError::UnknownWorker { worker })
    }

    pub(crate) fn check_worker(&self, worker: WorkerId) -> Result<()> {
        self.inbox(worker).map(|_| ())
    }

    /// A worker handle for driving the scheduler by hand.
    ///
    /// Only one handle per worker id may exist at a time; the threads
    /// started by [`Process::start`] own theirs.
    pub fn worker(self: &Arc<Self>, id: WorkerId) -> Result<Worker> {
        self.check_worker(id)?;
        Ok(Worker::new(Arc::clone(self), id))
    }

    /// Fresh id from this process's share of the id space
    pub fn new_net_id(&self) -> Result<NetId> {
        self.ids.next()
    }

    // ----- Worker messages -----

    /// Queue a message for `worker`
    pub fn post(&self, worker: WorkerId, message: WorkerMessage) -> Result<()> {
        let inbox = self.inbox(worker)?;
        if message.is_obligation() {
            self.obligations.fetch_add(1, Ordering::AcqRel);
        }
        trace!(process = %self.id, worker = %worker, ?message, "Posting worker message");
        inbox.push(message);
        Ok(())
    }

    /// Queue a message whose obligation was already counted
    fn post_counted(&self, worker: WorkerId, message: WorkerMessage) {
        match self.inbox(worker) {
            Ok(inbox) => inbox.push(message),
            Err(e) => {
                error!(process = %self.id, error = %e, ?message, "Dropping message for missing worker");
                self.complete_obligation();
            }
        }
    }

    /// A worker finished handling one obligation message
    pub(crate) fn complete_obligation(&self) {
        let previous = self.obligations.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "obligation counter underflow");
    }

    // ----- Spawning -----

    /// Spawn an instance of template `def_index` on `worker`.
    ///
    /// A global spawn tells every peer before the local copy is handed to
    /// its worker, so any token sent for the new id afterwards finds the
    /// copy in place on arrival.
    pub fn spawn_net(
        &self,
        worker: WorkerId,
        def_index: usize,
        requested: Option<NetId>,
        parent: Option<NetId>,
        global: bool,
    ) -> Result<NetId> {
        self.check_worker(worker)?;
        let def = self.template(def_index)?;
        let net = match requested {
            Some(net) => net,
            None => self.new_net_id()?,
        };
        let instance = self.create_instance(worker, def.as_ref(), def_index, net, parent, global)?;

        if global && self.process_count > 1 {
            let message = ServiceMessage::NetSpawned {
                net,
                def_index: def_index as u32,
                parent,
                origin: self.id,
            };
            for (target, err) in self.broadcast_service(&message).failures() {
                ProcessMetrics::incr(&self.metrics.transport_errors);
                error!(process = %self.id, net = %net, target = %target, error = %err, "Global spawn not delivered");
            }
        }

        self.post(worker, WorkerMessage::Adopt(instance))?;
        Ok(net)
    }

    /// Spawn the program's root net on process 0; a no-op elsewhere.
    ///
    /// Call before [`Process::start`] so the cluster cannot look idle
    /// before the root exists.
    pub fn spawn_initial(&self, def_index: usize) -> Result<Option<NetId>> {
        if self.id.raw() != 0 {
            return Ok(None);
        }
        let net = self.spawn_net(WorkerId::new(0), def_index, None, None, true)?;
        info!(process = %self.id, net = %net, template = def_index, "Initial net spawned");
        Ok(Some(net))
    }

    fn template(&self, def_index: usize) -> Result<Arc<dyn NetDef>> {
        self.defs
            .get(def_index)
            .cloned()
            .ok_or(RuntimeError::UnknownTemplate {
                index: def_index,
                count: self.defs.len(),
            })
    }

    fn create_instance(
        &self,
        worker: WorkerId,
        def: &dyn NetDef,
        def_index: usize,
        net: NetId,
        parent: Option<NetId>,
        global: bool,
    ) -> Result<Box<dyn Net>> {
        self.arena.insert(net, def_index, worker, parent, global)?;
        let instance = def.instantiate(SpawnContext {
            net,
            def_index,
            parent,
            process: self.id,
            process_count: self.process_count,
            global,
        });
        debug_assert_eq!(instance.id(), net, "template returned an instance with a foreign id");
        ProcessMetrics::incr(&self.metrics.nets_spawned);
        debug!(
            process = %self.id,
            net = %net,
            template = def.name(),
            worker = %worker,
            global,
            "Net spawned"
        );
        Ok(instance)
    }

    /// Local copy of a global net spawned by a peer
    fn spawn_copy(&self, def_index: usize, net: NetId, parent: Option<NetId>) -> Result<()> {
        let worker = self.next_owner();
        let def = self.template(def_index)?;
        let instance = self.create_instance(worker, def.as_ref(), def_index, net, parent, true)?;
        self.post(worker, WorkerMessage::Adopt(instance))
    }

    fn next_owner(&self) -> WorkerId {
        let next = self.next_owner.fetch_add(1, Ordering::Relaxed);
        WorkerId::new((next % self.config.threads) as u32)
    }

    /// Bind a net to the worker that just took it
    pub fn inform_new_network(&self, net: NetId, worker: WorkerId) -> Result<NetState> {
        let state = self.arena.activate(net, worker)?;
        trace!(process = %self.id, net = %net, worker = %worker, ?state, "Net adopted");
        Ok(state)
    }

    /// Hand an instance to another worker of this process
    pub fn migrate_net(&self, net: Box<dyn Net>, target: WorkerId) -> Result<()> {
        self.check_worker(target)?;
        let id = net.id();
        self.arena.set_owner(id, target)?;
        self.post(target, WorkerMessage::Adopt(net))?;
        debug!(process = %self.id, net = %id, worker = %target, "Net migrated");
        Ok(())
    }

    // ----- Token routing -----

    /// Deliver a batch of tokens to `place` of `net` on process `target`.
    ///
    /// `Ok` for a remote target means the backend accepted the packet. A
    /// TCP write that fails afterwards is reported by [`Process::poll_requests`]
    /// and counted in `transport_errors`; the peer is then marked
    /// unreachable and every later send to it fails here.
    pub fn multisend(
        &self,
        worker: WorkerId,
        target: ProcessId,
        net: NetId,
        place: PlaceIndex,
        batch: TokenBatch,
    ) -> Result<()> {
        if target == self.id {
            let owner = self
                .arena
                .live_owner(net)
                .ok_or(RuntimeError::UnknownNet { net })?;
            self.post(owner, WorkerMessage::Tokens { net, place, batch })?;
            ProcessMetrics::incr(&self.metrics.local_deliveries);
            return Ok(());
        }

        let header = TokensHeader {
            place_index: place,
            net_id: net.raw(),
            tokens_count: batch.tokens_count,
        };
        let packet = Packet::tokens(self.id, header, &batch.payload);
        if let Err(e) = self.transport.send(target, packet) {
            ProcessMetrics::incr(&self.metrics.transport_errors);
            warn!(
                process = %self.id,
                worker = %worker,
                target = %target,
                net = %net,
                error = %e,
                "Token send failed"
            );
            return Err(e.into());
        }
        self.quiescence.record_sent();
        ProcessMetrics::incr(&self.metrics.remote_deliveries);
        Ok(())
    }

    /// Deliver the same batch to several processes.
    ///
    /// Each distinct target gets exactly one copy; a failing target does
    /// not stop delivery to the others.
    pub fn multisend_multicast(
        &self,
        worker: WorkerId,
        targets: &[ProcessId],
        net: NetId,
        place: PlaceIndex,
        batch: TokenBatch,
    ) -> MulticastReport {
        let mut report = MulticastReport::default();
        for &target in targets {
            if report.results.iter().any(|(seen, _)| *seen == target) {
                continue;
            }
            let result = self.multisend(worker, target, net, place, batch.clone());
            report.results.push((target, result));
        }
        report
    }

    /// Ask a net's owner to fire one transition
    pub fn fire_transition(&self, net: NetId, transition: TransitionIndex) -> Result<()> {
        let owner = self
            .arena
            .live_owner(net)
            .ok_or(RuntimeError::UnknownNet { net })?;
        self.post(owner, WorkerMessage::Fire { net, transition })
    }

    // ----- Halting -----

    /// Request that `net` stop. Always asynchronous: the owner acts on it
    /// from its inbox.
    pub fn halt(&self, worker: WorkerId, net: NetId) -> Result<()> {
        self.check_worker(worker)?;
        // Counted before the state flips so the process never looks idle
        // between the two
        self.obligations.fetch_add(1, Ordering::AcqRel);
        match self.arena.begin_halt(net) {
            Ok(HaltOutcome::Started { owner, .. }) => {
                debug!(process = %self.id, net = %net, requested_by = %worker, owner = %owner, "Halt requested");
                self.post_counted(owner, WorkerMessage::Halt { net, origin: None });
                Ok(())
            }
            Ok(HaltOutcome::AlreadyHalting) => {
                self.complete_obligation();
                debug!(process = %self.id, net = %net, "Net already halting");
                Ok(())
            }
            Err(e) => {
                self.complete_obligation();
                Err(e)
            }
        }
    }

    /// Called by the owner once a net stopped firing.
    ///
    /// A locally started halt of a global net is announced to every peer
    /// and reclaimed after all of them acknowledged; a halt caused by a
    /// peer is acknowledged back to that peer.
    pub fn inform_halt_network(&self, net: NetId, worker: WorkerId, origin: Option<ProcessId>) {
        let Some(slot) = self.arena.slot(net) else {
            warn!(process = %self.id, net = %net, "Halted net has no slot");
            return;
        };

        match origin {
            Some(origin) => {
                let ack = ServiceMessage::HaltAck { net, from: self.id };
                if let Err(e) = self.send_service(origin, &ack) {
                    ProcessMetrics::incr(&self.metrics.transport_errors);
                    error!(process = %self.id, net = %net, target = %origin, error = %e, "Halt ack not delivered");
                }
                self.post_reclaim(worker, net);
            }
            None if slot.global && self.process_count > 1 => {
                let peers = self.process_count - 1;
                // Expected acks are recorded before anyone can answer
                if let Err(e) = self.arena.expect_acks(net, peers) {
                    warn!(process = %self.id, net = %net, error = %e, "Cannot wait for halt acks");
                    self.post_reclaim(worker, net);
                    return;
                }
                let report = self.broadcast_service(&ServiceMessage::NetHalted { net, origin: self.id });
                for (target, err) in report.failures() {
                    ProcessMetrics::incr(&self.metrics.transport_errors);
                    error!(process = %self.id, net = %net, target = %target, error = %err, "Global halt not delivered");
                    // An unreachable peer will never answer
                    if let Ok(AckOutcome::Complete { owner }) = self.arena.acknowledge(net) {
                        self.post_reclaim(owner, net);
                    }
                }
                debug!(process = %self.id, net = %net, peers, "Global halt announced");
            }
            None => self.post_reclaim(worker, net),
        }
    }

    fn post_reclaim(&self, worker: WorkerId, net: NetId) {
        if let Err(e) = self.post(worker, WorkerMessage::Reclaim(net)) {
            error!(process = %self.id, net = %net, error = %e, "Cannot schedule reclaim");
        }
    }

    /// A net was reclaimed; see whether the cluster can stop
    pub fn autohalt_check(&self, net: NetId) {
        ProcessMetrics::incr(&self.metrics.nets_reclaimed);
        debug!(
            process = %self.id,
            net = %net,
            live = self.arena.live_count(),
            halting = self.arena.halting_count(),
            "Net reclaimed"
        );
        self.quiescence_tick();
    }

    // ----- Control traffic -----

    /// Send a packet to every peer except `exclude`
    pub fn broadcast_packet(&self, packet: &Packet, exclude: Option<ProcessId>) -> MulticastReport {
        let mut report = MulticastReport::default();
        for target in (0..self.process_count as u32).map(ProcessId::new) {
            if target == self.id || Some(target) == exclude {
                continue;
            }
            let result = self.transport.send(target, packet.clone()).map_err(RuntimeError::from);
            report.results.push((target, result));
        }
        report
    }

    fn broadcast_service(&self, message: &ServiceMessage) -> MulticastReport {
        let packet = match message.to_packet(self.id) {
            Ok(packet) => packet,
            Err(e) => {
                let mut report = MulticastReport::default();
                error!(process = %self.id, kind = message.kind(), error = %e, "Cannot encode service message");
                report.results.push((self.id, Err(e)));
                return report;
            }
        };
        let report = self.broadcast_packet(&packet, None);
        if message.is_work() {
            for _ in 0..report.delivered() {
                self.quiescence.record_sent();
            }
        }
        report
    }

    fn send_service(&self, target: ProcessId, message: &ServiceMessage) -> Result<()> {
        self.transport.send(target, message.to_packet(self.id)?)?;
        if message.is_work() {
            self.quiescence.record_sent();
        }
        Ok(())
    }

    /// Drain inbound packets from the backend and dispatch them.
    ///
    /// Only one worker drains at a time; the others return immediately.
    pub fn process_packets(&self) -> usize {
        let Some(_guard) = self.receive_lock.try_lock() else {
            return 0;
        };
        let mut handled = 0;
        while handled < PACKET_BATCH {
            match self.transport.try_receive() {
                Ok(Some(packet)) => {
                    self.process_packet(packet);
                    handled += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    ProcessMetrics::incr(&self.metrics.transport_errors);
                    warn!(process = %self.id, error = %e, "Receive failed");
                    break;
                }
            }
        }
        handled
    }

    fn process_packet(&self, packet: Packet) {
        match packet.tag {
            Tag::Tokens => {
                self.quiescence.record_received();
                match packet.decode_tokens() {
                    Ok((header, payload)) => self.deliver_remote(header, payload, packet.source),
                    Err(e) => self.protocol_error(packet.source, &e),
                }
            }
            Tag::Service => match ServiceMessage::from_packet(&packet) {
                Ok(message) => self.process_service_message(message),
                Err(e) => self.protocol_error(packet.source, &e),
            },
        }
    }

    fn protocol_error(&self, source: ProcessId, err: &dyn std::fmt::Display) {
        ProcessMetrics::incr(&self.metrics.protocol_errors);
        warn!(process = %self.id, source = %source, error = %err, "Dropping malformed packet");
    }

    fn deliver_remote(&self, header: TokensHeader, payload: bytes::Bytes, source: ProcessId) {
        let net = NetId::new(header.net_id);
        let batch = TokenBatch::new(header.tokens_count, payload);
        match self.arena.live_owner(net) {
            Some(owner) => {
                let message = WorkerMessage::Tokens {
                    net,
                    place: header.place_index,
                    batch,
                };
                if let Err(e) = self.post(owner, message) {
                    error!(process = %self.id, net = %net, error = %e, "Cannot deliver tokens");
                }
            }
            None => {
                ProcessMetrics::incr(&self.metrics.protocol_errors);
                match self.arena.state(net) {
                    Some(state) => {
                        debug!(process = %self.id, net = %net, source = %source, ?state, "Dropping tokens for halted net")
                    }
                    None => {
                        warn!(process = %self.id, net = %net, source = %source, "Dropping tokens for unknown net")
                    }
                }
            }
        }
    }

    /// Consume one control message from a peer
    pub fn process_service_message(&self, message: ServiceMessage) {
        trace!(process = %self.id, kind = message.kind(), "Service message");
        match message {
            ServiceMessage::NetSpawned {
                net,
                def_index,
                parent,
                origin,
            } => {
                self.quiescence.record_received();
                if let Err(e) = self.spawn_copy(def_index as usize, net, parent) {
                    ProcessMetrics::incr(&self.metrics.protocol_errors);
                    warn!(process = %self.id, net = %net, origin = %origin, error = %e, "Rejected global spawn");
                }
            }
            ServiceMessage::NetHalted { net, origin } => self.remote_halt(net, origin),
            ServiceMessage::HaltAck { net, from } => match self.arena.acknowledge(net) {
                Ok(AckOutcome::Waiting(remaining)) => {
                    trace!(process = %self.id, net = %net, from = %from, remaining, "Halt ack")
                }
                Ok(AckOutcome::Complete { owner }) => {
                    debug!(process = %self.id, net = %net, "All peers acknowledged halt");
                    self.post_reclaim(owner, net);
                }
                Err(e) => {
                    ProcessMetrics::incr(&self.metrics.protocol_errors);
                    warn!(process = %self.id, net = %net, from = %from, error = %e, "Unexpected halt ack");
                }
            },
            ServiceMessage::Quit { origin } => {
                info!(process = %self.id, origin = %origin, "Quit received");
                self.quit.store(true, Ordering::Release);
            }
            ServiceMessage::Barrier { phase, from } => {
                self.barrier.arrive(phase, from);
            }
            ServiceMessage::Probe { wave } => self.answer_probe(wave),
            ServiceMessage::ProbeReply {
                wave,
                from,
                idle,
                sent,
                received,
            } => self.collect_probe_reply(wave, from, ProbeSnapshot { idle, sent, received }),
        }
    }

    fn remote_halt(&self, net: NetId, origin: ProcessId) {
        self.obligations.fetch_add(1, Ordering::AcqRel);
        match self.arena.begin_halt(net) {
            Ok(HaltOutcome::Started { owner, .. }) => {
                debug!(process = %self.id, net = %net, origin = %origin, "Peer halted global net");
                self.post_counted(owner, WorkerMessage::Halt { net, origin: Some(origin) });
                return;
            }
            Ok(HaltOutcome::AlreadyHalting) => {}
            Err(e) => {
                ProcessMetrics::incr(&self.metrics.protocol_errors);
                warn!(process = %self.id, net = %net, origin = %origin, error = %e, "Halt for unknown net");
            }
        }
        self.complete_obligation();
        // Nothing left to stop here; answer so the origin can reclaim
        if let Err(e) = self.send_service(origin, &ServiceMessage::HaltAck { net, from: self.id }) {
            ProcessMetrics::incr(&self.metrics.transport_errors);
            error!(process = %self.id, net = %net, target = %origin, error = %e, "Halt ack not delivered");
        }
    }

    // ----- Termination -----

    /// Nothing queued, nothing live, nothing halting, nothing inbound
    fn is_locally_idle(&self) -> bool {
        self.arena.is_drained() && self.obligations() == 0 && !self.transport.has_inbound()
    }

    fn answer_probe(&self, wave: u64) {
        if self.is_quitting() {
            return;
        }
        let snapshot = self.quiescence.snapshot(|| self.is_locally_idle());
        let reply = ServiceMessage::ProbeReply {
            wave,
            from: self.id,
            idle: snapshot.idle,
            sent: snapshot.sent,
            received: snapshot.received,
        };
        if let Err(e) = self.send_service(ProcessId::new(0), &reply) {
            warn!(process = %self.id, wave, error = %e, "Probe reply not delivered");
        }
    }

    fn collect_probe_reply(&self, wave: u64, from: ProcessId, snapshot: ProbeSnapshot) {
        if !self.quiescence.is_coordinator() {
            ProcessMetrics::incr(&self.metrics.protocol_errors);
            warn!(process = %self.id, from = %from, "Probe reply sent to a non-coordinator");
            return;
        }
        if let Verdict::Quiescent(totals) = self.quiescence.on_reply(wave, from, snapshot) {
            info!(
                process = %self.id,
                wave,
                work_packets = totals.sent,
                "Cluster quiescent"
            );
            self.quit_all();
        }
    }

    /// Autohalt driver, run by worker 0 on every scheduler iteration
    pub fn quiescence_tick(&self) {
        if !self.config.autohalt || self.is_quitting() {
            return;
        }
        let Some(_guard) = self.receive_lock.try_lock() else {
            return;
        };
        if self.process_count == 1 {
            if self.is_locally_idle() {
                info!(process = %self.id, "No work left");
                self.quit_all();
            }
            return;
        }
        if !self.quiescence.is_coordinator() {
            return;
        }

        let own = self.quiescence.snapshot(|| self.is_locally_idle());
        if !own.idle {
            return;
        }
        if let Some(wave) = self.quiescence.begin_wave(own, Instant::now()) {
            for (target, err) in self.broadcast_service(&ServiceMessage::Probe { wave }).failures() {
                warn!(process = %self.id, wave, target = %target, error = %err, "Probe not delivered");
            }
        }
    }

    /// Stop every process of the cluster; idempotent
    pub fn quit_all(&self) {
        if !self.quit_sent.swap(true, Ordering::AcqRel) {
            info!(process = %self.id, "Quitting cluster");
            let report = self.broadcast_service(&ServiceMessage::Quit { origin: self.id });
            for (target, err) in report.failures() {
                warn!(process = %self.id, target = %target, error = %err, "Quit not delivered");
            }
        }
        self.quit.store(true, Ordering::Release);
    }

    /// Reap finished asynchronous sends and report the failed ones
    pub fn poll_requests(&self) -> usize {
        let poll = self.transport.poll_requests();
        for (target, err) in &poll.failures {
            ProcessMetrics::incr(&self.metrics.transport_errors);
            error!(process = %self.id, target = %target, error = %err, "Asynchronous send failed");
        }
        poll.completed + poll.failures.len()
    }

    /// Block until every process reached `phase`.
    ///
    /// Inbound packets keep being dispatched while waiting.
    pub fn cluster_barrier(&self, phase: BarrierPhase) -> Result<()> {
        self.barrier.arrive(phase, self.id);
        let report = self.broadcast_service(&ServiceMessage::Barrier { phase, from: self.id });
        if let Some(err) = report.into_result().err() {
            error!(process = %self.id, ?phase, error = %err, "Barrier arrival not delivered");
            return Err(err);
        }

        debug!(process = %self.id, ?phase, "Waiting at cluster barrier");
        loop {
            self.process_packets();
            self.poll_requests();
            if self.barrier.is_complete(phase) {
                debug!(process = %self.id, ?phase, "Cluster barrier passed");
                return Ok(());
            }
            if !self.transport.is_healthy() {
                // Arrivals may still be queued behind the failure
                self.process_packets();
                if self.barrier.is_complete(phase) {
                    return Ok(());
                }
                let missing = self.barrier.missing(phase);
                error!(process = %self.id, ?phase, ?missing, "Transport failed at barrier");
                return Err(TransportError::closed(format!(
                    "transport failed while waiting at {:?} barrier for {:?}",
                    phase, missing
                ))
                .into());
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    // ----- Lifecycle -----

    /// Pass the start barrier and launch every worker thread
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(RuntimeError::Lifecycle(format!("{} already started", self.id)));
        }
        self.cluster_barrier(BarrierPhase::Start)?;

        let mut threads = self.threads.lock();
        for index in 0..self.config.threads {
            let worker = Worker::new(Arc::clone(self), WorkerId::new(index as u32));
            let handle = std::thread::Builder::new()
                .name(format!("placenet-{}-W{}", self.id, index))
                .spawn(move || worker.run_scheduler())?;
            threads.push(handle);
        }
        info!(process = %self.id, threads = self.config.threads, "Process started");
        Ok(())
    }

    /// Wait for every worker, pass the teardown barrier and close the backend
    pub fn join(&self) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(RuntimeError::Lifecycle(format!("{} was never started", self.id)));
        }
        if self.joined.swap(true, Ordering::AcqRel) {
            return Err(RuntimeError::Lifecycle(format!("{} already joined", self.id)));
        }

        let handles = std::mem::take(&mut *self.threads.lock());
        let mut panicked = 0;
        for handle in handles {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            error!(process = %self.id, panicked, "Worker threads panicked");
        }

        self.cluster_barrier(BarrierPhase::Teardown)?;
        self.transport.shutdown()?;

        let stats = self.get_stats();
        info!(
            process = %self.id,
            nets_spawned = stats.nets_spawned,
            nets_reclaimed = stats.nets_reclaimed,
            protocol_errors = stats.protocol_errors,
            "Process stopped"
        );
        if panicked > 0 {
            return Err(RuntimeError::Lifecycle(format!(
                "{} worker threads of {} panicked",
                panicked, self.id
            )));
        }
        Ok(())
    }

    /// start + join
    pub fn run(self: &Arc<Self>) -> Result<()> {
        self.start()?;
        self.join()
    }

    pub(crate) fn store_worker_report(&self, report: WorkerReport) {
        self.worker_reports.lock().push(report);
    }

    // ----- Trace logs -----

    /// Ask every worker to open `<trace_dir>/<name>.<process>.<worker>.trace`
    pub fn start_logging(&self, name: &str) -> Result<()> {
        let dir = self.config.trace_dir.clone().unwrap_or_else(|| PathBuf::from("."));
        for index in 0..self.config.threads {
            let worker = WorkerId::new(index as u32);
            let path = dir.join(TraceLog::file_name(name, self.id, worker));
            self.post(worker, WorkerMessage::StartLog(path))?;
        }
        Ok(())
    }

    pub fn stop_logging(&self) -> Result<()> {
        for index in 0..self.config.threads {
            self.post(WorkerId::new(index as u32), WorkerMessage::StopLog)?;
        }
        Ok(())
    }

    // ----- Reports -----

    pub fn write_reports(&self) -> ProcessReport {
        let nets = self
            .arena
            .snapshot()
            .into_iter()
            .map(|(net, slot)| NetSummary {
                net,
                template: self
                    .defs
                    .get(slot.def_index)
                    .map(|def| def.name().to_string())
                    .unwrap_or_default(),
                owner: slot.owner,
                parent: slot.parent,
                global: slot.global,
                state: slot.state,
            })
            .collect();
        let mut workers = self.worker_reports.lock().clone();
        workers.sort_by_key(|report| report.worker);

        ProcessReport {
            process: self.id,
            process_count: self.process_count,
            threads: self.config.threads,
            backend: self.transport.transport_type(),
            live_nets: self.arena.live_count(),
            halting_nets: self.arena.halting_count(),
            retired_nets: self.arena.retired_count(),
            nets,
            workers,
            stats: self.get_stats(),
            transport: self.transport.metrics().get_stats(),
            termination: self.quiescence.stats(),
        }
    }

    /// Write the process report as pretty JSON
    pub fn write_reports_to(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &self.write_reports())?;
        info!(process = %self.id, path = %path.display(), "Report written");
        Ok(())
    }
}
