//! TCP Network Channel
//!
//! Distributed backend: every process listens on its own address and keeps
//! one outbound connection per peer. Frames are length-prefixed (u32 BE)
//! tagged packets.
//!
//! ```text
//!   worker ──send()──► per-peer queue ──► writer task ──► TcpStream ──► peer
//!                          │
//!                          └── request table (oneshot per frame) ◄── poll_requests()
//!
//!   peer ──► accept loop ──► reader task ──► inbound queue ◄── try_receive()
//! ```
//!
//! One writer per peer keeps packets from one process to another in send
//! order. Workers never touch a socket: all I/O runs on the channel's own
//! tokio runtime and completion is observed by polling the request table.

use super::{check_target, RequestPoll, Transport, TransportMetrics, TransportType};
use crate::packet::{Packet, ProcessId};
use crate::{Result, TransportError};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// TCP channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpChannelConfig {
    /// Process owning this endpoint
    pub local: ProcessId,
    /// Listen address of every process, indexed by process id
    pub peers: Vec<SocketAddr>,
    /// How long a writer keeps retrying to reach a peer that is not up yet
    pub connect_timeout: Duration,
    /// Pause between connection attempts
    pub connect_retry_interval: Duration,
    /// Maximum frame size accepted or sent
    pub max_frame_size: usize,
    /// Threads of the channel's I/O runtime
    pub io_threads: usize,
    /// How long shutdown waits for queued frames to be written
    pub flush_timeout: Duration,
}

impl Default for TcpChannelConfig {
    fn default() -> Self {
        Self {
            local: ProcessId::new(0),
            peers: Vec::new(),
            connect_timeout: Duration::from_secs(crate::DEFAULT_CONNECTION_TIMEOUT_SECS),
            connect_retry_interval: Duration::from_millis(50),
            max_frame_size: crate::DEFAULT_MAX_FRAME_SIZE,
            io_threads: 1,
            flush_timeout: Duration::from_secs(5),
        }
    }
}

impl TcpChannelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.peers.is_empty() {
            return Err(TransportError::configuration("No peer addresses configured", Some("peers")));
        }
        if self.local.index() >= self.peers.len() {
            return Err(TransportError::configuration(
                format!("{} has no entry in a {}-peer table", self.local, self.peers.len()),
                Some("local"),
            ));
        }
        if self.io_threads == 0 {
            return Err(TransportError::configuration("io_threads must be positive", Some("io_threads")));
        }
        Ok(())
    }
}

/// One length-prefixed frame queued for a writer
struct OutboundFrame {
    bytes: Bytes,
    done: oneshot::Sender<Result<()>>,
}

/// Outstanding asynchronous sends
#[derive(Default)]
struct RequestTable {
    outstanding: Vec<(ProcessId, oneshot::Receiver<Result<()>>)>,
}

impl RequestTable {
    fn register(&mut self, peer: ProcessId, done: oneshot::Receiver<Result<()>>) {
        self.outstanding.push((peer, done));
    }

    fn reap(&mut self) -> RequestPoll {
        let mut poll = RequestPoll::default();
        self.outstanding.retain_mut(|(peer, done)| match done.try_recv() {
            Ok(Ok(())) => {
                poll.completed += 1;
                false
            }
            Ok(Err(e)) => {
                poll.failures.push((*peer, e));
                false
            }
            Err(oneshot::error::TryRecvError::Empty) => true,
            Err(oneshot::error::TryRecvError::Closed) => {
                poll.failures
                    .push((*peer, TransportError::closed("writer dropped the request")));
                false
            }
        });
        poll
    }
}

/// TCP connection wrapper with reusable read buffer
pub(crate) struct TcpConnection {
    stream: TcpStream,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) bytes_sent: u64,
    pub(crate) bytes_received: u64,
    read_buffer: BytesMut,
}

impl TcpConnection {
    pub(crate) fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        Self {
            stream,
            peer_addr,
            bytes_sent: 0,
            bytes_received: 0,
            read_buffer: BytesMut::with_capacity(64 * 1024),
        }
    }

    /// Write one already-framed buffer
    pub(crate) async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.stream.write_all(frame).await.map_err(|e| {
            TransportError::connection_with_source("Failed to write frame", Some(self.peer_addr), e)
        })?;
        self.stream.flush().await.map_err(|e| {
            TransportError::connection_with_source("Failed to flush TCP stream", Some(self.peer_addr), e)
        })?;
        self.bytes_sent += frame.len() as u64;
        Ok(())
    }

    /// Read one frame; `Ok(None)` on clean EOF at a frame boundary
    pub(crate) async fn receive_packet(&mut self, max_size: usize) -> Result<Option<Packet>> {
        let mut len_bytes = [0u8; 4];
        match self.stream.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => {
                return Err(TransportError::network_with_source("Failed to read frame length", e))
            }
        }

        let frame_len = u32::from_be_bytes(len_bytes) as usize;
        if frame_len > max_size {
            return Err(TransportError::protocol(format!(
                "Frame size {} exceeds maximum {}",
                frame_len, max_size
            )));
        }

        self.read_buffer.clear();
        self.read_buffer.resize(frame_len, 0);
        self.stream
            .read_exact(&mut self.read_buffer)
            .await
            .map_err(|e| TransportError::network_with_source("Failed to read frame body", e))?;
        self.bytes_received += 4 + frame_len as u64;

        let frame = self.read_buffer.split_to(frame_len).freeze();
        Packet::decode_frame(frame).map(Some)
    }
}

/// TCP network channel endpoint for one process
pub struct TcpChannel {
    config: TcpChannelConfig,
    runtime: Mutex<Option<Runtime>>,
    local_addr: SocketAddr,
    outbound: Mutex<Vec<Option<mpsc::UnboundedSender<OutboundFrame>>>>,
    writers: Mutex<Vec<JoinHandle<()>>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Packet>>,
    inbound_queued: Arc<AtomicUsize>,
    requests: Mutex<RequestTable>,
    peer_healthy: Arc<Vec<AtomicBool>>,
    closed: AtomicBool,
    metrics: TransportMetrics,
}

impl std::fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel")
            .field("local", &self.config.local)
            .field("local_addr", &self.local_addr)
            .field("peers", &self.config.peers.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl TcpChannel {
    /// Bind the local listen address from the peer table and start the channel
    pub fn bind(config: TcpChannelConfig) -> Result<Self> {
        config.validate()?;
        let addr = config.peers[config.local.index()];
        let listener = std::net::TcpListener::bind(addr).map_err(|e| {
            TransportError::connection_with_source("Failed to bind TCP listener", Some(addr), e)
        })?;
        Self::from_listener(config, listener)
    }

    /// Start the channel on an already bound listener
    pub fn from_listener(config: TcpChannelConfig, listener: std::net::TcpListener) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io_threads)
            .thread_name(format!("net-io-{}", config.local.raw()))
            .enable_all()
            .build()?;

        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(listener)?
        };

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let inbound_queued = Arc::new(AtomicUsize::new(0));
        runtime.spawn(accept_loop(
            listener,
            inbound_tx,
            Arc::clone(&inbound_queued),
            config.max_frame_size,
            config.local,
        ));

        let peer_healthy: Arc<Vec<AtomicBool>> =
            Arc::new(config.peers.iter().map(|_| AtomicBool::new(true)).collect());

        let mut outbound = Vec::with_capacity(config.peers.len());
        let mut writers = Vec::with_capacity(config.peers.len());
        for (index, addr) in config.peers.iter().enumerate() {
            let peer = ProcessId::new(index as u32);
            if peer == config.local {
                outbound.push(None);
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            writers.push(runtime.spawn(run_writer(
                peer,
                *addr,
                config.clone(),
                rx,
                Arc::clone(&peer_healthy),
            )));
            outbound.push(Some(tx));
        }

        info!(
            process = %config.local,
            listen = %local_addr,
            peers = config.peers.len() - 1,
            "TCP channel started"
        );

        Ok(Self {
            config,
            runtime: Mutex::new(Some(runtime)),
            local_addr,
            outbound: Mutex::new(outbound),
            writers: Mutex::new(writers),
            inbound: Mutex::new(inbound_rx),
            inbound_queued,
            requests: Mutex::new(RequestTable::default()),
            peer_healthy,
            closed: AtomicBool::new(false),
            metrics: TransportMetrics::new(),
        })
    }

    /// Address the listener is actually bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_peer_healthy(&self, peer: ProcessId) -> bool {
        self.peer_healthy
            .get(peer.index())
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

impl Transport for TcpChannel {
    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }

    fn local_process(&self) -> ProcessId {
        self.config.local
    }

    fn process_count(&self) -> usize {
        self.config.peers.len()
    }

    fn send(&self, target: ProcessId, packet: Packet) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            self.metrics.record_failure();
            return Err(TransportError::closed("TCP channel shut down"));
        }
        check_target(self.config.local, self.config.peers.len(), target).inspect_err(|_| {
            self.metrics.record_failure();
        })?;
        if !self.is_peer_healthy(target) {
            self.metrics.record_failure();
            return Err(TransportError::unroutable(target, "connection to peer failed earlier"));
        }
        if packet.wire_len() > self.config.max_frame_size {
            self.metrics.record_failure();
            return Err(TransportError::protocol(format!(
                "Packet of {} bytes exceeds maximum frame size {}",
                packet.wire_len(),
                self.config.max_frame_size
            )));
        }

        let mut frame = BytesMut::new();
        packet.encode_frame(&mut frame);
        let (done_tx, done_rx) = oneshot::channel();

        {
            let outbound = self.outbound.lock();
            let sender = outbound
                .get(target.index())
                .and_then(|sender| sender.as_ref())
                .ok_or_else(|| TransportError::closed("no writer for peer"))?;
            sender
                .send(OutboundFrame {
                    bytes: frame.freeze(),
                    done: done_tx,
                })
                .map_err(|_| {
                    self.metrics.record_failure();
                    TransportError::unroutable(target, "writer task stopped")
                })?;
        }

        trace!(from = %self.config.local, to = %target, tag = %packet.tag, "Queued TCP frame");
        self.metrics.record_send(&packet);
        self.requests.lock().register(target, done_rx);
        Ok(())
    }

    fn try_receive(&self) -> Result<Option<Packet>> {
        match self.inbound.lock().try_recv() {
            Ok(packet) => {
                self.inbound_queued.fetch_sub(1, Ordering::AcqRel);
                self.metrics.record_receive(&packet);
                Ok(Some(packet))
            }
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Ok(None),
        }
    }

    fn has_inbound(&self) -> bool {
        self.inbound_queued.load(Ordering::Acquire) > 0
    }

    fn poll_requests(&self) -> RequestPoll {
        let poll = self.requests.lock().reap();
        for (peer, error) in &poll.failures {
            self.metrics.record_failure();
            warn!(process = %self.config.local, peer = %peer, error = %error, "Asynchronous send failed");
        }
        poll
    }

    fn pending_requests(&self) -> usize {
        self.requests.lock().outstanding.len()
    }

    fn is_healthy(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.peer_healthy.iter().all(|flag| flag.load(Ordering::Acquire))
    }

    fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }

    fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(process = %self.config.local, "Shutting down TCP channel");

        // Dropping the senders lets each writer drain its queue and exit.
        self.outbound.lock().iter_mut().for_each(|sender| {
            sender.take();
        });
        let writers: Vec<_> = self.writers.lock().drain(..).collect();

        if let Some(runtime) = self.runtime.lock().take() {
            let flush_timeout = self.config.flush_timeout;
            runtime.block_on(async {
                for writer in writers {
                    if tokio::time::timeout(flush_timeout, writer).await.is_err() {
                        warn!("Writer did not flush within {:?}", flush_timeout);
                    }
                }
            });
            runtime.shutdown_timeout(Duration::from_millis(100));
        }

        let poll = self.requests.lock().reap();
        info!(
            process = %self.config.local,
            completed = poll.completed,
            failed = poll.failures.len(),
            "TCP channel closed"
        );
        Ok(())
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Error shutting down TCP channel: {}", e);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbound: mpsc::UnboundedSender<Packet>,
    queued: Arc<AtomicUsize>,
    max_frame_size: usize,
    local: ProcessId,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!(process = %local, peer = %peer_addr, "Accepted TCP connection");
                let connection = TcpConnection::new(stream, peer_addr);
                tokio::spawn(run_reader(
                    connection,
                    inbound.clone(),
                    Arc::clone(&queued),
                    max_frame_size,
                ));
            }
            Err(e) => {
                warn!(process = %local, "Failed to accept TCP connection: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

async fn run_reader(
    mut connection: TcpConnection,
    inbound: mpsc::UnboundedSender<Packet>,
    queued: Arc<AtomicUsize>,
    max_frame_size: usize,
) {
    loop {
        match connection.receive_packet(max_frame_size).await {
            Ok(Some(packet)) => {
                queued.fetch_add(1, Ordering::AcqRel);
                if inbound.send(packet).is_err() {
                    queued.fetch_sub(1, Ordering::AcqRel);
                    debug!(peer = %connection.peer_addr, "Inbound queue closed, stopping reader");
                    return;
                }
            }
            Ok(None) => {
                debug!(
                    peer = %connection.peer_addr,
                    bytes_received = connection.bytes_received,
                    "Peer closed TCP connection"
                );
                return;
            }
            Err(e) => {
                warn!(peer = %connection.peer_addr, error = %e, "Dropping TCP connection");
                return;
            }
        }
    }
}

async fn connect_with_retry(addr: SocketAddr, config: &TcpChannelConfig) -> Result<TcpConnection> {
    let deadline = Instant::now() + config.connect_timeout;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(TcpConnection::new(stream, addr)),
            Err(e) if Instant::now() < deadline => {
                trace!(peer = %addr, "Peer not reachable yet: {}", e);
                tokio::time::sleep(config.connect_retry_interval).await;
            }
            Err(e) => {
                return Err(TransportError::connection_with_source(
                    format!("Gave up connecting after {:?}", config.connect_timeout),
                    Some(addr),
                    e,
                ))
            }
        }
    }
}

async fn run_writer(
    peer: ProcessId,
    addr: SocketAddr,
    config: TcpChannelConfig,
    mut frames: mpsc::UnboundedReceiver<OutboundFrame>,
    healthy: Arc<Vec<AtomicBool>>,
) {
    let mut connection: Option<TcpConnection> = None;

    while let Some(frame) = frames.recv().await {
        if connection.is_none() {
            match connect_with_retry(addr, &config).await {
                Ok(conn) => {
                    info!(process = %config.local, peer = %peer, addr = %addr, "Connected to peer");
                    connection = Some(conn);
                }
                Err(e) => {
                    warn!(process = %config.local, peer = %peer, error = %e, "Peer unreachable");
                    healthy[peer.index()].store(false, Ordering::Release);
                    let _ = frame.done.send(Err(e));
                    break;
                }
            }
        }
        let Some(conn) = connection.as_mut() else {
            break;
        };

        match conn.send_frame(&frame.bytes).await {
            Ok(()) => {
                let _ = frame.done.send(Ok(()));
            }
            Err(e) if e.is_link_failure() => {
                warn!(process = %config.local, peer = %peer, error = %e, "Peer link lost");
                healthy[peer.index()].store(false, Ordering::Release);
                let _ = frame.done.send(Err(e));
                break;
            }
            Err(e) => {
                let _ = frame.done.send(Err(e));
            }
        }
    }

    // Anything still queued after a failure is reported, never silently lost.
    frames.close();
    while let Some(frame) = frames.recv().await {
        let _ = frame.done.send(Err(TransportError::unroutable(peer, "connection to peer failed")));
    }

    if let Some(mut conn) = connection {
        if let Err(e) = conn.stream.shutdown().await {
            debug!(peer = %peer, "Error shutting down TCP stream: {}", e);
        }
        debug!(peer = %peer, bytes_sent = conn.bytes_sent, "Writer finished");
    }
}
