//! Cluster Assembly
//!
//! Builds processes from a [`ClusterConfig`]:
//!
//! - [`LocalCluster`]: every process in this OS process, joined by one
//!   mailbox hub
//! - [`build_transport`]: the TCP endpoint of a single process

use crate::ids::NetId;
use crate::net::NetDefs;
use crate::process::{Process, ProcessConfig};
use crate::report::ProcessReport;
use crate::{Result, RuntimeError};
use cluster_config::{BackendConfig, ClusterConfig};
use network::{MailboxHub, ProcessId, TcpChannel, TcpChannelConfig, Transport};
use std::sync::Arc;
use tracing::info;

fn validated(config: &ClusterConfig) -> Result<()> {
    config
        .validate()
        .map_err(|e| RuntimeError::configuration(e.to_string(), None))
}

/// Transport endpoint for the process named by `config.process_id`
pub fn build_transport(config: &ClusterConfig) -> Result<Arc<dyn Transport>> {
    validated(config)?;
    match &config.backend {
        BackendConfig::Tcp(settings) => {
            let channel = TcpChannel::bind(TcpChannelConfig {
                local: ProcessId::new(config.process_id),
                peers: settings.peers.clone(),
                connect_timeout: settings.connect_timeout(),
                max_frame_size: settings.max_frame_size,
                io_threads: settings.io_threads,
                ..TcpChannelConfig::default()
            })?;
            Ok(Arc::new(channel))
        }
        BackendConfig::Mailbox => Err(RuntimeError::configuration(
            "the mailbox backend hosts every process in one OS process; use LocalCluster",
            Some("backend"),
        )),
    }
}

/// Build the single process described by a TCP configuration
pub fn build_process(config: &ClusterConfig, defs: NetDefs) -> Result<Arc<Process>> {
    let transport = build_transport(config)?;
    Process::new(ProcessConfig::from(config), defs, transport)
}

/// All processes of a cluster hosted in one OS process
#[derive(Debug)]
pub struct LocalCluster {
    hub: Arc<MailboxHub>,
    processes: Vec<Arc<Process>>,
}

impl LocalCluster {
    /// Cluster sized by `config.process_count`
    pub fn new(config: &ClusterConfig, defs: NetDefs) -> Result<Self> {
        validated(config)?;
        Self::with_processes(config.process_count, ProcessConfig::from(config), defs)
    }

    pub fn with_processes(process_count: usize, config: ProcessConfig, defs: NetDefs) -> Result<Self> {
        let hub = MailboxHub::new(process_count)?;
        let processes = (0..process_count as u32)
            .map(|id| {
                let endpoint = hub.endpoint(ProcessId::new(id))?;
                Process::new(config.clone(), defs.clone(), Arc::new(endpoint))
            })
            .collect::<Result<Vec<_>>>()?;
        info!(process_count, threads = config.threads, "Local cluster created");
        Ok(Self { hub, processes })
    }

    pub fn hub(&self) -> &Arc<MailboxHub> {
        &self.hub
    }

    pub fn processes(&self) -> &[Arc<Process>] {
        &self.processes
    }

    pub fn process(&self, id: ProcessId) -> Option<&Arc<Process>> {
        self.processes.get(id.index())
    }

    /// Spawn the root net on process 0
    pub fn spawn_initial(&self, def_index: usize) -> Result<Option<NetId>> {
        match self.processes.first() {
            Some(process) => process.spawn_initial(def_index),
            None => Ok(None),
        }
    }

    /// Start every process; returns once all passed the start barrier
    pub fn start(&self) -> Result<()> {
        self.for_each_concurrently(|process| process.start())
    }

    /// Join every process
    pub fn join(&self) -> Result<()> {
        self.for_each_concurrently(|process| process.join())
    }

    /// Run the cluster until it quits
    pub fn run(&self) -> Result<()> {
        self.for_each_concurrently(|process| process.run())
    }

    pub fn reports(&self) -> Vec<ProcessReport> {
        self.processes.iter().map(|process| process.write_reports()).collect()
    }

    /// Every process runs `f` on its own thread; barriers need that
    fn for_each_concurrently<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&Arc<Process>) -> Result<()> + Sync,
    {
        let results: Vec<Result<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .processes
                .iter()
                .map(|process| {
                    let f = &f;
                    scope.spawn(move || f(process))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(RuntimeError::Lifecycle("process thread panicked".into())))
                })
                .collect()
        });
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }
}
