//! Process Runners
//!
//! The mailbox backend hosts the whole cluster inside this OS process; the
//! TCP backend runs the single process named by the configuration.

use anyhow::{Context as _, Result};
use cluster_config::{BackendConfig, ClusterConfig};
use net_runtime::{build_process, LocalCluster, NetDefs, Process, ProcessReport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// What to do around a run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Template spawned on process 0
    pub initial: usize,
    /// Trace log name; workers write `<name>.<process>.<worker>.trace`
    pub trace: Option<String>,
    /// Directory for `process-<id>.json` reports
    pub report_dir: Option<PathBuf>,
}

/// Run according to the configured backend
pub fn run(config: &ClusterConfig, defs: NetDefs, options: &RunOptions) -> Result<Vec<ProcessReport>> {
    match config.backend {
        BackendConfig::Mailbox => run_local(config, defs, options),
        BackendConfig::Tcp(_) => run_process(config, defs, options).map(|report| vec![report]),
    }
}

/// Every process of the cluster in this OS process
pub fn run_local(config: &ClusterConfig, defs: NetDefs, options: &RunOptions) -> Result<Vec<ProcessReport>> {
    let cluster = LocalCluster::new(config, defs).context("Failed to build local cluster")?;
    for process in cluster.processes() {
        prepare(process, options)?;
    }
    cluster.spawn_initial(options.initial)?;

    let started = Instant::now();
    cluster.run().context("Local cluster failed")?;
    info!(
        processes = config.process_count,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Local cluster finished"
    );

    cluster
        .processes()
        .iter()
        .map(|process| finish(process, options))
        .collect()
}

/// The one process this configuration names, over TCP
pub fn run_process(config: &ClusterConfig, defs: NetDefs, options: &RunOptions) -> Result<ProcessReport> {
    let process = build_process(config, defs).context("Failed to build process")?;
    prepare(&process, options)?;
    process.spawn_initial(options.initial)?;

    let started = Instant::now();
    process.run().context("Process failed")?;
    info!(
        process = %process.id(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Process finished"
    );
    finish(&process, options)
}

fn prepare(process: &Arc<Process>, options: &RunOptions) -> Result<()> {
    if let Some(name) = &options.trace {
        process.start_logging(name)?;
    }
    Ok(())
}

fn finish(process: &Arc<Process>, options: &RunOptions) -> Result<ProcessReport> {
    if let Some(dir) = &options.report_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create report directory {}", dir.display()))?;
        let path = dir.join(format!("process-{}.json", process.id().raw()));
        process.write_reports_to(&path)?;
    }
    Ok(process.write_reports())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo;
    use tempfile::tempdir;

    #[test]
    fn test_local_run_writes_reports_and_traces() {
        let dir = tempdir().unwrap();
        let config = ClusterConfig {
            process_count: 2,
            probe_interval_ms: 1,
            ..ClusterConfig::default()
        };
        let options = RunOptions {
            initial: demo::RING,
            trace: Some("demo".to_string()),
            report_dir: Some(dir.path().join("reports")),
        };
        let config = ClusterConfig {
            log: cluster_config::LogConfig {
                trace_dir: Some(dir.path().join("traces")),
                ..Default::default()
            },
            ..config
        };

        let reports = run(&config, demo::templates(8), &options).unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|report| report.retired_nets == 1));
        assert!(dir.path().join("reports").join("process-1.json").exists());
        assert!(dir.path().join("traces").join("demo.0.0.trace").exists());
    }

    #[test]
    fn test_tcp_layout_is_validated() {
        let config = ClusterConfig {
            process_count: 2,
            backend: BackendConfig::Tcp(cluster_config::TcpSettings {
                peers: vec!["127.0.0.1:1".parse().unwrap()],
                connect_timeout_ms: 10,
                max_frame_size: 1024,
                io_threads: 1,
            }),
            ..ClusterConfig::default()
        };
        assert!(run(&config, demo::templates(1), &RunOptions::default()).is_err());
    }
}
