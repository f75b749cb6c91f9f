//! Placenet node binary
//!
//! Usage:
//!   placenet-node --config config/placenet.toml
//!   placenet-node --config config/tcp.toml --process-id 1
//!   placenet-node --net broadcast --rounds 50 --report-dir reports/

use anyhow::{Context, Result};
use clap::Parser;
use cluster_config::{defaults, ClusterConfig, LogConfig};
use placenet_node::demo;
use placenet_node::runner::{self, RunOptions};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "placenet-node")]
#[command(about = "Placenet distributed Petri-net runtime")]
#[command(version)]
struct Args {
    /// Path to configuration file (defaults to config/placenet.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the process id from the configuration
    #[arg(short, long)]
    process_id: Option<u32>,

    /// Log level (trace, debug, info, warn, error); overrides the configuration
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Demo net spawned on process 0 (ring, broadcast)
    #[arg(long, default_value = "ring")]
    net: String,

    /// Ring hop limit or broadcast round count
    #[arg(long, default_value_t = 1000)]
    rounds: u32,

    /// Write worker traces named <TRACE>.<process>.<worker>.trace
    #[arg(long)]
    trace: Option<String>,

    /// Directory for JSON process reports
    #[arg(long)]
    report_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let path = args.config.clone().or_else(|| {
        let default = Path::new(defaults::CONFIG_PATH);
        default.exists().then(|| default.to_path_buf())
    });
    let mut config = ClusterConfig::load(path.as_deref()).context("Failed to load configuration")?;
    if let Some(process_id) = args.process_id {
        config = config.for_process(process_id)?;
    }

    if args.print_config {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    init_logging(&args, &config.log)?;

    info!("Starting Placenet node");
    if let Some(path) = &path {
        info!("Configuration: {}", path.display());
    }
    info!(
        process_id = config.process_id,
        process_count = config.process_count,
        threads = config.threads,
        autohalt = config.autohalt,
        "Cluster layout"
    );

    let options = RunOptions {
        initial: demo::template_index(&args.net)?,
        trace: args.trace.clone(),
        report_dir: args.report_dir.clone(),
    };

    let reports = runner::run(&config, demo::templates(args.rounds), &options).map_err(|e| {
        error!("Node failed: {:#}", e);
        e
    })?;

    for report in &reports {
        info!(
            process = %report.process,
            retired_nets = report.retired_nets,
            work_sent = report.termination.work_sent,
            work_received = report.termination.work_received,
            "Process summary"
        );
    }
    Ok(())
}

fn init_logging(args: &Args, log: &LogConfig) -> Result<()> {
    let level = args.log_level.as_deref().unwrap_or(&log.level);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level '{}'", level))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_thread_names(true);
    let result = if args.json_logs || log.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialise logging: {}", e))
}
