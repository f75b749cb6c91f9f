//! Worker Trace Log
//!
//! Optional per-worker execution trace, one JSON object per line. A worker
//! opens it on request and always closes it before exiting.

use crate::ids::{NetId, PlaceIndex, TransitionIndex, WorkerId};
use crate::Result;
use network::ProcessId;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// One traced event
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    Adopt { net: NetId },
    Tokens { net: NetId, place: PlaceIndex, tokens: u32 },
    Fire { net: NetId, transition: TransitionIndex },
    Halt { net: NetId },
    Reclaim { net: NetId },
}

#[derive(Serialize)]
struct TraceLine<'a> {
    us: u64,
    process: ProcessId,
    worker: WorkerId,
    #[serde(flatten)]
    event: &'a TraceEvent,
}

pub struct TraceLog {
    path: PathBuf,
    writer: BufWriter<File>,
    process: ProcessId,
    worker: WorkerId,
    opened: Instant,
    events: u64,
}

impl TraceLog {
    /// Conventional file name for a worker's trace
    pub fn file_name(name: &str, process: ProcessId, worker: WorkerId) -> String {
        format!("{}.{}.{}.trace", name, process.raw(), worker.index())
    }

    pub fn create(path: &Path, process: ProcessId, worker: WorkerId) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(File::create(path)?),
            process,
            worker,
            opened: Instant::now(),
            events: 0,
        })
    }

    pub fn record(&mut self, event: &TraceEvent) -> Result<()> {
        let line = TraceLine {
            us: self.opened.elapsed().as_micros() as u64,
            process: self.process,
            worker: self.worker,
            event,
        };
        serde_json::to_writer(&mut self.writer, &line)?;
        self.writer.write_all(b"\n")?;
        self.events += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn events(&self) -> u64 {
        self.events
    }

    /// Flush and close
    pub fn close(mut self) -> Result<u64> {
        self.writer.flush()?;
        Ok(self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_trace_lines_are_json() {
        let dir = tempdir().unwrap();
        let name = TraceLog::file_name("run", ProcessId::new(1), WorkerId::new(2));
        assert_eq!(name, "run.1.2.trace");

        let path = dir.path().join("nested").join(name);
        let mut log = TraceLog::create(&path, ProcessId::new(1), WorkerId::new(2)).unwrap();
        log.record(&TraceEvent::Fire {
            net: NetId::new(4),
            transition: 1,
        })
        .unwrap();
        log.record(&TraceEvent::Halt { net: NetId::new(4) }).unwrap();
        assert_eq!(log.close().unwrap(), 2);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "fire");
        assert_eq!(lines[0]["net"], 4);
        assert_eq!(lines[0]["transition"], 1);
        assert_eq!(lines[1]["event"], "halt");
        assert_eq!(lines[1]["worker"], 2);
    }
}
