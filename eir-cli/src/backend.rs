// Record sources for the raster viewer: a live executor or a recorded trace.

use anyhow::Result;
use eir_runtime::{Executor, Trace, TraceRecord};

/// Anything that can feed the raster one instant at a time.
pub trait RasterBackend {
    /// Advance by one instant and return the records it produced.
    /// `None` once the source is exhausted.
    fn step(&mut self) -> Result<Option<Vec<TraceRecord>>>;

    /// Time of the last instant shown, in ns.
    fn now(&self) -> Option<u64>;

    /// Short label for the status line.
    fn source(&self) -> &str;
}

/// Drives a live executor, one instant per step.
pub struct ExecutorBackend {
    exec: Executor,
    now: Option<u64>,
    label: String,
}

impl ExecutorBackend {
    pub fn new(exec: Executor, label: impl Into<String>) -> Self {
        Self {
            exec,
            now: None,
            label: label.into(),
        }
    }
}

impl RasterBackend for ExecutorBackend {
    fn step(&mut self) -> Result<Option<Vec<TraceRecord>>> {
        let Some(report) = self.exec.step_instant()? else {
            return Ok(None);
        };
        self.now = Some(report.t);
        let records = &self.exec.trace().records()[report.first_record..report.first_record + report.records];
        Ok(Some(records.to_vec()))
    }

    fn now(&self) -> Option<u64> {
        self.now
    }

    fn source(&self) -> &str {
        &self.label
    }
}

/// Replays a recorded trace; records sharing a timestamp form one instant.
pub struct TraceBackend {
    records: Vec<TraceRecord>,
    pos: usize,
    now: Option<u64>,
    label: String,
}

impl TraceBackend {
    pub fn new(mut trace: Trace, label: impl Into<String>) -> Self {
        trace.finish();
        Self {
            records: trace.records().to_vec(),
            pos: 0,
            now: None,
            label: label.into(),
        }
    }
}

impl RasterBackend for TraceBackend {
    fn step(&mut self) -> Result<Option<Vec<TraceRecord>>> {
        let Some(first) = self.records.get(self.pos) else {
            return Ok(None);
        };
        let ts = first.ts;
        let len = self.records[self.pos..].iter().take_while(|r| r.ts == ts).count();
        let batch = self.records[self.pos..self.pos + len].to_vec();
        self.pos += len;
        self.now = Some(ts);
        Ok(Some(batch))
    }

    fn now(&self) -> Option<u64> {
        self.now
    }

    fn source(&self) -> &str {
        &self.label
    }
}
