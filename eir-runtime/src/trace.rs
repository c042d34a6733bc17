//! Probe traces and their JSON-lines document.
//!
//! ```text
//! {"header":{"schema_version":"0.1.0","dims":["time","channel","value"],"units":{"time":"ns","value":"dimensionless"},"metadata":{}}}
//! {"probe":"pop_b","ts":1200000,"idx":[3],"val":1.0,"meta":{"unit":"spike"}}
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use eir_core::{Meta, TimeUnit, Value};
use serde::{Deserialize, Serialize};

use crate::error::TraceError;

pub const SCHEMA_VERSION: &str = "0.1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceUnits {
    pub time: String,
    pub value: String,
}

impl Default for TraceUnits {
    fn default() -> Self {
        Self {
            time: TimeUnit::Ns.as_str().to_string(),
            value: "dimensionless".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceHeader {
    pub schema_version: String,
    #[serde(default)]
    pub dims: Vec<String>,
    #[serde(default)]
    pub units: TraceUnits,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Default for TraceHeader {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            dims: vec!["time".into(), "channel".into(), "value".into()],
            units: TraceUnits::default(),
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub probe: String,
    pub ts: u64,
    #[serde(default)]
    pub idx: Vec<i64>,
    pub val: Value,
    #[serde(default, skip_serializing_if = "Meta::is_empty")]
    pub meta: Meta,
}

#[derive(Serialize)]
struct HeaderLine<'a> {
    header: &'a TraceHeader,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Line {
    Header { header: TraceHeader },
    Record(TraceRecord),
}

/// Append-only probe log. [`Trace::finish`] puts it in canonical order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace {
    pub header: TraceHeader,
    records: Vec<TraceRecord>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(header: TraceHeader) -> Self {
        Self {
            header,
            records: Vec::new(),
        }
    }

    pub fn record(&mut self, probe: &str, ts: u64, idx: Vec<i64>, val: Value, meta: Meta) {
        self.records.push(TraceRecord {
            probe: probe.to_string(),
            ts,
            idx,
            val,
            meta,
        });
    }

    pub fn push(&mut self, rec: TraceRecord) {
        self.records.push(rec);
    }

    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Distinct probe ids in first-seen order.
    pub fn probe_ids(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for r in &self.records {
            if !seen.contains(&r.probe.as_str()) {
                seen.push(r.probe.as_str());
            }
        }
        seen
    }

    pub fn records_for<'a>(&'a self, probe: &'a str) -> impl Iterator<Item = &'a TraceRecord> + 'a {
        self.records.iter().filter(move |r| r.probe == probe)
    }

    /// Stable sort by `(ts, idx)`; ties keep recording order.
    pub fn finish(&mut self) {
        self.records.sort_by(|a, b| (a.ts, &a.idx).cmp(&(b.ts, &b.idx)));
    }

    pub fn validate(&self) -> Result<(), TraceError> {
        for (i, w) in self.records.windows(2).enumerate() {
            if w[1].ts < w[0].ts {
                return Err(TraceError::Unordered {
                    index: i + 1,
                    prev: w[0].ts,
                    ts: w[1].ts,
                });
            }
        }
        Ok(())
    }

    pub fn write_jsonl<W: Write>(&self, mut w: W) -> Result<(), TraceError> {
        let io = |source| TraceError::Io {
            path: "<writer>".into(),
            source,
        };
        let json = |line, source| TraceError::Json { line, source };
        let header = serde_json::to_string(&HeaderLine { header: &self.header }).map_err(|e| json(1, e))?;
        writeln!(w, "{header}").map_err(io)?;
        for (i, r) in self.records.iter().enumerate() {
            let line = serde_json::to_string(r).map_err(|e| json(i + 2, e))?;
            writeln!(w, "{line}").map_err(io)?;
        }
        Ok(())
    }

    pub fn to_jsonl(&self) -> Result<String, TraceError> {
        let mut buf = Vec::new();
        self.write_jsonl(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Parse a JSON-lines trace. The header line is optional; blank lines are skipped.
    pub fn from_jsonl(text: &str) -> Result<Self, TraceError> {
        let mut trace = Trace::new();
        for (i, raw) in text.lines().enumerate() {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let line: Line = serde_json::from_str(raw).map_err(|source| TraceError::Json { line: i + 1, source })?;
            match line {
                Line::Header { header } => trace.header = header,
                Line::Record(r) => trace.records.push(r),
            }
        }
        Ok(trace)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TraceError> {
        let path = path.as_ref();
        let text = self.to_jsonl()?;
        fs::write(path, text).map_err(|source| TraceError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| TraceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_jsonl(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eir_core::MetaValue;

    fn sample() -> Trace {
        let mut t = Trace::new();
        t.record("b", 20, vec![1], Value::Scalar(1.0), Meta::new());
        t.record("a", 10, vec![2], Value::Scalar(0.5), Meta::new());
        t.record("a", 10, vec![0], Value::Vector(vec![1.0, 2.5]), Meta::new());
        let mut meta = Meta::new();
        meta.insert("unit".into(), MetaValue::from("spike"));
        t.record("c", 10, vec![2], Value::Scalar(0.1 + 0.2), meta);
        t
    }

    #[test]
    fn finish_sorts_stably() {
        let mut t = sample();
        assert!(t.validate().is_err());
        t.finish();
        t.validate().unwrap();
        let order: Vec<_> = t.records().iter().map(|r| (r.probe.as_str(), r.ts, r.idx[0])).collect();
        assert_eq!(order, vec![("a", 10, 0), ("a", 10, 2), ("c", 10, 2), ("b", 20, 1)]);
    }

    #[test]
    fn jsonl_round_trip_is_exact() {
        let mut t = sample();
        t.finish();
        let text = t.to_jsonl().unwrap();
        assert!(text.starts_with("{\"header\":{\"schema_version\":\"0.1.0\""));
        let back = Trace::from_jsonl(&text).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn header_is_optional() {
        let t = Trace::from_jsonl("\n{\"probe\":\"x\",\"ts\":5,\"val\":2.0}\n").unwrap();
        assert_eq!(t.header, TraceHeader::default());
        assert_eq!(t.records()[0].idx, Vec::<i64>::new());
    }

    #[test]
    fn bad_line_reports_its_number() {
        let err = Trace::from_jsonl("{\"probe\":\"x\",\"ts\":5,\"val\":2.0}\n{oops").unwrap_err();
        assert!(matches!(err, TraceError::Json { line: 2, .. }));
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");
        let mut t = sample();
        t.finish();
        t.save(&path).unwrap();
        assert_eq!(Trace::load(&path).unwrap(), t);
    }
}
