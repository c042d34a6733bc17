//! Input event streams (JSON lines).
//!
//! ```text
//! {"header":{"units":{"time":"us"}}}
//! {"ts":1000,"node":"delay","port":"in","idx":[0],"val":0.75}
//! ```
//!
//! Timestamps are read in the header's unit (or the caller's default when
//! there is no header) and converted to nanoseconds.

use std::fs;
use std::path::Path;

use eir_core::units::to_ns;
use eir_core::{Event, Meta, PortRef, TimeUnit, Value};
use serde::{Deserialize, Serialize};

use crate::error::TraceError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StreamUnits {
    #[serde(default)]
    time: Option<TimeUnit>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StreamHeader {
    #[serde(default)]
    units: StreamUnits,
}

/// Integer timestamps stay exact; fractional ones are rounded to the nearest ns.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
enum Stamp {
    Int(u64),
    Float(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InputRecord {
    ts: Stamp,
    node: String,
    port: String,
    #[serde(default)]
    idx: Vec<i64>,
    val: Value,
    #[serde(default, skip_serializing_if = "Meta::is_empty")]
    meta: Meta,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Line {
    Header { header: StreamHeader },
    Record(InputRecord),
}

pub fn parse_events(text: &str, default_unit: TimeUnit) -> Result<Vec<Event>, TraceError> {
    let mut unit = default_unit;
    let mut events = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let line: Line = serde_json::from_str(raw).map_err(|source| TraceError::Json { line: i + 1, source })?;
        match line {
            Line::Header { header } => {
                if let Some(u) = header.units.time {
                    unit = u;
                }
            }
            Line::Record(r) => {
                let ts = match r.ts {
                    Stamp::Int(v) => unit.try_to_ns(v)?,
                    Stamp::Float(v) => to_ns(v, unit)?,
                };
                events.push(Event {
                    ts,
                    target: PortRef::new(r.node, r.port),
                    idx: r.idx,
                    value: r.val,
                    meta: r.meta,
                });
            }
        }
    }
    Ok(events)
}

pub fn load_events(path: impl AsRef<Path>, default_unit: TimeUnit) -> Result<Vec<Event>, TraceError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| TraceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_events(&text, default_unit)
}

/// Nanosecond-stamped JSON lines with a header.
pub fn events_to_jsonl(events: &[Event]) -> Result<String, TraceError> {
    let header = StreamHeader {
        units: StreamUnits {
            time: Some(TimeUnit::Ns),
        },
    };
    let mut out = serde_json::to_string(&serde_json::json!({ "header": header }))
        .map_err(|source| TraceError::Json { line: 1, source })?;
    out.push('\n');
    for (i, e) in events.iter().enumerate() {
        let rec = InputRecord {
            ts: Stamp::Int(e.ts),
            node: e.target.node.clone(),
            port: e.target.port.clone(),
            idx: e.idx.clone(),
            val: e.value.clone(),
            meta: e.meta.clone(),
        };
        let line = serde_json::to_string(&rec).map_err(|source| TraceError::Json { line: i + 2, source })?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eir_core::UnitsError;

    #[test]
    fn header_unit_applies_to_following_records() {
        let text = r#"
{"ts": 3, "node": "n", "port": "in", "val": 1.0}
{"header": {"units": {"time": "us"}}}
{"ts": 1000, "node": "d", "port": "in", "idx": [4], "val": 0.75, "meta": {"src": "mic"}}
{"ts": 1.5, "node": "d", "port": "in", "val": [1.0, 2.0]}
"#;
        let evs = parse_events(text, TimeUnit::Ns).unwrap();
        assert_eq!(evs.len(), 3);
        assert_eq!(evs[0].ts, 3);
        assert_eq!(evs[1].ts, 1_000_000);
        assert_eq!(evs[1].idx, vec![4]);
        assert_eq!(evs[1].target, PortRef::new("d", "in"));
        assert_eq!(evs[2].ts, 1_500);
        assert_eq!(evs[2].value, Value::Vector(vec![1.0, 2.0]));
    }

    #[test]
    fn default_unit_without_header() {
        let evs = parse_events(r#"{"ts": 2, "node": "n", "port": "in", "val": 1}"#, TimeUnit::Ms).unwrap();
        assert_eq!(evs[0].ts, 2_000_000);
    }

    #[test]
    fn rejects_bad_records() {
        let err = parse_events("{\"ts\": 1, \"node\": \"n\"}", TimeUnit::Ns).unwrap_err();
        assert!(matches!(err, TraceError::Json { line: 1, .. }));
        let err = parse_events(r#"{"ts": -1.0, "node": "n", "port": "in", "val": 1}"#, TimeUnit::Ns).unwrap_err();
        assert!(matches!(err, TraceError::Units(_)));
    }

    #[test]
    fn overflowing_integer_stamps_are_rejected() {
        let text = format!(
            "{{\"header\":{{\"units\":{{\"time\":\"s\"}}}}}}\n{{\"ts\":{},\"node\":\"n\",\"port\":\"in\",\"val\":1}}\n",
            u64::MAX
        );
        let err = parse_events(&text, TimeUnit::Ns).unwrap_err();
        assert!(matches!(err, TraceError::Units(UnitsError::Overflow(_))));
    }

    #[test]
    fn write_then_parse() {
        let evs = vec![Event::new(42, PortRef::new("a", "in"), 1.25).with_idx(vec![1, 2])];
        let text = events_to_jsonl(&evs).unwrap();
        assert_eq!(parse_events(&text, TimeUnit::S).unwrap(), evs);
    }
}
