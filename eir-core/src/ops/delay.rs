//! Fixed delay line. The only operator allowed on a feedback loop: its output
//! is always strictly later than its input.

use std::collections::BTreeMap;

use super::{Arrival, Emission};
use crate::params::{ParamError, ParamReader, ParamResult};
use crate::units::{TimeUnit, NS_PER_MS};

#[derive(Debug, Clone)]
pub struct DelayLine {
    pub delay_ns: u64,
    // (release time, arrival sequence) -> event
    pending: BTreeMap<(u64, u64), Emission>,
    next_seq: u64,
}

impl DelayLine {
    pub(super) fn from_params(r: &mut ParamReader<'_>) -> ParamResult<Self> {
        let delay_ns = r.duration_or("delay_us", TimeUnit::Us, NS_PER_MS)?;
        if delay_ns == 0 {
            return Err(ParamError::invalid("delay_us", "must be > 0"));
        }
        Ok(Self::new(delay_ns))
    }

    pub fn new(delay_ns: u64) -> Self {
        Self {
            delay_ns,
            pending: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn next_release(&self) -> Option<u64> {
        self.pending.keys().next().map(|&(release, _)| release)
    }

    pub(super) fn step(&mut self, arrivals: &[Arrival]) {
        for a in arrivals {
            let release = a.ts.saturating_add(self.delay_ns);
            let ev = Emission {
                port: 0,
                ts: release,
                idx: a.idx.clone(),
                value: a.value.clone(),
                meta: a.meta.clone(),
            };
            self.pending.insert((release, self.next_seq), ev);
            self.next_seq += 1;
        }
    }

    pub(super) fn release(&mut self, until: u64, out: &mut Vec<Emission>) {
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().0 >= until {
                break;
            }
            out.push(entry.remove());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Meta, Value};

    fn arrival(ts: u64, v: f64) -> Arrival {
        Arrival {
            port: 0,
            ts,
            idx: vec![3],
            value: Value::Scalar(v),
            meta: Meta::new(),
        }
    }

    #[test]
    fn shifts_timestamp_and_keeps_value() {
        let mut d = DelayLine::new(200_000);
        d.step(&[arrival(1_000_000, 0.75)]);
        assert_eq!(d.next_release(), Some(1_200_000));

        let mut out = Vec::new();
        d.release(1_200_000, &mut out);
        assert!(out.is_empty());
        d.release(1_200_001, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ts, 1_200_000);
        assert_eq!(out[0].idx, vec![3]);
        assert_eq!(out[0].value, Value::Scalar(0.75));
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn releases_in_time_then_arrival_order() {
        let mut d = DelayLine::new(10);
        d.step(&[arrival(5, 1.0), arrival(5, 2.0)]);
        d.step(&[arrival(2, 3.0)]);
        let mut out = Vec::new();
        d.release(u64::MAX, &mut out);
        let values: Vec<_> = out.iter().map(|e| e.value.as_scalar().unwrap()).collect();
        assert_eq!(values, vec![3.0, 1.0, 2.0]);
    }
}
