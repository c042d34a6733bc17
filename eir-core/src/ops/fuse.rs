//! Multi-input coincidence detector.
//!
//! Each input port keeps the timestamps it received within the last
//! `window`. When the number of ports holding at least one such timestamp
//! reaches `min_count`, a fused event is emitted at the timestamp of the
//! arrival that completed the count and every port's window is cleared.
//! Arrivals of one instant are consumed in port-declaration order, then
//! arrival order.

use std::collections::VecDeque;

use super::{Arrival, Emission};
use crate::event::MetaValue;
use crate::params::{ParamError, ParamReader, ParamResult};
use crate::units::{TimeUnit, NS_PER_MS};

pub const MIN_INPUTS: i64 = 2;
pub const MAX_INPUTS: i64 = 26;

pub(crate) fn clamp_inputs(n: i64) -> usize {
    n.clamp(MIN_INPUTS, MAX_INPUTS) as usize
}

/// Port names: "a", "b", "c", ...
pub fn port_name(i: usize) -> String {
    char::from(b'a' + i as u8).to_string()
}

#[derive(Debug, Clone)]
pub struct EventFuse {
    pub window_ns: u64,
    pub min_count: usize,
    windows: Vec<VecDeque<u64>>,
}

impl EventFuse {
    pub(super) fn from_params(r: &mut ParamReader<'_>) -> ParamResult<Self> {
        let window_ns = r.duration_or("window_us", TimeUnit::Us, 50 * NS_PER_MS)?;
        if window_ns == 0 {
            return Err(ParamError::invalid("window_us", "must be > 0"));
        }
        let n_inputs = r.int_in("n_inputs", MIN_INPUTS, MIN_INPUTS, MAX_INPUTS)?;
        let min_count = r.int_in("min_count", 2, 1, n_inputs)?;
        Ok(Self::new(window_ns, min_count as usize, n_inputs as usize))
    }

    pub fn new(window_ns: u64, min_count: usize, n_inputs: usize) -> Self {
        Self {
            window_ns,
            min_count,
            windows: vec![VecDeque::new(); n_inputs],
        }
    }

    fn active_ports(&self) -> usize {
        self.windows.iter().filter(|w| !w.is_empty()).count()
    }

    pub(super) fn step(&mut self, arrivals: &[Arrival], out: &mut Vec<Emission>) {
        let mut ordered: Vec<&Arrival> = arrivals.iter().collect();
        // Stable: keeps canonical order within a port.
        ordered.sort_by_key(|a| a.port);

        for a in ordered {
            let Some(window) = self.windows.get_mut(a.port) else {
                continue;
            };
            window.push_back(a.ts);

            let cutoff = a.ts.saturating_sub(self.window_ns);
            for w in &mut self.windows {
                while w.front().is_some_and(|&front| front < cutoff) {
                    w.pop_front();
                }
            }

            let active = self.active_ports();
            if active >= self.min_count {
                let mut meta = crate::event::Meta::new();
                meta.insert("unit".into(), MetaValue::from("coincidence"));
                meta.insert("count".into(), MetaValue::Int(active as i64));
                out.push(Emission::new(a.ts, vec![0], 1.0).with_meta(meta));
                self.windows.iter_mut().for_each(VecDeque::clear);
            }
        }
    }
}
