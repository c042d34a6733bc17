//! Exponential post-synaptic trace.

use std::collections::BTreeMap;

use super::{Arrival, Emission, OpError};
use crate::params::{ParamError, ParamReader, ParamResult};
use crate::units::{TimeUnit, NS_PER_MS};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SynOutput {
    /// Emit the post-update trace value every instant the channel receives input.
    Trace,
    /// Emit 1.0 when the trace rises through `threshold`.
    Crossing { threshold: f64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct SynCell {
    trace: f64,
    last_update: u64,
}

#[derive(Debug, Clone)]
pub struct ExpSynapse {
    pub tau_ns: u64,
    pub weight: f64,
    pub output: SynOutput,
    cells: BTreeMap<i64, SynCell>,
}

impl ExpSynapse {
    pub(super) fn from_params(r: &mut ParamReader<'_>) -> ParamResult<Self> {
        let tau_ns = r.duration_or("tau_ms", TimeUnit::Ms, 5 * NS_PER_MS)?;
        if tau_ns == 0 {
            return Err(ParamError::invalid("tau_ms", "must be > 0"));
        }
        let weight = r.f64_or("weight", 1.0)?;
        let output = match r.str_or("output", "trace")? {
            "trace" => SynOutput::Trace,
            "crossing" => {
                let threshold = r.f64_opt("threshold")?.ok_or(ParamError::Missing {
                    param: "threshold".into(),
                })?;
                if threshold <= 0.0 {
                    return Err(ParamError::invalid("threshold", "must be > 0"));
                }
                SynOutput::Crossing { threshold }
            }
            other => {
                return Err(ParamError::invalid(
                    "output",
                    format!("'{other}' is not one of trace, crossing"),
                ))
            }
        };
        Ok(Self::new(tau_ns, weight, output))
    }

    pub fn new(tau_ns: u64, weight: f64, output: SynOutput) -> Self {
        Self {
            tau_ns,
            weight,
            output,
            cells: BTreeMap::new(),
        }
    }

    /// Current (undecayed) trace of a channel.
    pub fn trace(&self, channel: i64) -> f64 {
        self.cells.get(&channel).map(|c| c.trace).unwrap_or(0.0)
    }

    pub(super) fn step(&mut self, t: u64, arrivals: &[Arrival], out: &mut Vec<Emission>) -> Result<(), OpError> {
        // Every arrival accumulates; the trace decays once per instant.
        let mut inputs: BTreeMap<i64, f64> = BTreeMap::new();
        for a in arrivals {
            *inputs.entry(a.channel()).or_insert(0.0) += self.weight * a.scalar()?;
        }

        for (ch, added) in inputs {
            let cell = self.cells.entry(ch).or_default();
            let dt = t.saturating_sub(cell.last_update);
            let before = cell.trace * (-(dt as f64) / self.tau_ns as f64).exp();
            cell.trace = before + added;
            cell.last_update = t;

            match self.output {
                SynOutput::Trace => {
                    out.push(Emission::new(t, vec![ch], cell.trace).tag("unit", "trace"));
                }
                SynOutput::Crossing { threshold } => {
                    if before < threshold && cell.trace >= threshold {
                        out.push(Emission::new(t, vec![ch], 1.0).tag("unit", "crossing"));
                    }
                }
            }
        }
        Ok(())
    }
}
