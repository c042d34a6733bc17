//! Leaky integrate-and-fire population with exponential leak and refractory period.

use std::collections::BTreeMap;

use rand_chacha::ChaCha8Rng;

use super::{Arrival, BuildCtx, Emission, OpError};
use crate::params::{ParamError, ParamReader, ParamResult};
use crate::seed::{node_rng, uniform_signed};
use crate::units::{TimeUnit, NS_PER_MS, NS_PER_US};

/// One neuron of the population.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LifCell {
    pub membrane: f64,
    /// Time of the last integration; the leak is computed from here.
    pub last_update: Option<u64>,
    pub refractory_until: u64,
}

impl Default for LifCell {
    fn default() -> Self {
        Self {
            membrane: 0.0,
            last_update: None,
            refractory_until: 0,
        }
    }
}

impl LifCell {
    /// Inject `current` at time `t`. Returns true if the neuron fires.
    /// On fire, membrane resets to `v_reset` and the refractory window opens;
    /// the caller emits the spike.
    pub fn inject(&mut self, current: f64, t: u64, p: &LifParams) -> bool {
        if t < self.refractory_until {
            return false;
        }
        let decay = match self.last_update {
            Some(prev) => (-((t - prev) as f64) / p.tau_ns as f64).exp(),
            None => 1.0,
        };
        self.membrane = self.membrane * decay + current;
        self.last_update = Some(t);
        if self.membrane >= p.v_th {
            self.membrane = p.v_reset;
            self.refractory_until = t.saturating_add(p.refractory_ns);
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LifParams {
    pub tau_ns: u64,
    pub v_th: f64,
    pub v_reset: f64,
    pub r_m: f64,
    pub refractory_ns: u64,
    pub noise: f64,
}

#[derive(Debug, Clone)]
pub struct Lif {
    pub params: LifParams,
    pub cells: Vec<LifCell>,
    rng: ChaCha8Rng,
}

impl Lif {
    pub const MAX_POPULATION: i64 = 1 << 20;

    pub(super) fn from_params(r: &mut ParamReader<'_>, ctx: BuildCtx) -> ParamResult<Self> {
        let tau_ns = r.duration_or("tau_ms", TimeUnit::Ms, 10 * NS_PER_MS)?;
        if tau_ns == 0 {
            return Err(ParamError::invalid("tau_ms", "must be > 0"));
        }
        let v_th = r.f64_or("v_th", 1.0)?;
        let v_reset = r.f64_or("v_reset", 0.0)?;
        if v_reset >= v_th {
            return Err(ParamError::invalid("v_reset", "must be below v_th"));
        }
        let r_m = r.f64_or("r_m", 1.0)?;
        let refractory_ns = r.duration_or("refractory_us", TimeUnit::Us, 2_000 * NS_PER_US)?;
        let n = r.int_in("n", 1, 1, Self::MAX_POPULATION)? as usize;
        let noise = r.f64_or("noise", 0.0)?;
        if noise < 0.0 {
            return Err(ParamError::invalid("noise", "must be >= 0"));
        }
        Ok(Self::new(
            LifParams {
                tau_ns,
                v_th,
                v_reset,
                r_m,
                refractory_ns,
                noise,
            },
            n,
            ctx.node_seed,
        ))
    }

    pub fn new(params: LifParams, n: usize, seed: u64) -> Self {
        Self {
            params,
            cells: vec![LifCell::default(); n],
            rng: node_rng(seed),
        }
    }

    pub(super) fn step(&mut self, t: u64, arrivals: &[Arrival], out: &mut Vec<Emission>) -> Result<(), OpError> {
        // Same-instant arrivals on one neuron are summed into a single current.
        let mut currents: BTreeMap<usize, f64> = BTreeMap::new();
        for a in arrivals {
            let ch = a.channel();
            let cell = usize::try_from(ch)
                .ok()
                .filter(|&c| c < self.cells.len())
                .ok_or(OpError::ChannelOutOfRange {
                    channel: ch,
                    size: self.cells.len(),
                })?;
            *currents.entry(cell).or_insert(0.0) += a.scalar()?;
        }

        for (ch, input) in currents {
            let mut current = self.params.r_m * input;
            if self.params.noise > 0.0 {
                current += self.params.noise * uniform_signed(&mut self.rng);
            }
            if self.cells[ch].inject(current, t, &self.params) {
                out.push(Emission::new(t, vec![ch as i64], 1.0).tag("unit", "spike"));
            }
        }
        Ok(())
    }
}
