//! Operator library.
//!
//! Every node kind is a variant of [`Operator`], carrying its validated
//! parameters and its private state. The executor drives operators through a
//! single exhaustive dispatch:
//!
//! - [`Operator::release`] runs first in an instant and hands back buffered
//!   events that have come due (only `DelayLine` buffers anything).
//! - [`Operator::step`] is called at most once per node per instant with every
//!   arrival for that instant, sorted by canonical key.
//! - [`Operator::next_wakeup`] tells the executor when the node next needs a
//!   release phase even if nothing arrives.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{Meta, Value};
use crate::graph::{Port, PortDir};
use crate::params::{ParamError, ParamReader, Params};

pub mod delay;
pub mod fuse;
pub mod lif;
pub mod mel;
pub mod spatial;
pub mod stft;
pub mod synapse;

pub use delay::DelayLine;
pub use fuse::EventFuse;
pub use lif::{Lif, LifCell};
pub use mel::{build_mel_filters, MelBands};
pub use spatial::{ShiftXy, XyToChannel};
pub use stft::Stft;
pub use synapse::ExpSynapse;

/// Node kind. Document names are the snake_case variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Lif,
    ExpSyn,
    Delay,
    Fuse,
    Stft,
    Mel,
    XyToCh,
    ShiftXy,
}

impl OpKind {
    pub const ALL: [OpKind; 8] = [
        OpKind::Lif,
        OpKind::ExpSyn,
        OpKind::Delay,
        OpKind::Fuse,
        OpKind::Stft,
        OpKind::Mel,
        OpKind::XyToCh,
        OpKind::ShiftXy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Lif => "lif",
            OpKind::ExpSyn => "exp_syn",
            OpKind::Delay => "delay",
            OpKind::Fuse => "fuse",
            OpKind::Stft => "stft",
            OpKind::Mel => "mel",
            OpKind::XyToCh => "xy_to_ch",
            OpKind::ShiftXy => "shift_xy",
        }
    }

    /// Operators whose output is always strictly later than their input.
    /// Their outgoing edges carry state to a future instant.
    pub fn defers_output(self) -> bool {
        matches!(self, OpKind::Delay)
    }

    /// Port declaration. Reads `n_inputs` (fuse) and `n`/`width`/`height`
    /// leniently; the authoritative validation happens at plan-build time.
    pub fn ports(self, params: &Params) -> (Vec<Port>, Vec<Port>) {
        let lenient = |name: &str| ParamReader::new(params).i64_or(name, 0).unwrap_or(0);
        let single = |input: &str, output: &str, channels: Option<u32>| {
            (
                vec![Port::new(input, PortDir::Input, None)],
                vec![Port::new(output, PortDir::Output, channels)],
            )
        };
        match self {
            OpKind::Lif => {
                let n = lenient("n").max(1);
                single("in", "spike", u32::try_from(n).ok())
            }
            OpKind::ExpSyn => single("pre", "post", None),
            OpKind::Delay => single("in", "out", None),
            OpKind::Fuse => {
                let n = fuse::clamp_inputs(lenient("n_inputs"));
                let inputs = (0..n)
                    .map(|i| Port::new(fuse::port_name(i), PortDir::Input, None))
                    .collect();
                (inputs, vec![Port::new("out", PortDir::Output, Some(1))])
            }
            OpKind::Stft => single("in", "spec", None),
            OpKind::Mel => single("in", "mel", None),
            OpKind::XyToCh => single("in", "ch", None),
            OpKind::ShiftXy => single("in", "out", None),
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let k = match s {
            "lif" | "LIFNeuron" => OpKind::Lif,
            "exp_syn" | "ExpSynapse" => OpKind::ExpSyn,
            "delay" | "DelayLine" => OpKind::Delay,
            "fuse" | "EventFuse" => OpKind::Fuse,
            "stft" | "STFT" => OpKind::Stft,
            "mel" | "MelBands" => OpKind::Mel,
            "xy_to_ch" | "XYToChannel" => OpKind::XyToCh,
            "shift_xy" | "ShiftXY" => OpKind::ShiftXy,
            other => return Err(other.to_string()),
        };
        Ok(k)
    }
}

/// One event delivered to a node input port in the current instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Arrival {
    pub port: usize,
    /// Source timestamp (before fixed-step quantization).
    pub ts: u64,
    pub idx: Vec<i64>,
    pub value: Value,
    pub meta: Meta,
}

impl Arrival {
    /// Primary index, 0 when the tuple is empty.
    #[inline]
    pub fn channel(&self) -> i64 {
        self.idx.first().copied().unwrap_or(0)
    }

    pub fn scalar(&self) -> Result<f64, OpError> {
        self.value
            .as_scalar()
            .ok_or_else(|| OpError::Malformed("expected a scalar value, got a vector".into()))
    }
}

/// One event produced on a node output port.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub port: usize,
    pub ts: u64,
    pub idx: Vec<i64>,
    pub value: Value,
    pub meta: Meta,
}

impl Emission {
    pub fn new(ts: u64, idx: Vec<i64>, value: impl Into<Value>) -> Self {
        Self {
            port: 0,
            ts,
            idx,
            value: value.into(),
            meta: Meta::new(),
        }
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn tag(mut self, key: &str, value: impl Into<crate::event::MetaValue>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }
}

/// Runtime failure raised by an operator step.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OpError {
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("channel {channel} out of range (population size {size})")]
    ChannelOutOfRange { channel: i64, size: usize },
}

/// Plan-time context handed to operator constructors.
#[derive(Debug, Clone, Copy)]
pub struct BuildCtx {
    /// Sub-seed derived from (graph seed, node id).
    pub node_seed: u64,
}

#[derive(Debug, Clone)]
pub enum Operator {
    Lif(Lif),
    ExpSyn(ExpSynapse),
    Delay(DelayLine),
    Fuse(EventFuse),
    Stft(Stft),
    Mel(MelBands),
    XyToCh(XyToChannel),
    ShiftXy(ShiftXy),
}

impl Operator {
    /// Validate `params` for `kind` and build an operator in its initial state.
    pub fn build(kind: OpKind, params: &Params, ctx: BuildCtx) -> Result<Self, ParamError> {
        let mut r = ParamReader::new(params);
        let op = match kind {
            OpKind::Lif => Operator::Lif(Lif::from_params(&mut r, ctx)?),
            OpKind::ExpSyn => Operator::ExpSyn(ExpSynapse::from_params(&mut r)?),
            OpKind::Delay => Operator::Delay(DelayLine::from_params(&mut r)?),
            OpKind::Fuse => Operator::Fuse(EventFuse::from_params(&mut r)?),
            OpKind::Stft => Operator::Stft(Stft::from_params(&mut r)?),
            OpKind::Mel => Operator::Mel(MelBands::from_params(&mut r)?),
            OpKind::XyToCh => Operator::XyToCh(XyToChannel::from_params(&mut r)?),
            OpKind::ShiftXy => Operator::ShiftXy(ShiftXy::from_params(&mut r)?),
        };
        r.finish()?;
        Ok(op)
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Operator::Lif(_) => OpKind::Lif,
            Operator::ExpSyn(_) => OpKind::ExpSyn,
            Operator::Delay(_) => OpKind::Delay,
            Operator::Fuse(_) => OpKind::Fuse,
            Operator::Stft(_) => OpKind::Stft,
            Operator::Mel(_) => OpKind::Mel,
            Operator::XyToCh(_) => OpKind::XyToCh,
            Operator::ShiftXy(_) => OpKind::ShiftXy,
        }
    }

    /// Advance the node to instant `t` with the given arrivals.
    pub fn step(&mut self, t: u64, arrivals: &[Arrival], out: &mut Vec<Emission>) -> Result<(), OpError> {
        match self {
            Operator::Lif(op) => op.step(t, arrivals, out),
            Operator::ExpSyn(op) => op.step(t, arrivals, out),
            Operator::Delay(op) => {
                op.step(arrivals);
                Ok(())
            }
            Operator::Fuse(op) => {
                op.step(arrivals, out);
                Ok(())
            }
            Operator::Stft(op) => op.step(t, arrivals, out),
            Operator::Mel(op) => op.step(arrivals, out),
            Operator::XyToCh(op) => op.step(arrivals, out),
            Operator::ShiftXy(op) => op.step(arrivals, out),
        }
    }

    /// Emit buffered events whose release time is `< until`.
    pub fn release(&mut self, until: u64, out: &mut Vec<Emission>) {
        if let Operator::Delay(op) = self {
            op.release(until, out);
        }
    }

    pub fn next_wakeup(&self) -> Option<u64> {
        match self {
            Operator::Delay(op) => op.next_release(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;

    #[test]
    fn kind_names_round_trip() {
        for kind in OpKind::ALL {
            assert_eq!(kind.as_str().parse::<OpKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert_eq!("EventFuse".parse::<OpKind>().unwrap(), OpKind::Fuse);
        assert!("conv2d".parse::<OpKind>().is_err());
    }

    #[test]
    fn fuse_ports_follow_n_inputs() {
        let (inputs, outputs) = OpKind::Fuse.ports(&params! { "n_inputs" => 3 });
        let names: Vec<_> = inputs.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(outputs[0].name, "out");
    }

    #[test]
    fn build_rejects_unknown_parameter() {
        let err = Operator::build(
            OpKind::Delay,
            &params! { "delay_us" => 5, "jitter" => 1.0 },
            BuildCtx { node_seed: 0 },
        )
        .unwrap_err();
        assert_eq!(err.param(), "jitter");
    }
}
