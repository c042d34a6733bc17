//! Trace equivalence.
//!
//! Both traces are merge-scanned record by record (they are already in
//! canonical order). A pair diverges when the probe ids or index tuples
//! differ, when `|ts_c - ts_g| > eps_time`, or when any value component has
//! a relative error `|c - g| / max(1, |g|)` above `eps_numeric`. Unpaired
//! tail records and disagreeing header time units are divergences too.
//! Failing a comparison is an ordinary result, not an error.

use core::fmt;

use eir_core::{Epsilons, Value};
use serde::Serialize;

use crate::trace::{Trace, TraceRecord};

/// Mismatches kept in a report beyond the count.
pub const MAX_REPORTED: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    TimeUnit,
    MissingRecord,
    ExtraRecord,
    Probe,
    Index,
    Time,
    Shape,
    Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Divergence {
    pub kind: DivergenceKind,
    /// Record position in both traces (0 for header divergences).
    pub index: usize,
    pub probe: Option<String>,
    pub golden_ts: Option<u64>,
    pub candidate_ts: Option<u64>,
    pub golden_val: Option<Value>,
    pub candidate_val: Option<Value>,
    pub delta_ts: Option<u64>,
    pub rel_err: Option<f64>,
}

impl Divergence {
    fn at(kind: DivergenceKind, index: usize, g: Option<&TraceRecord>, c: Option<&TraceRecord>) -> Self {
        Self {
            kind,
            index,
            probe: g.or(c).map(|r| r.probe.clone()),
            golden_ts: g.map(|r| r.ts),
            candidate_ts: c.map(|r| r.ts),
            golden_val: g.map(|r| r.val.clone()),
            candidate_val: c.map(|r| r.val.clone()),
            delta_ts: g.zip(c).map(|(g, c)| g.ts.abs_diff(c.ts)),
            rel_err: None,
        }
    }
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {:?}", self.index, self.kind)?;
        if let Some(p) = &self.probe {
            write!(f, " probe={p}")?;
        }
        if let (Some(g), Some(c)) = (self.golden_ts, self.candidate_ts) {
            write!(f, " ts golden={g} candidate={c}")?;
        }
        if let Some(e) = self.rel_err {
            write!(f, " rel_err={e:e}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonReport {
    pub verdict: Verdict,
    pub golden_count: usize,
    pub candidate_count: usize,
    pub mismatch_count: usize,
    pub epsilon_time_ns: u64,
    pub epsilon_numeric: f64,
    pub first_divergence: Option<Divergence>,
    pub mismatches: Vec<Divergence>,
}

impl ComparisonReport {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    fn note(&mut self, d: Divergence) {
        self.mismatch_count += 1;
        if self.first_divergence.is_none() {
            self.first_divergence = Some(d.clone());
        }
        if self.mismatches.len() < MAX_REPORTED {
            self.mismatches.push(d);
        }
    }
}

#[inline]
fn rel_err(g: f64, c: f64) -> f64 {
    if g.to_bits() == c.to_bits() {
        return 0.0;
    }
    let e = (c - g).abs() / g.abs().max(1.0);
    if e.is_nan() {
        f64::INFINITY
    } else {
        e
    }
}

fn compare_pair(i: usize, g: &TraceRecord, c: &TraceRecord, eps: &Epsilons) -> Option<Divergence> {
    let div = |kind| Divergence::at(kind, i, Some(g), Some(c));
    if g.probe != c.probe {
        return Some(div(DivergenceKind::Probe));
    }
    if g.idx != c.idx {
        return Some(div(DivergenceKind::Index));
    }
    if g.ts.abs_diff(c.ts) > eps.time_ns {
        return Some(div(DivergenceKind::Time));
    }
    let (gv, cv) = (g.val.as_slice(), c.val.as_slice());
    if gv.len() != cv.len() {
        return Some(div(DivergenceKind::Shape));
    }
    let worst = gv.iter().zip(cv).map(|(&g, &c)| rel_err(g, c)).fold(0.0, f64::max);
    if worst > eps.numeric {
        let mut d = div(DivergenceKind::Value);
        d.rel_err = Some(worst);
        return Some(d);
    }
    None
}

pub fn compare(golden: &Trace, candidate: &Trace, eps: Epsilons) -> ComparisonReport {
    let (gr, cr) = (golden.records(), candidate.records());
    let mut report = ComparisonReport {
        verdict: Verdict::Pass,
        golden_count: gr.len(),
        candidate_count: cr.len(),
        mismatch_count: 0,
        epsilon_time_ns: eps.time_ns,
        epsilon_numeric: eps.numeric,
        first_divergence: None,
        mismatches: Vec::new(),
    };

    if golden.header.units.time != candidate.header.units.time {
        report.note(Divergence::at(DivergenceKind::TimeUnit, 0, None, None));
    }
    for i in 0..gr.len().max(cr.len()) {
        let d = match (gr.get(i), cr.get(i)) {
            (Some(g), Some(c)) => compare_pair(i, g, c, &eps),
            (Some(g), None) => Some(Divergence::at(DivergenceKind::MissingRecord, i, Some(g), None)),
            (None, Some(c)) => Some(Divergence::at(DivergenceKind::ExtraRecord, i, None, Some(c))),
            (None, None) => None,
        };
        if let Some(d) = d {
            report.note(d);
        }
    }

    if report.mismatch_count > 0 {
        report.verdict = Verdict::Fail;
    }
    report
}

/// True iff `candidate` matches `golden` within `eps`.
pub fn trace_equivalent(golden: &Trace, candidate: &Trace, eps: Epsilons) -> bool {
    compare(golden, candidate, eps).passed()
}
