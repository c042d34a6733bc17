//! Deterministic executor.
//!
//! Time advances in *instants*. In `exact_event` mode an instant is one
//! distinct timestamp; in `fixed_step` mode it is one tick `[T, T + dt)`.
//! Each instant runs in three phases:
//!
//! 1. **release**: nodes with a due wakeup (delay lines) hand back buffered
//!    events, in evaluation order; these are routed before anything steps.
//! 2. **drain**: queued events belonging to the instant are moved into the
//!    per-node inboxes.
//! 3. **step**: nodes are stepped level by level (see
//!    [`EirGraph::instant_levels`](eir_core::EirGraph::instant_levels)), each
//!    at most once, with its arrivals sorted by canonical key. Emissions on
//!    same-instant edges land in downstream inboxes; everything else goes to
//!    the global queue.
//!
//! Routing is always sequential in evaluation order, so stepping the nodes
//! of one level on a worker pool (feature `parallel`) yields the same trace.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eir_core::{Arrival, Emission, Event, EventKey, EventQueue, ExecMode, Meta, Operator, Value};
use serde::Serialize;
use tracing::{debug, info, info_span, trace, warn};

use crate::error::RuntimeError;
use crate::plan::ExecPlan;
use crate::trace::{Trace, TraceHeader};

/// Optional limits for one call to [`Executor::run_with_budgets`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepBudgets {
    pub max_instants: Option<u64>,
    /// Do not start an instant beginning after this time.
    pub until_ns: Option<u64>,
}

/// Cooperative cancellation, checked between instants.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExecOptions {
    pub limits: StepBudgets,
    pub cancel: CancelToken,
    /// Step independent nodes of an instant on the rayon pool. Only honored
    /// with the `parallel` feature.
    pub parallel: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecState {
    Idle,
    /// exact_event: an instant is being drained.
    Draining,
    /// fixed_step: a tick is being stepped.
    Stepping,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No pending work remains.
    Completed,
    /// A budget stopped the run with work still pending.
    Truncated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DriftSample {
    pub ts: u64,
    pub tick: u64,
    pub error_ns: u64,
}

/// Fixed-step quantization error accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    pub violations: u64,
    pub first: Option<DriftSample>,
    pub max_error_ns: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub instants: u64,
    pub events_in: u64,
    pub deliveries: u64,
    pub emissions: u64,
    pub records: u64,
    pub drift: DriftReport,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub trace: Trace,
    pub stats: RunStats,
    pub status: RunStatus,
}

/// A run that aborted. The trace recorded up to the failing instant is kept.
#[derive(Debug, thiserror::Error)]
#[error("run aborted after {} instants", .stats.instants)]
pub struct RunFailure {
    #[source]
    pub error: RuntimeError,
    pub partial: Trace,
    pub stats: RunStats,
}

/// What one instant did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstantReport {
    /// Instant time (tick start in fixed_step mode).
    pub t: u64,
    /// Trace records written by this instant: `trace().records()[first_record..][..records]`.
    pub first_record: usize,
    pub records: usize,
}

#[derive(Debug, Clone)]
struct Pending {
    node: usize,
    port: usize,
    value: Value,
    meta: Meta,
}

#[derive(Debug)]
struct Inbound {
    key: EventKey,
    port: usize,
    value: Value,
    meta: Meta,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Release,
    Step,
}

type StepResult = Result<Vec<Emission>, RuntimeError>;

pub struct Executor {
    plan: ExecPlan,
    ops: Vec<Operator>,
    queue: EventQueue<Pending>,
    wake_at: Vec<Option<u64>>,
    wakeups: BTreeSet<(u64, usize)>,
    trace: Trace,
    stats: RunStats,
    state: ExecState,
    /// Earliest timestamp still admissible as input.
    frontier: u64,
    last_tick: Option<u64>,
    failed: Option<RuntimeError>,
    parallel: bool,
}

impl Executor {
    pub fn new(plan: ExecPlan) -> Self {
        let ops = plan.instantiate();
        let n = ops.len();
        let trace = Trace::with_header(Self::header(&plan));
        Self {
            plan,
            ops,
            queue: EventQueue::new(),
            wake_at: vec![None; n],
            wakeups: BTreeSet::new(),
            trace,
            stats: RunStats::default(),
            state: ExecState::Idle,
            frontier: 0,
            last_tick: None,
            failed: None,
            parallel: false,
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    fn header(plan: &ExecPlan) -> TraceHeader {
        let mut h = TraceHeader::default();
        h.metadata.insert("mode".into(), plan.mode().as_str().into());
        h.metadata.insert("seed".into(), plan.seed().into());
        if let Some(dt) = plan.dt_ns() {
            h.metadata.insert("dt_ns".into(), dt.into());
        }
        h
    }

    /// Drop all state and pending work; operators return to their initial state.
    pub fn reset(&mut self) {
        *self = Self::new(self.plan.clone()).with_parallel(self.parallel);
    }

    pub fn plan(&self) -> &ExecPlan {
        &self.plan
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn frontier(&self) -> u64 {
        self.frontier
    }

    pub fn operator(&self, node: usize) -> &Operator {
        &self.ops[node]
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty() || !self.wakeups.is_empty()
    }

    /// Queue one external event.
    pub fn ingest(&mut self, ev: Event) -> Result<(), RuntimeError> {
        let (node, port) = self
            .plan
            .resolve_input(&ev.target)
            .ok_or_else(|| RuntimeError::UnknownTarget {
                node: ev.target.node.clone(),
                port: ev.target.port.clone(),
            })?;
        if ev.ts < self.frontier {
            return Err(RuntimeError::LateInput {
                target: format!("{}.{}", ev.target.node, ev.target.port),
                ts: ev.ts,
                frontier: self.frontier,
            });
        }
        self.queue.schedule(
            ev.ts,
            ev.idx,
            Pending {
                node,
                port,
                value: ev.value,
                meta: ev.meta,
            },
        );
        self.stats.events_in += 1;
        if self.state == ExecState::Idle {
            self.state = self.busy_state();
        }
        Ok(())
    }

    pub fn ingest_all(&mut self, events: impl IntoIterator<Item = Event>) -> Result<(), RuntimeError> {
        events.into_iter().try_for_each(|ev| self.ingest(ev))
    }

    fn busy_state(&self) -> ExecState {
        match self.plan.mode() {
            ExecMode::ExactEvent => ExecState::Draining,
            ExecMode::FixedStep => ExecState::Stepping,
        }
    }

    /// Bounds `[start, end)` of the next instant, if any work is pending.
    pub fn next_instant(&self) -> Option<(u64, u64)> {
        let next_wake = self.wakeups.first().map(|&(ts, _)| ts);
        let min = match (self.queue.peek_time(), next_wake) {
            (Some(a), Some(b)) => a.min(b),
            (a, b) => a.or(b)?,
        };
        match self.plan.dt_ns() {
            Some(dt) => {
                let mut tick = min / dt * dt;
                if let Some(last) = self.last_tick {
                    tick = tick.max(last.saturating_add(dt));
                }
                Some((tick, tick.saturating_add(dt)))
            }
            None => Some((min, min.saturating_add(1))),
        }
    }

    /// Run one instant. `Ok(None)` when there is nothing left to do.
    pub fn step_instant(&mut self) -> Result<Option<InstantReport>, RuntimeError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        let Some((t, end)) = self.next_instant() else {
            self.state = ExecState::Idle;
            return Ok(None);
        };
        self.state = self.busy_state();
        let first_record = self.trace.len();

        if let Err(e) = self.run_instant(t, end) {
            self.failed = Some(e.clone());
            self.state = ExecState::Idle;
            return Err(e);
        }

        self.stats.instants += 1;
        self.frontier = end;
        if self.plan.mode() == ExecMode::FixedStep {
            self.last_tick = Some(t);
        }
        if !self.has_pending() {
            self.state = ExecState::Idle;
        }
        let records = self.trace.len() - first_record;
        trace!(t, records, pending = self.queue.len(), "instant");
        Ok(Some(InstantReport { t, first_record, records }))
    }

    /// Drive instants until idle, a budget is hit, or the token is cancelled.
    pub fn run_with_budgets(&mut self, budgets: StepBudgets, cancel: &CancelToken) -> Result<RunStatus, RuntimeError> {
        let mut done: u64 = 0;
        loop {
            let Some((t, _)) = self.next_instant() else {
                self.state = ExecState::Idle;
                return Ok(RunStatus::Completed);
            };
            if cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled { at: t });
            }
            if budgets.max_instants.is_some_and(|max| done >= max) || budgets.until_ns.is_some_and(|until| t > until) {
                return Ok(RunStatus::Truncated);
            }
            self.step_instant()?;
            done += 1;
        }
    }

    /// Finalize into an outcome; the trace is put in canonical order.
    pub fn finish(mut self, status: RunStatus) -> RunOutcome {
        self.trace.finish();
        self.stats.records = self.trace.len() as u64;
        RunOutcome {
            trace: self.trace,
            stats: self.stats,
            status,
        }
    }

    pub fn fail(mut self, error: RuntimeError) -> RunFailure {
        self.trace.finish();
        self.stats.records = self.trace.len() as u64;
        RunFailure {
            error,
            partial: self.trace,
            stats: self.stats,
        }
    }

    fn run_instant(&mut self, t: u64, end: u64) -> Result<(), RuntimeError> {
        let mut inbox: Vec<Vec<Inbound>> = (0..self.ops.len()).map(|_| Vec::new()).collect();

        let due: BTreeSet<usize> = self.wakeups.range(..(end, 0)).map(|&(_, node)| node).collect();
        if !due.is_empty() {
            let order: Vec<usize> = self.plan.eval_order().iter().copied().filter(|n| due.contains(n)).collect();
            for node in order {
                let mut out = Vec::new();
                self.ops[node].release(end, &mut out);
                self.refresh_wakeup(node);
                self.emit(node, out, Phase::Release, t, end, &mut inbox)?;
            }
        }

        for (key, p) in self.queue.drain_before(end) {
            inbox[p.node].push(Inbound {
                key,
                port: p.port,
                value: p.value,
                meta: p.meta,
            });
        }

        for li in 0..self.plan.levels().len() {
            let active: Vec<usize> = self.plan.levels()[li]
                .iter()
                .copied()
                .filter(|&n| !inbox[n].is_empty())
                .collect();
            if active.is_empty() {
                continue;
            }
            let mut batches = Vec::with_capacity(active.len());
            for n in active {
                let items = std::mem::take(&mut inbox[n]);
                batches.push((n, self.arrivals(items, t)));
            }
            for (node, result) in self.step_level(t, batches) {
                let out = result?;
                self.refresh_wakeup(node);
                self.emit(node, out, Phase::Step, t, end, &mut inbox)?;
            }
        }
        Ok(())
    }

    /// Sort a node's inbox canonically and account quantization drift.
    fn arrivals(&mut self, mut items: Vec<Inbound>, t: u64) -> Vec<Arrival> {
        items.sort_by(|a, b| a.key.cmp(&b.key));
        self.stats.deliveries += items.len() as u64;
        if self.plan.mode() == ExecMode::FixedStep {
            for it in &items {
                self.note_drift(it.key.ts, t);
            }
        }
        items
            .into_iter()
            .map(|it| Arrival {
                port: it.port,
                ts: it.key.ts,
                idx: it.key.idx,
                value: it.value,
                meta: it.meta,
            })
            .collect()
    }

    fn note_drift(&mut self, ts: u64, tick: u64) {
        let error_ns = ts.abs_diff(tick);
        let drift = &mut self.stats.drift;
        drift.max_error_ns = drift.max_error_ns.max(error_ns);
        if error_ns > self.plan.epsilons().time_ns {
            drift.violations += 1;
            if drift.first.is_none() {
                drift.first = Some(DriftSample { ts, tick, error_ns });
                debug!(ts, tick, error_ns, "quantization error exceeds epsilon_time");
            }
        }
    }

    fn step_level(&mut self, t: u64, batches: Vec<(usize, Vec<Arrival>)>) -> Vec<(usize, StepResult)> {
        let plan = &self.plan;
        let step = |node: usize, op: &mut Operator, arrivals: &[Arrival]| -> StepResult {
            let mut out = Vec::new();
            op.step(t, arrivals, &mut out).map_err(|source| RuntimeError::Operator {
                node: plan.node(node).id.clone(),
                ts: t,
                event: describe(plan, node, arrivals),
                source,
            })?;
            Ok(out)
        };

        #[cfg(feature = "parallel")]
        {
            if self.parallel && batches.len() > 1 {
                use rayon::prelude::*;
                let mut slots: Vec<Option<&mut Operator>> = self.ops.iter_mut().map(Some).collect();
                let work: Vec<(usize, &mut Operator, Vec<Arrival>)> = batches
                    .into_iter()
                    .filter_map(|(n, a)| slots[n].take().map(|op| (n, op, a)))
                    .collect();
                return work
                    .into_par_iter()
                    .map(|(n, op, a)| (n, step(n, op, &a)))
                    .collect();
            }
        }

        batches
            .into_iter()
            .map(|(n, a)| (n, step(n, &mut self.ops[n], &a)))
            .collect()
    }

    fn refresh_wakeup(&mut self, node: usize) {
        let next = self.ops[node].next_wakeup();
        if self.wake_at[node] == next {
            return;
        }
        if let Some(old) = self.wake_at[node] {
            self.wakeups.remove(&(old, node));
        }
        if let Some(ts) = next {
            self.wakeups.insert((ts, node));
        }
        self.wake_at[node] = next;
    }

    /// Record probes and route one node's emissions.
    fn emit(
        &mut self,
        node: usize,
        out: Vec<Emission>,
        phase: Phase,
        t: u64,
        end: u64,
        inbox: &mut [Vec<Inbound>],
    ) -> Result<(), RuntimeError> {
        let exact = self.plan.mode() == ExecMode::ExactEvent;
        for e in out {
            if exact && e.ts < t {
                return Err(self.violation(node, e.ts, t));
            }
            self.stats.emissions += 1;
            for &k in self.plan.port_probes(node, e.port) {
                let id = &self.plan.probes()[k].id;
                self.trace.record(id, e.ts, e.idx.clone(), e.value.clone(), e.meta.clone());
            }

            for route in self.plan.routes(node, e.port) {
                let ts = e.ts.saturating_add(route.delay_ns);
                let value = e.value.scaled(route.weight);
                if ts < end && (phase == Phase::Release || route.same_instant) {
                    let seq = self.queue.reserve_seq();
                    inbox[route.dst].push(Inbound {
                        key: EventKey {
                            ts,
                            idx: e.idx.clone(),
                            seq,
                        },
                        port: route.dst_port,
                        value,
                        meta: e.meta.clone(),
                    });
                } else {
                    if exact && ts < end {
                        return Err(self.violation(node, ts, t));
                    }
                    self.queue.schedule(
                        ts,
                        e.idx.clone(),
                        Pending {
                            node: route.dst,
                            port: route.dst_port,
                            value,
                            meta: e.meta.clone(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    fn violation(&self, node: usize, ts: u64, now: u64) -> RuntimeError {
        RuntimeError::OrderingViolation {
            node: self.plan.node(node).id.clone(),
            ts,
            now,
        }
    }
}

fn describe(plan: &ExecPlan, node: usize, arrivals: &[Arrival]) -> String {
    let Some(a) = arrivals.first() else {
        return "no input".to_string();
    };
    let port = plan.node(node).inputs.get(a.port).map(String::as_str).unwrap_or("?");
    let value = match &a.value {
        Value::Scalar(v) => format!("{v}"),
        Value::Vector(v) => format!("[{} values]", v.len()),
    };
    let more = match arrivals.len() {
        1 => String::new(),
        n => format!(" (+{} more)", n - 1),
    };
    format!("{port}@{} idx={:?} val={value}{more}", a.ts, a.idx)
}

/// Run `plan` over `events` from a fresh state.
pub fn run(plan: &ExecPlan, events: impl IntoIterator<Item = Event>, opts: &ExecOptions) -> Result<RunOutcome, RunFailure> {
    let span = info_span!("eir.run", mode = %plan.mode(), seed = plan.seed(), nodes = plan.len());
    let _guard = span.enter();

    let mut exec = Executor::new(plan.clone()).with_parallel(opts.parallel);
    let result = exec
        .ingest_all(events)
        .and_then(|()| {
            info!(events = exec.stats().events_in, "run started");
            exec.run_with_budgets(opts.limits, &opts.cancel)
        });
    match result {
        Ok(status) => {
            let outcome = exec.finish(status);
            info!(
                instants = outcome.stats.instants,
                emissions = outcome.stats.emissions,
                records = outcome.stats.records,
                drift_violations = outcome.stats.drift.violations,
                ?status,
                "run finished"
            );
            Ok(outcome)
        }
        Err(error) => {
            warn!(%error, "run aborted");
            Err(exec.fail(error))
        }
    }
}
