//! eir-runtime: deterministic execution of eir-core graphs
//!
//! - Execution plans: validated order, routing table, resolved probes (`plan`)
//! - The two-mode executor with budgets and cancellation (`executor`)
//! - JSON-lines probe traces and input streams (`trace`, `stream`)
//! - Tolerance-based trace equivalence (`compare`)
//!
//! With feature "parallel", independent nodes of one instant are stepped on
//! the rayon pool; traces are identical to sequential runs.

pub mod compare;
pub mod error;
pub mod executor;
pub mod plan;
pub mod stream;
pub mod trace;

// Re-exports
pub use compare::{compare, trace_equivalent, ComparisonReport, Divergence, DivergenceKind, Verdict};
pub use error::{EirError, EirResult, PlanError, RuntimeError, TraceError};
pub use executor::{
    run, CancelToken, DriftReport, DriftSample, ExecOptions, ExecState, Executor, InstantReport, RunFailure,
    RunOutcome, RunStats, RunStatus, StepBudgets,
};
pub use plan::{ExecPlan, PlanNode, ProbeSpec, Route};
pub use stream::{events_to_jsonl, load_events, parse_events};
pub use trace::{Trace, TraceHeader, TraceRecord, TraceUnits, SCHEMA_VERSION};
