use std::path::PathBuf;

use eir_core::{GraphError, OpError, ParamError, SerializeError, UnitsError};
use thiserror::Error;

/// Failures while turning a graph into an [`ExecPlan`](crate::ExecPlan).
/// Nothing has run when one of these is returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error("node '{node}': {source}")]
    InvalidParameter {
        node: String,
        #[source]
        source: ParamError,
    },
    #[error("fixed_step mode requires dt_us")]
    MissingStep,
    #[error("fixed_step dt_us must be > 0")]
    InvalidStep,
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Failures during execution. Every variant aborts the run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("node '{node}' failed at t={ts}ns on {event}: {source}")]
    Operator {
        node: String,
        ts: u64,
        event: String,
        #[source]
        source: OpError,
    },
    #[error("ordering violation: node '{node}' emitted t={ts}ns during instant t={now}ns")]
    OrderingViolation { node: String, ts: u64, now: u64 },
    #[error("run cancelled before instant t={at}ns")]
    Cancelled { at: u64 },
    #[error("late input for {target}: t={ts}ns precedes frontier t={frontier}ns")]
    LateInput { target: String, ts: u64, frontier: u64 },
    #[error("input addressed to unknown input port {node}.{port}")]
    UnknownTarget { node: String, port: String },
}

/// Trace and input-stream document failures.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid time unit: {0}")]
    Units(#[from] UnitsError),
    #[error("record {index} (t={ts}) precedes its predecessor (t={prev})")]
    Unordered { index: usize, prev: u64, ts: u64 },
}

/// Umbrella error for callers that do not care which stage failed.
#[derive(Debug, Error)]
pub enum EirError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Serialize(#[from] SerializeError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Trace(#[from] TraceError),
}

pub type EirResult<T, E = EirError> = core::result::Result<T, E>;
