//! eir-core: deterministic event-graph IR (graph model, time units, operators)
//!
//! This crate holds everything that describes a computation:
//! - Time literals and units (`units`)
//! - Events, canonical order keys and the global event queue
//! - The graph model with same-instant cycle analysis (`graph`)
//! - The closed operator library (`ops`) and per-node seeding (`seed`)
//! - JSON graph documents (`serialize`)
//!
//! Execution lives in `eir-runtime`.

pub mod event;
pub mod event_queue;
pub mod graph;
pub mod ops;
pub mod params;
pub mod seed;
pub mod serialize;
pub mod units;

// Re-exports
pub use event::{Event, EventKey, Meta, MetaValue, PortRef, Value};
pub use event_queue::EventQueue;
pub use graph::{
    Edge, EdgeOpts, EdgeRef, EirGraph, ExecMode, GraphError, Node, NodeRef, Port, PortDir, Probe, TimeConfig,
};
pub use ops::{Arrival, BuildCtx, Emission, OpError, OpKind, Operator};
pub use params::{ParamError, ParamReader, ParamValue, Params};
pub use serialize::{GraphDocument, SerializeError};
pub use units::{parse_time, Epsilons, TimeUnit, UnitsError};
