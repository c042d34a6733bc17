//! Graph model: nodes, ports, edges, probes and the time configuration.
//!
//! Nodes and edges live in flat insertion-ordered vectors and refer to each
//! other by index ([`NodeRef`], [`EdgeRef`]). Insertion order is the final
//! tie-break everywhere an order has to be chosen, so two graphs built by the
//! same call sequence order identically.
//!
//! An edge is a *same-instant* dependency when it carries no delay and its
//! source operator does not defer its output (see [`OpKind::defers_output`]).
//! Only same-instant edges take part in ordering and cycle analysis; the rest
//! carry state into a later instant and may close feedback loops.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ops::OpKind;
use crate::params::Params;
use crate::units::{parse_time, TimeUnit, UnitsError, NS_PER_US};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDir {
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub name: String,
    pub dir: PortDir,
    /// Declared channel count, when the operator fixes one.
    pub channels: Option<u32>,
}

impl Port {
    pub fn new(name: impl Into<String>, dir: PortDir, channels: Option<u32>) -> Self {
        Self {
            name: name.into(),
            dir,
            channels,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeRef(pub usize);

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub kind: OpKind,
    pub params: Params,
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
}

impl Node {
    pub fn input_index(&self, port: &str) -> Option<usize> {
        self.inputs.iter().position(|p| p.name == port)
    }

    pub fn output_index(&self, port: &str) -> Option<usize> {
        self.outputs.iter().position(|p| p.name == port)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub src: NodeRef,
    pub src_port: usize,
    pub dst: NodeRef,
    pub dst_port: usize,
    pub weight: f64,
    pub delay_ns: u64,
}

/// Optional edge attributes for [`EirGraph::connect_with`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeOpts {
    pub weight: f64,
    pub delay_ns: u64,
}

impl Default for EdgeOpts {
    fn default() -> Self {
        Self {
            weight: 1.0,
            delay_ns: 0,
        }
    }
}

impl EdgeOpts {
    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn delay_ns(mut self, delay_ns: u64) -> Self {
        self.delay_ns = delay_ns;
        self
    }

    pub fn delay_us(self, delay_us: u64) -> Self {
        self.delay_ns(delay_us.saturating_mul(NS_PER_US))
    }

    /// Delay from a time literal such as `"500 us"`.
    pub fn delay(self, literal: &str) -> Result<Self, GraphError> {
        Ok(self.delay_ns(parse_time(literal)?))
    }
}

/// Named measurement point on a node output port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub id: String,
    pub node: NodeRef,
    pub port: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    #[default]
    ExactEvent,
    FixedStep,
}

impl ExecMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecMode::ExactEvent => "exact_event",
            ExecMode::FixedStep => "fixed_step",
        }
    }
}

impl core::fmt::Display for ExecMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing and determinism configuration carried by every graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeConfig {
    /// Unit of external timestamps (input streams). Internal time is always ns.
    #[serde(default)]
    pub unit: TimeUnit,
    #[serde(default)]
    pub mode: ExecMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dt_us: Option<u64>,
    #[serde(default = "default_epsilon_time_us")]
    pub epsilon_time_us: u64,
    #[serde(default = "default_epsilon_numeric")]
    pub epsilon_numeric: f64,
    #[serde(default)]
    pub seed: u64,
}

fn default_epsilon_time_us() -> u64 {
    crate::units::Epsilons::DEFAULT_TIME_US
}

fn default_epsilon_numeric() -> f64 {
    crate::units::Epsilons::DEFAULT_NUMERIC
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            unit: TimeUnit::default(),
            mode: ExecMode::default(),
            dt_us: None,
            epsilon_time_us: default_epsilon_time_us(),
            epsilon_numeric: default_epsilon_numeric(),
            seed: 0,
        }
    }
}

impl TimeConfig {
    pub fn fixed_step(dt_us: u64) -> Self {
        Self {
            mode: ExecMode::FixedStep,
            dt_us: Some(dt_us),
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn epsilons(&self) -> crate::units::Epsilons {
        crate::units::Epsilons::new(self.epsilon_time_us, self.epsilon_numeric)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),
    #[error("unknown operator kind '{0}'")]
    UnknownOperator(String),
    #[error("unknown node '{0}'")]
    UnknownNode(String),
    #[error("node '{node}' has no {dir:?} port '{port}'")]
    UnknownPort {
        node: String,
        port: String,
        dir: PortDir,
    },
    #[error("cycle detected among zero-delay edges: {}", .nodes.join(" -> "))]
    CycleDetected { nodes: Vec<String> },
    #[error("duplicate probe id '{0}'")]
    DuplicateProbe(String),
    #[error("invalid time: {0}")]
    InvalidTime(#[from] UnitsError),
    #[error("invalid edge {src} -> {dst}: {reason}")]
    InvalidEdge {
        src: String,
        dst: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct EirGraph {
    nodes: Vec<Node>,
    index: BTreeMap<String, NodeRef>,
    edges: Vec<Edge>,
    probes: Vec<Probe>,
    pub time: TimeConfig,
    /// Free-form annotations (builder name, plasticity hooks, ...).
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl EirGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_time(time: TimeConfig) -> Self {
        Self {
            time,
            ..Self::default()
        }
    }

    /// Add a node by kind name. Parameters are validated when a plan is built.
    pub fn add_node(&mut self, id: &str, kind: &str, params: Params) -> Result<NodeRef, GraphError> {
        let kind: OpKind = kind.parse().map_err(GraphError::UnknownOperator)?;
        self.add_op(id, kind, params)
    }

    pub fn add_op(&mut self, id: &str, kind: OpKind, params: Params) -> Result<NodeRef, GraphError> {
        if self.index.contains_key(id) {
            return Err(GraphError::DuplicateNode(id.to_string()));
        }
        let (inputs, outputs) = kind.ports(&params);
        let r = NodeRef(self.nodes.len());
        self.nodes.push(Node {
            id: id.to_string(),
            kind,
            params,
            inputs,
            outputs,
        });
        self.index.insert(id.to_string(), r);
        Ok(r)
    }

    pub fn connect(&mut self, src: &str, src_port: &str, dst: &str, dst_port: &str) -> Result<EdgeRef, GraphError> {
        self.connect_with(src, src_port, dst, dst_port, EdgeOpts::default())
    }

    pub fn connect_with(
        &mut self,
        src: &str,
        src_port: &str,
        dst: &str,
        dst_port: &str,
        opts: EdgeOpts,
    ) -> Result<EdgeRef, GraphError> {
        let (s, sp) = self.resolve(src, src_port, PortDir::Output)?;
        let (d, dp) = self.resolve(dst, dst_port, PortDir::Input)?;
        if !opts.weight.is_finite() {
            return Err(GraphError::InvalidEdge {
                src: src.to_string(),
                dst: dst.to_string(),
                reason: "weight must be finite".into(),
            });
        }
        let r = EdgeRef(self.edges.len());
        self.edges.push(Edge {
            src: s,
            src_port: sp,
            dst: d,
            dst_port: dp,
            weight: opts.weight,
            delay_ns: opts.delay_ns,
        });
        Ok(r)
    }

    pub fn add_probe(&mut self, id: &str, node: &str, port: &str) -> Result<(), GraphError> {
        if self.probes.iter().any(|p| p.id == id) {
            return Err(GraphError::DuplicateProbe(id.to_string()));
        }
        let (n, p) = self.resolve(node, port, PortDir::Output)?;
        self.probes.push(Probe {
            id: id.to_string(),
            node: n,
            port: p,
        });
        Ok(())
    }

    fn resolve(&self, node: &str, port: &str, dir: PortDir) -> Result<(NodeRef, usize), GraphError> {
        let r = self.node_ref(node).ok_or_else(|| GraphError::UnknownNode(node.to_string()))?;
        let n = &self.nodes[r.0];
        let idx = match dir {
            PortDir::Input => n.input_index(port),
            PortDir::Output => n.output_index(port),
        };
        idx.map(|i| (r, i)).ok_or_else(|| GraphError::UnknownPort {
            node: node.to_string(),
            port: port.to_string(),
            dir,
        })
    }

    pub fn node_ref(&self, id: &str) -> Option<NodeRef> {
        self.index.get(id).copied()
    }

    pub fn node(&self, r: NodeRef) -> &Node {
        &self.nodes[r.0]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, r: EdgeRef) -> &Edge {
        &self.edges[r.0]
    }

    pub fn probes(&self) -> &[Probe] {
        &self.probes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True when `edge` makes its destination depend on its source within one instant.
    pub fn is_same_instant(&self, edge: &Edge) -> bool {
        edge.delay_ns == 0 && !self.nodes[edge.src.0].kind.defers_output()
    }

    fn same_instant_edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(|e| self.is_same_instant(e))
    }

    /// Kahn's algorithm over same-instant edges; ties go to the node inserted
    /// first.
    pub fn topological_order(&self) -> Result<Vec<NodeRef>, GraphError> {
        let n = self.nodes.len();
        let mut indegree = vec![0usize; n];
        let mut succ: Vec<Vec<usize>> = vec![Vec::new(); n];
        for e in self.same_instant_edges() {
            indegree[e.dst.0] += 1;
            succ[e.src.0].push(e.dst.0);
        }

        let mut ready: BinaryHeap<Reverse<usize>> = (0..n).filter(|&i| indegree[i] == 0).map(Reverse).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(i)) = ready.pop() {
            order.push(NodeRef(i));
            for &j in &succ[i] {
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    ready.push(Reverse(j));
                }
            }
        }

        if order.len() < n {
            return Err(GraphError::CycleDetected {
                nodes: self.find_cycle(&indegree),
            });
        }
        Ok(order)
    }

    /// Walk predecessors from the first unordered node until a node repeats.
    /// Every node left with indegree > 0 has a predecessor that is also left.
    fn find_cycle(&self, indegree: &[usize]) -> Vec<String> {
        let stuck = |i: usize| indegree[i] > 0;
        let Some(start) = (0..self.nodes.len()).find(|&i| stuck(i)) else {
            return Vec::new();
        };
        let pred = |i: usize| {
            self.same_instant_edges()
                .filter(|e| e.dst.0 == i && stuck(e.src.0))
                .map(|e| e.src.0)
                .min()
        };

        let mut path = vec![start];
        let mut cur = start;
        while let Some(p) = pred(cur) {
            if let Some(pos) = path.iter().position(|&x| x == p) {
                let mut cycle: Vec<usize> = path[pos..].to_vec();
                cycle.reverse();
                // Start the report at the earliest-inserted member.
                if let Some(first) = cycle.iter().enumerate().min_by_key(|(_, &i)| i).map(|(k, _)| k) {
                    cycle.rotate_left(first);
                }
                return cycle.into_iter().map(|i| self.nodes[i].id.clone()).collect();
            }
            path.push(p);
            cur = p;
        }
        path.into_iter().map(|i| self.nodes[i].id.clone()).collect()
    }

    pub fn topological_ids(&self) -> Result<Vec<String>, GraphError> {
        Ok(self
            .topological_order()?
            .into_iter()
            .map(|r| self.nodes[r.0].id.clone())
            .collect())
    }

    /// Nodes grouped by same-instant depth (longest zero-delay path from a
    /// source). Nodes of one level never feed each other within an instant;
    /// inside a level they keep topological order.
    pub fn instant_levels(&self) -> Result<Vec<Vec<NodeRef>>, GraphError> {
        let order = self.topological_order()?;
        let mut depth = vec![0usize; self.nodes.len()];
        let mut incoming: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for e in self.same_instant_edges() {
            incoming[e.dst.0].push(e.src.0);
        }
        for r in &order {
            depth[r.0] = incoming[r.0].iter().map(|&s| depth[s] + 1).max().unwrap_or(0);
        }

        let mut levels: Vec<Vec<NodeRef>> = Vec::new();
        for r in order {
            let d = depth[r.0];
            if levels.len() <= d {
                levels.resize_with(d + 1, Vec::new);
            }
            levels[d].push(r);
        }
        Ok(levels)
    }

    /// Order in which nodes are stepped inside an instant: the levels,
    /// flattened. A valid topological order.
    pub fn evaluation_order(&self) -> Result<Vec<NodeRef>, GraphError> {
        Ok(self.instant_levels()?.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;

    fn chain() -> EirGraph {
        let mut g = EirGraph::new();
        g.add_node("a", "lif", params! {}).unwrap();
        g.add_node("b", "exp_syn", params! {}).unwrap();
        g.add_node("c", "lif", params! {}).unwrap();
        g.connect("a", "spike", "b", "pre").unwrap();
        g.connect("b", "post", "c", "in").unwrap();
        g
    }

    #[test]
    fn rejects_duplicates_and_unknowns() {
        let mut g = chain();
        assert_eq!(
            g.add_node("a", "lif", params! {}),
            Err(GraphError::DuplicateNode("a".into()))
        );
        assert_eq!(
            g.add_node("z", "conv", params! {}),
            Err(GraphError::UnknownOperator("conv".into()))
        );
        assert_eq!(
            g.connect("a", "spike", "nope", "in"),
            Err(GraphError::UnknownNode("nope".into()))
        );
        assert!(matches!(
            g.connect("a", "out", "b", "pre"),
            Err(GraphError::UnknownPort { .. })
        ));
        // Output ports are not valid destinations.
        assert!(matches!(
            g.connect("a", "spike", "b", "post"),
            Err(GraphError::UnknownPort { .. })
        ));
    }

    #[test]
    fn order_is_insertion_stable() {
        let mut g = EirGraph::new();
        for id in ["x", "y", "z", "w"] {
            g.add_node(id, "delay", params! {}).unwrap();
        }
        g.add_node("sink", "lif", params! {}).unwrap();
        g.connect("w", "out", "sink", "in").unwrap();
        assert_eq!(g.topological_ids().unwrap(), vec!["x", "y", "z", "w", "sink"]);
        assert_eq!(chain().topological_ids().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn zero_delay_cycle_is_rejected() {
        let mut g = EirGraph::new();
        g.add_node("a", "lif", params! {}).unwrap();
        g.add_node("b", "lif", params! {}).unwrap();
        g.connect("a", "spike", "b", "in").unwrap();
        g.connect("b", "spike", "a", "in").unwrap();
        match g.topological_order() {
            Err(GraphError::CycleDetected { nodes }) => assert_eq!(nodes, vec!["a", "b"]),
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn delayed_edge_breaks_the_cycle() {
        let mut g = EirGraph::new();
        g.add_node("a", "lif", params! {}).unwrap();
        g.add_node("b", "lif", params! {}).unwrap();
        g.connect("a", "spike", "b", "in").unwrap();
        g.connect_with("b", "spike", "a", "in", EdgeOpts::default().delay_us(500))
            .unwrap();
        assert_eq!(g.topological_ids().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn delay_line_closes_a_loop() {
        let mut g = EirGraph::new();
        g.add_node("n", "lif", params! {}).unwrap();
        g.add_node("d", "delay", params! { "delay_us" => 100 }).unwrap();
        g.connect("n", "spike", "d", "in").unwrap();
        g.connect("d", "out", "n", "in").unwrap();
        assert_eq!(g.topological_ids().unwrap(), vec!["n", "d"]);
    }

    #[test]
    fn levels_group_independent_nodes() {
        let mut g = EirGraph::new();
        g.add_node("src", "lif", params! {}).unwrap();
        g.add_node("left", "exp_syn", params! {}).unwrap();
        g.add_node("right", "exp_syn", params! {}).unwrap();
        g.add_node("join", "lif", params! {}).unwrap();
        g.connect("src", "spike", "left", "pre").unwrap();
        g.connect("src", "spike", "right", "pre").unwrap();
        g.connect("left", "post", "join", "in").unwrap();
        g.connect("right", "post", "join", "in").unwrap();
        let levels = g.instant_levels().unwrap();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[1], vec![NodeRef(1), NodeRef(2)]);
    }

    #[test]
    fn delay_literals_and_probe_checks() {
        let mut g = chain();
        let e = g
            .connect_with("a", "spike", "c", "in", EdgeOpts::default().delay("500 us").unwrap())
            .unwrap();
        assert_eq!(g.edge(e).delay_ns, 500_000);
        assert!(matches!(
            EdgeOpts::default().delay("5 parsecs"),
            Err(GraphError::InvalidTime(_))
        ));

        g.add_probe("out", "c", "spike").unwrap();
        assert_eq!(
            g.add_probe("out", "a", "spike"),
            Err(GraphError::DuplicateProbe("out".into()))
        );
        assert!(g.add_probe("bad", "c", "in").is_err());
    }
}
