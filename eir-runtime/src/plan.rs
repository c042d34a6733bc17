//! Execution plans.
//!
//! An [`ExecPlan`] is the read-only product of validating a graph: node
//! evaluation order, one freshly built operator per node (the initial state
//! snapshot every run clones), the routing table and the resolved probes.

use std::collections::BTreeMap;

use eir_core::seed::node_seed;
use eir_core::{BuildCtx, EirGraph, Epsilons, ExecMode, OpKind, Operator, ParamError, PortRef, TimeUnit};
use tracing::debug;

use crate::error::PlanError;

/// One outgoing edge, resolved to node/port indices.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub dst: usize,
    pub dst_port: usize,
    pub weight: f64,
    pub delay_ns: u64,
    /// Delivered within the instant that produced it.
    pub same_instant: bool,
}

#[derive(Debug, Clone)]
pub struct PlanNode {
    pub id: String,
    pub kind: OpKind,
    pub seed: u64,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    initial: Operator,
    /// Per output port.
    routes: Vec<Vec<Route>>,
    /// Per output port: indices into `ExecPlan::probes`.
    probes: Vec<Vec<usize>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSpec {
    pub id: String,
    pub node: usize,
    pub port: usize,
}

#[derive(Debug, Clone)]
pub struct ExecPlan {
    nodes: Vec<PlanNode>,
    index: BTreeMap<String, usize>,
    levels: Vec<Vec<usize>>,
    eval_order: Vec<usize>,
    probes: Vec<ProbeSpec>,
    mode: ExecMode,
    dt_ns: Option<u64>,
    unit: TimeUnit,
    epsilons: Epsilons,
    seed: u64,
}

impl ExecPlan {
    pub fn build(g: &EirGraph) -> Result<Self, PlanError> {
        let time = &g.time;
        let dt_ns = match (time.mode, time.dt_us) {
            (ExecMode::FixedStep, None) => return Err(PlanError::MissingStep),
            (ExecMode::FixedStep, Some(0)) => return Err(PlanError::InvalidStep),
            (ExecMode::FixedStep, Some(dt)) => Some(TimeUnit::Us.to_ns(dt)),
            (ExecMode::ExactEvent, _) => None,
        };

        let levels: Vec<Vec<usize>> = g
            .instant_levels()?
            .into_iter()
            .map(|level| level.into_iter().map(|r| r.0).collect())
            .collect();
        let eval_order = levels.iter().flatten().copied().collect();

        let mut nodes = Vec::with_capacity(g.len());
        let mut index = BTreeMap::new();
        for (i, n) in g.nodes().iter().enumerate() {
            let seed = node_seed(time.seed, &n.id);
            let initial = Operator::build(n.kind, &n.params, BuildCtx { node_seed: seed }).map_err(|source| {
                PlanError::InvalidParameter {
                    node: n.id.clone(),
                    source,
                }
            })?;
            nodes.push(PlanNode {
                id: n.id.clone(),
                kind: n.kind,
                seed,
                inputs: n.inputs.iter().map(|p| p.name.clone()).collect(),
                outputs: n.outputs.iter().map(|p| p.name.clone()).collect(),
                initial,
                routes: vec![Vec::new(); n.outputs.len()],
                probes: vec![Vec::new(); n.outputs.len()],
            });
            index.insert(n.id.clone(), i);
        }

        for e in g.edges() {
            check_frame_size(&nodes[e.src.0], &nodes[e.dst.0])?;
            let same_instant = g.is_same_instant(e);
            nodes[e.src.0].routes[e.src_port].push(Route {
                dst: e.dst.0,
                dst_port: e.dst_port,
                weight: e.weight,
                delay_ns: e.delay_ns,
                same_instant,
            });
        }

        let probes: Vec<ProbeSpec> = if g.probes().is_empty() {
            // Unprobed graphs record every output port under the node id.
            nodes
                .iter()
                .enumerate()
                .flat_map(|(i, n)| {
                    let single = n.outputs.len() == 1;
                    n.outputs.iter().enumerate().map(move |(p, name)| ProbeSpec {
                        id: if single {
                            n.id.clone()
                        } else {
                            format!("{}.{}", n.id, name)
                        },
                        node: i,
                        port: p,
                    })
                })
                .collect()
        } else {
            g.probes()
                .iter()
                .map(|p| ProbeSpec {
                    id: p.id.clone(),
                    node: p.node.0,
                    port: p.port,
                })
                .collect()
        };
        for (k, p) in probes.iter().enumerate() {
            nodes[p.node].probes[p.port].push(k);
        }

        debug!(
            nodes = nodes.len(),
            edges = g.edges().len(),
            levels = levels.len(),
            probes = probes.len(),
            mode = %time.mode,
            "built execution plan"
        );

        Ok(Self {
            nodes,
            index,
            levels,
            eval_order,
            probes,
            mode: time.mode,
            dt_ns,
            unit: time.unit,
            epsilons: time.epsilons(),
            seed: time.seed,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, i: usize) -> &PlanNode {
        &self.nodes[i]
    }

    pub fn nodes(&self) -> &[PlanNode] {
        &self.nodes
    }

    pub fn node_index(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    pub fn dt_ns(&self) -> Option<u64> {
        self.dt_ns
    }

    pub fn unit(&self) -> TimeUnit {
        self.unit
    }

    pub fn epsilons(&self) -> Epsilons {
        self.epsilons
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Same-instant depth groups, each in topological order.
    pub fn levels(&self) -> &[Vec<usize>] {
        &self.levels
    }

    pub fn eval_order(&self) -> &[usize] {
        &self.eval_order
    }

    pub fn probes(&self) -> &[ProbeSpec] {
        &self.probes
    }

    pub fn routes(&self, node: usize, port: usize) -> &[Route] {
        &self.nodes[node].routes[port]
    }

    pub fn port_probes(&self, node: usize, port: usize) -> &[usize] {
        &self.nodes[node].probes[port]
    }

    /// Fresh operator state for every node.
    pub fn instantiate(&self) -> Vec<Operator> {
        self.nodes.iter().map(|n| n.initial.clone()).collect()
    }

    /// Resolve an input port reference to (node, port) indices.
    pub fn resolve_input(&self, target: &PortRef) -> Option<(usize, usize)> {
        let node = self.node_index(&target.node)?;
        let port = self.nodes[node].inputs.iter().position(|p| *p == target.port)?;
        Some((node, port))
    }
}

/// A mel node must be sized for the spectra its STFT source emits.
fn check_frame_size(src: &PlanNode, dst: &PlanNode) -> Result<(), PlanError> {
    if let (Operator::Stft(stft), Operator::Mel(mel)) = (&src.initial, &dst.initial) {
        if stft.n_fft != mel.n_fft {
            return Err(PlanError::InvalidParameter {
                node: dst.id.clone(),
                source: ParamError::invalid(
                    "n_fft",
                    format!("{} does not match n_fft {} of source '{}'", mel.n_fft, stft.n_fft, src.id),
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use eir_core::{params, EdgeOpts, TimeConfig};

    #[test]
    fn fixed_step_requires_dt() {
        let mut g = EirGraph::new();
        g.time.mode = ExecMode::FixedStep;
        g.add_node("n", "lif", params! {}).unwrap();
        assert_eq!(ExecPlan::build(&g).unwrap_err(), PlanError::MissingStep);
        g.time.dt_us = Some(0);
        assert_eq!(ExecPlan::build(&g).unwrap_err(), PlanError::InvalidStep);
        g.time.dt_us = Some(100);
        assert_eq!(ExecPlan::build(&g).unwrap().dt_ns(), Some(100_000));
    }

    #[test]
    fn bad_parameters_fail_before_running() {
        let mut g = EirGraph::new();
        g.add_node("ok", "lif", params! {}).unwrap();
        g.add_node("bad", "lif", params! { "tau_ms" => 0.0 }).unwrap();
        match ExecPlan::build(&g) {
            Err(PlanError::InvalidParameter { node, source }) => {
                assert_eq!(node, "bad");
                assert_eq!(source.param(), "tau_ms");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn mel_must_match_its_stft_frame_size() {
        let mut g = EirGraph::new();
        g.add_node("stft", "stft", params! { "n_fft" => 512 }).unwrap();
        g.add_node("mel", "mel", params! { "n_fft" => 256 }).unwrap();
        g.connect("stft", "spec", "mel", "in").unwrap();
        match ExecPlan::build(&g) {
            Err(PlanError::InvalidParameter { node, source }) => {
                assert_eq!(node, "mel");
                assert_eq!(source.param(), "n_fft");
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut g = EirGraph::new();
        g.add_node("stft", "stft", params! { "n_fft" => 256 }).unwrap();
        g.add_node("mel", "mel", params! { "n_fft" => 256 }).unwrap();
        g.connect("stft", "spec", "mel", "in").unwrap();
        assert!(ExecPlan::build(&g).is_ok());
    }

    #[test]
    fn cycles_surface_as_graph_errors() {
        let mut g = EirGraph::new();
        g.add_node("a", "exp_syn", params! {}).unwrap();
        g.add_node("b", "exp_syn", params! {}).unwrap();
        g.connect("a", "post", "b", "pre").unwrap();
        g.connect("b", "post", "a", "pre").unwrap();
        assert!(matches!(ExecPlan::build(&g), Err(PlanError::Graph(_))));
    }

    #[test]
    fn routes_and_default_probes() {
        let mut g = EirGraph::with_time(TimeConfig::default().with_seed(9));
        g.add_node("src", "lif", params! { "n" => 2 }).unwrap();
        g.add_node("d", "delay", params! {}).unwrap();
        g.add_node("dst", "lif", params! {}).unwrap();
        g.connect("src", "spike", "d", "in").unwrap();
        g.connect_with("d", "out", "dst", "in", EdgeOpts::default().weight(0.5))
            .unwrap();
        let plan = ExecPlan::build(&g).unwrap();

        assert_eq!(plan.routes(0, 0).len(), 1);
        assert!(plan.routes(0, 0)[0].same_instant);
        // Delay lines never feed the current instant.
        assert!(!plan.routes(1, 0)[0].same_instant);
        let ids: Vec<_> = plan.probes().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["src", "d", "dst"]);
        assert_eq!(plan.resolve_input(&PortRef::new("dst", "in")), Some((2, 0)));
        assert_eq!(plan.resolve_input(&PortRef::new("dst", "spike")), None);
        assert_ne!(plan.node(0).seed, plan.node(2).seed);
    }
}
