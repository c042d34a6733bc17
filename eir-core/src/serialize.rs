//! Graph documents: a JSON encoding of an [`EirGraph`].
//!
//! Loading replays the document through `add_node` / `connect_with` /
//! `add_probe`, so a loaded graph is validated exactly like a hand-built one
//! and keeps node and edge insertion order. Node runtime state is not part of
//! the document; every run starts from freshly built operators.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::PortRef;
use crate::graph::{EdgeOpts, EirGraph, GraphError, TimeConfig};
use crate::params::Params;
use crate::units::NS_PER_US;

pub const DOCUMENT_VERSION: &str = "0.1";

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("malformed graph document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("unsupported document version '{0}' (expected {})", DOCUMENT_VERSION)]
    UnsupportedVersion(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDoc {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub params: Params,
}

fn unit_weight() -> f64 {
    1.0
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDoc {
    pub src: PortRef,
    pub dst: PortRef,
    #[serde(default = "unit_weight")]
    pub weight: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub delay_ns: u64,
    /// Accepted on input for hand-written documents; never written.
    #[serde(default, skip_serializing)]
    pub delay_us: Option<u64>,
}

impl EdgeDoc {
    fn delay(&self) -> u64 {
        match self.delay_us {
            Some(us) if self.delay_ns == 0 => us.saturating_mul(NS_PER_US),
            _ => self.delay_ns,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeDoc {
    pub id: String,
    pub node: String,
    pub port: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    pub version: String,
    #[serde(default)]
    pub time: TimeConfig,
    pub nodes: Vec<NodeDoc>,
    #[serde(default)]
    pub edges: Vec<EdgeDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub probes: Vec<ProbeDoc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl GraphDocument {
    pub fn from_graph(g: &EirGraph) -> Self {
        let port = |node: usize, name: &str| PortRef::new(g.nodes()[node].id.clone(), name);
        Self {
            version: DOCUMENT_VERSION.to_string(),
            time: g.time.clone(),
            nodes: g
                .nodes()
                .iter()
                .map(|n| NodeDoc {
                    id: n.id.clone(),
                    kind: n.kind.as_str().to_string(),
                    params: n.params.clone(),
                })
                .collect(),
            edges: g
                .edges()
                .iter()
                .map(|e| EdgeDoc {
                    src: port(e.src.0, &g.node(e.src).outputs[e.src_port].name),
                    dst: port(e.dst.0, &g.node(e.dst).inputs[e.dst_port].name),
                    weight: e.weight,
                    delay_ns: e.delay_ns,
                    delay_us: None,
                })
                .collect(),
            probes: g
                .probes()
                .iter()
                .map(|p| ProbeDoc {
                    id: p.id.clone(),
                    node: g.node(p.node).id.clone(),
                    port: g.node(p.node).outputs[p.port].name.clone(),
                })
                .collect(),
            metadata: g.metadata.clone(),
        }
    }

    pub fn into_graph(self) -> Result<EirGraph, SerializeError> {
        if self.version.split('.').next() != DOCUMENT_VERSION.split('.').next() {
            return Err(SerializeError::UnsupportedVersion(self.version));
        }
        let mut g = EirGraph::with_time(self.time);
        g.metadata = self.metadata;
        for n in self.nodes {
            g.add_node(&n.id, &n.kind, n.params)?;
        }
        for e in &self.edges {
            let opts = EdgeOpts::default().weight(e.weight).delay_ns(e.delay());
            g.connect_with(&e.src.node, &e.src.port, &e.dst.node, &e.dst.port, opts)?;
        }
        for p in &self.probes {
            g.add_probe(&p.id, &p.node, &p.port)?;
        }
        Ok(g)
    }
}

/// Pretty-printed JSON document for `g`.
pub fn save(g: &EirGraph) -> Result<String, SerializeError> {
    Ok(serde_json::to_string_pretty(&GraphDocument::from_graph(g))?)
}

pub fn load(json: &str) -> Result<EirGraph, SerializeError> {
    let doc: GraphDocument = serde_json::from_str(json)?;
    doc.into_graph()
}

pub fn save_path(g: &EirGraph, path: impl AsRef<Path>) -> Result<(), SerializeError> {
    let path = path.as_ref();
    fs::write(path, save(g)?).map_err(|source| SerializeError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_path(path: impl AsRef<Path>) -> Result<EirGraph, SerializeError> {
    let path = path.as_ref();
    let json = fs::read_to_string(path).map_err(|source| SerializeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let g = load(&json)?;
    tracing::debug!(path = %path.display(), nodes = g.len(), edges = g.edges().len(), "loaded graph");
    Ok(g)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ExecMode;
    use crate::params;

    fn sample() -> EirGraph {
        let mut g = EirGraph::with_time(TimeConfig::fixed_step(100).with_seed(42));
        g.add_node("pop_a", "lif", params! { "tau_ms" => 10.0, "n" => 4, "v_th" => 0.1 + 0.2 })
            .unwrap();
        g.add_node("pop_b", "lif", params! { "tau_ms" => 12.5, "n" => 4, "v_th" => 1.05 })
            .unwrap();
        g.add_node("loop", "delay", params! { "delay_us" => "1 ms" }).unwrap();
        g.connect_with("pop_a", "spike", "pop_b", "in", EdgeOpts::default().weight(0.25).delay_us(500))
            .unwrap();
        g.connect("pop_b", "spike", "loop", "in").unwrap();
        g.connect_with("loop", "out", "pop_a", "in", EdgeOpts::default().weight(1.0 / 3.0))
            .unwrap();
        g.add_probe("rate_b", "pop_b", "spike").unwrap();
        g.metadata.insert("builder".into(), serde_json::json!("test"));
        g
    }

    #[test]
    fn round_trip_preserves_order_and_values() {
        let g = sample();
        let back = load(&save(&g).unwrap()).unwrap();
        assert_eq!(back.topological_ids().unwrap(), g.topological_ids().unwrap());
        assert_eq!(back.nodes(), g.nodes());
        assert_eq!(back.edges(), g.edges());
        assert_eq!(back.probes(), g.probes());
        assert_eq!(back.time, g.time);
        assert_eq!(back.metadata, g.metadata);
        assert_eq!(back.edges()[2].weight.to_bits(), (1.0f64 / 3.0).to_bits());
    }

    #[test]
    fn hand_written_document_defaults() {
        let json = r#"{
            "version": "0.1",
            "time": { "mode": "fixed_step", "dt_us": 250 },
            "nodes": [
                { "id": "d", "kind": "DelayLine", "params": { "delay_us": 200 } },
                { "id": "n", "kind": "lif" }
            ],
            "edges": [ { "src": {"node": "d", "port": "out"}, "dst": {"node": "n", "port": "in"}, "delay_us": 3 } ]
        }"#;
        let g = load(json).unwrap();
        assert_eq!(g.time.mode, ExecMode::FixedStep);
        assert_eq!(g.time.epsilon_time_us, 100);
        assert_eq!(g.edges()[0].weight, 1.0);
        assert_eq!(g.edges()[0].delay_ns, 3_000);
    }

    #[test]
    fn rejects_bad_documents() {
        assert!(matches!(load("{"), Err(SerializeError::Json(_))));
        let wrong_version = r#"{"version": "7.0", "nodes": []}"#;
        assert!(matches!(load(wrong_version), Err(SerializeError::UnsupportedVersion(_))));
        let dangling = r#"{"version": "0.1", "nodes": [],
            "edges": [{"src": {"node": "x", "port": "out"}, "dst": {"node": "y", "port": "in"}}]}"#;
        assert!(matches!(
            load(dangling),
            Err(SerializeError::Graph(GraphError::UnknownNode(_)))
        ));
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        save_path(&sample(), &path).unwrap();
        let back = load_path(&path).unwrap();
        assert_eq!(back.len(), 3);
        assert!(matches!(
            load_path(dir.path().join("missing.json")),
            Err(SerializeError::Io { .. })
        ));
    }
}
