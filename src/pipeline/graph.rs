//! Pipeline graph structure using daggy.

use super::node::{Node, OutputFlag};
use super::report::{NodeReport, PipelineReport};
use crate::config::ConfigBlock;
use crate::error::{Error, Result};
use crate::stage::{PortDirection, Stage};
use crate::status::ExecutionStatus;
use daggy::{Dag, EdgeIndex, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;

/// Unique identifier for a node in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) NodeIndex);

impl NodeId {
    /// Get the underlying index.
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

/// A directed connection between two nodes.
///
/// Data connections name an output port and an input port; execution
/// dependencies carry only the upstream status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub(crate) from_port: Option<String>,
    pub(crate) to_port: Option<String>,
    pub(crate) optional: bool,
}

impl Connection {
    /// Upstream output port, `None` for an execution dependency.
    pub fn from_port(&self) -> Option<&str> {
        self.from_port.as_deref()
    }

    /// Downstream input port, `None` for an execution dependency.
    pub fn to_port(&self) -> Option<&str> {
        self.to_port.as_deref()
    }

    /// Whether an upstream `FAILURE` is ignored by the consumer.
    pub fn is_optional(&self) -> bool {
        self.optional
    }

    /// Whether the connection carries values.
    pub fn carries_data(&self) -> bool {
        self.from_port.is_some() && self.to_port.is_some()
    }
}

/// The node/edge graph shared by both schedulers.
///
/// Nodes and edges are owned by the underlying [`Dag`] and referred to by
/// index; the DAG rejects any edge that would close a cycle.
pub struct PipelineGraph {
    name: String,
    dag: Dag<Node, Connection>,
    names: HashMap<String, NodeId>,
    insert_order: Vec<NodeId>,
}

impl PipelineGraph {
    /// Create an empty graph.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dag: Dag::new(),
            names: HashMap::new(),
            insert_order: Vec::new(),
        }
    }

    /// Name of the owning pipeline.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a node. Non-executable nodes take part in configuration only.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        stage: Box<dyn Stage>,
        executable: bool,
    ) -> Result<NodeId> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(Error::DuplicateNode(name));
        }
        let node = Node::new(&self.name, name.clone(), stage, executable);
        let id = NodeId(self.dag.add_node(node));
        self.names.insert(name, id);
        self.insert_order.push(id);
        tracing::debug!(pipeline = %self.name, node = %self.dag[id.0].name(), executable, "node added");
        Ok(id)
    }

    /// Get a node by id.
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.dag
            .node_weight(id.0)
            .ok_or_else(|| Error::NodeNotFound(format!("#{}", id.index())))
    }

    /// Get a mutable node by id.
    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.dag
            .node_weight_mut(id.0)
            .ok_or_else(|| Error::NodeNotFound(format!("#{}", id.index())))
    }

    /// Look up a node id by name.
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.insert_order.iter().map(|&id| (id, &self.dag[id.0]))
    }

    /// Node ids in insertion order.
    pub fn node_ids(&self) -> &[NodeId] {
        &self.insert_order
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.dag.node_count()
    }

    /// Number of edges.
    pub fn edge_count(&self) -> usize {
        self.dag.edge_count()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.dag.node_count() == 0
    }

    /// Connect `from.from_port` to `to.to_port`.
    ///
    /// Fails if either port is unknown, the types differ, the input is
    /// already wired, a node is not executable, or the edge would close a
    /// cycle. The connection is optional when `optional` is set or the input
    /// port is declared optional.
    pub fn connect(
        &mut self,
        from: NodeId,
        from_port: &str,
        to: NodeId,
        to_port: &str,
        optional: bool,
    ) -> Result<EdgeIndex> {
        let src = self.executable_node(from)?;
        let dst = self.executable_node(to)?;

        let out_spec = src.output_port(from_port).ok_or_else(|| Error::UnknownPort {
            node: src.name().to_string(),
            port: from_port.to_string(),
            direction: PortDirection::Output,
        })?;
        let in_spec = dst.input_port(to_port).ok_or_else(|| Error::UnknownPort {
            node: dst.name().to_string(),
            port: to_port.to_string(),
            direction: PortDirection::Input,
        })?;

        if !out_spec.accepts(in_spec) {
            return Err(Error::TypeMismatch {
                from: src.name().to_string(),
                from_port: from_port.to_string(),
                from_type: out_spec.type_name(),
                to: dst.name().to_string(),
                to_port: to_port.to_string(),
                to_type: in_spec.type_name(),
            });
        }

        if self.input_wired(dst, to_port) {
            return Err(Error::AlreadyConnected {
                node: dst.name().to_string(),
                port: to_port.to_string(),
            });
        }

        let connection = Connection {
            from_port: Some(from_port.to_string()),
            to_port: Some(to_port.to_string()),
            optional: optional || !in_spec.is_required(),
        };
        self.add_edge(from, to, connection)
    }

    /// Order `to` after `from` without transferring data.
    ///
    /// `to` observes `from`'s status each tick; an optional dependency
    /// ignores `FAILURE`.
    pub fn add_dependency(&mut self, from: NodeId, to: NodeId, optional: bool) -> Result<EdgeIndex> {
        self.executable_node(from)?;
        self.executable_node(to)?;
        let connection = Connection {
            from_port: None,
            to_port: None,
            optional,
        };
        self.add_edge(from, to, connection)
    }

    fn input_wired(&self, node: &Node, port: &str) -> bool {
        node.incoming
            .iter()
            .any(|&e| self.dag[e].to_port.as_deref() == Some(port))
    }

    /// Whether an edge inside the graph feeds `id.port`.
    pub fn is_input_connected(&self, id: NodeId, port: &str) -> bool {
        self.node(id).is_ok_and(|node| self.input_wired(node, port))
    }

    fn executable_node(&self, id: NodeId) -> Result<&Node> {
        let node = self.node(id)?;
        if !node.is_executable() {
            return Err(Error::NotExecutable(node.name().to_string()));
        }
        Ok(node)
    }

    fn add_edge(&mut self, from: NodeId, to: NodeId, connection: Connection) -> Result<EdgeIndex> {
        let edge = self
            .dag
            .add_edge(from.0, to.0, connection)
            .map_err(|_| Error::WouldCycle {
                from: self.dag[from.0].name().to_string(),
                to: self.dag[to.0].name().to_string(),
            })?;
        self.dag[from.0].outgoing.push(edge);
        self.dag[to.0].incoming.push(edge);
        tracing::debug!(
            pipeline = %self.name,
            from = %self.dag[from.0].name(),
            to = %self.dag[to.0].name(),
            "nodes connected"
        );
        Ok(edge)
    }

    /// Get a connection.
    pub fn connection(&self, edge: EdgeIndex) -> Option<&Connection> {
        self.dag.edge_weight(edge)
    }

    /// Source and destination of an edge.
    pub fn endpoints(&self, edge: EdgeIndex) -> Option<(NodeId, NodeId)> {
        self.dag
            .edge_endpoints(edge)
            .map(|(a, b)| (NodeId(a), NodeId(b)))
    }

    /// All edge indices.
    pub fn edge_indices(&self) -> impl Iterator<Item = EdgeIndex> + '_ {
        self.dag.graph().edge_indices()
    }

    /// Override whether a node counts as an output node.
    pub fn set_output(&mut self, id: NodeId, output: bool) -> Result<()> {
        self.executable_node(id)?;
        self.dag[id.0].output_flag = if output { OutputFlag::Yes } else { OutputFlag::No };
        Ok(())
    }

    /// Whether a node counts as an output node.
    pub fn is_output(&self, id: NodeId) -> bool {
        self.dag.node_weight(id.0).is_some_and(Node::is_output)
    }

    /// Executable output nodes in insertion order.
    pub fn output_nodes(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, n)| n.is_output())
            .map(|(id, _)| id)
            .collect()
    }

    /// Check that every required input is wired and that there is at least
    /// one output node.
    pub fn validate(&self) -> Result<()> {
        self.validate_with(|_, _| false)
    }

    /// Like [`validate`](Self::validate), counting inputs for which
    /// `fed_externally` returns `true` as connected.
    pub fn validate_with(&self, fed_externally: impl Fn(NodeId, &str) -> bool) -> Result<()> {
        let mut executable = 0usize;
        for (id, node) in self.nodes().filter(|(_, n)| n.is_executable()) {
            executable += 1;
            for port in node.input_ports().iter().filter(|p| p.is_required()) {
                if !self.input_wired(node, port.name()) && !fed_externally(id, port.name()) {
                    return Err(Error::MissingInput {
                        node: node.name().to_string(),
                        port: port.name().to_string(),
                    });
                }
            }
        }
        if executable == 0 {
            return Err(Error::InvalidPipeline(format!(
                "pipeline '{}' has no executable nodes",
                self.name
            )));
        }
        if self.output_nodes().is_empty() {
            return Err(Error::InvalidPipeline(format!(
                "pipeline '{}' has no output nodes",
                self.name
            )));
        }
        Ok(())
    }

    /// Executable nodes ordered so every node follows all of its parents.
    ///
    /// Depth-first over insertion order, visiting parents before children,
    /// so independent branches keep the order they were added in. The walk
    /// keeps its own stack, so chain depth is not limited by the thread's.
    pub fn execution_order(&self) -> Vec<NodeId> {
        let mut visited = HashSet::with_capacity(self.node_count());
        let mut order = Vec::with_capacity(self.node_count());
        let mut stack: Vec<(NodeId, bool)> = Vec::new();
        for &root in &self.insert_order {
            stack.push((root, false));
            while let Some((id, parents_done)) = stack.pop() {
                if parents_done {
                    order.push(id);
                    continue;
                }
                if !visited.insert(id) {
                    continue;
                }
                stack.push((id, true));
                // Reversed so the first incoming edge is walked first.
                for &edge in self.dag[id.0].incoming.iter().rev() {
                    if let Some((parent, _)) = self.endpoints(edge) {
                        if !visited.contains(&parent) {
                            stack.push((parent, false));
                        }
                    }
                }
            }
        }
        order.retain(|id| self.dag[id.0].is_executable());
        order
    }

    /// `id` and every node reachable from it, breadth first.
    pub fn downstream_nodes(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id]);
        let mut result = Vec::new();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            result.push(current);
            for &edge in &self.dag[current.0].outgoing {
                if let Some((_, child)) = self.endpoints(edge) {
                    queue.push_back(child);
                }
            }
        }
        result
    }

    /// Statuses and optional flags of a node's incoming edges, in
    /// construction order, as seen by the synchronous scheduler.
    pub(crate) fn incoming_statuses(&self, id: NodeId) -> Vec<(ExecutionStatus, bool)> {
        self.dag[id.0]
            .incoming
            .iter()
            .filter_map(|&edge| {
                let (parent, _) = self.endpoints(edge)?;
                let status = self.dag[parent.0].status.unwrap_or(ExecutionStatus::Failure);
                Some((status, self.dag[edge].optional))
            })
            .collect()
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Every node's parameters, each under a sub-block named after the node.
    pub fn params(&self) -> ConfigBlock {
        let mut block = ConfigBlock::new();
        for (_, node) in self.nodes() {
            if let Some(stage) = node.stage() {
                block.add_subblock(&stage.params(), node.name());
            }
        }
        block
    }

    /// Hand each listed node its sub-block of `block`.
    ///
    /// Every node is attempted; the first error is returned afterwards.
    pub fn configure_nodes(&mut self, block: &ConfigBlock, ids: &[NodeId]) -> Result<()> {
        let mut first_error = None;
        for &id in ids {
            let node = self.node_mut(id)?;
            let sub = block.subblock(node.name());
            let name = node.name().to_string();
            let Some(stage) = node.stage_mut() else {
                first_error.get_or_insert(Error::StageUnavailable(name));
                continue;
            };
            if let Err(e) = stage.configure(&sub) {
                tracing::error!(pipeline = %self.name, node = %name, error = %e, "configure failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // ========================================================================
    // Reports
    // ========================================================================

    /// Per-node status and timing, recursing into composite stages.
    pub fn report(&self, ticks: u64) -> PipelineReport {
        let nodes = self
            .nodes()
            .map(|(id, node)| NodeReport {
                name: node.name().to_string(),
                type_name: node.type_name().to_string(),
                executable: node.is_executable(),
                output: self.is_output(id),
                status: node.status(),
                stats: node.stats(),
                nested: node.stage().and_then(|s| s.nested_report()),
            })
            .collect();
        PipelineReport {
            name: self.name.clone(),
            ticks,
            nodes,
        }
    }

    /// Render the graph in Graphviz dot syntax.
    ///
    /// Dashed edges are optional, dotted edges are execution dependencies,
    /// and output nodes are drawn with a double border.
    pub fn to_dot(&self) -> String {
        let order: HashMap<NodeId, usize> = self
            .execution_order()
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();

        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", escape(&self.name));
        let _ = writeln!(out, "    node [shape=box];");
        for (id, node) in self.nodes() {
            let position = order
                .get(&id)
                .map_or_else(|| "not executed".to_string(), |i| format!("#{i}"));
            let peripheries = if self.is_output(id) { 2 } else { 1 };
            let _ = writeln!(
                out,
                "    \"{}\" [label=\"{}\\n({})\\n{}\" peripheries={}];",
                escape(node.name()),
                escape(node.name()),
                escape(node.type_name()),
                position,
                peripheries
            );
        }
        for edge in self.edge_indices() {
            let (Some((from, to)), Some(conn)) = (self.endpoints(edge), self.connection(edge)) else {
                continue;
            };
            let style = match (conn.carries_data(), conn.is_optional()) {
                (false, _) => "dotted",
                (true, true) => "dashed",
                (true, false) => "solid",
            };
            let label = match (conn.from_port(), conn.to_port()) {
                (Some(a), Some(b)) => format!("{a} -> {b}"),
                _ => String::new(),
            };
            let _ = writeln!(
                out,
                "    \"{}\" -> \"{}\" [label=\"{}\" style={}];",
                escape(self.dag[from.0].name()),
                escape(self.dag[to.0].name()),
                escape(&label),
                style
            );
        }
        out.push_str("}\n");
        out
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

impl std::fmt::Debug for PipelineGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineGraph")
            .field("name", &self.name)
            .field("nodes", &self.node_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}
