//! Per-node status and timing reports.

use super::node::NodeStats;
use crate::status::ExecutionStatus;
use std::collections::BTreeMap;
use std::fmt;

/// Snapshot of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeReport {
    /// Node name.
    pub name: String,
    /// Stage type label.
    pub type_name: String,
    /// Whether the scheduler steps the node.
    pub executable: bool,
    /// Whether the node feeds the pipeline result.
    pub output: bool,
    /// Status from the last tick.
    pub status: Option<ExecutionStatus>,
    /// Cumulative step statistics.
    pub stats: NodeStats,
    /// Report of the nested pipeline, for composite stages.
    pub nested: Option<PipelineReport>,
}

/// Snapshot of a whole pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    /// Pipeline name.
    pub name: String,
    /// Ticks executed (synchronous scheduler) so far.
    pub ticks: u64,
    /// Nodes in insertion order.
    pub nodes: Vec<NodeReport>,
}

impl PipelineReport {
    /// Find a node by name.
    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Steps per second for every node, nested nodes keyed as
    /// `composite:inner`.
    pub fn collect_node_timing(&self) -> BTreeMap<String, f64> {
        let mut timing = BTreeMap::new();
        self.collect_into("", &mut timing);
        timing
    }

    fn collect_into(&self, prefix: &str, timing: &mut BTreeMap<String, f64>) {
        for node in &self.nodes {
            let key = format!("{prefix}{}", node.name);
            timing.insert(key.clone(), node.stats.steps_per_second());
            if let Some(nested) = &node.nested {
                nested.collect_into(&format!("{key}:"), timing);
            }
        }
    }

    /// Emit the report through `tracing` at info level.
    pub fn log(&self) {
        tracing::info!(pipeline = %self.name, ticks = self.ticks, "detailed report\n{self}");
    }

    fn write_nodes(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        for node in &self.nodes {
            let status = node
                .status
                .map_or_else(|| "-".to_string(), |s| s.to_string());
            let mut flags = String::new();
            if node.output {
                flags.push_str(" [output]");
            }
            if !node.executable {
                flags.push_str(" [not executed]");
            }
            writeln!(
                f,
                "{indent}{:<24} {:<16} {:<8} steps={:<8} time={:>10.3}ms rate={:.1}/s{flags}",
                node.name,
                node.type_name,
                status,
                node.stats.steps,
                node.stats.elapsed.as_secs_f64() * 1000.0,
                node.stats.steps_per_second(),
            )?;
            if let Some(nested) = &node.nested {
                nested.write_nodes(f, depth + 1)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pipeline '{}' after {} ticks", self.name, self.ticks)?;
        self.write_nodes(f, 1)
    }
}
