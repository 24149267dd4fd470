use std::collections::VecDeque;
use std::sync::Arc;

use crate::packet::Packet;
use crate::template::Template;

use super::nodes::{mark_failed, Event, FlowEndReason, Node, NodeState, Origin};
use super::types::{FeatureValue, Number};

/// One flow's feature graph: the node array plus the wiring computed at
/// compile time. Instances are cloned from the compiled prototype and
/// reset through [`FeatureGraph::start`].
#[derive(Debug, Clone)]
pub struct FeatureGraph {
    pub(super) nodes: Vec<Node>,
    /// Nodes that receive the raw packet event from the flow, in
    /// topological order (match subgraphs fire before the selections
    /// they feed).
    pub(super) flow_sources: Vec<usize>,
    /// Terminal nodes in template order.
    pub(super) exports: Vec<usize>,
    pub(super) template: Arc<Template>,
}

impl FeatureGraph {
    pub fn template(&self) -> &Arc<Template> {
        &self.template
    }

    /// Resets all node state; called once per flow before any event.
    pub fn start(&mut self, when: i64) {
        for node in &mut self.nodes {
            node.start(when);
        }
    }

    /// Feeds one packet through the graph. Events propagate breadth-first
    /// along dependent edges; each flow-source node sees the packet in
    /// turn, which guarantees selection gates are set by their match
    /// subgraph before the gate itself fires.
    pub fn event(&mut self, packet: &Packet, when: i64) {
        let mut queue: VecDeque<(usize, Event, Origin)> = VecDeque::new();
        for &source in &self.flow_sources {
            queue.push_back((source, Event::Packet(packet), Origin::Flow));
            while let Some((idx, ev, origin)) = queue.pop_front() {
                if let Some(out) = self.nodes[idx].event(&ev, origin, when) {
                    for pos in 0..self.nodes[idx].dependents.len() {
                        let dep = self.nodes[idx].dependents[pos];
                        queue.push_back((dep, out.clone(), Origin::Node(idx)));
                    }
                }
            }
        }
    }

    /// Finalizes every node in topological order and freezes the export
    /// values. Stop-time arithmetic reads its argument values here, after
    /// those arguments have produced their own output.
    pub fn stop(&mut self, reason: FlowEndReason, when: i64) {
        for idx in 0..self.nodes.len() {
            let value = match &self.nodes[idx].state {
                NodeState::Count { n } => Some(FeatureValue::Unsigned(*n)),
                NodeState::Mean { total, count } => total
                    .filter(|_| *count > 0)
                    .map(|t| FeatureValue::Float(t.to_f64() / *count as f64)),
                NodeState::Sum { total } => total.map(Into::into),
                NodeState::Accumulate { items } => {
                    if items.is_empty() {
                        None
                    } else {
                        Some(FeatureValue::List(items.clone()))
                    }
                }
                NodeState::Concatenate { buffer } => Some(FeatureValue::Bytes(buffer.clone())),
                NodeState::FlowStart { t } => t.map(FeatureValue::DateTimeNanos),
                NodeState::FlowEnd => Some(FeatureValue::DateTimeNanos(when)),
                NodeState::FlowEndReasonField => {
                    Some(FeatureValue::Unsigned(reason as u64))
                }
                NodeState::DivideFlow => self.flow_binary(idx, Number::div),
                NodeState::MultiplyFlow => self.flow_binary(idx, |a, b| Some(a.mul(b))),
                NodeState::LogFlow => self
                    .arg_number(idx, 0)
                    .map(|n| FeatureValue::Float(n.to_f64().ln())),
                // retained values (packet fields, extrema, matches) stand
                _ => continue,
            };
            let node = &mut self.nodes[idx];
            if value.is_none()
                && matches!(
                    node.state,
                    NodeState::DivideFlow | NodeState::MultiplyFlow | NodeState::LogFlow
                )
            {
                mark_failed(
                    &mut node.failed,
                    &mut node.value,
                    "stop-time arithmetic failed",
                );
            }
            node.value = value;
        }
        for idx in 0..self.nodes.len() {
            if self.nodes[idx].failed {
                self.nodes[idx].value = None;
            }
        }
    }

    /// Export values in template order; `None` marks a null entry.
    pub fn values(&self) -> Vec<Option<FeatureValue>> {
        self.exports
            .iter()
            .map(|&idx| self.nodes[idx].value.clone())
            .collect()
    }

    fn arg_number(&self, idx: usize, pos: usize) -> Option<Number> {
        let arg = *self.nodes[idx].args.get(pos)?;
        self.nodes[arg].value.as_ref().and_then(FeatureValue::as_number)
    }

    fn flow_binary(
        &self,
        idx: usize,
        op: impl FnOnce(Number, Number) -> Option<Number>,
    ) -> Option<FeatureValue> {
        let a = self.arg_number(idx, 0)?;
        let b = self.arg_number(idx, 1)?;
        op(a, b).map(Into::into)
    }
}
