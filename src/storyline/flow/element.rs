// SPDX-License-Identifier: MIT

//! Process graph model
//!
//! Nodes live in an arena addressed by [`NodeIdx`]; flows live in a slab
//! addressed by [`FlowIdx`]. Adjacency is only changed through
//! [`ProcessGraph`] methods, which keep both ends of a flow in sync.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::sdk::error::ConfigError;
use crate::sdk::instruct::InstructContent;
use crate::storyline::condition::ConditionExpression;
use crate::storyline::engine::AcquireFailStrategy;

pub type NodeIdx = usize;
pub type FlowIdx = usize;

/// A node of the process graph
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub name: Option<String>,
    pub kind: NodeKind,
    incoming: Vec<FlowIdx>,
    outgoing: Vec<FlowIdx>,
    /// Task bound to a gateway, split out by the rearrange pass
    pub attached: Option<ServiceTask>,
    /// Arrivals a join waits for, set by the aggregation pass
    pub required_incoming: usize,
}

impl Node {
    pub fn incoming(&self) -> &[FlowIdx] {
        &self.incoming
    }

    pub fn outgoing(&self) -> &[FlowIdx] {
        &self.outgoing
    }

    /// Joins wait for every incoming arrival before continuing
    pub fn is_aggregating(&self) -> bool {
        self.kind.is_aggregating()
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Start,
    End,
    ServiceTask(ServiceTask),
    Exclusive,
    Inclusive {
        /// Dispatch fired branches as a concurrent wave of fragments
        async_branches: bool,
    },
    SubProcess(SubProcess),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Start => "StartEvent",
            NodeKind::End => "EndEvent",
            NodeKind::ServiceTask(_) => "ServiceTask",
            NodeKind::Exclusive => "ExclusiveGateway",
            NodeKind::Inclusive { .. } => "InclusiveGateway",
            NodeKind::SubProcess(_) => "SubProcess",
        }
    }

    pub fn is_aggregating(&self) -> bool {
        matches!(self, NodeKind::Inclusive { .. } | NodeKind::End)
    }
}

/// Limiter guarding a service task
#[derive(Debug, Clone)]
pub struct ResourceLimit {
    pub permits: usize,
    pub strategy: AcquireFailStrategy,
    pub semaphore: Arc<Semaphore>,
}

impl ResourceLimit {
    pub fn new(permits: usize, strategy: AcquireFailStrategy) -> Self {
        Self {
            permits,
            strategy,
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }
}

/// A unit of work done by a registered task service or instruct adapter
#[derive(Debug, Clone, Default)]
pub struct ServiceTask {
    pub service: Option<String>,
    pub instruct: Option<InstructContent>,
    /// Free form payload handed to the service through its operator
    pub property: Option<String>,
    /// Parameter name -> scope path
    pub params: BTreeMap<String, String>,
    /// Target scope path -> path inside the result
    pub outputs: BTreeMap<String, String>,
    /// Fallback service when every attempt failed or the limiter demoted
    pub demotion: Option<String>,
    /// Extra attempts after the first failure
    pub retry: u32,
    pub limit: Option<ResourceLimit>,
}

impl ServiceTask {
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            service: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn instruct(content: InstructContent) -> Self {
        Self {
            instruct: Some(content),
            ..Default::default()
        }
    }

    /// Name used in logs and error messages
    pub fn label(&self) -> &str {
        match (&self.service, &self.instruct) {
            (Some(service), _) => service,
            (None, Some(instruct)) => &instruct.instruct,
            (None, None) => "<none>",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubProcess {
    pub body: Arc<ProcessGraph>,
    /// Non-strict sub-processes log failures and let the parent continue
    pub strict: bool,
    pub timeout: Option<Duration>,
}

/// Loop metadata of a sub-process start: which collection, which item name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationDirective {
    /// Collection path, resolved against `var` unless qualified
    pub source: String,
    /// Name each element is written under in `var`
    pub item: String,
}

impl IterationDirective {
    pub fn new(source: impl Into<String>, item: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            item: item.into(),
        }
    }

    /// Parse `name@collection-item`; `Ok(None)` when the name has no `@`.
    ///
    /// Collection paths containing `-` need the `iterate` form of a
    /// sub-process definition instead.
    pub fn parse_name(name: &str) -> Result<Option<Self>, ConfigError> {
        let Some((label, directive)) = name.split_once('@') else {
            return Ok(None);
        };
        let malformed = || ConfigError::IterationDirective(name.to_string());
        if label.trim().is_empty() {
            return Err(malformed());
        }
        // Only the first two parts count; anything after a second `-` is ignored
        let mut parts = directive.split('-').map(str::trim);
        let (Some(source), Some(item)) = (parts.next(), parts.next()) else {
            return Err(malformed());
        };
        if source.is_empty() || item.is_empty() {
            return Err(malformed());
        }
        Ok(Some(Self::new(source, item)))
    }

    /// Key of the per-iteration status marker, also read as the abort flag
    pub fn marker(&self) -> String {
        format!("@{}", self.item)
    }
}

#[derive(Debug, Clone)]
pub struct Guard {
    pub raw: String,
    pub compiled: Option<ConditionExpression>,
}

#[derive(Debug, Clone)]
pub struct SequenceFlow {
    pub id: String,
    pub source: NodeIdx,
    pub target: NodeIdx,
    pub guard: Option<Guard>,
    pub is_default: bool,
}

impl SequenceFlow {
    /// Evaluation priority taken from the compiled guard
    pub fn order(&self) -> Option<i32> {
        self.guard
            .as_ref()
            .and_then(|g| g.compiled.as_ref())
            .and_then(|c| c.order())
    }
}

/// An executable (or still raw) process
#[derive(Debug, Clone, Default)]
pub struct ProcessGraph {
    pub id: String,
    pub name: Option<String>,
    nodes: Vec<Node>,
    flows: Vec<Option<SequenceFlow>>,
    pub iteration: Option<IterationDirective>,
}

impl ProcessGraph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn add_node(&mut self, id: impl Into<String>, kind: NodeKind) -> NodeIdx {
        self.nodes.push(Node {
            id: id.into(),
            name: None,
            kind,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            attached: None,
            required_incoming: 0,
        });
        self.nodes.len() - 1
    }

    /// Add a flow and register it on both of its ends
    pub fn connect(
        &mut self,
        id: impl Into<String>,
        source: NodeIdx,
        target: NodeIdx,
        guard: Option<String>,
        is_default: bool,
    ) -> FlowIdx {
        let idx = self.flows.len();
        self.flows.push(Some(SequenceFlow {
            id: id.into(),
            source,
            target,
            guard: guard.map(|raw| Guard {
                raw,
                compiled: None,
            }),
            is_default,
        }));
        self.nodes[source].outgoing.push(idx);
        self.nodes[target].incoming.push(idx);
        idx
    }

    /// Point an existing flow at a different target
    pub fn retarget(&mut self, flow: FlowIdx, target: NodeIdx) {
        let Some(Some(edge)) = self.flows.get_mut(flow) else {
            return;
        };
        let old = std::mem::replace(&mut edge.target, target);
        self.nodes[old].incoming.retain(|f| *f != flow);
        self.nodes[target].incoming.push(flow);
    }

    /// Detach `node` from all of its successors. Predecessors are untouched.
    pub fn clear_outgoing(&mut self, node: NodeIdx) {
        let outgoing = std::mem::take(&mut self.nodes[node].outgoing);
        for flow in outgoing {
            if let Some(edge) = self.flows[flow].take() {
                self.nodes[edge.target].incoming.retain(|f| *f != flow);
            }
        }
    }

    pub fn node(&self, idx: NodeIdx) -> &Node {
        &self.nodes[idx]
    }

    pub fn node_mut(&mut self, idx: NodeIdx) -> &mut Node {
        &mut self.nodes[idx]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn find(&self, id: &str) -> Option<NodeIdx> {
        self.nodes.iter().position(|n| n.id == id)
    }

    pub fn flow(&self, idx: FlowIdx) -> Option<&SequenceFlow> {
        self.flows.get(idx).and_then(Option::as_ref)
    }

    pub fn flow_mut(&mut self, idx: FlowIdx) -> Option<&mut SequenceFlow> {
        self.flows.get_mut(idx).and_then(Option::as_mut)
    }

    /// Live flows with their indices
    pub fn flows(&self) -> impl Iterator<Item = (FlowIdx, &SequenceFlow)> {
        self.flows
            .iter()
            .enumerate()
            .filter_map(|(idx, flow)| flow.as_ref().map(|f| (idx, f)))
    }

    pub fn flows_mut(&mut self) -> impl Iterator<Item = &mut SequenceFlow> {
        self.flows.iter_mut().flatten()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.iter().flatten().count()
    }

    /// Every start event, whatever its arity
    pub fn start_events(&self) -> Vec<NodeIdx> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| matches!(n.kind, NodeKind::Start))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// The entry node, when there is exactly one start event
    pub fn start(&self) -> Option<NodeIdx> {
        match self.start_events().as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    /// Sub-process bodies nested directly in this graph
    pub fn subprocesses_mut(&mut self) -> impl Iterator<Item = &mut SubProcess> {
        self.nodes.iter_mut().filter_map(|n| match &mut n.kind {
            NodeKind::SubProcess(sub) => Some(sub),
            _ => None,
        })
    }

    /// Ids of the flows leaving `node`, in declaration order
    pub fn outgoing_ids(&self, node: NodeIdx) -> Vec<&str> {
        self.nodes[node]
            .outgoing
            .iter()
            .filter_map(|f| self.flow(*f))
            .map(|f| f.id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line() -> (ProcessGraph, NodeIdx, NodeIdx, NodeIdx) {
        let mut graph = ProcessGraph::new("p");
        let start = graph.add_node("start", NodeKind::Start);
        let task = graph.add_node("task", NodeKind::ServiceTask(ServiceTask::service("a")));
        let end = graph.add_node("end", NodeKind::End);
        graph.connect("f1", start, task, None, false);
        graph.connect("f2", task, end, None, false);
        (graph, start, task, end)
    }

    #[test]
    fn test_connect_is_bidirectional() {
        let (graph, start, task, end) = line();
        assert_eq!(graph.node(start).outgoing(), &[0]);
        assert_eq!(graph.node(task).incoming(), &[0]);
        assert_eq!(graph.node(task).outgoing(), &[1]);
        assert_eq!(graph.node(end).incoming(), &[1]);
        assert_eq!(graph.start(), Some(start));
    }

    #[test]
    fn test_retarget_moves_incoming() {
        let (mut graph, start, task, end) = line();
        graph.retarget(0, end);
        assert!(graph.node(task).incoming().is_empty());
        assert_eq!(graph.node(end).incoming(), &[1, 0]);
        assert_eq!(graph.flow(0).map(|f| f.target), Some(end));
        assert_eq!(graph.node(start).outgoing(), &[0]);
    }

    #[test]
    fn test_clear_outgoing_keeps_predecessors() {
        let (mut graph, start, task, end) = line();
        graph.clear_outgoing(task);
        assert!(graph.node(task).outgoing().is_empty());
        assert_eq!(graph.node(task).incoming(), &[0]);
        assert!(graph.node(end).incoming().is_empty());
        assert!(graph.flow(1).is_none());
        assert_eq!(graph.flow_count(), 1);
        assert_eq!(graph.node(start).outgoing(), &[0]);
    }

    #[test]
    fn test_iteration_directive_parse() {
        let directive = IterationDirective::parse_name("P@items-item").unwrap().unwrap();
        assert_eq!(directive, IterationDirective::new("items", "item"));
        assert_eq!(directive.marker(), "@item");

        let qualified = IterationDirective::parse_name("loop@sta.lines-line")
            .unwrap()
            .unwrap();
        assert_eq!(qualified.source, "sta.lines");
        assert_eq!(qualified.item, "line");

        let extra = IterationDirective::parse_name("P@a-b-c").unwrap().unwrap();
        assert_eq!(extra, IterationDirective::new("a", "b"));

        assert!(IterationDirective::parse_name("plain").unwrap().is_none());
        assert!(IterationDirective::parse_name("@items-item").is_err());
        assert!(IterationDirective::parse_name("P@items").is_err());
        assert!(IterationDirective::parse_name("P@-item").is_err());
    }

    #[test]
    fn test_aggregating_kinds() {
        assert!(NodeKind::End.is_aggregating());
        assert!(NodeKind::Inclusive {
            async_branches: false
        }
        .is_aggregating());
        assert!(!NodeKind::Exclusive.is_aggregating());
        assert!(!NodeKind::Start.is_aggregating());
    }
}
