// SPDX-License-Identifier: MIT

//! Graph traversal inside one fragment
//!
//! Tokens move along flows on an explicit stack. A token is live when its
//! flow was taken and dead when a gateway did not choose it; dead tokens
//! still travel so that joins downstream learn the branch will never come.
//! A join continues once every incoming flow has delivered a token, live
//! when at least one of them was.

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Barrier;

use super::fragment::{FragmentMode, FragmentReport, FragmentState, FragmentTask};
use super::limiter::{AcquireContext, AcquireDecision};
use super::pool::WorkerSlot;
use crate::sdk::error::{ConfigError, InvocationError, StoryError};
use crate::sdk::instruct::{InstructContent, InstructProperty};
use crate::sdk::task::{TaskOutcome, TaskRequest};
use crate::storyline::bus::{
    get_in, ScopeDataBus, ScopeKind, ScopeOperator, ScopePath, ScopeView, Segment,
};
use crate::storyline::flow::{
    FlowIdx, JoinCounter, Node, NodeIdx, NodeKind, ProcessGraph, ServiceTask, SubProcess,
};

#[derive(Debug, Default)]
struct JoinBook {
    counter: JoinCounter,
    /// Whether any arrival so far was live
    live: HashMap<NodeIdx, bool>,
    /// Buses of live arrivals waiting for the join to complete
    parked: HashMap<NodeIdx, Vec<ScopeDataBus>>,
}

enum Arrival {
    Wait,
    Complete { live: bool, parked: Vec<ScopeDataBus> },
}

/// Join state of one pass over a graph.
///
/// Clones share the state, so the branches of an async wave meet at the
/// same joins. [`Cursor::fork`] starts over, as a new loop iteration does.
#[derive(Debug, Clone, Default)]
pub struct Cursor {
    joins: Arc<Mutex<JoinBook>>,
}

impl Cursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fork(&self) -> Self {
        Self::new()
    }

    fn arrive(&self, node: NodeIdx, required: usize, live: bool, bus: &ScopeDataBus) -> Arrival {
        let mut book = self.joins.lock();
        let complete = book.counter.arrive(node, required);
        *book.live.entry(node).or_insert(false) |= live;
        if !complete {
            if live {
                book.parked.entry(node).or_default().push(bus.clone());
            }
            return Arrival::Wait;
        }
        book.counter.reset(node);
        let live = book.live.remove(&node).unwrap_or(false);
        let parked = book.parked.remove(&node).unwrap_or_default();
        Arrival::Complete { live, parked }
    }
}

#[derive(Debug, Clone, Copy)]
struct Token {
    node: NodeIdx,
    live: bool,
    /// Counted as an arrival when the node is a join
    counted: bool,
}

/// Fail fast once the fragment's sub-tree has been cancelled
pub fn checkpoint(task: &FragmentTask) -> Result<(), StoryError> {
    if task.token.is_cancelled() {
        return Err(StoryError::interrupted(format!("fragment {} cancelled", task.id)));
    }
    Ok(())
}

pub async fn traverse(task: &FragmentTask, slot: &mut WorkerSlot) -> Result<(), StoryError> {
    let graph = task.graph.as_ref();
    let handle = &task.env.handle;
    let mut stack = vec![Token {
        node: task.entry,
        live: true,
        counted: task.arriving,
    }];

    while let Some(mut token) = stack.pop() {
        let node = graph.node(token.node);

        if node.is_aggregating() && token.counted {
            match task
                .cursor
                .arrive(token.node, node.required_incoming, token.live, &task.bus)
            {
                Arrival::Wait => continue,
                Arrival::Complete { live, parked } => {
                    for bus in &parked {
                        task.bus.merge_var_from(bus);
                    }
                    token.live = live;
                }
            }
        }

        if !token.live {
            push_targets(&mut stack, graph, node.outgoing(), &[]);
            continue;
        }

        checkpoint(task)?;
        handle.record_visit(&node.id);
        log::trace!("Fragment {} at '{}' ({})", task.id, node.id, node.kind.name());

        let fired: Vec<FlowIdx> = match &node.kind {
            NodeKind::Start | NodeKind::End => node.outgoing().to_vec(),
            NodeKind::ServiceTask(service) => {
                execute_task(task, node, service).await?;
                node.outgoing().to_vec()
            }
            NodeKind::Exclusive => vec![select_exclusive(task, graph, node)?],
            NodeKind::Inclusive { async_branches } => {
                let selected = select_inclusive(task, graph, node)?;
                if selected.is_empty() {
                    log::warn!("Inclusive gateway '{}' fired no flow", node.id);
                }
                if *async_branches && selected.len() > 1 {
                    dispatch_wave(task, slot, &selected).await?;
                    let dead: Vec<FlowIdx> = node
                        .outgoing()
                        .iter()
                        .copied()
                        .filter(|f| !selected.contains(f))
                        .collect();
                    push_targets(&mut stack, graph, &dead, &[]);
                    continue;
                }
                selected
            }
            NodeKind::SubProcess(sub) => {
                run_subprocess(task, slot, node, sub).await?;
                node.outgoing().to_vec()
            }
        };
        push_targets(&mut stack, graph, node.outgoing(), &fired);
    }
    Ok(())
}

/// Push one token per flow, live when the flow is in `fired`. Reverse
/// order keeps the first declared flow on top of the stack.
fn push_targets(stack: &mut Vec<Token>, graph: &ProcessGraph, flows: &[FlowIdx], fired: &[FlowIdx]) {
    for flow_idx in flows.iter().rev() {
        if let Some(flow) = graph.flow(*flow_idx) {
            stack.push(Token {
                node: flow.target,
                live: fired.contains(flow_idx),
                counted: true,
            });
        }
    }
}

fn view(task: &FragmentTask) -> ScopeView<'_> {
    ScopeView::new(&task.bus, task.env.role.as_deref())
}

fn passes(task: &FragmentTask, graph: &ProcessGraph, flow_idx: FlowIdx) -> Result<bool, StoryError> {
    let Some(flow) = graph.flow(flow_idx) else {
        return Ok(false);
    };
    match &flow.guard {
        None => Ok(true),
        Some(guard) => match &guard.compiled {
            Some(expression) => Ok(expression.evaluate(&view(task))?),
            None => Err(ConfigError::UncompiledGuard(flow.id.clone()).into()),
        },
    }
}

/// Ordered guards first by ascending order, then unordered ones in
/// declaration order; the default flow only when nothing matched
fn select_exclusive(
    task: &FragmentTask,
    graph: &ProcessGraph,
    node: &Node,
) -> Result<FlowIdx, StoryError> {
    let mut ordered = Vec::new();
    let mut unordered = Vec::new();
    let mut default = None;
    for &flow_idx in node.outgoing() {
        let Some(flow) = graph.flow(flow_idx) else {
            continue;
        };
        if flow.is_default {
            default = Some(flow_idx);
        } else if let Some(order) = flow.order() {
            ordered.push((order, flow_idx));
        } else {
            unordered.push(flow_idx);
        }
    }
    ordered.sort_by_key(|(order, _)| *order);

    for flow_idx in ordered.into_iter().map(|(_, f)| f).chain(unordered) {
        if passes(task, graph, flow_idx)? {
            return Ok(flow_idx);
        }
    }
    default.ok_or_else(|| InvocationError::NoMatchingFlow(node.id.clone()).into())
}

/// Every flow whose guard passes, in declaration order
fn select_inclusive(
    task: &FragmentTask,
    graph: &ProcessGraph,
    node: &Node,
) -> Result<Vec<FlowIdx>, StoryError> {
    let mut selected = Vec::new();
    for &flow_idx in node.outgoing() {
        if passes(task, graph, flow_idx)? {
            selected.push(flow_idx);
        }
    }
    Ok(selected)
}

/// Run each fired branch in its own fragment, all started together
async fn dispatch_wave(
    task: &FragmentTask,
    slot: &mut WorkerSlot,
    flows: &[FlowIdx],
) -> Result<(), StoryError> {
    let targets: Vec<NodeIdx> = flows
        .iter()
        .filter_map(|f| task.graph.flow(*f))
        .map(|f| f.target)
        .collect();
    let barrier = Arc::new(Barrier::new(targets.len()));
    let mut buses = Vec::with_capacity(targets.len());
    let mut joins = Vec::with_capacity(targets.len());

    for target in targets {
        let mut branch = task.child(Arc::clone(&task.graph), target);
        branch.bus = task.bus.branch();
        branch.arriving = true;
        branch.mode = FragmentMode::Report;
        branch.wave = Some(Arc::clone(&barrier));
        branch.cursor = task.cursor.clone();
        buses.push(branch.bus.clone());
        let id = branch.id.clone();
        joins.push((id, task.env.pool.spawn(branch)));
    }
    log::debug!("Fragment {} dispatched a wave of {} branches", task.id, joins.len());

    let reports = slot
        .release_while(join_all(joins.into_iter().map(|(id, join)| async move {
            join.await.unwrap_or_else(|e| FragmentReport::aborted(&id, &e))
        })))
        .await?;

    for bus in &buses {
        task.bus.merge_var_from(bus);
    }

    if let Some(failed) = reports.iter().find(|r| r.state == FragmentState::Error) {
        return Err(InvocationError::Fragment(failed.id.clone(), "branch failed".to_string()).into());
    }
    checkpoint(task)?;
    // A branch that did not succeed never reached the join
    match reports.into_iter().find(|r| r.state != FragmentState::Success) {
        Some(stopped) => stopped.into_result(),
        None => Ok(()),
    }
}

async fn run_subprocess(
    task: &FragmentTask,
    slot: &mut WorkerSlot,
    node: &Node,
    sub: &SubProcess,
) -> Result<(), StoryError> {
    let body = &sub.body;
    let entry = body.start().ok_or_else(|| ConfigError::StartEvent {
        process_id: body.id.clone(),
        found: body.start_events().len(),
    })?;

    let mut child = task.child(Arc::clone(body), entry);
    child.iterate = true;
    child.token = task.env.handle.child_token(&child.id, &task.token);
    let token = child.token.clone();
    let child_id = child.id.clone();
    let mut join = task.env.pool.spawn(child);

    let waited = match sub.timeout {
        None => slot.release_while(&mut join).await,
        Some(limit) => match slot
            .release_while(tokio::time::timeout(limit, &mut join))
            .await
        {
            Ok(Ok(joined)) => Ok(joined),
            Ok(Err(_)) => {
                log::warn!("Sub-process '{}' timed out after {:?}", node.id, limit);
                token.cancel();
                slot.release_while(&mut join).await.map(|_| {
                    Ok(FragmentReport {
                        id: child_id.clone(),
                        state: FragmentState::Cancelled,
                        error: Some(StoryError::interrupted(format!(
                            "sub-process '{}' timed out after {:?}",
                            node.id, limit
                        ))),
                    })
                })
            }
            Err(e) => Err(e),
        },
    };
    task.env.handle.release_token(&child_id);
    let report = waited?.unwrap_or_else(|e| FragmentReport::aborted(&child_id, &e));

    match report.into_result() {
        Ok(()) => Ok(()),
        Err(e) if task.token.is_cancelled() => Err(e),
        Err(e) if !sub.strict => {
            log::warn!("Non-strict sub-process '{}' failed, continuing: {}", node.id, e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn execute_task(
    task: &FragmentTask,
    node: &Node,
    service: &ServiceTask,
) -> Result<(), StoryError> {
    let _permit = match &service.limit {
        None => None,
        Some(limit) => match Arc::clone(&limit.semaphore).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                let context = AcquireContext {
                    node_id: &node.id,
                    resource: &node.id,
                    permits: limit.permits,
                    demotion: service.demotion.as_deref(),
                };
                match limit.strategy.on_failure(&context) {
                    AcquireDecision::Ignore => return Ok(()),
                    AcquireDecision::Demote(target) => {
                        let outcome = invoke_service(task, node, service, &target).await?;
                        return apply_outcome(task, node, service, outcome);
                    }
                    AcquireDecision::Raise => {
                        return Err(StoryError::ResourceAcquire {
                            resource: node.id.clone(),
                            node_id: node.id.clone(),
                        })
                    }
                }
            }
        },
    };

    match (&service.service, &service.instruct) {
        (Some(name), _) => {
            let outcome = run_service(task, node, service, name).await?;
            apply_outcome(task, node, service, outcome)
        }
        (None, Some(content)) => run_instruct(task, node, service, content).await,
        (None, None) => Ok(()),
    }
}

/// Invoke with retries, then fall back to the demotion service
async fn run_service(
    task: &FragmentTask,
    node: &Node,
    service: &ServiceTask,
    name: &str,
) -> Result<TaskOutcome, StoryError> {
    let mut attempt = 0;
    let error = loop {
        match invoke_service(task, node, service, name).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_interrupted() => return Err(e),
            Err(e) if attempt < service.retry => {
                attempt += 1;
                log::warn!(
                    "Task '{}' failed at '{}', retry {}/{}: {}",
                    name,
                    node.id,
                    attempt,
                    service.retry,
                    e
                );
            }
            Err(e) => break e,
        }
    };

    match service.demotion.as_deref() {
        Some(fallback) if fallback != name => {
            log::warn!("Task '{}' failed at '{}', demoting to '{}'", name, node.id, fallback);
            invoke_service(task, node, service, fallback).await
        }
        _ => Err(error),
    }
}

fn operator(task: &FragmentTask, service: &ServiceTask) -> ScopeOperator {
    ScopeOperator::new(task.bus.clone(), service.property.clone())
        .with_role(task.env.role.clone())
        .with_context(task.env.context.entries())
}

async fn invoke_service(
    task: &FragmentTask,
    node: &Node,
    service: &ServiceTask,
    name: &str,
) -> Result<TaskOutcome, StoryError> {
    checkpoint(task)?;
    let implementation = task
        .env
        .registry
        .get(name)
        .await
        .ok_or_else(|| InvocationError::MissingComponent {
            node_id: node.id.clone(),
            name: name.to_string(),
        })?;

    let mut params = Map::new();
    for (param, path) in &service.params {
        let value = task.bus.get(ScopeKind::Req, path).unwrap_or(Value::Null);
        params.insert(param.clone(), value);
    }
    let request = TaskRequest {
        node_id: node.id.clone(),
        params,
        operator: operator(task, service),
        instruct: service.instruct.clone(),
    };

    let result = tokio::select! {
        result = implementation.invoke(request) => result,
        _ = task.token.cancelled() => {
            return Err(StoryError::interrupted(format!("task '{}' at '{}' cancelled", name, node.id)));
        }
    };
    // A result that lands after cancellation is dropped
    checkpoint(task)?;
    result.map_err(|e| {
        InvocationError::Task {
            node_id: node.id.clone(),
            service: name.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

async fn run_instruct(
    task: &FragmentTask,
    node: &Node,
    service: &ServiceTask,
    content: &InstructContent,
) -> Result<(), StoryError> {
    let adapter = task
        .env
        .registry
        .get_instruct(&content.instruct)
        .await
        .ok_or_else(|| InvocationError::MissingComponent {
            node_id: node.id.clone(),
            name: content.instruct.clone(),
        })?;
    let operator = operator(task, service);

    let result = tokio::select! {
        result = adapter.execute(content, &operator) => result,
        _ = task.token.cancelled() => {
            return Err(StoryError::interrupted(format!("instruct at '{}' cancelled", node.id)));
        }
    };
    checkpoint(task)?;
    let value = result.map_err(|e| InvocationError::Instruct {
        node_id: node.id.clone(),
        instruct: content.instruct.clone(),
        content: content.content.clone(),
        message: e.to_string(),
    })?;

    let Some(value) = value else {
        return Ok(());
    };
    if let Some(property) = InstructProperty::parse(service.property.as_deref()) {
        for target in &property.return_target {
            if !task.bus.set(ScopeKind::Var, target, value.clone()) {
                log::warn!("Instruct at '{}' could not write '{}'", node.id, target);
            }
        }
    }
    write_outputs(task, node, service, &value);
    Ok(())
}

fn apply_outcome(
    task: &FragmentTask,
    node: &Node,
    service: &ServiceTask,
    outcome: TaskOutcome,
) -> Result<(), StoryError> {
    match outcome {
        TaskOutcome::Empty => {}
        TaskOutcome::Value(value) => write_outputs(task, node, service, &value),
        TaskOutcome::Notice(notice) => {
            for (path, value) in notice.entries() {
                if !task.bus.set(notice.scope(), path, value.clone()) {
                    log::warn!(
                        "Task at '{}' could not write {}.{}",
                        node.id,
                        notice.scope(),
                        path
                    );
                }
            }
        }
    }
    Ok(())
}

/// Copy parts of a result to the declared targets (`var` unless qualified)
fn write_outputs(task: &FragmentTask, node: &Node, service: &ServiceTask, result: &Value) {
    for (target, inner) in &service.outputs {
        let value = if inner.trim().is_empty() {
            Some(result.clone())
        } else {
            ScopePath::parse(inner).and_then(|path| {
                let mut segments = path.segments;
                if let Some(scope) = path.scope {
                    segments.insert(0, Segment::Key(scope.as_str().to_string()));
                }
                get_in(result, &segments).cloned()
            })
        };
        let value = value.unwrap_or(Value::Null);
        if !task.bus.set(ScopeKind::Var, target, value) {
            log::warn!("Task at '{}' could not write output '{}'", node.id, target);
        }
    }
}
