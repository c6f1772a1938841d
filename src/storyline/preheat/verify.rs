// SPDX-License-Identifier: MIT

//! Structural verification of a preheated graph

use std::collections::HashSet;

use super::{PreheatContext, StartEventProcessor};
use crate::sdk::error::ConfigError;
use crate::storyline::flow::{walk, Node, NodeKind, ProcessGraph};

/// Rejects graphs the runtime could not execute
pub struct VerifyProcessor;

impl StartEventProcessor for VerifyProcessor {
    fn name(&self) -> &str {
        "verify"
    }

    fn order(&self) -> i32 {
        40
    }

    fn process(
        &self,
        graph: ProcessGraph,
        context: &PreheatContext,
    ) -> Result<ProcessGraph, ConfigError> {
        check_ids(&graph)?;
        let start = check_start(&graph)?;
        for node in graph.nodes() {
            check_arity(&graph, node)?;
            check_components(&graph, node, context)?;
        }
        check_flows(&graph)?;
        check_reachability(&graph, start)?;
        Ok(graph)
    }
}

fn violation(graph: &ProcessGraph, node_id: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Violation {
        process_id: graph.id.clone(),
        node_id: node_id.to_string(),
        message: message.into(),
    }
}

fn check_ids(graph: &ProcessGraph) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    let node_ids = graph.nodes().iter().map(|n| n.id.as_str());
    let flow_ids = graph.flows().map(|(_, f)| f.id.as_str());
    for id in node_ids.chain(flow_ids) {
        if !seen.insert(id) {
            return Err(ConfigError::DuplicateId(id.to_string()));
        }
    }
    Ok(())
}

fn check_start(graph: &ProcessGraph) -> Result<usize, ConfigError> {
    let starts = graph.start_events();
    let [start] = starts.as_slice() else {
        return Err(ConfigError::StartEvent {
            process_id: graph.id.clone(),
            found: starts.len(),
        });
    };
    Ok(*start)
}

fn check_arity(graph: &ProcessGraph, node: &Node) -> Result<(), ConfigError> {
    let incoming = node.incoming().len();
    let outgoing = node.outgoing().len();

    match &node.kind {
        NodeKind::Start if incoming > 0 => {
            Err(violation(graph, &node.id, "start event has incoming flows"))
        }
        NodeKind::End if outgoing > 0 => {
            Err(violation(graph, &node.id, "end event has outgoing flows"))
        }
        NodeKind::Exclusive if incoming != 1 => Err(violation(
            graph,
            &node.id,
            format!("exclusive gateway needs exactly one incoming flow, found {}", incoming),
        )),
        NodeKind::Inclusive { .. } if incoming == 0 => Err(violation(
            graph,
            &node.id,
            "inclusive gateway has no incoming flow",
        )),
        kind if !kind.is_aggregating() && incoming > 1 => Err(violation(
            graph,
            &node.id,
            format!(
                "{} has {} incoming flows, join them with an inclusive gateway",
                kind.name(),
                incoming
            ),
        )),
        NodeKind::End => Ok(()),
        kind if outgoing == 0 => Err(violation(
            graph,
            &node.id,
            format!("{} has no outgoing flow", kind.name()),
        )),
        _ => Ok(()),
    }
}

fn check_components(
    graph: &ProcessGraph,
    node: &Node,
    context: &PreheatContext,
) -> Result<(), ConfigError> {
    let NodeKind::ServiceTask(task) = &node.kind else {
        return Ok(());
    };

    if let Some(services) = &context.services {
        for service in task.service.iter().chain(task.demotion.iter()) {
            if !services.contains(service) {
                return Err(ConfigError::UnknownService {
                    node_id: node.id.clone(),
                    service: service.clone(),
                });
            }
        }
    }
    if let (Some(instructs), Some(instruct)) = (&context.instructs, &task.instruct) {
        if !instructs.contains(&instruct.instruct) {
            return Err(ConfigError::UnknownInstruct {
                node_id: node.id.clone(),
                instruct: instruct.instruct.clone(),
            });
        }
    }
    if task.service.is_none() && task.instruct.is_none() {
        return Err(violation(
            graph,
            &node.id,
            "service task names neither a service nor an instruct",
        ));
    }
    Ok(())
}

fn check_flows(graph: &ProcessGraph) -> Result<(), ConfigError> {
    for node in graph.nodes() {
        let defaults = node
            .outgoing()
            .iter()
            .filter_map(|f| graph.flow(*f))
            .filter(|f| f.is_default)
            .count();
        if defaults == 0 {
            continue;
        }
        if !matches!(node.kind, NodeKind::Exclusive) {
            return Err(violation(
                graph,
                &node.id,
                "only exclusive gateways may have a default flow",
            ));
        }
        if defaults > 1 {
            return Err(violation(
                graph,
                &node.id,
                format!("{} default flows, at most one allowed", defaults),
            ));
        }
    }

    for (_, flow) in graph.flows() {
        if let Some(guard) = &flow.guard {
            if guard.compiled.is_none() {
                return Err(ConfigError::UncompiledGuard(flow.id.clone()));
            }
        }
    }
    Ok(())
}

fn check_reachability(graph: &ProcessGraph, start: usize) -> Result<(), ConfigError> {
    let walk = walk(graph, start);

    if let Some((idx, node)) = graph
        .nodes()
        .iter()
        .enumerate()
        .find(|(idx, _)| !walk.reached(*idx))
    {
        let message = match walk.starved.get(&idx) {
            Some(seen) => format!(
                "join can see only {} of {} incoming flows",
                seen,
                node.incoming().len()
            ),
            None => "unreachable from the start event".to_string(),
        };
        return Err(violation(graph, &node.id, message));
    }

    let reaches_end = walk
        .order
        .iter()
        .any(|idx| matches!(graph.node(*idx).kind, NodeKind::End));
    if !reaches_end {
        return Err(violation(graph, &graph.id, "no end event is reachable"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storyline::flow::ServiceTask;
    use crate::storyline::preheat::{ExpressionProcessor, PreheatPipeline};

    fn linear() -> ProcessGraph {
        let mut graph = ProcessGraph::new("p");
        let start = graph.add_node("start", NodeKind::Start);
        let task = graph.add_node("task", NodeKind::ServiceTask(ServiceTask::service("a")));
        let end = graph.add_node("end", NodeKind::End);
        graph.connect("f1", start, task, None, false);
        graph.connect("f2", task, end, None, false);
        graph
    }

    fn verify(graph: ProcessGraph) -> Result<ProcessGraph, ConfigError> {
        VerifyProcessor.process(graph, &PreheatContext::default())
    }

    #[test]
    fn test_valid_graph_passes() {
        assert!(verify(linear()).is_ok());
    }

    #[test]
    fn test_duplicate_ids() {
        let mut graph = linear();
        let end = graph.find("end").unwrap();
        let extra = graph.add_node("task", NodeKind::End);
        graph.connect("f3", extra, end, None, false);
        assert_eq!(
            verify(graph).unwrap_err(),
            ConfigError::DuplicateId("task".to_string())
        );
    }

    #[test]
    fn test_missing_start() {
        let mut graph = ProcessGraph::new("p");
        graph.add_node("end", NodeKind::End);
        assert_eq!(
            verify(graph).unwrap_err(),
            ConfigError::StartEvent {
                process_id: "p".to_string(),
                found: 0
            }
        );
    }

    #[test]
    fn test_exclusive_arity() {
        let mut graph = ProcessGraph::new("p");
        let start = graph.add_node("start", NodeKind::Start);
        let gw = graph.add_node("gw", NodeKind::Exclusive);
        let end = graph.add_node("end", NodeKind::End);
        graph.connect("f1", start, gw, None, false);
        graph.connect("f2", start, gw, None, false);
        graph.connect("f3", gw, end, None, false);
        assert!(matches!(
            verify(graph).unwrap_err(),
            ConfigError::Violation { node_id, .. } if node_id == "gw"
        ));
    }

    #[test]
    fn test_task_with_two_incoming_rejected() {
        let mut graph = ProcessGraph::new("p");
        let start = graph.add_node("start", NodeKind::Start);
        let gw = graph.add_node(
            "gw",
            NodeKind::Inclusive {
                async_branches: false,
            },
        );
        let task = graph.add_node("task", NodeKind::ServiceTask(ServiceTask::service("a")));
        let end = graph.add_node("end", NodeKind::End);
        graph.connect("f1", start, gw, None, false);
        graph.connect("f2", gw, task, None, false);
        graph.connect("f3", gw, task, None, false);
        graph.connect("f4", task, end, None, false);
        assert!(matches!(
            verify(graph).unwrap_err(),
            ConfigError::Violation { node_id, .. } if node_id == "task"
        ));
    }

    #[test]
    fn test_default_flow_only_on_exclusive() {
        let mut graph = ProcessGraph::new("p");
        let start = graph.add_node("start", NodeKind::Start);
        let end = graph.add_node("end", NodeKind::End);
        graph.connect("f1", start, end, None, true);
        assert!(matches!(
            verify(graph).unwrap_err(),
            ConfigError::Violation { node_id, .. } if node_id == "start"
        ));
    }

    #[test]
    fn test_unreachable_node() {
        let mut graph = linear();
        let end = graph.find("end").unwrap();
        let island = graph.add_node(
            "island",
            NodeKind::Inclusive {
                async_branches: false,
            },
        );
        let lonely = graph.add_node("lonely", NodeKind::ServiceTask(ServiceTask::service("b")));
        graph.connect("f3", lonely, island, None, false);
        graph.connect("f4", island, end, None, false);
        let err = verify(graph).unwrap_err();
        match err {
            ConfigError::Violation { message, .. } => {
                assert!(message.contains("unreachable") || message.contains("join"))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_unknown_service() {
        let context = PreheatContext::default().with_services(vec!["b".to_string()]);
        let err = VerifyProcessor.process(linear(), &context).unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownService {
                node_id: "task".to_string(),
                service: "a".to_string()
            }
        );
    }

    #[test]
    fn test_uncompiled_guard() {
        let mut graph = ProcessGraph::new("p");
        let start = graph.add_node("start", NodeKind::Start);
        let gw = graph.add_node("gw", NodeKind::Exclusive);
        let end = graph.add_node("end", NodeKind::End);
        graph.connect("f1", start, gw, None, false);
        graph.connect("f2", gw, end, Some("x > 1".into()), false);

        assert_eq!(
            verify(graph.clone()).unwrap_err(),
            ConfigError::UncompiledGuard("f2".to_string())
        );

        let compiled = ExpressionProcessor
            .process(graph, &PreheatContext::default())
            .unwrap();
        assert!(verify(compiled).is_ok());
    }

    #[test]
    fn test_full_pipeline_on_attached_inclusive() {
        let mut graph = linear();
        let task = graph.find("task").unwrap();
        let gw = graph.add_node(
            "gw",
            NodeKind::Inclusive {
                async_branches: false,
            },
        );
        let end = graph.find("end").unwrap();
        // start -> task -> gw -> end
        let into_end = graph.node(end).incoming()[0];
        graph.retarget(into_end, gw);
        graph.connect("f3", gw, end, None, false);
        graph.node_mut(gw).attached = Some(ServiceTask::service("audit"));

        let graph = PreheatPipeline::new()
            .run(graph, &PreheatContext::default())
            .unwrap();
        for node in graph.nodes() {
            if node.is_aggregating() {
                assert_eq!(node.required_incoming, node.incoming().len());
            }
        }
        assert!(graph.find("Service-Task-gw").is_some());
        assert_eq!(graph.node(task).outgoing().len(), 1);
    }
}
