// SPDX-License-Identifier: MIT

//! Splits tasks attached to gateways into standalone service task nodes

use uuid::Uuid;

use super::{PreheatContext, StartEventProcessor};
use crate::sdk::error::ConfigError;
use crate::storyline::flow::{NodeIdx, NodeKind, ProcessGraph, ServiceTask};

pub struct RearrangeProcessor;

impl StartEventProcessor for RearrangeProcessor {
    fn name(&self) -> &str {
        "rearrange"
    }

    fn order(&self) -> i32 {
        20
    }

    fn process(
        &self,
        mut graph: ProcessGraph,
        _context: &PreheatContext,
    ) -> Result<ProcessGraph, ConfigError> {
        let carriers: Vec<NodeIdx> = (0..graph.node_count())
            .filter(|idx| graph.node(*idx).attached.is_some())
            .collect();

        for idx in carriers {
            // take() leaves nothing behind for a second run to split again
            let Some(task) = graph.node_mut(idx).attached.take() else {
                continue;
            };
            if matches!(graph.node(idx).kind, NodeKind::Inclusive { .. }) {
                split_inclusive(&mut graph, idx, task);
            } else if matches!(graph.node(idx).kind, NodeKind::Exclusive) {
                split_exclusive(&mut graph, idx, task)?;
            } else {
                let node = graph.node(idx);
                return Err(ConfigError::UnsupportedAttachment {
                    node_id: node.id.clone(),
                    kind: node.kind.name().to_string(),
                });
            }
        }
        Ok(graph)
    }
}

fn flow_id() -> String {
    format!("Flow-{}", Uuid::new_v4())
}

/// incoming* -> synthetic inclusive -> task -> gateway
fn split_inclusive(graph: &mut ProcessGraph, gateway: NodeIdx, task: ServiceTask) {
    let id = graph.node(gateway).id.clone();
    let task_idx = graph.add_node(format!("Service-Task-{}", id), NodeKind::ServiceTask(task));
    let synthetic = graph.add_node(
        format!("Inclusive-Gateway-{}", id),
        NodeKind::Inclusive {
            async_branches: false,
        },
    );

    for flow in graph.node(gateway).incoming().to_vec() {
        graph.retarget(flow, synthetic);
    }
    graph.connect(flow_id(), synthetic, task_idx, None, false);
    graph.connect(flow_id(), task_idx, gateway, None, false);
    log::debug!("Split attached task of inclusive gateway '{}'", id);
}

/// predecessor -> task -> gateway
fn split_exclusive(
    graph: &mut ProcessGraph,
    gateway: NodeIdx,
    task: ServiceTask,
) -> Result<(), ConfigError> {
    let id = graph.node(gateway).id.clone();
    let incoming = graph.node(gateway).incoming().to_vec();
    let [flow] = incoming.as_slice() else {
        return Err(ConfigError::Violation {
            process_id: graph.id.clone(),
            node_id: id,
            message: format!(
                "exclusive gateway carrying a task needs exactly one incoming flow, found {}",
                incoming.len()
            ),
        });
    };

    let task_idx = graph.add_node(format!("Service-Task-{}", id), NodeKind::ServiceTask(task));
    graph.retarget(*flow, task_idx);
    graph.connect(flow_id(), task_idx, gateway, None, false);
    log::debug!("Split attached task of exclusive gateway '{}'", id);
    Ok(())
}
