// SPDX-License-Identifier: MIT

//! Graph builder - turns parsed definitions into process graphs
//!
//! The graphs produced here are raw: guards are not compiled, attached tasks
//! are still on their gateways and join counts are unset. Hand them to the
//! preheat pipeline before running them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::sdk::error::ConfigError;
use crate::sdk::instruct::InstructContent;
use crate::storyline::flow::{
    IterationDirective, NodeKind, ProcessGraph, ResourceLimit, ServiceTask, SubProcess,
};
use crate::storyline::types::{
    ElementKind, ProcessDefinition, StoryDefinition, SubProcessDefinition, TaskDefinition,
};

pub struct GraphBuilder;

impl GraphBuilder {
    pub fn build(def: &StoryDefinition) -> Result<ProcessGraph, ConfigError> {
        let mut graph = Self::build_process(&def.id, &def.process)?;
        graph.name = def.name.clone();
        log::debug!(
            "Built story '{}' with {} nodes and {} flows",
            graph.id,
            graph.node_count(),
            graph.flow_count()
        );
        Ok(graph)
    }

    fn build_process(id: &str, def: &ProcessDefinition) -> Result<ProcessGraph, ConfigError> {
        let mut graph = ProcessGraph::new(id);
        let mut ids: HashSet<String> = HashSet::new();

        for element in &def.elements {
            if !ids.insert(element.id.clone()) {
                return Err(ConfigError::DuplicateId(element.id.clone()));
            }
            let kind = match &element.kind {
                ElementKind::Start => NodeKind::Start,
                ElementKind::End => NodeKind::End,
                ElementKind::Task(task) => NodeKind::ServiceTask(Self::task(task)),
                ElementKind::Exclusive => NodeKind::Exclusive,
                ElementKind::Inclusive { async_branches } => NodeKind::Inclusive {
                    async_branches: *async_branches,
                },
                ElementKind::SubProcess(sub) => {
                    NodeKind::SubProcess(Self::sub_process(&element.id, sub)?)
                }
            };
            let idx = graph.add_node(&element.id, kind);
            let node = graph.node_mut(idx);
            node.name = element.name.clone();
            node.attached = element.attach.as_ref().map(Self::task);
        }

        for flow in &def.flows {
            let flow_id = flow
                .id
                .clone()
                .unwrap_or_else(|| format!("Flow-{}-{}", flow.from, flow.to));
            let endpoint = |element: &str| {
                graph.find(element).ok_or_else(|| ConfigError::UnknownElement {
                    flow_id: flow_id.clone(),
                    element_id: element.to_string(),
                })
            };
            let source = endpoint(&flow.from)?;
            let target = endpoint(&flow.to)?;
            if !ids.insert(flow_id.clone()) {
                return Err(ConfigError::DuplicateId(flow_id));
            }
            graph.connect(flow_id, source, target, flow.when.clone(), flow.default);
        }

        graph.iteration = Self::start_directive(&graph)?;
        Ok(graph)
    }

    /// Loop directive carried in the start event's name
    fn start_directive(graph: &ProcessGraph) -> Result<Option<IterationDirective>, ConfigError> {
        for idx in graph.start_events() {
            if let Some(name) = &graph.node(idx).name {
                if let Some(directive) = IterationDirective::parse_name(name)? {
                    return Ok(Some(directive));
                }
            }
        }
        Ok(None)
    }

    fn sub_process(id: &str, def: &SubProcessDefinition) -> Result<SubProcess, ConfigError> {
        let mut body = Self::build_process(id, &def.process)?;
        if let Some(iterate) = &def.iterate {
            if iterate.source.trim().is_empty() || iterate.item.trim().is_empty() {
                return Err(ConfigError::IterationDirective(format!(
                    "{}@{}-{}",
                    id, iterate.source, iterate.item
                )));
            }
            body.iteration = Some(IterationDirective::new(
                iterate.source.trim(),
                iterate.item.trim(),
            ));
        }
        Ok(SubProcess {
            body: Arc::new(body),
            strict: def.strict,
            timeout: def.timeout_ms.map(Duration::from_millis),
        })
    }

    fn task(def: &TaskDefinition) -> ServiceTask {
        ServiceTask {
            service: def.service.clone(),
            instruct: def
                .instruct
                .as_ref()
                .map(|i| InstructContent::new(&i.name, &i.content)),
            property: def.property.as_ref().map(|p| match p {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            params: def.params.clone(),
            outputs: def.outputs.clone(),
            demotion: def.demotion.clone(),
            retry: def.retry,
            limit: def
                .limit
                .as_ref()
                .map(|l| ResourceLimit::new(l.permits, l.on_fail.clone())),
        }
    }
}
