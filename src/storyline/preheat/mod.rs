// SPDX-License-Identifier: MIT

//! Preheat: graph transformation passes run once before first execution
//!
//! Each pass takes the graph of a start event and hands back the graph to
//! use from then on. Passes run in ascending order and recurse into
//! sub-process bodies. Any error aborts the whole pipeline, so a graph that
//! reaches the engine has gone through every pass.

mod aggregation;
mod expression;
mod rearrange;
mod verify;

pub use aggregation::AggregationProcessor;
pub use expression::ExpressionProcessor;
pub use rearrange::RearrangeProcessor;
pub use verify::VerifyProcessor;

use std::collections::HashSet;
use std::sync::Arc;

use crate::sdk::error::ConfigError;
use crate::storyline::condition::ConditionRegistry;
use crate::storyline::flow::ProcessGraph;

/// What passes may consult while transforming a graph
#[derive(Debug, Clone, Default)]
pub struct PreheatContext {
    pub conditions: ConditionRegistry,
    /// Registered task service names; `None` skips the check
    pub services: Option<HashSet<String>>,
    /// Registered instruct adapter names; `None` skips the check
    pub instructs: Option<HashSet<String>>,
}

impl PreheatContext {
    pub fn new(conditions: ConditionRegistry) -> Self {
        Self {
            conditions,
            services: None,
            instructs: None,
        }
    }

    pub fn with_services<I: IntoIterator<Item = String>>(mut self, names: I) -> Self {
        self.services = Some(names.into_iter().collect());
        self
    }

    pub fn with_instructs<I: IntoIterator<Item = String>>(mut self, names: I) -> Self {
        self.instructs = Some(names.into_iter().collect());
        self
    }
}

/// One transformation pass
pub trait StartEventProcessor: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first
    fn order(&self) -> i32;

    fn process(
        &self,
        graph: ProcessGraph,
        context: &PreheatContext,
    ) -> Result<ProcessGraph, ConfigError>;
}

/// Ordered list of passes
#[derive(Clone)]
pub struct PreheatPipeline {
    processors: Vec<Arc<dyn StartEventProcessor>>,
}

impl PreheatPipeline {
    /// Expression parse, rearrange, aggregation and verification
    pub fn new() -> Self {
        let mut pipeline = Self::empty();
        pipeline.register(Arc::new(ExpressionProcessor));
        pipeline.register(Arc::new(RearrangeProcessor));
        pipeline.register(Arc::new(AggregationProcessor));
        pipeline.register(Arc::new(VerifyProcessor));
        pipeline
    }

    pub fn empty() -> Self {
        Self {
            processors: Vec::new(),
        }
    }

    pub fn register(&mut self, processor: Arc<dyn StartEventProcessor>) {
        self.processors.push(processor);
        self.processors.sort_by_key(|p| p.order());
    }

    pub fn processor_names(&self) -> Vec<&str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    /// Run every pass over `graph` and its nested bodies
    pub fn run(
        &self,
        mut graph: ProcessGraph,
        context: &PreheatContext,
    ) -> Result<ProcessGraph, ConfigError> {
        for processor in &self.processors {
            log::debug!("Preheat pass '{}' on process '{}'", processor.name(), graph.id);
            graph = apply(processor.as_ref(), graph, context)?;
        }
        log::info!(
            "Process '{}' preheated: {} nodes, {} flows",
            graph.id,
            graph.node_count(),
            graph.flow_count()
        );
        Ok(graph)
    }
}

impl Default for PreheatPipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn apply(
    processor: &dyn StartEventProcessor,
    mut graph: ProcessGraph,
    context: &PreheatContext,
) -> Result<ProcessGraph, ConfigError> {
    for sub in graph.subprocesses_mut() {
        let body = Arc::make_mut(&mut sub.body);
        let taken = std::mem::take(body);
        *body = apply(processor, taken, context)?;
    }
    processor.process(graph, context)
}
