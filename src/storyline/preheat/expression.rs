use super::{PreheatContext, StartEventProcessor};
use crate::sdk::error::ConfigError;
use crate::storyline::flow::ProcessGraph;

/// Compiles every guard string into a condition expression
pub struct ExpressionProcessor;

impl StartEventProcessor for ExpressionProcessor {
    fn name(&self) -> &str {
        "expression"
    }

    fn order(&self) -> i32 {
        10
    }

    fn process(
        &self,
        mut graph: ProcessGraph,
        context: &PreheatContext,
    ) -> Result<ProcessGraph, ConfigError> {
        let mut compiled = 0;
        for flow in graph.flows_mut() {
            let Some(guard) = flow.guard.as_mut() else {
                continue;
            };
            if guard.compiled.is_some() {
                continue;
            }
            let expression =
                context
                    .conditions
                    .compile(&guard.raw)
                    .map_err(|e| ConfigError::InvalidGuard {
                        flow_id: flow.id.clone(),
                        source: Box::new(e),
                    })?;
            guard.compiled = Some(expression);
            compiled += 1;
        }
        log::debug!("Compiled {} guards in process '{}'", compiled, graph.id);
        Ok(graph)
    }
}
