use super::{PreheatContext, StartEventProcessor};
use crate::sdk::error::ConfigError;
use crate::storyline::flow::{walk, ProcessGraph};

/// Records how many arrivals each join waits for
pub struct AggregationProcessor;

impl StartEventProcessor for AggregationProcessor {
    fn name(&self) -> &str {
        "aggregation"
    }

    fn order(&self) -> i32 {
        30
    }

    fn process(
        &self,
        mut graph: ProcessGraph,
        _context: &PreheatContext,
    ) -> Result<ProcessGraph, ConfigError> {
        for idx in 0..graph.node_count() {
            let node = graph.node_mut(idx);
            node.required_incoming = if node.is_aggregating() {
                node.incoming().len()
            } else {
                usize::from(!node.incoming().is_empty())
            };
        }

        if let Some(start) = graph.start() {
            let walk = walk(&graph, start);
            for (idx, seen) in &walk.starved {
                let node = graph.node(*idx);
                log::warn!(
                    "Join '{}' in process '{}' can only see {} of {} arrivals",
                    node.id,
                    graph.id,
                    seen,
                    node.required_incoming
                );
            }
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storyline::flow::{NodeKind, ServiceTask};

    #[test]
    fn test_required_incoming_matches_arity() {
        let mut graph = ProcessGraph::new("p");
        let start = graph.add_node("start", NodeKind::Start);
        let gw = graph.add_node("gw", NodeKind::Exclusive);
        let a = graph.add_node("a", NodeKind::ServiceTask(ServiceTask::service("a")));
        let b = graph.add_node("b", NodeKind::ServiceTask(ServiceTask::service("b")));
        let end = graph.add_node("end", NodeKind::End);
        graph.connect("f1", start, gw, None, false);
        graph.connect("f2", gw, a, Some("x > 1".into()), false);
        graph.connect("f3", gw, b, None, true);
        graph.connect("f4", a, end, None, false);
        graph.connect("f5", b, end, None, false);

        let graph = AggregationProcessor
            .process(graph, &PreheatContext::default())
            .unwrap();
        assert_eq!(graph.node(end).required_incoming, 2);
        assert_eq!(graph.node(a).required_incoming, 1);
        assert_eq!(graph.node(start).required_incoming, 0);
    }
}
