//! What happens when a resource guarded step cannot get a permit

use serde::{Deserialize, Serialize};

/// Details handed to the strategy when the limiter rejects a step
#[derive(Debug, Clone)]
pub struct AcquireContext<'a> {
    pub node_id: &'a str,
    pub resource: &'a str,
    pub permits: usize,
    /// Demotion target declared on the task itself
    pub demotion: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireDecision {
    /// Skip the step and continue with its successors
    Ignore,
    /// Run this fallback service instead
    Demote(String),
    /// Fail the fragment
    Raise,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum AcquireFailStrategy {
    Ignore,
    Demote {
        /// Falls back to the task's own demotion when absent
        #[serde(default)]
        target: Option<String>,
    },
    #[default]
    Raise,
}

impl AcquireFailStrategy {
    pub fn on_failure(&self, context: &AcquireContext<'_>) -> AcquireDecision {
        let decision = match self {
            AcquireFailStrategy::Ignore => AcquireDecision::Ignore,
            AcquireFailStrategy::Demote { target } => {
                match target.as_deref().or(context.demotion) {
                    Some(target) => AcquireDecision::Demote(target.to_string()),
                    None => {
                        log::warn!(
                            "Node '{}' asked to demote but names no fallback, raising",
                            context.node_id
                        );
                        AcquireDecision::Raise
                    }
                }
            }
            AcquireFailStrategy::Raise => AcquireDecision::Raise,
        };
        log::info!(
            "Resource '{}' ({} permits) rejected node '{}': {:?}",
            context.resource,
            context.permits,
            context.node_id,
            decision
        );
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(demotion: Option<&str>) -> AcquireContext<'_> {
        AcquireContext {
            node_id: "task",
            resource: "task",
            permits: 1,
            demotion,
        }
    }

    #[test]
    fn test_decisions() {
        assert_eq!(
            AcquireFailStrategy::Ignore.on_failure(&context(None)),
            AcquireDecision::Ignore
        );
        assert_eq!(
            AcquireFailStrategy::Raise.on_failure(&context(Some("x"))),
            AcquireDecision::Raise
        );
    }

    #[test]
    fn test_demote_target_precedence() {
        let explicit = AcquireFailStrategy::Demote {
            target: Some("cheap".to_string()),
        };
        assert_eq!(
            explicit.on_failure(&context(Some("fallback"))),
            AcquireDecision::Demote("cheap".to_string())
        );

        let implicit = AcquireFailStrategy::Demote { target: None };
        assert_eq!(
            implicit.on_failure(&context(Some("fallback"))),
            AcquireDecision::Demote("fallback".to_string())
        );
        assert_eq!(implicit.on_failure(&context(None)), AcquireDecision::Raise);
    }

    #[test]
    fn test_deserialize_strategy() {
        let strategy: AcquireFailStrategy =
            serde_yaml::from_str("strategy: demote\ntarget: cheap").unwrap();
        assert_eq!(
            strategy,
            AcquireFailStrategy::Demote {
                target: Some("cheap".to_string())
            }
        );
        let strategy: AcquireFailStrategy = serde_yaml::from_str("strategy: ignore").unwrap();
        assert_eq!(strategy, AcquireFailStrategy::Ignore);
    }
}
