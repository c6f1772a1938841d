// SPDX-License-Identifier: MIT

//! Fragments: the unit of concurrent execution
//!
//! A fragment walks part of a graph on one worker slot. The root fragment
//! of a run starts at the story's start event; sub-processes, loop
//! iterations and async gateway branches each get a fragment of their own.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Barrier;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use super::context::{ContextScope, FragmentContext};
use super::handle::RunHandle;
use super::pool::{WorkerPool, WorkerSlot};
use super::traversal::{checkpoint, traverse, Cursor};
use crate::sdk::error::{InvocationError, StoryError};
use crate::storyline::bus::{ScopeDataBus, ScopeKind};
use crate::storyline::flow::{IterationDirective, NodeIdx, ProcessGraph};
use crate::storyline::registry::TaskRegistry;
use crate::storyline::role::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentState {
    Pending,
    Running,
    Success,
    Error,
    Cancelled,
}

/// Where a fragment's failure goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentMode {
    /// Report to the run handle (root and async branches)
    Report,
    /// Hand back to the awaiting parent (sub-processes and loop bodies)
    Return,
}

/// What every fragment of a run shares
pub struct RunEnv {
    pub registry: TaskRegistry,
    pub pool: WorkerPool,
    pub handle: Arc<RunHandle>,
    pub role: Option<Arc<Role>>,
    pub context: FragmentContext,
}

pub struct FragmentTask {
    pub id: String,
    pub graph: Arc<ProcessGraph>,
    pub entry: NodeIdx,
    /// Whether reaching `entry` counts as an arrival at a join
    pub arriving: bool,
    /// Loop over the graph's iteration directive instead of a single pass
    pub iterate: bool,
    pub bus: ScopeDataBus,
    pub token: CancellationToken,
    pub mode: FragmentMode,
    /// Branches of one async wave start together
    pub wave: Option<Arc<Barrier>>,
    pub cursor: Cursor,
    pub env: Arc<RunEnv>,
}

#[derive(Debug)]
pub struct FragmentReport {
    pub id: String,
    pub state: FragmentState,
    /// Set in [`FragmentMode::Return`], and for cancelled fragments in either mode
    pub error: Option<StoryError>,
}

impl FragmentReport {
    /// Report for a fragment whose task panicked or was aborted
    pub fn aborted(id: &str, error: &JoinError) -> Self {
        Self {
            id: id.to_string(),
            state: FragmentState::Error,
            error: Some(InvocationError::Fragment(id.to_string(), error.to_string()).into()),
        }
    }

    pub fn into_result(self) -> Result<(), StoryError> {
        match (self.state, self.error) {
            (FragmentState::Success, _) => Ok(()),
            (_, Some(error)) => Err(error),
            (FragmentState::Cancelled, None) => Err(StoryError::interrupted(format!(
                "fragment {} cancelled",
                self.id
            ))),
            (state, None) => Err(InvocationError::Fragment(self.id, format!("{:?}", state)).into()),
        }
    }
}

impl FragmentTask {
    pub fn new(
        id: String,
        graph: Arc<ProcessGraph>,
        entry: NodeIdx,
        bus: ScopeDataBus,
        token: CancellationToken,
        env: Arc<RunEnv>,
    ) -> Self {
        Self {
            id,
            graph,
            entry,
            arriving: false,
            iterate: true,
            bus,
            token,
            mode: FragmentMode::Report,
            wave: None,
            cursor: Cursor::new(),
            env,
        }
    }

    /// Return-mode fragment over `graph` sharing this fragment's bus and token
    pub fn child(&self, graph: Arc<ProcessGraph>, entry: NodeIdx) -> Self {
        Self {
            id: self.env.handle.next_fragment_id(),
            graph,
            entry,
            arriving: false,
            iterate: false,
            bus: self.bus.clone(),
            token: self.token.clone(),
            mode: FragmentMode::Return,
            wave: None,
            cursor: Cursor::new(),
            env: Arc::clone(&self.env),
        }
    }

    pub fn run(self) -> BoxFuture<'static, FragmentReport> {
        async move {
            let handle = Arc::clone(&self.env.handle);
            let _context = ContextScope::enter(
                Arc::clone(&handle),
                &self.id,
                self.env.context.clone(),
            );

            if let Some(wave) = &self.wave {
                wave.wait().await;
            }
            let mut slot = match self.env.pool.acquire().await {
                Ok(slot) => slot,
                Err(e) => return self.finish(Err(e)),
            };
            if self.token.is_cancelled() {
                log::debug!("Fragment {} cancelled before it started", self.id);
                drop(slot);
                return self.finish(Err(StoryError::interrupted(format!(
                    "fragment {} cancelled",
                    self.id
                ))));
            }

            handle.fragment_started();
            log::debug!(
                "Fragment {} running '{}' from '{}'",
                self.id,
                self.graph.id,
                self.graph.node(self.entry).id
            );
            let result = match (self.iterate, &self.graph.iteration) {
                (true, Some(directive)) => self.run_loop(directive, &mut slot).await,
                _ => traverse(&self, &mut slot).await,
            };
            drop(slot);
            self.finish(result)
        }
        .boxed()
    }

    fn finish(&self, result: Result<(), StoryError>) -> FragmentReport {
        let handle = &self.env.handle;
        let (state, error) = match result {
            Ok(()) => (FragmentState::Success, None),
            Err(e) if e.is_interrupted() => (FragmentState::Cancelled, Some(e)),
            Err(e) => (FragmentState::Error, Some(e)),
        };
        handle.fragment_finished(state);

        let error = match (self.mode, state, error) {
            (FragmentMode::Report, FragmentState::Error, Some(e)) => {
                handle.error_notice(e, &self.id);
                None
            }
            // A sub-tree interruption (e.g. a strict sub-process timeout) is
            // this run's first error unless the whole run was cancelled
            (FragmentMode::Report, FragmentState::Cancelled, Some(e)) => {
                if let (StoryError::Interrupted(message), false) = (&e, handle.is_cancelled()) {
                    handle.error_notice(StoryError::interrupted(message.clone()), &self.id);
                }
                Some(e)
            }
            (FragmentMode::Report, _, _) => None,
            (FragmentMode::Return, _, error) => error,
        };
        log::debug!("Fragment {} finished: {:?}", self.id, state);
        FragmentReport {
            id: self.id.clone(),
            state,
            error,
        }
    }

    /// Run the body once per element of the directive's collection
    async fn run_loop(
        &self,
        directive: &IterationDirective,
        slot: &mut WorkerSlot,
    ) -> Result<(), StoryError> {
        let elements = match self.bus.get(ScopeKind::Var, &directive.source) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(single) => vec![single],
        };
        let marker = directive.marker();
        let item = directive.item.as_str();
        self.bus.set(ScopeKind::Var, &marker, Value::Null);

        let size = elements.len();
        log::debug!(
            "Fragment {} iterating {} elements of '{}'",
            self.id,
            size,
            directive.source
        );
        for (index, element) in elements.into_iter().enumerate() {
            checkpoint(self)?;
            if self.bus.get(ScopeKind::Var, &marker) == Some(Value::Bool(false)) {
                log::info!(
                    "Loop over '{}' stopped before element {}",
                    directive.source,
                    index
                );
                break;
            }
            let status = json!({
                "index": index,
                "size": size,
                "last": index + 1 == size,
                "data": element.clone(),
            });
            self.bus.set(ScopeKind::Var, &marker, status);
            self.bus.set(ScopeKind::Var, item, element);

            let mut body = self.child(Arc::clone(&self.graph), self.entry);
            body.cursor = self.cursor.fork();
            let body_id = body.id.clone();
            let join = self.env.pool.spawn(body);
            let report = slot
                .release_while(join)
                .await?
                .unwrap_or_else(|e| FragmentReport::aborted(&body_id, &e));
            report.into_result()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storyline::config::FailurePolicy;
    use crate::storyline::flow::NodeKind;

    fn env(handle: Arc<RunHandle>) -> Arc<RunEnv> {
        Arc::new(RunEnv {
            registry: TaskRegistry::new(),
            pool: WorkerPool::new(2),
            handle,
            role: None,
            context: FragmentContext::default(),
        })
    }

    fn line() -> Arc<ProcessGraph> {
        let mut graph = ProcessGraph::new("line");
        let start = graph.add_node("start", NodeKind::Start);
        let end = graph.add_node("end", NodeKind::End);
        graph.connect("f1", start, end, None, false);
        graph.node_mut(end).required_incoming = 1;
        Arc::new(graph)
    }

    #[tokio::test]
    async fn test_fragment_success() {
        let handle = Arc::new(RunHandle::new("r", FailurePolicy::CancelRun));
        let task = FragmentTask::new(
            handle.next_fragment_id(),
            line(),
            0,
            ScopeDataBus::default(),
            handle.root_token(),
            env(Arc::clone(&handle)),
        );
        let report = task.run().await;
        assert_eq!(report.state, FragmentState::Success);
        assert_eq!(handle.trace(), vec!["start", "end"]);
        assert_eq!(handle.stats().started, 1);
        assert_eq!(handle.active_contexts(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let handle = Arc::new(RunHandle::new("r", FailurePolicy::CancelRun));
        handle.cancel_all();
        let task = FragmentTask::new(
            handle.next_fragment_id(),
            line(),
            0,
            ScopeDataBus::default(),
            handle.root_token(),
            env(Arc::clone(&handle)),
        );
        let report = task.run().await;
        assert_eq!(report.state, FragmentState::Cancelled);
        assert_eq!(handle.stats().started, 0);
        assert!(handle.trace().is_empty());
        assert!(report.error.is_some_and(|e| e.is_interrupted()));
        // Run-wide cancellation is not recorded as a failure
        assert!(!handle.has_error());
    }

    #[tokio::test]
    async fn test_subtree_cancellation_is_reported() {
        let handle = Arc::new(RunHandle::new("r", FailurePolicy::Continue));
        let subtree = handle.child_token("sub", &handle.root_token());
        subtree.cancel();
        let task = FragmentTask::new(
            handle.next_fragment_id(),
            line(),
            0,
            ScopeDataBus::default(),
            subtree,
            env(Arc::clone(&handle)),
        );
        let report = task.run().await;
        assert_eq!(report.state, FragmentState::Cancelled);
        assert!(!handle.is_cancelled());
        assert!(handle.take_error().is_some_and(|e| e.is_interrupted()));
    }

    #[test]
    fn test_report_into_result() {
        let ok = FragmentReport {
            id: "a".to_string(),
            state: FragmentState::Success,
            error: None,
        };
        assert!(ok.into_result().is_ok());

        let cancelled = FragmentReport {
            id: "b".to_string(),
            state: FragmentState::Cancelled,
            error: None,
        };
        assert!(cancelled.into_result().unwrap_err().is_interrupted());
    }
}
