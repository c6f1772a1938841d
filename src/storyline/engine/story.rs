// SPDX-License-Identifier: MIT

//! Story engine: registered stories and the `fire` entry point

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::context::FragmentContext;
use super::fragment::{FragmentReport, FragmentState, FragmentTask, RunEnv};
use super::handle::{FragmentStats, RunHandle};
use super::pool::WorkerPool;
use crate::sdk::error::{ConfigError, StoryError};
use crate::storyline::builder::GraphBuilder;
use crate::storyline::bus::{ScopeDataBus, ScopeKind};
use crate::storyline::condition::ConditionRegistry;
use crate::storyline::config::EngineConfig;
use crate::storyline::flow::ProcessGraph;
use crate::storyline::preheat::{PreheatContext, PreheatPipeline};
use crate::storyline::registry::TaskRegistry;
use crate::storyline::role::Role;
use crate::storyline::types::StoryDefinition;

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One invocation of a story
#[derive(Debug, Clone, Deserialize)]
pub struct StoryRequest {
    #[serde(default)]
    pub story_id: String,
    #[serde(default = "new_request_id")]
    pub request_id: String,
    #[serde(default = "empty_object")]
    pub req: Value,
    #[serde(default = "empty_object")]
    pub sta: Value,
    #[serde(default = "empty_object")]
    pub var: Value,
    #[serde(default)]
    pub role: Option<Role>,
    /// Caller context copied into every fragment
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Overrides the engine's default run timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// `sta` path returned as the run's result
    #[serde(default)]
    pub result_path: Option<String>,
}

impl StoryRequest {
    pub fn new(story_id: impl Into<String>, req: Value) -> Self {
        Self {
            story_id: story_id.into(),
            request_id: new_request_id(),
            req,
            sta: empty_object(),
            var: empty_object(),
            role: None,
            context: BTreeMap::new(),
            timeout_ms: None,
            result_path: None,
        }
    }

    pub fn with_var(mut self, var: Value) -> Self {
        self.var = var;
        self
    }

    pub fn with_sta(mut self, sta: Value) -> Self {
        self.sta = sta;
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_result_path(mut self, path: impl Into<String>) -> Self {
        self.result_path = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
    Cancelled,
}

#[derive(Debug, Serialize)]
pub struct StoryResult {
    pub request_id: String,
    pub story_id: String,
    pub status: RunStatus,
    #[serde(skip)]
    pub error: Option<StoryError>,
    pub result: Option<Value>,
    pub sta: Value,
    pub var: Value,
    /// Node ids visited, in order
    pub trace: Vec<String>,
    pub stats: FragmentStats,
    /// RFC 3339 start time
    pub started_at: String,
    pub elapsed_ms: u64,
}

impl StoryResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn to_json(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| empty_object());
        if let (Some(error), Value::Object(map)) = (&self.error, &mut value) {
            map.insert(
                "error".to_string(),
                serde_json::json!({"code": error.code(), "message": error.to_string()}),
            );
        }
        value
    }
}

/// Holds preheated stories and runs them
pub struct StoryEngine {
    config: Arc<EngineConfig>,
    registry: TaskRegistry,
    conditions: ConditionRegistry,
    pipeline: PreheatPipeline,
    pool: WorkerPool,
    stories: RwLock<HashMap<String, Arc<ProcessGraph>>>,
}

impl StoryEngine {
    pub fn new(config: EngineConfig, registry: TaskRegistry) -> Self {
        let pool = WorkerPool::new(config.max_workers);
        Self {
            config: Arc::new(config),
            registry,
            conditions: ConditionRegistry::new(),
            pipeline: PreheatPipeline::new(),
            pool,
            stories: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the condition matchers used to compile guards
    pub fn with_conditions(mut self, conditions: ConditionRegistry) -> Self {
        self.conditions = conditions;
        self
    }

    /// Replace the preheat passes
    pub fn with_pipeline(mut self, pipeline: PreheatPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Run every preheat pass against the registered components
    pub async fn preheat(&self, graph: ProcessGraph) -> Result<ProcessGraph, StoryError> {
        let context = PreheatContext::new(self.conditions.clone())
            .with_services(self.registry.task_names().await)
            .with_instructs(self.registry.instruct_names().await);
        Ok(self.pipeline.run(graph, &context)?)
    }

    pub async fn register_story(&self, definition: &StoryDefinition) -> Result<(), StoryError> {
        let graph = GraphBuilder::build(definition)?;
        self.register_graph(graph).await
    }

    pub async fn register_graph(&self, graph: ProcessGraph) -> Result<(), StoryError> {
        let graph = self.preheat(graph).await?;
        let id = graph.id.clone();
        let mut stories = self.stories.write().await;
        if stories.insert(id.clone(), Arc::new(graph)).is_some() {
            log::warn!("Story '{}' replaced", id);
        } else {
            log::info!("Story '{}' registered", id);
        }
        Ok(())
    }

    pub async fn story(&self, id: &str) -> Option<Arc<ProcessGraph>> {
        self.stories.read().await.get(id).cloned()
    }

    pub async fn story_ids(&self) -> Vec<String> {
        let stories = self.stories.read().await;
        let mut ids: Vec<String> = stories.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// A handle for `request`, usable to cancel the run while it is in flight
    pub fn new_handle(&self, request: &StoryRequest) -> Arc<RunHandle> {
        Arc::new(RunHandle::new(
            request.request_id.clone(),
            self.config.failure_policy,
        ))
    }

    pub async fn fire(&self, request: StoryRequest) -> Result<StoryResult, StoryError> {
        let handle = self.new_handle(&request);
        self.fire_with(request, handle).await
    }

    /// Run a story to completion, failure, cancellation or timeout
    pub async fn fire_with(
        &self,
        request: StoryRequest,
        handle: Arc<RunHandle>,
    ) -> Result<StoryResult, StoryError> {
        let graph = self
            .story(&request.story_id)
            .await
            .ok_or_else(|| StoryError::StoryNotFound(request.story_id.clone()))?;
        let entry = graph.start().ok_or_else(|| ConfigError::StartEvent {
            process_id: graph.id.clone(),
            found: graph.start_events().len(),
        })?;

        let StoryRequest {
            story_id,
            request_id,
            req,
            sta,
            var,
            role,
            context,
            timeout_ms,
            result_path,
        } = request;

        let timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.story_timeout());
        let bus = ScopeDataBus::with_scopes(req, sta, var);
        let env = Arc::new(RunEnv {
            registry: self.registry.clone(),
            pool: self.pool.clone(),
            handle: Arc::clone(&handle),
            role: role.map(Arc::new),
            context: FragmentContext::capture(
                &context,
                &self.config.ignore_copy_prefix,
                self.config.max_context_entries,
            ),
        });

        log::info!("Firing story '{}' as {}", story_id, request_id);
        let started_at = chrono::Utc::now().to_rfc3339();
        let started = Instant::now();
        let root = FragmentTask::new(
            handle.next_fragment_id(),
            graph,
            entry,
            bus.clone(),
            handle.root_token(),
            env,
        );
        let root_id = root.id.clone();
        let mut join = self.pool.spawn(root);

        let joined = match tokio::time::timeout(timeout, &mut join).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.error_notice(
                    StoryError::interrupted(format!(
                        "story '{}' timed out after {:?}",
                        story_id, timeout
                    )),
                    &root_id,
                );
                handle.cancel_all();
                join.await
            }
        };
        let report = joined.unwrap_or_else(|e| FragmentReport::aborted(&root_id, &e));

        let error = handle.take_error().or(report.error);
        let status = match (&error, report.state) {
            (Some(e), _) if e.is_interrupted() => RunStatus::Cancelled,
            (Some(_), _) => RunStatus::Error,
            (None, FragmentState::Success) => RunStatus::Success,
            (None, FragmentState::Cancelled) => RunStatus::Cancelled,
            (None, _) => RunStatus::Error,
        };
        let elapsed = started.elapsed();
        log::info!(
            "Story '{}' run {} finished {:?} in {:?}",
            story_id,
            request_id,
            status,
            elapsed
        );

        Ok(StoryResult {
            request_id,
            result: result_path.and_then(|path| bus.get(ScopeKind::Sta, &path)),
            sta: bus.snapshot(ScopeKind::Sta),
            var: bus.snapshot(ScopeKind::Var),
            story_id,
            status,
            error,
            trace: handle.trace(),
            stats: handle.stats(),
            started_at,
            elapsed_ms: elapsed.as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_defaults() {
        let request: StoryRequest =
            serde_json::from_value(json!({"story_id": "s", "req": {"a": 1}})).unwrap();
        assert_eq!(request.story_id, "s");
        assert!(!request.request_id.is_empty());
        assert_eq!(request.var, json!({}));
        assert!(request.role.is_none());
    }

    #[tokio::test]
    async fn test_unknown_story() {
        let engine = StoryEngine::new(EngineConfig::default(), TaskRegistry::new());
        let err = engine
            .fire(StoryRequest::new("missing", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoryError::StoryNotFound(_)));
    }

    #[test]
    fn test_result_json_carries_error_code() {
        let result = StoryResult {
            request_id: "r".to_string(),
            story_id: "s".to_string(),
            status: RunStatus::Error,
            error: Some(StoryError::other("boom")),
            result: None,
            sta: json!({}),
            var: json!({}),
            trace: vec![],
            stats: FragmentStats::default(),
            started_at: "2026-01-01T00:00:00+00:00".to_string(),
            elapsed_ms: 1,
        };
        let value = result.to_json();
        assert_eq!(value["status"], "error");
        assert_eq!(value["error"]["code"], "SYSTEM");
        assert_eq!(value["error"]["message"], "boom");
    }
}
