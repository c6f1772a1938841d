use async_trait::async_trait;
use serde_json::{Map, Value};
use std::error::Error;

use crate::sdk::instruct::InstructContent;
use crate::storyline::bus::{ScopeKind, ScopeOperator};

/// Everything a task service receives for one invocation
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// Id of the graph element being executed
    pub node_id: String,
    /// Declared input bindings, already resolved from the scope data bus
    pub params: Map<String, Value>,
    /// Read/write access to the run's scopes plus the task property payload
    pub operator: ScopeOperator,
    /// Instruct payload, when the element carries one
    pub instruct: Option<InstructContent>,
}

impl TaskRequest {
    /// Convenience accessor for a resolved parameter
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }
}

/// What a task service hands back to the engine
#[derive(Debug, Clone, Default, PartialEq)]
pub enum TaskOutcome {
    /// Nothing to write back
    #[default]
    Empty,
    /// A result written to the element's declared output bindings
    Value(Value),
    /// Named values written straight into one scope
    Notice(ScopeNotice),
}

/// A batch of values a task wants written into a single scope
///
/// ```
/// use serde_json::json;
/// use storyline_rs::sdk::task::ScopeNotice;
///
/// let notice = ScopeNotice::sta().notice("goods", json!({"id": 1}));
/// assert_eq!(notice.entries().len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeNotice {
    scope: ScopeKind,
    entries: Vec<(String, Value)>,
}

impl ScopeNotice {
    pub fn new(scope: ScopeKind) -> Self {
        Self {
            scope,
            entries: Vec::new(),
        }
    }

    pub fn sta() -> Self {
        Self::new(ScopeKind::Sta)
    }

    pub fn var() -> Self {
        Self::new(ScopeKind::Var)
    }

    /// Add a value under a path relative to the notice's scope
    pub fn notice(mut self, path: impl Into<String>, value: Value) -> Self {
        self.entries.push((path.into(), value));
        self
    }

    pub fn scope(&self) -> ScopeKind {
        self.scope
    }

    pub fn entries(&self) -> &[(String, Value)] {
        &self.entries
    }
}

/// Trait for externally registered task implementations.
///
/// Implementations are looked up by [`TaskService::name`] when a service
/// task element runs.
#[async_trait]
pub trait TaskService: Send + Sync {
    /// Returns the registration name (must be unique within a registry)
    fn name(&self) -> &str;

    /// Execute the task
    async fn invoke(&self, request: TaskRequest) -> Result<TaskOutcome, Box<dyn Error + Send + Sync>>;
}

type TaskFn =
    dyn Fn(TaskRequest) -> Result<TaskOutcome, Box<dyn Error + Send + Sync>> + Send + Sync;

/// A task service backed by a plain closure
pub struct FnTask {
    name: String,
    f: Box<TaskFn>,
}

impl FnTask {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskRequest) -> Result<TaskOutcome, Box<dyn Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

#[async_trait]
impl TaskService for FnTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: TaskRequest) -> Result<TaskOutcome, Box<dyn Error + Send + Sync>> {
        (self.f)(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storyline::bus::ScopeDataBus;
    use serde_json::json;

    fn request(params: Map<String, Value>) -> TaskRequest {
        TaskRequest {
            node_id: "task".to_string(),
            params,
            operator: ScopeOperator::new(ScopeDataBus::new(json!({})), None),
            instruct: None,
        }
    }

    #[test]
    fn test_scope_notice_builder() {
        let notice = ScopeNotice::var()
            .notice("a", json!(1))
            .notice("b.c", json!("x"));
        assert_eq!(notice.scope(), ScopeKind::Var);
        assert_eq!(notice.entries()[1], ("b.c".to_string(), json!("x")));
    }

    #[tokio::test]
    async fn test_fn_task_invokes_closure() {
        let task = FnTask::new("double", |req: TaskRequest| {
            let n = req.param("n").and_then(Value::as_i64).unwrap_or_default();
            Ok(TaskOutcome::Value(json!(n * 2)))
        });

        let mut params = Map::new();
        params.insert("n".to_string(), json!(21));

        assert_eq!(task.name(), "double");
        let outcome = task.invoke(request(params)).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Value(json!(42)));
    }

    #[tokio::test]
    async fn test_fn_task_propagates_error() {
        let task = FnTask::new("fail", |_req: TaskRequest| Err("nope".into()));
        let err = task.invoke(request(Map::new())).await.unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }
}
