// SPDX-License-Identifier: MIT

//! Typed error handling for storyline-rs
//!
//! Load-time problems are [`ConfigError`]s and abort preheat. Run-time
//! failures raised by expressions, task services or instruct adapters are
//! [`InvocationError`]s carrying the node or instruct they came from.
//! Everything surfaces to callers as a [`StoryError`].

use thiserror::Error;

/// Top-level error type for storyline-rs
#[derive(Debug, Error)]
pub enum StoryError {
    /// Malformed graph, unmatched expression, unsupported attachment site
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An expression, task service or instruct adapter failed
    #[error("Invocation error: {0}")]
    Invocation(#[from] InvocationError),

    /// The run (or the sub-tree this fragment belongs to) was cancelled
    #[error("Story interrupted: {0}")]
    Interrupted(String),

    /// A resource guard rejected the step and the strategy asked to raise
    #[error("Failed to acquire resource '{resource}' for node '{node_id}'")]
    ResourceAcquire { resource: String, node_id: String },

    /// Story id is not registered with the engine
    #[error("Story '{0}' not found")]
    StoryNotFound(String),

    /// I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error wrapper for compatibility
    #[error("{0}")]
    Other(String),
}

/// Load-time errors raised while building or preheating a graph
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    /// No registered matcher accepted the guard text
    #[error("No condition matcher accepts expression '{raw}' (expression starts at offset {offset})")]
    UnmatchedExpression { raw: String, offset: usize },

    /// The script matcher accepted the guard but it does not parse
    #[error("Invalid expression '{raw}': {message}")]
    ExpressionSyntax { raw: String, message: String },

    /// A guard on a flow could not be compiled
    #[error("Invalid guard on flow '{flow_id}': {source}")]
    InvalidGuard {
        flow_id: String,
        #[source]
        source: Box<ConfigError>,
    },

    /// A guard was evaluated before the expression pass compiled it
    #[error("Guard on flow '{0}' was never compiled")]
    UncompiledGuard(String),

    /// A task is attached to an element that cannot carry one
    #[error("Element '{node_id}' of kind {kind} cannot carry an attached task")]
    UnsupportedAttachment { node_id: String, kind: String },

    /// Two elements or flows share an id
    #[error("Duplicate element id: {0}")]
    DuplicateId(String),

    /// A flow references an element that does not exist
    #[error("Flow '{flow_id}' references unknown element '{element_id}'")]
    UnknownElement { flow_id: String, element_id: String },

    /// The process has no start event, or more than one
    #[error("Process '{process_id}' must have exactly one start event, found {found}")]
    StartEvent { process_id: String, found: usize },

    /// Structural rule broken (arity, reachability, default flow placement)
    #[error("Process '{process_id}' violates structure at '{node_id}': {message}")]
    Violation {
        process_id: String,
        node_id: String,
        message: String,
    },

    /// A service task names a task service nobody registered
    #[error("Element '{node_id}' references unregistered task service '{service}'")]
    UnknownService { node_id: String, service: String },

    /// A service task names an instruct adapter nobody registered
    #[error("Element '{node_id}' references unregistered instruct '{instruct}'")]
    UnknownInstruct { node_id: String, instruct: String },

    /// An iteration directive (`name@collection-item`) is malformed
    #[error("Invalid iteration directive '{0}', expected 'name@collection-item'")]
    IterationDirective(String),

    /// Engine configuration problems
    #[error("Invalid engine configuration: {0}")]
    Engine(String),
}

/// Run-time errors raised while a fragment traverses the graph
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InvocationError {
    /// A condition expression threw while being evaluated
    #[error("Expression '{expression}' failed: {message}")]
    Expression { expression: String, message: String },

    /// A task service returned an error
    #[error("Task '{service}' failed at node '{node_id}': {message}")]
    Task {
        node_id: String,
        service: String,
        message: String,
    },

    /// An instruct adapter returned an error
    #[error("Instruct '{instruct}' failed at node '{node_id}': {message}\n{content}")]
    Instruct {
        node_id: String,
        instruct: String,
        content: String,
        message: String,
    },

    /// No guard matched at an exclusive gateway and no default flow exists
    #[error("Exclusive gateway '{0}' has no matching flow and no default flow")]
    NoMatchingFlow(String),

    /// A task service or instruct adapter disappeared from the registry
    #[error("Component '{name}' required by node '{node_id}' is not registered")]
    MissingComponent { node_id: String, name: String },

    /// A spawned fragment panicked or was aborted
    #[error("Fragment '{0}' terminated abnormally: {1}")]
    Fragment(String, String),
}

impl StoryError {
    /// Create an interrupted error
    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::Interrupted(message.into())
    }

    /// Create from a generic error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Whether this error means the run was cancelled rather than failed
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }

    /// Short machine-friendly code, used by the HTTP surface and in logs
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIGURATION",
            Self::Invocation(_) => "INVOCATION",
            Self::Interrupted(_) => "INTERRUPTED",
            Self::ResourceAcquire { .. } => "RESOURCE_ACQUIRE",
            Self::StoryNotFound(_) => "STORY_NOT_FOUND",
            Self::Io(_) | Self::Json(_) | Self::Yaml(_) | Self::Other(_) => "SYSTEM",
        }
    }
}

// Allow conversion from &str for backward compatibility
impl From<&str> for StoryError {
    fn from(s: &str) -> Self {
        Self::Other(s.to_string())
    }
}

impl From<String> for StoryError {
    fn from(s: String) -> Self {
        Self::Other(s)
    }
}

// Convert from Box<dyn Error> for compatibility
impl From<Box<dyn std::error::Error + Send + Sync>> for StoryError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::Other(err.to_string())
    }
}
