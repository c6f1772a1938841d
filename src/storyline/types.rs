// SPDX-License-Identifier: MIT

//! YAML schema types for story definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::storyline::engine::AcquireFailStrategy;

/// Top-level story definition
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoryDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub process: ProcessDefinition,
}

/// Elements and flows of one process (the story itself or a sub-process body)
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ProcessDefinition {
    pub elements: Vec<ElementDefinition>,
    #[serde(default)]
    pub flows: Vec<FlowDefinition>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ElementDefinition {
    pub id: String,
    /// For a sub-process start, may carry a loop as `name@collection-item`
    #[serde(default)]
    pub name: Option<String>,
    /// Task bound to a gateway, split into its own node at preheat
    #[serde(default)]
    pub attach: Option<TaskDefinition>,
    #[serde(flatten)]
    pub kind: ElementKind,
}

/// Element type, selected by the `type` key
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementKind {
    Start,
    End,
    Task(TaskDefinition),
    Exclusive,
    Inclusive {
        #[serde(default, rename = "async")]
        async_branches: bool,
    },
    SubProcess(SubProcessDefinition),
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TaskDefinition {
    /// Registered task service name
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub instruct: Option<InstructDefinition>,
    /// Free JSON payload handed to the service as a string
    #[serde(default)]
    pub property: Option<serde_json::Value>,
    /// Parameter name -> scope path
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Target scope path -> path inside the result
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub demotion: Option<String>,
    #[serde(default)]
    pub retry: u32,
    #[serde(default)]
    pub limit: Option<LimitDefinition>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InstructDefinition {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LimitDefinition {
    pub permits: usize,
    #[serde(default)]
    pub on_fail: AcquireFailStrategy,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SubProcessDefinition {
    /// Failures of a non-strict sub-process are logged and skipped
    #[serde(default = "default_strict")]
    pub strict: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub iterate: Option<IterateDefinition>,
    pub process: ProcessDefinition,
}

fn default_strict() -> bool {
    true
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IterateDefinition {
    pub source: String,
    pub item: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FlowDefinition {
    /// Generated from the endpoints when absent
    #[serde(default)]
    pub id: Option<String>,
    pub from: String,
    pub to: String,
    /// Guard expression
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub default: bool,
}
