// SPDX-License-Identifier: MIT

//! Instruct adapters
//!
//! An instruct is a literal payload attached to a service task (a script, a
//! query, a JSON literal). The adapter registered under the instruct's name
//! executes it against the run's scopes. Whatever it returns is written by
//! the engine to each path listed in the task property's `return_target`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;

use crate::storyline::bus::ScopeOperator;

/// The instruct name and its payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructContent {
    /// Adapter name, e.g. `json` or `expr`
    pub instruct: String,
    /// Raw payload handed to the adapter
    pub content: String,
}

impl InstructContent {
    pub fn new(instruct: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            instruct: instruct.into(),
            content: content.into(),
        }
    }
}

/// Properties an instruct task may carry in its property payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstructProperty {
    /// Scope paths the adapter's result is written to, e.g. `["sta.v1", "var.v1"]`
    #[serde(default, alias = "returnTarget")]
    pub return_target: Vec<String>,
    /// Adapter specific data source / method hints
    #[serde(default, alias = "invokeSource")]
    pub invoke_source: Option<String>,
    #[serde(default, alias = "invokeMethod")]
    pub invoke_method: Option<String>,
}

impl InstructProperty {
    /// Parse the property payload; `None` when absent or malformed
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        let raw = raw?.trim();
        if raw.is_empty() {
            return None;
        }
        match serde_json::from_str(raw) {
            Ok(property) => Some(property),
            Err(e) => {
                log::warn!("Instruct property parsing failed, ignoring it. property: {}, error: {}", raw, e);
                None
            }
        }
    }
}

/// Trait for adapters that execute instruct payloads
#[async_trait]
pub trait InstructAdapter: Send + Sync {
    /// Instruct name this adapter answers to
    fn name(&self) -> &str;

    /// Execute the payload; the returned value goes to the declared targets
    async fn execute(
        &self,
        content: &InstructContent,
        operator: &ScopeOperator,
    ) -> Result<Option<Value>, Box<dyn Error + Send + Sync>>;
}
