// SPDX-License-Identifier: MIT

use crate::sdk::instruct::InstructAdapter;
use crate::sdk::task::TaskService;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Task services and instruct adapters, looked up by name at run time
#[derive(Clone)]
pub struct TaskRegistry {
    tasks: Arc<RwLock<HashMap<String, Arc<dyn TaskService>>>>,
    instructs: Arc<RwLock<HashMap<String, Arc<dyn InstructAdapter>>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            instructs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registry preloaded with the built-in `json` and `expr` instructs
    pub async fn with_builtin_instructs() -> Self {
        let registry = Self::new();
        crate::storyline::instruct::register_builtin(&registry).await;
        registry
    }

    pub async fn register(&self, task: Arc<dyn TaskService>) {
        let mut tasks = self.tasks.write().await;
        if tasks.insert(task.name().to_string(), task).is_some() {
            log::warn!("Replaced an already registered task service");
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn TaskService>> {
        let tasks = self.tasks.read().await;
        tasks.get(name).cloned()
    }

    pub async fn register_instruct(&self, adapter: Arc<dyn InstructAdapter>) {
        let mut instructs = self.instructs.write().await;
        instructs.insert(adapter.name().to_string(), adapter);
    }

    pub async fn get_instruct(&self, name: &str) -> Option<Arc<dyn InstructAdapter>> {
        let instructs = self.instructs.read().await;
        instructs.get(name).cloned()
    }

    pub async fn task_names(&self) -> Vec<String> {
        let tasks = self.tasks.read().await;
        let mut names: Vec<String> = tasks.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn instruct_names(&self) -> Vec<String> {
        let instructs = self.instructs.read().await;
        let mut names: Vec<String> = instructs.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
