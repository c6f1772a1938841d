//! Engine configuration
//!
//! Read from `STORY_*` environment variables (after `dotenv`) or from a
//! YAML file. Unset or unparsable values keep their defaults.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::sdk::error::{ConfigError, StoryError};

/// What the run does after the first fragment failure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Cancel every other fragment of the run
    #[default]
    CancelRun,
    /// Record the error and let siblings finish
    Continue,
}

impl std::str::FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cancel_run" | "cancel" => Ok(FailurePolicy::CancelRun),
            "continue" => Ok(FailurePolicy::Continue),
            other => Err(ConfigError::Engine(format!("unknown failure policy '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fragments allowed to run at once
    pub max_workers: usize,
    /// Default run timeout in milliseconds
    pub story_timeout_ms: u64,
    /// Caller context keys with these prefixes stay with the caller
    pub ignore_copy_prefix: Vec<String>,
    /// Upper bound on context entries copied into a fragment
    pub max_context_entries: usize,
    pub failure_policy: FailurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 32,
            story_timeout_ms: 3000,
            ignore_copy_prefix: Vec::new(),
            max_context_entries: 64,
            failure_policy: FailurePolicy::CancelRun,
        }
    }
}

impl EngineConfig {
    /// Build from process environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup, e.g. a map in tests
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(workers) = parse_number(&lookup, "STORY_MAX_WORKERS") {
            config.max_workers = workers.max(1) as usize;
        }
        if let Some(timeout) = parse_number(&lookup, "STORY_TIMEOUT_MS") {
            config.story_timeout_ms = timeout;
        }
        if let Some(entries) = parse_number(&lookup, "STORY_MAX_CONTEXT_ENTRIES") {
            config.max_context_entries = entries as usize;
        }
        if let Some(prefixes) = lookup("STORY_IGNORE_COPY_PREFIX") {
            config.ignore_copy_prefix = prefixes
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(policy) = lookup("STORY_FAILURE_POLICY") {
            match policy.parse() {
                Ok(policy) => config.failure_policy = policy,
                Err(e) => log::warn!("Ignoring STORY_FAILURE_POLICY: {}", e),
            }
        }
        config
    }

    pub fn from_yaml(content: &str) -> Result<Self, StoryError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoryError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Engine("max_workers must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn story_timeout(&self) -> Duration {
        Duration::from_millis(self.story_timeout_ms)
    }
}

fn parse_number<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Invalid value '{}' for {}, using the default", raw, key);
            None
        }
    }
}
