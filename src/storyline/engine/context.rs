//! Caller context propagation into fragments

use std::collections::BTreeMap;
use std::sync::Arc;

use super::handle::RunHandle;

/// Caller context entries copied into a fragment
#[derive(Debug, Clone, Default)]
pub struct FragmentContext {
    entries: Arc<BTreeMap<String, String>>,
}

impl FragmentContext {
    /// Copy `source`, skipping keys with an ignored prefix, up to `limit` entries
    pub fn capture(
        source: &BTreeMap<String, String>,
        ignore_prefixes: &[String],
        limit: usize,
    ) -> Self {
        let entries: BTreeMap<String, String> = source
            .iter()
            .filter(|(key, _)| !ignore_prefixes.iter().any(|p| key.starts_with(p.as_str())))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if entries.len() == limit && source.len() > limit {
            log::debug!("Caller context truncated to {} entries", limit);
        }
        Self {
            entries: Arc::new(entries),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> Arc<BTreeMap<String, String>> {
        Arc::clone(&self.entries)
    }
}

/// Installs a fragment's context on the run handle and removes it on drop,
/// whether the fragment finished, failed or was cancelled
pub struct ContextScope {
    handle: Arc<RunHandle>,
    fragment_id: String,
}

impl ContextScope {
    pub fn enter(handle: Arc<RunHandle>, fragment_id: &str, context: FragmentContext) -> Self {
        handle.enter_context(fragment_id, context);
        Self {
            handle,
            fragment_id: fragment_id.to_string(),
        }
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        self.handle.leave_context(&self.fragment_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storyline::config::FailurePolicy;

    fn source() -> BTreeMap<String, String> {
        [("tenant", "acme"), ("trace-id", "t1"), ("user", "ann")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_capture_filters_prefixes() {
        let context = FragmentContext::capture(&source(), &["trace-".to_string()], 10);
        assert_eq!(context.len(), 2);
        assert_eq!(context.get("tenant"), Some("acme"));
        assert_eq!(context.get("trace-id"), None);
    }

    #[test]
    fn test_capture_limit() {
        let context = FragmentContext::capture(&source(), &[], 1);
        assert_eq!(context.len(), 1);
        assert!(FragmentContext::capture(&source(), &[], 0).is_empty());
    }

    #[test]
    fn test_scope_removes_on_drop() {
        let handle = Arc::new(RunHandle::new("r", FailurePolicy::CancelRun));
        {
            let _scope = ContextScope::enter(
                Arc::clone(&handle),
                "r-0",
                FragmentContext::capture(&source(), &[], 10),
            );
            assert_eq!(handle.active_contexts(), 1);
        }
        assert_eq!(handle.active_contexts(), 0);
    }
}
