// SPDX-License-Identifier: MIT

//! Per-run handle shared by every fragment of one request

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

use super::context::FragmentContext;
use super::fragment::FragmentState;
use crate::sdk::error::StoryError;
use crate::storyline::config::FailurePolicy;

/// Fragment counters of one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FragmentStats {
    pub started: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Cancellation, first error and bookkeeping of a single run
pub struct RunHandle {
    request_id: String,
    root: CancellationToken,
    tokens: Mutex<HashMap<String, CancellationToken>>,
    first_error: Mutex<Option<StoryError>>,
    policy: FailurePolicy,
    trace: Mutex<Vec<String>>,
    contexts: Mutex<HashMap<String, FragmentContext>>,
    next_fragment: AtomicUsize,
    started: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
}

impl RunHandle {
    pub fn new(request_id: impl Into<String>, policy: FailurePolicy) -> Self {
        Self {
            request_id: request_id.into(),
            root: CancellationToken::new(),
            tokens: Mutex::new(HashMap::new()),
            first_error: Mutex::new(None),
            policy,
            trace: Mutex::new(Vec::new()),
            contexts: Mutex::new(HashMap::new()),
            next_fragment: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn root_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Token for a sub-tree of the run, cancelled along with `parent`
    pub fn child_token(&self, id: &str, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        self.tokens.lock().insert(id.to_string(), token.clone());
        token
    }

    /// Forget a finished sub-tree's token
    pub fn release_token(&self, id: &str) {
        self.tokens.lock().remove(id);
    }

    /// Sub-trees currently registered for cancellation
    pub fn live_tokens(&self) -> usize {
        self.tokens.lock().len()
    }

    /// Cancel one registered sub-tree. False when the id is unknown.
    pub fn cancel(&self, id: &str) -> bool {
        match self.tokens.lock().get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        log::info!("Cancelling run {}", self.request_id);
        self.root.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Report a fragment failure. Only the first error is kept.
    pub fn error_notice(&self, error: StoryError, fragment_id: &str) {
        {
            let mut first = self.first_error.lock();
            if first.is_some() {
                log::warn!(
                    "Run {} fragment {} failed after the first error: {}",
                    self.request_id,
                    fragment_id,
                    error
                );
                return;
            }
            log::error!(
                "Run {} fragment {} failed: {}",
                self.request_id,
                fragment_id,
                error
            );
            *first = Some(error);
        }
        if self.policy == FailurePolicy::CancelRun {
            self.cancel_all();
        }
    }

    pub fn take_error(&self) -> Option<StoryError> {
        self.first_error.lock().take()
    }

    pub fn has_error(&self) -> bool {
        self.first_error.lock().is_some()
    }

    pub fn record_visit(&self, node_id: &str) {
        self.trace.lock().push(node_id.to_string());
    }

    /// Node ids in the order fragments visited them
    pub fn trace(&self) -> Vec<String> {
        self.trace.lock().clone()
    }

    pub(crate) fn enter_context(&self, fragment_id: &str, context: FragmentContext) {
        self.contexts.lock().insert(fragment_id.to_string(), context);
    }

    pub(crate) fn leave_context(&self, fragment_id: &str) {
        self.contexts.lock().remove(fragment_id);
    }

    /// Fragments currently holding a propagated caller context
    pub fn active_contexts(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn next_fragment_id(&self) -> String {
        let n = self.next_fragment.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.request_id, n)
    }

    pub(crate) fn fragment_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fragment_finished(&self, state: FragmentState) {
        let counter = match state {
            FragmentState::Success => &self.succeeded,
            FragmentState::Error => &self.failed,
            FragmentState::Cancelled => &self.cancelled,
            FragmentState::Pending | FragmentState::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> FragmentStats {
        FragmentStats {
            started: self.started.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("request_id", &self.request_id)
            .field("cancelled", &self.is_cancelled())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_error_wins() {
        let handle = RunHandle::new("r", FailurePolicy::Continue);
        handle.error_notice(StoryError::other("first"), "r-0");
        handle.error_notice(StoryError::other("second"), "r-1");
        assert!(!handle.is_cancelled());
        assert_eq!(handle.take_error().map(|e| e.to_string()), Some("first".to_string()));
        assert!(handle.take_error().is_none());
    }

    #[test]
    fn test_cancel_run_policy() {
        let handle = RunHandle::new("r", FailurePolicy::CancelRun);
        let child = handle.child_token("sub", &handle.root_token());
        handle.error_notice(StoryError::other("boom"), "r-0");
        assert!(handle.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_cancel_subtree_only() {
        let handle = RunHandle::new("r", FailurePolicy::CancelRun);
        let child = handle.child_token("sub", &handle.root_token());
        assert!(handle.cancel("sub"));
        assert!(child.is_cancelled());
        assert!(!handle.is_cancelled());
        assert!(!handle.cancel("missing"));

        assert_eq!(handle.live_tokens(), 1);
        handle.release_token("sub");
        assert_eq!(handle.live_tokens(), 0);
        assert!(!handle.cancel("sub"));
    }

    #[test]
    fn test_stats_and_ids() {
        let handle = RunHandle::new("req", FailurePolicy::CancelRun);
        assert_eq!(handle.next_fragment_id(), "req-0");
        assert_eq!(handle.next_fragment_id(), "req-1");
        handle.fragment_started();
        handle.fragment_finished(FragmentState::Success);
        handle.fragment_finished(FragmentState::Running);
        let stats = handle.stats();
        assert_eq!(stats.started, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed + stats.cancelled, 0);
    }
}
