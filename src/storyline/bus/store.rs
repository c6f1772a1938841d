// SPDX-License-Identifier: MIT

//! Shared storage behind the three scopes of a run

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::sync::Arc;

use super::scope::{get_in, set_in, ScopeKind, ScopePath};

/// Path-addressed, scope-qualified storage shared by the fragments of a run.
///
/// Cloning is cheap and shares every scope. [`ScopeDataBus::branch`] shares
/// `req` and `sta` but gives the branch its own copy of `var`, which
/// [`ScopeDataBus::merge_var_from`] folds back at a join.
#[derive(Debug, Clone)]
pub struct ScopeDataBus {
    req: Arc<RwLock<Value>>,
    sta: Arc<RwLock<Value>>,
    var: Arc<RwLock<Value>>,
    /// `var` as it was when this bus was branched off its parent
    origin: Option<Arc<Value>>,
}

impl ScopeDataBus {
    /// Create a bus for a fresh run with empty `sta` and `var`
    pub fn new(req: Value) -> Self {
        Self::with_scopes(req, Value::Object(Map::new()), Value::Object(Map::new()))
    }

    pub fn with_scopes(req: Value, sta: Value, var: Value) -> Self {
        Self {
            req: Arc::new(RwLock::new(req)),
            sta: Arc::new(RwLock::new(sta)),
            var: Arc::new(RwLock::new(var)),
            origin: None,
        }
    }

    fn cell(&self, kind: ScopeKind) -> &RwLock<Value> {
        match kind {
            ScopeKind::Req => &self.req,
            ScopeKind::Sta => &self.sta,
            ScopeKind::Var => &self.var,
        }
    }

    /// Read `path`; a scope qualifier in the path overrides `default`
    pub fn get(&self, default: ScopeKind, path: &str) -> Option<Value> {
        let path = ScopePath::parse(path)?;
        let guard = self.cell(path.resolve(default)).read();
        get_in(&guard, &path.segments).cloned()
    }

    /// Write `value` at `path`. Returns false for a malformed path, a target
    /// of the wrong shape, or an already written `sta` path.
    pub fn set(&self, default: ScopeKind, path: &str, value: Value) -> bool {
        let Some(path) = ScopePath::parse(path) else {
            log::debug!("Rejecting write to malformed path");
            return false;
        };
        let kind = path.resolve(default);
        let mut guard = self.cell(kind).write();

        if kind == ScopeKind::Sta {
            let occupied = get_in(&guard, &path.segments).is_some_and(|v| !v.is_null());
            if occupied {
                log::debug!("sta path already written, ignoring the new value");
                return false;
            }
        }
        set_in(&mut guard, &path.segments, value)
    }

    /// Copy of a whole scope
    pub fn snapshot(&self, kind: ScopeKind) -> Value {
        self.cell(kind).read().clone()
    }

    /// Bus for a concurrent branch: `req`/`sta` shared, `var` copied
    pub fn branch(&self) -> Self {
        let current = self.snapshot(ScopeKind::Var);
        Self {
            req: Arc::clone(&self.req),
            sta: Arc::clone(&self.sta),
            var: Arc::new(RwLock::new(current.clone())),
            origin: Some(Arc::new(current)),
        }
    }

    /// Whether both buses write to the same `var`
    pub fn shares_var(&self, other: &ScopeDataBus) -> bool {
        Arc::ptr_eq(&self.var, &other.var)
    }

    /// Fold the `var` changes a branch made since it was branched into this bus
    pub fn merge_var_from(&self, branch: &ScopeDataBus) {
        if self.shares_var(branch) {
            return;
        }
        let changed = branch.snapshot(ScopeKind::Var);
        let mut target = self.var.write();
        merge_changes(&mut target, &changed, branch.origin.as_deref());
    }
}

impl Default for ScopeDataBus {
    fn default() -> Self {
        Self::new(Value::Object(Map::new()))
    }
}

fn merge_changes(target: &mut Value, changed: &Value, base: Option<&Value>) {
    if base == Some(changed) {
        return;
    }
    match changed {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            let base_entries = base.and_then(Value::as_object);
            if let Value::Object(target_entries) = target {
                for (key, value) in entries {
                    let slot = target_entries.entry(key.clone()).or_insert(Value::Null);
                    merge_changes(slot, value, base_entries.and_then(|b| b.get(key)));
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip_each_scope() {
        let bus = ScopeDataBus::default();
        for kind in [ScopeKind::Req, ScopeKind::Sta, ScopeKind::Var] {
            assert!(bus.set(kind, "a.b[1]", json!({"x": 1})));
            assert_eq!(bus.get(kind, "a.b[1]"), Some(json!({"x": 1})));
        }
    }

    #[test]
    fn test_qualifier_overrides_default() {
        let bus = ScopeDataBus::new(json!({"amount": 150}));
        assert_eq!(bus.get(ScopeKind::Var, "req.amount"), Some(json!(150)));
        assert_eq!(bus.get(ScopeKind::Var, "amount"), None);

        assert!(bus.set(ScopeKind::Req, "var.total", json!(3)));
        assert_eq!(bus.get(ScopeKind::Var, "total"), Some(json!(3)));
        assert_eq!(bus.get(ScopeKind::Req, "total"), None);
    }

    #[test]
    fn test_scopes_do_not_leak() {
        let bus = ScopeDataBus::default();
        bus.set(ScopeKind::Var, "x", json!(1));
        assert_eq!(bus.get(ScopeKind::Sta, "x"), None);
        assert_eq!(bus.get(ScopeKind::Req, "x"), None);
    }

    #[test]
    fn test_sta_is_write_once() {
        let bus = ScopeDataBus::default();
        assert!(bus.set(ScopeKind::Sta, "result", json!(1)));
        assert!(!bus.set(ScopeKind::Sta, "result", json!(2)));
        assert_eq!(bus.get(ScopeKind::Sta, "result"), Some(json!(1)));

        // var is freely mutable
        assert!(bus.set(ScopeKind::Var, "result", json!(1)));
        assert!(bus.set(ScopeKind::Var, "result", json!(2)));
    }

    #[test]
    fn test_invalid_shape_returns_false() {
        let bus = ScopeDataBus::default();
        bus.set(ScopeKind::Var, "name", json!("text"));
        assert!(!bus.set(ScopeKind::Var, "name[0]", json!(1)));
        assert!(!bus.set(ScopeKind::Var, "a..b", json!(1)));

        bus.set(ScopeKind::Var, "list", json!([1, 2, 3]));
        assert!(!bus.set(ScopeKind::Var, "list[18446744073709551615]", json!(9)));
        assert_eq!(bus.get(ScopeKind::Var, "list"), Some(json!([1, 2, 3])));
    }

    #[test]
    fn test_branch_isolates_var() {
        let bus = ScopeDataBus::default();
        bus.set(ScopeKind::Var, "shared", json!(0));

        let branch = bus.branch();
        branch.set(ScopeKind::Var, "local", json!(1));
        branch.set(ScopeKind::Sta, "seen", json!(true));

        assert_eq!(bus.get(ScopeKind::Var, "local"), None);
        assert_eq!(bus.get(ScopeKind::Sta, "seen"), Some(json!(true)));
        assert_eq!(branch.get(ScopeKind::Var, "shared"), Some(json!(0)));
    }

    #[test]
    fn test_merge_only_applies_branch_changes() {
        let bus = ScopeDataBus::default();
        bus.set(ScopeKind::Var, "counter", json!(0));

        let left = bus.branch();
        let right = bus.branch();
        left.set(ScopeKind::Var, "counter", json!(1));
        right.set(ScopeKind::Var, "right.done", json!(true));

        bus.merge_var_from(&left);
        bus.merge_var_from(&right);

        // right never touched counter, so its stale copy does not win
        assert_eq!(
            bus.snapshot(ScopeKind::Var),
            json!({"counter": 1, "right": {"done": true}})
        );
    }

    #[test]
    fn test_merge_from_self_is_noop() {
        let bus = ScopeDataBus::default();
        bus.set(ScopeKind::Var, "a", json!(1));
        let same = bus.clone();
        bus.merge_var_from(&same);
        assert_eq!(bus.snapshot(ScopeKind::Var), json!({"a": 1}));
    }
}
