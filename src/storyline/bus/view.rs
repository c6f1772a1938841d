//! Read and read/write handles over a [`ScopeDataBus`]

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::scope::ScopeKind;
use super::store::ScopeDataBus;
use crate::storyline::role::Role;

/// Read access handed to condition expressions.
///
/// Unqualified paths resolve against `req`.
#[derive(Debug, Clone, Copy)]
pub struct ScopeView<'a> {
    bus: &'a ScopeDataBus,
    role: Option<&'a Role>,
    default_scope: ScopeKind,
}

impl<'a> ScopeView<'a> {
    pub fn new(bus: &'a ScopeDataBus, role: Option<&'a Role>) -> Self {
        Self {
            bus,
            role,
            default_scope: ScopeKind::Req,
        }
    }

    pub fn with_default_scope(mut self, scope: ScopeKind) -> Self {
        self.default_scope = scope;
        self
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        self.bus.get(self.default_scope, path)
    }

    pub fn role(&self) -> Option<&'a Role> {
        self.role
    }
}

/// Read/write handle given to task services and instruct adapters.
///
/// Unqualified paths resolve against `var`.
#[derive(Debug, Clone)]
pub struct ScopeOperator {
    bus: ScopeDataBus,
    property: Option<String>,
    role: Option<Arc<Role>>,
    context: Arc<BTreeMap<String, String>>,
}

impl ScopeOperator {
    pub fn new(bus: ScopeDataBus, property: Option<String>) -> Self {
        Self {
            bus,
            property,
            role: None,
            context: Arc::default(),
        }
    }

    pub fn with_role(mut self, role: Option<Arc<Role>>) -> Self {
        self.role = role;
        self
    }

    /// Caller context values propagated into the running fragment
    pub fn with_context(mut self, context: Arc<BTreeMap<String, String>>) -> Self {
        self.context = context;
        self
    }

    pub fn context(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }

    pub fn get_data(&self, path: &str) -> Option<Value> {
        self.bus.get(ScopeKind::Var, path)
    }

    pub fn set_data(&self, path: &str, value: Value) -> bool {
        self.bus.set(ScopeKind::Var, path, value)
    }

    pub fn req(&self, path: &str) -> Option<Value> {
        self.bus.get(ScopeKind::Req, path)
    }

    pub fn sta(&self, path: &str) -> Option<Value> {
        self.bus.get(ScopeKind::Sta, path)
    }

    pub fn var(&self, path: &str) -> Option<Value> {
        self.bus.get(ScopeKind::Var, path)
    }

    /// Raw task property payload, if the element declared one
    pub fn task_property(&self) -> Option<&str> {
        self.property.as_deref()
    }

    /// Task property deserialized into `T`
    pub fn property_as<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_str(self.property.as_deref()?).ok()
    }

    pub fn role(&self) -> Option<&Role> {
        self.role.as_deref()
    }

    pub fn bus(&self) -> &ScopeDataBus {
        &self.bus
    }

    /// Condition view over the same scopes
    pub fn view(&self) -> ScopeView<'_> {
        ScopeView::new(&self.bus, self.role())
    }
}
