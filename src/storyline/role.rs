//! Caller role and permission set

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Permissions held by the caller of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role {
    permissions: BTreeSet<String>,
}

impl Role {
    pub fn new<I, S>(permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            permissions: permissions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    /// True when the role holds at least one of `permissions`
    pub fn has_any<S: AsRef<str>>(&self, permissions: &[S]) -> bool {
        permissions.iter().any(|p| self.has(p.as_ref()))
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_any() {
        let role = Role::new(["admin", "audit"]);
        assert!(role.has("admin"));
        assert!(role.has_any(&["guest", "audit"]));
        assert!(!role.has_any(&["guest"]));
        assert!(!Role::default().has_any(&["admin"]));
    }

    #[test]
    fn test_deserialize_from_list() {
        let role: Role = serde_json::from_str(r#"["a", "b"]"#).unwrap();
        assert!(role.has("b"));
    }
}
