// SPDX-License-Identifier: MIT

//! Condition matchers and the registry that picks one per guard
//!
//! A raw guard is compiled once, at preheat. The registry strips an optional
//! numeric `order:` prefix, then an optional alias prefix naming a matcher
//! outright, then asks each matcher in turn whether it accepts the text.
//! Matchers go most specific first; the script matcher accepts anything and
//! is always kept last.

use once_cell::sync::Lazy;
use std::fmt;
use std::sync::Arc;

use super::ast::Expression;
use super::evaluator::evaluate;
use super::parser::parse;
use crate::sdk::error::{ConfigError, InvocationError};
use crate::storyline::bus::ScopeView;

pub type CustomPredicate = dyn Fn(&ScopeView<'_>) -> Result<bool, InvocationError> + Send + Sync;

/// How a compiled guard decides
#[derive(Clone)]
pub enum CompiledCondition {
    Literal(bool),
    /// True when the caller's role holds any of these permissions
    Role(Vec<String>),
    Script(Expression),
    Custom(Arc<CustomPredicate>),
}

impl CompiledCondition {
    /// Wrap a predicate supplied by a custom matcher
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&ScopeView<'_>) -> Result<bool, InvocationError> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(predicate))
    }
}

impl fmt::Debug for CompiledCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(b) => f.debug_tuple("Literal").field(b).finish(),
            Self::Role(permissions) => f.debug_tuple("Role").field(permissions).finish(),
            Self::Script(expr) => f.debug_tuple("Script").field(expr).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A guard compiled by exactly one matcher
#[derive(Debug, Clone)]
pub struct ConditionExpression {
    raw: String,
    text: String,
    order: Option<i32>,
    matcher: String,
    kind: CompiledCondition,
}

impl ConditionExpression {
    pub fn new(
        raw: impl Into<String>,
        text: impl Into<String>,
        order: Option<i32>,
        matcher: impl Into<String>,
        kind: CompiledCondition,
    ) -> Self {
        Self {
            raw: raw.into(),
            text: text.into(),
            order,
            matcher: matcher.into(),
            kind,
        }
    }

    /// The guard as written on the flow
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The guard with order and alias prefixes removed
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Evaluation priority at an exclusive gateway
    pub fn order(&self) -> Option<i32> {
        self.order
    }

    pub fn matcher(&self) -> &str {
        &self.matcher
    }

    pub fn kind(&self) -> &CompiledCondition {
        &self.kind
    }

    pub fn evaluate(&self, view: &ScopeView<'_>) -> Result<bool, InvocationError> {
        match &self.kind {
            CompiledCondition::Literal(value) => Ok(*value),
            CompiledCondition::Role(permissions) => {
                Ok(view.role().is_some_and(|role| role.has_any(permissions)))
            }
            CompiledCondition::Script(expr) => {
                evaluate(expr, view).map_err(|message| InvocationError::Expression {
                    expression: self.raw.clone(),
                    message,
                })
            }
            CompiledCondition::Custom(predicate) => predicate(view),
        }
    }
}

/// One expression kind the registry can compile
pub trait ConditionMatcher: Send + Sync {
    fn name(&self) -> &str;

    /// Prefix (without the colon) that selects this matcher directly
    fn alias(&self) -> Option<&str> {
        None
    }

    /// Whether this matcher accepts the stripped text
    fn matches(&self, text: &str) -> bool;

    /// Whether `build` has to parse the text
    fn needs_parse(&self) -> bool {
        false
    }

    fn build(
        &self,
        raw: &str,
        text: &str,
        order: Option<i32>,
        needs_parse: bool,
    ) -> Result<ConditionExpression, ConfigError>;
}

/// `true` / `false`
pub struct BooleanMatcher;

impl ConditionMatcher for BooleanMatcher {
    fn name(&self) -> &str {
        "boolean"
    }

    fn alias(&self) -> Option<&str> {
        Some("b")
    }

    fn matches(&self, text: &str) -> bool {
        let text = text.trim();
        text.eq_ignore_ascii_case("true") || text.eq_ignore_ascii_case("false")
    }

    fn build(
        &self,
        raw: &str,
        text: &str,
        order: Option<i32>,
        _needs_parse: bool,
    ) -> Result<ConditionExpression, ConfigError> {
        let value = match text.trim().to_ascii_lowercase().as_str() {
            "true" => true,
            "false" => false,
            _ => {
                return Err(ConfigError::ExpressionSyntax {
                    raw: raw.to_string(),
                    message: "expected 'true' or 'false'".to_string(),
                })
            }
        };
        Ok(ConditionExpression::new(
            raw,
            text,
            order,
            self.name(),
            CompiledCondition::Literal(value),
        ))
    }
}

/// `r:perm1,perm2`, true when the caller holds any listed permission
pub struct RoleMatcher;

impl ConditionMatcher for RoleMatcher {
    fn name(&self) -> &str {
        "role"
    }

    fn matches(&self, text: &str) -> bool {
        text.trim_start().starts_with("r:")
    }

    fn build(
        &self,
        raw: &str,
        text: &str,
        order: Option<i32>,
        _needs_parse: bool,
    ) -> Result<ConditionExpression, ConfigError> {
        let list = text.trim_start().trim_start_matches("r:");
        let permissions: Vec<String> = list
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();
        if permissions.is_empty() {
            return Err(ConfigError::ExpressionSyntax {
                raw: raw.to_string(),
                message: "role expression lists no permission".to_string(),
            });
        }
        Ok(ConditionExpression::new(
            raw,
            text,
            order,
            self.name(),
            CompiledCondition::Role(permissions),
        ))
    }
}

/// General expression language; accepts everything
pub struct ScriptMatcher;

impl ConditionMatcher for ScriptMatcher {
    fn name(&self) -> &str {
        "script"
    }

    fn alias(&self) -> Option<&str> {
        Some("s")
    }

    fn matches(&self, _text: &str) -> bool {
        true
    }

    fn needs_parse(&self) -> bool {
        true
    }

    fn build(
        &self,
        raw: &str,
        text: &str,
        order: Option<i32>,
        needs_parse: bool,
    ) -> Result<ConditionExpression, ConfigError> {
        let expr = if needs_parse {
            parse(text).map_err(|e| ConfigError::ExpressionSyntax {
                raw: raw.to_string(),
                message: e.to_string(),
            })?
        } else {
            Expression::True
        };
        Ok(ConditionExpression::new(
            raw,
            text,
            order,
            self.name(),
            CompiledCondition::Script(expr),
        ))
    }
}

/// Ordered list of condition matchers
#[derive(Clone)]
pub struct ConditionRegistry {
    matchers: Vec<Arc<dyn ConditionMatcher>>,
}

impl ConditionRegistry {
    /// Registry with the boolean, role and script matchers
    pub fn new() -> Self {
        Self {
            matchers: vec![
                Arc::new(BooleanMatcher),
                Arc::new(RoleMatcher),
                Arc::new(ScriptMatcher),
            ],
        }
    }

    /// Registry without any matcher, not even the catch-all
    pub fn empty() -> Self {
        Self {
            matchers: Vec::new(),
        }
    }

    /// Add a matcher ahead of the trailing catch-all, if there is one
    pub fn register(&mut self, matcher: Arc<dyn ConditionMatcher>) {
        let catch_all = self
            .matchers
            .last()
            .is_some_and(|last| last.name() == ScriptMatcher.name());
        if catch_all {
            let at = self.matchers.len() - 1;
            self.matchers.insert(at, matcher);
        } else {
            self.matchers.push(matcher);
        }
    }

    pub fn matcher_names(&self) -> Vec<String> {
        self.matchers.iter().map(|m| m.name().to_string()).collect()
    }

    /// Compile a raw guard string
    pub fn compile(&self, raw: &str) -> Result<ConditionExpression, ConfigError> {
        let mut offset = raw.len() - raw.trim_start().len();
        let mut text = raw.trim();
        let mut order = None;

        if let Some((prefix, rest)) = text.split_once(':') {
            if let Ok(priority) = prefix.trim().parse::<i32>() {
                order = Some(priority);
                offset += prefix.len() + 1;
                text = rest;
            }
        }

        if let Some((prefix, rest)) = text.split_once(':') {
            let prefix = prefix.trim();
            if let Some(matcher) = self.matchers.iter().find(|m| m.alias() == Some(prefix)) {
                let rest = rest.trim();
                log::debug!("Guard '{}' selects matcher '{}' by alias", raw, matcher.name());
                return matcher.build(raw, rest, order, matcher.needs_parse());
            }
        }

        let stripped = text.trim_start();
        offset += text.len() - stripped.len();
        let text = stripped.trim_end();

        match self.matchers.iter().find(|m| m.matches(text)) {
            Some(matcher) => matcher.build(raw, text, order, matcher.needs_parse()),
            None => Err(ConfigError::UnmatchedExpression {
                raw: raw.to_string(),
                offset,
            }),
        }
    }
}

impl Default for ConditionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConditionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionRegistry")
            .field("matchers", &self.matcher_names())
            .finish()
    }
}

/// Process wide registry with the built-in matchers
pub static DEFAULT_CONDITIONS: Lazy<ConditionRegistry> = Lazy::new(ConditionRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storyline::bus::{ScopeDataBus, ScopeKind};
    use crate::storyline::role::Role;
    use serde_json::json;

    struct EvenMatcher;

    impl ConditionMatcher for EvenMatcher {
        fn name(&self) -> &str {
            "even"
        }

        fn matches(&self, text: &str) -> bool {
            text.starts_with("even ")
        }

        fn build(
            &self,
            raw: &str,
            text: &str,
            order: Option<i32>,
            _needs_parse: bool,
        ) -> Result<ConditionExpression, ConfigError> {
            let path = text.trim_start_matches("even ").trim().to_string();
            Ok(ConditionExpression::new(
                raw,
                text,
                order,
                self.name(),
                CompiledCondition::custom(move |view| {
                    Ok(view
                        .get(&path)
                        .and_then(|v| v.as_i64())
                        .is_some_and(|n| n % 2 == 0))
                }),
            ))
        }
    }

    #[test]
    fn test_boolean_matcher_wins_for_literals() {
        let expr = DEFAULT_CONDITIONS.compile("true").unwrap();
        assert_eq!(expr.matcher(), "boolean");
        assert!(matches!(expr.kind(), CompiledCondition::Literal(true)));
    }

    #[test]
    fn test_script_is_catch_all() {
        let expr = DEFAULT_CONDITIONS.compile("amount > 100").unwrap();
        assert_eq!(expr.matcher(), "script");
        assert_eq!(expr.order(), None);
    }

    #[test]
    fn test_order_prefix() {
        let expr = DEFAULT_CONDITIONS.compile(" 3: amount > 100").unwrap();
        assert_eq!(expr.order(), Some(3));
        assert_eq!(expr.text(), "amount > 100");
        assert_eq!(expr.raw(), " 3: amount > 100");
    }

    #[test]
    fn test_alias_prefix_disambiguates() {
        // 'true' would otherwise go to the boolean matcher
        let expr = DEFAULT_CONDITIONS.compile("s:true").unwrap();
        assert_eq!(expr.matcher(), "script");

        let expr = DEFAULT_CONDITIONS.compile("2:b:false").unwrap();
        assert_eq!(expr.matcher(), "boolean");
        assert_eq!(expr.order(), Some(2));
    }

    #[test]
    fn test_colon_inside_script_is_not_a_prefix() {
        let expr = DEFAULT_CONDITIONS.compile("time == '10:30'").unwrap();
        assert_eq!(expr.matcher(), "script");
        assert_eq!(expr.order(), None);
    }

    #[test]
    fn test_role_matcher() {
        let expr = DEFAULT_CONDITIONS.compile("r:admin, audit").unwrap();
        assert_eq!(expr.matcher(), "role");

        let bus = ScopeDataBus::default();
        let admin = Role::new(["audit"]);
        let guest = Role::new(["guest"]);
        assert!(expr.evaluate(&ScopeView::new(&bus, Some(&admin))).unwrap());
        assert!(!expr.evaluate(&ScopeView::new(&bus, Some(&guest))).unwrap());
        assert!(!expr.evaluate(&ScopeView::new(&bus, None)).unwrap());
    }

    #[test]
    fn test_invalid_script_fails_at_compile() {
        let err = DEFAULT_CONDITIONS.compile("amount >").unwrap_err();
        assert!(matches!(err, ConfigError::ExpressionSyntax { .. }));
    }

    #[test]
    fn test_unmatched_expression_reports_offset() {
        let registry = ConditionRegistry::empty();
        let err = registry.compile("5: anything").unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnmatchedExpression {
                raw: "5: anything".to_string(),
                offset: 3,
            }
        );
    }

    #[test]
    fn test_register_keeps_catch_all_last() {
        let mut registry = ConditionRegistry::new();
        registry.register(Arc::new(EvenMatcher));
        assert_eq!(
            registry.matcher_names(),
            vec!["boolean", "role", "even", "script"]
        );

        let expr = registry.compile("even var.count").unwrap();
        assert_eq!(expr.matcher(), "even");

        let bus = ScopeDataBus::default();
        bus.set(ScopeKind::Var, "count", json!(4));
        assert!(expr.evaluate(&ScopeView::new(&bus, None)).unwrap());
    }

    #[test]
    fn test_evaluation_error_is_wrapped() {
        let expr = DEFAULT_CONDITIONS.compile("name > 1").unwrap();
        let bus = ScopeDataBus::new(json!({"name": "x"}));
        let err = expr.evaluate(&ScopeView::new(&bus, None)).unwrap_err();
        match err {
            InvocationError::Expression { expression, .. } => assert_eq!(expression, "name > 1"),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
