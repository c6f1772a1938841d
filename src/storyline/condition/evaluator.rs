//! Guard expression evaluator

use super::ast::{CompareOp, Expression, Literal, Operand};
use crate::storyline::bus::ScopeView;
use serde_json::Value;
use std::cmp::Ordering;

/// Evaluate an expression against the run's scopes.
///
/// Missing paths read as `null`. Ordering comparisons between values of
/// different kinds (say a string against a number) are an error.
pub fn evaluate(expr: &Expression, view: &ScopeView<'_>) -> Result<bool, String> {
    match expr {
        Expression::True => Ok(true),
        Expression::False => Ok(false),
        Expression::Path(path) => Ok(truthy(view.get(path).as_ref())),
        Expression::Compare { left, op, right } => evaluate_compare(left, *op, right, view),
        Expression::And(left, right) => Ok(evaluate(left, view)? && evaluate(right, view)?),
        Expression::Or(left, right) => Ok(evaluate(left, view)? || evaluate(right, view)?),
        Expression::Not(inner) => Ok(!evaluate(inner, view)?),
    }
}

fn evaluate_compare(
    left: &str,
    op: CompareOp,
    right: &Operand,
    view: &ScopeView<'_>,
) -> Result<bool, String> {
    let left_value = view.get(left).unwrap_or(Value::Null);
    let right_value = match right {
        Operand::Literal(literal) => literal_value(literal),
        Operand::Path(path) => view.get(path).unwrap_or(Value::Null),
    };

    match op {
        CompareOp::Eq => Ok(values_equal(&left_value, &right_value)),
        CompareOp::NotEq => Ok(!values_equal(&left_value, &right_value)),
        CompareOp::Gt => order(left, &left_value, &right_value, Ordering::is_gt),
        CompareOp::Gte => order(left, &left_value, &right_value, Ordering::is_ge),
        CompareOp::Lt => order(left, &left_value, &right_value, Ordering::is_lt),
        CompareOp::Lte => order(left, &left_value, &right_value, Ordering::is_le),
        CompareOp::Contains => Ok(check_contains(&left_value, &right_value)),
    }
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::String(s) => Value::String(s.clone()),
        Literal::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Literal::Boolean(b) => Value::Bool(*b),
        Literal::Null => Value::Null,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
            _ => false,
        },
        _ => left == right,
    }
}

/// Ordering comparison; a missing (null) side never satisfies it
fn order(
    path: &str,
    left: &Value,
    right: &Value,
    accept: fn(Ordering) -> bool,
) -> Result<bool, String> {
    let ordering = match (left, right) {
        (Value::Null, _) | (_, Value::Null) => return Ok(false),
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => {
            return Err(format!(
                "cannot order '{}' ({}) against {}",
                path,
                kind(left),
                kind(right)
            ))
        }
    };
    Ok(ordering.is_some_and(accept))
}

fn check_contains(left: &Value, right: &Value) -> bool {
    match (left, right) {
        // String contains substring
        (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
        // Array contains value
        (Value::Array(items), needle) => items.iter().any(|v| values_equal(v, needle)),
        // Object has key
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storyline::bus::{ScopeDataBus, ScopeKind};
    use crate::storyline::condition::parser::parse;
    use serde_json::json;

    fn eval(input: &str, bus: &ScopeDataBus) -> Result<bool, String> {
        evaluate(&parse(input).unwrap(), &ScopeView::new(bus, None))
    }

    #[test]
    fn test_string_equality() {
        let bus = ScopeDataBus::new(json!({"intent": "search"}));
        assert!(eval("intent == 'search'", &bus).unwrap());
        assert!(!eval("intent == 'code'", &bus).unwrap());
        assert!(eval("intent != 'code'", &bus).unwrap());
    }

    #[test]
    fn test_number_comparison() {
        let bus = ScopeDataBus::new(json!({"score": 7.5}));

        assert!(eval("score > 5", &bus).unwrap());
        assert!(!eval("score > 10", &bus).unwrap());
        assert!(eval("score >= 7.5", &bus).unwrap());
        assert!(eval("score < 10", &bus).unwrap());
        assert!(eval("score <= 7.5", &bus).unwrap());
        assert!(!eval("score <= 7", &bus).unwrap());
    }

    #[test]
    fn test_missing_path() {
        let bus = ScopeDataBus::default();
        assert!(eval("missing == null", &bus).unwrap());
        assert!(!eval("missing > 1", &bus).unwrap());
        assert!(!eval("missing", &bus).unwrap());
    }

    #[test]
    fn test_scope_qualified_paths() {
        let bus = ScopeDataBus::new(json!({"amount": 150}));
        bus.set(ScopeKind::Var, "limit", json!(100));
        bus.set(ScopeKind::Sta, "approved", json!(true));

        assert!(eval("amount > var.limit", &bus).unwrap());
        assert!(eval("sta.approved && req.amount >= 150", &bus).unwrap());
        assert!(!eval("var.amount > 1", &bus).unwrap());
    }

    #[test]
    fn test_contains() {
        let bus = ScopeDataBus::new(json!({
            "tags": ["bug", "urgent"],
            "title": "Fix login bug",
            "meta": {"owner": "ops"}
        }));
        assert!(eval("tags contains 'bug'", &bus).unwrap());
        assert!(!eval("tags contains 'feature'", &bus).unwrap());
        assert!(eval("title contains 'login'", &bus).unwrap());
        assert!(eval("meta contains 'owner'", &bus).unwrap());
    }

    #[test]
    fn test_logic_operators() {
        let bus = ScopeDataBus::new(json!({"a": 1, "b": 0}));
        assert!(eval("a == 1 or b == 1", &bus).unwrap());
        assert!(!eval("a == 1 and b == 1", &bus).unwrap());
        assert!(eval("!b", &bus).unwrap());
        assert!(eval("not (a == 2)", &bus).unwrap());
    }

    #[test]
    fn test_type_mismatch_is_an_error() {
        let bus = ScopeDataBus::new(json!({"name": "bob"}));
        let err = eval("name > 3", &bus).unwrap_err();
        assert!(err.contains("string"));
        assert!(err.contains("number"));
    }
}
