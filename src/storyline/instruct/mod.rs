//! Built-in instruct adapters
//!
//! - `json`: the content is a JSON literal, returned as is
//! - `expr`: the content is a guard expression, returned as a boolean

use async_trait::async_trait;
use serde_json::Value;
use std::error::Error;
use std::sync::Arc;

use crate::sdk::instruct::{InstructAdapter, InstructContent};
use crate::storyline::bus::ScopeOperator;
use crate::storyline::condition::DEFAULT_CONDITIONS;
use crate::storyline::registry::TaskRegistry;

pub struct JsonInstruct;

#[async_trait]
impl InstructAdapter for JsonInstruct {
    fn name(&self) -> &str {
        "json"
    }

    async fn execute(
        &self,
        content: &InstructContent,
        _operator: &ScopeOperator,
    ) -> Result<Option<Value>, Box<dyn Error + Send + Sync>> {
        let value: Value = serde_json::from_str(&content.content)?;
        Ok(Some(value))
    }
}

pub struct ExprInstruct;

#[async_trait]
impl InstructAdapter for ExprInstruct {
    fn name(&self) -> &str {
        "expr"
    }

    async fn execute(
        &self,
        content: &InstructContent,
        operator: &ScopeOperator,
    ) -> Result<Option<Value>, Box<dyn Error + Send + Sync>> {
        let expression = DEFAULT_CONDITIONS.compile(&content.content)?;
        let result = expression.evaluate(&operator.view())?;
        Ok(Some(Value::Bool(result)))
    }
}

pub async fn register_builtin(registry: &TaskRegistry) {
    registry.register_instruct(Arc::new(JsonInstruct)).await;
    registry.register_instruct(Arc::new(ExprInstruct)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storyline::bus::ScopeDataBus;
    use serde_json::json;

    fn operator(req: Value) -> ScopeOperator {
        ScopeOperator::new(ScopeDataBus::new(req), None)
    }

    #[tokio::test]
    async fn test_json_instruct() {
        let content = InstructContent::new("json", r#"{"level": 3, "tags": ["a"]}"#);
        let value = JsonInstruct
            .execute(&content, &operator(json!({})))
            .await
            .unwrap();
        assert_eq!(value, Some(json!({"level": 3, "tags": ["a"]})));
    }

    #[tokio::test]
    async fn test_json_instruct_rejects_bad_literal() {
        let content = InstructContent::new("json", "{level: ");
        assert!(JsonInstruct
            .execute(&content, &operator(json!({})))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_expr_instruct() {
        let content = InstructContent::new("expr", "amount > 100");
        let value = ExprInstruct
            .execute(&content, &operator(json!({"amount": 150})))
            .await
            .unwrap();
        assert_eq!(value, Some(Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_expr_instruct_surfaces_errors() {
        let content = InstructContent::new("expr", "name > 1");
        let err = ExprInstruct
            .execute(&content, &operator(json!({"name": "x"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("name > 1"));
    }
}
