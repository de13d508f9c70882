//! Context descriptor attached to a wrapped operation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form context for a wrapped call (component, action, ids, ...).
///
/// Copied into every error log entry the call produces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationContext {
    #[serde(flatten)]
    fields: BTreeMap<String, Value>,

    /// Caller-supplied key identifying the logical operation across retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    idempotency_key: Option<String>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a context that only names the operation.
    pub fn named(operation: impl Into<String>) -> Self {
        Self::new().with("operation", operation.into())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Label used in traces: the `operation` field when present.
    pub fn operation(&self) -> &str {
        self.fields
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("unnamed")
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.idempotency_key.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_collects_fields() {
        let ctx = OperationContext::named("tickets.create")
            .with("ticket_id", 42)
            .with_idempotency_key("req-1");

        assert_eq!(ctx.operation(), "tickets.create");
        assert_eq!(ctx.get("ticket_id"), Some(&json!(42)));
        assert_eq!(ctx.idempotency_key(), Some("req-1"));
        assert!(!ctx.is_empty());
    }

    #[test]
    fn serializes_flat() {
        let ctx = OperationContext::named("kb.search").with_idempotency_key("k");
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(
            value,
            json!({ "operation": "kb.search", "idempotency_key": "k" })
        );
    }

    #[test]
    fn unnamed_context() {
        let ctx = OperationContext::new();
        assert_eq!(ctx.operation(), "unnamed");
        assert!(ctx.is_empty());
    }
}
