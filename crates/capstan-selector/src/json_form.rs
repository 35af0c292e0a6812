//! Legacy structured selector form.
//!
//! `{type, operator, key, value, conditions}` with boolean combinators
//! `and`/`or`/`not` and leaf operators `equals`, `startsWith`,
//! `contains`, `regex`. A strict subset of the CEL dialect; translated
//! to the same expression tree.

use serde::{Deserialize, Serialize};

use crate::ast::{BinOp, Expr, UnaryOp};
use crate::error::{SelectorError, SelectorResult};

/// A node of the legacy selector tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonSelector {
    /// Field group for leaves ("metadata", "name", "kind", ...); for
    /// combinator nodes this is conventionally "comparison".
    #[serde(rename = "type")]
    pub selector_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<JsonSelector>,
}

impl JsonSelector {
    /// Translate to the shared expression tree.
    pub fn to_expr(&self) -> SelectorResult<Expr> {
        let operator = self.operator.as_deref().unwrap_or("equals");
        match operator {
            "and" | "or" => {
                if self.conditions.is_empty() {
                    return Err(SelectorError::InvalidJsonForm(format!(
                        "{operator:?} requires at least one condition"
                    )));
                }
                let op = if operator == "and" { BinOp::And } else { BinOp::Or };
                let mut exprs = self.conditions.iter().map(|c| c.to_expr());
                let first = exprs.next().expect("non-empty")?;
                exprs.try_fold(first, |acc, next| {
                    Ok(Expr::Binary(op, Box::new(acc), Box::new(next?)))
                })
            }
            "not" => {
                if self.conditions.len() != 1 {
                    return Err(SelectorError::InvalidJsonForm(
                        "\"not\" requires exactly one condition".to_string(),
                    ));
                }
                Ok(Expr::Unary(
                    UnaryOp::Not,
                    Box::new(self.conditions[0].to_expr()?),
                ))
            }
            leaf => self.leaf_expr(leaf),
        }
    }

    fn leaf_expr(&self, operator: &str) -> SelectorResult<Expr> {
        let field = self.field_expr()?;
        let value = self.value.clone().ok_or_else(|| {
            SelectorError::InvalidJsonForm(format!("operator {operator:?} requires a value"))
        })?;
        let lit = Expr::Lit(serde_json::Value::String(value));

        match operator {
            "equals" => Ok(Expr::Binary(BinOp::Eq, Box::new(field), Box::new(lit))),
            "startsWith" | "starts_with" => Ok(Expr::Call {
                recv: Box::new(field),
                method: "startsWith".to_string(),
                args: vec![lit],
            }),
            "contains" => Ok(Expr::Call {
                recv: Box::new(field),
                method: "contains".to_string(),
                args: vec![lit],
            }),
            "regex" => Ok(Expr::Call {
                recv: Box::new(field),
                method: "matches".to_string(),
                args: vec![lit],
            }),
            other => Err(SelectorError::InvalidJsonForm(format!(
                "unknown operator {other:?}"
            ))),
        }
    }

    /// Build the field access for a leaf: `metadata`/`config` types
    /// index by key, scalar types read the type-named field directly.
    fn field_expr(&self) -> SelectorResult<Expr> {
        match self.selector_type.as_str() {
            "metadata" | "config" => {
                let key = self.key.clone().ok_or_else(|| {
                    SelectorError::InvalidJsonForm(format!(
                        "type {:?} requires a key",
                        self.selector_type
                    ))
                })?;
                let mut expr = Expr::Ident(self.selector_type.clone());
                for segment in key.split('.') {
                    expr = Expr::Member(Box::new(expr), segment.to_string());
                }
                Ok(expr)
            }
            "name" | "kind" | "identifier" | "version" | "tag" | "systemId" => {
                Ok(Expr::Ident(self.selector_type.clone()))
            }
            other => Err(SelectorError::InvalidJsonForm(format!(
                "unknown selector type {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::eval;

    fn doc() -> serde_json::Value {
        serde_json::json!({
            "name": "api-prod",
            "kind": "service",
            "metadata": {"region": "us-east-1", "env": "prod"},
        })
    }

    fn matches(sel: serde_json::Value) -> bool {
        let sel: JsonSelector = serde_json::from_value(sel).unwrap();
        matches!(
            eval(&sel.to_expr().unwrap(), &doc()),
            Ok(serde_json::Value::Bool(true))
        )
    }

    #[test]
    fn metadata_equals() {
        assert!(matches(serde_json::json!({
            "type": "metadata", "operator": "equals",
            "key": "region", "value": "us-east-1",
        })));
        assert!(!matches(serde_json::json!({
            "type": "metadata", "operator": "equals",
            "key": "region", "value": "eu-central-1",
        })));
    }

    #[test]
    fn name_starts_with() {
        assert!(matches(serde_json::json!({
            "type": "name", "operator": "startsWith", "value": "api-",
        })));
    }

    #[test]
    fn regex_leaf() {
        assert!(matches(serde_json::json!({
            "type": "kind", "operator": "regex", "value": "^serv",
        })));
    }

    #[test]
    fn and_or_not_combinators() {
        assert!(matches(serde_json::json!({
            "type": "comparison", "operator": "and",
            "conditions": [
                {"type": "metadata", "operator": "equals", "key": "env", "value": "prod"},
                {"type": "comparison", "operator": "not", "conditions": [
                    {"type": "kind", "operator": "equals", "value": "job"},
                ]},
            ],
        })));
        assert!(matches(serde_json::json!({
            "type": "comparison", "operator": "or",
            "conditions": [
                {"type": "kind", "operator": "equals", "value": "job"},
                {"type": "kind", "operator": "equals", "value": "service"},
            ],
        })));
    }

    #[test]
    fn missing_metadata_key_is_no_match() {
        assert!(!matches(serde_json::json!({
            "type": "metadata", "operator": "contains", "key": "absent", "value": "x",
        })));
    }

    #[test]
    fn invalid_forms_are_rejected() {
        let no_conditions: JsonSelector = serde_json::from_value(serde_json::json!({
            "type": "comparison", "operator": "and",
        }))
        .unwrap();
        assert!(no_conditions.to_expr().is_err());

        let bad_type: JsonSelector = serde_json::from_value(serde_json::json!({
            "type": "banana", "operator": "equals", "value": "x",
        }))
        .unwrap();
        assert!(bad_type.to_expr().is_err());
    }
}
