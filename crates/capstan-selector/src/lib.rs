//! capstan-selector — selector predicates over entity documents.
//!
//! A selector is a CEL-dialect boolean expression over a JSON document
//! view of an entity (`name`, `kind`, `identifier`, `metadata`,
//! `config`, ...). Evaluation is total: unknown field lookups resolve
//! to null, indexing null yields null, and string/boolean operators on
//! null evaluate to false. Compile once, evaluate per entity.
//!
//! A legacy JSON selector form (`{type, operator, key, value,
//! conditions}`) is accepted as a strict subset and translated to the
//! same expression tree.

pub mod ast;
pub mod error;
pub mod eval;
pub mod json_form;
pub mod lexer;
pub mod parser;

use serde::{Deserialize, Serialize};

pub use ast::Expr;
pub use error::{SelectorError, SelectorResult};
pub use json_form::JsonSelector;

/// A selector in either accepted shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Selector {
    /// CEL-dialect source string.
    Cel(String),
    /// Legacy structured form.
    Json(JsonSelector),
}

impl Selector {
    /// Compile the selector into a reusable program.
    pub fn compile(&self) -> SelectorResult<Program> {
        let expr = match self {
            Selector::Cel(src) => parser::parse(src)?,
            Selector::Json(json) => json.to_expr()?,
        };
        Ok(Program { expr })
    }

    /// Compile and evaluate against a single document. Evaluation
    /// errors classify as "no match"; compile errors are reported.
    pub fn matches(&self, doc: &serde_json::Value) -> SelectorResult<bool> {
        Ok(self.compile()?.matches(doc))
    }
}

/// A compiled selector, reusable across entities.
#[derive(Debug, Clone)]
pub struct Program {
    expr: Expr,
}

impl Program {
    /// Evaluate to a boolean; anything but a true result (including an
    /// evaluation error) is "no match".
    pub fn matches(&self, doc: &serde_json::Value) -> bool {
        matches!(
            eval::eval(&self.expr, doc),
            Ok(serde_json::Value::Bool(true))
        )
    }

    /// Evaluate to a raw value. Used by verification conditions, which
    /// need to distinguish errors from false.
    pub fn eval(&self, doc: &serde_json::Value) -> SelectorResult<serde_json::Value> {
        eval::eval(&self.expr, doc)
    }
}

/// Keep only the documents matched by a compiled program.
pub fn filter<'a, T>(
    program: &Program,
    entities: impl IntoIterator<Item = (&'a T, serde_json::Value)>,
) -> Vec<&'a T> {
    entities
        .into_iter()
        .filter(|(_, doc)| program.matches(doc))
        .map(|(entity, _)| entity)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> serde_json::Value {
        serde_json::json!({
            "name": "api",
            "kind": "service",
            "metadata": {"region": "us-east-1", "team": "core"},
            "config": {"replicas": 3},
        })
    }

    #[test]
    fn cel_selector_matches() {
        let sel = Selector::Cel("metadata.region == \"us-east-1\"".into());
        assert!(sel.matches(&doc()).unwrap());
    }

    #[test]
    fn cel_selector_no_match_on_unknown_field() {
        let sel = Selector::Cel("missing.field == \"x\"".into());
        assert!(!sel.matches(&doc()).unwrap());
    }

    #[test]
    fn compile_error_reported() {
        let sel = Selector::Cel("metadata.region ==".into());
        assert!(sel.compile().is_err());
    }

    #[test]
    fn untagged_deserialization_picks_shape() {
        let cel: Selector = serde_json::from_value(serde_json::json!("kind == \"service\"")).unwrap();
        assert!(matches!(cel, Selector::Cel(_)));

        let json: Selector = serde_json::from_value(serde_json::json!({
            "type": "metadata", "operator": "equals",
            "key": "region", "value": "us-east-1",
        }))
        .unwrap();
        assert!(matches!(json, Selector::Json(_)));
    }

    #[test]
    fn program_reuse_across_documents() {
        let program = Selector::Cel("config.replicas > 1".into()).compile().unwrap();
        assert!(program.matches(&doc()));
        assert!(!program.matches(&serde_json::json!({"config": {"replicas": 1}})));
        assert!(!program.matches(&serde_json::json!({})));
    }
}
