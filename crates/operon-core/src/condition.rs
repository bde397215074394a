//! JEXL-backed evaluation of step conditions.
//!
//! Mirrors the source ecosystem's use of a JEXL expression engine for
//! `when`/condition clauses: the same expression syntax, evaluated here
//! against an operation's current variables rather than a full workflow
//! context.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::error::PlanError;
use crate::plan::ConditionEvaluator;

pub struct JexlConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl JexlConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                Ok(json!(args.first().and_then(|v| v.as_str()).unwrap_or("").to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                Ok(json!(args.first().and_then(|v| v.as_str()).unwrap_or("").to_uppercase()))
            })
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.len(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });
        Self { evaluator }
    }

    /// JavaScript-like truthiness, matching the rest of the stack's
    /// expression-to-boolean coercion.
    fn value_to_bool(value: &Value) -> bool {
        match value {
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }
}

impl Default for JexlConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionEvaluator for JexlConditionEvaluator {
    fn evaluate(&self, expression: &str, variables: &HashMap<String, Value>) -> Result<bool, PlanError> {
        let context = json!({ "variables": variables });
        let result =
            self.evaluator.eval_in_context(expression, &context).map_err(|e| PlanError::ExpressionError(e.to_string()))?;
        Ok(Self::value_to_bool(&result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_variable_comparison() {
        let evaluator = JexlConditionEvaluator::new();
        let mut vars = HashMap::new();
        vars.insert("count".to_string(), json!(5.0));
        assert!(evaluator.evaluate("variables.count > 3", &vars).unwrap());
        assert!(!evaluator.evaluate("variables.count > 10", &vars).unwrap());
    }

    #[test]
    fn unknown_variable_is_null_and_falsy() {
        let evaluator = JexlConditionEvaluator::new();
        let vars = HashMap::new();
        assert!(!evaluator.evaluate("variables.missing", &vars).unwrap());
    }

    #[test]
    fn string_transform_chain() {
        let evaluator = JexlConditionEvaluator::new();
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), json!("HELLO"));
        assert!(evaluator.evaluate("variables.name|lower == 'hello'", &vars).unwrap());
    }
}
