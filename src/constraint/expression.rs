//! Expression constraints evaluated with the Cedar policy engine.
//!
//! An expression constraint carries a boolean condition over
//! `input.<name>` (the constraint's declared properties) and
//! `subject.<attr>` (attributes of the requesting subject). The
//! condition is compiled once, at policy-load time, into a single
//! `permit` policy whose `when` clause is the expression; evaluation
//! builds a request context carrying the `input` and `subject` records.
//!
//! An expression that evaluates to an error (unknown attribute, type
//! mismatch) is a failed constraint, which is distinct from an
//! unsatisfied one.

use crate::constraint::property::{PropertyDecl, PropertyValue};
use crate::errors::{KairosError, Result};
use cedar_policy::{
    Authorizer, Context, Decision, Entities, EntityUid, PolicySet, Request, RestrictedExpression,
};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Outcome of evaluating an expression.
#[derive(Debug, PartialEq, Eq)]
pub enum Evaluation {
    /// The expression evaluated to true.
    Satisfied,
    /// The expression evaluated to false.
    Unsatisfied,
}

/// A named boolean expression over constraint inputs and subject
/// attributes.
pub struct ExpressionConstraint {
    name: String,
    display_name: String,
    expression: String,
    properties: Vec<PropertyDecl>,
    policies: PolicySet,
}

impl ExpressionConstraint {
    /// Compiles an expression constraint.
    ///
    /// Fails with `InvalidPolicy` when the expression does not parse,
    /// so malformed policies are rejected at load time rather than at
    /// evaluation time.
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        expression: impl Into<String>,
        properties: Vec<PropertyDecl>,
    ) -> Result<Self> {
        let name = name.into();
        let expression = expression.into();

        let condition = qualify_expression(&expression);
        let text = format!("permit(principal, action, resource) when {{ {condition} }};");
        let policies = PolicySet::from_str(&text).map_err(|e| {
            KairosError::InvalidPolicy(format!(
                "constraint '{name}': expression '{expression}' does not parse: {e}"
            ))
        })?;

        Ok(Self {
            name,
            display_name: display_name.into(),
            expression,
            properties,
            policies,
        })
    }

    /// The constraint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The human-readable name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// The source expression.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The input properties the expression may reference.
    pub fn property_decls(&self) -> &[PropertyDecl] {
        &self.properties
    }

    /// Evaluates the expression against the given inputs and subject
    /// attributes.
    ///
    /// `inputs` carries the set property values by name; `subject`
    /// carries subject attributes as JSON values. Evaluation errors are
    /// surfaced as `ConstraintFailed`.
    pub fn evaluate(
        &self,
        inputs: &HashMap<String, PropertyValue>,
        subject: &HashMap<String, serde_json::Value>,
    ) -> Result<Evaluation> {
        let input_record = RestrictedExpression::new_record(
            inputs
                .iter()
                .map(|(name, value)| (name.clone(), value_to_expr(value))),
        )
        .map_err(|e| self.failed(format!("cannot build input record: {e}")))?;

        let subject_record = RestrictedExpression::new_record(
            subject
                .iter()
                .filter_map(|(name, value)| json_to_expr(value).map(|e| (name.clone(), e))),
        )
        .map_err(|e| self.failed(format!("cannot build subject record: {e}")))?;

        let context = Context::from_pairs([
            ("input".to_string(), input_record),
            ("subject".to_string(), subject_record),
        ])
        .map_err(|e| self.failed(format!("cannot build context: {e}")))?;

        let request = Request::new(
            entity_uid("Kairos::Subject", "current"),
            entity_uid("Kairos::Action", "evaluate"),
            entity_uid("Kairos::Group", "target"),
            context,
            None,
        )
        .map_err(|e| self.failed(format!("cannot build request: {e}")))?;

        let response = Authorizer::new().is_authorized(&request, &self.policies, &Entities::empty());

        let errors: Vec<String> = response
            .diagnostics()
            .errors()
            .map(|e| e.to_string())
            .collect();
        if !errors.is_empty() {
            return Err(KairosError::ConstraintFailed(errors));
        }

        match response.decision() {
            Decision::Allow => Ok(Evaluation::Satisfied),
            Decision::Deny => Ok(Evaluation::Unsatisfied),
        }
    }

    fn failed(&self, reason: String) -> KairosError {
        KairosError::ConstraintFailed(vec![format!("constraint '{}': {reason}", self.name)])
    }
}

impl fmt::Debug for ExpressionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpressionConstraint")
            .field("name", &self.name)
            .field("expression", &self.expression)
            .finish()
    }
}

/// Rewrites `input.` / `subject.` references to their location in the
/// Cedar request context.
fn qualify_expression(expression: &str) -> String {
    static REFS: OnceLock<Regex> = OnceLock::new();
    let refs = REFS.get_or_init(|| {
        Regex::new(r"\b(input|subject)\.").expect("reference pattern is valid")
    });
    refs.replace_all(expression, "context.$1.").into_owned()
}

fn entity_uid(kind: &str, id: &str) -> EntityUid {
    // Both components are fixed literals known to parse.
    format!("{kind}::\"{id}\"")
        .parse()
        .expect("entity uid literals are valid")
}

fn value_to_expr(value: &PropertyValue) -> RestrictedExpression {
    match value {
        PropertyValue::String(s) => RestrictedExpression::new_string(s.clone()),
        PropertyValue::Bool(b) => RestrictedExpression::new_bool(*b),
        PropertyValue::Long(n) => RestrictedExpression::new_long(*n),
        PropertyValue::Duration(d) => RestrictedExpression::new_long(d.whole_seconds()),
    }
}

fn json_to_expr(value: &serde_json::Value) -> Option<RestrictedExpression> {
    match value {
        serde_json::Value::String(s) => Some(RestrictedExpression::new_string(s.clone())),
        serde_json::Value::Bool(b) => Some(RestrictedExpression::new_bool(*b)),
        serde_json::Value::Number(n) => n.as_i64().map(RestrictedExpression::new_long),
        serde_json::Value::Array(items) => Some(RestrictedExpression::new_set(
            items.iter().filter_map(json_to_expr),
        )),
        _ => None,
    }
}
