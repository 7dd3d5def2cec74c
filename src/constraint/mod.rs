//! # Constraint engine
//!
//! Constraints are named checks attached to policy nodes, keyed by
//! class (`join` constraints gate joining, `approve` constraints gate
//! approval). A constraint declares typed input properties; an analysis
//! instantiates those declarations into live [`Property`] instances,
//! shared when two constraints declare the same name, and produces one
//! [`Check`] per constraint.
//!
//! Check outcomes are three-valued: satisfied, unsatisfied, or failed
//! (the evaluation itself errored). The first two are data; only the
//! third travels the error channel.

mod expiry;
mod expression;
mod property;

pub use expiry::{ExpiryConstraint, EXPIRY_PROPERTY};
pub use expression::{Evaluation, ExpressionConstraint};
pub use property::{Property, PropertyDecl, PropertyType, PropertyValue};

use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// The class a constraint belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintClass {
    /// Applied when a subject joins a group.
    Join,
    /// Applied when a join is approved (by self or by a peer).
    Approve,
}

impl fmt::Display for ConstraintClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Join => write!(f, "join"),
            Self::Approve => write!(f, "approve"),
        }
    }
}

/// A named check with typed inputs.
#[derive(Debug)]
pub enum Constraint {
    /// Boolean expression over inputs and subject attributes.
    Expression(ExpressionConstraint),
    /// Membership duration bound.
    Expiry(ExpiryConstraint),
}

impl Constraint {
    /// The constraint name, unique within `(class, node)`.
    pub fn name(&self) -> &str {
        match self {
            Self::Expression(c) => c.name(),
            Self::Expiry(c) => c.name(),
        }
    }

    /// The human-readable name.
    pub fn display_name(&self) -> &str {
        match self {
            Self::Expression(c) => c.display_name(),
            Self::Expiry(c) => c.display_name(),
        }
    }

    /// The input property declarations of this constraint.
    pub fn property_decls(&self) -> Vec<&PropertyDecl> {
        match self {
            Self::Expression(c) => c.property_decls().iter().collect(),
            Self::Expiry(c) => c.property_decl().into_iter().collect(),
        }
    }

    /// Downcast to the expiry variant.
    pub fn as_expiry(&self) -> Option<&ExpiryConstraint> {
        match self {
            Self::Expiry(c) => Some(c),
            _ => None,
        }
    }

    /// Produces a check, resolving property instances through the
    /// registry so same-named inputs are shared across constraints.
    pub fn new_check(self: &Arc<Self>, registry: &mut PropertyRegistry) -> Check {
        let properties = self
            .property_decls()
            .into_iter()
            .map(|decl| registry.resolve(decl))
            .collect();
        Check {
            constraint: Arc::clone(self),
            properties,
            context: HashMap::new(),
        }
    }
}

/// Resolves property declarations to shared instances by name.
///
/// The first declaration of a name wins; later constraints declaring
/// the same name receive the existing instance. Iteration order is
/// insertion order, which keeps analysis input listings deterministic.
#[derive(Debug, Default)]
pub struct PropertyRegistry {
    order: Vec<Arc<Property>>,
    index: HashMap<String, usize>,
}

impl PropertyRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared instance for `decl`, creating it if absent.
    pub fn resolve(&mut self, decl: &PropertyDecl) -> Arc<Property> {
        if let Some(&i) = self.index.get(&decl.name) {
            return Arc::clone(&self.order[i]);
        }
        let property = Arc::new(decl.instantiate());
        self.index.insert(decl.name.clone(), self.order.len());
        self.order.push(Arc::clone(&property));
        property
    }

    /// Looks up a property by name.
    pub fn get(&self, name: &str) -> Option<&Arc<Property>> {
        self.index.get(name).map(|&i| &self.order[i])
    }

    /// All properties in insertion order.
    pub fn properties(&self) -> &[Arc<Property>] {
        &self.order
    }
}

/// An executable instance of a constraint.
///
/// Holds the constraint's (shared) property instances and a mutable
/// context map of subject attributes visible to expression evaluation.
#[derive(Debug)]
pub struct Check {
    constraint: Arc<Constraint>,
    properties: Vec<Arc<Property>>,
    context: HashMap<String, serde_json::Value>,
}

impl Check {
    /// The constraint this check was produced from.
    pub fn constraint(&self) -> &Arc<Constraint> {
        &self.constraint
    }

    /// The property instances backing this check.
    pub fn properties(&self) -> &[Arc<Property>] {
        &self.properties
    }

    /// Adds a subject attribute to the evaluation context.
    pub fn add_context(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.context.insert(key.into(), value);
    }

    /// Names of required properties that have no value yet.
    pub fn missing_required(&self) -> Vec<String> {
        self.properties
            .iter()
            .filter(|p| p.is_required() && !p.is_set())
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Executes the check.
    ///
    /// `Ok(true)` means satisfied, `Ok(false)` unsatisfied; an `Err` is
    /// a failed evaluation. A check whose required inputs are missing
    /// reports unsatisfied rather than failing, so dry runs stay clean.
    pub fn execute(&self) -> Result<bool> {
        if !self.missing_required().is_empty() {
            return Ok(false);
        }

        match self.constraint.as_ref() {
            Constraint::Expression(c) => {
                let inputs: HashMap<String, PropertyValue> = self
                    .properties
                    .iter()
                    .filter_map(|p| p.get().map(|v| (p.name().to_string(), v)))
                    .collect();
                Ok(c.evaluate(&inputs, &self.context)? == Evaluation::Satisfied)
            }
            Constraint::Expiry(c) => {
                let input = self
                    .properties
                    .iter()
                    .find(|p| p.name() == EXPIRY_PROPERTY)
                    .and_then(|p| p.get());
                Ok(c.is_satisfied(input.as_ref()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::KairosError;
    use time::Duration;

    fn expression(name: &str, expr: &str, decls: Vec<PropertyDecl>) -> Arc<Constraint> {
        Arc::new(Constraint::Expression(
            ExpressionConstraint::new(name, name, expr, decls).unwrap(),
        ))
    }

    #[test]
    fn test_registry_shares_instances_by_name() {
        let mut registry = PropertyRegistry::new();
        let decl_a = PropertyDecl::new("ticket", "Ticket", PropertyType::String, true);
        let decl_b = PropertyDecl::new("ticket", "Ticket number", PropertyType::String, false);

        let a = registry.resolve(&decl_a);
        let b = registry.resolve(&decl_b);

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.properties().len(), 1);
    }

    #[test]
    fn test_check_with_missing_required_is_unsatisfied() {
        let constraint = expression(
            "ticket",
            "input.var1 == true",
            vec![PropertyDecl::new("var1", "Var 1", PropertyType::Bool, true)],
        );
        let mut registry = PropertyRegistry::new();
        let check = constraint.new_check(&mut registry);

        assert_eq!(check.missing_required(), vec!["var1".to_string()]);
        assert!(!check.execute().unwrap());
    }

    #[test]
    fn test_check_executes_expression_with_inputs() {
        let constraint = expression(
            "ticket",
            "input.var1 == true",
            vec![PropertyDecl::new("var1", "Var 1", PropertyType::Bool, true)],
        );
        let mut registry = PropertyRegistry::new();
        let check = constraint.new_check(&mut registry);

        registry.get("var1").unwrap().set("true").unwrap();
        assert!(check.execute().unwrap());

        registry.get("var1").unwrap().set("false").unwrap();
        assert!(!check.execute().unwrap());
    }

    #[test]
    fn test_check_exposes_context_to_expression() {
        let constraint = expression("domain", "subject.email == \"alice@example.com\"", vec![]);
        let mut registry = PropertyRegistry::new();
        let mut check = constraint.new_check(&mut registry);
        check.add_context("email", serde_json::json!("alice@example.com"));

        assert!(check.execute().unwrap());
    }

    #[test]
    fn test_expression_error_propagates_as_failed() {
        let constraint = expression("broken", "subject.nonexistent == 1", vec![]);
        let mut registry = PropertyRegistry::new();
        let check = constraint.new_check(&mut registry);

        assert!(matches!(
            check.execute(),
            Err(KairosError::ConstraintFailed(_))
        ));
    }

    #[test]
    fn test_fixed_expiry_check_is_always_satisfied() {
        let constraint = Arc::new(Constraint::Expiry(
            ExpiryConstraint::fixed(Duration::seconds(60)).unwrap(),
        ));
        let mut registry = PropertyRegistry::new();
        let check = constraint.new_check(&mut registry);

        assert!(check.properties().is_empty());
        assert!(check.execute().unwrap());
    }

    #[test]
    fn test_ranged_expiry_check_reads_shared_input() {
        let constraint = Arc::new(Constraint::Expiry(
            ExpiryConstraint::range(Duration::seconds(60), Duration::days(3)).unwrap(),
        ));
        let mut registry = PropertyRegistry::new();
        let check = constraint.new_check(&mut registry);

        assert!(!check.execute().unwrap());

        registry.get(EXPIRY_PROPERTY).unwrap().set("120").unwrap();
        assert!(check.execute().unwrap());
    }

    #[test]
    fn test_constraint_class_display() {
        assert_eq!(ConstraintClass::Join.to_string(), "join");
        assert_eq!(ConstraintClass::Approve.to_string(), "approve");
    }
}
