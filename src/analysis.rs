//! Policy analysis: combining ACL checks, constraint checks, and user
//! inputs into a single decision.
//!
//! An analysis is built for a `(subject, requested permissions)` pair
//! against one JIT group, then scoped to one or more constraint
//! classes. Executing it is side-effect free and idempotent: the same
//! analysis can be re-run as inputs arrive (dry runs) and the final
//! run decides the operation.
//!
//! Constraint outcomes are data. Only `verify_access_allowed` converts
//! an unfavorable result into an error.

use crate::constraint::{Check, ConstraintClass, Constraint, Property, PropertyRegistry};
use crate::errors::{KairosError, Result};
use crate::policy::{JitGroupPolicy, PolicyPermission};
use crate::principal::{JitGroupMembership, Subject};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;

/// How constraint outcomes factor into an access decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessOptions {
    /// Allowed iff the ACL allows and no constraint is unsatisfied or
    /// failed.
    Default,
    /// Allowed iff the ACL allows, regardless of constraint state.
    IgnoreConstraints,
}

/// A prepared analysis for one subject against one group.
pub struct PolicyAnalysis {
    group: Arc<JitGroupPolicy>,
    subject: Arc<Subject>,
    requested: PolicyPermission,
    classes: Vec<ConstraintClass>,
    checks: Vec<Check>,
    registry: PropertyRegistry,
}

impl PolicyAnalysis {
    /// Creates an analysis with no constraint classes applied.
    pub fn new(
        group: Arc<JitGroupPolicy>,
        subject: Arc<Subject>,
        requested: PolicyPermission,
    ) -> Self {
        Self {
            group,
            subject,
            requested,
            classes: Vec::new(),
            checks: Vec::new(),
            registry: PropertyRegistry::new(),
        }
    }

    /// Applies a constraint class, instantiating checks for every
    /// effective constraint of that class.
    ///
    /// Input properties with the same name share one instance across
    /// all applied constraints. Applying a class twice is a no-op.
    pub fn apply_constraints(mut self, class: ConstraintClass) -> Self {
        if self.classes.contains(&class) {
            return self;
        }
        self.classes.push(class);
        for constraint in self.group.effective_constraints(class) {
            let mut check = constraint.new_check(&mut self.registry);
            check.add_context(
                "email",
                serde_json::Value::String(self.subject.user().email().to_string()),
            );
            self.checks.push(check);
        }
        self
    }

    /// The group under analysis.
    pub fn group(&self) -> &Arc<JitGroupPolicy> {
        &self.group
    }

    /// The subject under analysis.
    pub fn subject(&self) -> &Arc<Subject> {
        &self.subject
    }

    /// The permissions the analysis asks for.
    pub fn requested_permissions(&self) -> PolicyPermission {
        self.requested
    }

    /// The input properties of all applied constraints, in declaration
    /// order, de-duplicated by name.
    pub fn input(&self) -> &[Arc<Property>] {
        self.registry.properties()
    }

    /// Sets an input property by name.
    pub fn set_input(&self, name: &str, raw: &str) -> Result<()> {
        let property = self
            .registry
            .get(name)
            .ok_or_else(|| KairosError::invalid_input(name, "no such input property"))?;
        property.set(raw)
    }

    /// Executes ACL and constraint checks with the current inputs.
    ///
    /// Only infrastructure failures (principal resolution, detached
    /// policy nodes) return an error; constraint outcomes land in the
    /// result.
    #[instrument(skip(self), fields(group = %self.group.name(), user = %self.subject.user()))]
    pub async fn execute(&self) -> Result<AnalysisResult> {
        let principals = self.subject.principals().await?;
        let access_allowed = self.group.is_allowed_by_acl(principals, self.requested);

        let mut satisfied = Vec::new();
        let mut unsatisfied = Vec::new();
        let mut failed = Vec::new();
        for check in &self.checks {
            match check.execute() {
                Ok(true) => satisfied.push(Arc::clone(check.constraint())),
                Ok(false) => unsatisfied.push(Arc::clone(check.constraint())),
                Err(err) => failed.push((Arc::clone(check.constraint()), err)),
            }
        }

        let active_membership = self
            .subject
            .active_membership(&self.group.id()?, OffsetDateTime::now_utc())
            .await?;

        Ok(AnalysisResult {
            access_allowed,
            satisfied,
            unsatisfied,
            failed,
            input: self.registry.properties().to_vec(),
            active_membership,
        })
    }
}

/// Outcome of one analysis execution.
pub struct AnalysisResult {
    access_allowed: bool,
    satisfied: Vec<Arc<Constraint>>,
    unsatisfied: Vec<Arc<Constraint>>,
    failed: Vec<(Arc<Constraint>, KairosError)>,
    input: Vec<Arc<Property>>,
    active_membership: Option<JitGroupMembership>,
}

impl AnalysisResult {
    /// Whether the ACL chain grants the requested permissions.
    pub fn access_allowed(&self) -> bool {
        self.access_allowed
    }

    /// Constraints that evaluated to true, in policy order.
    pub fn satisfied(&self) -> &[Arc<Constraint>] {
        &self.satisfied
    }

    /// Constraints that evaluated to false, in policy order.
    pub fn unsatisfied(&self) -> &[Arc<Constraint>] {
        &self.unsatisfied
    }

    /// Constraints whose evaluation errored, with the causes.
    pub fn failed(&self) -> &[(Arc<Constraint>, KairosError)] {
        &self.failed
    }

    /// The analysis input properties.
    pub fn input(&self) -> &[Arc<Property>] {
        &self.input
    }

    /// Looks up an input property by name.
    pub fn input_property(&self, name: &str) -> Option<&Arc<Property>> {
        self.input.iter().find(|p| p.name() == name)
    }

    /// Names of required inputs that are still unset.
    pub fn missing_required(&self) -> Vec<String> {
        self.input
            .iter()
            .filter(|p| p.is_required() && !p.is_set())
            .map(|p| p.name().to_string())
            .collect()
    }

    /// The subject's currently active membership of the group, if any.
    pub fn active_membership(&self) -> Option<&JitGroupMembership> {
        self.active_membership.as_ref()
    }

    /// Whether access is allowed under the given options.
    pub fn is_allowed(&self, options: AccessOptions) -> bool {
        match options {
            AccessOptions::IgnoreConstraints => self.access_allowed,
            AccessOptions::Default => {
                self.access_allowed && self.unsatisfied.is_empty() && self.failed.is_empty()
            }
        }
    }

    /// Converts an unfavorable result into the appropriate error.
    ///
    /// Reasons are reported in order of actionability: access denial,
    /// then missing inputs, then failed evaluations, then unsatisfied
    /// constraints.
    pub fn verify_access_allowed(&self, options: AccessOptions) -> Result<()> {
        if self.is_allowed(options) {
            return Ok(());
        }

        if !self.access_allowed {
            return Err(KairosError::AccessDenied(
                "effective policy does not grant the requested permissions".into(),
            ));
        }

        let missing = self.missing_required();
        if let Some(name) = missing.first() {
            return Err(KairosError::invalid_input(name, "required input not set"));
        }

        if !self.failed.is_empty() {
            return Err(KairosError::ConstraintFailed(
                self.failed
                    .iter()
                    .map(|(c, e)| format!("{}: {e}", c.name()))
                    .collect(),
            ));
        }

        Err(KairosError::ConstraintUnsatisfied(
            self.unsatisfied
                .iter()
                .map(|c| c.display_name().to_string())
                .collect(),
        ))
    }
}
