//! YAML policy documents.
//!
//! An environment's policy is declared in a single YAML document:
//!
//! ```yaml
//! schemaVersion: 1
//! environment:
//!   name: env-1
//!   description: Development sandbox
//!   access:
//!     - principal: "class:authenticated-users"
//!       allow: "VIEW"
//!   systems:
//!     - name: sys-1
//!       groups:
//!         - name: g-1
//!           access:
//!             - principal: "user:alice@example.com"
//!               allow: "JOIN, APPROVE_SELF"
//!           constraints:
//!             join:
//!               - type: expiry
//!                 min: 60
//!                 max: 259200
//!           privileges:
//!             - kind: iam_role_binding
//!               resource: { type: project, name: projects/demo }
//!               role: roles/compute.viewer
//! ```
//!
//! Parsing assembles the policy tree and collects validation issues.
//! Structural problems are hard errors; lints that do not prevent
//! loading (a group without an expiry constraint, a deny-all access
//! list) are returned as warnings alongside the parsed policy.

use crate::constraint::{
    Constraint, ConstraintClass, ExpiryConstraint, ExpressionConstraint, PropertyDecl,
    EXPIRY_PROPERTY,
};
use crate::errors::{KairosError, Result};
use crate::policy::acl::{AccessControlList, AclEntry};
use crate::policy::permission::PolicyPermission;
use crate::policy::privilege::Privilege;
use crate::policy::tree::{
    ConstraintMap, EnvironmentPolicy, JitGroupPolicy, PolicyMetadata, SystemPolicy,
};
use crate::principal::{GroupId, Principal, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use time::Duration;

/// Supported document schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Severity of a validation issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    /// The document loaded, but something looks off.
    Warning,
    /// The document cannot be used.
    Error,
}

/// A single validation finding, anchored to a document path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Severity of the finding.
    pub severity: IssueSeverity,
    /// Dotted path to the offending node, e.g. `env-1.sys-1.g-1`.
    pub path: String,
    /// Human-readable description.
    pub message: String,
}

impl ValidationIssue {
    fn warning(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} at {}: {}", self.severity, self.path, self.message)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct DocumentRoot {
    schema_version: u32,
    environment: EnvironmentNode,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct EnvironmentNode {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access: Option<Vec<AccessEntryNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    constraints: Option<ConstraintsNode>,
    #[serde(default)]
    systems: Vec<SystemNode>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SystemNode {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access: Option<Vec<AccessEntryNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    constraints: Option<ConstraintsNode>,
    #[serde(default)]
    groups: Vec<GroupNode>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GroupNode {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access: Option<Vec<AccessEntryNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    constraints: Option<ConstraintsNode>,
    #[serde(default)]
    privileges: Vec<Privilege>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AccessEntryNode {
    principal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deny: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConstraintsNode {
    #[serde(default)]
    join: Vec<ConstraintNode>,
    #[serde(default)]
    approve: Vec<ConstraintNode>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ConstraintNode {
    #[serde(rename_all = "camelCase")]
    Expression {
        name: String,
        #[serde(default)]
        display_name: Option<String>,
        expression: String,
        #[serde(default)]
        properties: Vec<PropertyDecl>,
    },
    #[serde(rename_all = "camelCase")]
    Expiry {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        display_name: Option<String>,
        /// Minimum membership duration in seconds.
        min: i64,
        /// Maximum membership duration in seconds.
        max: i64,
    },
}

fn parse_principal(text: &str, path: &str) -> Result<Principal> {
    let invalid = || {
        KairosError::InvalidPolicy(format!(
            "{path}: '{text}' is not a valid principal, expected \
             user:<email>, group:<email>, jit-group:<id>, or class:authenticated-users"
        ))
    };
    let (kind, value) = text.split_once(':').ok_or_else(invalid)?;
    match kind {
        "user" => Ok(Principal::User(UserId::new(value).map_err(|_| invalid())?)),
        "group" => Ok(Principal::Group(GroupId::new(value).map_err(|_| invalid())?)),
        "jit-group" => {
            let id = value.parse().map_err(|_| invalid())?;
            Ok(Principal::JitGroupMembership(
                crate::principal::JitGroupMembership::new(id, time::OffsetDateTime::UNIX_EPOCH),
            ))
        }
        "class" if value == "authenticated-users" => Ok(Principal::AllAuthenticatedUsers),
        _ => Err(invalid()),
    }
}

fn parse_permissions(text: &str, path: &str) -> Result<PolicyPermission> {
    let mut mask = PolicyPermission::NONE;
    for part in text.split([',', '|']) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        mask |= PolicyPermission::parse_name(part).ok_or_else(|| {
            KairosError::InvalidPolicy(format!("{path}: unknown permission '{part}'"))
        })?;
    }
    Ok(mask)
}

fn build_acl(
    access: &Option<Vec<AccessEntryNode>>,
    path: &str,
    warnings: &mut Vec<ValidationIssue>,
) -> Result<Option<AccessControlList>> {
    let Some(entries) = access else {
        return Ok(None);
    };
    if entries.is_empty() {
        warnings.push(ValidationIssue::warning(
            path,
            "empty access list denies everyone",
        ));
    }

    let mut built = Vec::with_capacity(entries.len());
    for entry in entries {
        let principal = parse_principal(&entry.principal, path)?;
        match (&entry.allow, &entry.deny) {
            (Some(allow), None) => {
                built.push(AclEntry::allow(principal, parse_permissions(allow, path)?));
            }
            (None, Some(deny)) => {
                built.push(AclEntry::deny(principal, parse_permissions(deny, path)?));
            }
            _ => {
                return Err(KairosError::InvalidPolicy(format!(
                    "{path}: access entry for '{}' must set exactly one of allow/deny",
                    entry.principal
                )));
            }
        }
    }
    Ok(Some(AccessControlList::new(built)))
}

fn build_constraint(node: &ConstraintNode, path: &str) -> Result<Arc<Constraint>> {
    let built = match node {
        ConstraintNode::Expression {
            name,
            display_name,
            expression,
            properties,
        } => ExpressionConstraint::new(
            name,
            display_name.clone().unwrap_or_else(|| name.clone()),
            expression,
            properties.clone(),
        )
        .map(|c| Arc::new(Constraint::Expression(c))),
        ConstraintNode::Expiry {
            name,
            display_name,
            min,
            max,
        } => ExpiryConstraint::new(
            name.clone().unwrap_or_else(|| EXPIRY_PROPERTY.to_string()),
            display_name.clone().unwrap_or_else(|| "Expiry".to_string()),
            Duration::seconds(*min),
            Duration::seconds(*max),
        )
        .map(|c| Arc::new(Constraint::Expiry(c))),
    };

    built.map_err(|e| match e {
        KairosError::InvalidPolicy(msg) => KairosError::InvalidPolicy(format!("{path}: {msg}")),
        other => other,
    })
}

fn build_constraints(node: &Option<ConstraintsNode>, path: &str) -> Result<ConstraintMap> {
    let mut map = ConstraintMap::new();
    let Some(node) = node else {
        return Ok(map);
    };
    for (class, nodes) in [
        (ConstraintClass::Join, &node.join),
        (ConstraintClass::Approve, &node.approve),
    ] {
        if nodes.is_empty() {
            continue;
        }
        let mut built = Vec::with_capacity(nodes.len());
        for n in nodes {
            let constraint = build_constraint(n, path)?;
            if built.iter().any(|c: &Arc<Constraint>| c.name() == constraint.name()) {
                return Err(KairosError::InvalidPolicy(format!(
                    "{path}: duplicate {class} constraint '{}'",
                    constraint.name()
                )));
            }
            built.push(constraint);
        }
        map.insert(class, built);
    }
    Ok(map)
}

/// A parsed, validated policy document.
pub struct PolicyDocument {
    root: DocumentRoot,
    policy: Arc<EnvironmentPolicy>,
    warnings: Vec<ValidationIssue>,
}

impl PolicyDocument {
    /// Parses a YAML document and assembles the policy tree.
    pub fn from_yaml(text: &str, metadata: PolicyMetadata) -> Result<Self> {
        let root: DocumentRoot = serde_yaml::from_str(text)
            .map_err(|e| KairosError::InvalidPolicy(format!("document does not parse: {e}")))?;

        if root.schema_version != SCHEMA_VERSION {
            return Err(KairosError::InvalidPolicy(format!(
                "unsupported schema version {}, expected {SCHEMA_VERSION}",
                root.schema_version
            )));
        }

        let mut warnings = Vec::new();
        let policy = Self::assemble(&root, metadata, &mut warnings)?;

        Ok(Self {
            root,
            policy,
            warnings,
        })
    }

    fn assemble(
        root: &DocumentRoot,
        metadata: PolicyMetadata,
        warnings: &mut Vec<ValidationIssue>,
    ) -> Result<Arc<EnvironmentPolicy>> {
        let env_node = &root.environment;
        let env_path = env_node.name.clone();

        let environment = EnvironmentPolicy::new(
            &env_node.name,
            &env_node.description,
            build_acl(&env_node.access, &env_path, warnings)?,
            build_constraints(&env_node.constraints, &env_path)?,
            metadata,
        )?;

        for sys_node in &env_node.systems {
            let sys_path = format!("{env_path}.{}", sys_node.name);
            let system = SystemPolicy::new(
                &sys_node.name,
                &sys_node.description,
                build_acl(&sys_node.access, &sys_path, warnings)?,
                build_constraints(&sys_node.constraints, &sys_path)?,
            )?;
            environment.add_system(system.clone())?;

            for group_node in &sys_node.groups {
                let group_path = format!("{sys_path}.{}", group_node.name);
                let group = JitGroupPolicy::new(
                    &group_node.name,
                    &group_node.description,
                    build_acl(&group_node.access, &group_path, warnings)?,
                    build_constraints(&group_node.constraints, &group_path)?,
                    group_node.privileges.clone(),
                )?;
                system.add_group(group.clone())?;

                let has_expiry = group
                    .effective_constraints(ConstraintClass::Join)
                    .iter()
                    .any(|c| c.as_expiry().is_some());
                if !has_expiry {
                    warnings.push(ValidationIssue::warning(
                        &group_path,
                        "no join expiry constraint in scope; joins cannot be executed",
                    ));
                }
                if group_node.privileges.is_empty() {
                    warnings.push(ValidationIssue::warning(
                        &group_path,
                        "group confers no privileges",
                    ));
                }
            }
        }

        Ok(environment)
    }

    /// The assembled environment policy.
    pub fn policy(&self) -> &Arc<EnvironmentPolicy> {
        &self.policy
    }

    /// Non-fatal validation findings.
    pub fn warnings(&self) -> &[ValidationIssue] {
        &self.warnings
    }

    /// Re-serializes the document in canonical form.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.root)
            .map_err(|e| KairosError::Internal(format!("cannot serialize document: {e}")))
    }
}

impl fmt::Debug for PolicyDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyDocument")
            .field("environment", &self.root.environment.name)
            .field("warnings", &self.warnings.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::Principal;
    use std::collections::BTreeSet;

    fn metadata() -> PolicyMetadata {
        PolicyMetadata::new("test", None)
    }

    const MINIMAL: &str = r#"
schemaVersion: 1
environment:
  name: env-1
  description: Development sandbox
  systems:
    - name: sys-1
      groups:
        - name: g-1
          access:
            - principal: "user:alice@example.com"
              allow: "JOIN, APPROVE_SELF"
          constraints:
            join:
              - type: expiry
                min: 60
                max: 60
          privileges:
            - kind: iam_role_binding
              resource: { type: project, name: projects/demo }
              role: roles/compute.viewer
"#;

    #[test]
    fn test_minimal_document_parses() {
        let doc = PolicyDocument::from_yaml(MINIMAL, metadata()).unwrap();
        let env = doc.policy();

        assert_eq!(env.name(), "env-1");
        let group = env.system("sys-1").unwrap().group("g-1").unwrap();
        assert_eq!(group.privileges().len(), 1);
        assert_eq!(group.id().unwrap().to_string(), "env-1.sys-1.g-1");
    }

    #[test]
    fn test_acl_entries_are_built_in_order() {
        let doc = PolicyDocument::from_yaml(MINIMAL, metadata()).unwrap();
        let group = doc.policy().system("sys-1").unwrap().group("g-1").unwrap();

        let principals: BTreeSet<Principal> = BTreeSet::from([Principal::User(
            crate::principal::UserId::new("alice@example.com").unwrap(),
        )]);
        assert!(group.is_allowed_by_acl(
            &principals,
            PolicyPermission::JOIN | PolicyPermission::APPROVE_SELF
        ));
        assert!(!group.is_allowed_by_acl(&principals, PolicyPermission::EXPORT));
    }

    #[test]
    fn test_unknown_schema_version_rejected() {
        let text = MINIMAL.replace("schemaVersion: 1", "schemaVersion: 7");
        assert!(matches!(
            PolicyDocument::from_yaml(&text, metadata()),
            Err(KairosError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn test_unknown_permission_rejected() {
        let text = MINIMAL.replace("JOIN, APPROVE_SELF", "JOIN, SUDO");
        let err = PolicyDocument::from_yaml(&text, metadata()).unwrap_err();
        assert!(err.to_string().contains("SUDO"));
    }

    #[test]
    fn test_entry_with_both_allow_and_deny_rejected() {
        let text = MINIMAL.replace(
            "allow: \"JOIN, APPROVE_SELF\"",
            "allow: \"JOIN\"\n              deny: \"EXPORT\"",
        );
        assert!(PolicyDocument::from_yaml(&text, metadata()).is_err());
    }

    #[test]
    fn test_missing_expiry_constraint_is_a_warning() {
        let text = r#"
schemaVersion: 1
environment:
  name: env-1
  systems:
    - name: sys-1
      groups:
        - name: g-1
"#;
        let doc = PolicyDocument::from_yaml(text, metadata()).unwrap();
        assert!(doc
            .warnings()
            .iter()
            .any(|w| w.path == "env-1.sys-1.g-1" && w.message.contains("expiry")));
    }

    #[test]
    fn test_environment_expiry_satisfies_group_lint() {
        let text = r#"
schemaVersion: 1
environment:
  name: env-1
  constraints:
    join:
      - type: expiry
        min: 60
        max: 3600
  systems:
    - name: sys-1
      groups:
        - name: g-1
          privileges:
            - kind: iam_role_binding
              resource: { type: project, name: projects/demo }
              role: roles/viewer
"#;
        let doc = PolicyDocument::from_yaml(text, metadata()).unwrap();
        assert!(!doc.warnings().iter().any(|w| w.message.contains("expiry")));
    }

    #[test]
    fn test_duplicate_constraint_names_rejected() {
        let text = r#"
schemaVersion: 1
environment:
  name: env-1
  constraints:
    join:
      - type: expiry
        min: 60
        max: 60
      - type: expiry
        min: 120
        max: 120
  systems: []
"#;
        let err = PolicyDocument::from_yaml(text, metadata()).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_expression_constraint_parses() {
        let text = r#"
schemaVersion: 1
environment:
  name: env-1
  systems:
    - name: sys-1
      groups:
        - name: g-1
          constraints:
            join:
              - type: expression
                name: ticket
                expression: "input.var1 == true"
                properties:
                  - name: var1
                    displayName: Var 1
                    type: bool
                    required: true
              - type: expiry
                min: 60
                max: 60
"#;
        let doc = PolicyDocument::from_yaml(text, metadata()).unwrap();
        let group = doc.policy().system("sys-1").unwrap().group("g-1").unwrap();
        let constraints = group.effective_constraints(ConstraintClass::Join);
        assert_eq!(constraints.len(), 2);
        assert_eq!(constraints[0].name(), "ticket");
    }

    #[test]
    fn test_malformed_expression_rejected_with_path() {
        let text = r#"
schemaVersion: 1
environment:
  name: env-1
  constraints:
    join:
      - type: expression
        name: broken
        expression: "input.x ==="
  systems: []
"#;
        let err = PolicyDocument::from_yaml(text, metadata()).unwrap_err();
        assert!(err.to_string().contains("env-1"));
    }

    #[test]
    fn test_canonical_round_trip() {
        let doc = PolicyDocument::from_yaml(MINIMAL, metadata()).unwrap();
        let canonical = doc.to_yaml().unwrap();

        let again = PolicyDocument::from_yaml(&canonical, metadata()).unwrap();
        assert_eq!(again.policy().name(), "env-1");
        assert_eq!(again.to_yaml().unwrap(), canonical);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let text = MINIMAL.replace("description: Development sandbox", "describe: typo");
        assert!(PolicyDocument::from_yaml(&text, metadata()).is_err());
    }
}
