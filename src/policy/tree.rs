//! The hierarchical policy tree.
//!
//! Three levels: environment, system, JIT group. Each node carries an
//! optional ACL (absent means allow-all, empty means deny-all) and a
//! constraint map keyed by class. Children are owned by their parent in
//! a name-keyed ordered map; parents are reachable through weak,
//! write-once back-references used for inheritance lookups.
//!
//! Nodes are assembled once at policy-load time and read-only
//! afterwards, so the tree can be shared across requests without
//! locking on the evaluation path.

use crate::constraint::{Constraint, ConstraintClass};
use crate::errors::{KairosError, Result};
use crate::policy::acl::AccessControlList;
use crate::policy::id::JitGroupId;
use crate::policy::permission::PolicyPermission;
use crate::policy::privilege::Privilege;
use crate::principal::Principal;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock, RwLock, Weak};
use time::OffsetDateTime;

/// Maximum length of an environment name.
pub const MAX_ENVIRONMENT_NAME_LEN: usize = 16;

/// Maximum length of a system or group name.
pub const MAX_COMPONENT_NAME_LEN: usize = 32;

/// Where a policy was loaded from.
#[derive(Clone, Debug, PartialEq)]
pub struct PolicyMetadata {
    /// Source locator, e.g. a file path or secret name.
    pub source: String,
    /// Last modification time of the source, if known.
    pub last_modified: Option<OffsetDateTime>,
}

impl PolicyMetadata {
    /// Creates metadata for a source.
    pub fn new(source: impl Into<String>, last_modified: Option<OffsetDateTime>) -> Self {
        Self {
            source: source.into(),
            last_modified,
        }
    }
}

/// Constraints of a node, keyed by class, in policy order.
pub type ConstraintMap = BTreeMap<ConstraintClass, Vec<Arc<Constraint>>>;

fn validate_environment_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > MAX_ENVIRONMENT_NAME_LEN
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(KairosError::InvalidPolicy(format!(
            "'{name}' is not a valid environment name"
        )));
    }
    Ok(())
}

fn validate_component_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > MAX_COMPONENT_NAME_LEN
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(KairosError::InvalidPolicy(format!(
            "'{name}' is not a valid {kind} name"
        )));
    }
    Ok(())
}

/// Child constraints shadow parent constraints with the same name;
/// otherwise union, child-first.
fn merge_constraints(
    child: Vec<Arc<Constraint>>,
    parent: Vec<Arc<Constraint>>,
) -> Vec<Arc<Constraint>> {
    let mut merged = child;
    for candidate in parent {
        if !merged.iter().any(|c| c.name() == candidate.name()) {
            merged.push(candidate);
        }
    }
    merged
}

fn allowed_by(
    acl: Option<&AccessControlList>,
    principals: &BTreeSet<Principal>,
    required: PolicyPermission,
) -> bool {
    acl.map_or(true, |a| a.is_allowed(principals, required))
}

/// Root of a policy tree: one environment and its systems.
pub struct EnvironmentPolicy {
    name: String,
    description: String,
    acl: Option<AccessControlList>,
    constraints: ConstraintMap,
    metadata: PolicyMetadata,
    systems: RwLock<BTreeMap<String, Arc<SystemPolicy>>>,
}

impl EnvironmentPolicy {
    /// Creates an environment node with no systems.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        acl: Option<AccessControlList>,
        constraints: ConstraintMap,
        metadata: PolicyMetadata,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        validate_environment_name(&name)?;
        Ok(Arc::new(Self {
            name,
            description: description.into(),
            acl,
            constraints,
            metadata,
            systems: RwLock::new(BTreeMap::new()),
        }))
    }

    /// The environment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The environment description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The node's own ACL, if declared.
    pub fn acl(&self) -> Option<&AccessControlList> {
        self.acl.as_ref()
    }

    /// The load metadata.
    pub fn metadata(&self) -> &PolicyMetadata {
        &self.metadata
    }

    /// Inserts a system, wiring up its parent link.
    ///
    /// Fails when a sibling of the same name exists or the system is
    /// already attached elsewhere.
    pub fn add_system(self: &Arc<Self>, system: Arc<SystemPolicy>) -> Result<()> {
        let key = system.name().to_ascii_lowercase();
        let mut systems = self.systems.write().unwrap_or_else(|e| e.into_inner());
        if systems.contains_key(&key) {
            return Err(KairosError::InvalidPolicy(format!(
                "environment '{}' already contains a system named '{}'",
                self.name,
                system.name()
            )));
        }
        system.set_parent(Arc::downgrade(self))?;
        systems.insert(key, system);
        Ok(())
    }

    /// The systems, sorted by name.
    pub fn systems(&self) -> Vec<Arc<SystemPolicy>> {
        self.systems
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Looks up a system by name, case-insensitively.
    pub fn system(&self, name: &str) -> Option<Arc<SystemPolicy>> {
        self.systems
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&name.to_ascii_lowercase())
            .cloned()
    }

    /// Whether the subject holds `required` under this node's ACL.
    pub fn is_allowed_by_acl(
        &self,
        principals: &BTreeSet<Principal>,
        required: PolicyPermission,
    ) -> bool {
        allowed_by(self.acl.as_ref(), principals, required)
    }

    /// The environment's own constraints for a class, in policy order.
    pub fn effective_constraints(&self, class: ConstraintClass) -> Vec<Arc<Constraint>> {
        self.constraints.get(&class).cloned().unwrap_or_default()
    }
}

/// A system below an environment, grouping related JIT groups.
pub struct SystemPolicy {
    name: String,
    description: String,
    acl: Option<AccessControlList>,
    constraints: ConstraintMap,
    metadata: Option<PolicyMetadata>,
    parent: OnceLock<Weak<EnvironmentPolicy>>,
    groups: RwLock<BTreeMap<String, Arc<JitGroupPolicy>>>,
}

impl SystemPolicy {
    /// Creates a detached system node.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        acl: Option<AccessControlList>,
        constraints: ConstraintMap,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        validate_component_name("system", &name)?;
        Ok(Arc::new(Self {
            name,
            description: description.into(),
            acl,
            constraints,
            metadata: None,
            parent: OnceLock::new(),
            groups: RwLock::new(BTreeMap::new()),
        }))
    }

    /// The system name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The system description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The node's own ACL, if declared.
    pub fn acl(&self) -> Option<&AccessControlList> {
        self.acl.as_ref()
    }

    /// The owning environment, if attached.
    pub fn parent(&self) -> Option<Arc<EnvironmentPolicy>> {
        self.parent.get().and_then(Weak::upgrade)
    }

    /// The metadata, defaulting to the parent's.
    pub fn metadata(&self) -> Option<PolicyMetadata> {
        self.metadata
            .clone()
            .or_else(|| self.parent().map(|p| p.metadata().clone()))
    }

    fn set_parent(&self, parent: Weak<EnvironmentPolicy>) -> Result<()> {
        self.parent.set(parent).map_err(|_| {
            KairosError::InvalidPolicy(format!(
                "system '{}' is already attached to an environment",
                self.name
            ))
        })
    }

    /// Inserts a group, wiring up its parent link.
    pub fn add_group(self: &Arc<Self>, group: Arc<JitGroupPolicy>) -> Result<()> {
        let key = group.name().to_ascii_lowercase();
        let mut groups = self.groups.write().unwrap_or_else(|e| e.into_inner());
        if groups.contains_key(&key) {
            return Err(KairosError::InvalidPolicy(format!(
                "system '{}' already contains a group named '{}'",
                self.name,
                group.name()
            )));
        }
        group.set_parent(Arc::downgrade(self))?;
        groups.insert(key, group);
        Ok(())
    }

    /// The groups, sorted by name.
    pub fn groups(&self) -> Vec<Arc<JitGroupPolicy>> {
        self.groups
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Looks up a group by name, case-insensitively.
    pub fn group(&self, name: &str) -> Option<Arc<JitGroupPolicy>> {
        self.groups
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&name.to_ascii_lowercase())
            .cloned()
    }

    /// Whether the subject holds `required` here and at every ancestor.
    pub fn is_allowed_by_acl(
        &self,
        principals: &BTreeSet<Principal>,
        required: PolicyPermission,
    ) -> bool {
        if !allowed_by(self.acl.as_ref(), principals, required) {
            return false;
        }
        self.parent()
            .map_or(true, |env| env.is_allowed_by_acl(principals, required))
    }

    /// Constraints for a class, with this node's entries shadowing the
    /// environment's by name.
    pub fn effective_constraints(&self, class: ConstraintClass) -> Vec<Arc<Constraint>> {
        let own = self.constraints.get(&class).cloned().unwrap_or_default();
        let inherited = self
            .parent()
            .map(|env| env.effective_constraints(class))
            .unwrap_or_default();
        merge_constraints(own, inherited)
    }
}

/// A joinable JIT group and the privileges it confers.
pub struct JitGroupPolicy {
    name: String,
    description: String,
    acl: Option<AccessControlList>,
    constraints: ConstraintMap,
    privileges: Vec<Privilege>,
    parent: OnceLock<Weak<SystemPolicy>>,
}

impl JitGroupPolicy {
    /// Creates a detached group node.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        acl: Option<AccessControlList>,
        constraints: ConstraintMap,
        privileges: Vec<Privilege>,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        validate_component_name("group", &name)?;
        Ok(Arc::new(Self {
            name,
            description: description.into(),
            acl,
            constraints,
            privileges,
            parent: OnceLock::new(),
        }))
    }

    /// The group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The group description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The node's own ACL, if declared.
    pub fn acl(&self) -> Option<&AccessControlList> {
        self.acl.as_ref()
    }

    /// The privileges conferred by membership, in policy order.
    pub fn privileges(&self) -> &[Privilege] {
        &self.privileges
    }

    /// The owning system, if attached.
    pub fn parent(&self) -> Option<Arc<SystemPolicy>> {
        self.parent.get().and_then(Weak::upgrade)
    }

    fn set_parent(&self, parent: Weak<SystemPolicy>) -> Result<()> {
        self.parent.set(parent).map_err(|_| {
            KairosError::InvalidPolicy(format!(
                "group '{}' is already attached to a system",
                self.name
            ))
        })
    }

    /// The fully qualified id of this group.
    ///
    /// Fails on a node that was never attached to a tree.
    pub fn id(&self) -> Result<JitGroupId> {
        let system = self
            .parent()
            .ok_or_else(|| KairosError::Internal(format!("group '{}' is detached", self.name)))?;
        let environment = system.parent().ok_or_else(|| {
            KairosError::Internal(format!("system '{}' is detached", system.name()))
        })?;
        Ok(JitGroupId::new(
            environment.name(),
            system.name(),
            &self.name,
        ))
    }

    /// Whether the subject holds `required` here and at every ancestor.
    pub fn is_allowed_by_acl(
        &self,
        principals: &BTreeSet<Principal>,
        required: PolicyPermission,
    ) -> bool {
        if !allowed_by(self.acl.as_ref(), principals, required) {
            return false;
        }
        self.parent()
            .map_or(true, |sys| sys.is_allowed_by_acl(principals, required))
    }

    /// Constraints for a class, with group entries shadowing system and
    /// environment entries by name, child-first.
    pub fn effective_constraints(&self, class: ConstraintClass) -> Vec<Arc<Constraint>> {
        let own = self.constraints.get(&class).cloned().unwrap_or_default();
        let inherited = self
            .parent()
            .map(|sys| sys.effective_constraints(class))
            .unwrap_or_default();
        merge_constraints(own, inherited)
    }
}
