//! Privileges conferred by a JIT group membership.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A resource a privilege binds to.
///
/// Opaque to the core: the `kind` string tells the resource-manager
/// client how to address it, the `name` is passed through verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Resource type, e.g. `project` or `folder`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Fully qualified resource name.
    pub name: String,
}

impl ResourceRef {
    /// Creates a resource reference.
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// An IAM condition attached to a role binding.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindingCondition {
    /// Short title shown in the resource manager.
    pub title: String,
    /// CEL condition expression.
    pub expression: String,
}

/// An IAM role granted on a resource.
///
/// Equality is by all fields; the checksum is a stable digest of the
/// same fields, used by the provisioner for idempotent reconciliation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IamRoleBinding {
    /// The resource the role is granted on.
    pub resource: ResourceRef,
    /// The role name, e.g. `roles/compute.viewer`.
    pub role: String,
    /// Optional description for audit trails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional IAM condition limiting the binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<BindingCondition>,
}

impl IamRoleBinding {
    /// Creates an unconditional binding.
    pub fn new(resource: ResourceRef, role: impl Into<String>) -> Self {
        Self {
            resource,
            role: role.into(),
            description: None,
            condition: None,
        }
    }

    /// Attaches a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attaches a condition.
    pub fn with_condition(mut self, title: impl Into<String>, expression: impl Into<String>) -> Self {
        self.condition = Some(BindingCondition {
            title: title.into(),
            expression: expression.into(),
        });
        self
    }

    /// Stable 32-bit checksum over all fields.
    ///
    /// Field values are fed through CRC-32 separated by NUL bytes so
    /// that adjacent fields cannot alias.
    pub fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for field in [
            self.resource.kind.as_str(),
            self.resource.name.as_str(),
            self.role.as_str(),
            self.description.as_deref().unwrap_or(""),
            self.condition.as_ref().map(|c| c.title.as_str()).unwrap_or(""),
            self.condition
                .as_ref()
                .map(|c| c.expression.as_str())
                .unwrap_or(""),
        ] {
            hasher.update(field.as_bytes());
            hasher.update(&[0]);
        }
        hasher.finalize()
    }
}

impl fmt::Display for IamRoleBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.role, self.resource)
    }
}

/// A privilege conferred by membership of a JIT group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Privilege {
    /// An IAM role binding on a resource.
    IamRoleBinding(IamRoleBinding),
}

impl Privilege {
    /// The underlying role binding.
    pub fn as_role_binding(&self) -> &IamRoleBinding {
        match self {
            Self::IamRoleBinding(b) => b,
        }
    }

    /// Stable checksum of the privilege.
    pub fn checksum(&self) -> u32 {
        match self {
            Self::IamRoleBinding(b) => b.checksum(),
        }
    }
}

/// Order-independent checksum of a binding set.
///
/// XOR folding keeps the digest independent of declaration order, so
/// reordering privileges in a policy document does not trigger
/// reprovisioning.
pub fn bindings_checksum<'a>(bindings: impl IntoIterator<Item = &'a IamRoleBinding>) -> u32 {
    bindings.into_iter().fold(0, |acc, b| acc ^ b.checksum())
}
