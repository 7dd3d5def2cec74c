//! Access control lists over principal sets.
//!
//! An ACL is an ordered sequence of allow/deny entries. Evaluation
//! walks the entries in declared order: the first matching deny whose
//! mask intersects the requested permissions wins; otherwise the union
//! of matching allow masks must cover the request. Inheritance across
//! the policy tree is handled by the tree itself (each node's ACL is
//! evaluated independently and combined with AND).

use crate::policy::PolicyPermission;
use crate::principal::Principal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A single ACL entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum AclEntry {
    /// Grants `permissions` to subjects carrying `principal`.
    Allow {
        /// The principal this entry applies to.
        principal: Principal,
        /// The permissions granted.
        permissions: PolicyPermission,
    },
    /// Denies `permissions` to subjects carrying `principal`.
    Deny {
        /// The principal this entry applies to.
        principal: Principal,
        /// The permissions denied.
        permissions: PolicyPermission,
    },
}

impl AclEntry {
    /// Creates an allow entry.
    pub fn allow(principal: Principal, permissions: PolicyPermission) -> Self {
        Self::Allow {
            principal,
            permissions,
        }
    }

    /// Creates a deny entry.
    pub fn deny(principal: Principal, permissions: PolicyPermission) -> Self {
        Self::Deny {
            principal,
            permissions,
        }
    }

    /// The principal this entry names.
    pub fn principal(&self) -> &Principal {
        match self {
            Self::Allow { principal, .. } | Self::Deny { principal, .. } => principal,
        }
    }

    /// The permission mask this entry carries.
    pub fn permissions(&self) -> PolicyPermission {
        match self {
            Self::Allow { permissions, .. } | Self::Deny { permissions, .. } => *permissions,
        }
    }

    /// Whether a subject with `principals` matches this entry.
    ///
    /// A subject matches iff any principal in its set equals the entry
    /// principal (membership equality ignores expiry).
    fn matches(&self, principals: &BTreeSet<Principal>) -> bool {
        principals.contains(self.principal())
    }
}

impl fmt::Display for AclEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow {
                principal,
                permissions,
            } => write!(f, "allow {principal} {permissions}"),
            Self::Deny {
                principal,
                permissions,
            } => write!(f, "deny {principal} {permissions}"),
        }
    }
}

/// Ordered access control list.
///
/// An empty list denies everything; the *absence* of an ACL on a policy
/// node means allow-all, which the tree models as `Option<AccessControlList>`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessControlList {
    entries: Vec<AclEntry>,
}

impl AccessControlList {
    /// Creates an ACL from entries, preserving their order.
    pub fn new(entries: Vec<AclEntry>) -> Self {
        Self { entries }
    }

    /// Creates an empty (deny-all) ACL.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The entries in declared order.
    pub fn entries(&self) -> &[AclEntry] {
        &self.entries
    }

    /// Evaluates the list for a subject requesting `required`.
    ///
    /// Entries are walked in declared order. A matching deny whose mask
    /// intersects `required` short-circuits to false. Otherwise the
    /// union of matching allow masks must cover `required`.
    pub fn is_allowed(
        &self,
        principals: &BTreeSet<Principal>,
        required: PolicyPermission,
    ) -> bool {
        if required.is_empty() {
            return true;
        }

        let mut granted = PolicyPermission::NONE;
        for entry in &self.entries {
            if !entry.matches(principals) {
                continue;
            }
            match entry {
                AclEntry::Deny { permissions, .. } => {
                    if permissions.intersects(required) {
                        return false;
                    }
                }
                AclEntry::Allow { permissions, .. } => {
                    granted |= *permissions;
                }
            }
        }

        granted.covers(required)
    }

    /// The union of permissions the subject holds under this list.
    ///
    /// Deny entries subtract after all allows are collected, matching
    /// the per-mask semantics of [`Self::is_allowed`] for single
    /// permissions.
    pub fn effective_permissions(&self, principals: &BTreeSet<Principal>) -> PolicyPermission {
        let mut granted = PolicyPermission::NONE;
        let mut denied = PolicyPermission::NONE;
        for entry in &self.entries {
            if !entry.matches(principals) {
                continue;
            }
            match entry {
                AclEntry::Allow { permissions, .. } => granted |= *permissions,
                AclEntry::Deny { permissions, .. } => denied |= *permissions,
            }
        }
        granted.subtract(denied)
    }
}
