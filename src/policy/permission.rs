//! Policy permission bitmask for fast ACL checks.
//!
//! The permission vocabulary is small and closed; a u32 bitmask keeps
//! ACL evaluation down to a few CPU instructions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A set of policy permissions encoded as a u32 bitmask.
///
/// # Example
///
/// ```rust
/// use kairos_core::policy::PolicyPermission;
///
/// let required = PolicyPermission::JOIN.union(PolicyPermission::APPROVE_SELF);
/// let granted = PolicyPermission::VIEW
///     .union(PolicyPermission::JOIN)
///     .union(PolicyPermission::APPROVE_SELF);
/// assert!(granted.covers(required));
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyPermission {
    bits: u32,
}

impl PolicyPermission {
    /// Empty set (no permissions).
    pub const NONE: Self = Self { bits: 0 };

    /// See the group and its metadata.
    pub const VIEW: Self = Self { bits: 1 << 0 };

    /// Request to join the group.
    pub const JOIN: Self = Self { bits: 1 << 1 };

    /// Approve one's own join request.
    pub const APPROVE_SELF: Self = Self { bits: 1 << 2 };

    /// Approve join requests raised by other users.
    pub const APPROVE_OTHERS: Self = Self { bits: 1 << 3 };

    /// Export the environment's policy document.
    pub const EXPORT: Self = Self { bits: 1 << 4 };

    /// Trigger reconciliation and read compliance reports.
    pub const RECONCILE: Self = Self { bits: 1 << 5 };

    /// All defined permissions.
    pub const ALL: Self = Self { bits: (1 << 6) - 1 };

    const NAMES: [(Self, &'static str); 6] = [
        (Self::VIEW, "VIEW"),
        (Self::JOIN, "JOIN"),
        (Self::APPROVE_SELF, "APPROVE_SELF"),
        (Self::APPROVE_OTHERS, "APPROVE_OTHERS"),
        (Self::EXPORT, "EXPORT"),
        (Self::RECONCILE, "RECONCILE"),
    ];

    /// Whether no permission is set.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.bits == 0
    }

    /// Whether ALL permissions in `required` are present.
    #[inline]
    pub const fn covers(self, required: Self) -> bool {
        self.bits & required.bits == required.bits
    }

    /// Whether ANY permission in `other` is present.
    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        self.bits & other.bits != 0
    }

    /// Union (OR) of two sets.
    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    /// Intersection (AND) of two sets.
    #[inline]
    pub const fn intersection(self, other: Self) -> Self {
        Self {
            bits: self.bits & other.bits,
        }
    }

    /// Removes the permissions present in `other`.
    #[inline]
    pub const fn subtract(self, other: Self) -> Self {
        Self {
            bits: self.bits & !other.bits,
        }
    }

    /// Number of permissions set.
    #[inline]
    pub const fn count(self) -> u32 {
        self.bits.count_ones()
    }

    /// Parses a single permission name (as written in policy documents).
    pub fn parse_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        Self::NAMES
            .iter()
            .find(|(_, n)| *n == upper)
            .map(|(p, _)| *p)
    }

    /// The names of the permissions in this set, in declaration order.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(p, _)| self.covers(*p))
            .map(|(_, n)| *n)
            .collect()
    }
}

impl fmt::Debug for PolicyPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PolicyPermission({:#08b})", self.bits)
    }
}

impl fmt::Display for PolicyPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "(none)")
        } else {
            write!(f, "{}", self.names().join("|"))
        }
    }
}

impl std::ops::BitOr for PolicyPermission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl std::ops::BitAnd for PolicyPermission {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        self.intersection(rhs)
    }
}

impl std::ops::BitOrAssign for PolicyPermission {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}
