//! Collaborator contracts: identity provider and resource manager.
//!
//! The core never talks to the outside world directly; it goes through
//! these traits. Implementations are expected to apply the configured
//! connect/read/write timeouts to every outbound call and to map
//! provider-specific failures onto the error taxonomy (`NotFound`,
//! `AlreadyExists`, `Conflict`, `Transport`).

use crate::errors::Result;
use crate::policy::{BindingCondition, ResourceRef};
use crate::principal::{GroupId, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Type of a directory group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupType {
    /// A security group, usable in IAM bindings.
    Security,
}

/// A group as stored in the identity provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExternalGroup {
    /// The group's email address.
    pub id: GroupId,
    /// Display name.
    pub display_name: String,
    /// Free-form description; the provisioner embeds its checksum tag
    /// here.
    pub description: String,
}

/// Opaque identifier of a membership record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MembershipId(pub String);

impl MembershipId {
    /// Creates a membership id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// A membership as returned by a listing: enough to know which group,
/// not yet the role details.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MembershipSummary {
    /// Identifier for fetching the full record.
    pub id: MembershipId,
    /// The group the user is a member of.
    pub group: GroupId,
}

/// A role within a membership, optionally time-bounded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MembershipRole {
    /// Role name, e.g. `MEMBER`.
    pub name: String,
    /// When the role expires, if it does.
    pub expiry: Option<OffsetDateTime>,
}

/// A full membership record with its roles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    /// The record's identifier.
    pub id: MembershipId,
    /// The group the membership is in.
    pub group: GroupId,
    /// Roles held, with their expiries.
    pub roles: Vec<MembershipRole>,
}

impl Membership {
    /// The earliest role expiry, if any role is time-bounded.
    pub fn earliest_expiry(&self) -> Option<OffsetDateTime> {
        self.roles.iter().filter_map(|r| r.expiry).min()
    }
}

/// Identity provider client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Lists all direct group memberships of a user.
    async fn list_memberships_by_user(&self, user: &UserId) -> Result<Vec<MembershipSummary>>;

    /// Fetches a membership record with role details.
    async fn get_membership(&self, id: &MembershipId) -> Result<Membership>;

    /// Fetches a group by email.
    async fn get_group(&self, id: &GroupId) -> Result<ExternalGroup>;

    /// Creates a group.
    async fn create_group(
        &self,
        id: &GroupId,
        group_type: GroupType,
        display_name: &str,
        description: &str,
    ) -> Result<ExternalGroup>;

    /// Adds or updates a user's membership with an expiry.
    async fn add_membership(
        &self,
        group: &GroupId,
        user: &UserId,
        expiry: OffsetDateTime,
    ) -> Result<()>;

    /// Replaces a group's description.
    async fn patch_group(&self, id: &GroupId, description: &str) -> Result<()>;

    /// Lists groups whose email local part starts with `prefix`.
    async fn search_groups_by_prefix(&self, prefix: &str) -> Result<Vec<ExternalGroup>>;
}

/// One binding in an IAM policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IamBinding {
    /// The bound role.
    pub role: String,
    /// Member strings, e.g. `group:jit.env-1.sys-1.g-1@example.com`.
    pub members: Vec<String>,
    /// Optional condition limiting the binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<BindingCondition>,
}

/// An IAM policy with its concurrency token.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IamPolicy {
    /// The policy's bindings.
    pub bindings: Vec<IamBinding>,
    /// Opaque optimistic-concurrency token.
    pub etag: String,
}

/// Resource manager client.
///
/// `modify_iam_policy` performs a single read-modify-write round: read
/// the current policy, apply the mutator, write back under the read
/// etag. A concurrent writer surfaces as `Conflict`; the caller owns
/// the retry budget.
#[async_trait]
pub trait IamClient: Send + Sync {
    /// Atomically modifies a resource's IAM policy.
    async fn modify_iam_policy(
        &self,
        resource: &ResourceRef,
        mutator: &(dyn for<'r> Fn(&'r mut IamPolicy) + Send + Sync),
        rationale: &str,
    ) -> Result<()>;
}
