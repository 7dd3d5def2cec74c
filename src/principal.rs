//! Principal and identity model.
//!
//! A [`Principal`] is anything an ACL entry can name: an individual
//! user, a group, a time-bounded JIT group membership, or the class of
//! all authenticated users. A [`Subject`] carries the authenticated user
//! plus the full principal set used for policy evaluation; the set is
//! resolved lazily and memoized for the lifetime of the request (see
//! [`crate::subject::SubjectResolver`]).

use crate::errors::{KairosError, Result};
use crate::policy::JitGroupId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::OnceCell;

/// Email-typed user identity, canonicalized to lowercase.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Creates a user id from an email address.
    pub fn new(email: impl Into<String>) -> Result<Self> {
        let email = email.into().trim().to_ascii_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(KairosError::invalid_input(
                "user",
                format!("'{email}' is not a valid email address"),
            ));
        }
        Ok(Self(email))
    }

    /// The canonical (lowercase) email address.
    pub fn email(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UserId {
    type Err = KairosError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Email-typed group identity, canonicalized to lowercase.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    /// Creates a group id from an email address.
    pub fn new(email: impl Into<String>) -> Result<Self> {
        let email = email.into().trim().to_ascii_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(KairosError::invalid_input(
                "group",
                format!("'{email}' is not a valid email address"),
            ));
        }
        Ok(Self(email))
    }

    /// The canonical (lowercase) email address.
    pub fn email(&self) -> &str {
        &self.0
    }

    /// The part before the `@`.
    pub fn local_part(&self) -> &str {
        self.0.split('@').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GroupId {
    type Err = KairosError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// An active, time-bounded membership of a JIT group.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JitGroupMembership {
    /// The group the subject is a member of.
    pub id: JitGroupId,
    /// When the membership expires.
    pub expiry: OffsetDateTime,
}

impl JitGroupMembership {
    /// Creates a membership principal.
    pub fn new(id: JitGroupId, expiry: OffsetDateTime) -> Self {
        Self { id, expiry }
    }

    /// Whether the membership is active at `now`.
    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        self.expiry > now
    }
}

/// Anything an ACL entry can name.
///
/// Equality is by `(kind, value)`: two memberships of the same group are
/// equal regardless of expiry, so that a subject's live membership
/// matches an ACL entry naming the group. The expiry rides along as
/// attached data.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
    /// Every authenticated user.
    AllAuthenticatedUsers,
    /// An individual user.
    User(UserId),
    /// A (non-JIT) group.
    Group(GroupId),
    /// An active JIT group membership with expiry.
    JitGroupMembership(JitGroupMembership),
}

impl Principal {
    /// Rank used for ordering between kinds.
    fn kind_rank(&self) -> u8 {
        match self {
            Principal::AllAuthenticatedUsers => 0,
            Principal::User(_) => 1,
            Principal::Group(_) => 2,
            Principal::JitGroupMembership(_) => 3,
        }
    }

    /// The value component compared within a kind.
    fn value(&self) -> String {
        match self {
            Principal::AllAuthenticatedUsers => String::new(),
            Principal::User(u) => u.email().to_string(),
            Principal::Group(g) => g.email().to_string(),
            Principal::JitGroupMembership(m) => m.id.to_string(),
        }
    }

    /// The membership payload, if this principal is a JIT membership.
    pub fn as_jit_membership(&self) -> Option<&JitGroupMembership> {
        match self {
            Principal::JitGroupMembership(m) => Some(m),
            _ => None,
        }
    }
}

impl PartialEq for Principal {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Principal::AllAuthenticatedUsers, Principal::AllAuthenticatedUsers) => true,
            (Principal::User(a), Principal::User(b)) => a == b,
            (Principal::Group(a), Principal::Group(b)) => a == b,
            (Principal::JitGroupMembership(a), Principal::JitGroupMembership(b)) => a.id == b.id,
            _ => false,
        }
    }
}

impl Eq for Principal {}

impl Hash for Principal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind_rank().hash(state);
        match self {
            Principal::AllAuthenticatedUsers => {}
            Principal::User(u) => u.hash(state),
            Principal::Group(g) => g.hash(state),
            Principal::JitGroupMembership(m) => m.id.hash(state),
        }
    }
}

impl PartialOrd for Principal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Principal {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind_rank()
            .cmp(&other.kind_rank())
            .then_with(|| self.value().cmp(&other.value()))
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::AllAuthenticatedUsers => write!(f, "class:authenticated-users"),
            Principal::User(u) => write!(f, "user:{u}"),
            Principal::Group(g) => write!(f, "group:{g}"),
            Principal::JitGroupMembership(m) => write!(f, "jit-group:{}", m.id),
        }
    }
}

/// Device metadata forwarded by the authentication layer.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Device {
    /// Opaque device identifier, if the client presented one.
    pub device_id: Option<String>,
    /// Access levels asserted for the device.
    pub access_levels: Vec<String>,
}

/// Source of a subject's principal set.
///
/// Implemented by [`crate::subject::SubjectResolver`]; a trait seam so
/// subjects can be built with canned principal sets in tests.
#[async_trait::async_trait]
pub trait PrincipalSource: Send + Sync {
    /// Expands a user into the full principal set.
    async fn expand(&self, user: &UserId) -> Result<BTreeSet<Principal>>;
}

/// The authenticated user plus every principal they carry into policy
/// evaluation.
///
/// Principal resolution is lazy: the set is fetched from the
/// [`PrincipalSource`] on first access and memoized for the lifetime of
/// the subject. Concurrent first accesses coalesce into a single
/// resolution.
///
/// Invariant: the user principal is always a member of the resolved set.
pub struct Subject {
    user: UserId,
    source: Arc<dyn PrincipalSource>,
    principals: OnceCell<BTreeSet<Principal>>,
}

impl Subject {
    /// Creates a subject whose principals are resolved on demand.
    pub fn new(user: UserId, source: Arc<dyn PrincipalSource>) -> Self {
        Self {
            user,
            source,
            principals: OnceCell::new(),
        }
    }

    /// Creates a subject with a pre-resolved principal set.
    ///
    /// The user principal is inserted if missing, preserving the subject
    /// invariant.
    pub fn with_principals(user: UserId, mut principals: BTreeSet<Principal>) -> Self {
        principals.insert(Principal::User(user.clone()));
        let cell = OnceCell::new();
        // A fresh cell cannot already be initialized.
        cell.set(principals).ok();
        Self {
            user,
            source: Arc::new(EmptySource),
            principals: cell,
        }
    }

    /// The authenticated user.
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// The subject's principal set, resolving it on first access.
    pub async fn principals(&self) -> Result<&BTreeSet<Principal>> {
        self.principals
            .get_or_try_init(|| async {
                let mut set = self.source.expand(&self.user).await?;
                set.insert(Principal::User(self.user.clone()));
                Ok(set)
            })
            .await
    }

    /// The subject's active membership of `group`, if any.
    pub async fn active_membership(
        &self,
        group: &JitGroupId,
        now: OffsetDateTime,
    ) -> Result<Option<JitGroupMembership>> {
        Ok(self
            .principals()
            .await?
            .iter()
            .filter_map(Principal::as_jit_membership)
            .find(|m| &m.id == group && m.is_active(now))
            .cloned())
    }
}

impl fmt::Debug for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("user", &self.user)
            .field("resolved", &self.principals.initialized())
            .finish()
    }
}

struct EmptySource;

#[async_trait::async_trait]
impl PrincipalSource for EmptySource {
    async fn expand(&self, _user: &UserId) -> Result<BTreeSet<Principal>> {
        Ok(BTreeSet::new())
    }
}
