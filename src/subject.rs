//! Subject resolution: expanding a user into their principal set.
//!
//! Resolution lists the user's direct group memberships, partitions
//! them into JIT groups and ordinary groups, and fetches the membership
//! details of the JIT ones in parallel (bounded by a shared semaphore)
//! to extract expiries. Individual lookup failures are tolerated: a
//! membership that vanished or has no expiry is dropped with a log
//! line, and only a failure of the initial listing fails the
//! resolution as a whole.

use crate::clients::{DirectoryClient, MembershipSummary};
use crate::errors::{KairosError, Result};
use crate::policy::JitGroupId;
use crate::principal::{GroupId, JitGroupMembership, Principal, PrincipalSource, Subject, UserId};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

/// Email local-part prefix of provisioned JIT groups.
pub const JIT_GROUP_PREFIX: &str = "jit";

/// Maps JIT group ids to directory group emails and back.
///
/// A group `env-1.sys-1.g-1` under domain `example.com` is backed by
/// the directory group `jit.env-1.sys-1.g-1@example.com`.
#[derive(Clone, Debug)]
pub struct GroupMapping {
    domain: String,
}

impl GroupMapping {
    /// Creates a mapping for the configured domain.
    pub fn new(domain: impl Into<String>) -> Result<Self> {
        let domain = domain.into().trim().to_ascii_lowercase();
        if !domain.contains('.') || domain.contains('@') {
            return Err(KairosError::Configuration(format!(
                "'{domain}' is not a valid domain"
            )));
        }
        Ok(Self { domain })
    }

    /// The directory group email backing a JIT group.
    pub fn group_id(&self, id: &JitGroupId) -> Result<GroupId> {
        GroupId::new(format!("{JIT_GROUP_PREFIX}.{id}@{}", self.domain))
    }

    /// The JIT group id backed by a directory group, if it is one of
    /// ours.
    pub fn jit_group_id(&self, group: &GroupId) -> Option<JitGroupId> {
        let (local, domain) = group.email().split_once('@')?;
        if domain != self.domain {
            return None;
        }
        let id = local.strip_prefix(&format!("{JIT_GROUP_PREFIX}."))?;
        id.parse().ok()
    }

    /// Whether a directory group is a provisioned JIT group.
    pub fn is_jit_group(&self, group: &GroupId) -> bool {
        self.jit_group_id(group).is_some()
    }

    /// Search prefix matching every JIT group of an environment.
    pub fn environment_prefix(&self, environment: &str) -> String {
        format!(
            "{JIT_GROUP_PREFIX}.{}.",
            environment.to_ascii_lowercase()
        )
    }
}

/// Expands users into principal sets by querying the identity provider.
///
/// Membership-detail lookups across all concurrent resolutions share
/// one semaphore, capping in-flight IdP calls process-wide.
pub struct SubjectResolver {
    directory: Arc<dyn DirectoryClient>,
    mapping: GroupMapping,
    fanout: Arc<Semaphore>,
}

impl SubjectResolver {
    /// Creates a resolver with the given fan-out bound.
    pub fn new(
        directory: Arc<dyn DirectoryClient>,
        mapping: GroupMapping,
        max_concurrent_lookups: usize,
    ) -> Self {
        Self {
            directory,
            mapping,
            fanout: Arc::new(Semaphore::new(max_concurrent_lookups.max(1))),
        }
    }

    /// The group mapping in use.
    pub fn mapping(&self) -> &GroupMapping {
        &self.mapping
    }

    /// Creates a lazily resolved subject for a user.
    pub fn subject(self: &Arc<Self>, user: UserId) -> Subject {
        Subject::new(user, Arc::clone(self) as Arc<dyn PrincipalSource>)
    }

    async fn resolve_membership(
        &self,
        summary: &MembershipSummary,
        id: JitGroupId,
    ) -> Option<Principal> {
        let _permit = self.fanout.acquire().await.ok()?;
        match self.directory.get_membership(&summary.id).await {
            Ok(membership) => match membership.earliest_expiry() {
                Some(expiry) => Some(Principal::JitGroupMembership(JitGroupMembership::new(
                    id, expiry,
                ))),
                None => {
                    warn!(group = %summary.group, "membership has no expiry, not a JIT membership");
                    None
                }
            },
            Err(KairosError::NotFound(_)) => {
                debug!(group = %summary.group, "membership vanished during resolution");
                None
            }
            Err(err) => {
                warn!(group = %summary.group, error = %err, "membership lookup failed, dropping");
                None
            }
        }
    }
}

#[async_trait]
impl PrincipalSource for SubjectResolver {
    #[instrument(skip(self), fields(user = %user))]
    async fn expand(&self, user: &UserId) -> Result<BTreeSet<Principal>> {
        let summaries = self.directory.list_memberships_by_user(user).await?;

        let mut principals = BTreeSet::new();
        principals.insert(Principal::AllAuthenticatedUsers);
        principals.insert(Principal::User(user.clone()));

        let mut jit_lookups = Vec::new();
        for summary in &summaries {
            match self.mapping.jit_group_id(&summary.group) {
                Some(id) => jit_lookups.push(self.resolve_membership(summary, id)),
                None => {
                    principals.insert(Principal::Group(summary.group.clone()));
                }
            }
        }

        for principal in futures::future::join_all(jit_lookups).await.into_iter().flatten() {
            principals.insert(principal);
        }

        debug!(
            count = principals.len(),
            "resolved principal set for {user}"
        );
        Ok(principals)
    }
}
