//! # Provisioner
//!
//! Materializes policy into the outside world: the backing security
//! group, the user's temporary membership, and the IAM role bindings
//! the group confers. All operations are idempotent; convergence is
//! detected through the checksum tag the IAM provisioner keeps in the
//! group description.

mod group;
mod iam;
#[cfg(test)]
pub(crate) mod testing;

pub use group::GroupProvisioner;
pub use iam::{IamProvisioner, ProvisioningOutcome, DEFAULT_CONFLICT_RETRIES};

use crate::clients::{DirectoryClient, ExternalGroup, IamClient};
use crate::errors::Result;
use crate::policy::{IamRoleBinding, JitGroupId, JitGroupPolicy};
use crate::principal::{JitGroupMembership, UserId};
use crate::subject::GroupMapping;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;

/// A group that exists in the directory under the provisioner's
/// naming scheme.
#[derive(Clone, Debug)]
pub struct ProvisionedGroup {
    /// The JIT group id encoded in the group email.
    pub id: JitGroupId,
    /// The directory record.
    pub group: ExternalGroup,
}

/// Facade combining group and IAM provisioning.
pub struct Provisioner {
    groups: GroupProvisioner,
    iam: IamProvisioner,
    mapping: GroupMapping,
    directory: Arc<dyn DirectoryClient>,
}

impl Provisioner {
    /// Creates a provisioner over the given collaborators.
    pub fn new(
        directory: Arc<dyn DirectoryClient>,
        iam: Arc<dyn IamClient>,
        mapping: GroupMapping,
    ) -> Self {
        Self {
            groups: GroupProvisioner::new(Arc::clone(&directory), mapping.clone()),
            iam: IamProvisioner::new(Arc::clone(&directory), iam),
            mapping,
            directory,
        }
    }

    fn role_bindings(policy: &JitGroupPolicy) -> Vec<IamRoleBinding> {
        policy
            .privileges()
            .iter()
            .map(|p| p.as_role_binding().clone())
            .collect()
    }

    /// Provisions access for a user: group, temporary membership, and
    /// converged role bindings. Returns the resulting membership.
    #[instrument(skip(self, policy), fields(user = %user, %expiry))]
    pub async fn provision_access(
        &self,
        policy: &Arc<JitGroupPolicy>,
        user: &UserId,
        expiry: OffsetDateTime,
    ) -> Result<JitGroupMembership> {
        let group_id = self.groups.provision(policy, user, expiry).await?;
        self.iam
            .provision_access(&group_id, &Self::role_bindings(policy))
            .await?;
        Ok(JitGroupMembership::new(policy.id()?, expiry))
    }

    /// Re-converges a group's bindings with its policy, independent of
    /// any user.
    pub async fn reconcile(&self, policy: &Arc<JitGroupPolicy>) -> Result<ProvisioningOutcome> {
        let group_id = self.mapping.group_id(&policy.id()?)?;
        self.iam
            .provision_access(&group_id, &Self::role_bindings(policy))
            .await
    }

    /// Lists the groups of an environment this provisioner is
    /// authoritative for, sorted by id.
    pub async fn provisioned_groups(&self, environment: &str) -> Result<Vec<ProvisionedGroup>> {
        let prefix = self.mapping.environment_prefix(environment);
        let groups = self.directory.search_groups_by_prefix(&prefix).await?;

        let mut provisioned: Vec<ProvisionedGroup> = groups
            .into_iter()
            .filter_map(|group| {
                self.mapping
                    .jit_group_id(&group.id)
                    .map(|id| ProvisionedGroup { id, group })
            })
            .collect();
        provisioned.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(provisioned)
    }
}
