//! Group provisioning: materializing JIT groups in the directory.

use crate::clients::{DirectoryClient, GroupType};
use crate::errors::{KairosError, Result};
use crate::policy::{JitGroupId, JitGroupPolicy};
use crate::principal::{GroupId, UserId};
use crate::subject::GroupMapping;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, instrument};

/// The breadcrumb description written on created groups.
pub(crate) fn group_description(id: &JitGroupId) -> String {
    format!(
        "JIT group {}/{}/{}",
        id.environment(),
        id.system(),
        id.name()
    )
}

/// Idempotently materializes group membership in the directory.
pub struct GroupProvisioner {
    directory: Arc<dyn DirectoryClient>,
    mapping: GroupMapping,
}

impl GroupProvisioner {
    /// Creates a group provisioner.
    pub fn new(directory: Arc<dyn DirectoryClient>, mapping: GroupMapping) -> Self {
        Self { directory, mapping }
    }

    /// Ensures the backing group exists and the user holds a temporary
    /// membership expiring at `expiry`.
    ///
    /// Safe to re-run: an existing group is reused, an existing
    /// membership gets its expiry updated.
    #[instrument(skip(self, policy), fields(user = %user))]
    pub async fn provision(
        &self,
        policy: &JitGroupPolicy,
        user: &UserId,
        expiry: OffsetDateTime,
    ) -> Result<GroupId> {
        let id = policy.id()?;
        let group_id = self.mapping.group_id(&id)?;

        match self.directory.get_group(&group_id).await {
            Ok(_) => {}
            Err(KairosError::NotFound(_)) => {
                debug!(group = %group_id, "backing group missing, creating");
                match self
                    .directory
                    .create_group(
                        &group_id,
                        GroupType::Security,
                        &id.to_string(),
                        &group_description(&id),
                    )
                    .await
                {
                    // Lost a creation race; the group is there either way.
                    Ok(_) | Err(KairosError::AlreadyExists(_)) => {}
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        }

        self.directory
            .add_membership(&group_id, user, expiry)
            .await?;

        debug!(group = %group_id, %expiry, "temporary membership provisioned");
        Ok(group_id)
    }
}
