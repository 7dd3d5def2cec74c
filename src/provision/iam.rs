//! IAM binding provisioning with checksum-based change detection.
//!
//! The provisioner tags the backing group's description with a
//! checksum of the binding set it last converged to. When the tag
//! matches the current policy, nothing is written (the fast path).
//! Otherwise the group principal's bindings are replaced resource by
//! resource, and the tag is rewritten last: the description update is
//! the commit point, so an interrupted run is detected and repeated by
//! the next invocation.

use crate::clients::{DirectoryClient, IamBinding, IamClient, IamPolicy};
use crate::errors::{KairosError, Result};
use crate::policy::{bindings_checksum, IamRoleBinding, ResourceRef};
use crate::principal::GroupId;
use rand::Rng;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Default number of retries after an optimistic-concurrency conflict.
pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// What a provisioning run did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisioningOutcome {
    /// Checksums matched; no IAM write was issued.
    Unchanged,
    /// Bindings were replaced on this many resources.
    Updated {
        /// Number of resources whose policy was rewritten.
        resources: usize,
    },
}

fn checksum_tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"#([0-9a-f]{2,8})").expect("tag pattern is valid"))
}

/// Extracts the last checksum tag embedded in a group description.
pub(crate) fn extract_checksum(description: &str) -> Option<u32> {
    let captures = checksum_tag_pattern().captures_iter(description).last()?;
    u32::from_str_radix(&captures[1], 16).ok()
}

/// Rewrites the description so its trailing tag equals `checksum`.
pub(crate) fn write_checksum(description: &str, checksum: u32) -> String {
    let tag = format!("#{checksum:08x}");
    if let Some(m) = checksum_tag_pattern().find_iter(description).last() {
        let mut updated = String::with_capacity(description.len());
        updated.push_str(&description[..m.start()]);
        updated.push_str(&tag);
        updated.push_str(&description[m.end()..]);
        return updated;
    }
    if description.is_empty() {
        tag
    } else {
        format!("{description} {tag}")
    }
}

/// Converges IAM bindings with the policy, idempotently.
pub struct IamProvisioner {
    directory: Arc<dyn DirectoryClient>,
    iam: Arc<dyn IamClient>,
    conflict_retries: u32,
}

impl IamProvisioner {
    /// Creates an IAM provisioner with the default retry budget.
    pub fn new(directory: Arc<dyn DirectoryClient>, iam: Arc<dyn IamClient>) -> Self {
        Self {
            directory,
            iam,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    /// Overrides the conflict retry budget.
    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    /// Converges the bindings of `group_id` with `bindings`.
    ///
    /// Fast path: when the checksum embedded in the group description
    /// equals the checksum of `bindings`, no IAM write is issued.
    #[instrument(skip(self, bindings), fields(group = %group_id))]
    pub async fn provision_access(
        &self,
        group_id: &GroupId,
        bindings: &[IamRoleBinding],
    ) -> Result<ProvisioningOutcome> {
        let group = self.directory.get_group(group_id).await?;

        let expected = bindings_checksum(bindings.iter());
        let actual = extract_checksum(&group.description);
        if actual == Some(expected) {
            debug!(checksum = %format!("{expected:08x}"), "bindings already converged");
            return Ok(ProvisioningOutcome::Unchanged);
        }

        let member = format!("group:{}", group_id.email());
        let mut by_resource: BTreeMap<&ResourceRef, Vec<&IamRoleBinding>> = BTreeMap::new();
        for binding in bindings {
            by_resource.entry(&binding.resource).or_default().push(binding);
        }

        let resources = by_resource.len();
        for (resource, resource_bindings) in by_resource {
            self.replace_bindings(resource, &member, &resource_bindings)
                .await?;
        }

        // Commit point: a crash before this line leaves the stale tag in
        // place, so the next run redoes the replacement.
        let description = write_checksum(&group.description, expected);
        self.directory.patch_group(group_id, &description).await?;

        info!(
            resources,
            checksum = %format!("{expected:08x}"),
            "bindings replaced and checksum committed"
        );
        Ok(ProvisioningOutcome::Updated { resources })
    }

    /// Replaces the member's bindings on one resource, retrying on
    /// optimistic-concurrency conflicts.
    async fn replace_bindings(
        &self,
        resource: &ResourceRef,
        member: &str,
        bindings: &[&IamRoleBinding],
    ) -> Result<()> {
        let rationale = format!("JIT access bindings for {member}");
        let mutator = move |policy: &mut IamPolicy| {
            for binding in policy.bindings.iter_mut() {
                binding.members.retain(|m| m != member);
            }
            policy.bindings.retain(|b| !b.members.is_empty());

            for binding in bindings {
                policy.bindings.push(IamBinding {
                    role: binding.role.clone(),
                    members: vec![member.to_string()],
                    condition: binding.condition.clone(),
                });
            }
        };

        let mut attempt = 0;
        loop {
            match self
                .iam
                .modify_iam_policy(resource, &mutator, &rationale)
                .await
            {
                Ok(()) => return Ok(()),
                Err(KairosError::Conflict(reason)) if attempt < self.conflict_retries => {
                    attempt += 1;
                    let jitter = rand::thread_rng().gen_range(0..50);
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1)
                        + Duration::from_millis(jitter);
                    warn!(%resource, attempt, "IAM policy conflict, retrying: {reason}");
                    tokio::time::sleep(delay).await;
                }
                Err(KairosError::Conflict(reason)) => {
                    return Err(KairosError::Conflict(format!(
                        "{resource}: retries exhausted: {reason}"
                    )));
                }
                Err(err) => return Err(err),
            }
        }
    }
}
