//! The catalog: subject-scoped views over the policy tree.
//!
//! Every accessor filters by the `VIEW` permission, and listings sort
//! by stable identifier. A node the subject may not see is
//! indistinguishable from a node that does not exist.

use crate::analysis::{AccessOptions, PolicyAnalysis};
use crate::environment::{
    Environment, EnvironmentLoader, EnvironmentSummary, GroupComplianceStatus, PolicyExport,
};
use crate::errors::{KairosError, Result};
use crate::join::{ApprovalOperation, JoinOperation, JoinStatus};
use crate::policy::{JitGroupId, JitGroupPolicy, PolicyPermission, SystemPolicy};
use crate::principal::Subject;
use std::sync::Arc;

/// Entry point for browsing policies as a given subject.
pub struct Catalog {
    loader: Arc<EnvironmentLoader>,
    subject: Arc<Subject>,
}

impl Catalog {
    /// Creates a catalog scoped to a subject.
    pub fn new(loader: Arc<EnvironmentLoader>, subject: Arc<Subject>) -> Self {
        Self { loader, subject }
    }

    /// The subject this catalog is scoped to.
    pub fn subject(&self) -> &Arc<Subject> {
        &self.subject
    }

    /// Bare `(name, description)` listing of all registered
    /// environments. Requires no permission and loads no policy.
    pub fn environments(&self) -> Vec<EnvironmentSummary> {
        self.loader.summaries()
    }

    /// Opens an environment, filtered by `VIEW`.
    pub async fn environment(&self, name: &str) -> Result<Option<EnvironmentView>> {
        let Some(environment) = self.loader.environment(name).await else {
            return Ok(None);
        };

        let principals = self.subject.principals().await?;
        if !environment
            .policy()
            .is_allowed_by_acl(principals, PolicyPermission::VIEW)
        {
            return Ok(None);
        }

        Ok(Some(EnvironmentView {
            environment,
            subject: Arc::clone(&self.subject),
        }))
    }

    /// Resolves a fully qualified group id to a view.
    ///
    /// An unknown environment, system, or group and a missing `VIEW`
    /// permission all come back as `NotFound`, so callers cannot probe
    /// for hidden groups.
    pub async fn group(&self, id: &JitGroupId) -> Result<JitGroupView> {
        let hidden = || KairosError::NotFound(format!("group {id}"));

        let environment = self
            .environment(id.environment())
            .await?
            .ok_or_else(hidden)?;
        let system = environment.system(id.system()).await?.ok_or_else(hidden)?;
        system.group(id.name()).await?.ok_or_else(hidden)
    }
}

/// An environment as visible to one subject.
pub struct EnvironmentView {
    environment: Arc<Environment>,
    subject: Arc<Subject>,
}

impl EnvironmentView {
    /// The environment name.
    pub fn name(&self) -> &str {
        self.environment.policy().name()
    }

    /// The environment description.
    pub fn description(&self) -> &str {
        self.environment.policy().description()
    }

    async fn allowed(&self, required: PolicyPermission) -> Result<bool> {
        let principals = self.subject.principals().await?;
        Ok(self
            .environment
            .policy()
            .is_allowed_by_acl(principals, required))
    }

    /// The systems the subject may view, sorted by name.
    pub async fn systems(&self) -> Result<Vec<SystemView>> {
        let principals = self.subject.principals().await?;
        Ok(self
            .environment
            .policy()
            .systems()
            .into_iter()
            .filter(|s| s.is_allowed_by_acl(principals, PolicyPermission::VIEW))
            .map(|system| SystemView {
                environment: Arc::clone(&self.environment),
                system,
                subject: Arc::clone(&self.subject),
            })
            .collect())
    }

    /// Opens a system, filtered by `VIEW`.
    pub async fn system(&self, name: &str) -> Result<Option<SystemView>> {
        let Some(system) = self.environment.policy().system(name) else {
            return Ok(None);
        };

        let principals = self.subject.principals().await?;
        if !system.is_allowed_by_acl(principals, PolicyPermission::VIEW) {
            return Ok(None);
        }

        Ok(Some(SystemView {
            environment: Arc::clone(&self.environment),
            system,
            subject: Arc::clone(&self.subject),
        }))
    }

    /// Whether the subject may export the policy document.
    pub async fn can_export(&self) -> Result<bool> {
        self.allowed(PolicyPermission::EXPORT).await
    }

    /// Exports the canonical policy document.
    pub async fn export(&self) -> Result<PolicyExport> {
        if !self.can_export().await? {
            return Err(KairosError::AccessDenied(format!(
                "exporting environment '{}' requires the EXPORT permission",
                self.name()
            )));
        }
        self.environment.export()
    }

    /// Whether the subject may reconcile the environment.
    pub async fn can_reconcile(&self) -> Result<bool> {
        self.allowed(PolicyPermission::RECONCILE).await
    }

    /// Reconciles all provisioned groups and reports compliance.
    pub async fn reconcile(&self) -> Result<Vec<GroupComplianceStatus>> {
        if !self.can_reconcile().await? {
            return Err(KairosError::AccessDenied(format!(
                "reconciling environment '{}' requires the RECONCILE permission",
                self.name()
            )));
        }
        self.environment.reconcile().await
    }
}

/// A system as visible to one subject.
pub struct SystemView {
    environment: Arc<Environment>,
    system: Arc<SystemPolicy>,
    subject: Arc<Subject>,
}

impl SystemView {
    /// The system name.
    pub fn name(&self) -> &str {
        self.system.name()
    }

    /// The system description.
    pub fn description(&self) -> &str {
        self.system.description()
    }

    /// The groups the subject may view, sorted by name.
    pub async fn groups(&self) -> Result<Vec<JitGroupView>> {
        let principals = self.subject.principals().await?;
        Ok(self
            .system
            .groups()
            .into_iter()
            .filter(|g| g.is_allowed_by_acl(principals, PolicyPermission::VIEW))
            .map(|group| JitGroupView {
                environment: Arc::clone(&self.environment),
                group,
                subject: Arc::clone(&self.subject),
            })
            .collect())
    }

    /// Opens a group, filtered by `VIEW`.
    pub async fn group(&self, name: &str) -> Result<Option<JitGroupView>> {
        let Some(group) = self.system.group(name) else {
            return Ok(None);
        };

        let principals = self.subject.principals().await?;
        if !group.is_allowed_by_acl(principals, PolicyPermission::VIEW) {
            return Ok(None);
        }

        Ok(Some(JitGroupView {
            environment: Arc::clone(&self.environment),
            group,
            subject: Arc::clone(&self.subject),
        }))
    }
}

/// A JIT group as visible to one subject, bound to its environment's
/// provisioner.
pub struct JitGroupView {
    environment: Arc<Environment>,
    group: Arc<JitGroupPolicy>,
    subject: Arc<Subject>,
}

impl std::fmt::Debug for JitGroupView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitGroupView").finish_non_exhaustive()
    }
}

impl JitGroupView {
    /// The group's fully qualified id.
    pub fn id(&self) -> Result<JitGroupId> {
        self.group.id()
    }

    /// The group's policy node.
    pub fn policy(&self) -> &Arc<JitGroupPolicy> {
        &self.group
    }

    /// The group description.
    pub fn description(&self) -> &str {
        self.group.description()
    }

    /// The join status of this subject, for presentation.
    pub async fn status(&self) -> Result<JoinStatus> {
        self.request_to_join().await?.status().await
    }

    /// Starts a join operation for this subject.
    pub async fn request_to_join(&self) -> Result<JoinOperation> {
        JoinOperation::propose(
            Arc::clone(&self.group),
            Arc::clone(&self.subject),
            Arc::clone(self.environment.provisioner()),
        )
        .await
    }

    /// Continues a delegated join as this subject (the approver).
    ///
    /// `joining_subject` is the deferrer's subject, resolved by the
    /// caller; the approver must be among the deferral's assignees.
    pub async fn approve_deferred(
        &self,
        deferral: &crate::deferral::Deferral,
        joining_subject: Arc<Subject>,
    ) -> Result<ApprovalOperation> {
        if !deferral.is_assignee(self.subject.user()) {
            return Err(KairosError::AccessDenied(
                "the deferral is not assigned to this user".into(),
            ));
        }

        ApprovalOperation::new(
            Arc::clone(&self.group),
            Arc::clone(&self.subject),
            joining_subject,
            deferral.input(),
            Arc::clone(self.environment.provisioner()),
        )
        .await
    }

    /// Runs an ACL-only analysis for arbitrary permissions, e.g. to
    /// decide whether approval hand-off targets exist.
    pub async fn analyze(&self, permissions: PolicyPermission) -> Result<bool> {
        let analysis = PolicyAnalysis::new(
            Arc::clone(&self.group),
            Arc::clone(&self.subject),
            permissions,
        );
        Ok(analysis
            .execute()
            .await?
            .is_allowed(AccessOptions::IgnoreConstraints))
    }
}
