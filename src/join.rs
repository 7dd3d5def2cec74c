//! The join-operation lifecycle.
//!
//! A proposed join starts by probing the self-approve branch: an
//! ACL-only analysis for `JOIN | APPROVE_SELF` with both constraint
//! classes applied. If the subject holds both permissions the
//! operation is self-approvable and `execute` provisions directly;
//! otherwise only `JOIN` constraints apply and the operation must be
//! delegated to approvers, eventually continuing as an
//! [`ApprovalOperation`] on the approver's side.

use crate::analysis::{AccessOptions, AnalysisResult, PolicyAnalysis};
use crate::constraint::{ConstraintClass, ExpiryConstraint, Property, EXPIRY_PROPERTY};
use crate::errors::{KairosError, Result};
use crate::policy::{JitGroupId, JitGroupPolicy, PolicyPermission};
use crate::principal::{JitGroupMembership, Subject, UserId};
use crate::provision::Provisioner;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{info, instrument};

/// Join analysis status as surfaced to API clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JoinStatus {
    /// The subject already holds an active membership.
    Joined,
    /// The subject may not join.
    JoinDisallowed,
    /// The subject may join once an approver consents.
    JoinAllowedWithApproval,
    /// The subject may join and approve themselves.
    JoinAllowedWithoutApproval,
}

/// A validated, serializable snapshot of a pending join, ready to be
/// handed to the deferral component.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinProposal {
    /// The user requesting to join.
    pub user: UserId,
    /// The target group.
    pub group: JitGroupId,
    /// Input values supplied so far, unset properties omitted.
    pub input: BTreeMap<String, String>,
}

/// Picks the expiry duration from the analysis result.
///
/// The first satisfied expiry constraint in policy order wins; its
/// duration is the fixed one or the supplied `expiry` input.
fn satisfied_expiry(result: &AnalysisResult) -> Option<(&ExpiryConstraint, Duration)> {
    let input = result
        .input_property(EXPIRY_PROPERTY)
        .and_then(|p: &Arc<Property>| p.get());
    result
        .satisfied()
        .iter()
        .filter_map(|c| c.as_expiry())
        .find_map(|c| c.duration(input.as_ref()).map(|d| (c, d)))
}

/// A join operation for one subject against one group.
pub struct JoinOperation {
    provisioner: Arc<Provisioner>,
    analysis: PolicyAnalysis,
    requires_approval: bool,
}

impl JoinOperation {
    /// Proposes a join, deciding the self-approve question up front.
    #[instrument(skip_all, fields(group = %group.name(), user = %subject.user()))]
    pub async fn propose(
        group: Arc<JitGroupPolicy>,
        subject: Arc<Subject>,
        provisioner: Arc<Provisioner>,
    ) -> Result<Self> {
        let self_approve = PolicyAnalysis::new(
            Arc::clone(&group),
            Arc::clone(&subject),
            PolicyPermission::JOIN | PolicyPermission::APPROVE_SELF,
        )
        .apply_constraints(ConstraintClass::Join)
        .apply_constraints(ConstraintClass::Approve);

        let probe = self_approve.execute().await?;
        if probe.is_allowed(AccessOptions::IgnoreConstraints) {
            return Ok(Self {
                provisioner,
                analysis: self_approve,
                requires_approval: false,
            });
        }

        let join_only = PolicyAnalysis::new(group, subject, PolicyPermission::JOIN)
            .apply_constraints(ConstraintClass::Join);
        Ok(Self {
            provisioner,
            analysis: join_only,
            requires_approval: true,
        })
    }

    /// Whether executing this join needs a peer approval.
    pub fn requires_approval(&self) -> bool {
        self.requires_approval
    }

    /// The joining user.
    pub fn user(&self) -> &UserId {
        self.analysis.subject().user()
    }

    /// The input properties of the applied constraints.
    pub fn input(&self) -> &[Arc<Property>] {
        self.analysis.input()
    }

    /// Sets an input property by name.
    pub fn set_input(&self, name: &str, raw: &str) -> Result<()> {
        self.analysis.set_input(name, raw)
    }

    /// Re-executes the analysis with the current inputs. Side-effect
    /// free and idempotent.
    pub async fn dry_run(&self) -> Result<AnalysisResult> {
        self.analysis.execute().await
    }

    /// The join status for presentation.
    pub async fn status(&self) -> Result<JoinStatus> {
        let result = self.analysis.execute().await?;
        if result.active_membership().is_some() {
            return Ok(JoinStatus::Joined);
        }
        if !result.access_allowed() {
            return Ok(JoinStatus::JoinDisallowed);
        }
        if self.requires_approval {
            Ok(JoinStatus::JoinAllowedWithApproval)
        } else {
            Ok(JoinStatus::JoinAllowedWithoutApproval)
        }
    }

    /// Executes a self-approvable join: verifies the analysis,
    /// extracts the expiry, provisions access, and returns the
    /// resulting membership.
    #[instrument(skip(self), fields(user = %self.user()))]
    pub async fn execute(&self) -> Result<JitGroupMembership> {
        if self.requires_approval {
            return Err(KairosError::AccessDenied(
                "join requires approval by another user".into(),
            ));
        }

        let result = self.analysis.execute().await?;
        result.verify_access_allowed(AccessOptions::Default)?;

        let (_, duration) = satisfied_expiry(&result).ok_or_else(|| {
            KairosError::Unsupported(
                "group has no satisfied expiry constraint to derive a membership lifetime from"
                    .into(),
            )
        })?;
        let expiry = OffsetDateTime::now_utc() + duration;

        let membership = self
            .provisioner
            .provision_access(self.analysis.group(), self.user(), expiry)
            .await?;

        info!(group = %membership.id, %expiry, "join executed");
        Ok(membership)
    }

    /// Validates the operation for delegation and snapshots it.
    ///
    /// Valid only when approval is required; verifies the JOIN-class
    /// analysis with the current inputs, so a proposal that could never
    /// be approved is rejected before it reaches an approver.
    pub async fn delegate_for_approval(&self) -> Result<JoinProposal> {
        if !self.requires_approval {
            return Err(KairosError::Unsupported(
                "self-approvable join does not need delegation".into(),
            ));
        }

        let result = self.analysis.execute().await?;
        result.verify_access_allowed(AccessOptions::Default)?;

        let input = self
            .analysis
            .input()
            .iter()
            .filter_map(|p| p.get_raw().map(|raw| (p.name().to_string(), raw)))
            .collect();

        Ok(JoinProposal {
            user: self.user().clone(),
            group: self.analysis.group().id()?,
            input,
        })
    }
}

/// The approver's side of a delegated join.
///
/// Built from a picked-up deferral: the approver re-runs the pipeline
/// with `APPROVE_OTHERS` and the `approve` constraint class, while the
/// joining user's own JOIN analysis is replayed with the deferred
/// inputs.
pub struct ApprovalOperation {
    provisioner: Arc<Provisioner>,
    approver_analysis: PolicyAnalysis,
    join_analysis: PolicyAnalysis,
}

impl ApprovalOperation {
    /// Creates an approval operation.
    ///
    /// `joining_subject` is the deferrer's subject as resolved on the
    /// approver's request; `input` carries the deferred input values.
    pub async fn new(
        group: Arc<JitGroupPolicy>,
        approver: Arc<Subject>,
        joining_subject: Arc<Subject>,
        input: &BTreeMap<String, String>,
        provisioner: Arc<Provisioner>,
    ) -> Result<Self> {
        if approver.user() == joining_subject.user() {
            return Err(KairosError::AccessDenied(
                "a join cannot be approved by the requesting user".into(),
            ));
        }

        let approver_analysis = PolicyAnalysis::new(
            Arc::clone(&group),
            approver,
            PolicyPermission::APPROVE_OTHERS,
        )
        .apply_constraints(ConstraintClass::Approve);

        let join_analysis =
            PolicyAnalysis::new(group, joining_subject, PolicyPermission::JOIN)
                .apply_constraints(ConstraintClass::Join);
        for (name, raw) in input {
            join_analysis.set_input(name, raw)?;
        }

        Ok(Self {
            provisioner,
            approver_analysis,
            join_analysis,
        })
    }

    /// The approving user.
    pub fn approver(&self) -> &UserId {
        self.approver_analysis.subject().user()
    }

    /// The user whose join is being approved.
    pub fn joining_user(&self) -> &UserId {
        self.join_analysis.subject().user()
    }

    /// The approver-side input properties.
    pub fn input(&self) -> &[Arc<Property>] {
        self.approver_analysis.input()
    }

    /// Sets an approver-side input property.
    pub fn set_input(&self, name: &str, raw: &str) -> Result<()> {
        self.approver_analysis.set_input(name, raw)
    }

    /// Approves the join: verifies both sides, then provisions access
    /// for the joining user.
    #[instrument(skip(self), fields(approver = %self.approver(), user = %self.joining_user()))]
    pub async fn approve(&self) -> Result<JitGroupMembership> {
        self.approver_analysis
            .execute()
            .await?
            .verify_access_allowed(AccessOptions::Default)?;

        let join_result = self.join_analysis.execute().await?;
        join_result.verify_access_allowed(AccessOptions::Default)?;

        let (_, duration) = satisfied_expiry(&join_result).ok_or_else(|| {
            KairosError::Unsupported(
                "group has no satisfied expiry constraint to derive a membership lifetime from"
                    .into(),
            )
        })?;
        let expiry = OffsetDateTime::now_utc() + duration;

        let membership = self
            .provisioner
            .provision_access(self.join_analysis.group(), self.joining_user(), expiry)
            .await?;

        info!(group = %membership.id, approver = %self.approver(), "join approved");
        Ok(membership)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::{Constraint, ExpressionConstraint, PropertyDecl, PropertyType};
    use crate::policy::{
        AccessControlList, AclEntry, ConstraintMap, EnvironmentPolicy, PolicyMetadata,
        SystemPolicy,
    };
    use crate::principal::Principal;
    use crate::provision::testing::{InMemoryDirectory, InMemoryIam};
    use crate::subject::GroupMapping;
    use std::collections::BTreeSet;

    fn alice() -> UserId {
        UserId::new("alice@example.com").unwrap()
    }

    fn bob() -> UserId {
        UserId::new("bob@example.com").unwrap()
    }

    fn subject_for(user: UserId) -> Arc<Subject> {
        Arc::new(Subject::with_principals(
            user,
            BTreeSet::from([Principal::AllAuthenticatedUsers]),
        ))
    }

    fn provisioner() -> Arc<Provisioner> {
        Arc::new(Provisioner::new(
            Arc::new(InMemoryDirectory::default()),
            Arc::new(InMemoryIam::default()),
            GroupMapping::new("example.com").unwrap(),
        ))
    }

    fn acl(entries: Vec<AclEntry>) -> Option<AccessControlList> {
        Some(AccessControlList::new(entries))
    }

    fn build_group(
        acl: Option<AccessControlList>,
        constraints: ConstraintMap,
    ) -> (Arc<EnvironmentPolicy>, Arc<JitGroupPolicy>) {
        let env = EnvironmentPolicy::new(
            "env-1",
            "",
            None,
            ConstraintMap::new(),
            PolicyMetadata::new("test", None),
        )
        .unwrap();
        let sys = SystemPolicy::new("sys-1", "", None, ConstraintMap::new()).unwrap();
        let group = JitGroupPolicy::new("g-1", "", acl, constraints, vec![]).unwrap();
        env.add_system(sys.clone()).unwrap();
        sys.add_group(group.clone()).unwrap();
        (env, group)
    }

    fn fixed_expiry(secs: i64) -> ConstraintMap {
        ConstraintMap::from([(
            ConstraintClass::Join,
            vec![Arc::new(Constraint::Expiry(
                ExpiryConstraint::fixed(Duration::seconds(secs)).unwrap(),
            ))],
        )])
    }

    fn ranged_expiry(min: i64, max: i64) -> ConstraintMap {
        ConstraintMap::from([(
            ConstraintClass::Join,
            vec![Arc::new(Constraint::Expiry(
                ExpiryConstraint::range(Duration::seconds(min), Duration::seconds(max)).unwrap(),
            ))],
        )])
    }

    #[tokio::test]
    async fn test_view_only_subject_cannot_join() {
        let (_env, group) = build_group(
            acl(vec![AclEntry::allow(
                Principal::User(alice()),
                PolicyPermission::VIEW,
            )]),
            fixed_expiry(60),
        );

        let op = JoinOperation::propose(group, subject_for(alice()), provisioner())
            .await
            .unwrap();

        assert_eq!(op.status().await.unwrap(), JoinStatus::JoinDisallowed);
        assert!(matches!(
            op.execute().await,
            Err(KairosError::AccessDenied(_))
        ));
        assert!(matches!(
            op.delegate_for_approval().await,
            Err(KairosError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_self_approve_with_fixed_expiry() {
        let (_env, group) = build_group(
            acl(vec![AclEntry::allow(
                Principal::User(alice()),
                PolicyPermission::JOIN | PolicyPermission::APPROVE_SELF,
            )]),
            fixed_expiry(60),
        );

        let op = JoinOperation::propose(group, subject_for(alice()), provisioner())
            .await
            .unwrap();
        assert!(!op.requires_approval());
        assert_eq!(
            op.status().await.unwrap(),
            JoinStatus::JoinAllowedWithoutApproval
        );

        let before = OffsetDateTime::now_utc();
        let membership = op.execute().await.unwrap();
        let after = OffsetDateTime::now_utc();

        assert_eq!(membership.id, JitGroupId::new("env-1", "sys-1", "g-1"));
        assert!(membership.expiry >= before + Duration::seconds(60));
        assert!(membership.expiry <= after + Duration::seconds(60));
    }

    #[tokio::test]
    async fn test_user_defined_expiry_is_honored() {
        let (_env, group) = build_group(
            acl(vec![AclEntry::allow(
                Principal::User(alice()),
                PolicyPermission::JOIN | PolicyPermission::APPROVE_SELF,
            )]),
            ranged_expiry(60, 259_200),
        );

        let op = JoinOperation::propose(group, subject_for(alice()), provisioner())
            .await
            .unwrap();

        op.set_input(EXPIRY_PROPERTY, "120").unwrap();
        let before = OffsetDateTime::now_utc();
        let membership = op.execute().await.unwrap();

        assert!(membership.expiry >= before + Duration::seconds(120));
        assert!(membership.expiry <= OffsetDateTime::now_utc() + Duration::seconds(120));
    }

    #[tokio::test]
    async fn test_out_of_range_expiry_rejected_at_set_time() {
        let (_env, group) = build_group(
            acl(vec![AclEntry::allow(
                Principal::User(alice()),
                PolicyPermission::JOIN | PolicyPermission::APPROVE_SELF,
            )]),
            ranged_expiry(60, 259_200),
        );

        let op = JoinOperation::propose(group, subject_for(alice()), provisioner())
            .await
            .unwrap();

        assert!(matches!(
            op.set_input(EXPIRY_PROPERTY, "400000"),
            Err(KairosError::InvalidInput { .. })
        ));
    }

    #[tokio::test]
    async fn test_expression_constraint_gates_execution() {
        let mut constraints = fixed_expiry(60);
        constraints.get_mut(&ConstraintClass::Join).unwrap().push(Arc::new(
            Constraint::Expression(
                ExpressionConstraint::new(
                    "ticket",
                    "Ticket filed",
                    "input.var1 == true",
                    vec![PropertyDecl::new("var1", "Var 1", PropertyType::Bool, true)],
                )
                .unwrap(),
            ),
        ));
        let (_env, group) = build_group(
            acl(vec![AclEntry::allow(
                Principal::User(alice()),
                PolicyPermission::JOIN | PolicyPermission::APPROVE_SELF,
            )]),
            constraints,
        );

        let op = JoinOperation::propose(group, subject_for(alice()), provisioner())
            .await
            .unwrap();

        op.set_input("var1", "False").unwrap();
        assert!(matches!(
            op.execute().await,
            Err(KairosError::ConstraintUnsatisfied(_))
        ));

        op.set_input("var1", "True").unwrap();
        assert!(op.execute().await.is_ok());
    }

    #[tokio::test]
    async fn test_dry_run_has_no_side_effects() {
        let (_env, group) = build_group(
            acl(vec![AclEntry::allow(
                Principal::User(alice()),
                PolicyPermission::JOIN | PolicyPermission::APPROVE_SELF,
            )]),
            ranged_expiry(60, 3600),
        );

        let op = JoinOperation::propose(group, subject_for(alice()), provisioner())
            .await
            .unwrap();

        let first = op.dry_run().await.unwrap();
        assert_eq!(first.missing_required(), vec![EXPIRY_PROPERTY.to_string()]);

        op.set_input(EXPIRY_PROPERTY, "120").unwrap();
        let second = op.dry_run().await.unwrap();
        assert!(second.is_allowed(AccessOptions::Default));
    }

    #[tokio::test]
    async fn test_join_without_approve_self_requires_approval() {
        let (_env, group) = build_group(
            acl(vec![AclEntry::allow(
                Principal::User(alice()),
                PolicyPermission::JOIN,
            )]),
            fixed_expiry(60),
        );

        let op = JoinOperation::propose(group, subject_for(alice()), provisioner())
            .await
            .unwrap();
        assert!(op.requires_approval());
        assert_eq!(
            op.status().await.unwrap(),
            JoinStatus::JoinAllowedWithApproval
        );

        // Self-approve gating: execute fails exactly because approval
        // is required.
        assert!(matches!(
            op.execute().await,
            Err(KairosError::AccessDenied(_))
        ));

        let proposal = op.delegate_for_approval().await.unwrap();
        assert_eq!(proposal.user, alice());
        assert_eq!(proposal.group, JitGroupId::new("env-1", "sys-1", "g-1"));
    }

    #[tokio::test]
    async fn test_proposal_snapshots_inputs_and_omits_unset() {
        let mut constraints = ranged_expiry(60, 3600);
        constraints.get_mut(&ConstraintClass::Join).unwrap().push(Arc::new(
            Constraint::Expression(
                ExpressionConstraint::new(
                    "ticket",
                    "Ticket",
                    "input.ticket like \"JIRA-*\"",
                    vec![PropertyDecl::new(
                        "ticket",
                        "Ticket",
                        PropertyType::String,
                        false,
                    )],
                )
                .unwrap(),
            ),
        ));
        let (_env, group) = build_group(
            acl(vec![AclEntry::allow(
                Principal::User(alice()),
                PolicyPermission::JOIN,
            )]),
            constraints,
        );

        let op = JoinOperation::propose(group, subject_for(alice()), provisioner())
            .await
            .unwrap();
        op.set_input(EXPIRY_PROPERTY, "120").unwrap();
        op.set_input("ticket", "JIRA-1").unwrap();

        let proposal = op.delegate_for_approval().await.unwrap();
        assert_eq!(proposal.input.get(EXPIRY_PROPERTY).map(String::as_str), Some("120"));
        assert_eq!(proposal.input.get("ticket").map(String::as_str), Some("JIRA-1"));
    }

    #[tokio::test]
    async fn test_first_satisfied_expiry_wins_on_ties() {
        let constraints = ConstraintMap::from([(
            ConstraintClass::Join,
            vec![
                Arc::new(Constraint::Expiry(
                    ExpiryConstraint::new("short", "Short", Duration::seconds(60), Duration::seconds(60))
                        .unwrap(),
                )),
                Arc::new(Constraint::Expiry(
                    ExpiryConstraint::new("long", "Long", Duration::seconds(3600), Duration::seconds(3600))
                        .unwrap(),
                )),
            ],
        )]);
        let (_env, group) = build_group(
            acl(vec![AclEntry::allow(
                Principal::User(alice()),
                PolicyPermission::JOIN | PolicyPermission::APPROVE_SELF,
            )]),
            constraints,
        );

        let op = JoinOperation::propose(group, subject_for(alice()), provisioner())
            .await
            .unwrap();
        let membership = op.execute().await.unwrap();

        // The first constraint in policy order decides the duration.
        assert!(membership.expiry <= OffsetDateTime::now_utc() + Duration::seconds(61));
    }

    #[tokio::test]
    async fn test_approval_flow_provisions_for_joining_user() {
        let (_env, group) = build_group(
            acl(vec![
                AclEntry::allow(Principal::User(alice()), PolicyPermission::JOIN),
                AclEntry::allow(Principal::User(bob()), PolicyPermission::APPROVE_OTHERS),
            ]),
            ranged_expiry(60, 3600),
        );
        let provisioner = provisioner();

        let op = JoinOperation::propose(
            Arc::clone(&group),
            subject_for(alice()),
            Arc::clone(&provisioner),
        )
        .await
        .unwrap();
        op.set_input(EXPIRY_PROPERTY, "120").unwrap();
        let proposal = op.delegate_for_approval().await.unwrap();

        let approval = ApprovalOperation::new(
            group,
            subject_for(bob()),
            subject_for(alice()),
            &proposal.input,
            provisioner,
        )
        .await
        .unwrap();

        let membership = approval.approve().await.unwrap();
        assert_eq!(membership.id, proposal.group);
        assert!(membership.expiry <= OffsetDateTime::now_utc() + Duration::seconds(120));
    }

    #[tokio::test]
    async fn test_approver_cannot_be_the_requesting_user() {
        let (_env, group) = build_group(
            acl(vec![AclEntry::allow(
                Principal::User(alice()),
                PolicyPermission::JOIN | PolicyPermission::APPROVE_OTHERS,
            )]),
            ranged_expiry(60, 3600),
        );

        let result = ApprovalOperation::new(
            group,
            subject_for(alice()),
            subject_for(alice()),
            &BTreeMap::new(),
            provisioner(),
        )
        .await;

        assert!(matches!(result, Err(KairosError::AccessDenied(_))));
    }

    #[tokio::test]
    async fn test_approver_without_permission_is_denied() {
        let (_env, group) = build_group(
            acl(vec![AclEntry::allow(
                Principal::User(alice()),
                PolicyPermission::JOIN,
            )]),
            ranged_expiry(60, 3600),
        );

        let approval = ApprovalOperation::new(
            group,
            subject_for(bob()),
            subject_for(alice()),
            &BTreeMap::from([(EXPIRY_PROPERTY.to_string(), "120".to_string())]),
            provisioner(),
        )
        .await
        .unwrap();

        assert!(matches!(
            approval.approve().await,
            Err(KairosError::AccessDenied(_))
        ));
    }
}
