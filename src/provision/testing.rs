//! In-memory collaborator fakes shared by provisioning tests.

use crate::clients::{
    DirectoryClient, ExternalGroup, GroupType, IamBinding, IamClient, IamPolicy, Membership,
    MembershipId, MembershipSummary,
};
use crate::errors::{KairosError, Result};
use crate::policy::{
    ConstraintMap, EnvironmentPolicy, JitGroupPolicy, PolicyMetadata, Privilege, ResourceRef,
    SystemPolicy,
};
use crate::principal::{GroupId, UserId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use time::OffsetDateTime;

/// Builds an attached `env-1.sys-1.g-1` group carrying `privileges`.
///
/// The environment is returned too; parents are weak references, so a
/// caller must keep it alive for `JitGroupPolicy::id` to work.
pub(crate) fn attached_group(
    privileges: Vec<Privilege>,
) -> (std::sync::Arc<EnvironmentPolicy>, std::sync::Arc<JitGroupPolicy>) {
    let env = EnvironmentPolicy::new(
        "env-1",
        "",
        None,
        ConstraintMap::new(),
        PolicyMetadata::new("test", None),
    )
    .unwrap();
    let sys = SystemPolicy::new("sys-1", "", None, ConstraintMap::new()).unwrap();
    let group = JitGroupPolicy::new("g-1", "", None, ConstraintMap::new(), privileges).unwrap();
    env.add_system(sys.clone()).unwrap();
    sys.add_group(group.clone()).unwrap();
    (env, group)
}

/// Directory fake backed by hash maps.
#[derive(Default)]
pub(crate) struct InMemoryDirectory {
    groups: Mutex<HashMap<String, ExternalGroup>>,
    memberships: Mutex<HashMap<(String, String), OffsetDateTime>>,
    created: AtomicUsize,
    patched: AtomicUsize,
}

impl InMemoryDirectory {
    pub(crate) fn with_group(self, group: ExternalGroup) -> Self {
        self.groups
            .lock()
            .unwrap()
            .insert(group.id.email().to_string(), group);
        self
    }

    pub(crate) fn group(&self, id: &GroupId) -> Option<ExternalGroup> {
        self.groups.lock().unwrap().get(id.email()).cloned()
    }

    pub(crate) fn membership_expiry(
        &self,
        group: &GroupId,
        user: &UserId,
    ) -> Option<OffsetDateTime> {
        self.memberships
            .lock()
            .unwrap()
            .get(&(group.email().to_string(), user.email().to_string()))
            .copied()
    }

    pub(crate) fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn patched_count(&self) -> usize {
        self.patched.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectoryClient for InMemoryDirectory {
    async fn list_memberships_by_user(&self, _user: &UserId) -> Result<Vec<MembershipSummary>> {
        Ok(vec![])
    }

    async fn get_membership(&self, id: &MembershipId) -> Result<Membership> {
        Err(KairosError::NotFound(format!("membership {}", id.0)))
    }

    async fn get_group(&self, id: &GroupId) -> Result<ExternalGroup> {
        self.group(id)
            .ok_or_else(|| KairosError::NotFound(format!("group {id}")))
    }

    async fn create_group(
        &self,
        id: &GroupId,
        _group_type: GroupType,
        display_name: &str,
        description: &str,
    ) -> Result<ExternalGroup> {
        let mut groups = self.groups.lock().unwrap();
        if groups.contains_key(id.email()) {
            return Err(KairosError::AlreadyExists(format!("group {id}")));
        }
        let group = ExternalGroup {
            id: id.clone(),
            display_name: display_name.to_string(),
            description: description.to_string(),
        };
        groups.insert(id.email().to_string(), group.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(group)
    }

    async fn add_membership(
        &self,
        group: &GroupId,
        user: &UserId,
        expiry: OffsetDateTime,
    ) -> Result<()> {
        self.memberships
            .lock()
            .unwrap()
            .insert((group.email().to_string(), user.email().to_string()), expiry);
        Ok(())
    }

    async fn patch_group(&self, id: &GroupId, description: &str) -> Result<()> {
        let mut groups = self.groups.lock().unwrap();
        let group = groups
            .get_mut(id.email())
            .ok_or_else(|| KairosError::NotFound(format!("group {id}")))?;
        group.description = description.to_string();
        self.patched.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn search_groups_by_prefix(&self, prefix: &str) -> Result<Vec<ExternalGroup>> {
        let mut found: Vec<ExternalGroup> = self
            .groups
            .lock()
            .unwrap()
            .values()
            .filter(|g| g.id.local_part().starts_with(prefix))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }
}

/// IAM fake storing one policy per resource and counting writes.
#[derive(Default)]
pub(crate) struct InMemoryIam {
    policies: Mutex<HashMap<ResourceRef, IamPolicy>>,
    writes: AtomicUsize,
    /// Number of leading calls that fail with `Conflict`.
    conflicts_to_inject: AtomicUsize,
    calls: AtomicUsize,
}

impl InMemoryIam {
    pub(crate) fn with_policy(self, resource: ResourceRef, bindings: Vec<IamBinding>) -> Self {
        self.policies.lock().unwrap().insert(
            resource,
            IamPolicy {
                bindings,
                etag: "etag-0".to_string(),
            },
        );
        self
    }

    pub(crate) fn inject_conflicts(&self, count: usize) {
        self.conflicts_to_inject.store(count, Ordering::SeqCst);
    }

    pub(crate) fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub(crate) fn policy(&self, resource: &ResourceRef) -> IamPolicy {
        self.policies
            .lock()
            .unwrap()
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl IamClient for InMemoryIam {
    async fn modify_iam_policy(
        &self,
        resource: &ResourceRef,
        mutator: &(dyn for<'r> Fn(&'r mut IamPolicy) + Send + Sync),
        _rationale: &str,
    ) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.conflicts_to_inject.load(Ordering::SeqCst) {
            return Err(KairosError::Conflict("etag mismatch".into()));
        }

        let mut policies = self.policies.lock().unwrap();
        let policy = policies.entry(resource.clone()).or_default();
        mutator(&mut *policy);
        policy.etag = format!("etag-{}", self.writes.load(Ordering::SeqCst) + 1);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
