//! Environment loading and caching.
//!
//! Environments are registered as named sources (file paths or secret
//! locators); the policy document is loaded lazily on first use and
//! cached with a TTL. Concurrent misses on one environment coalesce
//! into a single load, and a failed load is surfaced as "not found"
//! without being cached, so the next request retries.

use crate::config::AppConfig;
use crate::errors::{KairosError, Result};
use crate::policy::{
    EnvironmentPolicy, JitGroupId, PolicyDocument, PolicyMetadata,
};
use crate::provision::{Provisioner, ProvisioningOutcome};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{error, instrument, warn};

/// A bare environment listing entry, available without loading the
/// policy document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvironmentSummary {
    /// The environment name.
    pub name: String,
    /// The registered description.
    pub description: String,
}

/// The canonical policy export of an environment.
#[derive(Clone, Debug)]
pub struct PolicyExport {
    /// Canonical document text.
    pub content: String,
    /// Source locator the policy was loaded from.
    pub source: String,
    /// Last modification time of the source, if known.
    pub last_modified: Option<OffsetDateTime>,
}

/// Compliance of one provisioned group with its policy.
#[derive(Debug)]
pub enum ComplianceState {
    /// Bindings converged with the policy.
    Compliant,
    /// The group exists but no policy covers it.
    Orphaned,
    /// A policy exists but reconciliation failed.
    NonCompliant(KairosError),
}

/// Per-group outcome of an environment reconciliation.
#[derive(Debug)]
pub struct GroupComplianceStatus {
    /// The group's id.
    pub id: JitGroupId,
    /// Its compliance state.
    pub state: ComplianceState,
}

/// An opaque source a policy document can be loaded from.
#[async_trait]
pub trait EnvironmentSource: Send + Sync {
    /// The environment name.
    fn name(&self) -> &str;

    /// Description shown in bare listings.
    fn description(&self) -> &str {
        ""
    }

    /// Loads the document text and its metadata.
    async fn load(&self) -> Result<(String, PolicyMetadata)>;
}

/// Loads policy documents from local files.
pub struct FileEnvironmentSource {
    name: String,
    path: PathBuf,
}

impl FileEnvironmentSource {
    /// Creates a file source.
    pub fn new(name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl EnvironmentSource for FileEnvironmentSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> Result<(String, PolicyMetadata)> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        let last_modified = tokio::fs::metadata(&self.path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(OffsetDateTime::from);
        let metadata = PolicyMetadata::new(self.path.display().to_string(), last_modified);
        Ok((text, metadata))
    }
}

/// A loaded environment: the policy tree bound to its provisioner.
pub struct Environment {
    document: PolicyDocument,
    provisioner: Arc<Provisioner>,
}

impl Environment {
    /// Binds a parsed document to a provisioner.
    pub fn new(document: PolicyDocument, provisioner: Arc<Provisioner>) -> Self {
        Self {
            document,
            provisioner,
        }
    }

    /// The environment policy tree.
    pub fn policy(&self) -> &Arc<EnvironmentPolicy> {
        self.document.policy()
    }

    /// The provisioner for this environment's groups.
    pub fn provisioner(&self) -> &Arc<Provisioner> {
        &self.provisioner
    }

    /// The canonical policy document with source metadata.
    pub fn export(&self) -> Result<PolicyExport> {
        let metadata = self.policy().metadata();
        Ok(PolicyExport {
            content: self.document.to_yaml()?,
            source: metadata.source.clone(),
            last_modified: metadata.last_modified,
        })
    }

    /// Reconciles every provisioned group of this environment and
    /// reports per-group compliance.
    ///
    /// A provisioned group without a covering policy is orphaned; a
    /// group whose reconciliation fails is non-compliant and keeps the
    /// structured error for the caller to render.
    #[instrument(skip(self), fields(environment = %self.policy().name()))]
    pub async fn reconcile(&self) -> Result<Vec<GroupComplianceStatus>> {
        let provisioned = self
            .provisioner
            .provisioned_groups(self.policy().name())
            .await?;

        let mut statuses = Vec::with_capacity(provisioned.len());
        for entry in provisioned {
            let policy_group = self
                .policy()
                .system(entry.id.system())
                .and_then(|sys| sys.group(entry.id.name()));

            let state = match policy_group {
                None => ComplianceState::Orphaned,
                Some(group) => match self.provisioner.reconcile(&group).await {
                    Ok(ProvisioningOutcome::Unchanged | ProvisioningOutcome::Updated { .. }) => {
                        ComplianceState::Compliant
                    }
                    Err(err) => {
                        error!(group = %entry.id, error = %err, "reconciliation failed");
                        ComplianceState::NonCompliant(err)
                    }
                },
            };
            statuses.push(GroupComplianceStatus {
                id: entry.id,
                state,
            });
        }
        Ok(statuses)
    }
}

/// Lazy, TTL-cached environment registry.
pub struct EnvironmentLoader {
    sources: BTreeMap<String, Arc<dyn EnvironmentSource>>,
    provisioner: Arc<Provisioner>,
    cache: moka::future::Cache<String, Arc<Environment>>,
}

impl EnvironmentLoader {
    /// Creates a loader over registered sources.
    pub fn new(
        sources: Vec<Arc<dyn EnvironmentSource>>,
        provisioner: Arc<Provisioner>,
        ttl: std::time::Duration,
    ) -> Self {
        Self {
            sources: sources
                .into_iter()
                .map(|s| (s.name().to_string(), s))
                .collect(),
            provisioner,
            cache: moka::future::Cache::builder()
                .time_to_live(ttl)
                .max_capacity(256)
                .build(),
        }
    }

    /// Creates a loader from configured file sources.
    ///
    /// Locators of the form `file:<path>` (or bare paths) become file
    /// sources; other schemes are rejected here and belong to the
    /// deployment's secret-manager integration.
    pub fn from_config(config: &AppConfig, provisioner: Arc<Provisioner>) -> Result<Self> {
        let mut sources: Vec<Arc<dyn EnvironmentSource>> = Vec::new();
        for (name, locator) in &config.environments {
            let path = locator.strip_prefix("file:").unwrap_or(locator);
            if path.contains(':') {
                return Err(KairosError::Configuration(format!(
                    "environment '{name}': unsupported source locator '{locator}'"
                )));
            }
            sources.push(Arc::new(FileEnvironmentSource::new(name, path)));
        }
        Ok(Self::new(sources, provisioner, config.cache_timeout()))
    }

    /// Bare summaries of all registered environments, sorted by name.
    /// Does not load any policy document.
    pub fn summaries(&self) -> Vec<EnvironmentSummary> {
        self.sources
            .values()
            .map(|s| EnvironmentSummary {
                name: s.name().to_string(),
                description: s.description().to_string(),
            })
            .collect()
    }

    /// Loads an environment, serving repeated calls from the cache.
    ///
    /// Unknown names and load failures both come back as `None`;
    /// failures are logged and retried on the next call.
    pub async fn environment(&self, name: &str) -> Option<Arc<Environment>> {
        let source = Arc::clone(self.sources.get(name)?);
        let provisioner = Arc::clone(&self.provisioner);
        let registered = name.to_string();

        self.cache
            .try_get_with(registered.clone(), async move {
                let (text, metadata) = source.load().await?;
                let document = PolicyDocument::from_yaml(&text, metadata)?;
                for warning in document.warnings() {
                    warn!(environment = %registered, "{warning}");
                }
                if document.policy().name() != registered {
                    return Err(KairosError::InvalidPolicy(format!(
                        "document declares environment '{}' but is registered as '{registered}'",
                        document.policy().name()
                    )));
                }
                Ok(Arc::new(Environment::new(document, provisioner)))
            })
            .await
            .map_err(|err: Arc<KairosError>| {
                warn!(environment = %name, error = %err, "environment failed to load");
            })
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{DirectoryClient, GroupType};
    use crate::principal::GroupId;
    use crate::provision::testing::{InMemoryDirectory, InMemoryIam};
    use crate::subject::GroupMapping;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    const DOCUMENT: &str = r#"
schemaVersion: 1
environment:
  name: env-1
  description: Development sandbox
  systems:
    - name: sys-1
      groups:
        - name: g-1
          constraints:
            join:
              - type: expiry
                min: 60
                max: 60
          privileges:
            - kind: iam_role_binding
              resource: { type: project, name: projects/demo }
              role: roles/compute.viewer
"#;

    struct StaticSource {
        name: String,
        description: String,
        text: String,
        loads: AtomicUsize,
        fail_first: AtomicUsize,
    }

    impl StaticSource {
        fn new(name: &str, text: &str) -> Self {
            Self {
                name: name.into(),
                description: "Development sandbox".into(),
                text: text.into(),
                loads: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
            }
        }

        fn fail_next(&self, count: usize) {
            self.fail_first.store(count, Ordering::SeqCst);
        }

        fn load_count(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EnvironmentSource for StaticSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            &self.description
        }

        async fn load(&self) -> Result<(String, PolicyMetadata)> {
            let call = self.loads.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first.load(Ordering::SeqCst) {
                return Err(KairosError::transport(anyhow::anyhow!("source offline")));
            }
            Ok((
                self.text.clone(),
                PolicyMetadata::new(format!("static:{}", self.name), None),
            ))
        }
    }

    fn provisioner_with(
        directory: Arc<InMemoryDirectory>,
        iam: Arc<InMemoryIam>,
    ) -> Arc<Provisioner> {
        Arc::new(Provisioner::new(
            directory,
            iam,
            GroupMapping::new("example.com").unwrap(),
        ))
    }

    fn loader_with(source: Arc<StaticSource>) -> EnvironmentLoader {
        EnvironmentLoader::new(
            vec![source],
            provisioner_with(
                Arc::new(InMemoryDirectory::default()),
                Arc::new(InMemoryIam::default()),
            ),
            StdDuration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn test_summaries_do_not_load() {
        let source = Arc::new(StaticSource::new("env-1", DOCUMENT));
        let loader = loader_with(source.clone());

        let summaries = loader.summaries();
        assert_eq!(
            summaries,
            vec![EnvironmentSummary {
                name: "env-1".into(),
                description: "Development sandbox".into(),
            }]
        );
        assert_eq!(source.load_count(), 0);
    }

    #[tokio::test]
    async fn test_environment_is_cached() {
        let source = Arc::new(StaticSource::new("env-1", DOCUMENT));
        let loader = loader_with(source.clone());

        let first = loader.environment("env-1").await.unwrap();
        let second = loader.environment("env-1").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.load_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_coalesce() {
        let source = Arc::new(StaticSource::new("env-1", DOCUMENT));
        let loader = Arc::new(loader_with(source.clone()));

        let (a, b) = tokio::join!(loader.environment("env-1"), loader.environment("env-1"));
        assert!(a.is_some() && b.is_some());
        assert_eq!(source.load_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_environment_is_none() {
        let loader = loader_with(Arc::new(StaticSource::new("env-1", DOCUMENT)));
        assert!(loader.environment("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_load_failure_is_not_cached() {
        let source = Arc::new(StaticSource::new("env-1", DOCUMENT));
        source.fail_next(1);
        let loader = loader_with(source.clone());

        assert!(loader.environment("env-1").await.is_none());
        // The failure was not cached as a negative; the retry loads.
        assert!(loader.environment("env-1").await.is_some());
        assert_eq!(source.load_count(), 2);
    }

    #[tokio::test]
    async fn test_name_mismatch_is_rejected() {
        let source = Arc::new(StaticSource::new("env-2", DOCUMENT));
        let loader = loader_with(source);

        assert!(loader.environment("env-2").await.is_none());
    }

    #[tokio::test]
    async fn test_export_carries_source_metadata() {
        let source = Arc::new(StaticSource::new("env-1", DOCUMENT));
        let loader = loader_with(source);

        let environment = loader.environment("env-1").await.unwrap();
        let export = environment.export().unwrap();

        assert_eq!(export.source, "static:env-1");
        assert!(export.content.contains("env-1"));
        assert!(export.content.contains("roles/compute.viewer"));
    }

    #[tokio::test]
    async fn test_reconcile_classifies_compliant_and_orphaned() {
        let directory = Arc::new(InMemoryDirectory::default());
        for email in [
            "jit.env-1.sys-1.g-1@example.com",
            "jit.env-1.sys-1.orphan@example.com",
        ] {
            directory
                .create_group(
                    &GroupId::new(email).unwrap(),
                    GroupType::Security,
                    email,
                    "JIT group",
                )
                .await
                .unwrap();
        }
        let iam = Arc::new(InMemoryIam::default());

        let loader = EnvironmentLoader::new(
            vec![Arc::new(StaticSource::new("env-1", DOCUMENT))],
            provisioner_with(directory, iam),
            StdDuration::from_secs(300),
        );
        let environment = loader.environment("env-1").await.unwrap();

        let statuses = environment.reconcile().await.unwrap();
        assert_eq!(statuses.len(), 2);

        let by_name: BTreeMap<String, &GroupComplianceStatus> = statuses
            .iter()
            .map(|s| (s.id.name().to_string(), s))
            .collect();
        assert!(matches!(by_name["g-1"].state, ComplianceState::Compliant));
        assert!(matches!(by_name["orphan"].state, ComplianceState::Orphaned));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_keeps_structured_errors() {
        let directory = Arc::new(InMemoryDirectory::default());
        directory
            .create_group(
                &GroupId::new("jit.env-1.sys-1.g-1@example.com").unwrap(),
                GroupType::Security,
                "g-1",
                "JIT group",
            )
            .await
            .unwrap();
        let iam = Arc::new(InMemoryIam::default());
        iam.inject_conflicts(1000);

        let loader = EnvironmentLoader::new(
            vec![Arc::new(StaticSource::new("env-1", DOCUMENT))],
            provisioner_with(directory, iam),
            StdDuration::from_secs(300),
        );
        let environment = loader.environment("env-1").await.unwrap();

        let statuses = environment.reconcile().await.unwrap();
        assert_eq!(statuses.len(), 1);
        match &statuses[0].state {
            ComplianceState::NonCompliant(err) => {
                assert!(matches!(err, KairosError::Conflict(_)));
            }
            other => panic!("expected NonCompliant, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_from_config_accepts_file_locators() {
        let config = AppConfig::from_map(BTreeMap::from([
            ("RESOURCE_CUSTOMER_ID".to_string(), "C0abc123".to_string()),
            ("RESOURCE_DOMAIN".to_string(), "example.com".to_string()),
            (
                "RESOURCE_ENVIRONMENT_ENV_1".to_string(),
                "file:/etc/kairos/env-1.yaml".to_string(),
            ),
        ]))
        .unwrap();

        let loader = EnvironmentLoader::from_config(
            &config,
            provisioner_with(
                Arc::new(InMemoryDirectory::default()),
                Arc::new(InMemoryIam::default()),
            ),
        )
        .unwrap();

        assert_eq!(loader.summaries()[0].name, "env-1");
    }

    #[tokio::test]
    async fn test_from_config_rejects_unknown_scheme() {
        let config = AppConfig::from_map(BTreeMap::from([
            ("RESOURCE_CUSTOMER_ID".to_string(), "C0abc123".to_string()),
            ("RESOURCE_DOMAIN".to_string(), "example.com".to_string()),
            (
                "RESOURCE_ENVIRONMENT_PROD".to_string(),
                "vault:kairos-prod".to_string(),
            ),
        ]))
        .unwrap();

        let result = EnvironmentLoader::from_config(
            &config,
            provisioner_with(
                Arc::new(InMemoryDirectory::default()),
                Arc::new(InMemoryIam::default()),
            ),
        );
        assert!(matches!(result, Err(KairosError::Configuration(_))));
    }
}
