//! Startup migration
//!
//! Applies an ordered list of steps to resources left behind by an earlier
//! release. Each completed step is recorded as a `MigrationRecord` named
//! after the step, so a step runs at most once per namespace. Any failure
//! aborts startup.

use crate::clock::Clock;
use crate::crd::{CatalogSourceConfig, MigrationRecord, MigrationRecordSpec, OperatorSource};
use crate::error::{with_timeout, OperatorError, Result};
use async_trait::async_trait;
use chrono::SecondsFormat;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Finalizer set by the release that managed CatalogSourceConfigs in-process
pub const LEGACY_FINALIZER: &str = "finalizer.catalogsourceconfigs.operators.coreos.com";

/// Label on the per-source datastore configs of the earlier release
pub const DATASTORE_LABEL: &str = "opsrc-datastore";

const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(120);

/// Cluster access needed by migration steps
#[async_trait]
pub trait MigrationStore: Send + Sync {
    async fn record_exists(&self, namespace: &str, step: &str) -> Result<bool>;

    /// Create the record. An existing record counts as success.
    async fn write_record(&self, namespace: &str, record: &MigrationRecordSpec) -> Result<()>;

    async fn list_catalog_configs(&self, namespace: &str) -> Result<Vec<CatalogSourceConfig>>;

    async fn remove_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()>;

    /// Delete a config. A config that is already gone counts as success.
    async fn delete_catalog_config(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_source(&self, namespace: &str, name: &str) -> Result<Option<OperatorSource>>;

    async fn set_catalog_endpoint(
        &self,
        namespace: &str,
        name: &str,
        endpoint: &str,
        registry_namespace: &str,
    ) -> Result<()>;
}

/// [`MigrationStore`] backed by the Kubernetes API
pub struct KubeMigrationStore {
    client: Client,
}

impl KubeMigrationStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn configs(&self, namespace: &str) -> Api<CatalogSourceConfig> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl MigrationStore for KubeMigrationStore {
    async fn record_exists(&self, namespace: &str, step: &str) -> Result<bool> {
        let api: Api<MigrationRecord> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(step).await?.is_some())
    }

    async fn write_record(&self, namespace: &str, record: &MigrationRecordSpec) -> Result<()> {
        let api: Api<MigrationRecord> = Api::namespaced(self.client.clone(), namespace);
        let mut object = MigrationRecord::new(&record.step, record.clone());
        object.metadata.namespace = Some(namespace.to_string());

        match api.create(&PostParams::default(), &object).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(step = %record.step, "Migration record already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_catalog_configs(&self, namespace: &str) -> Result<Vec<CatalogSourceConfig>> {
        let list = self.configs(namespace).list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()> {
        let api = self.configs(namespace);
        let Some(config) = api.get_opt(name).await? else {
            return Ok(());
        };

        let remaining: Vec<String> = config
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect();

        // resourceVersion makes the patch fail instead of dropping a concurrent edit
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": remaining,
                "resourceVersion": config.resource_version(),
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_catalog_config(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .configs(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_source(&self, namespace: &str, name: &str) -> Result<Option<OperatorSource>> {
        let api: Api<OperatorSource> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn set_catalog_endpoint(
        &self,
        namespace: &str,
        name: &str,
        endpoint: &str,
        registry_namespace: &str,
    ) -> Result<()> {
        let patch = serde_json::json!({
            "spec": {
                "endpoint": endpoint,
                "registryNamespace": registry_namespace,
            }
        });
        self.configs(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// One idempotent migration step
#[async_trait]
pub trait MigrationStep: Send + Sync {
    /// Stable identifier; also the name of the step's MigrationRecord
    fn id(&self) -> &'static str;

    /// Apply the step. Must tolerate already-migrated data.
    async fn apply(&self, store: &dyn MigrationStore, namespace: &str) -> Result<()>;
}

/// Drop the in-process finalizer the earlier release put on every config
pub struct StripLegacyFinalizers;

#[async_trait]
impl MigrationStep for StripLegacyFinalizers {
    fn id(&self) -> &'static str {
        "strip-legacy-finalizers"
    }

    async fn apply(&self, store: &dyn MigrationStore, namespace: &str) -> Result<()> {
        for config in store.list_catalog_configs(namespace).await? {
            if config.finalizers().iter().any(|f| f == LEGACY_FINALIZER) {
                info!(name = %config.name_any(), "Removing legacy finalizer");
                store
                    .remove_finalizer(namespace, &config.name_any(), LEGACY_FINALIZER)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Delete the per-source datastore configs the earlier release kept
pub struct RemoveDatastoreConfigs;

#[async_trait]
impl MigrationStep for RemoveDatastoreConfigs {
    fn id(&self) -> &'static str {
        "remove-datastore-configs"
    }

    async fn apply(&self, store: &dyn MigrationStore, namespace: &str) -> Result<()> {
        for config in store.list_catalog_configs(namespace).await? {
            let is_datastore = config
                .labels()
                .get(DATASTORE_LABEL)
                .is_some_and(|v| v == "true");
            if is_datastore {
                info!(name = %config.name_any(), "Deleting datastore CatalogSourceConfig");
                store
                    .delete_catalog_config(namespace, &config.name_any())
                    .await?;
            }
        }
        Ok(())
    }
}

/// Fill in registry coordinates on configs created before they were copied
/// from the OperatorSource
pub struct BackfillSourceEndpoints;

#[async_trait]
impl MigrationStep for BackfillSourceEndpoints {
    fn id(&self) -> &'static str {
        "backfill-source-endpoints"
    }

    async fn apply(&self, store: &dyn MigrationStore, namespace: &str) -> Result<()> {
        for config in store.list_catalog_configs(namespace).await? {
            if !config.spec.endpoint.is_empty() || config.spec.source.is_empty() {
                continue;
            }
            let name = config.name_any();
            match store.get_source(namespace, &config.spec.source).await? {
                Some(source) => {
                    info!(name = %name, source = %config.spec.source, "Backfilling registry endpoint");
                    store
                        .set_catalog_endpoint(
                            namespace,
                            &name,
                            &source.spec.endpoint,
                            &source.spec.registry_namespace,
                        )
                        .await?;
                }
                None => {
                    warn!(name = %name, source = %config.spec.source, "Source gone, leaving config untouched");
                }
            }
        }
        Ok(())
    }
}

/// The built-in steps, in execution order
pub fn default_steps() -> Vec<Box<dyn MigrationStep>> {
    vec![
        Box::new(StripLegacyFinalizers),
        Box::new(RemoveDatastoreConfigs),
        Box::new(BackfillSourceEndpoints),
    ]
}

/// Outcome of a successful migration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    /// Steps executed by this call
    pub applied: Vec<String>,
    /// Steps skipped because their record already existed
    pub skipped: Vec<String>,
}

/// Runs migration steps in order, gated by MigrationRecords
pub struct Migrator {
    store: Arc<dyn MigrationStore>,
    steps: Vec<Box<dyn MigrationStep>>,
    release_version: String,
    clock: Arc<dyn Clock>,
    api_timeout: Duration,
    step_timeout: Duration,
}

impl Migrator {
    /// Migrator with the built-in steps
    pub fn new(
        store: Arc<dyn MigrationStore>,
        release_version: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_steps(store, default_steps(), release_version, clock)
    }

    pub fn with_steps(
        store: Arc<dyn MigrationStore>,
        steps: Vec<Box<dyn MigrationStep>>,
        release_version: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            steps,
            release_version: release_version.into(),
            clock,
            api_timeout: DEFAULT_API_TIMEOUT,
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    /// Deadline for record reads and writes
    pub fn with_api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
    }

    pub fn step_ids(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.id()).collect()
    }

    /// Run every step not yet recorded for `namespace`.
    ///
    /// Stops at the first failing step without writing its record.
    #[instrument(skip(self))]
    pub async fn migrate(&self, namespace: &str) -> Result<MigrationSummary> {
        let mut summary = MigrationSummary::default();

        for step in &self.steps {
            let id = step.id();
            let failed = |e: OperatorError| OperatorError::MigrationFailed {
                step: id.to_string(),
                message: e.to_string(),
            };

            let done = with_timeout(
                self.api_timeout,
                "read migration record",
                self.store.record_exists(namespace, id),
            )
            .await
            .map_err(failed)?;

            if done {
                debug!(step = id, "Migration step already recorded");
                summary.skipped.push(id.to_string());
                continue;
            }

            info!(step = id, "Applying migration step");
            with_timeout(
                self.step_timeout,
                "migration step",
                step.apply(self.store.as_ref(), namespace),
            )
            .await
            .map_err(failed)?;

            let record = MigrationRecordSpec {
                step: id.to_string(),
                release_version: self.release_version.clone(),
                completed_at: self.clock.now().to_rfc3339_opts(SecondsFormat::Secs, true),
            };
            with_timeout(
                self.api_timeout,
                "write migration record",
                self.store.write_record(namespace, &record),
            )
            .await
            .map_err(failed)?;

            summary.applied.push(id.to_string());
        }

        info!(
            applied = summary.applied.len(),
            skipped = summary.skipped.len(),
            "Migration complete"
        );
        Ok(summary)
    }
}
