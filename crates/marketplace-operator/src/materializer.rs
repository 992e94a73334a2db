//! Catalog materializer
//!
//! Converges the registry workload of every CatalogSourceConfig onto its
//! spec. Runs as a kube `Controller`, which serializes reconciles per object
//! and re-triggers on out-of-band changes to the workload pieces.

use crate::clock::Clock;
use crate::config::MaterializerConfig;
use crate::crd::{CatalogSource, CatalogSourceConfig, CatalogSourceConfigStatus};
use crate::error::{with_timeout, OperatorError, Result};
use crate::health::MaterializerHealth;
use crate::registry_client::package_fingerprint;
use crate::resources::{
    deployment_fingerprint, deployment_image, verify_ownership, CatalogWorkload,
    WorkloadBuilder, WorkloadKey, FIELD_MANAGER, MANAGED_BY_LABEL,
};
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use chrono::SecondsFormat;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Error as FinalizerError, Event as FinalizerEvent};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

/// Finalizer that guarantees workload teardown on CatalogSourceConfig deletion
pub const FINALIZER_NAME: &str = "marketplace.operators.coreos.com/catalog-workload";

/// What a materialize pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Live state of a workload, as far as convergence cares
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservedWorkload {
    pub fingerprint: Option<String>,
    pub image: Option<String>,
    pub service_present: bool,
    pub catalog_namespaces: BTreeSet<String>,
}

impl ObservedWorkload {
    fn matches(&self, desired: &CatalogWorkload) -> bool {
        self.fingerprint.as_deref() == Some(desired.fingerprint.as_str())
            && self.image.as_deref() == Some(desired.image.as_str())
            && self.service_present
            && self.catalog_namespaces == desired.catalog_namespaces()
    }
}

/// Cluster access needed by the materializer
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    /// Current workload state; `None` when the Deployment is gone
    async fn observe(&self, key: &WorkloadKey) -> Result<Option<ObservedWorkload>>;

    async fn create(&self, workload: &CatalogWorkload) -> Result<()>;

    /// Bring an existing workload to `workload`, removing CatalogSources
    /// from namespaces no longer targeted
    async fn update(&self, workload: &CatalogWorkload, observed: &ObservedWorkload) -> Result<()>;

    /// Remove every piece of the workload. Missing pieces are not an error.
    async fn delete(&self, key: &WorkloadKey) -> Result<()>;

    async fn write_config_status(
        &self,
        key: &WorkloadKey,
        status: &CatalogSourceConfigStatus,
    ) -> Result<()>;
}

/// [`WorkloadStore`] backed by the Kubernetes API
pub struct KubeWorkloadStore {
    client: Client,
}

impl KubeWorkloadStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn catalog_sources(&self, key: &WorkloadKey) -> Result<Vec<CatalogSource>> {
        let api: Api<CatalogSource> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default().labels(&key.selector()))
            .await?;
        Ok(list.items)
    }

    async fn apply_workload(&self, workload: &CatalogWorkload) -> Result<()> {
        let key = &workload.key;

        let services: Api<Service> = Api::namespaced(self.client.clone(), &key.namespace);
        apply_resource(&services, &workload.service).await?;

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &key.namespace);
        apply_resource(&deployments, &workload.deployment).await?;

        for catalog_source in &workload.catalog_sources {
            let namespace = catalog_source
                .namespace()
                .unwrap_or_else(|| key.namespace.clone());
            let api: Api<CatalogSource> = Api::namespaced(self.client.clone(), &namespace);
            apply_resource(&api, catalog_source).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkloadStore for KubeWorkloadStore {
    async fn observe(&self, key: &WorkloadKey) -> Result<Option<ObservedWorkload>> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &key.namespace);
        let Some(deployment) = deployments.get_opt(&key.name).await? else {
            return Ok(None);
        };

        let services: Api<Service> = Api::namespaced(self.client.clone(), &key.namespace);
        let service_present = services.get_opt(&key.name).await?.is_some();

        let catalog_namespaces = self
            .catalog_sources(key)
            .await?
            .iter()
            .filter_map(|cs| cs.namespace())
            .collect();

        Ok(Some(ObservedWorkload {
            fingerprint: deployment_fingerprint(&deployment),
            image: deployment_image(&deployment),
            service_present,
            catalog_namespaces,
        }))
    }

    async fn create(&self, workload: &CatalogWorkload) -> Result<()> {
        self.apply_workload(workload).await
    }

    async fn update(&self, workload: &CatalogWorkload, observed: &ObservedWorkload) -> Result<()> {
        self.apply_workload(workload).await?;

        let desired = workload.catalog_namespaces();
        for namespace in observed.catalog_namespaces.difference(&desired) {
            debug!(namespace = %namespace, name = %workload.key.name, "Removing stale CatalogSource");
            let api: Api<CatalogSource> = Api::namespaced(self.client.clone(), namespace);
            delete_ignoring_missing(&api, &workload.key.name).await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &WorkloadKey) -> Result<()> {
        for catalog_source in self.catalog_sources(key).await? {
            let namespace = catalog_source
                .namespace()
                .unwrap_or_else(|| key.namespace.clone());
            let api: Api<CatalogSource> = Api::namespaced(self.client.clone(), &namespace);
            delete_ignoring_missing(&api, &catalog_source.name_any()).await?;
        }

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &key.namespace);
        delete_ignoring_missing(&deployments, &key.name).await?;

        let services: Api<Service> = Api::namespaced(self.client.clone(), &key.namespace);
        delete_ignoring_missing(&services, &key.name).await?;
        Ok(())
    }

    async fn write_config_status(
        &self,
        key: &WorkloadKey,
        status: &CatalogSourceConfigStatus,
    ) -> Result<()> {
        let api: Api<CatalogSourceConfig> = Api::namespaced(self.client.clone(), &key.namespace);

        debug!(name = %key.name, phase = %status.phase, "Updating CatalogSourceConfig status");

        let patch = serde_json::json!({
            "status": status
        });
        api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Server-side apply after checking we still own the object
async fn apply_resource<K>(api: &Api<K>, resource: &K) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = resource
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| OperatorError::InvalidConfig("resource missing metadata.name".into()))?;

    if let Some(existing) = api.get_opt(name).await? {
        verify_ownership(&existing)?;
    }

    let patch_params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(name, &patch_params, &Patch::Apply(resource))
        .await?;
    Ok(())
}

async fn delete_ignoring_missing<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Converges workloads onto CatalogSourceConfigs
pub struct CatalogMaterializer {
    store: Arc<dyn WorkloadStore>,
    clock: Arc<dyn Clock>,
    config: MaterializerConfig,
}

impl CatalogMaterializer {
    pub fn new(
        store: Arc<dyn WorkloadStore>,
        clock: Arc<dyn Clock>,
        config: MaterializerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Create, update or leave alone the workload of `config`
    pub async fn materialize(&self, config: &CatalogSourceConfig) -> Result<MaterializeOutcome> {
        validate_config(config)?;

        let desired = WorkloadBuilder::new(config, &self.config.registry_server_image)?.build();
        let key = &desired.key;
        let timeout = self.config.api_timeout;

        let observed =
            with_timeout(timeout, "observe workload", self.store.observe(key)).await?;

        match observed {
            None => {
                info!(workload = %key, fingerprint = %desired.fingerprint, "Creating catalog workload");
                with_timeout(timeout, "create workload", self.store.create(&desired)).await?;
                Ok(MaterializeOutcome::Created)
            }
            Some(observed) if observed.matches(&desired) => {
                debug!(workload = %key, "Catalog workload up to date");
                Ok(MaterializeOutcome::Unchanged)
            }
            Some(observed) => {
                info!(
                    workload = %key,
                    from = observed.fingerprint.as_deref().unwrap_or("<none>"),
                    to = %desired.fingerprint,
                    "Updating catalog workload"
                );
                with_timeout(
                    timeout,
                    "update workload",
                    self.store.update(&desired, &observed),
                )
                .await?;
                Ok(MaterializeOutcome::Updated)
            }
        }
    }

    /// Remove the workload of a deleted CatalogSourceConfig
    pub async fn teardown(&self, config: &CatalogSourceConfig) -> Result<()> {
        let key = config_key(config);
        info!(workload = %key, "Tearing down catalog workload");
        with_timeout(
            self.config.api_timeout,
            "delete workload",
            self.store.delete(&key),
        )
        .await
    }

    /// Materialize and record the result on the config's status
    pub async fn converge(&self, config: &CatalogSourceConfig) -> Result<MaterializeOutcome> {
        let result = self.materialize(config).await;
        let key = config_key(config);
        let current = config.status.as_ref();

        let status = match &result {
            Ok(outcome) => {
                let fingerprint = package_fingerprint(&config.spec.packages);
                let unchanged = *outcome == MaterializeOutcome::Unchanged
                    && current.is_some_and(|s| {
                        s.phase == "Succeeded" && s.fingerprint.as_deref() == Some(fingerprint.as_str())
                    });
                if unchanged {
                    None
                } else {
                    Some(CatalogSourceConfigStatus {
                        phase: "Succeeded".to_string(),
                        message: format!("{} packages served", config.spec.packages.len()),
                        fingerprint: Some(fingerprint),
                        last_materialized: Some(
                            self.clock.now().to_rfc3339_opts(SecondsFormat::Secs, true),
                        ),
                    })
                }
            }
            Err(e) => {
                let message = e.to_string();
                let previous = current.cloned().unwrap_or_default();
                if previous.phase == "Failed" && previous.message == message {
                    None
                } else {
                    Some(CatalogSourceConfigStatus {
                        phase: "Failed".to_string(),
                        message,
                        ..previous
                    })
                }
            }
        };

        if let Some(status) = status {
            if let Err(e) = with_timeout(
                self.config.api_timeout,
                "write CatalogSourceConfig status",
                self.store.write_config_status(&key, &status),
            )
            .await
            {
                warn!(workload = %key, error = %e, "Failed to write CatalogSourceConfig status");
            }
        }

        result
    }
}

fn config_key(config: &CatalogSourceConfig) -> WorkloadKey {
    WorkloadKey::new(
        config.namespace().unwrap_or_else(|| "default".to_string()),
        config.name_any(),
    )
}

fn validate_config(config: &CatalogSourceConfig) -> Result<()> {
    if let Err(errors) = config.spec.validate() {
        let error_messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter()
                    .map(move |e| format!("{}: {:?}", field, e.message))
            })
            .collect();
        let error_msg = error_messages.join("; ");
        warn!(name = %config.name_any(), errors = %error_msg, "CatalogSourceConfig validation failed");
        return Err(OperatorError::InvalidConfig(error_msg));
    }
    Ok(())
}

/// Per-config failure tallies, published as [`MaterializerHealth`]
pub struct FailureTracker {
    failures: DashMap<String, u32>,
    last_errors: DashMap<String, String>,
    reconciled: AtomicU64,
    health: watch::Sender<MaterializerHealth>,
}

impl FailureTracker {
    pub fn new(health: watch::Sender<MaterializerHealth>) -> Self {
        Self {
            failures: DashMap::new(),
            last_errors: DashMap::new(),
            reconciled: AtomicU64::new(0),
            health,
        }
    }

    pub fn record_success(&self, key: &WorkloadKey) {
        self.failures.remove(&key.to_string());
        self.last_errors.remove(&key.to_string());
        self.reconciled.fetch_add(1, Ordering::Relaxed);
        self.publish();
    }

    pub fn record_failure(&self, key: &WorkloadKey, error: &OperatorError) -> u32 {
        let count = {
            let mut entry = self.failures.entry(key.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        self.last_errors.insert(key.to_string(), error.to_string());
        self.publish();
        count
    }

    /// Drop the tallies of a deleted config
    pub fn forget(&self, key: &WorkloadKey) {
        self.failures.remove(&key.to_string());
        self.last_errors.remove(&key.to_string());
        self.publish();
    }

    fn publish(&self) {
        let health = MaterializerHealth {
            failing: self
                .failures
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            last_errors: self
                .last_errors
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            reconciled: self.reconciled.load(Ordering::Relaxed),
        };
        self.health.send_replace(health);
    }
}

/// Metrics for the materializer controller
#[derive(Clone)]
pub struct MaterializerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl MaterializerMetrics {
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("marketplace_materializer_reconciliations_total"),
            errors: metrics::counter!("marketplace_materializer_errors_total"),
            duration: metrics::histogram!("marketplace_materializer_duration_seconds"),
        }
    }
}

impl Default for MaterializerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Context passed to the controller
pub struct MaterializerContext {
    pub client: Client,
    pub materializer: CatalogMaterializer,
    pub failures: FailureTracker,
    pub metrics: Option<MaterializerMetrics>,
    pub config: MaterializerConfig,
}

/// Run the materializer controller until `shutdown` fires
pub async fn run_materializer(
    client: Client,
    namespace: &str,
    config: MaterializerConfig,
    clock: Arc<dyn Clock>,
    health: watch::Sender<MaterializerHealth>,
    shutdown: Shutdown,
) -> Result<()> {
    let configs: Api<CatalogSourceConfig> = Api::namespaced(client.clone(), namespace);
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    let catalog_sources: Api<CatalogSource> = Api::all(client.clone());

    let store = Arc::new(KubeWorkloadStore::new(client.clone()));
    let ctx = Arc::new(MaterializerContext {
        client,
        materializer: CatalogMaterializer::new(store, clock, config.clone()),
        failures: FailureTracker::new(health),
        metrics: Some(MaterializerMetrics::new()),
        config,
    });

    info!(namespace = %namespace, "Starting CatalogSourceConfig materializer");

    // Workload pieces carry label back-references instead of owner refs
    let managed = Config::default().labels(&format!("{}={}", MANAGED_BY_LABEL, FIELD_MANAGER));

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        let _ = stop_tx.send(());
    });

    Controller::new(configs, Config::default())
        .watches(deployments, managed.clone(), owning_config)
        .watches(services, managed.clone(), owning_config)
        .watches(catalog_sources, managed, owning_config)
        .graceful_shutdown_on(async move {
            let _ = stop_rx.await;
        })
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    info!("CatalogSourceConfig materializer stopped");
    Ok(())
}

/// Map a workload piece back to the config that produced it
fn owning_config<K: Resource>(obj: K) -> Option<ObjectRef<CatalogSourceConfig>> {
    let key = WorkloadKey::from_labels(obj.labels())?;
    Some(ObjectRef::new(&key.name).within(&key.namespace))
}

#[instrument(skip(config, ctx), fields(name = %config.name_any(), namespace = config.namespace()))]
async fn reconcile(
    config: Arc<CatalogSourceConfig>,
    ctx: Arc<MaterializerContext>,
) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let namespace = config.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<CatalogSourceConfig> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&api, FINALIZER_NAME, config, |event| async {
        match event {
            FinalizerEvent::Apply(config) => apply_config(config, ctx.clone()).await,
            FinalizerEvent::Cleanup(config) => cleanup_config(config, ctx.clone()).await,
        }
    })
    .await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    result.map_err(|e| {
        if let Some(ref metrics) = ctx.metrics {
            metrics.errors.increment(1);
        }
        match e {
            FinalizerError::ApplyFailed(inner) | FinalizerError::CleanupFailed(inner) => inner,
            other => OperatorError::ReconcileFailed(other.to_string()),
        }
    })
}

async fn apply_config(
    config: Arc<CatalogSourceConfig>,
    ctx: Arc<MaterializerContext>,
) -> Result<Action> {
    let key = config_key(&config);

    match ctx.materializer.converge(&config).await {
        Ok(outcome) => {
            debug!(workload = %key, ?outcome, "Materialized");
            ctx.failures.record_success(&key);
            Ok(Action::requeue(ctx.config.resync_interval))
        }
        Err(e) => {
            let failures = ctx.failures.record_failure(&key, &e);
            warn!(workload = %key, error = %e, failures, "Materialization failed");
            Err(e)
        }
    }
}

async fn cleanup_config(
    config: Arc<CatalogSourceConfig>,
    ctx: Arc<MaterializerContext>,
) -> Result<Action> {
    ctx.materializer.teardown(&config).await?;
    ctx.failures.forget(&config_key(&config));
    Ok(Action::await_change())
}

/// Fixed-interval retry. Invalid specs wait for the regular resync or an edit.
fn error_policy(
    config: Arc<CatalogSourceConfig>,
    error: &OperatorError,
    ctx: Arc<MaterializerContext>,
) -> Action {
    let delay = if error.is_retryable() {
        ctx.config.error_requeue
    } else {
        ctx.config.resync_interval
    };

    warn!(
        error = %error,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        config.name_any()
    );

    Action::requeue(delay)
}
