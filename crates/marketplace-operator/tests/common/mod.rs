//! In-memory stand-ins for the cluster and the registries

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use marketplace_operator::crd::{
    CatalogSourceConfig, CatalogSourceConfigSpec, CatalogSourceConfigStatus,
    ClusterOperatorStatus, MigrationRecordSpec, OperatorSource, OperatorSourceSpec,
    OperatorSourceStatus,
};
use marketplace_operator::error::{OperatorError, Result};
use marketplace_operator::materializer::{ObservedWorkload, WorkloadStore};
use marketplace_operator::migrator::MigrationStore;
use marketplace_operator::registry_client::{PackageManifest, RegistryClient, RegistryError};
use marketplace_operator::resources::{CatalogWorkload, WorkloadKey};
use marketplace_operator::status::StatusStore;
use marketplace_operator::syncer::SourceStore;
use metrics_util::debugging::{DebugValue, Snapshotter};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

pub const NAMESPACE: &str = "openshift-marketplace";

pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn create_test_source(name: &str, endpoint: &str) -> OperatorSource {
    OperatorSource {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some(format!("{}-uid", name)),
            generation: Some(1),
            ..Default::default()
        },
        spec: OperatorSourceSpec {
            source_type: "appregistry".to_string(),
            endpoint: endpoint.to_string(),
            registry_namespace: name.to_string(),
            display_name: Some(format!("{} Operators", name)),
            publisher: None,
            target_namespaces: vec![],
        },
        status: None,
    }
}

pub fn create_test_config(name: &str, packages: &[&str]) -> CatalogSourceConfig {
    let mut config = CatalogSourceConfig::new(
        name,
        CatalogSourceConfigSpec {
            source: name.to_string(),
            endpoint: format!("https://{}.test", name),
            registry_namespace: name.to_string(),
            packages: packages.iter().map(|p| p.to_string()).collect(),
            target_namespaces: vec![],
            display_name: None,
            publisher: None,
        },
    );
    config.metadata.namespace = Some(NAMESPACE.to_string());
    config
}

/// Registry whose answers are set per endpoint
#[derive(Default)]
pub struct MockRegistryClient {
    responses: Mutex<HashMap<String, std::result::Result<Vec<String>, RegistryError>>>,
    pub calls: Mutex<Vec<String>>,
}

impl MockRegistryClient {
    pub fn respond(&self, endpoint: &str, result: std::result::Result<Vec<&str>, RegistryError>) {
        self.responses.lock().insert(
            endpoint.to_string(),
            result.map(|p| p.into_iter().map(String::from).collect()),
        );
    }
}

#[async_trait]
impl RegistryClient for MockRegistryClient {
    async fn fetch_packages(
        &self,
        endpoint: &str,
        _registry_namespace: &str,
    ) -> std::result::Result<PackageManifest, RegistryError> {
        self.calls.lock().push(endpoint.to_string());
        match self.responses.lock().get(endpoint) {
            Some(Ok(packages)) => Ok(PackageManifest::new(packages.clone())),
            Some(Err(e)) => Err(e.clone()),
            None => Err(RegistryError::HostNotFound(endpoint.to_string())),
        }
    }
}

#[derive(Default)]
pub struct MockSourceStore {
    pub sources: Mutex<Vec<OperatorSource>>,
    pub applied: Mutex<Vec<CatalogSourceConfig>>,
}

impl MockSourceStore {
    pub fn with_sources(sources: Vec<OperatorSource>) -> Self {
        Self {
            sources: Mutex::new(sources),
            applied: Mutex::new(Vec::new()),
        }
    }

    pub fn status_of(&self, name: &str) -> Option<OperatorSourceStatus> {
        self.sources
            .lock()
            .iter()
            .find(|s| s.name_any() == name)
            .and_then(|s| s.status.clone())
    }

    pub fn applied_config(&self, name: &str) -> Option<CatalogSourceConfig> {
        self.applied
            .lock()
            .iter()
            .find(|c| c.name_any() == name)
            .cloned()
    }
}

#[async_trait]
impl SourceStore for MockSourceStore {
    async fn list_sources(&self) -> Result<Vec<OperatorSource>> {
        Ok(self.sources.lock().clone())
    }

    async fn update_source_status(
        &self,
        source: &OperatorSource,
        status: &OperatorSourceStatus,
    ) -> Result<()> {
        let mut sources = self.sources.lock();
        if let Some(s) = sources.iter_mut().find(|s| s.name_any() == source.name_any()) {
            s.status = Some(status.clone());
        }
        Ok(())
    }

    async fn apply_catalog_config(&self, config: &CatalogSourceConfig) -> Result<()> {
        let mut applied = self.applied.lock();
        applied.retain(|c| c.name_any() != config.name_any());
        applied.push(config.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockWorkloadStore {
    pub workloads: Mutex<HashMap<WorkloadKey, ObservedWorkload>>,
    pub mutations: Mutex<Vec<String>>,
    pub statuses: Mutex<Vec<CatalogSourceConfigStatus>>,
}

impl MockWorkloadStore {
    pub fn mutation_count(&self) -> usize {
        self.mutations.lock().len()
    }

    /// Simulate someone deleting the workload behind the operator's back
    pub fn delete_externally(&self, key: &WorkloadKey) {
        self.workloads.lock().remove(key);
    }

    pub fn fingerprint_of(&self, key: &WorkloadKey) -> Option<String> {
        self.workloads
            .lock()
            .get(key)
            .and_then(|w| w.fingerprint.clone())
    }
}

fn observed_from(workload: &CatalogWorkload) -> ObservedWorkload {
    ObservedWorkload {
        fingerprint: Some(workload.fingerprint.clone()),
        image: Some(workload.image.clone()),
        service_present: true,
        catalog_namespaces: workload.catalog_namespaces(),
    }
}

#[async_trait]
impl WorkloadStore for MockWorkloadStore {
    async fn observe(&self, key: &WorkloadKey) -> Result<Option<ObservedWorkload>> {
        Ok(self.workloads.lock().get(key).cloned())
    }

    async fn create(&self, workload: &CatalogWorkload) -> Result<()> {
        self.mutations.lock().push(format!("create {}", workload.key));
        self.workloads
            .lock()
            .insert(workload.key.clone(), observed_from(workload));
        Ok(())
    }

    async fn update(&self, workload: &CatalogWorkload, _observed: &ObservedWorkload) -> Result<()> {
        self.mutations.lock().push(format!("update {}", workload.key));
        self.workloads
            .lock()
            .insert(workload.key.clone(), observed_from(workload));
        Ok(())
    }

    async fn delete(&self, key: &WorkloadKey) -> Result<()> {
        self.mutations.lock().push(format!("delete {}", key));
        self.workloads.lock().remove(key);
        Ok(())
    }

    async fn write_config_status(
        &self,
        _key: &WorkloadKey,
        status: &CatalogSourceConfigStatus,
    ) -> Result<()> {
        self.statuses.lock().push(status.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockMigrationStore {
    pub records: Mutex<BTreeMap<String, MigrationRecordSpec>>,
    pub configs: Mutex<Vec<CatalogSourceConfig>>,
    pub sources: Mutex<Vec<OperatorSource>>,
    pub mutations: Mutex<Vec<String>>,
    pub fail_deletes: Mutex<bool>,
}

impl MockMigrationStore {
    pub fn mutation_count(&self) -> usize {
        self.mutations.lock().len()
    }
}

#[async_trait]
impl MigrationStore for MockMigrationStore {
    async fn record_exists(&self, _namespace: &str, step: &str) -> Result<bool> {
        Ok(self.records.lock().contains_key(step))
    }

    async fn write_record(&self, _namespace: &str, record: &MigrationRecordSpec) -> Result<()> {
        self.mutations.lock().push(format!("record {}", record.step));
        self.records
            .lock()
            .insert(record.step.clone(), record.clone());
        Ok(())
    }

    async fn list_catalog_configs(&self, _namespace: &str) -> Result<Vec<CatalogSourceConfig>> {
        Ok(self.configs.lock().clone())
    }

    async fn remove_finalizer(&self, _namespace: &str, name: &str, finalizer: &str) -> Result<()> {
        self.mutations.lock().push(format!("unfinalize {}", name));
        for config in self.configs.lock().iter_mut() {
            if config.name_any() == name {
                if let Some(finalizers) = config.metadata.finalizers.as_mut() {
                    finalizers.retain(|f| f != finalizer);
                }
            }
        }
        Ok(())
    }

    async fn delete_catalog_config(&self, _namespace: &str, name: &str) -> Result<()> {
        if *self.fail_deletes.lock() {
            return Err(OperatorError::ReconcileFailed(format!(
                "admission webhook denied delete of {}",
                name
            )));
        }
        self.mutations.lock().push(format!("delete {}", name));
        self.configs.lock().retain(|c| c.name_any() != name);
        Ok(())
    }

    async fn get_source(&self, _namespace: &str, name: &str) -> Result<Option<OperatorSource>> {
        Ok(self
            .sources
            .lock()
            .iter()
            .find(|s| s.name_any() == name)
            .cloned())
    }

    async fn set_catalog_endpoint(
        &self,
        _namespace: &str,
        name: &str,
        endpoint: &str,
        registry_namespace: &str,
    ) -> Result<()> {
        self.mutations.lock().push(format!("backfill {}", name));
        for config in self.configs.lock().iter_mut() {
            if config.name_any() == name {
                config.spec.endpoint = endpoint.to_string();
                config.spec.registry_namespace = registry_namespace.to_string();
            }
        }
        Ok(())
    }
}

/// Keeps every status written, newest last
#[derive(Default)]
pub struct MockStatusStore {
    pub writes: Mutex<Vec<ClusterOperatorStatus>>,
}

impl MockStatusStore {
    pub fn latest(&self) -> Option<ClusterOperatorStatus> {
        self.writes.lock().last().cloned()
    }
}

#[async_trait]
impl StatusStore for MockStatusStore {
    async fn read_status(&self, _name: &str) -> Result<Option<ClusterOperatorStatus>> {
        Ok(self.latest())
    }

    async fn write_status(&self, _name: &str, status: &ClusterOperatorStatus) -> Result<()> {
        self.writes.lock().push(status.clone());
        Ok(())
    }
}

/// `(status, reason)` of one condition type
pub fn condition(status: &ClusterOperatorStatus, condition_type: &str) -> Option<(String, String)> {
    status
        .conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
        .map(|c| (c.status.clone(), c.reason.clone()))
}

/// Value of the counter `name` whose labels include all of `labels`
pub fn counter_value(snapshotter: &Snapshotter, name: &str, labels: &[(&str, &str)]) -> u64 {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(key, _, _, _)| {
            let key = key.key();
            key.name() == name
                && labels
                    .iter()
                    .all(|(k, v)| key.labels().any(|l| l.key() == *k && l.value() == *v))
        })
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(count) => count,
            _ => 0,
        })
        .sum()
}
