//! Catalog workload builders
//!
//! Generates the Deployment, Service and CatalogSources that serve one
//! CatalogSourceConfig. Workload pieces carry label back-references to the
//! config instead of owner references, so lookups work across namespaces.

use crate::crd::{CatalogSource, CatalogSourceConfig, CatalogSourceSpec};
use crate::error::{OperatorError, Result};
use crate::registry_client::package_fingerprint;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, ExecAction, PodSecurityContext, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, SeccompProfile, SecurityContext, Service,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, BTreeSet};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "marketplace-operator";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const OWNER_NAME_LABEL: &str = "marketplace.operators.coreos.com/csc-owner-name";
pub const OWNER_NAMESPACE_LABEL: &str = "marketplace.operators.coreos.com/csc-owner-namespace";
pub const FINGERPRINT_ANNOTATION: &str = "marketplace.operators.coreos.com/package-fingerprint";

/// gRPC port served by the registry container
pub const REGISTRY_PORT: i32 = 50051;

/// Identity of a CatalogSourceConfig and of the workload it produces
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of the config a workload piece points back to
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Option<Self> {
        let name = labels.get(OWNER_NAME_LABEL)?;
        let namespace = labels.get(OWNER_NAMESPACE_LABEL)?;
        Some(Self::new(namespace.clone(), name.clone()))
    }

    /// Label selector matching every piece of this workload
    pub fn selector(&self) -> String {
        format!(
            "{}={},{}={}",
            OWNER_NAME_LABEL, self.name, OWNER_NAMESPACE_LABEL, self.namespace
        )
    }
}

impl std::fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Everything needed to serve one CatalogSourceConfig
#[derive(Debug, Clone)]
pub struct CatalogWorkload {
    pub key: WorkloadKey,
    pub fingerprint: String,
    pub image: String,
    pub deployment: Deployment,
    pub service: Service,
    /// One per target namespace
    pub catalog_sources: Vec<CatalogSource>,
}

impl CatalogWorkload {
    pub fn catalog_namespaces(&self) -> BTreeSet<String> {
        self.catalog_sources
            .iter()
            .filter_map(|cs| cs.namespace())
            .collect()
    }
}

/// Builder for the workload of one CatalogSourceConfig
pub struct WorkloadBuilder<'a> {
    config: &'a CatalogSourceConfig,
    image: &'a str,
    name: String,
    namespace: String,
}

impl<'a> WorkloadBuilder<'a> {
    /// Create a new workload builder
    pub fn new(config: &'a CatalogSourceConfig, image: &'a str) -> Result<Self> {
        let name = config.metadata.name.clone().ok_or_else(|| {
            OperatorError::InvalidConfig("CatalogSourceConfig name is required".to_string())
        })?;

        let namespace = config
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        Ok(Self {
            config,
            image,
            name,
            namespace,
        })
    }

    pub fn key(&self) -> WorkloadKey {
        WorkloadKey::new(&self.namespace, &self.name)
    }

    /// Fingerprint of the configured package set
    pub fn fingerprint(&self) -> String {
        package_fingerprint(&self.config.spec.packages)
    }

    /// Namespaces that get a CatalogSource (empty = the config's namespace)
    pub fn target_namespaces(&self) -> BTreeSet<String> {
        if self.config.spec.target_namespaces.is_empty() {
            BTreeSet::from([self.namespace.clone()])
        } else {
            self.config.spec.target_namespaces.iter().cloned().collect()
        }
    }

    /// Labels shared by every workload piece
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        labels.insert(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string());
        labels.insert(
            "app.kubernetes.io/name".to_string(),
            "operator-registry".to_string(),
        );
        labels
    }

    fn selector_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(OWNER_NAME_LABEL.to_string(), self.name.clone());
        labels.insert(OWNER_NAMESPACE_LABEL.to_string(), self.namespace.clone());
        labels
    }

    /// Build the complete workload
    pub fn build(&self) -> CatalogWorkload {
        let fingerprint = self.fingerprint();
        CatalogWorkload {
            key: self.key(),
            deployment: self.build_deployment(&fingerprint),
            service: self.build_service(),
            catalog_sources: self
                .target_namespaces()
                .iter()
                .map(|ns| self.build_catalog_source(ns))
                .collect(),
            image: self.image.to_string(),
            fingerprint,
        }
    }

    /// Build the registry Deployment
    pub fn build_deployment(&self, fingerprint: &str) -> Deployment {
        let mut annotations = BTreeMap::new();
        annotations.insert(FINGERPRINT_ANNOTATION.to_string(), fingerprint.to_string());

        let pod_spec = PodSpec {
            containers: vec![self.build_container()],
            security_context: Some(PodSecurityContext {
                run_as_non_root: Some(true),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            // Disable service account token auto-mounting for security
            automount_service_account_token: Some(false),
            ..Default::default()
        };

        Deployment {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.labels()),
                annotations: Some(annotations.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(self.selector_labels()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.labels()),
                        // A new fingerprint here rolls the registry pods
                        annotations: Some(annotations),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the registry-server container
    fn build_container(&self) -> Container {
        let spec = &self.config.spec;
        let grpc_probe = |initial_delay: i32| Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "grpc_health_probe".to_string(),
                    format!("-addr=localhost:{}", REGISTRY_PORT),
                ]),
            }),
            initial_delay_seconds: Some(initial_delay),
            period_seconds: Some(10),
            timeout_seconds: Some(5),
            failure_threshold: Some(3),
            ..Default::default()
        };

        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), Quantity("10m".to_string()));
        requests.insert("memory".to_string(), Quantity("100Mi".to_string()));

        Container {
            name: "registry-server".to_string(),
            image: Some(self.image.to_string()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            command: Some(vec!["appregistry-server".to_string()]),
            args: Some(vec![
                "-r".to_string(),
                format!("{}|{}", spec.endpoint, spec.registry_namespace),
                "-o".to_string(),
                spec.packages.join(","),
            ]),
            ports: Some(vec![ContainerPort {
                name: Some("grpc".to_string()),
                container_port: REGISTRY_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            readiness_probe: Some(grpc_probe(5)),
            liveness_probe: Some(grpc_probe(30)),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            security_context: Some(SecurityContext {
                allow_privilege_escalation: Some(false),
                read_only_root_filesystem: Some(true),
                run_as_non_root: Some(true),
                capabilities: Some(Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the ClusterIP Service in front of the registry
    pub fn build_service(&self) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.labels()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(self.selector_labels()),
                ports: Some(vec![ServicePort {
                    name: Some("grpc".to_string()),
                    port: REGISTRY_PORT,
                    target_port: Some(IntOrString::Int(REGISTRY_PORT)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                type_: Some("ClusterIP".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the CatalogSource for one target namespace
    pub fn build_catalog_source(&self, target_namespace: &str) -> CatalogSource {
        let spec = &self.config.spec;
        let mut catalog_source = CatalogSource::new(
            &self.name,
            CatalogSourceSpec {
                source_type: "grpc".to_string(),
                address: self.service_address(),
                display_name: spec
                    .display_name
                    .clone()
                    .unwrap_or_else(|| self.name.clone()),
                publisher: spec
                    .publisher
                    .clone()
                    .unwrap_or_else(|| "Custom".to_string()),
            },
        );
        catalog_source.metadata.namespace = Some(target_namespace.to_string());
        catalog_source.metadata.labels = Some(self.labels());
        catalog_source
    }

    /// In-cluster gRPC address of the registry service
    pub fn service_address(&self) -> String {
        format!("{}.{}.svc:{}", self.name, self.namespace, REGISTRY_PORT)
    }
}

/// Fingerprint recorded on a live Deployment
pub fn deployment_fingerprint(deployment: &Deployment) -> Option<String> {
    deployment
        .annotations()
        .get(FINGERPRINT_ANNOTATION)
        .cloned()
}

/// Image of the registry container on a live Deployment
pub fn deployment_image(deployment: &Deployment) -> Option<String> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .image
        .clone()
}

/// Verify the operator still owns a resource before force-applying.
///
/// A resource labelled as managed by some other controller (e.g. Helm) is
/// left alone. A resource without the label is adopted.
pub fn verify_ownership<K: Resource>(existing: &K) -> Result<()> {
    let labels = existing.meta().labels.as_ref();
    let managed_by = labels.and_then(|l| l.get(MANAGED_BY_LABEL));
    match managed_by {
        Some(manager) if manager != FIELD_MANAGER => {
            let name = existing.meta().name.as_deref().unwrap_or("<unknown>");
            Err(OperatorError::InvalidConfig(format!(
                "resource '{}' is managed by '{}', not {}; \
                 refusing to force-apply to avoid ownership conflict",
                name, manager, FIELD_MANAGER
            )))
        }
        _ => Ok(()),
    }
}
