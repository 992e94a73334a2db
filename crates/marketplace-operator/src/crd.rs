//! Custom Resource Definitions for the marketplace operator
//!
//! `OperatorSource` and `CatalogSourceConfig` are owned by this operator.
//! `MigrationRecord` is its startup bookkeeping. `ClusterOperator` and
//! `CatalogSource` belong to the surrounding platform; only the fields the
//! operator reads or writes are modelled.

use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group of the operator's own resources
pub const MARKETPLACE_GROUP: &str = "marketplace.operators.coreos.com";

/// Regex for validating Kubernetes names (RFC 1123 label)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Regex for package names as published by app registries
static PACKAGE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9._]*[A-Za-z0-9])?$").unwrap());

/// Validate a Kubernetes name (RFC 1123 label)
fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

fn validate_namespaces(values: &[String]) -> Result<(), ValidationError> {
    for value in values {
        validate_k8s_name(value)?;
    }
    Ok(())
}

/// Validate a registry endpoint URL
fn validate_endpoint(value: &str) -> Result<(), ValidationError> {
    let rest = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"));
    match rest {
        Some(host) if !host.is_empty() && !host.chars().any(char::is_whitespace) => Ok(()),
        _ => Err(ValidationError::new("invalid_endpoint").with_message(
            format!("'{}' is not an http(s) registry endpoint", value).into(),
        )),
    }
}

/// Most packages one CatalogSourceConfig may serve
pub const MAX_PACKAGES: usize = 1000;

/// Whether `value` is a package name a registry workload can serve
pub fn is_valid_package_name(value: &str) -> bool {
    value.len() <= 253 && PACKAGE_REGEX.is_match(value)
}

fn validate_packages(values: &[String]) -> Result<(), ValidationError> {
    for value in values {
        if !is_valid_package_name(value) {
            return Err(ValidationError::new("invalid_package")
                .with_message(format!("'{}' is not a valid package name", value).into()));
        }
    }
    Ok(())
}

// ============================================================================
// OperatorSource - an external registry to mirror
// ============================================================================

/// OperatorSource custom resource
///
/// Points the operator at an external app registry. The registry syncer
/// fetches its package list on a fixed schedule and derives a
/// `CatalogSourceConfig` from it.
///
/// ```yaml
/// apiVersion: marketplace.operators.coreos.com/v1
/// kind: OperatorSource
/// metadata:
///   name: acme
///   namespace: openshift-marketplace
/// spec:
///   type: appregistry
///   endpoint: https://registry.acme.test/cnr
///   registryNamespace: acme-operators
///   displayName: Acme Operators
///   publisher: Acme
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "marketplace.operators.coreos.com",
    version = "v1",
    kind = "OperatorSource",
    plural = "operatorsources",
    shortname = "opsrc",
    namespaced,
    status = "OperatorSourceStatus",
    printcolumn = r#"{"name":"Endpoint", "type":"string", "jsonPath":".spec.endpoint"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Last Sync", "type":"string", "jsonPath":".status.lastSyncTime"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSourceSpec {
    /// Registry protocol; only `appregistry` is served
    #[serde(rename = "type", default = "default_source_type")]
    pub source_type: String,

    /// Base URL of the registry
    #[validate(custom(function = "validate_endpoint"))]
    pub endpoint: String,

    /// Namespace inside the registry that holds the packages
    #[validate(length(min = 1, max = 253, message = "registryNamespace must be 1-253 characters"))]
    pub registry_namespace: String,

    /// Human-readable name shown by the package manager
    #[serde(default)]
    pub display_name: Option<String>,

    /// Publisher shown by the package manager
    #[serde(default)]
    pub publisher: Option<String>,

    /// Namespaces where the catalog must be visible (empty = the source's namespace)
    #[serde(default)]
    #[validate(custom(function = "validate_namespaces"))]
    pub target_namespaces: Vec<String>,
}

/// Status of an OperatorSource, written only by the registry syncer
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSourceStatus {
    /// Initial, Succeeded or Failed
    #[serde(default)]
    pub phase: SourcePhase,

    /// Human-readable message about the last sync
    #[serde(default)]
    pub message: String,

    /// Time of the last successful sync (RFC 3339)
    #[serde(default)]
    pub last_sync_time: Option<String>,

    /// Fingerprint of the last fetched package list
    #[serde(default)]
    pub packages_hash: Option<String>,

    /// Packages found at the last successful sync
    #[serde(default)]
    pub packages: Vec<String>,

    /// Generation observed by the last sync
    #[serde(default)]
    pub observed_generation: i64,
}

/// Sync phase of an OperatorSource
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SourcePhase {
    /// Never synced
    #[default]
    Initial,
    /// Last sync succeeded
    Succeeded,
    /// Last sync failed; the previous catalog is kept
    Failed,
}

impl OperatorSourceSpec {
    /// Target namespaces, falling back to the namespace the source lives in
    pub fn effective_target_namespaces(&self, own_namespace: &str) -> Vec<String> {
        if self.target_namespaces.is_empty() {
            vec![own_namespace.to_string()]
        } else {
            let mut namespaces = self.target_namespaces.clone();
            namespaces.sort();
            namespaces.dedup();
            namespaces
        }
    }
}

fn default_source_type() -> String {
    "appregistry".to_string()
}

// ============================================================================
// CatalogSourceConfig - desired materialized package set
// ============================================================================

/// CatalogSourceConfig custom resource
///
/// The desired set of packages from one registry and the namespaces that
/// must see them. The materializer converges a registry workload onto it.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "marketplace.operators.coreos.com",
    version = "v1",
    kind = "CatalogSourceConfig",
    plural = "catalogsourceconfigs",
    shortname = "csc",
    namespaced,
    status = "CatalogSourceConfigStatus",
    printcolumn = r#"{"name":"Source", "type":"string", "jsonPath":".spec.source"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSourceConfigSpec {
    /// Name of the OperatorSource this config was derived from
    #[serde(default)]
    pub source: String,

    /// Registry endpoint the workload pulls from
    #[serde(default)]
    pub endpoint: String,

    /// Registry namespace the workload pulls from
    #[serde(default)]
    pub registry_namespace: String,

    /// Packages to serve; may be empty
    #[serde(default)]
    #[validate(length(max = 1000, message = "maximum 1000 packages allowed"))]
    #[validate(custom(function = "validate_packages"))]
    pub packages: Vec<String>,

    /// Namespaces where a CatalogSource must be present
    #[serde(default)]
    #[validate(custom(function = "validate_namespaces"))]
    pub target_namespaces: Vec<String>,

    /// Display name forwarded to the CatalogSource
    #[serde(default)]
    pub display_name: Option<String>,

    /// Publisher forwarded to the CatalogSource
    #[serde(default)]
    pub publisher: Option<String>,
}

/// Status of a CatalogSourceConfig, written only by the materializer
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSourceConfigStatus {
    /// Pending, Succeeded or Failed
    #[serde(default)]
    pub phase: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Package-set fingerprint of the running workload
    #[serde(default)]
    pub fingerprint: Option<String>,

    /// Last time the workload was converged (RFC 3339)
    #[serde(default)]
    pub last_materialized: Option<String>,
}

// ============================================================================
// MigrationRecord - proof that a migration step completed
// ============================================================================

/// MigrationRecord custom resource
///
/// One object per completed migration step and namespace, named after the
/// step. Written once and never deleted.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "marketplace.operators.coreos.com",
    version = "v1",
    kind = "MigrationRecord",
    plural = "migrationrecords",
    shortname = "migrec",
    namespaced,
    printcolumn = r#"{"name":"Step", "type":"string", "jsonPath":".spec.step"}"#,
    printcolumn = r#"{"name":"Release", "type":"string", "jsonPath":".spec.releaseVersion"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecordSpec {
    /// Step identifier
    pub step: String,

    /// Operator release that performed the step
    pub release_version: String,

    /// Completion time (RFC 3339)
    pub completed_at: String,
}

// ============================================================================
// ClusterOperator - cluster-wide status document
// ============================================================================

/// ClusterOperator resource of the hosting platform (cluster-scoped)
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "ClusterOperator",
    plural = "clusteroperators",
    status = "ClusterOperatorStatus"
)]
pub struct ClusterOperatorSpec {}

/// Status section of a ClusterOperator
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterOperatorStatus {
    /// Available, Progressing and Degraded, in that order
    #[serde(default)]
    pub conditions: Vec<ClusterOperatorCondition>,

    /// Reported versions
    #[serde(default)]
    pub versions: Vec<OperandVersion>,
}

/// One named status condition
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterOperatorCondition {
    /// Available, Progressing or Degraded
    #[serde(rename = "type")]
    pub condition_type: String,

    /// "True" or "False"
    pub status: String,

    /// Machine-readable reason
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time `status` flipped (RFC 3339)
    pub last_transition_time: String,
}

/// A named version entry
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct OperandVersion {
    pub name: String,
    pub version: String,
}

// ============================================================================
// CatalogSource - catalog reference consumed by the package manager
// ============================================================================

/// CatalogSource of the package manager
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operators.coreos.com",
    version = "v1alpha1",
    kind = "CatalogSource",
    plural = "catalogsources",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSourceSpec {
    /// Always `grpc` for registry-backed catalogs
    pub source_type: String,

    /// host:port of the registry service
    pub address: String,

    #[serde(default)]
    pub display_name: String,

    #[serde(default)]
    pub publisher: String,
}
