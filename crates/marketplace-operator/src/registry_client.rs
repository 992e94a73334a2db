//! External registry client
//!
//! Fetches the package list an app registry publishes for one registry
//! namespace. Failures are classified so the syncer can tell "cannot reach
//! the registry" apart from "reached it, but the answer is garbage".

use crate::crd::{is_valid_package_name, MAX_PACKAGES};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default request timeout for registry calls
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connect timeout for registry calls
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors returned by a registry fetch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Network-level failure reaching the endpoint
    #[error("registry unreachable: {0}")]
    Unreachable(String),

    /// DNS could not resolve the endpoint host
    #[error("registry host not found: {0}")]
    HostNotFound(String),

    /// The fetch did not finish in time
    #[error("registry request timed out")]
    Timeout,

    /// The registry answered with a non-success status
    #[error("registry returned HTTP {code}")]
    Status { code: u16 },

    /// The registry answered, but the manifest could not be parsed
    #[error("malformed registry manifest: {0}")]
    Malformed(String),
}

impl RegistryError {
    /// True when the endpoint could not be reached or did not serve the packages
    pub fn is_unreachable(&self) -> bool {
        !matches!(self, RegistryError::Malformed(_))
    }

    /// Label used for the failure metric and status messages
    pub fn reason(&self) -> &'static str {
        match self {
            RegistryError::Unreachable(_) | RegistryError::Status { .. } => "registry_unavailable",
            RegistryError::HostNotFound(_) => "no_host_exists",
            RegistryError::Timeout => "registry_timeout",
            RegistryError::Malformed(_) => "malformed_manifest",
        }
    }
}

/// The package list of one registry namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageManifest {
    /// Sorted, de-duplicated package names
    pub packages: Vec<String>,
}

impl PackageManifest {
    pub fn new(packages: impl IntoIterator<Item = String>) -> Self {
        let mut packages: Vec<String> = packages.into_iter().collect();
        packages.sort();
        packages.dedup();
        Self { packages }
    }

    /// Stable fingerprint of the package set
    pub fn fingerprint(&self) -> String {
        package_fingerprint(&self.packages)
    }
}

/// SHA-256 over the sorted, de-duplicated package names
pub fn package_fingerprint(packages: &[String]) -> String {
    let mut sorted: Vec<&str> = packages.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = Sha256::new();
    for package in sorted {
        hasher.update(package.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// One entry of the registry's package listing
#[derive(Debug, Deserialize)]
struct RegistryPackage {
    /// `<registry-namespace>/<package>`
    name: String,
}

/// Parse a package listing body
pub fn parse_manifest(body: &[u8]) -> Result<PackageManifest, RegistryError> {
    let entries: Vec<RegistryPackage> =
        serde_json::from_slice(body).map_err(|e| RegistryError::Malformed(e.to_string()))?;

    let mut packages = Vec::with_capacity(entries.len());
    for entry in entries {
        let name = match entry.name.rsplit_once('/') {
            Some((_, package)) => package,
            None => entry.name.as_str(),
        };
        if name.is_empty() {
            return Err(RegistryError::Malformed(format!(
                "empty package name in entry '{}'",
                entry.name
            )));
        }
        if !is_valid_package_name(name) {
            return Err(RegistryError::Malformed(format!(
                "invalid package name '{}'",
                name
            )));
        }
        packages.push(name.to_string());
    }

    let manifest = PackageManifest::new(packages);
    if manifest.packages.len() > MAX_PACKAGES {
        return Err(RegistryError::Malformed(format!(
            "{} packages listed, at most {} can be served",
            manifest.packages.len(),
            MAX_PACKAGES
        )));
    }
    Ok(manifest)
}

/// Fetches package manifests from an external registry
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn fetch_packages(
        &self,
        endpoint: &str,
        registry_namespace: &str,
    ) -> Result<PackageManifest, RegistryError>;
}

/// Configuration for the HTTP registry client
#[derive(Debug, Clone)]
pub struct RegistryClientConfig {
    /// Whole-request timeout
    pub request_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl Default for RegistryClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// App-registry client over HTTP
pub struct HttpRegistryClient {
    client: reqwest::Client,
}

impl HttpRegistryClient {
    /// Create a new client with default configuration
    pub fn new() -> Result<Self, RegistryError> {
        Self::with_config(RegistryClientConfig::default())
    }

    /// Create a new client with custom configuration
    pub fn with_config(config: RegistryClientConfig) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(concat!("marketplace-operator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RegistryError::Unreachable(e.to_string()))?;
        Ok(Self { client })
    }
}

/// URL of the package listing for a registry namespace
pub fn packages_url(endpoint: &str, registry_namespace: &str) -> String {
    format!(
        "{}/api/v1/packages?namespace={}",
        endpoint.trim_end_matches('/'),
        registry_namespace
    )
}

fn classify(err: reqwest::Error) -> RegistryError {
    if err.is_timeout() {
        return RegistryError::Timeout;
    }
    if let Some(status) = err.status() {
        return RegistryError::Status {
            code: status.as_u16(),
        };
    }
    if err.is_decode() || err.is_body() {
        return RegistryError::Malformed(err.to_string());
    }

    // DNS failures surface only in the error's source chain
    let mut detail = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(inner) = source {
        detail.push_str(": ");
        detail.push_str(&inner.to_string());
        source = inner.source();
    }
    let lowered = detail.to_lowercase();
    if lowered.contains("dns error")
        || lowered.contains("no such host")
        || lowered.contains("failed to lookup address")
        || lowered.contains("name or service not known")
    {
        RegistryError::HostNotFound(detail)
    } else {
        RegistryError::Unreachable(detail)
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn fetch_packages(
        &self,
        endpoint: &str,
        registry_namespace: &str,
    ) -> Result<PackageManifest, RegistryError> {
        let url = packages_url(endpoint, registry_namespace);
        debug!(url = %url, "Fetching registry package list");

        let response = self.client.get(&url).send().await.map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Status {
                code: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(classify)?;
        let manifest = parse_manifest(&body)?;

        debug!(
            url = %url,
            packages = manifest.packages.len(),
            "Fetched registry package list"
        );
        Ok(manifest)
    }
}
