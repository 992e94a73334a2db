//! Runtime configuration
//!
//! Each component takes its own config struct. `main` builds them from
//! command-line arguments; tests use the defaults or shrink the timings.

use std::time::Duration;

/// Image used for registry-serving workloads when none is configured
pub const DEFAULT_REGISTRY_SERVER_IMAGE: &str = "quay.io/openshift/origin-operator-registry:latest";

/// Namespace the operator runs in when none is configured
pub const DEFAULT_NAMESPACE: &str = "openshift-marketplace";

/// Settings for the registry syncer
#[derive(Debug, Clone)]
pub struct SyncerConfig {
    /// Grace period before the first round
    pub initial_wait: Duration,
    /// Fixed interval between regular rounds
    pub resync_interval: Duration,
    /// Minimum spacing between notification-triggered rounds
    pub debounce_window: Duration,
    /// Deadline for one registry fetch
    pub fetch_timeout: Duration,
    /// Deadline for one cluster API call
    pub api_timeout: Duration,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_secs(60),
            resync_interval: Duration::from_secs(60 * 60),
            debounce_window: Duration::from_secs(10 * 60),
            fetch_timeout: Duration::from_secs(30),
            api_timeout: Duration::from_secs(15),
        }
    }
}

/// Settings for the catalog materializer
#[derive(Debug, Clone)]
pub struct MaterializerConfig {
    /// Image of the registry-serving container
    pub registry_server_image: String,
    /// Requeue after a successful reconcile
    pub resync_interval: Duration,
    /// Requeue after a failed reconcile
    pub error_requeue: Duration,
    /// Deadline for one cluster API call
    pub api_timeout: Duration,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            registry_server_image: DEFAULT_REGISTRY_SERVER_IMAGE.to_string(),
            resync_interval: Duration::from_secs(5 * 60),
            error_requeue: Duration::from_secs(30),
            api_timeout: Duration::from_secs(15),
        }
    }
}

/// Settings for the status reporter
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Name of the ClusterOperator document
    pub operator_name: String,
    /// Interval between status recomputations
    pub report_interval: Duration,
    /// Consecutive failures after which retries count as exhausted
    pub failure_threshold: u32,
    /// Deadline for one status write
    pub api_timeout: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            operator_name: "marketplace".to_string(),
            report_interval: Duration::from_secs(20),
            failure_threshold: 3,
            api_timeout: Duration::from_secs(15),
        }
    }
}

/// Complete operator configuration
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace the operator watches and migrates
    pub namespace: String,
    /// Release version stamped into status and migration records
    pub release_version: String,
    /// Directory with default OperatorSource manifests
    pub defaults_dir: Option<std::path::PathBuf>,
    pub syncer: SyncerConfig,
    pub materializer: MaterializerConfig,
    pub reporter: ReporterConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            release_version: "0.0.1-snapshot".to_string(),
            defaults_dir: None,
            syncer: SyncerConfig::default(),
            materializer: MaterializerConfig::default(),
            reporter: ReporterConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_syncer_timings() {
        let config = SyncerConfig::default();
        assert_eq!(config.initial_wait, Duration::from_secs(60));
        assert_eq!(config.resync_interval, Duration::from_secs(3600));
        assert_eq!(config.debounce_window, Duration::from_secs(600));
    }

    #[test]
    fn test_default_reporter() {
        let config = ReporterConfig::default();
        assert_eq!(config.operator_name, "marketplace");
        assert_eq!(config.failure_threshold, 3);
    }

    #[test]
    fn test_default_operator_config() {
        let config = OperatorConfig::default();
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
        assert_eq!(
            config.materializer.registry_server_image,
            DEFAULT_REGISTRY_SERVER_IMAGE
        );
        assert!(config.defaults_dir.is_none());
    }
}
