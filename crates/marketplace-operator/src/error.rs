//! Error types for the marketplace operator

use crate::registry_client::RegistryError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    ReconcileFailed(String),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Filesystem error while reading defaults
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// External registry fetch failed
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// A migration step failed; startup must abort
    #[error("Migration step '{step}' failed: {message}")]
    MigrationFailed { step: String, message: String },

    /// Writing the cluster status document failed
    #[error("Status write failed: {0}")]
    StatusWriteFailed(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeError(_)
                | OperatorError::Timeout(_)
                | OperatorError::ReconcileFailed(_)
                | OperatorError::Registry(_)
                | OperatorError::StatusWriteFailed(_)
        )
    }
}

/// Run `fut` with a bounded deadline; exceeding it yields [`OperatorError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(OperatorError::Timeout(format!(
            "{} exceeded {}s",
            operation,
            limit.as_secs_f64()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::MigrationFailed {
            step: "strip-legacy-finalizers".to_string(),
            message: "forbidden".to_string(),
        };
        assert!(err.to_string().contains("strip-legacy-finalizers"));
        assert!(err.to_string().contains("forbidden"));
    }

    #[test]
    fn test_retryable_errors() {
        let timeout_err = OperatorError::Timeout("test".to_string());
        assert!(timeout_err.is_retryable());

        let migration_err = OperatorError::MigrationFailed {
            step: "remove-datastore-configs".to_string(),
            message: "boom".to_string(),
        };
        assert!(!migration_err.is_retryable());
    }

    #[test]
    fn test_registry_errors_are_retryable() {
        assert!(OperatorError::Registry(RegistryError::Timeout).is_retryable());
        assert!(!OperatorError::InvalidConfig("test".to_string()).is_retryable());
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: Result<()> = with_timeout(Duration::from_millis(10), "slow call", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(OperatorError::Timeout(msg)) => assert!(msg.contains("slow call")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let result = with_timeout(Duration::from_secs(1), "fast call", async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
