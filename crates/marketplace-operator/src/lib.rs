//! # Marketplace Operator
//!
//! Kubernetes operator that keeps a cluster's catalog of installable
//! operator packages in sync with external app registries.
//!
//! ## Features
//!
//! - **Registry sync**: every `OperatorSource` is re-fetched on a fixed
//!   interval; bursts of edits are debounced into a single extra round
//! - **Catalog materialization**: each `CatalogSourceConfig` is served by a
//!   registry Deployment, a Service and one `CatalogSource` per target
//!   namespace, recreated when deleted out of band
//! - **Startup migration**: ordered, record-gated steps clean up resources
//!   left by earlier releases before anything else runs
//! - **Status reporting**: a `ClusterOperator` document with Available,
//!   Progressing and Degraded conditions
//! - **Observability**: Prometheus metrics and structured logs
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use marketplace_operator::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = kube::Client::try_default().await?;
//!     let store = Arc::new(KubeMigrationStore::new(client.clone()));
//!     let migrator = Migrator::new(store, "4.2.0", Arc::new(SystemClock));
//!     migrator.migrate("openshift-marketplace").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Migrate**: [`migrator`] runs to completion; failure aborts startup
//! 2. **Report**: [`status`] writes the `ClusterOperator` in the background
//! 3. **Sync**: [`syncer`] turns registry manifests into `CatalogSourceConfig`s
//! 4. **Materialize**: [`materializer`] converges workloads onto them
//!
//! Each resource kind has exactly one writer. Components share health over
//! [`health`] watch channels and stop on a single [`shutdown::Shutdown`].
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definition types with validation
//! - [`registry_client`] - HTTP client for app registries
//! - [`schedule`] - Resync and debounce bookkeeping
//! - [`syncer`] - OperatorSource sync loop
//! - [`resources`] - Workload builders (Deployment, Service, CatalogSource)
//! - [`materializer`] - CatalogSourceConfig controller
//! - [`migrator`] - Startup migration steps
//! - [`status`] - ClusterOperator state machine
//! - [`defaults`] - Built-in OperatorSources
//! - [`error`] - Error types for operator operations
//!
//! ## Metrics
//!
//! - `operator_source_failure_count{opsrc_name, opsrc_error}` - Failed source syncs
//! - `marketplace_materializer_reconciliations_total` - Reconciliation attempts
//! - `marketplace_materializer_errors_total` - Reconciliation errors
//! - `marketplace_materializer_duration_seconds` - Reconciliation latency

pub mod clock;
pub mod config;
pub mod crd;
pub mod defaults;
pub mod error;
pub mod health;
pub mod materializer;
pub mod migrator;
pub mod registry_client;
pub mod resources;
pub mod schedule;
pub mod shutdown;
pub mod status;
pub mod syncer;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{MaterializerConfig, OperatorConfig, ReporterConfig, SyncerConfig};
    pub use crate::crd::{
        CatalogSource, CatalogSourceConfig, CatalogSourceConfigSpec, CatalogSourceConfigStatus,
        CatalogSourceSpec, ClusterOperator, ClusterOperatorStatus, MigrationRecord,
        MigrationRecordSpec, OperatorSource, OperatorSourceSpec, OperatorSourceStatus,
        SourcePhase,
    };
    pub use crate::defaults::{ensure_defaults, load_defaults};
    pub use crate::error::{OperatorError, Result};
    pub use crate::health::{health_channels, HealthObserver, HealthSnapshot};
    pub use crate::materializer::{
        run_materializer, CatalogMaterializer, KubeWorkloadStore, MaterializeOutcome,
        WorkloadStore,
    };
    pub use crate::migrator::{KubeMigrationStore, MigrationStore, MigrationSummary, Migrator};
    pub use crate::registry_client::{HttpRegistryClient, RegistryClient, RegistryError};
    pub use crate::resources::{CatalogWorkload, WorkloadBuilder, WorkloadKey};
    pub use crate::schedule::{SyncSchedule, SyncTrigger};
    pub use crate::shutdown::{ReportingDone, Shutdown};
    pub use crate::status::{KubeStatusStore, ReporterState, StatusReporter, StatusStore};
    pub use crate::syncer::{
        notification_channel, watch_sources, KubeSourceStore, RegistrySyncer, SourceStore,
        SyncNotifier,
    };
}
