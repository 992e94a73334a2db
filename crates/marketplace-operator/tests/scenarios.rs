//! End-to-end scenarios for the marketplace operator
//!
//! These tests wire the real components to in-memory stores:
//! - Registry sync feeding catalog materialization
//! - Recovery from out-of-band workload deletion
//! - Degradation after repeated registry failures
//! - Migration failure and re-run behavior
//! - Debouncing of change notifications

mod common;

use common::*;
use marketplace_operator::clock::ManualClock;
use marketplace_operator::config::{MaterializerConfig, ReporterConfig, SyncerConfig};
use marketplace_operator::crd::{CatalogSourceConfig, SourcePhase};
use marketplace_operator::error::OperatorError;
use marketplace_operator::health::health_channels;
use marketplace_operator::materializer::{CatalogMaterializer, MaterializeOutcome};
use marketplace_operator::migrator::{Migrator, DATASTORE_LABEL, LEGACY_FINALIZER};
use marketplace_operator::registry_client::{package_fingerprint, RegistryError};
use marketplace_operator::resources::WorkloadKey;
use marketplace_operator::schedule::{SyncSchedule, SyncTrigger};
use marketplace_operator::shutdown::Shutdown;
use marketplace_operator::status::{
    reason, ReporterState, StatusReporter, CONDITION_AVAILABLE, CONDITION_DEGRADED,
};
use marketplace_operator::syncer::{RegistrySyncer, SOURCE_FAILURE_METRIC};
use metrics_util::debugging::DebuggingRecorder;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const ACME_ENDPOINT: &str = "https://registry.acme.test";

fn materializer(store: Arc<MockWorkloadStore>) -> CatalogMaterializer {
    CatalogMaterializer::new(
        store,
        Arc::new(ManualClock::new(t0())),
        MaterializerConfig::default(),
    )
}

fn acme_key() -> WorkloadKey {
    WorkloadKey::new(NAMESPACE, "acme")
}

#[tokio::test]
async fn test_acme_packages_flow_into_catalog_workload() {
    let registry = Arc::new(MockRegistryClient::default());
    registry.respond(ACME_ENDPOINT, Ok(vec!["p2", "p1"]));
    let sources = Arc::new(MockSourceStore::with_sources(vec![create_test_source(
        "acme",
        ACME_ENDPOINT,
    )]));
    let (sync_health, _materializer_health, _observer) = health_channels();
    let syncer = RegistrySyncer::new(
        registry,
        sources.clone(),
        Arc::new(ManualClock::new(t0())),
        SyncerConfig::default(),
        sync_health,
    );

    let report = syncer.run_round(SyncTrigger::Scheduled).await;
    assert_eq!(report.succeeded, vec!["acme".to_string()]);

    let config = sources.applied_config("acme").unwrap();
    assert_eq!(config.spec.packages, vec!["p1", "p2"]);
    assert_eq!(sources.status_of("acme").unwrap().phase, SourcePhase::Succeeded);

    let workloads = Arc::new(MockWorkloadStore::default());
    let materializer = materializer(workloads.clone());

    let outcome = materializer.materialize(&config).await.unwrap();
    assert_eq!(outcome, MaterializeOutcome::Created);
    assert_eq!(
        workloads.fingerprint_of(&acme_key()),
        Some(package_fingerprint(&["p1".to_string(), "p2".to_string()]))
    );

    // Re-materializing an unchanged spec issues no writes
    let mutations = workloads.mutation_count();
    let outcome = materializer.materialize(&config).await.unwrap();
    assert_eq!(outcome, MaterializeOutcome::Unchanged);
    assert_eq!(workloads.mutation_count(), mutations);
}

#[tokio::test]
async fn test_last_sync_time_increases_across_rounds() {
    let registry = Arc::new(MockRegistryClient::default());
    registry.respond(ACME_ENDPOINT, Ok(vec!["p1"]));
    let sources = Arc::new(MockSourceStore::with_sources(vec![create_test_source(
        "acme",
        ACME_ENDPOINT,
    )]));
    let clock = ManualClock::new(t0());
    let (sync_health, _materializer_health, _observer) = health_channels();
    let syncer = RegistrySyncer::new(
        registry,
        sources.clone(),
        Arc::new(clock.clone()),
        SyncerConfig::default(),
        sync_health,
    );

    let mut previous = None;
    for _ in 0..3 {
        syncer.run_round(SyncTrigger::Scheduled).await;
        let synced = sources.status_of("acme").unwrap().last_sync_time.unwrap();
        let synced = chrono::DateTime::parse_from_rfc3339(&synced).unwrap();
        if let Some(previous) = previous {
            assert!(synced > previous);
        }
        previous = Some(synced);
        clock.advance(Duration::from_secs(3600));
    }
}

#[tokio::test]
async fn test_externally_deleted_workload_is_recreated() {
    let workloads = Arc::new(MockWorkloadStore::default());
    let materializer = materializer(workloads.clone());
    let config = create_test_config("acme", &["p1", "p2"]);

    materializer.materialize(&config).await.unwrap();
    let original = workloads.fingerprint_of(&acme_key()).unwrap();

    workloads.delete_externally(&acme_key());

    let outcome = materializer.materialize(&config).await.unwrap();
    assert_eq!(outcome, MaterializeOutcome::Created);
    assert_eq!(workloads.fingerprint_of(&acme_key()), Some(original));
}

#[tokio::test]
async fn test_unreachable_registry_degrades_operator() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let _guard = metrics::set_default_local_recorder(&recorder);

    let registry = Arc::new(MockRegistryClient::default());
    registry.respond(
        ACME_ENDPOINT,
        Err(RegistryError::Unreachable("connection refused".to_string())),
    );
    let sources = Arc::new(MockSourceStore::with_sources(vec![create_test_source(
        "acme",
        ACME_ENDPOINT,
    )]));
    let (sync_health, _materializer_health, observer) = health_channels();
    let health = sync_health.subscribe();
    let syncer = RegistrySyncer::new(
        registry,
        sources.clone(),
        Arc::new(ManualClock::new(t0())),
        SyncerConfig::default(),
        sync_health,
    );

    for _ in 0..3 {
        let report = syncer.run_round(SyncTrigger::Scheduled).await;
        assert_eq!(
            report.failed,
            vec![("acme".to_string(), "registry_unavailable".to_string())]
        );
    }
    assert_eq!(health.borrow().sources["acme"].total_failures, 3);
    assert_eq!(health.borrow().sources["acme"].consecutive_failures, 3);
    assert!(sources.applied.lock().is_empty());
    assert_eq!(
        counter_value(
            &snapshotter,
            SOURCE_FAILURE_METRIC,
            &[("opsrc_name", "acme"), ("opsrc_error", "registry_unavailable")]
        ),
        3
    );

    let status_store = Arc::new(MockStatusStore::default());
    let mut reporter = StatusReporter::new(
        status_store.clone(),
        Arc::new(ManualClock::new(t0())),
        ReporterConfig {
            report_interval: Duration::from_millis(10),
            ..ReporterConfig::default()
        },
        "4.2.0",
    );
    let history = reporter.history();
    reporter.report_migration().await;

    let shutdown = Shutdown::new();
    let done = reporter.start_reporting(observer, shutdown.clone());

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let degraded = status_store
                .latest()
                .and_then(|s| condition(&s, CONDITION_DEGRADED))
                .is_some_and(|(status, _)| status == "True");
            if degraded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("operator never reported Degraded");

    let status = status_store.latest().unwrap();
    assert_eq!(
        condition(&status, CONDITION_DEGRADED),
        Some(("True".to_string(), reason::SYNC_FAILED.to_string()))
    );
    assert_eq!(
        condition(&status, CONDITION_AVAILABLE).map(|(s, _)| s),
        Some("True".to_string())
    );
    assert_eq!(history.current(), ReporterState::Degraded);

    shutdown.trigger();
    done.wait().await;

    assert_eq!(history.current(), ReporterState::Stopped);
    let last = status_store.latest().unwrap();
    assert_eq!(
        condition(&last, CONDITION_DEGRADED).map(|(s, _)| s),
        Some("False".to_string())
    );
}

fn datastore_config(name: &str) -> CatalogSourceConfig {
    let mut config = create_test_config(name, &["p1"]);
    config.metadata.labels = Some(BTreeMap::from([(
        DATASTORE_LABEL.to_string(),
        "true".to_string(),
    )]));
    config
}

fn finalized_config(name: &str) -> CatalogSourceConfig {
    let mut config = create_test_config(name, &["p1"]);
    config.metadata.finalizers = Some(vec![LEGACY_FINALIZER.to_string()]);
    config
}

#[tokio::test]
async fn test_failed_migration_step_blocks_startup() {
    let store = Arc::new(MockMigrationStore::default());
    *store.configs.lock() = vec![finalized_config("acme"), datastore_config("acme-datastore")];
    *store.fail_deletes.lock() = true;

    let clock = Arc::new(ManualClock::new(t0()));
    let status_store = Arc::new(MockStatusStore::default());
    let mut reporter = StatusReporter::new(
        status_store.clone(),
        clock.clone(),
        ReporterConfig::default(),
        "4.2.0",
    );
    let history = reporter.history();

    reporter.report_migration().await;
    let migrator = Migrator::new(store.clone(), "4.2.0", clock);
    let err = migrator.migrate(NAMESPACE).await.unwrap_err();

    match &err {
        OperatorError::MigrationFailed { step, .. } => {
            assert_eq!(step, "remove-datastore-configs")
        }
        other => panic!("unexpected error: {other}"),
    }
    {
        let records = store.records.lock();
        assert!(records.contains_key("strip-legacy-finalizers"));
        assert!(!records.contains_key("remove-datastore-configs"));
        assert!(!records.contains_key("backfill-source-endpoints"));
    }

    reporter.report_failure(&err).await;

    assert!(!history.has_visited(ReporterState::Reconciling));
    assert_eq!(history.current(), ReporterState::Stopped);
    let status = status_store.latest().unwrap();
    assert_eq!(
        condition(&status, CONDITION_DEGRADED),
        Some(("True".to_string(), reason::MIGRATION_FAILED.to_string()))
    );
}

#[tokio::test]
async fn test_second_migration_makes_no_changes() {
    let store = Arc::new(MockMigrationStore::default());
    *store.configs.lock() = vec![finalized_config("acme"), datastore_config("acme-datastore")];

    let migrator = Migrator::new(store.clone(), "4.2.0", Arc::new(ManualClock::new(t0())));

    let first = migrator.migrate(NAMESPACE).await.unwrap();
    assert_eq!(first.applied.len(), 3);
    let mutations = store.mutation_count();

    let second = migrator.migrate(NAMESPACE).await.unwrap();
    assert!(second.applied.is_empty());
    assert_eq!(second.skipped, first.applied);
    assert_eq!(store.mutation_count(), mutations);
}

#[test]
fn test_notifications_within_window_add_one_round() {
    let start = t0();
    let mut schedule = SyncSchedule::new(
        start,
        Duration::from_secs(60),
        Duration::from_secs(3600),
        Duration::from_secs(600),
    );
    let notify_at = [100, 160, 220, 280, 340];

    let mut scheduled = 0;
    let mut notified = 0;
    for second in (0..=7200).step_by(10) {
        let now = start + chrono::Duration::seconds(second);
        if notify_at.contains(&second) {
            schedule.notify(now);
        }
        match schedule.poll(now) {
            Some(SyncTrigger::Scheduled) => scheduled += 1,
            Some(SyncTrigger::Notified) => notified += 1,
            None => {}
        }
    }

    // Regular rounds at 60s and 3660s, plus one debounced round
    assert_eq!(scheduled, 2);
    assert_eq!(notified, 1);
}
