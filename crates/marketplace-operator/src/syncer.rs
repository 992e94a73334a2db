//! Registry syncer
//!
//! Re-fetches every OperatorSource's package list on a fixed schedule and
//! hands the result to the materializer as a CatalogSourceConfig. Change
//! notifications from the OperatorSource watch are debounced into extra
//! rounds by [`SyncSchedule`].

use crate::clock::Clock;
use crate::config::SyncerConfig;
use crate::crd::{
    CatalogSourceConfig, CatalogSourceConfigSpec, OperatorSource, OperatorSourceStatus,
    SourcePhase,
};
use crate::error::{with_timeout, OperatorError, Result};
use crate::health::SyncHealth;
use crate::registry_client::{PackageManifest, RegistryClient};
use crate::resources::{verify_ownership, FIELD_MANAGER, MANAGED_BY_LABEL};
use crate::schedule::{SyncSchedule, SyncTrigger};
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};
use validator::Validate;

/// Metric incremented once per failed source sync
pub const SOURCE_FAILURE_METRIC: &str = "operator_source_failure_count";

/// Cluster access needed by the syncer
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// All OperatorSources in the watched namespace
    async fn list_sources(&self) -> Result<Vec<OperatorSource>>;

    /// Replace the status of one OperatorSource
    async fn update_source_status(
        &self,
        source: &OperatorSource,
        status: &OperatorSourceStatus,
    ) -> Result<()>;

    /// Create or update the CatalogSourceConfig derived from a source
    async fn apply_catalog_config(&self, config: &CatalogSourceConfig) -> Result<()>;
}

/// [`SourceStore`] backed by the Kubernetes API
pub struct KubeSourceStore {
    client: Client,
    namespace: String,
}

impl KubeSourceStore {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl SourceStore for KubeSourceStore {
    async fn list_sources(&self) -> Result<Vec<OperatorSource>> {
        let api: Api<OperatorSource> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn update_source_status(
        &self,
        source: &OperatorSource,
        status: &OperatorSourceStatus,
    ) -> Result<()> {
        let namespace = source
            .namespace()
            .unwrap_or_else(|| self.namespace.clone());
        let api: Api<OperatorSource> = Api::namespaced(self.client.clone(), &namespace);
        let name = source.name_any();

        debug!(name = %name, phase = ?status.phase, "Updating OperatorSource status");

        let patch = serde_json::json!({
            "status": status
        });
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn apply_catalog_config(&self, config: &CatalogSourceConfig) -> Result<()> {
        let namespace = config
            .namespace()
            .unwrap_or_else(|| self.namespace.clone());
        let api: Api<CatalogSourceConfig> = Api::namespaced(self.client.clone(), &namespace);
        let name = config.name_any();

        debug!(name = %name, packages = config.spec.packages.len(), "Applying CatalogSourceConfig");

        if let Some(existing) = api.get_opt(&name).await? {
            verify_ownership(&existing)?;
        }

        let patch_params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&name, &patch_params, &Patch::Apply(config))
            .await?;
        Ok(())
    }
}

/// Build the CatalogSourceConfig that mirrors `source` with the fetched packages
pub fn catalog_config_for(source: &OperatorSource, manifest: &PackageManifest) -> CatalogSourceConfig {
    let name = source.name_any();
    let namespace = source.namespace().unwrap_or_else(|| "default".to_string());
    let spec = &source.spec;

    let mut config = CatalogSourceConfig::new(
        &name,
        CatalogSourceConfigSpec {
            source: name.clone(),
            endpoint: spec.endpoint.clone(),
            registry_namespace: spec.registry_namespace.clone(),
            packages: manifest.packages.clone(),
            target_namespaces: spec.effective_target_namespaces(&namespace),
            display_name: spec.display_name.clone(),
            publisher: spec.publisher.clone(),
        },
    );
    config.metadata.namespace = Some(namespace);
    config.metadata.labels = Some(BTreeMap::from([(
        MANAGED_BY_LABEL.to_string(),
        FIELD_MANAGER.to_string(),
    )]));
    if let Some(owner) = source.controller_owner_ref(&()) {
        config.metadata.owner_references = Some(vec![owner]);
    }
    config
}

/// Sender half of the change-notification channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SyncNotifier {
    tx: mpsc::Sender<()>,
}

impl SyncNotifier {
    /// Request a debounced extra round. Never blocks; a full queue already
    /// holds a pending request.
    pub fn notify(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Create the notification channel feeding [`RegistrySyncer::sync`]
pub fn notification_channel() -> (SyncNotifier, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(16);
    (SyncNotifier { tx }, rx)
}

/// Result of one sync round
#[derive(Debug, Clone, PartialEq)]
pub struct RoundReport {
    pub trigger: SyncTrigger,
    /// Sources that synced successfully
    pub succeeded: Vec<String>,
    /// Failed sources with their reason label
    pub failed: Vec<(String, String)>,
}

/// Why a single source failed to sync
#[derive(Debug, Clone)]
struct SourceFailure {
    reason: &'static str,
    message: String,
}

/// Periodically mirrors external registries into CatalogSourceConfigs
pub struct RegistrySyncer {
    registry: Arc<dyn RegistryClient>,
    store: Arc<dyn SourceStore>,
    clock: Arc<dyn Clock>,
    config: SyncerConfig,
    health: watch::Sender<SyncHealth>,
}

impl RegistrySyncer {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        store: Arc<dyn SourceStore>,
        clock: Arc<dyn Clock>,
        config: SyncerConfig,
        health: watch::Sender<SyncHealth>,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
            config,
            health,
        }
    }

    /// Run rounds until `shutdown` fires. Never returns early on errors.
    pub async fn sync(&self, shutdown: Shutdown, mut notifications: mpsc::Receiver<()>) {
        let mut schedule = SyncSchedule::new(
            self.clock.now(),
            self.config.initial_wait,
            self.config.resync_interval,
            self.config.debounce_window,
        );
        let mut notifications_open = true;

        info!(
            initial_wait_secs = self.config.initial_wait.as_secs(),
            resync_interval_secs = self.config.resync_interval.as_secs(),
            debounce_window_secs = self.config.debounce_window.as_secs(),
            "Starting registry syncer"
        );

        loop {
            let wait = (schedule.next_deadline() - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);

            // Handlers are not raced against shutdown; a round always completes
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = notifications.recv(), if notifications_open => match received {
                    Some(()) => {
                        debug!("Source change notification received");
                        schedule.notify(self.clock.now());
                    }
                    None => notifications_open = false,
                },
                _ = tokio::time::sleep(wait) => {
                    if let Some(trigger) = schedule.poll(self.clock.now()) {
                        let report = self.run_round(trigger).await;
                        info!(
                            trigger = %report.trigger,
                            succeeded = report.succeeded.len(),
                            failed = report.failed.len(),
                            "Sync round complete"
                        );
                    }
                }
            }
        }

        info!("Registry syncer stopped");
    }

    /// Sync every known source once
    #[instrument(skip(self))]
    pub async fn run_round(&self, trigger: SyncTrigger) -> RoundReport {
        self.health.send_modify(|h| h.round_in_flight = true);

        let mut report = RoundReport {
            trigger,
            succeeded: Vec::new(),
            failed: Vec::new(),
        };

        let sources = match with_timeout(
            self.config.api_timeout,
            "list OperatorSources",
            self.store.list_sources(),
        )
        .await
        {
            Ok(sources) => sources,
            Err(e) => {
                warn!(error = %e, "Failed to list OperatorSources, retrying next round");
                self.health.send_modify(|h| h.round_in_flight = false);
                return report;
            }
        };

        // At most once per source per round
        let mut seen = HashSet::new();
        let sources: Vec<OperatorSource> = sources
            .into_iter()
            .filter(|s| seen.insert(s.name_any()))
            .collect();

        let outcomes =
            futures::future::join_all(sources.iter().map(|source| self.sync_source(source)))
                .await;

        let now = self.clock.now();
        let names: Vec<String> = sources.iter().map(|s| s.name_any()).collect();

        self.health.send_modify(|health| {
            for (name, outcome) in names.iter().zip(&outcomes) {
                match outcome {
                    Ok(()) => health.record_success(name, now),
                    Err(failure) => health.record_failure(name, failure.reason),
                }
            }
            health.retain_sources(&names);
            health.rounds_completed += 1;
            if outcomes.iter().all(|o| o.is_ok()) {
                health.last_clean_round = Some(now);
            }
            health.round_in_flight = false;
        });

        for (name, outcome) in names.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.succeeded.push(name),
                Err(failure) => report.failed.push((name, failure.reason.to_string())),
            }
        }
        report
    }

    #[instrument(skip(self, source), fields(name = %source.name_any(), namespace = source.namespace()))]
    async fn sync_source(&self, source: &OperatorSource) -> std::result::Result<(), SourceFailure> {
        let result = self.fetch_and_apply(source).await;

        let status = match &result {
            Ok(manifest) => {
                info!(packages = manifest.packages.len(), "Registry sync succeeded");
                OperatorSourceStatus {
                    phase: SourcePhase::Succeeded,
                    message: format!("{} packages synced", manifest.packages.len()),
                    last_sync_time: Some(format_sync_time(self.next_sync_time(source))),
                    packages_hash: Some(manifest.fingerprint()),
                    packages: manifest.packages.clone(),
                    observed_generation: source.metadata.generation.unwrap_or(0),
                }
            }
            Err(failure) => {
                warn!(reason = failure.reason, error = %failure.message, "Registry sync failed");

                // Keep what the last successful sync recorded
                let previous = source.status.clone().unwrap_or_default();
                OperatorSourceStatus {
                    phase: SourcePhase::Failed,
                    message: failure.message.clone(),
                    observed_generation: source.metadata.generation.unwrap_or(0),
                    ..previous
                }
            }
        };

        let written = with_timeout(
            self.config.api_timeout,
            "update OperatorSource status",
            self.store.update_source_status(source, &status),
        )
        .await;

        let outcome = match (result, written) {
            (Ok(_), Ok(())) => Ok(()),
            (Ok(_), Err(e)) => {
                warn!(error = %e, "Failed to write OperatorSource status");
                Err(SourceFailure {
                    reason: "status_write_failed",
                    message: e.to_string(),
                })
            }
            (Err(failure), written) => {
                if let Err(e) = written {
                    warn!(error = %e, "Failed to write OperatorSource status");
                }
                Err(failure)
            }
        };

        // Health and the metric count the same failures
        if let Err(failure) = &outcome {
            metrics::counter!(
                SOURCE_FAILURE_METRIC,
                "opsrc_name" => source.name_any(),
                "opsrc_error" => failure.reason
            )
            .increment(1);
        }
        outcome
    }

    async fn fetch_and_apply(
        &self,
        source: &OperatorSource,
    ) -> std::result::Result<PackageManifest, SourceFailure> {
        if let Err(errors) = source.spec.validate() {
            return Err(SourceFailure {
                reason: "invalid_spec",
                message: errors.to_string(),
            });
        }

        let spec = &source.spec;
        let manifest = with_timeout(self.config.fetch_timeout, "registry fetch", async {
            self.registry
                .fetch_packages(&spec.endpoint, &spec.registry_namespace)
                .await
                .map_err(OperatorError::from)
        })
        .await
        .map_err(|e| SourceFailure {
            reason: failure_reason(&e),
            message: e.to_string(),
        })?;

        let config = catalog_config_for(source, &manifest);
        // Never replace a servable catalog with one the materializer would reject
        if let Err(errors) = config.spec.validate() {
            return Err(SourceFailure {
                reason: "malformed_manifest",
                message: format!("registry manifest cannot be served: {}", errors),
            });
        }
        with_timeout(
            self.config.api_timeout,
            "apply CatalogSourceConfig",
            self.store.apply_catalog_config(&config),
        )
        .await
        .map_err(|e| SourceFailure {
            reason: "apply_failed",
            message: e.to_string(),
        })?;

        Ok(manifest)
    }

    /// Now, nudged forward if needed so last-sync times strictly increase
    fn next_sync_time(&self, source: &OperatorSource) -> DateTime<Utc> {
        let now = self.clock.now();
        let previous = source
            .status
            .as_ref()
            .and_then(|s| s.last_sync_time.as_deref())
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));

        match previous {
            Some(prev) if now <= prev => prev + chrono::Duration::milliseconds(1),
            _ => now,
        }
    }
}

fn format_sync_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn failure_reason(error: &OperatorError) -> &'static str {
    match error {
        OperatorError::Registry(e) => e.reason(),
        OperatorError::Timeout(_) => "registry_timeout",
        OperatorError::KubeError(_) => "api_error",
        _ => "sync_error",
    }
}

/// Decides which OperatorSource watch events are real spec changes.
///
/// Status writes by the syncer itself bump `resourceVersion` but not
/// `generation`, so only generation changes and deletions count.
#[derive(Debug, Default)]
pub struct GenerationTracker {
    seen: HashMap<String, i64>,
}

impl GenerationTracker {
    /// Record the event; true when it warrants a resync
    pub fn observe(&mut self, event: &watcher::Event<OperatorSource>) -> bool {
        match event {
            watcher::Event::Init | watcher::Event::InitDone => false,
            watcher::Event::InitApply(source) => {
                self.seen
                    .insert(source.name_any(), source.metadata.generation.unwrap_or(0));
                false
            }
            watcher::Event::Apply(source) => {
                let generation = source.metadata.generation.unwrap_or(0);
                self.seen.insert(source.name_any(), generation) != Some(generation)
            }
            watcher::Event::Delete(source) => {
                self.seen.remove(&source.name_any());
                true
            }
        }
    }
}

/// Forward OperatorSource changes to the syncer until shutdown
pub async fn watch_sources(
    client: Client,
    namespace: &str,
    notifier: SyncNotifier,
    shutdown: Shutdown,
) {
    let api: Api<OperatorSource> = Api::namespaced(client, namespace);
    let mut stream = std::pin::pin!(watcher(api, watcher::Config::default()).default_backoff());
    let mut tracker = GenerationTracker::default();

    info!(namespace = %namespace, "Watching OperatorSources");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    if tracker.observe(&event) {
                        notifier.notify();
                    }
                }
                Some(Err(e)) => warn!(error = %e, "OperatorSource watch error"),
                None => break,
            },
        }
    }

    debug!("OperatorSource watch stopped");
}
