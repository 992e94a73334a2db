//! Cluster status reporting
//!
//! Owns the `ClusterOperator` document. A small state machine tracks the
//! operator lifecycle; conditions are recomputed from component health on
//! every tick and written only when they change.

use crate::clock::Clock;
use crate::config::ReporterConfig;
use crate::crd::{
    ClusterOperator, ClusterOperatorCondition, ClusterOperatorSpec, ClusterOperatorStatus,
    OperandVersion,
};
use crate::error::{with_timeout, OperatorError, Result};
use crate::health::{HealthObserver, HealthSnapshot};
use crate::shutdown::{ReportingDone, Shutdown};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const CONDITION_AVAILABLE: &str = "Available";
pub const CONDITION_PROGRESSING: &str = "Progressing";
pub const CONDITION_DEGRADED: &str = "Degraded";

/// Condition reasons
pub mod reason {
    pub const INITIALIZING: &str = "initializing";
    pub const MIGRATING: &str = "migrating";
    pub const MIGRATION_FAILED: &str = "migration-failed";
    pub const SYNC_IN_PROGRESS: &str = "sync-in-progress";
    pub const AS_EXPECTED: &str = "as-expected";
    pub const SYNC_FAILED: &str = "sync-failed";
    pub const MATERIALIZE_FAILED: &str = "materialize-failed";
    pub const SHUTTING_DOWN: &str = "shutting-down";
    pub const TERMINAL_ERROR: &str = "terminal-error";
}

/// Attempts for the last write before the reporter stops
const FINAL_WRITE_ATTEMPTS: u32 = 3;
const FINAL_WRITE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Lifecycle state of the operator as reported to the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReporterState {
    Initializing,
    Migrating,
    Reconciling,
    Degraded,
    ShuttingDown,
    Stopped,
}

impl ReporterState {
    pub fn can_transition_to(self, next: ReporterState) -> bool {
        use ReporterState::*;
        match (self, next) {
            (Stopped, _) => false,
            (ShuttingDown, Stopped) => true,
            (ShuttingDown, _) => false,
            (_, ShuttingDown) => true,
            (Initializing, Migrating) => true,
            (Migrating, Reconciling) => true,
            (Reconciling, Degraded) | (Degraded, Reconciling) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ReporterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReporterState::Initializing => "Initializing",
            ReporterState::Migrating => "Migrating",
            ReporterState::Reconciling => "Reconciling",
            ReporterState::Degraded => "Degraded",
            ReporterState::ShuttingDown => "ShuttingDown",
            ReporterState::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

/// Current state plus every state visited so far
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: ReporterState,
    visited: Vec<ReporterState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            current: ReporterState::Initializing,
            visited: vec![ReporterState::Initializing],
        }
    }
}

impl StateMachine {
    pub fn current(&self) -> ReporterState {
        self.current
    }

    pub fn visited(&self) -> &[ReporterState] {
        &self.visited
    }

    pub fn has_visited(&self, state: ReporterState) -> bool {
        self.visited.contains(&state)
    }

    /// Move to `next`. Staying put is allowed; illegal moves are refused.
    pub fn transition(&mut self, next: ReporterState) -> bool {
        if self.current == next {
            return true;
        }
        if !self.current.can_transition_to(next) {
            warn!(from = %self.current, to = %next, "Rejected illegal status transition");
            return false;
        }
        debug!(from = %self.current, to = %next, "Status transition");
        self.current = next;
        self.visited.push(next);
        true
    }
}

/// Shared read handle on the reporter's state machine
#[derive(Debug, Clone, Default)]
pub struct StateHistory {
    inner: Arc<Mutex<StateMachine>>,
}

impl StateHistory {
    pub fn current(&self) -> ReporterState {
        self.inner.lock().current()
    }

    pub fn visited(&self) -> Vec<ReporterState> {
        self.inner.lock().visited().to_vec()
    }

    pub fn has_visited(&self, state: ReporterState) -> bool {
        self.inner.lock().has_visited(state)
    }

    fn transition(&self, next: ReporterState) -> bool {
        self.inner.lock().transition(next)
    }
}

/// Health verdict derived from a snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub degraded: bool,
    pub progressing: bool,
    pub reason: &'static str,
    pub message: String,
}

/// Shortest period between status reports
pub const MIN_REPORT_INTERVAL: Duration = Duration::from_millis(1);

/// Judge component health against the failure threshold
pub fn evaluate(snapshot: &HealthSnapshot, threshold: u32) -> Evaluation {
    // A source with no failures is never exhausted
    let threshold = threshold.max(1);
    let progressing = snapshot.sync.round_in_flight;

    let failed_sources = snapshot.sync.exhausted_sources(threshold);
    if !failed_sources.is_empty() {
        let details: Vec<String> = failed_sources
            .iter()
            .map(|(name, h)| {
                format!(
                    "{} ({} consecutive failures, last: {})",
                    name,
                    h.consecutive_failures,
                    h.last_error.as_deref().unwrap_or("unknown")
                )
            })
            .collect();
        return Evaluation {
            degraded: true,
            progressing,
            reason: reason::SYNC_FAILED,
            message: format!("Registry sync failing: {}", details.join(", ")),
        };
    }

    let failed_configs = snapshot.materializer.exhausted(threshold);
    if !failed_configs.is_empty() {
        let details: Vec<String> = failed_configs
            .iter()
            .map(|(key, count)| {
                let last = snapshot
                    .materializer
                    .last_errors
                    .get(*key)
                    .map(String::as_str)
                    .unwrap_or("unknown");
                format!("{} ({} consecutive failures, last: {})", key, count, last)
            })
            .collect();
        return Evaluation {
            degraded: true,
            progressing,
            reason: reason::MATERIALIZE_FAILED,
            message: format!("Catalog materialization failing: {}", details.join(", ")),
        };
    }

    if progressing {
        Evaluation {
            degraded: false,
            progressing,
            reason: reason::SYNC_IN_PROGRESS,
            message: "Registry sync in progress".to_string(),
        }
    } else {
        Evaluation {
            degraded: false,
            progressing,
            reason: reason::AS_EXPECTED,
            message: "Catalogs are up to date".to_string(),
        }
    }
}

/// Desired value of one condition, before transition-time bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionValue {
    pub condition_type: &'static str,
    pub status: bool,
    pub reason: &'static str,
    pub message: String,
}

fn condition(
    condition_type: &'static str,
    status: bool,
    reason: &'static str,
    message: impl Into<String>,
) -> ConditionValue {
    ConditionValue {
        condition_type,
        status,
        reason,
        message: message.into(),
    }
}

/// Available, Progressing and Degraded for a live state
pub fn conditions_for(state: ReporterState, eval: &Evaluation) -> Vec<ConditionValue> {
    use ReporterState::*;
    match state {
        Initializing => vec![
            condition(CONDITION_AVAILABLE, false, reason::INITIALIZING, "Operator is starting"),
            condition(CONDITION_PROGRESSING, true, reason::INITIALIZING, "Operator is starting"),
            condition(CONDITION_DEGRADED, false, reason::INITIALIZING, "Operator is starting"),
        ],
        Migrating => vec![
            condition(CONDITION_AVAILABLE, false, reason::MIGRATING, "Migrating resources from a previous release"),
            condition(CONDITION_PROGRESSING, true, reason::MIGRATING, "Migrating resources from a previous release"),
            condition(CONDITION_DEGRADED, false, reason::MIGRATING, "Migrating resources from a previous release"),
        ],
        Reconciling | Degraded => {
            let progressing_reason = if eval.progressing {
                reason::SYNC_IN_PROGRESS
            } else {
                reason::AS_EXPECTED
            };
            let degraded = if state == Degraded {
                condition(CONDITION_DEGRADED, true, eval.reason, eval.message.clone())
            } else {
                condition(CONDITION_DEGRADED, false, reason::AS_EXPECTED, "No failures")
            };
            vec![
                condition(CONDITION_AVAILABLE, true, reason::AS_EXPECTED, "Catalogs are being served"),
                condition(CONDITION_PROGRESSING, eval.progressing, progressing_reason, eval.message.clone()),
                degraded,
            ]
        }
        ShuttingDown | Stopped => graceful_conditions(),
    }
}

/// Final write of a clean shutdown
pub fn graceful_conditions() -> Vec<ConditionValue> {
    vec![
        condition(CONDITION_AVAILABLE, true, reason::SHUTTING_DOWN, "Operator stopped cleanly"),
        condition(CONDITION_PROGRESSING, false, reason::SHUTTING_DOWN, "Operator stopped cleanly"),
        condition(CONDITION_DEGRADED, false, reason::SHUTTING_DOWN, "Operator stopped cleanly"),
    ]
}

/// Final write when the operator stops because of `message`
pub fn terminal_conditions(failure_reason: &'static str, message: &str) -> Vec<ConditionValue> {
    vec![
        condition(CONDITION_AVAILABLE, false, failure_reason, message),
        condition(CONDITION_PROGRESSING, false, failure_reason, message),
        condition(CONDITION_DEGRADED, true, failure_reason, message),
    ]
}

/// Render conditions into a status document.
///
/// A condition keeps its previous `lastTransitionTime` unless its status flipped.
pub fn build_status(
    previous: Option<&ClusterOperatorStatus>,
    conditions: &[ConditionValue],
    version: &str,
    now: DateTime<Utc>,
) -> ClusterOperatorStatus {
    let now = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    let conditions = conditions
        .iter()
        .map(|c| {
            let status = if c.status { "True" } else { "False" }.to_string();
            let prior = previous.and_then(|p| {
                p.conditions
                    .iter()
                    .find(|pc| pc.condition_type == c.condition_type)
            });
            let last_transition_time = match prior {
                Some(pc) if pc.status == status => pc.last_transition_time.clone(),
                _ => now.clone(),
            };
            ClusterOperatorCondition {
                condition_type: c.condition_type.to_string(),
                status,
                reason: c.reason.to_string(),
                message: c.message.clone(),
                last_transition_time,
            }
        })
        .collect();

    ClusterOperatorStatus {
        conditions,
        versions: vec![OperandVersion {
            name: "operator".to_string(),
            version: version.to_string(),
        }],
    }
}

/// Cluster access needed by the reporter
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn read_status(&self, name: &str) -> Result<Option<ClusterOperatorStatus>>;

    /// Write the status, creating the document if it does not exist
    async fn write_status(&self, name: &str, status: &ClusterOperatorStatus) -> Result<()>;
}

/// [`StatusStore`] backed by the Kubernetes API
pub struct KubeStatusStore {
    client: Client,
}

impl KubeStatusStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusStore for KubeStatusStore {
    async fn read_status(&self, name: &str) -> Result<Option<ClusterOperatorStatus>> {
        let api: Api<ClusterOperator> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.and_then(|co| co.status))
    }

    async fn write_status(&self, name: &str, status: &ClusterOperatorStatus) -> Result<()> {
        let api: Api<ClusterOperator> = Api::all(self.client.clone());

        if api.get_opt(name).await?.is_none() {
            info!(name = %name, "Creating ClusterOperator");
            let object = ClusterOperator::new(name, ClusterOperatorSpec {});
            match api.create(&PostParams::default(), &object).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                Err(e) => return Err(e.into()),
            }
        }

        let patch = serde_json::json!({
            "status": status
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Writes the operator's cluster-wide status document
pub struct StatusReporter {
    store: Arc<dyn StatusStore>,
    clock: Arc<dyn Clock>,
    config: ReporterConfig,
    release_version: String,
    history: StateHistory,
    last_written: Option<ClusterOperatorStatus>,
    loaded_previous: bool,
}

impl StatusReporter {
    pub fn new(
        store: Arc<dyn StatusStore>,
        clock: Arc<dyn Clock>,
        config: ReporterConfig,
        release_version: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            release_version: release_version.into(),
            history: StateHistory::default(),
            last_written: None,
            loaded_previous: false,
        }
    }

    pub fn state(&self) -> ReporterState {
        self.history.current()
    }

    /// Handle that stays readable after the reporter is moved into its loop
    pub fn history(&self) -> StateHistory {
        self.history.clone()
    }

    /// Mark migration as in progress
    pub async fn report_migration(&mut self) {
        if self.history.transition(ReporterState::Migrating) {
            let eval = evaluate(&HealthSnapshot::default(), self.config.failure_threshold);
            let conditions = conditions_for(ReporterState::Migrating, &eval);
            if let Err(e) = self.write(&conditions).await {
                warn!(error = %e, "Failed to report migration status");
            }
        }
    }

    /// Record a terminal startup failure and stop
    pub async fn report_failure(mut self, error: &OperatorError) {
        let failure_reason = match error {
            OperatorError::MigrationFailed { .. } => reason::MIGRATION_FAILED,
            _ => reason::TERMINAL_ERROR,
        };
        self.history.transition(ReporterState::ShuttingDown);
        let conditions = terminal_conditions(failure_reason, &error.to_string());
        self.write_final(&conditions).await;
        self.history.transition(ReporterState::Stopped);
    }

    /// Start the background reporting loop.
    ///
    /// The returned signal fires once the loop has seen `shutdown` and made
    /// its final write.
    pub fn start_reporting(mut self, health: HealthObserver, shutdown: Shutdown) -> ReportingDone {
        let done = ReportingDone::new();
        let completion = done.clone();

        self.history.transition(ReporterState::Reconciling);

        tokio::spawn(async move {
            let period = self.config.report_interval.max(MIN_REPORT_INTERVAL);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                interval_secs = self.config.report_interval.as_secs(),
                "Starting status reporter"
            );

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => self.report_health(&health.snapshot()).await,
                }
            }

            self.history.transition(ReporterState::ShuttingDown);
            let conditions = match shutdown.failure() {
                Some(message) => terminal_conditions(reason::TERMINAL_ERROR, &message),
                None => graceful_conditions(),
            };
            self.write_final(&conditions).await;
            self.history.transition(ReporterState::Stopped);

            info!("Status reporter stopped");
            completion.complete();
        });

        done
    }

    /// Recompute conditions from `snapshot` and write them if they changed
    pub async fn report_health(&mut self, snapshot: &HealthSnapshot) {
        let eval = evaluate(snapshot, self.config.failure_threshold);

        let next = if eval.degraded {
            ReporterState::Degraded
        } else {
            ReporterState::Reconciling
        };
        if self.state() != next {
            if eval.degraded {
                warn!(reason = eval.reason, message = %eval.message, "Operator degraded");
            } else {
                info!("Operator recovered");
            }
            self.history.transition(next);
        }

        let conditions = conditions_for(self.state(), &eval);
        if let Err(e) = self.write(&conditions).await {
            // Retried on the next tick
            warn!(error = %e, "Failed to write operator status");
        }
    }

    async fn write_final(&mut self, conditions: &[ConditionValue]) {
        for attempt in 1..=FINAL_WRITE_ATTEMPTS {
            match self.write(conditions).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(error = %e, attempt, "Failed to write final operator status");
                    if attempt < FINAL_WRITE_ATTEMPTS {
                        tokio::time::sleep(FINAL_WRITE_RETRY_DELAY).await;
                    }
                }
            }
        }
    }

    async fn write(&mut self, conditions: &[ConditionValue]) -> Result<()> {
        let name = self.config.operator_name.clone();
        let timeout = self.config.api_timeout;

        if !self.loaded_previous {
            match with_timeout(timeout, "read operator status", self.store.read_status(&name)).await
            {
                Ok(previous) => {
                    self.last_written = previous;
                    self.loaded_previous = true;
                }
                Err(e) => debug!(error = %e, "Could not read previous operator status"),
            }
        }

        let status = build_status(
            self.last_written.as_ref(),
            conditions,
            &self.release_version,
            self.clock.now(),
        );
        if self.last_written.as_ref() == Some(&status) {
            return Ok(());
        }

        with_timeout(
            timeout,
            "write operator status",
            self.store.write_status(&name, &status),
        )
        .await
        .map_err(|e| OperatorError::StatusWriteFailed(e.to_string()))?;

        self.last_written = Some(status);
        Ok(())
    }
}
