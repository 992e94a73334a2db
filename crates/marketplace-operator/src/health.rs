//! Health snapshots shared between components
//!
//! The syncer and the materializer each own a `watch::Sender` and publish
//! their health after every unit of work. The status reporter only reads.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Per-source sync health
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceHealth {
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Failures since process start
    pub total_failures: u64,
    /// Reason label of the most recent failure
    pub last_error: Option<String>,
    /// Time of the most recent success
    pub last_success: Option<DateTime<Utc>>,
}

/// Health of the registry syncer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncHealth {
    /// A round is currently being processed
    pub round_in_flight: bool,
    /// Rounds finished since start
    pub rounds_completed: u64,
    /// End of the most recent round in which every source succeeded
    pub last_clean_round: Option<DateTime<Utc>>,
    pub sources: BTreeMap<String, SourceHealth>,
}

impl SyncHealth {
    pub fn record_success(&mut self, source: &str, at: DateTime<Utc>) {
        let entry = self.sources.entry(source.to_string()).or_default();
        entry.consecutive_failures = 0;
        entry.last_error = None;
        entry.last_success = Some(at);
    }

    pub fn record_failure(&mut self, source: &str, reason: &str) {
        let entry = self.sources.entry(source.to_string()).or_default();
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.total_failures += 1;
        entry.last_error = Some(reason.to_string());
    }

    /// Drop sources that no longer exist
    pub fn retain_sources(&mut self, known: &[String]) {
        self.sources.retain(|name, _| known.contains(name));
    }

    /// Sources whose consecutive failures reached `threshold`
    pub fn exhausted_sources(&self, threshold: u32) -> Vec<(&str, &SourceHealth)> {
        self.sources
            .iter()
            .filter(|(_, h)| h.consecutive_failures >= threshold)
            .map(|(name, h)| (name.as_str(), h))
            .collect()
    }
}

/// Health of the catalog materializer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterializerHealth {
    /// Consecutive failures per CatalogSourceConfig (`namespace/name`)
    pub failing: BTreeMap<String, u32>,
    /// Last error message per failing config
    pub last_errors: BTreeMap<String, String>,
    /// Successful reconciles since start
    pub reconciled: u64,
}

impl MaterializerHealth {
    pub fn exhausted(&self, threshold: u32) -> Vec<(&str, u32)> {
        self.failing
            .iter()
            .filter(|(_, count)| **count >= threshold)
            .map(|(key, count)| (key.as_str(), *count))
            .collect()
    }
}

/// Read side of both health channels
#[derive(Debug, Clone)]
pub struct HealthObserver {
    sync: watch::Receiver<SyncHealth>,
    materializer: watch::Receiver<MaterializerHealth>,
}

/// Point-in-time copy of all component health
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthSnapshot {
    pub sync: SyncHealth,
    pub materializer: MaterializerHealth,
}

impl HealthObserver {
    pub fn new(
        sync: watch::Receiver<SyncHealth>,
        materializer: watch::Receiver<MaterializerHealth>,
    ) -> Self {
        Self { sync, materializer }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            sync: self.sync.borrow().clone(),
            materializer: self.materializer.borrow().clone(),
        }
    }
}

/// Create both health channels and the observer reading them
pub fn health_channels() -> (
    watch::Sender<SyncHealth>,
    watch::Sender<MaterializerHealth>,
    HealthObserver,
) {
    let (sync_tx, sync_rx) = watch::channel(SyncHealth::default());
    let (mat_tx, mat_rx) = watch::channel(MaterializerHealth::default());
    (sync_tx, mat_tx, HealthObserver::new(sync_rx, mat_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_then_success_resets_streak() {
        let mut health = SyncHealth::default();
        health.record_failure("acme", "registry_unavailable");
        health.record_failure("acme", "registry_unavailable");
        assert_eq!(health.sources["acme"].consecutive_failures, 2);

        health.record_success("acme", Utc::now());
        let acme = &health.sources["acme"];
        assert_eq!(acme.consecutive_failures, 0);
        assert_eq!(acme.total_failures, 2);
        assert!(acme.last_error.is_none());
    }

    #[test]
    fn test_exhausted_sources() {
        let mut health = SyncHealth::default();
        for _ in 0..3 {
            health.record_failure("acme", "registry_unavailable");
        }
        health.record_failure("globex", "malformed_manifest");

        let exhausted = health.exhausted_sources(3);
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].0, "acme");
    }

    #[test]
    fn test_retain_sources() {
        let mut health = SyncHealth::default();
        health.record_failure("gone", "registry_unavailable");
        health.record_success("kept", Utc::now());

        health.retain_sources(&["kept".to_string()]);
        assert!(health.sources.contains_key("kept"));
        assert!(!health.sources.contains_key("gone"));
    }

    #[test]
    fn test_observer_sees_published_health() {
        let (sync_tx, mat_tx, observer) = health_channels();

        sync_tx.send_modify(|h| h.round_in_flight = true);
        mat_tx.send_modify(|h| {
            h.failing.insert("ns/acme".to_string(), 4);
        });

        let snapshot = observer.snapshot();
        assert!(snapshot.sync.round_in_flight);
        assert_eq!(snapshot.materializer.exhausted(3), vec![("ns/acme", 4)]);
    }
}
