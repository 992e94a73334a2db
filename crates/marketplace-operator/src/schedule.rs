//! Sync schedule
//!
//! Holds the next-fire timestamps of the registry syncer. Regular rounds
//! run on a fixed interval after an initial grace period; change
//! notifications open a debounce window that produces exactly one extra
//! round when it closes. Nothing here sleeps; callers pass in `now`.

use crate::clock::to_delta;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Shortest resync interval the schedule accepts
pub const MIN_RESYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Why a round runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Regular fixed-interval round
    Scheduled,
    /// Debounced round requested by change notifications
    Notified,
}

impl std::fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncTrigger::Scheduled => write!(f, "scheduled"),
            SyncTrigger::Notified => write!(f, "notified"),
        }
    }
}

/// Next-fire bookkeeping for the syncer
#[derive(Debug, Clone)]
pub struct SyncSchedule {
    resync_interval: chrono::Duration,
    debounce_window: chrono::Duration,
    /// Notifications are held until the grace period ends
    not_before: DateTime<Utc>,
    next_resync: DateTime<Utc>,
    /// First notification of the currently open window
    pending_since: Option<DateTime<Utc>>,
    last_notified_round: Option<DateTime<Utc>>,
}

impl SyncSchedule {
    pub fn new(
        now: DateTime<Utc>,
        initial_wait: Duration,
        resync_interval: Duration,
        debounce_window: Duration,
    ) -> Self {
        let first = now + to_delta(initial_wait);
        Self {
            resync_interval: to_delta(resync_interval.max(MIN_RESYNC_INTERVAL)),
            debounce_window: to_delta(debounce_window),
            not_before: first,
            next_resync: first,
            pending_since: None,
            last_notified_round: None,
        }
    }

    /// Record a change notification. Notifications inside an open window coalesce.
    pub fn notify(&mut self, now: DateTime<Utc>) {
        if self.pending_since.is_none() {
            self.pending_since = Some(now);
        }
    }

    pub fn has_pending_notification(&self) -> bool {
        self.pending_since.is_some()
    }

    /// When the next regular round is due
    pub fn next_resync(&self) -> DateTime<Utc> {
        self.next_resync
    }

    /// When the pending notification round is due, if any
    pub fn notified_deadline(&self) -> Option<DateTime<Utc>> {
        let opened = self.pending_since?;
        let mut due = opened + self.debounce_window;
        if let Some(last) = self.last_notified_round {
            due = due.max(last + self.debounce_window);
        }
        Some(due.max(self.not_before))
    }

    /// Earliest instant at which [`poll`](Self::poll) may yield a trigger
    pub fn next_deadline(&self) -> DateTime<Utc> {
        match self.notified_deadline() {
            Some(notified) => notified.min(self.next_resync),
            None => self.next_resync,
        }
    }

    /// Return the trigger due at `now` and advance the schedule.
    ///
    /// A round due for both reasons runs once as `Scheduled` and absorbs
    /// the pending notification.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<SyncTrigger> {
        let scheduled_due = now >= self.next_resync;
        let notified_due = self.notified_deadline().is_some_and(|due| now >= due);

        if !scheduled_due && !notified_due {
            return None;
        }

        if self.pending_since.is_some() {
            self.pending_since = None;
            if notified_due {
                self.last_notified_round = Some(now);
            }
        }

        if scheduled_due {
            // Skip ticks missed while a round ran long; never bunch them up
            while self.next_resync <= now {
                self.next_resync += self.resync_interval;
            }
            Some(SyncTrigger::Scheduled)
        } else {
            Some(SyncTrigger::Notified)
        }
    }
}
