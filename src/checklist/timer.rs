//! Elapsed/idle tracking for a checklist run.
//!
//! Activity is recorded as timestamps (answer, photo, scroll, ...). Idle
//! time is the gap between consecutive activity events, with the run start
//! and finish counting as activity.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// What the scorer needs to know about timing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSummary {
    pub elapsed_seconds: u64,
    pub longest_idle_seconds: u64,
}

impl TimerSummary {
    /// Finished no later than the template's estimate.
    pub fn within_estimate(&self, estimated_minutes: u32) -> bool {
        self.elapsed_seconds <= u64::from(estimated_minutes) * 60
    }

    /// No idle gap reached `threshold_secs`.
    pub fn focused(&self, threshold_secs: u64) -> bool {
        self.longest_idle_seconds < threshold_secs
    }
}

/// Tracks activity for one run.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    started_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    longest_idle: TimeDelta,
    finished_at: Option<DateTime<Utc>>,
}

impl ActivityTracker {
    pub fn start(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            last_activity: started_at,
            longest_idle: TimeDelta::zero(),
            finished_at: None,
        }
    }

    /// Replay a recorded activity log.
    pub fn replay(
        started_at: DateTime<Utc>,
        activity: impl IntoIterator<Item = DateTime<Utc>>,
        finished_at: DateTime<Utc>,
    ) -> TimerSummary {
        let mut events: Vec<DateTime<Utc>> = activity.into_iter().collect();
        events.sort();
        let mut tracker = Self::start(started_at);
        for at in events {
            tracker.record(at);
        }
        tracker.finish(finished_at)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Record activity. Events before the last seen one, or after finish, are ignored.
    pub fn record(&mut self, at: DateTime<Utc>) {
        if self.finished_at.is_some() || at < self.last_activity {
            return;
        }
        let gap = at - self.last_activity;
        if gap > self.longest_idle {
            self.longest_idle = gap;
        }
        self.last_activity = at;
    }

    /// Snapshot while still running; the open gap up to `now` counts as idle.
    pub fn summary_at(&self, now: DateTime<Utc>) -> TimerSummary {
        let end = self.finished_at.unwrap_or(now);
        let open_gap = if self.finished_at.is_none() && end > self.last_activity {
            end - self.last_activity
        } else {
            TimeDelta::zero()
        };
        TimerSummary {
            elapsed_seconds: seconds(end - self.started_at),
            longest_idle_seconds: seconds(self.longest_idle.max(open_gap)),
        }
    }

    /// Stop the clock. Later calls keep the first finish time.
    pub fn finish(&mut self, at: DateTime<Utc>) -> TimerSummary {
        if self.finished_at.is_none() {
            self.record(at);
            self.finished_at = Some(at.max(self.last_activity));
        }
        self.summary_at(at)
    }
}

fn seconds(delta: TimeDelta) -> u64 {
    delta.num_seconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap() + TimeDelta::seconds(secs)
    }

    #[test]
    fn steady_activity_has_small_idle() {
        let summary = ActivityTracker::replay(t(0), (1..=10).map(|i| t(i * 30)), t(300));
        assert_eq!(summary.elapsed_seconds, 300);
        assert_eq!(summary.longest_idle_seconds, 30);
        assert!(summary.focused(300));
    }

    #[test]
    fn long_gap_breaks_focus() {
        let summary = ActivityTracker::replay(t(0), vec![t(10), t(320)], t(330));
        assert_eq!(summary.longest_idle_seconds, 310);
        assert!(!summary.focused(300));
    }

    #[test]
    fn gap_of_exactly_threshold_breaks_focus() {
        let summary = ActivityTracker::replay(t(0), vec![t(300)], t(310));
        assert_eq!(summary.longest_idle_seconds, 300);
        assert!(!summary.focused(300));
    }

    #[test]
    fn finish_gap_counts_as_idle() {
        let summary = ActivityTracker::replay(t(0), vec![t(5)], t(400));
        assert_eq!(summary.longest_idle_seconds, 395);
    }

    #[test]
    fn replay_sorts_events() {
        let summary = ActivityTracker::replay(t(0), vec![t(200), t(100)], t(250));
        assert_eq!(summary.longest_idle_seconds, 100);
    }

    #[test]
    fn stale_events_ignored() {
        let mut tracker = ActivityTracker::start(t(0));
        tracker.record(t(100));
        tracker.record(t(50));
        let summary = tracker.finish(t(120));
        assert_eq!(summary.longest_idle_seconds, 100);
        assert_eq!(summary.elapsed_seconds, 120);
    }

    #[test]
    fn running_summary_includes_open_gap() {
        let mut tracker = ActivityTracker::start(t(0));
        tracker.record(t(60));
        let summary = tracker.summary_at(t(500));
        assert_eq!(summary.elapsed_seconds, 500);
        assert_eq!(summary.longest_idle_seconds, 440);
    }

    #[test]
    fn estimate_boundary_is_inclusive() {
        let s = TimerSummary {
            elapsed_seconds: 600,
            longest_idle_seconds: 0,
        };
        assert!(s.within_estimate(10));
        let s = TimerSummary {
            elapsed_seconds: 601,
            longest_idle_seconds: 0,
        };
        assert!(!s.within_estimate(10));
    }
}
