use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use time::OffsetDateTime;

use crate::alerts::{AlertCandidate, AlertView};
use crate::error::CoreResult;
use crate::model::{AiConnectionState, SensorStatus, SensorType};
use crate::poller::SensorView;
use crate::schedules::ScheduleView;
use crate::seq::RefreshOutcome;

/// Maximum number of events retained per garden.
pub const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Activity log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Sensors,
    Alert,
    Schedule,
    Ai,
    Error,
    System,
}

#[derive(Debug, Default)]
pub struct ActivityLog {
    events: VecDeque<ActivityEvent>,
}

impl ActivityLog {
    pub fn push(&mut self, kind: EventKind, detail: impl Into<String>) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(ActivityEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail: detail.into(),
        });
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<ActivityEvent> {
        self.events.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Refresh report
// ---------------------------------------------------------------------------

/// How one component's part of a refresh settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "error", rename_all = "lowercase")]
pub enum Settled {
    Applied,
    Discarded,
    /// Not attempted, e.g. decisions while the AI is disconnected.
    Skipped,
    Failed(String),
}

impl Settled {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl From<CoreResult<RefreshOutcome>> for Settled {
    fn from(res: CoreResult<RefreshOutcome>) -> Self {
        match res {
            Ok(RefreshOutcome::Applied) => Self::Applied,
            Ok(RefreshOutcome::Discarded) => Self::Discarded,
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

impl From<CoreResult<()>> for Settled {
    fn from(res: CoreResult<()>) -> Self {
        match res {
            Ok(()) => Self::Applied,
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub garden_id: String,
    pub sensors: Settled,
    pub alerts: Settled,
    pub schedules: Settled,
    pub decision: Settled,
}

impl RefreshReport {
    pub fn all_ok(&self) -> bool {
        ![&self.sensors, &self.alerts, &self.schedules, &self.decision]
            .iter()
            .any(|s| s.is_failed())
    }
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct GardenSnapshot {
    pub garden_id: String,
    pub polling: bool,
    pub sensors: SensorView,
    /// Sensors are showing data a later fetch failed to refresh.
    pub sensors_stale: bool,
    pub status_by_type: BTreeMap<SensorType, SensorStatus>,
    pub alerts: AlertView,
    pub uncovered_conditions: Vec<AlertCandidate>,
    pub schedules: ScheduleView,
    pub ai_state: AiConnectionState,
    pub events: Vec<ActivityEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    #[test]
    fn log_is_bounded_and_newest_first() {
        let mut log = ActivityLog::default();
        for i in 0..MAX_EVENTS + 5 {
            log.push(EventKind::System, format!("event {i}"));
        }
        assert_eq!(log.len(), MAX_EVENTS);
        let recent = log.recent();
        assert_eq!(recent[0].detail, format!("event {}", MAX_EVENTS + 4));
        assert_eq!(recent.last().unwrap().detail, "event 5");
    }

    #[test]
    fn settled_serialises_with_error_detail() {
        let failed: Settled = Err::<RefreshOutcome, _>(CoreError::upstream("broker down")).into();
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert!(json["error"].as_str().unwrap().contains("broker down"));

        let ok = serde_json::to_value(Settled::Applied).unwrap();
        assert_eq!(ok, serde_json::json!({ "outcome": "applied" }));
    }

    #[test]
    fn report_flags_any_failure() {
        let mut report = RefreshReport {
            garden_id: "g1".into(),
            sensors: Settled::Applied,
            alerts: Settled::Discarded,
            schedules: Settled::Applied,
            decision: Settled::Skipped,
        };
        assert!(report.all_ok());
        report.alerts = Settled::Failed("timeout".into());
        assert!(!report.all_ok());
    }
}
