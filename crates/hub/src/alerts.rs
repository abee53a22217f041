//! Per-garden alert collections with severity ordering and the
//! RESOLVED/IGNORED transitions.
//!
//! Transitions are optimistic: the local status flips first, then the alert
//! sink is told. If the sink call fails the prior status comes back and the
//! error goes to the caller. A transition only sees the alerts of the garden
//! it was called for, and it advances the garden's sequence so a refresh
//! issued before it cannot bring the old status back.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{with_timeout, CoreError, CoreResult};
use crate::model::{Alert, AlertStatus, SensorStatus, SensorType, Severity};
use crate::seq::{RefreshOutcome, Sequencer};
use crate::sources::AlertSource;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AlertCounts {
    pub active: usize,
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

/// A classified sensor condition that no active alert covers yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertCandidate {
    pub sensor_type: SensorType,
    pub status: SensorStatus,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertView {
    pub active: Vec<Alert>,
    pub counts: AlertCounts,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
    pub error: Option<String>,
}

struct GardenAlerts {
    alerts: Vec<Alert>,
    /// Sequence taken at open; tells one lifetime of the slot from the next.
    opened_seq: u64,
    applied_seq: u64,
    last_updated: Option<OffsetDateTime>,
    error: Option<String>,
}

pub struct AlertStore<A> {
    source: Arc<A>,
    timeout: Duration,
    seq: Sequencer,
    gardens: RwLock<HashMap<String, GardenAlerts>>,
}

/// CRITICAL first, newest first within a severity.
pub fn sort_by_urgency(alerts: &mut [Alert]) {
    alerts.sort_by_key(|a| (Reverse(a.severity), Reverse(a.created_at), a.id.clone()));
}

fn active_sorted(alerts: &[Alert]) -> Vec<Alert> {
    let mut active: Vec<Alert> = alerts
        .iter()
        .filter(|a| !a.status.is_terminal())
        .cloned()
        .collect();
    sort_by_urgency(&mut active);
    active
}

fn count(active: &[Alert]) -> AlertCounts {
    let mut c = AlertCounts {
        active: active.len(),
        ..AlertCounts::default()
    };
    for a in active {
        match a.severity {
            Severity::Critical => c.critical += 1,
            Severity::High => c.high += 1,
            Severity::Medium => c.medium += 1,
            Severity::Low => c.low += 1,
        }
    }
    c
}

impl<A: AlertSource> AlertStore<A> {
    pub fn new(source: Arc<A>, timeout: Duration) -> Self {
        Self {
            source,
            timeout,
            seq: Sequencer::default(),
            gardens: RwLock::new(HashMap::new()),
        }
    }

    pub async fn open(&self, garden_id: &str) {
        let mut gardens = self.gardens.write().await;
        if !gardens.contains_key(garden_id) {
            let floor = self.seq.next();
            gardens.insert(
                garden_id.to_string(),
                GardenAlerts {
                    alerts: Vec::new(),
                    opened_seq: floor,
                    applied_seq: floor,
                    last_updated: None,
                    error: None,
                },
            );
        }
    }

    /// Drop the garden's alerts. Responses still in flight are discarded.
    pub async fn release(&self, garden_id: &str) {
        self.gardens.write().await.remove(garden_id);
    }

    /// Reload the garden's alerts. On failure the previous list stays. A
    /// garden that is not open is left alone.
    pub async fn refresh(&self, garden_id: &str) -> CoreResult<RefreshOutcome> {
        if !self.gardens.read().await.contains_key(garden_id) {
            return Ok(RefreshOutcome::Discarded);
        }
        let seq = self.seq.next();
        let res = with_timeout(self.timeout, "alert list", self.source.list_alerts(garden_id)).await;

        let mut gardens = self.gardens.write().await;
        let Some(slot) = gardens.get_mut(garden_id) else {
            debug!(garden = %garden_id, seq, "alert refresh landed after release, discarding");
            return Ok(RefreshOutcome::Discarded);
        };
        if seq <= slot.applied_seq {
            debug!(garden = %garden_id, seq, applied = slot.applied_seq, "stale alert refresh discarded");
            return Ok(RefreshOutcome::Discarded);
        }
        match res {
            Ok(alerts) => {
                debug!(garden = %garden_id, seq, alerts = alerts.len(), "alerts refreshed");
                slot.alerts = alerts;
                slot.applied_seq = seq;
                slot.last_updated = Some(OffsetDateTime::now_utc());
                slot.error = None;
                Ok(RefreshOutcome::Applied)
            }
            Err(e) => {
                warn!(garden = %garden_id, "alert refresh failed, keeping last list: {e}");
                slot.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Alerts that are neither RESOLVED nor IGNORED, most urgent first.
    pub async fn list_active(&self, garden_id: &str) -> Vec<Alert> {
        let gardens = self.gardens.read().await;
        gardens
            .get(garden_id)
            .map(|g| active_sorted(&g.alerts))
            .unwrap_or_default()
    }

    pub async fn counts(&self, garden_id: &str) -> AlertCounts {
        count(&self.list_active(garden_id).await)
    }

    pub async fn view(&self, garden_id: &str) -> AlertView {
        let gardens = self.gardens.read().await;
        match gardens.get(garden_id) {
            Some(g) => {
                let active = active_sorted(&g.alerts);
                AlertView {
                    counts: count(&active),
                    active,
                    last_updated: g.last_updated,
                    error: g.error.clone(),
                }
            }
            None => AlertView {
                active: Vec::new(),
                counts: AlertCounts::default(),
                last_updated: None,
                error: None,
            },
        }
    }

    /// Non-normal sensor types with no active alert of that type, for the
    /// external alerting collaborator to raise.
    pub async fn uncovered_conditions(
        &self,
        garden_id: &str,
        statuses: &BTreeMap<SensorType, SensorStatus>,
    ) -> Vec<AlertCandidate> {
        let active = self.list_active(garden_id).await;
        statuses
            .iter()
            .filter(|(t, s)| **s != SensorStatus::Normal && **t != SensorType::Unknown)
            .filter(|(t, _)| {
                !active
                    .iter()
                    .any(|a| a.alert_type.eq_ignore_ascii_case(t.as_str()))
            })
            .map(|(t, s)| AlertCandidate {
                sensor_type: *t,
                status: *s,
                severity: match s {
                    SensorStatus::Critical => Severity::Critical,
                    _ => Severity::Medium,
                },
            })
            .collect()
    }

    pub async fn resolve(&self, garden_id: &str, alert_id: &str) -> CoreResult<Alert> {
        self.transition(garden_id, alert_id, AlertStatus::Resolved)
            .await
    }

    pub async fn ignore(&self, garden_id: &str, alert_id: &str) -> CoreResult<Alert> {
        self.transition(garden_id, alert_id, AlertStatus::Ignored)
            .await
    }

    async fn transition(
        &self,
        garden_id: &str,
        alert_id: &str,
        target: AlertStatus,
    ) -> CoreResult<Alert> {
        let (lifetime, prior, optimistic) = {
            let mut gardens = self.gardens.write().await;
            let slot = gardens
                .get_mut(garden_id)
                .ok_or_else(|| CoreError::not_found("garden", garden_id))?;
            let lifetime = slot.opened_seq;
            let seq = self.seq.next();
            let alert = slot
                .alerts
                .iter_mut()
                .find(|a| a.id == alert_id)
                .ok_or_else(|| CoreError::not_found("alert", alert_id))?;

            if alert.status == target {
                return Ok(alert.clone());
            }
            if alert.status.is_terminal() {
                return Err(CoreError::Conflict(format!(
                    "alert '{alert_id}' is {} and cannot become {target}",
                    alert.status
                )));
            }
            let prior = (alert.status, alert.updated_at);
            alert.status = target;
            alert.updated_at = OffsetDateTime::now_utc();
            let optimistic = alert.clone();
            slot.applied_seq = slot.applied_seq.max(seq);
            (lifetime, prior, optimistic)
        };

        let res = with_timeout(
            self.timeout,
            "alert status update",
            self.source.update_alert_status(alert_id, target),
        )
        .await;

        let mut gardens = self.gardens.write().await;
        let slot = gardens
            .get_mut(garden_id)
            .filter(|slot| slot.opened_seq == lifetime);
        match res {
            Ok(()) => {
                info!(garden = %garden_id, alert = %alert_id, status = %target, "alert updated");
                if let Some(slot) = slot {
                    // A refresh that raced the sink may have put the old row back.
                    if let Some(alert) = slot.alerts.iter_mut().find(|a| a.id == alert_id) {
                        alert.status = target;
                        alert.updated_at = optimistic.updated_at;
                    }
                    slot.applied_seq = slot.applied_seq.max(self.seq.next());
                }
                Ok(optimistic)
            }
            Err(e) => {
                if let Some(alert) =
                    slot.and_then(|g| g.alerts.iter_mut().find(|a| a.id == alert_id))
                {
                    if alert.status == target {
                        alert.status = prior.0;
                        alert.updated_at = prior.1;
                    }
                }
                warn!(garden = %garden_id, alert = %alert_id, status = %target, "alert update failed, rolled back: {e}");
                Err(e)
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
