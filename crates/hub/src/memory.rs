//! In-memory backend implementing every collaborator trait.
//!
//! Holds the same contracts as the real collaborators (forward-only
//! schedule statuses, `NotFound` for unknown ids) and lets callers inject
//! failures and latency, so components can be exercised without a broker,
//! a database or the cloud.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use time::OffsetDateTime;

use crate::error::{CoreError, CoreResult};
use crate::model::{
    Alert, AlertStatus, Decision, NewSchedule, ScheduleStatus, SensorReading, SensorSnapshot,
    WateringDecision, WateringSchedule,
};
use crate::sources::{AiService, AlertSource, Backend, ScheduleStore, SensorSource};

#[derive(Debug, Clone)]
struct AiScript {
    reachable: bool,
    decision: Decision,
    confidence: f64,
    recommended_amount: f64,
    optimal_amount: Option<f64>,
}

impl Default for AiScript {
    fn default() -> Self {
        Self {
            reachable: true,
            decision: Decision::Water,
            confidence: 0.8,
            recommended_amount: 2.5,
            optimal_amount: None,
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    sensors: bool,
    alert_updates: bool,
    alert_reads: bool,
    schedule_reads: bool,
    schedule_writes: bool,
    decisions: bool,
    sensor_delay: Option<Duration>,
    alert_update_delay: Option<Duration>,
    decide_delay: Option<Duration>,
    list_delays: VecDeque<Duration>,
    alert_list_delays: VecDeque<Duration>,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    readings: Mutex<HashMap<String, Vec<SensorReading>>>,
    alerts: Mutex<Vec<Alert>>,
    schedules: Mutex<Vec<WateringSchedule>>,
    ai: Mutex<AiScript>,
    faults: Mutex<Faults>,
    sensor_fetches: AtomicUsize,
    decide_calls: AtomicUsize,
    schedule_creates: AtomicUsize,
}

/// Lock that shrugs off poisoning; a panicking test thread must not take
/// every later assertion down with it.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn unavailable(what: &str) -> CoreError {
    CoreError::upstream(format!("{what}: connection refused"))
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Seeding ------------------------------------------------------------

    pub fn set_readings(&self, garden_id: &str, readings: Vec<SensorReading>) {
        lock(&self.readings).insert(garden_id.to_string(), readings);
    }

    pub fn push_alert(&self, alert: Alert) {
        lock(&self.alerts).push(alert);
    }

    pub fn insert_schedule(&self, schedule: WateringSchedule) {
        lock(&self.schedules).push(schedule);
    }

    // -- Inspection ---------------------------------------------------------

    pub fn alert(&self, alert_id: &str) -> Option<Alert> {
        lock(&self.alerts).iter().find(|a| a.id == alert_id).cloned()
    }

    pub fn schedules(&self) -> Vec<WateringSchedule> {
        lock(&self.schedules).clone()
    }

    pub fn sensor_fetches(&self) -> usize {
        self.sensor_fetches.load(Ordering::SeqCst)
    }

    pub fn decide_calls(&self) -> usize {
        self.decide_calls.load(Ordering::SeqCst)
    }

    pub fn schedule_creates(&self) -> usize {
        self.schedule_creates.load(Ordering::SeqCst)
    }

    // -- AI script ----------------------------------------------------------

    pub fn set_ai_reachable(&self, reachable: bool) {
        lock(&self.ai).reachable = reachable;
    }

    pub fn set_decision(&self, decision: Decision, confidence: f64, recommended_amount: f64) {
        let mut ai = lock(&self.ai);
        ai.decision = decision;
        ai.confidence = confidence;
        ai.recommended_amount = recommended_amount;
    }

    pub fn set_optimal_amount(&self, amount: Option<f64>) {
        lock(&self.ai).optimal_amount = amount;
    }

    // -- Fault injection ----------------------------------------------------

    pub fn fail_sensors(&self, fail: bool) {
        lock(&self.faults).sensors = fail;
    }

    pub fn fail_alert_reads(&self, fail: bool) {
        lock(&self.faults).alert_reads = fail;
    }

    pub fn fail_alert_updates(&self, fail: bool) {
        lock(&self.faults).alert_updates = fail;
    }

    pub fn fail_schedule_reads(&self, fail: bool) {
        lock(&self.faults).schedule_reads = fail;
    }

    pub fn fail_schedule_writes(&self, fail: bool) {
        lock(&self.faults).schedule_writes = fail;
    }

    /// Decision calls fail while pings keep succeeding.
    pub fn fail_decisions(&self, fail: bool) {
        lock(&self.faults).decisions = fail;
    }

    pub fn set_sensor_delay(&self, delay: Option<Duration>) {
        lock(&self.faults).sensor_delay = delay;
    }

    pub fn set_alert_update_delay(&self, delay: Option<Duration>) {
        lock(&self.faults).alert_update_delay = delay;
    }

    pub fn set_decide_delay(&self, delay: Option<Duration>) {
        lock(&self.faults).decide_delay = delay;
    }

    /// Delay the next `list` call by `delay`. The call captures its rows
    /// before sleeping, so a delayed response carries old data.
    pub fn queue_list_delay(&self, delay: Duration) {
        lock(&self.faults).list_delays.push_back(delay);
    }

    /// Same as `queue_list_delay`, for the next `list_alerts` call.
    pub fn queue_alert_list_delay(&self, delay: Duration) {
        lock(&self.faults).alert_list_delays.push_back(delay);
    }
}

impl Backend for MemoryBackend {
    type Sensors = MemoryBackend;
    type Alerts = MemoryBackend;
    type Ai = MemoryBackend;
    type Schedules = MemoryBackend;
}

// ---------------------------------------------------------------------------
// Sensors
// ---------------------------------------------------------------------------

impl SensorSource for MemoryBackend {
    async fn latest_readings(&self, garden_id: &str) -> CoreResult<Vec<SensorReading>> {
        self.sensor_fetches.fetch_add(1, Ordering::SeqCst);
        let (fail, delay) = {
            let f = lock(&self.faults);
            (f.sensors, f.sensor_delay)
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if fail {
            return Err(unavailable("sensor source"));
        }
        Ok(lock(&self.readings)
            .get(garden_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

impl AlertSource for MemoryBackend {
    async fn list_alerts(&self, garden_id: &str) -> CoreResult<Vec<Alert>> {
        let (fail, delay) = {
            let mut f = lock(&self.faults);
            (f.alert_reads, f.alert_list_delays.pop_front())
        };
        let rows: Vec<Alert> = lock(&self.alerts)
            .iter()
            .filter(|a| a.garden_id.as_deref() == Some(garden_id))
            .cloned()
            .collect();

        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if fail {
            return Err(unavailable("alert source"));
        }
        Ok(rows)
    }

    async fn update_alert_status(&self, alert_id: &str, status: AlertStatus) -> CoreResult<()> {
        let (fail, delay) = {
            let f = lock(&self.faults);
            (f.alert_updates, f.alert_update_delay)
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if fail {
            return Err(unavailable("alert sink"));
        }
        let mut alerts = lock(&self.alerts);
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or_else(|| CoreError::not_found("alert", alert_id))?;
        alert.status = status;
        alert.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AI service
// ---------------------------------------------------------------------------

impl AiService for MemoryBackend {
    async fn decide(
        &self,
        garden_id: &str,
        snapshot: Option<&SensorSnapshot>,
    ) -> CoreResult<WateringDecision> {
        self.decide_calls.fetch_add(1, Ordering::SeqCst);
        let delay = lock(&self.faults).decide_delay;
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let ai = lock(&self.ai).clone();
        if !ai.reachable || lock(&self.faults).decisions {
            return Err(unavailable("ai service"));
        }
        Ok(WateringDecision {
            decision: ai.decision,
            confidence: ai.confidence,
            reasons: vec![format!("scripted decision for {garden_id}")],
            recommended_amount: ai.recommended_amount,
            sensor_snapshot: snapshot.cloned(),
            timestamp: OffsetDateTime::now_utc(),
        })
    }

    async fn ping(&self) -> CoreResult<bool> {
        if lock(&self.ai).reachable {
            Ok(true)
        } else {
            Err(unavailable("ai service"))
        }
    }

    async fn optimal_amount(
        &self,
        _garden_id: &str,
        _time: OffsetDateTime,
        _notes: Option<&str>,
    ) -> CoreResult<Option<f64>> {
        let ai = lock(&self.ai).clone();
        if !ai.reachable {
            return Err(unavailable("ai service"));
        }
        Ok(ai.optimal_amount)
    }
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

impl ScheduleStore for MemoryBackend {
    async fn list(&self, garden_id: &str) -> CoreResult<Vec<WateringSchedule>> {
        let (fail, delay) = {
            let mut f = lock(&self.faults);
            (f.schedule_reads, f.list_delays.pop_front())
        };
        let mut rows: Vec<WateringSchedule> = lock(&self.schedules)
            .iter()
            .filter(|s| s.garden_id == garden_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.scheduled_at.cmp(&a.scheduled_at));

        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if fail {
            return Err(unavailable("schedule store"));
        }
        Ok(rows)
    }

    async fn upcoming(&self, garden_id: &str, limit: usize) -> CoreResult<Vec<WateringSchedule>> {
        if lock(&self.faults).schedule_reads {
            return Err(unavailable("schedule store"));
        }
        let now = OffsetDateTime::now_utc();
        let mut rows: Vec<WateringSchedule> = lock(&self.schedules)
            .iter()
            .filter(|s| {
                s.garden_id == garden_id
                    && s.status == ScheduleStatus::Pending
                    && s.scheduled_at >= now
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn create(&self, new: NewSchedule) -> CoreResult<WateringSchedule> {
        if lock(&self.faults).schedule_writes {
            return Err(unavailable("schedule store"));
        }
        self.schedule_creates.fetch_add(1, Ordering::SeqCst);
        let now = OffsetDateTime::now_utc();
        let schedule = WateringSchedule {
            id: uuid::Uuid::new_v4().to_string(),
            garden_id: new.garden_id,
            scheduled_at: new.scheduled_at,
            amount: new.amount,
            reason: new.reason,
            status: ScheduleStatus::Pending,
            notes: new.notes,
            created_at: now,
            updated_at: now,
        };
        lock(&self.schedules).push(schedule.clone());
        Ok(schedule)
    }

    async fn set_status(
        &self,
        garden_id: &str,
        schedule_id: &str,
        status: ScheduleStatus,
    ) -> CoreResult<WateringSchedule> {
        if lock(&self.faults).schedule_writes {
            return Err(unavailable("schedule store"));
        }
        let mut schedules = lock(&self.schedules);
        let s = schedules
            .iter_mut()
            .find(|s| s.id == schedule_id && s.garden_id == garden_id)
            .ok_or_else(|| CoreError::not_found("schedule", schedule_id))?;
        if s.status.is_terminal() {
            return Err(CoreError::Conflict(format!(
                "schedule '{schedule_id}' is already {}",
                s.status
            )));
        }
        s.status = status;
        s.updated_at = OffsetDateTime::now_utc();
        Ok(s.clone())
    }

    async fn delete(&self, garden_id: &str, schedule_id: &str) -> CoreResult<()> {
        if lock(&self.faults).schedule_writes {
            return Err(unavailable("schedule store"));
        }
        let mut schedules = lock(&self.schedules);
        let before = schedules.len();
        schedules.retain(|s| !(s.id == schedule_id && s.garden_id == garden_id));
        if schedules.len() == before {
            return Err(CoreError::not_found("schedule", schedule_id));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------
