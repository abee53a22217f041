//! Per-garden orchestration. A coordinator owns its garden's sensor poller
//! and shares the alert store, schedule manager and AI gateway with every
//! other open garden. `refresh_all` fans out to all of them and waits for
//! each to settle; one failing component never blocks the others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::alerts::AlertStore;
use crate::error::{CoreError, CoreResult};
use crate::gateway::AiGateway;
use crate::model::{AiConnectionState, Alert, WateringSchedule};
use crate::poller::SensorPoller;
use crate::schedules::{AutoSchedule, WateringScheduleManager};
use crate::sources::Backend;
use crate::state::{ActivityLog, EventKind, GardenSnapshot, RefreshReport, Settled};

/// Timing knobs shared by every garden.
#[derive(Debug, Clone, Copy)]
pub struct Tuning {
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub upcoming_limit: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            upcoming_limit: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared services
// ---------------------------------------------------------------------------

pub struct GardenServices<B: Backend> {
    pub sensors: Arc<B::Sensors>,
    pub alerts: Arc<AlertStore<B::Alerts>>,
    pub gateway: Arc<AiGateway<B::Ai>>,
    pub schedules: Arc<WateringScheduleManager<B::Schedules, B::Ai>>,
    pub tuning: Tuning,
}

impl<B: Backend> Clone for GardenServices<B> {
    fn clone(&self) -> Self {
        Self {
            sensors: Arc::clone(&self.sensors),
            alerts: Arc::clone(&self.alerts),
            gateway: Arc::clone(&self.gateway),
            schedules: Arc::clone(&self.schedules),
            tuning: self.tuning,
        }
    }
}

impl<B: Backend> GardenServices<B> {
    pub fn new(
        sensors: Arc<B::Sensors>,
        alerts: Arc<B::Alerts>,
        ai: Arc<B::Ai>,
        store: Arc<B::Schedules>,
        tuning: Tuning,
    ) -> Self {
        let gateway = Arc::new(AiGateway::new(ai, tuning.request_timeout));
        Self {
            sensors,
            alerts: Arc::new(AlertStore::new(alerts, tuning.request_timeout)),
            schedules: Arc::new(WateringScheduleManager::new(
                store,
                Arc::clone(&gateway),
                tuning.request_timeout,
                tuning.upcoming_limit,
            )),
            gateway,
            tuning,
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct GardenDataCoordinator<B: Backend> {
    garden_id: String,
    services: GardenServices<B>,
    poller: SensorPoller<B::Sensors>,
    log: StdMutex<ActivityLog>,
}

impl<B: Backend> GardenDataCoordinator<B> {
    /// Start polling and open the garden's alert and schedule slots.
    pub async fn open(garden_id: &str, services: GardenServices<B>) -> Self {
        let poller = SensorPoller::new(
            Arc::clone(&services.sensors),
            services.tuning.poll_interval,
            services.tuning.request_timeout,
        );
        poller.start(garden_id).await;
        services.alerts.open(garden_id).await;
        services.schedules.open(garden_id).await;

        let coordinator = Self {
            garden_id: garden_id.to_string(),
            services,
            poller,
            log: StdMutex::new(ActivityLog::default()),
        };
        coordinator.record(EventKind::System, "garden opened");
        info!(garden = %garden_id, "garden opened");
        coordinator
    }

    pub fn garden_id(&self) -> &str {
        &self.garden_id
    }

    /// Refresh every component concurrently and report how each settled.
    /// Decisions are skipped while the AI gateway is disconnected.
    pub async fn refresh_all(&self) -> RefreshReport {
        let g = self.garden_id.as_str();
        let decision = async {
            if self.services.gateway.connection_state() == AiConnectionState::Disconnected {
                return Settled::Skipped;
            }
            let snapshot = self.poller.view().await.snapshot();
            self.services
                .schedules
                .refresh_decision(g, snapshot)
                .await
                .into()
        };

        let (sensors, alerts, schedules, decision) = tokio::join!(
            self.poller.refresh(),
            self.services.alerts.refresh(g),
            self.services.schedules.refresh(g),
            decision,
        );

        let report = RefreshReport {
            garden_id: self.garden_id.clone(),
            sensors: sensors.into(),
            alerts: alerts.into(),
            schedules: schedules.into(),
            decision,
        };
        for (component, settled) in [
            ("sensors", &report.sensors),
            ("alerts", &report.alerts),
            ("schedules", &report.schedules),
            ("decision", &report.decision),
        ] {
            if let Settled::Failed(e) = settled {
                self.record(EventKind::Error, format!("{component} refresh failed: {e}"));
            }
        }
        if report.all_ok() {
            self.record(EventKind::Sensors, "refreshed");
        } else {
            warn!(garden = %g, "refresh finished with failures");
        }
        report
    }

    pub async fn snapshot(&self) -> GardenSnapshot {
        let g = self.garden_id.as_str();
        let sensors = self.poller.view().await;
        let status_by_type = sensors.status_by_type();
        let (alerts, uncovered_conditions, schedules) = tokio::join!(
            self.services.alerts.view(g),
            self.services.alerts.uncovered_conditions(g, &status_by_type),
            self.services.schedules.view(g),
        );

        GardenSnapshot {
            garden_id: self.garden_id.clone(),
            polling: self.poller.is_running(),
            sensors_stale: sensors.is_stale(),
            sensors,
            status_by_type,
            alerts,
            uncovered_conditions,
            schedules,
            ai_state: self.services.gateway.connection_state(),
            events: self.lock_log().recent(),
        }
    }

    // -- Alerts -------------------------------------------------------------

    pub async fn resolve_alert(&self, alert_id: &str) -> CoreResult<Alert> {
        let res = self.services.alerts.resolve(&self.garden_id, alert_id).await;
        self.record_result(EventKind::Alert, format!("alert {alert_id} resolved"), &res);
        res
    }

    pub async fn ignore_alert(&self, alert_id: &str) -> CoreResult<Alert> {
        let res = self.services.alerts.ignore(&self.garden_id, alert_id).await;
        self.record_result(EventKind::Alert, format!("alert {alert_id} ignored"), &res);
        res
    }

    // -- Schedules ----------------------------------------------------------

    pub async fn create_schedule(
        &self,
        scheduled_at: &str,
        amount: Option<f64>,
        notes: Option<String>,
    ) -> CoreResult<WateringSchedule> {
        let res = self
            .services
            .schedules
            .create(&self.garden_id, scheduled_at, amount, notes)
            .await;
        let detail = match &res {
            Ok(s) => format!("schedule {} created for {}", s.id, s.scheduled_at),
            Err(_) => "schedule create".to_string(),
        };
        self.record_result(EventKind::Schedule, detail, &res);
        res
    }

    /// Ask the AI for a schedule using the latest sensor snapshot.
    pub async fn auto_schedule(&self) -> CoreResult<AutoSchedule> {
        let snapshot = self.poller.view().await.snapshot();
        let res = self
            .services
            .schedules
            .auto_generate(&self.garden_id, snapshot)
            .await;
        let detail = match &res {
            Ok(AutoSchedule {
                schedule: Some(s), ..
            }) => format!("ai scheduled {} ({:?} l)", s.id, s.amount),
            Ok(AutoSchedule { decision, .. }) => format!(
                "ai advises no watering (confidence {:.2})",
                decision.confidence
            ),
            Err(_) => "auto schedule".to_string(),
        };
        self.record_result(EventKind::Ai, detail, &res);
        res
    }

    pub async fn complete_schedule(&self, schedule_id: &str) -> CoreResult<WateringSchedule> {
        let res = self
            .services
            .schedules
            .complete(&self.garden_id, schedule_id)
            .await;
        self.record_result(EventKind::Schedule, format!("schedule {schedule_id} completed"), &res);
        res
    }

    pub async fn skip_schedule(&self, schedule_id: &str) -> CoreResult<WateringSchedule> {
        let res = self
            .services
            .schedules
            .skip(&self.garden_id, schedule_id)
            .await;
        self.record_result(EventKind::Schedule, format!("schedule {schedule_id} skipped"), &res);
        res
    }

    pub async fn cancel_schedule(&self, schedule_id: &str) -> CoreResult<WateringSchedule> {
        let res = self
            .services
            .schedules
            .cancel(&self.garden_id, schedule_id)
            .await;
        self.record_result(EventKind::Schedule, format!("schedule {schedule_id} cancelled"), &res);
        res
    }

    pub async fn delete_schedule(&self, schedule_id: &str) -> CoreResult<()> {
        let res = self
            .services
            .schedules
            .delete(&self.garden_id, schedule_id)
            .await;
        self.record_result(EventKind::Schedule, format!("schedule {schedule_id} deleted"), &res);
        res
    }

    // -- Teardown -----------------------------------------------------------

    /// Stop polling and release the garden's slots. Results still in flight
    /// are discarded when they land.
    pub async fn close(&self) {
        self.poller.stop().await;
        self.services.alerts.release(&self.garden_id).await;
        self.services.schedules.release(&self.garden_id).await;
        self.record(EventKind::System, "garden closed");
        info!(garden = %self.garden_id, "garden closed");
    }

    // -- Activity log -------------------------------------------------------

    fn lock_log(&self) -> std::sync::MutexGuard<'_, ActivityLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, kind: EventKind, detail: impl Into<String>) {
        self.lock_log().push(kind, detail);
    }

    fn record_result<T>(&self, kind: EventKind, detail: String, res: &CoreResult<T>) {
        match res {
            Ok(_) => self.record(kind, detail),
            Err(e) => self.record(EventKind::Error, format!("{detail} failed: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Open coordinators by garden id.
pub struct GardenRegistry<B: Backend> {
    services: GardenServices<B>,
    gardens: Mutex<HashMap<String, Arc<GardenDataCoordinator<B>>>>,
}

impl<B: Backend> GardenRegistry<B> {
    pub fn new(services: GardenServices<B>) -> Self {
        Self {
            services,
            gardens: Mutex::new(HashMap::new()),
        }
    }

    pub fn gateway(&self) -> &Arc<AiGateway<B::Ai>> {
        &self.services.gateway
    }

    pub async fn get_or_open(&self, garden_id: &str) -> CoreResult<Arc<GardenDataCoordinator<B>>> {
        validate_garden_id(garden_id)?;
        let mut gardens = self.gardens.lock().await;
        if let Some(existing) = gardens.get(garden_id) {
            return Ok(Arc::clone(existing));
        }
        let coordinator =
            Arc::new(GardenDataCoordinator::open(garden_id, self.services.clone()).await);
        gardens.insert(garden_id.to_string(), Arc::clone(&coordinator));
        Ok(coordinator)
    }

    pub async fn get(&self, garden_id: &str) -> Option<Arc<GardenDataCoordinator<B>>> {
        self.gardens.lock().await.get(garden_id).cloned()
    }

    pub async fn close(&self, garden_id: &str) -> CoreResult<()> {
        let coordinator = self
            .gardens
            .lock()
            .await
            .remove(garden_id)
            .ok_or_else(|| CoreError::not_found("garden", garden_id))?;
        coordinator.close().await;
        Ok(())
    }

    pub async fn close_all(&self) {
        let open: Vec<_> = self.gardens.lock().await.drain().collect();
        for (_, coordinator) in open {
            coordinator.close().await;
        }
    }

    pub async fn garden_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.gardens.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Garden ids end up in MQTT topics, so wildcard and separator characters
/// are refused.
pub fn validate_garden_id(garden_id: &str) -> CoreResult<()> {
    if garden_id.is_empty() || garden_id.len() > 64 {
        return Err(CoreError::Validation(format!(
            "garden id must be 1-64 characters, got {}",
            garden_id.len()
        )));
    }
    if garden_id
        .chars()
        .any(|c| matches!(c, '/' | '+' | '#') || c.is_whitespace() || c.is_control())
    {
        return Err(CoreError::Validation(format!(
            "garden id '{garden_id}' contains a reserved character"
        )));
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
