//! Capability interfaces for the collaborators the core talks to.
//!
//! Implementations are injected at construction: `memory` for tests,
//! `mqtt`/`cloud`/`db` for the deployed hub.

use std::future::Future;

use time::OffsetDateTime;

use crate::error::CoreResult;
use crate::model::{
    Alert, AlertStatus, NewSchedule, ScheduleStatus, SensorReading, SensorSnapshot,
    WateringDecision, WateringSchedule,
};

pub trait SensorSource: Send + Sync + 'static {
    fn latest_readings(
        &self,
        garden_id: &str,
    ) -> impl Future<Output = CoreResult<Vec<SensorReading>>> + Send;
}

pub trait AlertSource: Send + Sync + 'static {
    fn list_alerts(&self, garden_id: &str) -> impl Future<Output = CoreResult<Vec<Alert>>> + Send;

    fn update_alert_status(
        &self,
        alert_id: &str,
        status: AlertStatus,
    ) -> impl Future<Output = CoreResult<()>> + Send;
}

pub trait AiService: Send + Sync + 'static {
    fn decide(
        &self,
        garden_id: &str,
        snapshot: Option<&SensorSnapshot>,
    ) -> impl Future<Output = CoreResult<WateringDecision>> + Send;

    /// `Ok(false)` means the service answered but is not healthy.
    fn ping(&self) -> impl Future<Output = CoreResult<bool>> + Send;

    fn optimal_amount(
        &self,
        garden_id: &str,
        time: OffsetDateTime,
        notes: Option<&str>,
    ) -> impl Future<Output = CoreResult<Option<f64>>> + Send;
}

/// Schedule persistence. Implementations enforce the forward-only status
/// rule themselves: `set_status` on a non-PENDING record is a `Conflict`.
/// Writes are scoped to a garden: an id owned by another garden is `NotFound`.
pub trait ScheduleStore: Send + Sync + 'static {
    fn list(&self, garden_id: &str)
        -> impl Future<Output = CoreResult<Vec<WateringSchedule>>> + Send;

    /// PENDING schedules at or after now, soonest first.
    fn upcoming(
        &self,
        garden_id: &str,
        limit: usize,
    ) -> impl Future<Output = CoreResult<Vec<WateringSchedule>>> + Send;

    fn create(&self, new: NewSchedule) -> impl Future<Output = CoreResult<WateringSchedule>> + Send;

    fn set_status(
        &self,
        garden_id: &str,
        schedule_id: &str,
        status: ScheduleStatus,
    ) -> impl Future<Output = CoreResult<WateringSchedule>> + Send;

    fn delete(
        &self,
        garden_id: &str,
        schedule_id: &str,
    ) -> impl Future<Output = CoreResult<()>> + Send;
}

/// Type-level bundle of the four collaborators a garden needs.
pub trait Backend: Send + Sync + 'static {
    type Sensors: SensorSource;
    type Alerts: AlertSource;
    type Ai: AiService;
    type Schedules: ScheduleStore;
}
