//! Watering schedules per garden: manual and AI-generated entries, their
//! status transitions, and the garden's current AI decision.
//!
//! ## Per-entry state machine
//!
//! ```text
//!            ┌──[complete]──▶ COMPLETED
//! PENDING ───┼──[skip]──────▶ SKIPPED
//!            └──[cancel]────▶ CANCELLED
//!
//! any state ──[delete]──▶ (removed)
//! ```
//!
//! Terminal entries never move again. Mutations within one garden run one
//! at a time and only touch the in-memory list after the store accepted
//! them. Refreshes are sequence-numbered: a response is applied only if it
//! was issued after the state it would replace.
//!
//! Every operation needs the garden to be open. Nothing re-creates a slot
//! after `release`; results that land afterwards leave no trace.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{with_timeout, CoreError, CoreResult};
use crate::gateway::AiGateway;
use crate::model::{
    AiConnectionState, Decision, NewSchedule, ScheduleStatus, SensorSnapshot, WateringDecision,
    WateringSchedule,
};
use crate::seq::{RefreshOutcome, Sequencer};
use crate::sources::{AiService, ScheduleStore};

/// Lead time for AI-generated entries so they are listed as upcoming.
const AUTO_SCHEDULE_LEAD: time::Duration = time::Duration::minutes(1);

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScheduleStats {
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    /// Sum of `amount` over pending entries.
    pub pending_amount: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_at: Option<OffsetDateTime>,
    /// Completed share of the entries that reached a terminal status.
    pub completion_rate: Option<f64>,
}

impl ScheduleStats {
    fn from_schedules(all: &[WateringSchedule], now: OffsetDateTime) -> Self {
        let mut s = Self {
            total: all.len(),
            ..Self::default()
        };
        for e in all {
            match e.status {
                ScheduleStatus::Pending => {
                    s.pending += 1;
                    s.pending_amount += e.amount.unwrap_or(0.0);
                    if e.scheduled_at >= now && s.next_at.map_or(true, |n| e.scheduled_at < n) {
                        s.next_at = Some(e.scheduled_at);
                    }
                }
                ScheduleStatus::Completed => s.completed += 1,
                ScheduleStatus::Skipped => s.skipped += 1,
                ScheduleStatus::Cancelled => s.cancelled += 1,
            }
        }
        let settled = s.completed + s.skipped + s.cancelled;
        if settled > 0 {
            s.completion_rate = Some(s.completed as f64 / settled as f64);
        }
        s
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleView {
    pub all: Vec<WateringSchedule>,
    pub upcoming: Vec<WateringSchedule>,
    pub decision: Option<WateringDecision>,
    pub stats: ScheduleStats,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
    pub error: Option<String>,
}

/// Result of asking the AI for a schedule. A `no_water` decision creates
/// nothing.
#[derive(Debug, Clone, Serialize)]
pub struct AutoSchedule {
    pub decision: WateringDecision,
    pub schedule: Option<WateringSchedule>,
}

// ---------------------------------------------------------------------------
// Per-garden slot
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScheduleRecords {
    all: Vec<WateringSchedule>,
    upcoming: Vec<WateringSchedule>,
    decision: Option<WateringDecision>,
    applied_seq: u64,
    decision_seq: u64,
    last_updated: Option<OffsetDateTime>,
    error: Option<String>,
}

impl ScheduleRecords {
    fn upsert(&mut self, schedule: WateringSchedule) {
        match self.all.iter_mut().find(|s| s.id == schedule.id) {
            Some(existing) => *existing = schedule,
            None => self.all.push(schedule),
        }
        self.all.sort_by(|a, b| b.scheduled_at.cmp(&a.scheduled_at));
    }

    fn recompute_upcoming(&mut self, limit: usize, now: OffsetDateTime) {
        let mut upcoming: Vec<WateringSchedule> = self
            .all
            .iter()
            .filter(|s| s.status == ScheduleStatus::Pending && s.scheduled_at >= now)
            .cloned()
            .collect();
        upcoming.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        upcoming.truncate(limit);
        self.upcoming = upcoming;
    }
}

struct GardenSlot {
    /// Held for the whole of a mutation, remote call included.
    writes: Mutex<()>,
    records: RwLock<ScheduleRecords>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct WateringScheduleManager<P, G> {
    store: Arc<P>,
    gateway: Arc<AiGateway<G>>,
    timeout: Duration,
    upcoming_limit: usize,
    seq: Sequencer,
    gardens: RwLock<HashMap<String, Arc<GardenSlot>>>,
}

impl<P: ScheduleStore, G: AiService> WateringScheduleManager<P, G> {
    pub fn new(
        store: Arc<P>,
        gateway: Arc<AiGateway<G>>,
        timeout: Duration,
        upcoming_limit: usize,
    ) -> Self {
        Self {
            store,
            gateway,
            timeout,
            upcoming_limit,
            seq: Sequencer::default(),
            gardens: RwLock::new(HashMap::new()),
        }
    }

    pub async fn open(&self, garden_id: &str) {
        let mut gardens = self.gardens.write().await;
        gardens.entry(garden_id.to_string()).or_insert_with(|| {
            Arc::new(GardenSlot {
                writes: Mutex::new(()),
                records: RwLock::new({
                    let floor = self.seq.next();
                    ScheduleRecords {
                        applied_seq: floor,
                        decision_seq: floor,
                        ..ScheduleRecords::default()
                    }
                }),
            })
        });
    }

    /// Forget the garden. Responses still in flight are discarded.
    pub async fn release(&self, garden_id: &str) {
        self.gardens.write().await.remove(garden_id);
    }

    async fn slot(&self, garden_id: &str) -> Option<Arc<GardenSlot>> {
        self.gardens.read().await.get(garden_id).cloned()
    }

    async fn open_slot(&self, garden_id: &str) -> CoreResult<Arc<GardenSlot>> {
        self.slot(garden_id)
            .await
            .ok_or_else(|| CoreError::not_found("garden", garden_id))
    }

    /// The slot, if it is still the one a call started against.
    async fn current(&self, garden_id: &str, slot: &Arc<GardenSlot>) -> bool {
        matches!(self.slot(garden_id).await, Some(now) if Arc::ptr_eq(&now, slot))
    }

    // -- Reads --------------------------------------------------------------

    /// Reload all schedules and the upcoming subset in parallel.
    pub async fn refresh(&self, garden_id: &str) -> CoreResult<RefreshOutcome> {
        let Some(slot) = self.slot(garden_id).await else {
            return Ok(RefreshOutcome::Discarded);
        };
        let seq = self.seq.next();

        let (all, upcoming) = tokio::join!(
            with_timeout(self.timeout, "schedule list", self.store.list(garden_id)),
            with_timeout(
                self.timeout,
                "upcoming schedules",
                self.store.upcoming(garden_id, self.upcoming_limit)
            ),
        );

        if !self.current(garden_id, &slot).await {
            debug!(garden = %garden_id, seq, "schedule refresh landed after release, discarding");
            return Ok(RefreshOutcome::Discarded);
        }
        let mut rec = slot.records.write().await;
        if seq <= rec.applied_seq {
            debug!(garden = %garden_id, seq, applied = rec.applied_seq, "stale schedule refresh discarded");
            return Ok(RefreshOutcome::Discarded);
        }

        match all.and_then(|all| upcoming.map(|up| (all, up))) {
            Ok((all, upcoming)) => {
                debug!(garden = %garden_id, seq, schedules = all.len(), "schedules refreshed");
                rec.all = all;
                rec.upcoming = upcoming;
                rec.applied_seq = seq;
                rec.last_updated = Some(OffsetDateTime::now_utc());
                rec.error = None;
                Ok(RefreshOutcome::Applied)
            }
            Err(e) => {
                warn!(garden = %garden_id, "schedule refresh failed, keeping last list: {e}");
                rec.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Ask the gateway for a fresh decision and keep it as the garden's
    /// current one.
    pub async fn refresh_decision(
        &self,
        garden_id: &str,
        snapshot: Option<SensorSnapshot>,
    ) -> CoreResult<RefreshOutcome> {
        let Some(slot) = self.slot(garden_id).await else {
            return Ok(RefreshOutcome::Discarded);
        };
        let seq = self.seq.next();
        let decision = self.gateway.get_decision(garden_id, snapshot.as_ref()).await?;
        Ok(self.store_decision(garden_id, &slot, seq, decision).await)
    }

    async fn store_decision(
        &self,
        garden_id: &str,
        slot: &Arc<GardenSlot>,
        seq: u64,
        decision: WateringDecision,
    ) -> RefreshOutcome {
        if !self.current(garden_id, slot).await {
            return RefreshOutcome::Discarded;
        }
        let mut rec = slot.records.write().await;
        if seq <= rec.decision_seq {
            return RefreshOutcome::Discarded;
        }
        rec.decision = Some(decision);
        rec.decision_seq = seq;
        RefreshOutcome::Applied
    }

    pub async fn view(&self, garden_id: &str) -> ScheduleView {
        let Some(slot) = self.slot(garden_id).await else {
            return ScheduleView::default();
        };
        let rec = slot.records.read().await;
        ScheduleView {
            all: rec.all.clone(),
            upcoming: rec.upcoming.clone(),
            decision: rec.decision.clone(),
            stats: ScheduleStats::from_schedules(&rec.all, OffsetDateTime::now_utc()),
            last_updated: rec.last_updated,
            error: rec.error.clone(),
        }
    }

    pub async fn stats(&self, garden_id: &str) -> ScheduleStats {
        self.view(garden_id).await.stats
    }

    // -- Mutations ----------------------------------------------------------

    /// Create a PENDING entry. `scheduled_at` must be RFC 3339.
    pub async fn create(
        &self,
        garden_id: &str,
        scheduled_at: &str,
        amount: Option<f64>,
        notes: Option<String>,
    ) -> CoreResult<WateringSchedule> {
        let at = OffsetDateTime::parse(scheduled_at.trim(), &Rfc3339).map_err(|e| {
            CoreError::Validation(format!(
                "scheduled_at '{scheduled_at}' is not an RFC 3339 timestamp: {e}"
            ))
        })?;
        if let Some(a) = amount {
            if !a.is_finite() || a <= 0.0 {
                return Err(CoreError::Validation(format!(
                    "amount must be a positive number, got {a}"
                )));
            }
        }
        let notes = notes
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());

        let slot = self.open_slot(garden_id).await?;
        self.insert(&slot, NewSchedule {
            garden_id: garden_id.to_string(),
            scheduled_at: at,
            amount,
            reason: None,
            notes,
        })
        .await
    }

    /// Create a PENDING entry from an AI recommendation. Fails with
    /// `RecommendationUnavailable` while the gateway is disconnected.
    pub async fn auto_generate(
        &self,
        garden_id: &str,
        snapshot: Option<SensorSnapshot>,
    ) -> CoreResult<AutoSchedule> {
        if self.gateway.connection_state() == AiConnectionState::Disconnected {
            return Err(CoreError::RecommendationUnavailable(
                "ai service is disconnected; create the schedule manually".into(),
            ));
        }

        let slot = self.open_slot(garden_id).await?;
        let seq = self.seq.next();
        let decision = self.gateway.get_decision(garden_id, snapshot.as_ref()).await?;
        self.store_decision(garden_id, &slot, seq, decision.clone())
            .await;
        if !self.current(garden_id, &slot).await {
            debug!(garden = %garden_id, "garden released while awaiting the ai, not scheduling");
            return Err(CoreError::not_found("garden", garden_id));
        }

        if decision.decision == Decision::NoWater {
            info!(garden = %garden_id, confidence = decision.confidence, "ai advises no watering");
            return Ok(AutoSchedule {
                decision,
                schedule: None,
            });
        }

        let at = OffsetDateTime::now_utc() + AUTO_SCHEDULE_LEAD;
        let amount = match self.gateway.get_optimal_amount(garden_id, at, None).await {
            Ok(Some(a)) => a,
            Ok(None) => decision.recommended_amount,
            Err(e) => {
                warn!(garden = %garden_id, "optimal amount unavailable, using recommendation: {e}");
                decision.recommended_amount
            }
        };
        let reason = if decision.reasons.is_empty() {
            "AI recommendation".to_string()
        } else {
            decision.reasons.join("; ")
        };

        let schedule = self
            .insert(&slot, NewSchedule {
                garden_id: garden_id.to_string(),
                scheduled_at: at,
                amount: Some(amount),
                reason: Some(reason),
                notes: None,
            })
            .await?;
        Ok(AutoSchedule {
            decision,
            schedule: Some(schedule),
        })
    }

    pub async fn complete(&self, garden_id: &str, schedule_id: &str) -> CoreResult<WateringSchedule> {
        self.transition(garden_id, schedule_id, ScheduleStatus::Completed)
            .await
    }

    pub async fn skip(&self, garden_id: &str, schedule_id: &str) -> CoreResult<WateringSchedule> {
        self.transition(garden_id, schedule_id, ScheduleStatus::Skipped)
            .await
    }

    pub async fn cancel(&self, garden_id: &str, schedule_id: &str) -> CoreResult<WateringSchedule> {
        self.transition(garden_id, schedule_id, ScheduleStatus::Cancelled)
            .await
    }

    /// Remove an entry in any state.
    pub async fn delete(&self, garden_id: &str, schedule_id: &str) -> CoreResult<()> {
        let slot = self.open_slot(garden_id).await?;
        let _writes = slot.writes.lock().await;

        with_timeout(
            self.timeout,
            "schedule delete",
            self.store.delete(garden_id, schedule_id),
        )
        .await
        .map_err(|e| {
            warn!(garden = %garden_id, schedule = %schedule_id, "schedule delete failed: {e}");
            e
        })?;

        info!(garden = %garden_id, schedule = %schedule_id, "schedule deleted");
        self.apply(garden_id, &slot, |rec| rec.all.retain(|s| s.id != schedule_id))
            .await;
        Ok(())
    }

    async fn insert(&self, slot: &Arc<GardenSlot>, new: NewSchedule) -> CoreResult<WateringSchedule> {
        let garden_id = new.garden_id.clone();
        let _writes = slot.writes.lock().await;

        let created = with_timeout(self.timeout, "schedule create", self.store.create(new))
            .await
            .map_err(|e| {
                warn!(garden = %garden_id, "schedule create failed: {e}");
                e
            })?;

        info!(
            garden = %garden_id,
            schedule = %created.id,
            at = %created.scheduled_at,
            "schedule created"
        );
        let record = created.clone();
        self.apply(&garden_id, slot, move |rec| rec.upsert(record))
            .await;
        Ok(created)
    }

    async fn transition(
        &self,
        garden_id: &str,
        schedule_id: &str,
        target: ScheduleStatus,
    ) -> CoreResult<WateringSchedule> {
        let slot = self.open_slot(garden_id).await?;
        let _writes = slot.writes.lock().await;

        if let Some(current) = slot
            .records
            .read()
            .await
            .all
            .iter()
            .find(|s| s.id == schedule_id)
        {
            if current.status.is_terminal() {
                return Err(CoreError::Conflict(format!(
                    "schedule '{schedule_id}' is already {} and cannot become {target}",
                    current.status
                )));
            }
        }

        let updated = with_timeout(
            self.timeout,
            "schedule status update",
            self.store.set_status(garden_id, schedule_id, target),
        )
        .await
        .map_err(|e| {
            warn!(garden = %garden_id, schedule = %schedule_id, status = %target, "schedule transition failed: {e}");
            e
        })?;

        info!(garden = %garden_id, schedule = %schedule_id, status = %target, "schedule transitioned");
        let record = updated.clone();
        self.apply(garden_id, &slot, move |rec| rec.upsert(record))
            .await;
        Ok(updated)
    }

    /// Apply an accepted mutation. Its sequence number is taken now, after
    /// the store committed it, so any refresh issued earlier is older.
    async fn apply(
        &self,
        garden_id: &str,
        slot: &Arc<GardenSlot>,
        f: impl FnOnce(&mut ScheduleRecords),
    ) {
        if !self.current(garden_id, slot).await {
            debug!(garden = %garden_id, "mutation landed after release, local state untouched");
            return;
        }
        let seq = self.seq.next();
        let mut rec = slot.records.write().await;
        f(&mut rec);
        rec.applied_seq = rec.applied_seq.max(seq);
        rec.recompute_upcoming(self.upcoming_limit, OffsetDateTime::now_utc());
    }
}

// ===========================================================================
// Tests
// ===========================================================================
