//! Periodic sensor polling for one garden at a time.
//!
//! ```text
//! start(g) ──▶ ticker ──▶ refresh() ──┬─ no fetch in flight ─▶ spawn fetch(epoch)
//!                                     └─ fetch in flight ────▶ await same result
//! stop()  ──▶ abort ticker, epoch += 1 (late fetch results are discarded)
//! ```
//!
//! A failed fetch leaves the previous readings in place and sets `error`;
//! the ticker keeps running.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::classifier::classify;
use crate::error::{with_timeout, CoreError, CoreResult};
use crate::model::{SensorReading, SensorSnapshot, SensorStatus, SensorType};
use crate::sources::SensorSource;

type FetchOutcome = Option<CoreResult<()>>;

// ---------------------------------------------------------------------------
// Display records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorRecord {
    pub sensor_id: String,
    pub sensor_type: SensorType,
    pub value: f64,
    pub unit: String,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
    pub status: SensorStatus,
}

impl From<SensorReading> for SensorRecord {
    fn from(r: SensorReading) -> Self {
        Self {
            status: classify(r.sensor_type, r.value),
            sensor_id: r.sensor_id,
            sensor_type: r.sensor_type,
            value: r.value,
            unit: r.unit,
            observed_at: r.observed_at,
        }
    }
}

/// What the UI sees: the last successful reading set plus freshness markers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SensorView {
    pub garden_id: Option<String>,
    pub records: Vec<SensorRecord>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
    pub error: Option<String>,
}

impl SensorView {
    fn for_garden(garden_id: &str) -> Self {
        Self {
            garden_id: Some(garden_id.to_string()),
            ..Self::default()
        }
    }

    /// Keep only the newest reading per sensor, classify each one.
    fn apply(&mut self, readings: Vec<SensorReading>, at: OffsetDateTime) {
        let mut latest: HashMap<String, SensorReading> = HashMap::new();
        for r in readings {
            match latest.get(&r.sensor_id) {
                Some(prev) if prev.observed_at >= r.observed_at => {}
                _ => {
                    latest.insert(r.sensor_id.clone(), r);
                }
            }
        }
        let mut records: Vec<SensorRecord> = latest.into_values().map(SensorRecord::from).collect();
        records.sort_by(|a, b| {
            a.sensor_type
                .cmp(&b.sensor_type)
                .then_with(|| a.sensor_id.cmp(&b.sensor_id))
        });

        self.records = records;
        self.last_updated = Some(at);
        self.error = None;
    }

    /// Showing data that an error has since failed to refresh.
    pub fn is_stale(&self) -> bool {
        self.error.is_some() && self.last_updated.is_some()
    }

    /// Worst status per sensor type.
    pub fn status_by_type(&self) -> BTreeMap<SensorType, SensorStatus> {
        let mut out = BTreeMap::new();
        for r in &self.records {
            let entry = out.entry(r.sensor_type).or_insert(r.status);
            if r.status > *entry {
                *entry = r.status;
            }
        }
        out
    }

    /// Newest value per sensor type, `None` before the first successful fetch.
    pub fn snapshot(&self) -> Option<SensorSnapshot> {
        let taken_at = self.last_updated?;
        let mut newest: BTreeMap<SensorType, &SensorRecord> = BTreeMap::new();
        for r in &self.records {
            match newest.get(&r.sensor_type) {
                Some(prev) if prev.observed_at >= r.observed_at => {}
                _ => {
                    newest.insert(r.sensor_type, r);
                }
            }
        }
        Some(SensorSnapshot {
            values: newest.into_iter().map(|(t, r)| (t, r.value)).collect(),
            taken_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PollState {
    garden_id: Option<String>,
    epoch: u64,
    inflight: Option<watch::Receiver<FetchOutcome>>,
}

struct PollerInner<S> {
    source: Arc<S>,
    timeout: Duration,
    state: Mutex<PollState>,
    view: RwLock<SensorView>,
}

pub struct SensorPoller<S: SensorSource> {
    inner: Arc<PollerInner<S>>,
    interval: Duration,
    ticker: StdMutex<Option<JoinHandle<()>>>,
}

impl<S: SensorSource> SensorPoller<S> {
    pub fn new(source: Arc<S>, interval: Duration, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                source,
                timeout,
                state: Mutex::new(PollState::default()),
                view: RwLock::new(SensorView::default()),
            }),
            interval,
            ticker: StdMutex::new(None),
        }
    }

    /// Begin polling `garden_id`. Any loop for a previous garden is torn
    /// down first.
    pub async fn start(&self, garden_id: &str) {
        self.stop().await;
        {
            let mut st = self.inner.state.lock().await;
            st.garden_id = Some(garden_id.to_string());
            *self.inner.view.write().await = SensorView::for_garden(garden_id);
        }

        let inner = Arc::clone(&self.inner);
        let interval = self.interval;
        let garden = garden_id.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = inner.refresh().await {
                    debug!(garden = %garden, "poll tick failed: {e}");
                }
            }
        });
        if let Some(old) = self.lock_ticker().replace(handle) {
            old.abort();
        }
        info!(garden = %garden_id, interval_ms = self.interval.as_millis() as u64, "sensor polling started");
    }

    /// Cancel the ticker and mark any in-flight fetch as discardable.
    pub async fn stop(&self) {
        if let Some(handle) = self.lock_ticker().take() {
            handle.abort();
        }
        let mut st = self.inner.state.lock().await;
        if let Some(garden) = st.garden_id.take() {
            info!(garden = %garden, "sensor polling stopped");
        }
        st.epoch += 1;
        st.inflight = None;
    }

    pub fn is_running(&self) -> bool {
        self.lock_ticker().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Fetch now, sharing the result of a fetch that is already in flight.
    pub async fn refresh(&self) -> CoreResult<()> {
        self.inner.refresh().await
    }

    pub async fn view(&self) -> SensorView {
        self.inner.view.read().await.clone()
    }

    fn lock_ticker(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.ticker.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<S: SensorSource> Drop for SensorPoller<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_ticker().take() {
            handle.abort();
        }
    }
}

impl<S: SensorSource> PollerInner<S> {
    async fn refresh(self: &Arc<Self>) -> CoreResult<()> {
        let mut rx = {
            let mut st = self.state.lock().await;
            let Some(garden_id) = st.garden_id.clone() else {
                return Err(CoreError::Validation("sensor poller is not running".into()));
            };
            match &st.inflight {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    st.inflight = Some(rx.clone());
                    let epoch = st.epoch;
                    let inner = Arc::clone(self);
                    tokio::spawn(async move { inner.fetch(garden_id, epoch, tx).await });
                    rx
                }
            }
        };

        let res = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone().unwrap_or(Ok(())),
            Err(_) => Err(CoreError::upstream("sensor fetch abandoned")),
        };
        res
    }

    async fn fetch(&self, garden_id: String, epoch: u64, tx: watch::Sender<FetchOutcome>) {
        let res = with_timeout(
            self.timeout,
            "sensor fetch",
            self.source.latest_readings(&garden_id),
        )
        .await;

        let outcome = {
            let mut st = self.state.lock().await;
            if st.epoch != epoch {
                debug!(garden = %garden_id, "discarding sensor fetch from torn-down poll loop");
                res.map(|_| ())
            } else {
                st.inflight = None;
                let mut view = self.view.write().await;
                match res {
                    Ok(readings) => {
                        debug!(garden = %garden_id, readings = readings.len(), "sensor readings updated");
                        view.apply(readings, OffsetDateTime::now_utc());
                        Ok(())
                    }
                    Err(e) => {
                        warn!(garden = %garden_id, "sensor fetch failed, keeping last readings: {e}");
                        view.error = Some(e.to_string());
                        Err(e)
                    }
                }
            }
        };
        tx.send_replace(Some(outcome));
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::fixtures::reading;
    use crate::memory::MemoryBackend;

    const LONG: Duration = Duration::from_secs(3600);
    const TIMEOUT: Duration = Duration::from_secs(2);

    fn seeded() -> Arc<MemoryBackend> {
        let mem = Arc::new(MemoryBackend::new());
        mem.set_readings(
            "g1",
            vec![
                reading("g1", "g1/soil", SensorType::SoilMoisture, 14.0),
                reading("g1", "g1/temp", SensorType::Temperature, 22.0),
            ],
        );
        mem.set_readings(
            "g2",
            vec![reading("g2", "g2/soil", SensorType::SoilMoisture, 50.0)],
        );
        mem
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    // -- View mapping -------------------------------------------------------

    #[test]
    fn apply_keeps_newest_reading_per_sensor() {
        let mut old = reading("g1", "s1", SensorType::Humidity, 10.0);
        old.observed_at -= time::Duration::minutes(5);
        let new = reading("g1", "s1", SensorType::Humidity, 60.0);

        let mut view = SensorView::for_garden("g1");
        view.apply(vec![new, old], OffsetDateTime::now_utc());

        assert_eq!(view.records.len(), 1);
        assert_eq!(view.records[0].value, 60.0);
        assert_eq!(view.records[0].status, SensorStatus::Normal);
    }

    #[test]
    fn status_by_type_reports_worst_sensor() {
        let mut view = SensorView::for_garden("g1");
        view.apply(
            vec![
                reading("g1", "a", SensorType::SoilMoisture, 50.0),
                reading("g1", "b", SensorType::SoilMoisture, 10.0),
                reading("g1", "c", SensorType::Humidity, 85.0),
            ],
            OffsetDateTime::now_utc(),
        );
        let statuses = view.status_by_type();
        assert_eq!(statuses[&SensorType::SoilMoisture], SensorStatus::Critical);
        assert_eq!(statuses[&SensorType::Humidity], SensorStatus::Warning);
    }

    #[test]
    fn snapshot_is_none_before_first_fetch() {
        assert!(SensorView::for_garden("g1").snapshot().is_none());
    }

    // -- Lifecycle ----------------------------------------------------------

    #[tokio::test]
    async fn start_fetches_immediately_and_classifies() {
        let mem = seeded();
        let poller = SensorPoller::new(Arc::clone(&mem), LONG, TIMEOUT);
        poller.start("g1").await;
        settle().await;

        let view = poller.view().await;
        assert_eq!(view.garden_id.as_deref(), Some("g1"));
        assert_eq!(view.records.len(), 2);
        assert!(view.last_updated.is_some());
        assert_eq!(
            view.status_by_type()[&SensorType::SoilMoisture],
            SensorStatus::Critical
        );
        let snap = view.snapshot().unwrap();
        assert_eq!(snap.values[&SensorType::Temperature], 22.0);
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_fetch() {
        let mem = seeded();
        mem.set_sensor_delay(Some(Duration::from_millis(100)));
        let poller = SensorPoller::new(Arc::clone(&mem), LONG, TIMEOUT);
        poller.start("g1").await;
        settle().await; // first tick's fetch is now in flight

        let (a, b) = tokio::join!(poller.refresh(), poller.refresh());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(mem.sensor_fetches(), 1);
    }

    #[tokio::test]
    async fn refresh_after_completion_fetches_again() {
        let mem = seeded();
        let poller = SensorPoller::new(Arc::clone(&mem), LONG, TIMEOUT);
        poller.start("g1").await;
        settle().await;

        poller.refresh().await.unwrap();
        assert_eq!(mem.sensor_fetches(), 2);
    }

    #[tokio::test]
    async fn failed_fetch_keeps_stale_readings_visible() {
        let mem = seeded();
        let poller = SensorPoller::new(Arc::clone(&mem), LONG, TIMEOUT);
        poller.start("g1").await;
        settle().await;
        let before = poller.view().await;

        mem.fail_sensors(true);
        let err = poller.refresh().await.unwrap_err();
        assert!(err.is_retryable());

        let after = poller.view().await;
        assert_eq!(after.records, before.records);
        assert_eq!(after.last_updated, before.last_updated);
        assert!(after.error.is_some());
        assert!(after.is_stale());
    }

    #[tokio::test]
    async fn slow_fetch_times_out_as_upstream_unavailable() {
        let mem = seeded();
        mem.set_sensor_delay(Some(Duration::from_millis(300)));
        let poller = SensorPoller::new(Arc::clone(&mem), LONG, Duration::from_millis(50));
        poller.start("g1").await;

        let err = poller.refresh().await.unwrap_err();
        assert!(matches!(err, CoreError::UpstreamUnavailable(_)));
        assert!(poller.view().await.error.is_some());
    }

    #[tokio::test]
    async fn polling_survives_failures_and_recovers() {
        let mem = seeded();
        mem.fail_sensors(true);
        let poller = SensorPoller::new(Arc::clone(&mem), Duration::from_millis(20), TIMEOUT);
        poller.start("g1").await;
        tokio::time::sleep(Duration::from_millis(110)).await;

        assert!(mem.sensor_fetches() >= 2);
        assert!(poller.is_running());
        assert!(poller.view().await.error.is_some());

        mem.fail_sensors(false);
        tokio::time::sleep(Duration::from_millis(80)).await;
        let view = poller.view().await;
        assert!(view.error.is_none());
        assert_eq!(view.records.len(), 2);
    }

    #[tokio::test]
    async fn switching_gardens_discards_old_in_flight_fetch() {
        let mem = seeded();
        mem.set_sensor_delay(Some(Duration::from_millis(80)));
        let poller = SensorPoller::new(Arc::clone(&mem), LONG, TIMEOUT);
        poller.start("g1").await;
        settle().await; // g1 fetch in flight

        mem.set_sensor_delay(None);
        poller.start("g2").await;
        tokio::time::sleep(Duration::from_millis(150)).await; // g1 fetch has landed

        let view = poller.view().await;
        assert_eq!(view.garden_id.as_deref(), Some("g2"));
        assert_eq!(view.records.len(), 1);
        assert!(view.records.iter().all(|r| r.sensor_id.starts_with("g2/")));
    }

    #[tokio::test]
    async fn stop_cancels_ticker_and_refresh_is_rejected() {
        let mem = seeded();
        let poller = SensorPoller::new(Arc::clone(&mem), Duration::from_millis(20), TIMEOUT);
        poller.start("g1").await;
        settle().await;
        poller.stop().await;
        let fetched = mem.sensor_fetches();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(mem.sensor_fetches(), fetched);
        assert!(!poller.is_running());
        assert!(matches!(
            poller.refresh().await,
            Err(CoreError::Validation(_))
        ));
    }
}
