//! Front door to the external AI watering-decision service.
//!
//! The connection state is written by `test_connection` and nothing else.
//! A failed decision call reports its error to the caller but leaves the
//! state alone, so one slow request cannot flip the whole hub offline.
//!
//! ```text
//! disconnected ─┐                 ┌─▶ connected
//!               ├─▶ testing ──────┤
//! connected ────┘                 └─▶ disconnected
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{with_timeout, CoreResult};
use crate::model::{AiConnectionState, SensorSnapshot, WateringDecision};
use crate::seq::Sequencer;
use crate::sources::AiService;

pub struct AiGateway<G> {
    service: Arc<G>,
    timeout: Duration,
    state: watch::Sender<AiConnectionState>,
    probes: Sequencer,
    latest_probe: Mutex<u64>,
}

impl<G: AiService> AiGateway<G> {
    /// Starts `disconnected`; call `test_connection` to establish the state.
    pub fn new(service: Arc<G>, timeout: Duration) -> Self {
        let (state, _) = watch::channel(AiConnectionState::Disconnected);
        Self {
            service,
            timeout,
            state,
            probes: Sequencer::default(),
            latest_probe: Mutex::new(0),
        }
    }

    pub fn connection_state(&self) -> AiConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AiConnectionState> {
        self.state.subscribe()
    }

    /// Probe the service. When probes overlap only the most recently started
    /// one gets to write its result. A probe dropped before it settles puts
    /// back the state it found.
    pub async fn test_connection(&self) -> bool {
        let probe = self.probes.next();
        let previous = {
            let mut latest = self.latest_probe.lock().unwrap_or_else(|e| e.into_inner());
            *latest = probe;
            self.state.send_replace(AiConnectionState::Testing)
        };
        let mut guard = ProbeGuard {
            gateway: self,
            probe,
            previous,
            settled: false,
        };

        let healthy = match with_timeout(self.timeout, "ai ping", self.service.ping()).await {
            Ok(healthy) => healthy,
            Err(e) => {
                debug!(probe, "ai ping failed: {e}");
                false
            }
        };

        guard.settled = true;
        let latest = self.latest_probe.lock().unwrap_or_else(|e| e.into_inner());
        if *latest == probe {
            let next = if healthy {
                AiConnectionState::Connected
            } else {
                AiConnectionState::Disconnected
            };
            self.state.send_replace(next);
            info!(probe, state = ?next, "ai connection probed");
        } else {
            debug!(probe, latest = *latest, "superseded ai probe result dropped");
        }
        healthy
    }

    pub async fn get_decision(
        &self,
        garden_id: &str,
        snapshot: Option<&SensorSnapshot>,
    ) -> CoreResult<WateringDecision> {
        let mut decision = with_timeout(
            self.timeout,
            "ai decision",
            self.service.decide(garden_id, snapshot),
        )
        .await
        .map_err(|e| {
            warn!(garden = %garden_id, "ai decision failed: {e}");
            e
        })?;

        if !(0.0..=1.0).contains(&decision.confidence) {
            warn!(
                garden = %garden_id,
                confidence = decision.confidence,
                "ai confidence outside [0, 1], clamping"
            );
            decision.confidence = if decision.confidence.is_nan() {
                0.0
            } else {
                decision.confidence.clamp(0.0, 1.0)
            };
        }
        debug!(
            garden = %garden_id,
            decision = ?decision.decision,
            confidence = decision.confidence,
            "ai decision received"
        );
        Ok(decision)
    }

    /// `Ok(None)` when the service has no opinion for this slot.
    pub async fn get_optimal_amount(
        &self,
        garden_id: &str,
        time: OffsetDateTime,
        notes: Option<&str>,
    ) -> CoreResult<Option<f64>> {
        let amount = with_timeout(
            self.timeout,
            "ai optimal amount",
            self.service.optimal_amount(garden_id, time, notes),
        )
        .await?;

        Ok(match amount {
            Some(a) if a.is_finite() && a >= 0.0 => Some(a),
            Some(a) => {
                warn!(garden = %garden_id, amount = a, "ignoring unusable optimal amount");
                None
            }
            None => None,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

/// Restores the pre-probe state when `test_connection` is cancelled mid-ping.
struct ProbeGuard<'a, G> {
    gateway: &'a AiGateway<G>,
    probe: u64,
    previous: AiConnectionState,
    settled: bool,
}

impl<G> Drop for ProbeGuard<'_, G> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let latest = self
            .gateway
            .latest_probe
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if *latest != self.probe {
            return;
        }
        // An earlier probe still in flight has already lost the right to write.
        let restored = match self.previous {
            AiConnectionState::Testing => AiConnectionState::Disconnected,
            other => other,
        };
        self.gateway.state.send_replace(restored);
        debug!(probe = self.probe, state = ?restored, "ai probe abandoned, state restored");
    }
}
