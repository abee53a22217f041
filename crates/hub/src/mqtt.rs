//! MQTT telemetry intake. Garden nodes publish to `tele/<garden_id>/reading`;
//! the hub keeps the newest reading per sensor and serves it as a
//! `SensorSource`.

use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::model::{SensorReading, SensorType};
use crate::sources::SensorSource;

pub const TELEMETRY_FILTER: &str = "tele/+/reading";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct TelemetryReading {
    pub(crate) sensor_id: String,
    #[serde(rename = "type")]
    pub(crate) sensor_type: SensorType,
    pub(crate) value: f64,
    #[serde(default)]
    pub(crate) unit: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TelemetryMsg {
    /// Unix seconds.
    pub(crate) ts: i64,
    pub(crate) readings: Vec<TelemetryReading>,
}

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

/// Extract garden_id from "tele/<garden_id>/reading".
pub(crate) fn extract_garden_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "reading" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Latest-reading cache
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MqttSensorSource {
    connected: AtomicBool,
    /// garden_id -> qualified sensor_id -> newest reading
    latest: RwLock<HashMap<String, HashMap<String, SensorReading>>>,
}

impl MqttSensorSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if was != connected {
            info!(connected, "mqtt connection state changed");
        }
    }

    /// Store a telemetry batch. Sensor ids are qualified with the garden id
    /// so every node can name its channels "s1", "s2", ...
    pub(crate) fn record_telemetry(&self, garden_id: &str, msg: TelemetryMsg) -> usize {
        let observed_at = OffsetDateTime::from_unix_timestamp(msg.ts).unwrap_or_else(|_| {
            warn!(garden = %garden_id, ts = msg.ts, "telemetry ts out of range, using receive time");
            OffsetDateTime::now_utc()
        });

        let mut latest = self.latest.write().unwrap_or_else(|e| e.into_inner());
        let garden = latest.entry(garden_id.to_string()).or_default();
        let mut stored = 0;
        for r in msg.readings {
            if !r.value.is_finite() {
                continue;
            }
            let sensor_id = format!("{garden_id}/{}", r.sensor_id);
            if matches!(garden.get(&sensor_id), Some(prev) if prev.observed_at > observed_at) {
                debug!(sensor = %sensor_id, "older telemetry ignored");
                continue;
            }
            garden.insert(
                sensor_id.clone(),
                SensorReading {
                    sensor_id,
                    garden_id: garden_id.to_string(),
                    sensor_type: r.sensor_type,
                    value: r.value,
                    unit: r.unit,
                    observed_at,
                },
            );
            stored += 1;
        }
        stored
    }

    /// Route one incoming publish. Returns the number of readings stored.
    pub fn handle_publish(&self, topic: &str, payload: &[u8]) -> Result<usize, String> {
        let garden_id =
            extract_garden_id(topic).ok_or_else(|| format!("unhandled topic={topic}"))?;
        let msg: TelemetryMsg = serde_json::from_slice(payload)
            .map_err(|e| format!("bad telemetry json: {e} topic={topic}"))?;
        Ok(self.record_telemetry(garden_id, msg))
    }

    /// Drive the MQTT event loop forever. Subscribes on every (re)connect.
    pub async fn run(self: Arc<Self>, client: AsyncClient, mut eventloop: EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    match self.handle_publish(&p.topic, &p.payload) {
                        Ok(n) => debug!(topic = %p.topic, readings = n, "telemetry stored"),
                        Err(msg) => warn!("{msg}"),
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.set_connected(true);
                    if let Err(e) = client.try_subscribe(TELEMETRY_FILTER, QoS::AtLeastOnce) {
                        warn!("mqtt subscribe failed: {e}");
                    } else {
                        info!(filter = TELEMETRY_FILTER, "mqtt subscribed");
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.set_connected(false);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. reconnecting...");
                    self.set_connected(false);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }
}

impl SensorSource for MqttSensorSource {
    async fn latest_readings(&self, garden_id: &str) -> CoreResult<Vec<SensorReading>> {
        if !self.is_connected() {
            return Err(CoreError::upstream("mqtt broker not connected"));
        }
        let latest = self.latest.read().unwrap_or_else(|e| e.into_inner());
        Ok(latest
            .get(garden_id)
            .map(|g| g.values().cloned().collect())
            .unwrap_or_default())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- extract_garden_id --------------------------------------------------

    #[test]
    fn extract_garden_id_valid_topic() {
        assert_eq!(extract_garden_id("tele/backyard/reading"), Some("backyard"));
    }

    #[test]
    fn extract_garden_id_wrong_prefix() {
        assert_eq!(extract_garden_id("foo/backyard/reading"), None);
    }

    #[test]
    fn extract_garden_id_wrong_suffix() {
        assert_eq!(extract_garden_id("tele/backyard/status"), None);
    }

    #[test]
    fn extract_garden_id_wrong_segment_count() {
        assert_eq!(extract_garden_id("tele/reading"), None);
        assert_eq!(extract_garden_id("tele/backyard/sub/reading"), None);
        assert_eq!(extract_garden_id("tele//reading"), None);
        assert_eq!(extract_garden_id(""), None);
    }

    // -- TelemetryMsg deserialization ---------------------------------------

    #[test]
    fn telemetry_deserialize_valid() {
        let json = r#"{"ts":1700000000,"readings":[
            {"sensor_id":"s1","type":"SOIL_MOISTURE","value":42.5,"unit":"%"},
            {"sensor_id":"s2","type":"TEMPERATURE","value":21.0}
        ]}"#;
        let msg: TelemetryMsg = serde_json::from_str(json).unwrap();
        assert_eq!(msg.ts, 1700000000);
        assert_eq!(msg.readings.len(), 2);
        assert_eq!(msg.readings[0].sensor_type, SensorType::SoilMoisture);
        assert_eq!(msg.readings[1].unit, "");
    }

    #[test]
    fn telemetry_unknown_type_is_kept_as_unknown() {
        let json = r#"{"ts":1,"readings":[{"sensor_id":"s1","type":"CO2","value":400}]}"#;
        let msg: TelemetryMsg = serde_json::from_str(json).unwrap();
        assert_eq!(msg.readings[0].sensor_type, SensorType::Unknown);
    }

    #[test]
    fn telemetry_missing_field_fails() {
        assert!(serde_json::from_str::<TelemetryMsg>(r#"{"ts":1}"#).is_err());
    }

    // -- Cache --------------------------------------------------------------

    fn connected() -> MqttSensorSource {
        let src = MqttSensorSource::new();
        src.set_connected(true);
        src
    }

    #[tokio::test]
    async fn publish_is_cached_under_qualified_ids() {
        let src = connected();
        let n = src
            .handle_publish(
                "tele/g1/reading",
                br#"{"ts":1700000000,"readings":[{"sensor_id":"s1","type":"HUMIDITY","value":55}]}"#,
            )
            .unwrap();
        assert_eq!(n, 1);

        let readings = src.latest_readings("g1").await.unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].sensor_id, "g1/s1");
        assert_eq!(readings[0].garden_id, "g1");
        assert_eq!(readings[0].observed_at.unix_timestamp(), 1700000000);
        assert!(src.latest_readings("g2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn newer_reading_replaces_older_and_not_the_reverse() {
        let src = connected();
        src.handle_publish(
            "tele/g1/reading",
            br#"{"ts":200,"readings":[{"sensor_id":"s1","type":"HUMIDITY","value":60}]}"#,
        )
        .unwrap();
        src.handle_publish(
            "tele/g1/reading",
            br#"{"ts":100,"readings":[{"sensor_id":"s1","type":"HUMIDITY","value":10}]}"#,
        )
        .unwrap();

        let readings = src.latest_readings("g1").await.unwrap();
        assert_eq!(readings[0].value, 60.0);
    }

    #[tokio::test]
    async fn disconnected_broker_is_upstream_unavailable() {
        let src = MqttSensorSource::new();
        assert!(matches!(
            src.latest_readings("g1").await,
            Err(CoreError::UpstreamUnavailable(_))
        ));
    }

    #[test]
    fn bad_payload_and_topic_are_reported() {
        let src = connected();
        assert!(src
            .handle_publish("tele/g1/reading", b"not json")
            .unwrap_err()
            .contains("bad telemetry json"));
        assert!(src
            .handle_publish("valve/z1/set", b"ON")
            .unwrap_err()
            .contains("unhandled topic"));
    }
}
