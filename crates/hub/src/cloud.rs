//! HTTP client for the cloud side: the alert service and the AI
//! watering-decision service share one base URL and bearer token.

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::model::{Alert, AlertStatus, SensorSnapshot, WateringDecision};
use crate::sources::{AiService, AlertSource};

pub const CLIENT_USER_AGENT: &str = concat!("garden-hub/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct StatusUpdate {
    status: AlertStatus,
}

#[derive(Debug, Serialize)]
struct DecisionRequest<'a> {
    garden_id: &'a str,
    sensor_snapshot: Option<&'a SensorSnapshot>,
}

#[derive(Debug, Serialize)]
struct OptimalAmountRequest<'a> {
    garden_id: &'a str,
    #[serde(with = "time::serde::rfc3339")]
    time: OffsetDateTime,
    notes: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
struct OptimalAmountResponse {
    #[serde(default)]
    amount: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default = "default_healthy")]
    healthy: bool,
}

fn default_healthy() -> bool {
    true
}

/// Map a non-success response to the error taxonomy.
fn status_error(status: StatusCode, what: &str, body: &str) -> CoreError {
    let detail = if body.trim().is_empty() {
        format!("{what}: HTTP {status}")
    } else {
        format!("{what}: HTTP {status}: {}", body.trim())
    };
    match status {
        StatusCode::NOT_FOUND => CoreError::NotFound {
            kind: "resource",
            id: what.to_string(),
        },
        StatusCode::CONFLICT => CoreError::Conflict(detail),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            CoreError::Validation(detail)
        }
        _ => CoreError::UpstreamUnavailable(detail),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CloudClient {
    client: Client,
    base_url: String,
}

impl CloudClient {
    pub fn new(base_url: &str, api_token: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));
        if let Some(token) = api_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("api token is not a valid header value")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        let client = Client::builder()
            .use_rustls_tls()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
    }

    async fn send(&self, rb: RequestBuilder, what: &str) -> CoreResult<reqwest::Response> {
        let response = rb
            .send()
            .await
            .map_err(|e| CoreError::upstream(format!("{what}: {e}")))?;
        let status = response.status();
        if status.is_success() {
            debug!(what, %status, "cloud call ok");
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, what, &body))
    }

    async fn send_json<R: DeserializeOwned>(&self, rb: RequestBuilder, what: &str) -> CoreResult<R> {
        self.send(rb, what)
            .await?
            .json()
            .await
            .map_err(|e| CoreError::upstream(format!("{what}: malformed response: {e}")))
    }
}

impl AlertSource for CloudClient {
    async fn list_alerts(&self, garden_id: &str) -> CoreResult<Vec<Alert>> {
        let what = format!("alerts of garden {garden_id}");
        self.send_json(
            self.request(Method::GET, &format!("/gardens/{garden_id}/alerts")),
            &what,
        )
        .await
    }

    async fn update_alert_status(&self, alert_id: &str, status: AlertStatus) -> CoreResult<()> {
        let what = format!("alert {alert_id}");
        self.send(
            self.request(Method::PATCH, &format!("/alerts/{alert_id}"))
                .json(&StatusUpdate { status }),
            &what,
        )
        .await?;
        Ok(())
    }
}

impl AiService for CloudClient {
    async fn decide(
        &self,
        garden_id: &str,
        snapshot: Option<&SensorSnapshot>,
    ) -> CoreResult<WateringDecision> {
        self.send_json(
            self.request(Method::POST, "/ai/decision").json(&DecisionRequest {
                garden_id,
                sensor_snapshot: snapshot,
            }),
            "ai decision",
        )
        .await
    }

    async fn ping(&self) -> CoreResult<bool> {
        let response = self
            .request(Method::GET, "/ai/health")
            .send()
            .await
            .map_err(|e| CoreError::upstream(format!("ai health: {e}")))?;
        if !response.status().is_success() {
            debug!(status = %response.status(), "ai health check unhealthy");
            return Ok(false);
        }
        // An empty 200 counts as healthy.
        let body = response.text().await.unwrap_or_default();
        if body.trim().is_empty() {
            return Ok(true);
        }
        Ok(serde_json::from_str::<HealthResponse>(&body)
            .map(|h| h.healthy)
            .unwrap_or(true))
    }

    async fn optimal_amount(
        &self,
        garden_id: &str,
        time: OffsetDateTime,
        notes: Option<&str>,
    ) -> CoreResult<Option<f64>> {
        let res: OptimalAmountResponse = self
            .send_json(
                self.request(Method::POST, "/ai/optimal-amount")
                    .json(&OptimalAmountRequest {
                        garden_id,
                        time,
                        notes,
                    }),
                "ai optimal amount",
            )
            .await?;
        Ok(res.amount)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::fixtures::alert;
    use crate::model::{Decision, Severity};
    use axum::extract::Path;
    use axum::http::HeaderMap as AxumHeaders;
    use axum::routing::{get, patch, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};

    const TOKEN: &str = "t0k";

    fn authorised(headers: &AxumHeaders) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("Bearer {TOKEN}"))
    }

    fn fake_cloud() -> Router {
        Router::new()
            .route(
                "/gardens/{id}/alerts",
                get(|Path(id): Path<String>| async move {
                    if id == "missing" {
                        return Err(StatusCode::NOT_FOUND);
                    }
                    Ok(Json(vec![alert("a1", &id, Severity::High, AlertStatus::Pending, 3)]))
                }),
            )
            .route(
                "/alerts/{id}",
                patch(
                    |headers: AxumHeaders, Path(id): Path<String>, Json(body): Json<Value>| async move {
                        if !authorised(&headers) {
                            return StatusCode::UNAUTHORIZED;
                        }
                        match (id.as_str(), body["status"].as_str()) {
                            ("a1", Some("RESOLVED")) => StatusCode::NO_CONTENT,
                            ("done", _) => StatusCode::CONFLICT,
                            _ => StatusCode::NOT_FOUND,
                        }
                    },
                ),
            )
            .route(
                "/ai/decision",
                post(|Json(body): Json<Value>| async move {
                    if body["garden_id"] == "bad" {
                        return Err((StatusCode::UNPROCESSABLE_ENTITY, "unknown garden"));
                    }
                    Ok(Json(json!({
                        "decision": "no_water",
                        "confidence": 0.7,
                        "reasons": ["rain expected"],
                        "recommended_amount": 0.0,
                        "sensor_snapshot": body["sensor_snapshot"],
                        "timestamp": "2030-06-01T06:00:00Z"
                    })))
                }),
            )
            .route("/ai/health", get(|| async { Json(json!({ "healthy": true })) }))
            .route(
                "/ai/optimal-amount",
                post(|Json(body): Json<Value>| async move {
                    let amount = if body["notes"] == "none" { Value::Null } else { json!(3.0) };
                    Json(json!({ "amount": amount }))
                }),
            )
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn client() -> CloudClient {
        let base = serve(fake_cloud()).await;
        CloudClient::new(&base, Some(TOKEN), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn lists_alerts_for_garden() {
        let c = client().await;
        let alerts = c.list_alerts("g1").await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].garden_id.as_deref(), Some("g1"));
        assert_eq!(alerts[0].severity, Severity::High);
    }

    #[tokio::test]
    async fn maps_http_status_to_error_kinds() {
        let c = client().await;
        assert!(matches!(
            c.list_alerts("missing").await,
            Err(CoreError::NotFound { .. })
        ));
        assert!(matches!(
            c.update_alert_status("done", AlertStatus::Resolved).await,
            Err(CoreError::Conflict(_))
        ));
        assert!(matches!(
            c.decide("bad", None).await,
            Err(CoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn sends_bearer_token() {
        let c = client().await;
        c.update_alert_status("a1", AlertStatus::Resolved)
            .await
            .unwrap();

        let base = serve(fake_cloud()).await;
        let anonymous = CloudClient::new(&base, None, Duration::from_secs(5)).unwrap();
        let err = anonymous
            .update_alert_status("a1", AlertStatus::Resolved)
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "401 should read as upstream, got {err:?}");
    }

    #[tokio::test]
    async fn decision_round_trips_snapshot() {
        let c = client().await;
        let snap = SensorSnapshot {
            values: [(crate::model::SensorType::SoilMoisture, 31.0)].into_iter().collect(),
            taken_at: time::macros::datetime!(2030-06-01 05:59:00 UTC),
        };
        let d = c.decide("g1", Some(&snap)).await.unwrap();
        assert_eq!(d.decision, Decision::NoWater);
        assert_eq!(d.reasons, vec!["rain expected"]);
        assert_eq!(d.sensor_snapshot, Some(snap));
    }

    #[tokio::test]
    async fn health_and_optimal_amount() {
        let c = client().await;
        assert!(c.ping().await.unwrap());

        let now = OffsetDateTime::now_utc();
        assert_eq!(c.optimal_amount("g1", now, None).await, Ok(Some(3.0)));
        assert_eq!(c.optimal_amount("g1", now, Some("none")).await, Ok(None));
    }

    #[tokio::test]
    async fn unreachable_cloud_is_upstream_unavailable() {
        let addr = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let c = CloudClient::new(&format!("http://{addr}"), None, Duration::from_secs(2)).unwrap();
        assert!(matches!(
            c.list_alerts("g1").await,
            Err(CoreError::UpstreamUnavailable(_))
        ));
        assert!(c.ping().await.is_err());
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, "x", ""),
            CoreError::Validation(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, "x", "oops"),
            CoreError::UpstreamUnavailable(m) if m.contains("oops")
        ));
    }
}
