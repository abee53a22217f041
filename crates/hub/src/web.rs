use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::coordinator::{GardenDataCoordinator, GardenRegistry};
use crate::error::CoreError;
use crate::sources::Backend;

type AppState<B> = Arc<GardenRegistry<B>>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.0.to_string();
        let (status, body) = match &self.0 {
            CoreError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "validation", "message": message }),
            ),
            CoreError::NotFound { .. } => (
                StatusCode::NOT_FOUND,
                json!({ "error": "not_found", "message": message }),
            ),
            CoreError::Conflict(_) => (
                StatusCode::CONFLICT,
                json!({ "error": "conflict", "message": message }),
            ),
            CoreError::UpstreamUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "upstream_unavailable", "message": message, "retryable": true }),
            ),
            CoreError::RecommendationUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "error": "recommendation_unavailable",
                    "message": message,
                    "fallback": "manual"
                }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router<B: Backend>(registry: AppState<B>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/gardens", get(list_gardens::<B>))
        .route(
            "/api/gardens/{garden_id}",
            get(garden_snapshot::<B>)
                .put(open_garden::<B>)
                .delete(close_garden::<B>),
        )
        .route("/api/gardens/{garden_id}/refresh", post(refresh_garden::<B>))
        .route("/api/gardens/{garden_id}/schedules", post(create_schedule::<B>))
        .route(
            "/api/gardens/{garden_id}/schedules/auto",
            post(auto_schedule::<B>),
        )
        .route(
            "/api/gardens/{garden_id}/schedules/{schedule_id}",
            delete(delete_schedule::<B>),
        )
        .route(
            "/api/gardens/{garden_id}/schedules/{schedule_id}/complete",
            post(complete_schedule::<B>),
        )
        .route(
            "/api/gardens/{garden_id}/schedules/{schedule_id}/skip",
            post(skip_schedule::<B>),
        )
        .route(
            "/api/gardens/{garden_id}/schedules/{schedule_id}/cancel",
            post(cancel_schedule::<B>),
        )
        .route(
            "/api/gardens/{garden_id}/alerts/{alert_id}/resolve",
            post(resolve_alert::<B>),
        )
        .route(
            "/api/gardens/{garden_id}/alerts/{alert_id}/ignore",
            post(ignore_alert::<B>),
        )
        .route("/api/ai/status", get(ai_status::<B>))
        .route("/api/ai/test", post(ai_test::<B>))
        .with_state(registry)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn list_gardens<B: Backend>(State(reg): State<AppState<B>>) -> impl IntoResponse {
    Json(reg.garden_ids().await)
}

// -- Gardens ----------------------------------------------------------------

/// Gardens are opened from config or by `PUT`; every other route needs one
/// that is already open.
async fn open_or_404<B: Backend>(
    reg: &GardenRegistry<B>,
    garden_id: &str,
) -> ApiResult<Arc<GardenDataCoordinator<B>>> {
    reg.get(garden_id)
        .await
        .ok_or_else(|| CoreError::not_found("garden", garden_id).into())
}

async fn open_garden<B: Backend>(
    State(reg): State<AppState<B>>,
    Path(garden_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let garden = reg.get_or_open(&garden_id).await?;
    Ok(Json(garden.snapshot().await))
}

async fn garden_snapshot<B: Backend>(
    State(reg): State<AppState<B>>,
    Path(garden_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let garden = open_or_404(&reg, &garden_id).await?;
    Ok(Json(garden.snapshot().await))
}

async fn refresh_garden<B: Backend>(
    State(reg): State<AppState<B>>,
    Path(garden_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let garden = open_or_404(&reg, &garden_id).await?;
    Ok(Json(garden.refresh_all().await))
}

async fn close_garden<B: Backend>(
    State(reg): State<AppState<B>>,
    Path(garden_id): Path<String>,
) -> ApiResult<StatusCode> {
    reg.close(&garden_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Schedules --------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateScheduleBody {
    pub scheduled_at: String,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

async fn create_schedule<B: Backend>(
    State(reg): State<AppState<B>>,
    Path(garden_id): Path<String>,
    Json(body): Json<CreateScheduleBody>,
) -> ApiResult<impl IntoResponse> {
    let garden = open_or_404(&reg, &garden_id).await?;
    let schedule = garden
        .create_schedule(&body.scheduled_at, body.amount, body.notes)
        .await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

async fn auto_schedule<B: Backend>(
    State(reg): State<AppState<B>>,
    Path(garden_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let garden = open_or_404(&reg, &garden_id).await?;
    let auto = garden.auto_schedule().await?;
    let status = if auto.schedule.is_some() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(auto)))
}

async fn complete_schedule<B: Backend>(
    State(reg): State<AppState<B>>,
    Path((garden_id, schedule_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let garden = open_or_404(&reg, &garden_id).await?;
    Ok(Json(garden.complete_schedule(&schedule_id).await?))
}

async fn skip_schedule<B: Backend>(
    State(reg): State<AppState<B>>,
    Path((garden_id, schedule_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let garden = open_or_404(&reg, &garden_id).await?;
    Ok(Json(garden.skip_schedule(&schedule_id).await?))
}

async fn cancel_schedule<B: Backend>(
    State(reg): State<AppState<B>>,
    Path((garden_id, schedule_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let garden = open_or_404(&reg, &garden_id).await?;
    Ok(Json(garden.cancel_schedule(&schedule_id).await?))
}

async fn delete_schedule<B: Backend>(
    State(reg): State<AppState<B>>,
    Path((garden_id, schedule_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let garden = open_or_404(&reg, &garden_id).await?;
    garden.delete_schedule(&schedule_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Alerts -----------------------------------------------------------------

async fn resolve_alert<B: Backend>(
    State(reg): State<AppState<B>>,
    Path((garden_id, alert_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let garden = open_or_404(&reg, &garden_id).await?;
    Ok(Json(garden.resolve_alert(&alert_id).await?))
}

async fn ignore_alert<B: Backend>(
    State(reg): State<AppState<B>>,
    Path((garden_id, alert_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let garden = open_or_404(&reg, &garden_id).await?;
    Ok(Json(garden.ignore_alert(&alert_id).await?))
}

// -- AI ---------------------------------------------------------------------

async fn ai_status<B: Backend>(State(reg): State<AppState<B>>) -> impl IntoResponse {
    Json(json!({ "state": reg.gateway().connection_state() }))
}

async fn ai_test<B: Backend>(State(reg): State<AppState<B>>) -> impl IntoResponse {
    let connected = reg.gateway().test_connection().await;
    Json(json!({
        "connected": connected,
        "state": reg.gateway().connection_state()
    }))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve<B: Backend>(registry: AppState<B>, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "web api listening");

    axum::serve(listener, router(registry))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{GardenServices, Tuning};
    use crate::memory::fixtures::{alert, schedule};
    use crate::memory::MemoryBackend;
    use crate::model::{AlertStatus, ScheduleStatus, Severity};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Router over a registry with garden "g1" already open.
    async fn app() -> (Arc<MemoryBackend>, Router) {
        let mem = Arc::new(MemoryBackend::new());
        let tuning = Tuning {
            poll_interval: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(2),
            upcoming_limit: 5,
        };
        let services = GardenServices::<MemoryBackend>::new(
            Arc::clone(&mem),
            Arc::clone(&mem),
            Arc::clone(&mem),
            Arc::clone(&mem),
            tuning,
        );
        let registry = Arc::new(GardenRegistry::new(services));
        registry.get_or_open("g1").await.unwrap();
        (mem, router(registry))
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let res = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn health_ok() {
        let (_mem, app) = app().await;
        let (status, body) = call(&app, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn snapshot_of_open_garden() {
        let (_mem, app) = app().await;
        let (status, body) = call(&app, Method::GET, "/api/gardens/g1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["garden_id"], "g1");
        assert_eq!(body["ai_state"], "disconnected");
        assert_eq!(body["polling"], true);
    }

    #[tokio::test]
    async fn unknown_gardens_are_not_opened_implicitly() {
        let (mem, app) = app().await;
        let (status, body) = call(&app, Method::GET, "/api/gardens/typo", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/gardens/typo/schedules",
            Some(serde_json::json!({ "scheduled_at": "2031-01-01T06:00:00Z" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, Method::POST, "/api/gardens/typo/refresh", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) =
            call(&app, Method::POST, "/api/gardens/typo/alerts/a1/resolve", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        assert_eq!(mem.schedule_creates(), 0);
        let (_, ids) = call(&app, Method::GET, "/api/gardens", None).await;
        assert_eq!(ids, serde_json::json!(["g1"]));
    }

    #[tokio::test]
    async fn put_opens_a_garden() {
        let (_mem, app) = app().await;
        let (status, body) = call(&app, Method::PUT, "/api/gardens/g2", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["garden_id"], "g2");

        let (_, mut ids) = call(&app, Method::GET, "/api/gardens", None).await;
        let ids = ids.as_array_mut().unwrap();
        ids.sort_by_key(|v| v.as_str().map(str::to_string));
        assert_eq!(*ids, vec![serde_json::json!("g1"), serde_json::json!("g2")]);
    }

    #[tokio::test]
    async fn invalid_garden_id_is_bad_request() {
        let (_mem, app) = app().await;
        let (status, body) = call(&app, Method::PUT, "/api/gardens/a%2Bb", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation");
    }

    #[tokio::test]
    async fn refresh_reports_each_component() {
        let (mem, app) = app().await;
        mem.fail_alert_reads(true);
        let (status, body) = call(&app, Method::POST, "/api/gardens/g1/refresh", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["schedules"]["outcome"], "applied");
        assert_eq!(body["alerts"]["outcome"], "failed");
        assert_eq!(body["decision"]["outcome"], "skipped");
    }

    #[tokio::test]
    async fn schedule_lifecycle_over_http() {
        let (_mem, app) = app().await;
        let (status, created) = call(
            &app,
            Method::POST,
            "/api/gardens/g1/schedules",
            Some(serde_json::json!({ "scheduled_at": "2031-01-01T06:00:00Z", "amount": 2.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "PENDING");
        let id = created["id"].as_str().unwrap().to_string();

        let uri = format!("/api/gardens/g1/schedules/{id}/complete");
        let (status, body) = call(&app, Method::POST, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "COMPLETED");

        let uri = format!("/api/gardens/g1/schedules/{id}/skip");
        let (status, body) = call(&app, Method::POST, &uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "conflict");

        let uri = format!("/api/gardens/g1/schedules/{id}");
        let (status, _) = call(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_timestamp_is_validation_error() {
        let (_mem, app) = app().await;
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/gardens/g1/schedules",
            Some(serde_json::json!({ "scheduled_at": "next tuesday" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation");
    }

    #[tokio::test]
    async fn store_outage_is_retryable() {
        let (mem, app) = app().await;
        mem.insert_schedule(schedule("s1", "g1", ScheduleStatus::Pending, 30));
        mem.fail_schedule_writes(true);
        let (status, body) =
            call(&app, Method::POST, "/api/gardens/g1/schedules/s1/cancel", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["retryable"], true);
    }

    #[tokio::test]
    async fn auto_schedule_while_disconnected_falls_back_to_manual() {
        let (mem, app) = app().await;
        let (status, body) =
            call(&app, Method::POST, "/api/gardens/g1/schedules/auto", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["fallback"], "manual");
        assert_eq!(mem.schedule_creates(), 0);
    }

    #[tokio::test]
    async fn auto_schedule_after_successful_probe() {
        let (_mem, app) = app().await;
        let (status, body) = call(&app, Method::POST, "/api/ai/test", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connected"], true);
        let (_, body) = call(&app, Method::GET, "/api/ai/status", None).await;
        assert_eq!(body["state"], "connected");

        let (status, body) =
            call(&app, Method::POST, "/api/gardens/g1/schedules/auto", None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["decision"]["decision"], "water");
        assert_eq!(body["schedule"]["status"], "PENDING");
    }

    #[tokio::test]
    async fn resolve_alert_after_refresh() {
        let (mem, app) = app().await;
        mem.push_alert(alert("a1", "g1", Severity::Critical, AlertStatus::Pending, 2));
        call(&app, Method::POST, "/api/gardens/g1/refresh", None).await;

        let (status, body) =
            call(&app, Method::POST, "/api/gardens/g1/alerts/a1/resolve", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "RESOLVED");

        let (status, _) =
            call(&app, Method::POST, "/api/gardens/g1/alerts/nope/ignore", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn close_garden_then_not_found() {
        let (_mem, app) = app().await;
        let (status, _) = call(&app, Method::DELETE, "/api/gardens/g1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, Method::GET, "/api/gardens/g1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = call(&app, Method::DELETE, "/api/gardens/g1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }
}
