use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use greenhouse_common::{ControlSettings, ManualCommand, SettingsPatch, UnitId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::registry::SharedRegistry;
use crate::router::{RouteError, Router, Source};

// ---------------------------------------------------------------------------
// Requests forwarded to the driver loop
// ---------------------------------------------------------------------------

/// Mutations go through the driver loop, which owns the router; the HTTP
/// side only reads the registry directly.
#[derive(Debug)]
pub enum OperatorRequest {
    UnitSettings {
        unit: UnitId,
        patch: SettingsPatch,
        reply: oneshot::Sender<Result<bool, RouteError>>,
    },
    BroadcastSettings {
        settings: ControlSettings,
        reply: oneshot::Sender<Result<(), RouteError>>,
    },
    ControlAll {
        action: ManualCommand,
        reply: oneshot::Sender<Vec<UnitId>>,
    },
}

/// Execute one operator request against the router. A dropped reply
/// channel only means the HTTP client went away.
pub async fn dispatch(router: &mut Router, req: OperatorRequest) {
    match req {
        OperatorRequest::UnitSettings { unit, patch, reply } => {
            let result = router.apply_settings(unit, &patch, Source::Operator).await;
            let _ = reply.send(result);
        }
        OperatorRequest::BroadcastSettings { settings, reply } => {
            let result = router.broadcast_settings(settings, Source::Operator).await;
            let _ = reply.send(result);
        }
        OperatorRequest::ControlAll { action, reply } => {
            let units = router.global_action(action).await;
            let _ = reply.send(units);
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: SharedRegistry,
    pub ops: mpsc::Sender<OperatorRequest>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

enum ApiError {
    UnknownUnit(u8),
    Invalid(String),
    Unavailable,
}

impl From<RouteError> for ApiError {
    fn from(e: RouteError) -> Self {
        match e {
            RouteError::UnknownUnit(id) => ApiError::UnknownUnit(id.get()),
            RouteError::Invalid(e) => ApiError::Invalid(e.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::UnknownUnit(id) => (StatusCode::NOT_FOUND, format!("unknown unit {id}")),
            ApiError::Invalid(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "hub is shutting down".to_string(),
            ),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

async fn ask<T>(
    ops: &mpsc::Sender<OperatorRequest>,
    make: impl FnOnce(oneshot::Sender<T>) -> OperatorRequest,
) -> Result<T, ApiError> {
    let (tx, rx) = oneshot::channel();
    ops.send(make(tx)).await.map_err(|_| ApiError::Unavailable)?;
    rx.await.map_err(|_| ApiError::Unavailable)
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/api/status", get(api_status))
        .route("/api/units/{id}/settings", post(unit_settings))
        .route("/api/settings", put(broadcast_settings))
        .route("/api/control-all", post(control_all))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let reg = state.registry.read().await;
    Json(reg.to_status())
}

#[derive(Serialize)]
struct Changed {
    changed: bool,
}

async fn unit_settings(
    State(state): State<AppState>,
    Path(raw): Path<u8>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<Changed>, ApiError> {
    let unit = UnitId::new(raw).ok_or(ApiError::UnknownUnit(raw))?;
    let changed = ask(&state.ops, |reply| OperatorRequest::UnitSettings {
        unit,
        patch,
        reply,
    })
    .await??;
    Ok(Json(Changed { changed }))
}

async fn broadcast_settings(
    State(state): State<AppState>,
    Json(settings): Json<ControlSettings>,
) -> Result<StatusCode, ApiError> {
    ask(&state.ops, |reply| OperatorRequest::BroadcastSettings {
        settings,
        reply,
    })
    .await??;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ControlAllBody {
    action: ManualCommand,
}

#[derive(Serialize)]
struct Commanded {
    units: Vec<UnitId>,
}

async fn control_all(
    State(state): State<AppState>,
    Json(body): Json<ControlAllBody>,
) -> Result<Json<Commanded>, ApiError> {
    if body.action == ManualCommand::Stop {
        return Err(ApiError::Invalid(
            "control-all action must be open or close".to_string(),
        ));
    }
    let units = ask(&state.ops, |reply| OperatorRequest::ControlAll {
        action: body.action,
        reply,
    })
    .await?;
    Ok(Json(Commanded { units }))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!("operator api listening on http://{addr}");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, id, RecordingLink};
    use axum::body::Body;
    use axum::http::Request;
    use greenhouse_common::{Address, Frame, Mode, SensorReading, TelemetryMessage, VentState};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::time::Instant;
    use tower::ServiceExt;

    /// App wired to a router driven by a background task, as in the hub.
    async fn app(ids: &[u8], online: &[u8]) -> (axum::Router, SharedRegistry, RecordingLink) {
        let (mut router, registry, link, _) = testing::router(ids);
        {
            let mut reg = registry.write().await;
            for n in online {
                reg.on_telemetry(
                    &TelemetryMessage {
                        unit: id(*n),
                        reading: SensorReading {
                            temperature_c: 22.0,
                            humidity_pct: 50.0,
                            pressure_hpa: 1013.0,
                            timestamp_ms: 1,
                        },
                        vent: VentState::Closed,
                    },
                    Instant::now(),
                );
            }
        }
        let (ops, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                dispatch(&mut router, req).await;
            }
        });
        let state = AppState {
            registry: registry.clone(),
            ops,
        };
        (super::router(state), registry, link)
    }

    async fn call(
        app: axum::Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let req = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(b) => req
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn status_lists_configured_units() {
        let (app, _, _) = app(&[1, 4], &[4]).await;
        let (status, body) = call(app, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        let units = body["units"].as_array().unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0]["unit_id"], 1);
        assert_eq!(units[0]["online"], false);
        assert_eq!(units[1]["online"], true);
        assert_eq!(units[1]["settings"]["mode"], "auto");
    }

    #[tokio::test]
    async fn unit_patch_is_applied_and_sent() {
        let (app, registry, link) = app(&[2], &[]).await;
        let (status, body) = call(
            app,
            "POST",
            "/api/units/2/settings",
            Some(json!({"threshold_c": 28.0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], true);
        assert_eq!(
            registry.read().await.unit(id(2)).unwrap().settings.threshold_c,
            28.0
        );
        let controls = link.controls();
        assert_eq!(controls.len(), 1);
        assert_eq!(controls[0].target, Address::Unicast(id(2)));
    }

    #[tokio::test]
    async fn invalid_patch_is_400_and_changes_nothing() {
        let (app, registry, link) = app(&[2], &[]).await;
        let (status, body) = call(
            app,
            "POST",
            "/api/units/2/settings",
            Some(json!({"threshold_c": 28.0, "hysteresis_c": 9.0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("hysteresis"));
        assert_eq!(
            registry.read().await.unit(id(2)).unwrap().settings.threshold_c,
            25.0
        );
        assert!(link.frames().is_empty());
    }

    #[tokio::test]
    async fn unknown_or_out_of_range_unit_is_404() {
        let (app, _, _) = app(&[2], &[]).await;
        let (status, _) = call(
            app.clone(),
            "POST",
            "/api/units/3/settings",
            Some(json!({"mode": "manual"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(
            app,
            "POST",
            "/api/units/7/settings",
            Some(json!({"mode": "manual"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn broadcast_goes_out_as_one_frame() {
        let (app, registry, link) = app(&[1, 2, 3], &[]).await;
        let settings = ControlSettings {
            threshold_c: 30.0,
            mode: Mode::Manual,
            ..Default::default()
        };
        let (status, _) = call(
            app,
            "PUT",
            "/api/settings",
            Some(serde_json::to_value(settings).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let controls = link.controls();
        assert_eq!(controls.len(), 1);
        assert_eq!(controls[0].target, Address::Broadcast);
        let reg = registry.read().await;
        for n in [1, 2, 3] {
            assert_eq!(reg.unit(id(n)).unwrap().settings.threshold_c, 30.0);
        }
        assert!(link
            .frames()
            .iter()
            .any(|f| matches!(f, Frame::Schedule(s) if s.target == Address::Broadcast)));
    }

    #[tokio::test]
    async fn control_all_reaches_online_units_only() {
        let (app, registry, link) = app(&[1, 2, 3, 4, 5, 6], &[1, 2, 5, 6]).await;
        let (status, body) = call(
            app,
            "POST",
            "/api/control-all",
            Some(json!({"action": "open"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["units"], json!([1, 2, 5, 6]));
        assert_eq!(link.controls().len(), 4);
        let reg = registry.read().await;
        assert_eq!(reg.unit(id(1)).unwrap().settings.mode, Mode::Manual);
        assert_eq!(reg.unit(id(3)).unwrap().settings.mode, Mode::Auto);
        assert_eq!(reg.control_all.unwrap().action, ManualCommand::Open);
    }

    #[tokio::test]
    async fn control_all_rejects_stop() {
        let (app, _, link) = app(&[1], &[1]).await;
        let (status, _) = call(
            app,
            "POST",
            "/api/control-all",
            Some(json!({"action": "stop"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(link.frames().is_empty());
    }
}
