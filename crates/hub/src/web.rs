use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use rumqttc::{AsyncClient, QoS};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::ingest::Pipeline;
use crate::live::LiveEvent;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Outbound command channel to the devices.
pub trait CommandSink: Send + Sync {
    fn send(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

impl CommandSink for AsyncClient {
    fn send(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.try_publish(topic, QoS::AtLeastOnce, false, payload)
            .with_context(|| format!("publish to {topic} failed"))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub commands: Arc<dyn CommandSink>,
    pub recent_limit: i64,
    pub command_prefix: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
            }
            ApiError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, Json(json!({ "message": msg }))).into_response()
            }
            ApiError::Internal(e) => {
                tracing::error!("request failed: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": format!("{e:#}") })),
                )
                    .into_response()
            }
        }
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/sensor",
            get(list_sensor).post(create_sensor).delete(clear_sensor),
        )
        .route("/api/sensor/latest", get(latest_sensor))
        .route("/api/command", post(send_command))
        .route("/api/status", get(api_status))
        .route("/ws", get(live_ws))
        .with_state(state)
}

async fn list_sensor(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    let records = app.pipeline.db().recent(app.recent_limit).await?;
    Ok(Json(records))
}

async fn latest_sensor(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    match app.pipeline.db().latest().await? {
        Some(record) => Ok(Json(record)),
        None => Err(ApiError::NotFound("Belum ada data".into())),
    }
}

/// Manual submission. Unlike the MQTT path every reading must be present.
async fn create_sensor(State(app): State<AppState>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let raw: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid json: {e}")))?;
    if !raw.as_object().is_some_and(|o| !o.is_empty()) {
        return Err(ApiError::BadRequest("Payload kosong".into()));
    }

    let record = app.pipeline.normalizer().normalize(&raw);
    if let Some(key) = record.missing_readings().first() {
        return Err(ApiError::BadRequest(format!("Key '{key}' tidak ditemukan")));
    }

    let stored = app.pipeline.store(record).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Data berhasil disimpan", "id": stored.id })),
    ))
}

async fn clear_sensor(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    let n = app.pipeline.db().delete_all().await?;
    tracing::info!(deleted = n, "sensor data cleared");
    app.pipeline
        .state()
        .write()
        .await
        .record_system(format!("{n} records deleted"));
    Ok(Json(json!({ "message": format!("{n} data dihapus") })))
}

#[derive(Debug, Deserialize)]
struct CommandBody {
    lamp: i64,
    status: Option<String>,
    mode: Option<String>,
}

/// Validate a command and build the payload the device expects.
fn command_payload(cmd: &CommandBody) -> std::result::Result<(u8, Value), String> {
    if !(1..=5).contains(&cmd.lamp) {
        return Err(format!("lamp must be 1-5, got {}", cmd.lamp));
    }
    let lamp = cmd.lamp as u8;

    if let Some(mode) = &cmd.mode {
        if lamp != 5 {
            return Err("mode only applies to lamp 5 (fan)".into());
        }
        let mode = mode.trim().to_uppercase();
        if mode != "AUTO" && mode != "MANUAL" {
            return Err(format!("unknown mode '{mode}' (use AUTO/MANUAL)"));
        }
        return Ok((lamp, json!({ "lamp": lamp, "mode": mode })));
    }

    match cmd.status.as_deref().map(|s| s.trim().to_uppercase()) {
        Some(s) if s == "ON" || s == "OFF" => Ok((lamp, json!({ "lamp": lamp, "status": s }))),
        Some(s) => Err(format!("unknown status '{s}' (use ON/OFF)")),
        None => Err("command needs status or mode".into()),
    }
}

async fn send_command(State(app): State<AppState>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let cmd: CommandBody = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid command: {e}")))?;
    let (lamp, payload) = command_payload(&cmd).map_err(ApiError::BadRequest)?;

    let topic = format!("{}/{lamp}", app.command_prefix);
    let bytes = serde_json::to_vec(&payload).context("failed to encode command")?;
    app.commands.send(&topic, bytes)?;

    tracing::info!(%topic, %payload, "command sent");
    app.pipeline
        .state()
        .write()
        .await
        .record_command(format!("{topic} {payload}"));
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": "command sent", "topic": topic })),
    ))
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let st = app.pipeline.state().read().await;
    Json(st.to_status())
}

// ---------------------------------------------------------------------------
// Live feed
// ---------------------------------------------------------------------------

async fn live_ws(State(app): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let rx = app.pipeline.feed().subscribe();
    ws.on_upgrade(move |socket| live_socket(socket, rx))
}

async fn live_socket(mut socket: WebSocket, mut rx: broadcast::Receiver<LiveEvent>) {
    tracing::debug!("live viewer connected");
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(t) => t,
                        Err(e) => {
                            tracing::error!("failed to encode live event: {e}");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "live viewer lagging");
                }
                Err(RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!("live viewer disconnected");
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    tracing::info!(%addr, "http api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::live::LiveFeed;
    use crate::normalize::Normalizer;
    use crate::state::HubState;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, Value)>>,
    }

    impl CommandSink for RecordingSink {
        fn send(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
            let value = serde_json::from_slice(&payload)?;
            self.sent.lock().unwrap().push((topic.to_string(), value));
            Ok(())
        }
    }

    async fn app_with_limit(limit: i64) -> (AppState, Arc<RecordingSink>) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let pipeline = Pipeline::new(
            db,
            LiveFeed::new(),
            HubState::shared(),
            Normalizer::new("KBG001"),
        );
        let sink = Arc::new(RecordingSink::default());
        let state = AppState {
            pipeline,
            commands: sink.clone(),
            recent_limit: limit,
            command_prefix: "iot/lamp/cmd".into(),
        };
        (state, sink)
    }

    async fn app() -> (AppState, Arc<RecordingSink>) {
        app_with_limit(50).await
    }

    async fn call(state: &AppState, method: Method, uri: &str, body: &str) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let res = router(state.clone()).oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    const FULL: &str = r#"{"suhu":30,"kelembapan_udara":55,"kelembapan_tanah":44,"cahaya":80,"co2":410}"#;

    // -- /api/sensor ----------------------------------------------------------

    #[tokio::test]
    async fn list_starts_empty() {
        let (state, _) = app().await;
        let (status, body) = call(&state, Method::GET, "/api/sensor", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn latest_without_data_is_404() {
        let (state, _) = app().await;
        let (status, body) = call(&state, Method::GET, "/api/sensor/latest", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"message": "Belum ada data"}));
    }

    #[tokio::test]
    async fn post_missing_soil_humidity_is_400() {
        let (state, _) = app().await;
        let (status, body) = call(
            &state,
            Method::POST,
            "/api/sensor",
            r#"{"suhu":30,"kelembapan_udara":55,"cahaya":80,"co2":410}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Key 'humidity_soil' tidak ditemukan");
        assert_eq!(state.pipeline.db().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn post_full_payload_is_stored_and_broadcast() {
        let (state, _) = app().await;
        let mut rx = state.pipeline.feed().subscribe();

        let (status, body) = call(&state, Method::POST, "/api/sensor", FULL).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["message"], "Data berhasil disimpan");
        let id = body["id"].as_i64().unwrap();

        let (status, latest) = call(&state, Method::GET, "/api/sensor/latest", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(latest["id"], id);
        assert_eq!(latest["garden_id"], "KBG001");
        assert_eq!(latest["humidity_soil"], 44);

        match rx.recv().await.unwrap() {
            LiveEvent::SensorUpdate(stored) => assert_eq!(stored.id, id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn post_rejects_non_objects_and_bad_json() {
        let (state, _) = app().await;
        for body in ["[1,2]", "{}", "42", "{oops"] {
            let (status, json) = call(&state, Method::POST, "/api/sensor", body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body {body}");
            assert!(json["error"].is_string());
        }
    }

    #[tokio::test]
    async fn list_is_newest_first_and_capped() {
        let (state, _) = app_with_limit(3).await;
        for t in 0..5 {
            let body = format!(
                r#"{{"suhu":{t},"kelembapan_udara":55,"kelembapan_tanah":44,"cahaya":80,"co2":410}}"#
            );
            call(&state, Method::POST, "/api/sensor", &body).await;
        }
        let (_, body) = call(&state, Method::GET, "/api/sensor", "").await;
        let items = body.as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0]["temperature"], 4);
        assert_eq!(items[2]["temperature"], 2);
    }

    #[tokio::test]
    async fn delete_reports_count() {
        let (state, _) = app().await;
        call(&state, Method::POST, "/api/sensor", FULL).await;
        call(&state, Method::POST, "/api/sensor", FULL).await;

        let (status, body) = call(&state, Method::DELETE, "/api/sensor", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"message": "2 data dihapus"}));
        assert_eq!(state.pipeline.db().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn store_failure_is_500_with_message() {
        let (state, _) = app().await;
        state.pipeline.db().close().await;
        let (status, body) = call(&state, Method::GET, "/api/sensor", "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("recent failed"));
    }

    // -- /api/command ---------------------------------------------------------

    #[tokio::test]
    async fn command_is_published_to_lamp_topic() {
        let (state, sink) = app().await;
        let (status, body) = call(
            &state,
            Method::POST,
            "/api/command",
            r#"{"lamp":3,"status":"on"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["topic"], "iot/lamp/cmd/3");

        let sent = sink.sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![("iot/lamp/cmd/3".to_string(), json!({"lamp": 3, "status": "ON"}))]
        );
    }

    #[tokio::test]
    async fn fan_mode_command() {
        let (state, sink) = app().await;
        let (status, _) = call(
            &state,
            Method::POST,
            "/api/command",
            r#"{"lamp":5,"mode":"manual"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(
            sink.sent.lock().unwrap()[0].1,
            json!({"lamp": 5, "mode": "MANUAL"})
        );
    }

    #[tokio::test]
    async fn invalid_commands_are_400() {
        let (state, sink) = app().await;
        for body in [
            r#"{"lamp":2,"mode":"AUTO"}"#,
            r#"{"lamp":6,"status":"ON"}"#,
            r#"{"lamp":0,"status":"ON"}"#,
            r#"{"lamp":1,"status":"TOGGLE"}"#,
            r#"{"lamp":1}"#,
            r#"{"status":"ON"}"#,
        ] {
            let (status, json) = call(&state, Method::POST, "/api/command", body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body {body}");
            assert!(json["error"].is_string());
        }
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    // -- /api/status ----------------------------------------------------------

    #[tokio::test]
    async fn status_reports_gardens_and_actuators() {
        let (state, _) = app().await;
        call(&state, Method::POST, "/api/sensor", FULL).await;
        state
            .pipeline
            .handle_status(br#"{"lamp":1,"status":"ON"}"#)
            .await;

        let (status, body) = call(&state, Method::GET, "/api/status", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mqtt_connected"], false);
        assert_eq!(body["actuators"]["lamp1"], "ON");
        assert_eq!(body["gardens"]["KBG001"]["records"], 1);
        assert!(body["events"].as_array().unwrap().len() >= 2);
    }
}
