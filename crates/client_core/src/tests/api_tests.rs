use super::*;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use shared::{
    domain::{Output, OutputId, Pin, SensorId, SensorType},
    protocol::ReadingValue,
};
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Clone, Default)]
struct ServerState {
    submitted: Arc<Mutex<Vec<Value>>>,
    status_calls: Arc<AtomicUsize>,
}

fn ldr() -> Sensor {
    Sensor {
        id: SensorId(2),
        name: "ldr".into(),
        sensor_type: SensorType::Analog,
        pin: Some(Pin::from("A0")),
        available_pins: vec![Pin::from("A0"), Pin::from("A1")],
        active: false,
        outputs: vec![Output {
            id: OutputId(1),
            name: "light".into(),
            active: true,
        }],
    }
}

async fn list_sensors(Path(device_id): Path<String>) -> Result<Json<Vec<Sensor>>, StatusCode> {
    if device_id != "dev-1" {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(vec![ldr()]))
}

async fn store_sensors(
    State(state): State<ServerState>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.submitted.lock().await.push(body);
    Json(json!({ "error": true, "message": "queued" }))
}

async fn sensors_status(State(state): State<ServerState>) -> Json<Value> {
    let call = state.status_calls.fetch_add(1, Ordering::SeqCst);
    let status = if call == 0 { "restarting" } else { "done" };
    Json(json!({ "status": status }))
}

async fn sensor_values(Json(body): Json<Value>) -> Json<Value> {
    assert_eq!(body, json!({ "deviceId": "dev-1" }));
    Json(json!({
        "initialData": { "ldr": 512 },
        "statistics": { "ldr": 3, "__total__": 3 }
    }))
}

async fn spawn_device_server() -> anyhow::Result<(String, ServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = ServerState::default();
    let app = Router::new()
        .route(
            "/api/devices/:device_id/sensors",
            get(list_sensors).post(store_sensors),
        )
        .route("/api/devices/:device_id/sensors/status", get(sensors_status))
        .route("/sensor-values", post(sensor_values))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

#[tokio::test]
async fn fetches_sensors_with_api_field_names() {
    let (server_url, _state) = spawn_device_server().await.expect("spawn server");
    let api = HttpDeviceApi::new(server_url);

    let sensors = api
        .fetch_sensors(&DeviceId::new("dev-1"))
        .await
        .expect("sensors");
    assert_eq!(sensors, vec![ldr()]);

    let err = api
        .fetch_sensors(&DeviceId::new("missing"))
        .await
        .expect_err("404");
    assert!(err.to_string().contains("404"), "unexpected error: {err}");
}

#[tokio::test]
async fn submits_full_sensor_list_and_reads_queued_response() {
    let (server_url, state) = spawn_device_server().await.expect("spawn server");
    let api = HttpDeviceApi::new(server_url);

    let response = api
        .submit_sensors(&DeviceId::new("dev-1"), &[ldr()])
        .await
        .expect("submit");
    assert!(!response.is_immediate_success());
    assert_eq!(response.extra["message"], "queued");

    let submitted = state.submitted.lock().await.clone();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0][0]["availablePins"], json!(["A0", "A1"]));
    assert_eq!(submitted[0][0]["active"], json!(false));
}

#[tokio::test]
async fn reads_commit_status_and_baseline() {
    let (server_url, state) = spawn_device_server().await.expect("spawn server");
    let api = HttpDeviceApi::new(server_url);
    let device_id = DeviceId::new("dev-1");

    assert_eq!(
        api.fetch_commit_status(&device_id).await.expect("status").status,
        "restarting"
    );
    assert_eq!(
        api.fetch_commit_status(&device_id).await.expect("status").status,
        "done"
    );
    assert_eq!(state.status_calls.load(Ordering::SeqCst), 2);

    let baseline = api.fetch_sensor_values(&device_id).await.expect("baseline");
    assert_eq!(baseline.initial_data["ldr"], ReadingValue::from(512));
    assert_eq!(baseline.statistics["__total__"], 3);
}

#[tokio::test]
async fn missing_api_fails_every_call() {
    let device_id = DeviceId::new("dev-1");
    assert!(MissingDeviceApi.fetch_sensors(&device_id).await.is_err());
    assert!(MissingDeviceApi
        .submit_sensors(&device_id, &[])
        .await
        .is_err());
    assert!(MissingDeviceApi.fetch_commit_status(&device_id).await.is_err());
    assert!(MissingDeviceApi.fetch_sensor_values(&device_id).await.is_err());
}

#[tokio::test]
async fn rest_and_websocket_share_the_server_base_path() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route("/app/sensor-values", post(sensor_values));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let server_url = format!("http://{addr}/app");
    let device_id = DeviceId::new("dev-1");
    let api = HttpDeviceApi::new(server_url.clone());
    let baseline = api.fetch_sensor_values(&device_id).await.expect("baseline");
    assert_eq!(baseline.statistics["__total__"], 3);

    let ws = crate::telemetry::websocket_url(&server_url, &device_id).expect("ws url");
    assert_eq!(ws.as_str(), format!("ws://{addr}/app/ws?deviceId=dev-1"));
}
