use super::*;

use std::{collections::HashMap, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::channel::mpsc;
use shared::{
    domain::{Output, OutputId, Pin, Sensor, SensorId, SensorType},
    protocol::{
        CommitStatusResponse, ReadingValue, SensorValuesResponse, SubmitResponse, TOTAL_KEY,
    },
};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

struct FlakyCommitApi;

#[async_trait]
impl DeviceApi for FlakyCommitApi {
    async fn fetch_sensors(&self, _device_id: &DeviceId) -> Result<Vec<Sensor>> {
        Ok(vec![Sensor {
            id: SensorId(1),
            name: "dht".into(),
            sensor_type: SensorType::Digital,
            pin: Some(Pin::Index(4)),
            available_pins: vec![Pin::Index(4)],
            active: true,
            outputs: vec![Output {
                id: OutputId(1),
                name: "temp".into(),
                active: true,
            }],
        }])
    }

    async fn submit_sensors(
        &self,
        _device_id: &DeviceId,
        _sensors: &[Sensor],
    ) -> Result<SubmitResponse> {
        Ok(SubmitResponse {
            error: Some(true),
            ..SubmitResponse::default()
        })
    }

    async fn fetch_commit_status(&self, _device_id: &DeviceId) -> Result<CommitStatusResponse> {
        Err(anyhow!("status endpoint unreachable"))
    }

    async fn fetch_sensor_values(&self, _device_id: &DeviceId) -> Result<SensorValuesResponse> {
        Ok(SensorValuesResponse {
            initial_data: HashMap::from([("dht_temp".to_string(), ReadingValue::from(21))]),
            statistics: HashMap::from([
                ("dht_temp".to_string(), 1),
                (TOTAL_KEY.to_string(), 1),
            ]),
        })
    }
}

#[tokio::test]
async fn failed_commit_leaves_telemetry_stream_running() {
    let settings = ClientSettings {
        poll_interval_ms: 5,
        ..ClientSettings::default()
    };
    let device_id = DeviceId::new("dev-1");
    let session = DeviceSession::with_api(Arc::new(FlakyCommitApi), &settings, device_id.clone());

    session
        .telemetry
        .initialize(&device_id)
        .await
        .expect("baseline");
    let (tx, rx) = mpsc::unbounded();
    session.telemetry.attach(&device_id, rx).expect("attach");

    session.commits.load().await.expect("load");
    let mut commit_events = session.commits.subscribe_events();
    session.commits.commit().await.expect("commit queued");
    loop {
        let event = timeout(Duration::from_secs(2), commit_events.recv())
            .await
            .expect("commit outcome")
            .expect("channel open");
        if let CommitEvent::Failed(err) = event {
            assert_eq!(err.reason(), "poll_error");
            break;
        }
    }

    let mut telemetry_events = session.telemetry.subscribe_events();
    tx.unbounded_send(Ok(Message::Text(
        r#"{"name":"dht_temp","value":23}"#.to_string(),
    )))
    .expect("stream still open");
    timeout(Duration::from_secs(2), telemetry_events.recv())
        .await
        .expect("reading")
        .expect("channel open");

    assert_eq!(session.telemetry.status(), TelemetryStatus::Live);
    assert_eq!(session.telemetry.snapshot().total(), 2);

    session.close().await;
    assert_eq!(session.telemetry.status(), TelemetryStatus::Closed);
}
