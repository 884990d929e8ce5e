use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use futures::{Sink, SinkExt, Stream, StreamExt};
use shared::{
    domain::DeviceId,
    protocol::{ReadingValue, TelemetryFrame, TOTAL_KEY},
};
use tokio::sync::broadcast;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    api::DeviceApi,
    error::{FetchError, TelemetryError},
    task::TaskHandle,
};

type WsWriter = Box<dyn Sink<Message, Error = WsError> + Send + Unpin>;

/// Display grouping of a telemetry key: `dht_heat_index` renders as sensor
/// `dht`, output `heat/index`. Purely presentational; no link to sensor ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TelemetryKey {
    pub sensor: String,
    pub output: Option<String>,
}

pub fn split_telemetry_key(key: &str) -> TelemetryKey {
    let mut parts = key.split('_');
    let sensor = parts.next().unwrap_or_default().to_string();
    let rest: Vec<&str> = parts.collect();
    TelemetryKey {
        sensor,
        output: (!rest.is_empty()).then(|| rest.join("/")),
    }
}

pub fn websocket_url(server_url: &str, device_id: &DeviceId) -> Result<Url, TelemetryError> {
    let invalid = || TelemetryError::InvalidServerUrl(server_url.to_string());
    let mut url = Url::parse(server_url).map_err(|_| invalid())?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => return Err(invalid()),
    };
    url.set_scheme(scheme).map_err(|_| invalid())?;
    // The socket lives under the same base path as the REST endpoints.
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_fragment(None);
    url.query_pairs_mut()
        .clear()
        .append_pair("deviceId", device_id.as_str());
    Ok(url)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TelemetryStatus {
    #[default]
    Idle,
    Loading,
    Ready,
    Live,
    Closed,
    Failed(String),
}

#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    Reading { key: String, value: ReadingValue },
    FrameDropped(String),
    StreamClosed,
    StreamFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRow {
    pub key: String,
    pub label: TelemetryKey,
    pub value: ReadingValue,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetrySnapshot {
    pub live: HashMap<String, ReadingValue>,
    pub statistics: HashMap<String, u64>,
    pub status: TelemetryStatus,
}

impl TelemetrySnapshot {
    pub fn count(&self, key: &str) -> u64 {
        self.statistics.get(key).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.count(TOTAL_KEY)
    }

    pub fn rows(&self) -> Vec<TelemetryRow> {
        let mut rows: Vec<TelemetryRow> = self
            .live
            .iter()
            .map(|(key, value)| TelemetryRow {
                key: key.clone(),
                label: split_telemetry_key(key),
                value: value.clone(),
                count: self.count(key),
            })
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }
}

#[derive(Default)]
struct TelemetryState {
    session: u64,
    device_id: Option<DeviceId>,
    initialized: bool,
    live: HashMap<String, ReadingValue>,
    statistics: HashMap<String, u64>,
    status: TelemetryStatus,
}

impl TelemetryState {
    fn apply(&mut self, frame: TelemetryFrame) {
        for key in [frame.name.clone(), TOTAL_KEY.to_string()] {
            let count = self.statistics.entry(key).or_insert(0);
            *count = count.saturating_add(1);
        }
        self.live.insert(frame.name, frame.value);
    }

    fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            live: self.live.clone(),
            statistics: self.statistics.clone(),
            status: self.status.clone(),
        }
    }
}

enum FrameOutcome {
    Applied,
    Dropped,
    Stale,
}

struct StreamSession {
    reader: TaskHandle,
    writer: Option<WsWriter>,
}

fn read_state(state: &RwLock<TelemetryState>) -> RwLockReadGuard<'_, TelemetryState> {
    state.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_state(state: &RwLock<TelemetryState>) -> RwLockWriteGuard<'_, TelemetryState> {
    state.write().unwrap_or_else(PoisonError::into_inner)
}

fn apply_raw_frame(
    state: &RwLock<TelemetryState>,
    events: &broadcast::Sender<TelemetryEvent>,
    session: Option<u64>,
    raw: &str,
) -> FrameOutcome {
    let frame = match TelemetryFrame::parse(raw) {
        Ok(frame) => frame,
        Err(err) => {
            debug!("telemetry: dropping malformed frame: {err}");
            let _ = events.send(TelemetryEvent::FrameDropped(err.to_string()));
            return FrameOutcome::Dropped;
        }
    };

    let event = TelemetryEvent::Reading {
        key: frame.name.clone(),
        value: frame.value.clone(),
    };
    {
        let mut guard = write_state(state);
        if !guard.initialized || session.is_some_and(|s| s != guard.session) {
            return FrameOutcome::Stale;
        }
        guard.apply(frame);
    }
    let _ = events.send(event);
    FrameOutcome::Applied
}

/// Marks the stream as ended, unless the session was already torn down locally.
fn finish_session(
    state: &RwLock<TelemetryState>,
    events: &broadcast::Sender<TelemetryEvent>,
    session: u64,
    failure: Option<String>,
) {
    {
        let mut guard = write_state(state);
        if guard.session != session {
            return;
        }
        guard.status = match &failure {
            Some(message) => TelemetryStatus::Failed(message.clone()),
            None => TelemetryStatus::Closed,
        };
    }
    match failure {
        Some(message) => {
            warn!("telemetry: stream failed: {message}");
            let _ = events.send(TelemetryEvent::StreamFailed(message));
        }
        None => {
            info!("telemetry: stream closed by server");
            let _ = events.send(TelemetryEvent::StreamClosed);
        }
    }
}

pub struct TelemetryAggregator {
    api: Arc<dyn DeviceApi>,
    server_url: String,
    state: Arc<RwLock<TelemetryState>>,
    stream: Mutex<Option<StreamSession>>,
    events: broadcast::Sender<TelemetryEvent>,
}

impl TelemetryAggregator {
    pub fn new(
        api: Arc<dyn DeviceApi>,
        server_url: impl Into<String>,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            api,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(TelemetryState::default())),
            stream: Mutex::new(None),
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.events.subscribe()
    }

    /// Loads the baseline maps. Must succeed before `connect`.
    pub async fn initialize(
        &self,
        device_id: &DeviceId,
    ) -> Result<TelemetrySnapshot, TelemetryError> {
        self.drop_stream();
        let session = {
            let mut guard = write_state(&self.state);
            guard.session += 1;
            guard.device_id = Some(device_id.clone());
            guard.initialized = false;
            guard.live.clear();
            guard.statistics.clear();
            guard.status = TelemetryStatus::Loading;
            guard.session
        };

        let result = self.api.fetch_sensor_values(device_id).await;

        let mut guard = write_state(&self.state);
        if guard.session != session {
            debug!(%device_id, "telemetry: discarding baseline for torn-down session");
            return Err(TelemetryError::Cancelled);
        }
        match result {
            Ok(baseline) => {
                guard.live = baseline.initial_data;
                guard.statistics = baseline.statistics;
                guard.initialized = true;
                guard.status = TelemetryStatus::Ready;
                info!(
                    %device_id,
                    keys = guard.live.len(),
                    "telemetry: baseline loaded"
                );
                Ok(guard.snapshot())
            }
            Err(err) => {
                let err = FetchError::new("telemetry baseline", &err);
                guard.status = TelemetryStatus::Failed(err.to_string());
                warn!(%device_id, "telemetry: {err}");
                Err(err.into())
            }
        }
    }

    pub async fn connect(&self, device_id: &DeviceId) -> Result<(), TelemetryError> {
        let session = self.initialized_session(device_id)?;
        let url = websocket_url(&self.server_url, device_id)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TelemetryError::Connect(format!("{url}: {err}")))?;
        let (writer, reader) = ws_stream.split();
        self.install_stream(session, reader, Some(Box::new(writer)))?;
        info!(%device_id, %url, "telemetry: stream connected");
        Ok(())
    }

    /// Feeds frames from an already-open reader into the aggregator.
    pub fn attach<S>(&self, device_id: &DeviceId, reader: S) -> Result<(), TelemetryError>
    where
        S: Stream<Item = Result<Message, WsError>> + Send + Unpin + 'static,
    {
        let session = self.initialized_session(device_id)?;
        self.install_stream(session, reader, None)
    }

    fn initialized_session(&self, device_id: &DeviceId) -> Result<u64, TelemetryError> {
        let guard = read_state(&self.state);
        if !guard.initialized || guard.device_id.as_ref() != Some(device_id) {
            return Err(TelemetryError::NotInitialized(device_id.to_string()));
        }
        Ok(guard.session)
    }

    fn install_stream<S>(
        &self,
        session: u64,
        mut reader: S,
        writer: Option<WsWriter>,
    ) -> Result<(), TelemetryError>
    where
        S: Stream<Item = Result<Message, WsError>> + Send + Unpin + 'static,
    {
        let mut slot = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut guard = write_state(&self.state);
            if guard.session != session {
                return Err(TelemetryError::Cancelled);
            }
            guard.status = TelemetryStatus::Live;
        }

        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let reader = TaskHandle::spawn(async move {
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let FrameOutcome::Stale =
                            apply_raw_frame(&state, &events, Some(session), &text)
                        {
                            return;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        finish_session(
                            &state,
                            &events,
                            session,
                            Some(format!("websocket receive failed: {err}")),
                        );
                        return;
                    }
                }
            }
            finish_session(&state, &events, session, None);
        });

        // Replacing an existing session drops (and cancels) its reader.
        *slot = Some(StreamSession { reader, writer });
        Ok(())
    }

    /// Applies one raw text frame. Returns whether it was accepted; malformed
    /// frames, and any frame without a loaded baseline or after `disconnect`,
    /// are dropped without touching either map.
    pub fn on_message(&self, raw: &str) -> bool {
        matches!(
            apply_raw_frame(&self.state, &self.events, None, raw),
            FrameOutcome::Applied
        )
    }

    fn take_stream(&self) -> Option<StreamSession> {
        let mut slot = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        let mut guard = write_state(&self.state);
        guard.session += 1;
        guard.initialized = false;
        guard.status = TelemetryStatus::Closed;
        slot.take()
    }

    fn drop_stream(&self) {
        if let Some(mut session) = self.take_stream() {
            session.reader.cancel();
        }
    }

    /// Ends the session: stops the reader, sends a close frame once, and makes
    /// any response still in flight a no-op. Calling it again does nothing.
    pub async fn disconnect(&self) {
        let Some(mut session) = self.take_stream() else {
            return;
        };
        session.reader.cancel();
        if let Some(mut writer) = session.writer.take() {
            if let Err(err) = writer.close().await {
                debug!("telemetry: close handshake failed: {err}");
            }
        }
        info!("telemetry: stream disconnected");
    }

    pub fn is_connected(&self) -> bool {
        let slot = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().is_some_and(|s| !s.reader.is_finished())
    }

    pub fn status(&self) -> TelemetryStatus {
        read_state(&self.state).status.clone()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        read_state(&self.state).snapshot()
    }
}

impl Drop for TelemetryAggregator {
    fn drop(&mut self) {
        self.drop_stream();
    }
}

#[cfg(test)]
#[path = "tests/telemetry_tests.rs"]
mod tests;
