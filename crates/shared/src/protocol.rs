use std::{collections::HashMap, fmt};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::DeviceId;

/// Statistics key holding the observation count across every telemetry key.
pub const TOTAL_KEY: &str = "__total__";

/// A single scalar reading as carried on the live stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadingValue {
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl ReadingValue {
    fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Bool(v) => Some(ReadingValue::Bool(v)),
            Value::Number(v) => Some(ReadingValue::Number(v)),
            Value::String(v) => Some(ReadingValue::Text(v)),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ReadingValue::Number(n) => n.as_f64(),
            _ => None,
        }
    }
}

impl fmt::Display for ReadingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadingValue::Bool(v) => write!(f, "{v}"),
            ReadingValue::Number(v) => write!(f, "{v}"),
            ReadingValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for ReadingValue {
    fn from(value: i64) -> Self {
        ReadingValue::Number(value.into())
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("frame has no string `name`")]
    MissingName,
    #[error("frame has no scalar `value`")]
    MissingValue,
}

/// One `{name, value}` text frame from `/ws?deviceId=...`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub name: String,
    pub value: ReadingValue,
}

impl TelemetryFrame {
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let Value::Object(mut fields) = serde_json::from_str::<Value>(raw)? else {
            return Err(FrameError::NotAnObject);
        };
        let name = match fields.remove("name") {
            Some(Value::String(name)) => name,
            _ => return Err(FrameError::MissingName),
        };
        let value = fields
            .remove("value")
            .and_then(ReadingValue::from_json)
            .ok_or(FrameError::MissingValue)?;
        Ok(Self { name, value })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorValuesRequest {
    pub device_id: DeviceId,
}

/// Telemetry baseline returned by `POST /sensor-values`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorValuesResponse {
    #[serde(default, deserialize_with = "scalar_readings")]
    pub initial_data: HashMap<String, ReadingValue>,
    #[serde(default)]
    pub statistics: HashMap<String, u64>,
}

/// Baseline entries that hold no scalar (e.g. a sensor that never reported)
/// are skipped instead of failing the whole baseline.
fn scalar_readings<'de, D>(deserializer: D) -> Result<HashMap<String, ReadingValue>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<HashMap<String, Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(key, value)| ReadingValue::from_json(value).map(|value| (key, value)))
        .collect())
}

/// Response to `POST /api/devices/{id}/sensors`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SubmitResponse {
    /// Only an explicit `error: false` means the change was applied synchronously;
    /// anything else means a reconfiguration job was queued.
    pub fn is_immediate_success(&self) -> bool {
        self.error == Some(false)
    }
}

/// Response to `GET /api/devices/{id}/sensors/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatusResponse {
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalStatus {
    RestartFailed,
    SensorsFetchFailed,
    SensorsPublishFailed,
    CheckFetchError,
    Done,
}

impl TerminalStatus {
    pub const ALL: [TerminalStatus; 5] = [
        TerminalStatus::RestartFailed,
        TerminalStatus::SensorsFetchFailed,
        TerminalStatus::SensorsPublishFailed,
        TerminalStatus::CheckFetchError,
        TerminalStatus::Done,
    ];

    /// Returns `None` for every status the job reports while still running.
    pub fn classify(status: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == status)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TerminalStatus::RestartFailed => "restart_failed",
            TerminalStatus::SensorsFetchFailed => "sensors_fetch_failed",
            TerminalStatus::SensorsPublishFailed => "sensors_publish_failed",
            TerminalStatus::CheckFetchError => "check_fetch_error",
            TerminalStatus::Done => "done",
        }
    }

    pub fn is_success(self) -> bool {
        self == TerminalStatus::Done
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
