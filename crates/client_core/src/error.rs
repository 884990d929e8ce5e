use shared::domain::{OutputId, Pin, SensorId};
use thiserror::Error;

/// Baseline or configuration load failed; the view cannot proceed.
#[derive(Debug, Clone, Error)]
#[error("failed to load {what}: {message}")]
pub struct FetchError {
    pub what: &'static str,
    pub message: String,
}

impl FetchError {
    pub fn new(what: &'static str, err: &anyhow::Error) -> Self {
        Self {
            what,
            message: format!("{err:#}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DraftError {
    #[error("unknown sensor {0}")]
    UnknownSensor(SensorId),
    #[error("sensor {sensor_id} has no output {output_id}")]
    UnknownOutput {
        sensor_id: SensorId,
        output_id: OutputId,
    },
    #[error("pin {pin} is not available for sensor {sensor_id}")]
    PinNotAvailable { sensor_id: SensorId, pin: Pin },
}

#[derive(Debug, Clone, Error)]
pub enum CommitError {
    #[error("failed to submit sensor configuration: {0}")]
    Submit(String),
    #[error("sensor reconfiguration failed: {reason}")]
    JobFailed { reason: String },
    #[error("failed to poll reconfiguration status: {0}")]
    PollTransport(String),
    #[error("a configuration commit is already in flight")]
    InFlight,
    #[error("commit controller was shut down")]
    Cancelled,
    #[error(transparent)]
    Draft(#[from] DraftError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl CommitError {
    /// The reason recorded in `CommitStatus::Failed`.
    pub fn reason(&self) -> &str {
        match self {
            CommitError::Submit(_) => "submit_error",
            CommitError::JobFailed { reason } => reason,
            CommitError::PollTransport(_) => "poll_error",
            CommitError::InFlight => "in_flight",
            CommitError::Cancelled => "cancelled",
            CommitError::Draft(_) => "invalid_draft",
            CommitError::Fetch(_) => "fetch_error",
        }
    }

    /// Whether the user can simply try again with the retained draft.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CommitError::Submit(_) | CommitError::JobFailed { .. } | CommitError::PollTransport(_)
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum TelemetryError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("telemetry baseline for device {0} has not been loaded")]
    NotInitialized(String),
    #[error("failed to connect telemetry stream: {0}")]
    Connect(String),
    #[error("server_url must start with http:// or https://, got {0}")]
    InvalidServerUrl(String),
    #[error("telemetry session was torn down")]
    Cancelled,
}
