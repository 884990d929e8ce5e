use std::sync::Arc;

use shared::domain::DeviceId;
use tracing::info;

pub mod api;
pub mod commit;
pub mod config;
pub mod draft;
pub mod error;
pub mod task;
pub mod telemetry;

pub use api::{DeviceApi, HttpDeviceApi, MissingDeviceApi};
pub use commit::{CommitEvent, CommitStatus, ConfigCommitController};
pub use config::{load_settings, ClientSettings};
pub use draft::{SensorDefinition, SensorDraft};
pub use error::{CommitError, DraftError, FetchError, TelemetryError};
pub use task::TaskHandle;
pub use telemetry::{
    split_telemetry_key, TelemetryAggregator, TelemetryEvent, TelemetryKey, TelemetrySnapshot,
    TelemetryStatus,
};

/// Everything a device view owns. The two halves share only the API client;
/// a failure in one never tears down the other.
pub struct DeviceSession {
    device_id: DeviceId,
    pub telemetry: TelemetryAggregator,
    pub commits: ConfigCommitController,
}

impl DeviceSession {
    pub fn new(settings: &ClientSettings, device_id: DeviceId) -> Self {
        let api: Arc<dyn DeviceApi> = Arc::new(HttpDeviceApi::new(settings.server_url.clone()));
        Self::with_api(api, settings, device_id)
    }

    pub fn with_api(api: Arc<dyn DeviceApi>, settings: &ClientSettings, device_id: DeviceId) -> Self {
        Self {
            telemetry: TelemetryAggregator::new(
                Arc::clone(&api),
                settings.server_url.clone(),
                settings.event_capacity,
            ),
            commits: ConfigCommitController::new(api, device_id.clone(), settings),
            device_id,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Baseline, then stream. The stream is never opened without a baseline.
    pub async fn open_live(&self) -> Result<TelemetrySnapshot, TelemetryError> {
        let baseline = self.telemetry.initialize(&self.device_id).await?;
        self.telemetry.connect(&self.device_id).await?;
        Ok(baseline)
    }

    pub async fn close(&self) {
        self.telemetry.disconnect().await;
        self.commits.shutdown();
        info!(device_id = %self.device_id, "session: closed");
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
