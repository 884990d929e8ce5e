use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::{DeviceId, Sensor},
    protocol::{CommitStatusResponse, SensorValuesRequest, SensorValuesResponse, SubmitResponse},
};
use tracing::debug;

#[async_trait]
pub trait DeviceApi: Send + Sync {
    async fn fetch_sensors(&self, device_id: &DeviceId) -> Result<Vec<Sensor>>;
    async fn submit_sensors(&self, device_id: &DeviceId, sensors: &[Sensor])
        -> Result<SubmitResponse>;
    async fn fetch_commit_status(&self, device_id: &DeviceId) -> Result<CommitStatusResponse>;
    async fn fetch_sensor_values(&self, device_id: &DeviceId) -> Result<SensorValuesResponse>;
}

pub struct MissingDeviceApi;

#[async_trait]
impl DeviceApi for MissingDeviceApi {
    async fn fetch_sensors(&self, device_id: &DeviceId) -> Result<Vec<Sensor>> {
        Err(anyhow!("device api unavailable for device {device_id}"))
    }

    async fn submit_sensors(
        &self,
        device_id: &DeviceId,
        _sensors: &[Sensor],
    ) -> Result<SubmitResponse> {
        Err(anyhow!("device api unavailable for device {device_id}"))
    }

    async fn fetch_commit_status(&self, device_id: &DeviceId) -> Result<CommitStatusResponse> {
        Err(anyhow!("device api unavailable for device {device_id}"))
    }

    async fn fetch_sensor_values(&self, device_id: &DeviceId) -> Result<SensorValuesResponse> {
        Err(anyhow!("device api unavailable for device {device_id}"))
    }
}

pub struct HttpDeviceApi {
    http: Client,
    server_url: String,
}

impl HttpDeviceApi {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn sensors_url(&self, device_id: &DeviceId) -> String {
        format!("{}/api/devices/{}/sensors", self.server_url, device_id)
    }
}

#[async_trait]
impl DeviceApi for HttpDeviceApi {
    async fn fetch_sensors(&self, device_id: &DeviceId) -> Result<Vec<Sensor>> {
        let sensors = self
            .http
            .get(self.sensors_url(device_id))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(sensors)
    }

    async fn submit_sensors(
        &self,
        device_id: &DeviceId,
        sensors: &[Sensor],
    ) -> Result<SubmitResponse> {
        debug!(%device_id, sensors = sensors.len(), "api: submitting sensor configuration");
        let body = self
            .http
            .post(self.sensors_url(device_id))
            .json(sensors)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body)
    }

    async fn fetch_commit_status(&self, device_id: &DeviceId) -> Result<CommitStatusResponse> {
        let body = self
            .http
            .get(format!("{}/status", self.sensors_url(device_id)))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body)
    }

    async fn fetch_sensor_values(&self, device_id: &DeviceId) -> Result<SensorValuesResponse> {
        let body = self
            .http
            .post(format!("{}/sensor-values", self.server_url))
            .json(&SensorValuesRequest {
                device_id: device_id.clone(),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body)
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
