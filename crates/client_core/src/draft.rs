use shared::domain::{Device, DeviceId, Output, OutputId, Pin, Sensor, SensorId};

use crate::error::DraftError;

/// What the add-sensor flow hands over: which sensor, on which pin, and which
/// of its outputs to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorDefinition {
    pub sensor: Sensor,
    pub pin: Pin,
    pub enabled_outputs: Vec<OutputId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorDraft {
    device: Device,
}

impl SensorDraft {
    pub fn new(device_id: DeviceId, sensors: Vec<Sensor>) -> Self {
        Self {
            device: Device::new(device_id, sensors),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device.device_id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.device.sensors
    }

    fn sensor_mut(&mut self, sensor_id: SensorId) -> Result<&mut Sensor, DraftError> {
        self.device
            .sensors
            .iter_mut()
            .find(|s| s.id == sensor_id)
            .ok_or(DraftError::UnknownSensor(sensor_id))
    }

    pub fn set_pin(&mut self, sensor_id: SensorId, pin: Pin) -> Result<(), DraftError> {
        let sensor = self.sensor_mut(sensor_id)?;
        if !sensor.accepts_pin(&pin) {
            return Err(DraftError::PinNotAvailable { sensor_id, pin });
        }
        sensor.pin = Some(pin);
        Ok(())
    }

    /// Flips one output's reporting flag; applying it twice is a no-op.
    pub fn toggle_output(
        &mut self,
        sensor_id: SensorId,
        output_id: OutputId,
    ) -> Result<bool, DraftError> {
        let output = self
            .sensor_mut(sensor_id)?
            .output_mut(output_id)
            .ok_or(DraftError::UnknownOutput {
                sensor_id,
                output_id,
            })?;
        output.active = !output.active;
        Ok(output.active)
    }

    /// Soft delete: the sensor stays in the list with `active = false`.
    pub fn remove_sensor(&mut self, sensor_id: SensorId) -> Result<(), DraftError> {
        self.sensor_mut(sensor_id)?.active = false;
        Ok(())
    }

    pub fn add_sensor(&mut self, definition: SensorDefinition) -> Result<(), DraftError> {
        let SensorDefinition {
            sensor,
            pin,
            enabled_outputs,
        } = definition;
        if !sensor.accepts_pin(&pin) {
            return Err(DraftError::PinNotAvailable {
                sensor_id: sensor.id,
                pin,
            });
        }
        if let Some(output_id) = enabled_outputs
            .iter()
            .copied()
            .find(|id| sensor.output(*id).is_none())
        {
            return Err(DraftError::UnknownOutput {
                sensor_id: sensor.id,
                output_id,
            });
        }

        let outputs: Vec<Output> = sensor
            .outputs
            .iter()
            .map(|o| Output {
                active: enabled_outputs.contains(&o.id),
                ..o.clone()
            })
            .collect();
        let added = Sensor {
            pin: Some(pin),
            active: true,
            outputs,
            ..sensor
        };

        match self.device.sensors.iter_mut().find(|s| s.id == added.id) {
            Some(existing) => *existing = added,
            None => self.device.sensors.push(added),
        }
        Ok(())
    }

    /// Body for `POST /api/devices/{id}/sensors`: every sensor, soft-deleted ones
    /// included, so the server can tell "disabled" from "never existed".
    pub fn submission(&self) -> Vec<Sensor> {
        self.device.sensors.clone()
    }

    pub fn effective_configuration(&self) -> Vec<Sensor> {
        self.device.effective_configuration()
    }
}

#[cfg(test)]
#[path = "tests/draft_tests.rs"]
mod tests;
