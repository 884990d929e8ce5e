use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(SensorId);
id_newtype!(OutputId);

/// Device identifiers are opaque route segments, not numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Digital,
    Analog,
}

impl SensorType {
    /// Label prefix shown next to pin numbers.
    pub fn prefix(self) -> &'static str {
        match self {
            SensorType::Digital => "D",
            SensorType::Analog => "A",
        }
    }
}

/// A pin identifier as the device API reports it: either a bare index or a label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Pin {
    Index(u32),
    Label(String),
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pin::Index(index) => write!(f, "{index}"),
            Pin::Label(label) => f.write_str(label),
        }
    }
}

impl From<u32> for Pin {
    fn from(value: u32) -> Self {
        Pin::Index(value)
    }
}

impl From<&str> for Pin {
    fn from(value: &str) -> Self {
        Pin::Label(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub id: OutputId,
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sensor {
    pub id: SensorId,
    pub name: String,
    #[serde(rename = "type")]
    pub sensor_type: SensorType,
    #[serde(default)]
    pub pin: Option<Pin>,
    #[serde(default)]
    pub available_pins: Vec<Pin>,
    pub active: bool,
    #[serde(default)]
    pub outputs: Vec<Output>,
}

impl Sensor {
    pub fn accepts_pin(&self, pin: &Pin) -> bool {
        self.available_pins.contains(pin)
    }

    pub fn output(&self, output_id: OutputId) -> Option<&Output> {
        self.outputs.iter().find(|o| o.id == output_id)
    }

    pub fn output_mut(&mut self, output_id: OutputId) -> Option<&mut Output> {
        self.outputs.iter_mut().find(|o| o.id == output_id)
    }

    /// The slice of this sensor that takes part in the device's effective
    /// configuration, or `None` if the sensor is soft-deleted.
    pub fn effective(&self) -> Option<Sensor> {
        if !self.active {
            return None;
        }
        Some(Sensor {
            outputs: self.outputs.iter().filter(|o| o.active).cloned().collect(),
            ..self.clone()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: DeviceId,
    pub sensors: Vec<Sensor>,
}

impl Device {
    pub fn new(device_id: DeviceId, sensors: Vec<Sensor>) -> Self {
        Self { device_id, sensors }
    }

    pub fn effective_configuration(&self) -> Vec<Sensor> {
        self.sensors.iter().filter_map(Sensor::effective).collect()
    }

    pub fn active_sensors(&self) -> impl Iterator<Item = &Sensor> {
        self.sensors.iter().filter(|s| s.active)
    }

    /// Sensors the device knows about but has disabled; these are what the
    /// add-sensor flow offers.
    pub fn available_sensors(&self) -> impl Iterator<Item = &Sensor> {
        self.sensors.iter().filter(|s| !s.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dht() -> Sensor {
        Sensor {
            id: SensorId(1),
            name: "dht".into(),
            sensor_type: SensorType::Digital,
            pin: Some(Pin::Index(4)),
            available_pins: vec![Pin::Index(2), Pin::Index(4)],
            active: true,
            outputs: vec![
                Output {
                    id: OutputId(1),
                    name: "temp".into(),
                    active: true,
                },
                Output {
                    id: OutputId(2),
                    name: "humidity".into(),
                    active: false,
                },
            ],
        }
    }

    #[test]
    fn sensor_json_uses_api_field_names() {
        let raw = r#"{
            "id": 3,
            "name": "LDR",
            "type": "analog",
            "pin": null,
            "availablePins": ["A0", "A1"],
            "active": false,
            "outputs": [{"id": 1, "name": "light", "active": true}]
        }"#;
        let sensor: Sensor = serde_json::from_str(raw).expect("parse sensor");
        assert_eq!(sensor.id, SensorId(3));
        assert_eq!(sensor.sensor_type, SensorType::Analog);
        assert_eq!(sensor.pin, None);
        assert!(sensor.accepts_pin(&Pin::from("A1")));

        let value = serde_json::to_value(&sensor).expect("serialize");
        assert_eq!(value["type"], "analog");
        assert_eq!(value["availablePins"][0], "A0");
    }

    #[test]
    fn effective_configuration_keeps_active_sensors_and_outputs() {
        let mut disabled = dht();
        disabled.id = SensorId(2);
        disabled.active = false;
        let device = Device::new(DeviceId::new("dev-1"), vec![dht(), disabled]);

        let effective = device.effective_configuration();
        assert_eq!(effective.len(), 1);
        assert_eq!(effective[0].outputs.len(), 1);
        assert_eq!(effective[0].outputs[0].name, "temp");
        assert_eq!(device.available_sensors().count(), 1);
    }
}
