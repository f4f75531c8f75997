use serde::{ser::SerializeMap, Serialize, Serializer};
use tmind_radio::{DeviceId, Measurement};

/// Per-device topics, fixed for the lifetime of a session. The device level
/// is the canonical address (lowercase hex, no separators)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub device_info: String,
    pub device_data: String,
}

impl Topics {
    pub fn new(publisher_id: &str, device: &DeviceId) -> Self {
        let base = format!("sensors/{publisher_id}/{}", device.canonical());
        Self {
            device_info: format!("{base}/deviceInfo"),
            device_data: format!("{base}/deviceData"),
        }
    }
}

/// Snapshot of who a device is, published once per session before any
/// sample. `type` and `uuid` come from the device handle, the rest from
/// reads that may fail, in which case the field is left out
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer_name: Option<String>,
}

/// Readings gathered during one tick. Keys exist only for capabilities that
/// were enabled and read successfully; a missing key never means zero.
/// Serialises as a JSON object of two-decimal strings in sampling order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sample {
    readings: Vec<(&'static str, f64)>,
}

impl Sample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, measurement: &Measurement) {
        for (name, value) in measurement.values() {
            match self.readings.iter_mut().find(|(n, _)| *n == name) {
                Some(slot) => slot.1 = value,
                None => self.readings.push((name, value)),
            }
        }
    }

    pub fn keys(&self) -> Vec<&'static str> {
        self.readings.iter().map(|(name, _)| *name).collect()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.readings
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

impl Serialize for Sample {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.readings.len()))?;
        for (name, value) in &self.readings {
            map.serialize_entry(name, &two_decimals(*value))?;
        }
        map.end()
    }
}

/// Fixed two decimals, ties rounded away from zero
fn two_decimals(value: f64) -> String {
    format!("{:.2}", (value * 100.0).round() / 100.0)
}
