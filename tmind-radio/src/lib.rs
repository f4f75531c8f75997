//! The `tmind-radio` crate defines the radio / device driver boundary for the
//! tag-minder gateway. Everything above this crate only ever talks to a
//! [`SensorRadio`] (to run discovery) and to [`SensorDevice`] handles (one per
//! advertising peripheral), so the lifecycle and polling logic in
//! `tmind-broker` never needs to know how the bytes reach the air.
//!
//! The crate provides:
//! 1. Shared vocabulary: [`DeviceId`], [`Capability`], [`Measurement`] and
//!    [`RadioError`]
//! 2. The [`SensorRadio`] and [`SensorDevice`] traits
//! 3. A lazy implementation of both traits for CC2650 SensorTags that drives
//!    the BlueZ command line tools ([`GattCliRadio`], [`GattCliDevice`]):
//!    `hcitool lescan` for discovery and one `gatttool` invocation per request

mod cli;
mod convert;

pub use cli::{GattCliDevice, GattCliRadio};

use serde::Deserialize;
use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Error, Debug)]
pub enum RadioError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("Str utf8 parse Error")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("Hex decode Error")]
    Hex(#[from] hex::FromHexError),
    #[error("Radio command failed: {0}")]
    Command(String),
    #[error("Radio request timed out: {0}")]
    Timeout(String),
    #[error("Radio busy: {0}")]
    Busy(String),
    #[error("Unsupported device {0}")]
    Unsupported(String),
    #[error("Link to {0} is down")]
    LinkDown(DeviceId),
    #[error("Unexpected payload of {len} bytes for {capability}")]
    Payload { capability: Capability, len: usize },
}

/// Stream of device handles yielded while a discovery window is open. The
/// radio stops sending (and drops its end) when discovery is stopped or the
/// scanner dies.
pub type DiscoveryStream = UnboundedReceiver<Arc<dyn SensorDevice>>;

/// Device address as reported by the radio.
///
/// Two ids are equal when their hex digits match, ignoring case and
/// separators, so `AA:BB:CC:DD:EE:FF` from the config matches
/// `aabbccddeeff` from a driver that strips colons. [`fmt::Display`] keeps
/// the form the id was created with.
#[derive(Clone, Deserialize)]
#[serde(from = "String")]
pub struct DeviceId {
    raw: String,
    canonical: String,
}

impl DeviceId {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let canonical = raw
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Self { raw, canonical }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

impl From<String> for DeviceId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&str> for DeviceId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl PartialEq for DeviceId {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for DeviceId {}

impl Hash for DeviceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.raw)
    }
}

/// One sensor function on the device that can be switched on and off
/// independently of the others
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Thermal,
    Humidity,
    Barometric,
    Luminosity,
}

impl Capability {
    /// Fixed order in which capabilities are sampled during a tick
    pub const ORDERED: [Capability; 4] = [
        Capability::Thermal,
        Capability::Humidity,
        Capability::Barometric,
        Capability::Luminosity,
    ];

    /// Names of the readings one successful read of this capability produces
    pub fn reading_names(&self) -> &'static [&'static str] {
        match self {
            Capability::Thermal => &["objectTemperature", "ambientTemperature"],
            Capability::Humidity => &["temperature", "humidity"],
            Capability::Barometric => &["pressure"],
            Capability::Luminosity => &["lux"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Thermal => "thermal",
            Capability::Humidity => "humidity",
            Capability::Barometric => "barometric",
            Capability::Luminosity => "luminosity",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Converted result of reading one capability
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Measurement {
    /// Object (IR) and die temperature, degrees Celsius
    IrTemperature { object: f64, ambient: f64 },
    /// Temperature in degrees Celsius and relative humidity in percent
    Humidity { temperature: f64, humidity: f64 },
    /// Pressure in hPa
    Pressure { pressure: f64 },
    Lux { lux: f64 },
}

impl Measurement {
    pub fn capability(&self) -> Capability {
        match self {
            Measurement::IrTemperature { .. } => Capability::Thermal,
            Measurement::Humidity { .. } => Capability::Humidity,
            Measurement::Pressure { .. } => Capability::Barometric,
            Measurement::Lux { .. } => Capability::Luminosity,
        }
    }

    /// Named values in the order of [`Capability::reading_names`]
    pub fn values(&self) -> Vec<(&'static str, f64)> {
        let names = self.capability().reading_names();
        let values = match *self {
            Measurement::IrTemperature { object, ambient } => vec![object, ambient],
            Measurement::Humidity {
                temperature,
                humidity,
            } => vec![temperature, humidity],
            Measurement::Pressure { pressure } => vec![pressure],
            Measurement::Lux { lux } => vec![lux],
        };
        names.iter().copied().zip(values).collect()
    }
}

/// Trait to allow different implementations for driving discovery on the
/// local radio
#[async_trait::async_trait]
pub trait SensorRadio: Send + Sync {
    /// Start listening for advertisements. Every advertisement (duplicates
    /// included) yields a device handle on the returned stream
    async fn start_discovery(&self) -> Result<DiscoveryStream, RadioError>;

    /// Stop listening. Must be safe to call when discovery is not running
    async fn stop_discovery(&self) -> Result<(), RadioError>;
}

/// Handle on one discovered peripheral. The link may or may not be held open
/// between requests, depending on the implementation; callers only rely on
/// [`SensorDevice::wait_disconnected`] to learn that the device is gone.
#[async_trait::async_trait]
pub trait SensorDevice: Send + Sync {
    fn id(&self) -> &DeviceId;

    /// Device family, e.g. `cc2650`
    fn kind(&self) -> &str;

    async fn connect_and_setup(&self) -> Result<(), RadioError>;

    async fn read_device_name(&self) -> Result<String, RadioError>;
    async fn read_firmware_revision(&self) -> Result<String, RadioError>;
    async fn read_manufacturer_name(&self) -> Result<String, RadioError>;

    async fn enable(&self, capability: Capability) -> Result<(), RadioError>;
    async fn read(&self, capability: Capability) -> Result<Measurement, RadioError>;
    async fn disable(&self, capability: Capability) -> Result<(), RadioError>;

    /// Close the link. Resolves any pending [`SensorDevice::wait_disconnected`]
    async fn disconnect(&self) -> Result<(), RadioError>;

    /// Resolves once the link is down, whatever the cause
    async fn wait_disconnected(&self);
}
