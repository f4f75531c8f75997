//! Immutable run parameters, loaded once at start from the gateway's JSON
//! config file. Key names match the config files already deployed on
//! gateways (`SensorTags`, `Timeout`, `MQTTHost`, ...).

use secrecy::SecretString;
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    path::Path,
    time::Duration,
};
use thiserror::Error;
use tmind_radio::{Capability, DeviceId};

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("Config parse Error")]
    Json(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

const DEFAULT_CLIENT_ID: &str = "tag-minder";
const DEFAULT_ADAPTER: &str = "hci0";

fn default_true() -> bool {
    true
}

fn default_keep_alive() -> u64 {
    60
}

fn default_reconnect_period() -> u64 {
    1000
}

/// On-disk layout. Durations are milliseconds unless noted
#[derive(Deserialize)]
struct SettingsFile {
    #[serde(rename = "SensorTags")]
    sensor_tags: Vec<DeviceId>,
    #[serde(rename = "Timeout")]
    timeout: u64,
    #[serde(rename = "Interval")]
    interval: u64,
    #[serde(rename = "EnableTimeout")]
    enable_timeout: u64,
    #[serde(rename = "SettleDelays", default)]
    settle_delays: HashMap<Capability, u64>,

    #[serde(rename = "TemperatureEnabled", default)]
    temperature_enabled: bool,
    #[serde(rename = "HumidityEnabled", default)]
    humidity_enabled: bool,
    #[serde(rename = "BarometricEnabled", default)]
    barometric_enabled: bool,
    #[serde(rename = "LuxometerEnabled", default)]
    luxometer_enabled: bool,

    #[serde(rename = "MQTTHost")]
    mqtt_host: String,
    #[serde(rename = "MQTTPort")]
    mqtt_port: u16,
    #[serde(rename = "MQTTUsername", default)]
    mqtt_username: Option<String>,
    #[serde(rename = "MQTTPassword", default)]
    mqtt_password: Option<String>,
    #[serde(rename = "MQTTClientId", default)]
    mqtt_client_id: Option<String>,
    #[serde(rename = "MQTTTls", default = "default_true")]
    mqtt_tls: bool,
    #[serde(rename = "MQTTQos", default)]
    mqtt_qos: u8,
    #[serde(rename = "MQTTRetain", default)]
    mqtt_retain: bool,
    /// seconds
    #[serde(rename = "MQTTKeepAlive", default = "default_keep_alive")]
    mqtt_keep_alive: u64,
    #[serde(rename = "MQTTReconnectPeriod", default = "default_reconnect_period")]
    mqtt_reconnect_period: u64,

    #[serde(rename = "PublisherId", default)]
    publisher_id: Option<String>,
    #[serde(rename = "DiscoveryRestart", default)]
    discovery_restart: Option<u64>,
    #[serde(rename = "RescanAfterAnnounce", default = "default_true")]
    rescan_after_announce: bool,
    #[serde(rename = "StopInfoReadsOnError", default)]
    stop_info_reads_on_error: bool,
    #[serde(rename = "Adapter", default)]
    adapter: Option<String>,
}

/// Broker connection parameters, handed to the MQTT client as-is
#[derive(Debug)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub client_id: String,
    pub tls: bool,
    pub qos: u8,
    pub retain: bool,
    pub keep_alive: Duration,
    pub reconnect_period: Duration,
}

#[derive(Debug)]
pub struct Settings {
    /// Devices we are allowed to open sessions with, in config order
    pub known_devices: Vec<DeviceId>,
    known: HashSet<DeviceId>,
    enabled: HashSet<Capability>,
    default_settle: Duration,
    settle_delays: HashMap<Capability, Duration>,

    pub discovery_window: Duration,
    /// Pause before reopening a window that closed on its own. `None` keeps
    /// discovery idle until a session ends
    pub discovery_restart: Option<Duration>,
    pub rescan_after_announce: bool,
    pub sample_interval: Duration,
    pub stop_info_reads_on_error: bool,

    /// Second level of every published topic
    pub publisher_id: String,
    pub broker: BrokerSettings,
    pub adapter: String,
}

impl Settings {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            log::error!("Unable to read config {}: {e:}", path.display());
            e
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, SettingsError> {
        let file: SettingsFile = serde_json::from_str(raw)?;
        Self::try_from(file)
    }

    pub fn is_known(&self, id: &DeviceId) -> bool {
        self.known.contains(id)
    }

    pub fn is_enabled(&self, capability: Capability) -> bool {
        self.enabled.contains(&capability)
    }

    /// Enabled capabilities in sampling order
    pub fn enabled_capabilities(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ORDERED
            .into_iter()
            .filter(|c| self.is_enabled(*c))
    }

    pub fn settle_delay(&self, capability: Capability) -> Duration {
        self.settle_delays
            .get(&capability)
            .copied()
            .unwrap_or(self.default_settle)
    }
}

impl TryFrom<SettingsFile> for Settings {
    type Error = SettingsError;

    fn try_from(file: SettingsFile) -> Result<Self, Self::Error> {
        if file.sensor_tags.is_empty() {
            return Err(SettingsError::Invalid(
                "SensorTags must name at least one device".to_string(),
            ));
        }
        if file.timeout == 0 {
            return Err(SettingsError::Invalid("Timeout must be > 0".to_string()));
        }
        if file.interval == 0 {
            return Err(SettingsError::Invalid("Interval must be > 0".to_string()));
        }
        if file.mqtt_qos > 2 {
            return Err(SettingsError::Invalid(format!(
                "MQTTQos {} is not 0, 1 or 2",
                file.mqtt_qos
            )));
        }
        if file.mqtt_password.is_some() && file.mqtt_username.is_none() {
            return Err(SettingsError::Invalid(
                "MQTTPassword requires MQTTUsername".to_string(),
            ));
        }

        let client_id = file
            .mqtt_client_id
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());

        let publisher_id = file
            .publisher_id
            .or_else(|| file.mqtt_username.clone())
            .unwrap_or_else(|| client_id.clone());
        if publisher_id.is_empty() || publisher_id.contains(['/', '+', '#']) {
            return Err(SettingsError::Invalid(format!(
                "Publisher identity {publisher_id:?} is not a valid topic level"
            )));
        }

        let enabled = [
            (Capability::Thermal, file.temperature_enabled),
            (Capability::Humidity, file.humidity_enabled),
            (Capability::Barometric, file.barometric_enabled),
            (Capability::Luminosity, file.luxometer_enabled),
        ]
        .into_iter()
        .filter_map(|(c, on)| on.then_some(c))
        .collect::<HashSet<_>>();

        if enabled.is_empty() {
            log::warn!("No sensor capability enabled, only device info will be published");
        }

        let settle_delays = file
            .settle_delays
            .into_iter()
            .map(|(c, ms)| (c, Duration::from_millis(ms)))
            .collect();

        Ok(Self {
            known: file.sensor_tags.iter().cloned().collect(),
            known_devices: file.sensor_tags,
            enabled,
            default_settle: Duration::from_millis(file.enable_timeout),
            settle_delays,
            discovery_window: Duration::from_millis(file.timeout),
            discovery_restart: file.discovery_restart.map(Duration::from_millis),
            rescan_after_announce: file.rescan_after_announce,
            sample_interval: Duration::from_millis(file.interval),
            stop_info_reads_on_error: file.stop_info_reads_on_error,
            publisher_id,
            broker: BrokerSettings {
                host: file.mqtt_host,
                port: file.mqtt_port,
                username: file.mqtt_username,
                password: file.mqtt_password.map(SecretString::from),
                client_id,
                tls: file.mqtt_tls,
                qos: file.mqtt_qos,
                retain: file.mqtt_retain,
                keep_alive: Duration::from_secs(file.mqtt_keep_alive),
                reconnect_period: Duration::from_millis(file.mqtt_reconnect_period),
            },
            adapter: file.adapter.unwrap_or_else(|| DEFAULT_ADAPTER.to_string()),
        })
    }
}
