//! Core of the SensorTag gateway: discovery windows, one session per known
//! device, per-tick sensor sequencing and telemetry publishing.
//!
//! The radio is reached only through [`tmind_radio::SensorRadio`] and
//! [`tmind_radio::SensorDevice`], the broker only through
//! [`TelemetryPublisher`], so everything here runs the same against the
//! gatttool radio, an MQTT broker or the in-memory doubles used in tests.

pub mod discovery;
pub mod gateway;
pub mod publisher;
pub mod registry;
pub mod sequencer;
pub mod session;
pub mod settings;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use discovery::{DiscoveryHandle, OpenReason};
pub use gateway::{gateway, Gateway, GatewayError};
pub use publisher::{MqttPublisher, PublishError, TelemetryPublisher};
pub use registry::{RegistryError, SessionRegistry};
pub use sequencer::{CapabilityOutcome, SensorReadSequencer, StepOutcome, TickReport};
pub use session::{DiscoverOutcome, SessionError, SessionManager, SessionState};
pub use settings::{BrokerSettings, Settings, SettingsError};
pub use telemetry::{DeviceInfo, Sample, Topics};
