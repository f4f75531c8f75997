use actix::{Addr, MailboxError};
use std::sync::Arc;
use thiserror::Error;
use tmind_radio::{DeviceId, RadioError, SensorDevice};
use tokio::{
    sync::{mpsc::UnboundedReceiver, watch},
    time::{Instant, MissedTickBehavior},
};
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};

use crate::{
    discovery::{DiscoveryHandle, OpenReason},
    publisher::{publish_json, PublishError, TelemetryPublisher},
    registry::{RegisterSession, SessionRegistry, SessionTransition, UnregisterSession},
    sequencer::SensorReadSequencer,
    settings::Settings,
    telemetry::{DeviceInfo, Topics},
};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid session transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
    #[error("Radio Error")]
    Radio(#[from] RadioError),
    #[error("Actix mailbox Error")]
    Mailbox(#[from] MailboxError),
    #[error("Publish Error")]
    Publish(#[from] PublishError),
}

/// Discovered -> Connecting -> Announced -> Polling, with Disconnected
/// reachable from every other state and terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Discovered,
    Connecting,
    Announced,
    Polling,
    Disconnected,
}

impl SessionState {
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Disconnected, _) => false,
            (_, Disconnected) => true,
            (Discovered, Connecting) | (Connecting, Announced) | (Announced, Polling) => true,
            _ => false,
        }
    }
}

/// What `on_discover` did with a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverOutcome {
    /// Not in the configured device list
    Unknown,
    /// A session for the device is already active
    Duplicate,
    Started,
}

/// Creates one session per newly discovered known device and wires its
/// teardown. Clones share the same registry, discovery handle and publisher
#[derive(Clone)]
pub struct SessionManager {
    settings: Arc<Settings>,
    registry: Addr<SessionRegistry>,
    discovery: DiscoveryHandle,
    publisher: Arc<dyn TelemetryPublisher>,
    sequencer: Arc<SensorReadSequencer>,
}

impl SessionManager {
    pub fn new(
        settings: Arc<Settings>,
        registry: Addr<SessionRegistry>,
        discovery: DiscoveryHandle,
        publisher: Arc<dyn TelemetryPublisher>,
    ) -> Self {
        let sequencer = Arc::new(SensorReadSequencer::from_settings(&settings));
        Self {
            settings,
            registry,
            discovery,
            publisher,
            sequencer,
        }
    }

    pub async fn event_loop(self, discovered: UnboundedReceiver<Arc<dyn SensorDevice>>) {
        let mut discovered = UnboundedReceiverStream::new(discovered);
        while let Some(device) = discovered.next().await {
            if let Err(e) = self.on_discover(device).await {
                log::error!("Error handling discovered device {e:}");
            }
        }
        log::warn!("Session manager exiting event loop");
    }

    pub async fn on_discover(
        &self,
        device: Arc<dyn SensorDevice>,
    ) -> Result<DiscoverOutcome, SessionError> {
        let id = device.id().clone();
        if !self.settings.is_known(&id) {
            log::info!("SensorTag {id} not in the configured list, ignoring");
            return Ok(DiscoverOutcome::Unknown);
        }

        let (cancel, cancelled) = watch::channel(false);
        let registered = self
            .registry
            .send(RegisterSession {
                id: id.clone(),
                cancel,
            })
            .await?;
        if !registered {
            log::trace!("SensorTag {id} seen again, session already active");
            return Ok(DiscoverOutcome::Duplicate);
        }

        log::info!("SensorTag {id} found ({})", device.kind());
        // Setup needs the radio to itself
        self.discovery.stop();

        self.spawn_disconnect_handler(device.clone());

        let session = Session {
            topics: Topics::new(&self.settings.publisher_id, &id),
            id,
            device,
            state: SessionState::Discovered,
            cancelled,
            manager: self.clone(),
        };
        tokio::spawn(session.run());

        Ok(DiscoverOutcome::Started)
    }

    /// Fires once when the link drops, whoever caused it. Tears the session
    /// down and reopens discovery if it is idle
    fn spawn_disconnect_handler(&self, device: Arc<dyn SensorDevice>) {
        let registry = self.registry.clone();
        let discovery = self.discovery.clone();
        tokio::spawn(async move {
            device.wait_disconnected().await;
            let id = device.id().clone();
            log::info!("SensorTag {id} disconnected");

            match registry.send(UnregisterSession { id: id.clone() }).await {
                Ok(true) => {}
                Ok(false) => log::debug!("Session {id} was already removed"),
                Err(e) => log::error!("Unable to unregister session {id}: {e:}"),
            }
            discovery.reopen_if_idle(OpenReason::SessionEnded);
        });
    }
}

/// Per-device task. Owns the device handle for setup and the periodic reads
/// and stops at the first sign of cancellation
struct Session {
    id: DeviceId,
    device: Arc<dyn SensorDevice>,
    state: SessionState,
    topics: Topics,
    cancelled: watch::Receiver<bool>,
    manager: SessionManager,
}

impl Session {
    async fn run(mut self) {
        if let Err(e) = self.lifecycle().await {
            log::error!("Session {} failed in {:?}: {e:}", self.id, self.state);
        }

        self.state = SessionState::Disconnected;
        // No-op if the link is already gone, otherwise the disconnect
        // handler takes it from here
        if let Err(e) = self.device.disconnect().await {
            log::warn!("Error disconnecting {}: {e:}", self.id);
        }
        log::debug!("Session {} task done", self.id);
    }

    async fn lifecycle(&mut self) -> Result<(), SessionError> {
        self.advance(SessionState::Connecting)?;
        log::info!("Connecting to {}", self.id);
        self.device.connect_and_setup().await?;
        if self.is_cancelled() {
            return Ok(());
        }

        let info = self.read_device_info().await;
        if self.is_cancelled() {
            return Ok(());
        }
        if let Err(e) = publish_json(
            self.manager.publisher.as_ref(),
            &self.topics.device_info,
            &info,
        )
        .await
        {
            log::error!("Device info for {} not published {e:}", self.id);
        }
        self.advance(SessionState::Announced)?;

        if self.manager.settings.rescan_after_announce {
            self.manager.discovery.reopen_if_idle(OpenReason::Announced);
        }

        self.advance(SessionState::Polling)?;
        self.poll().await;
        Ok(())
    }

    fn advance(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_advance_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        log::debug!("Session {} {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        self.manager.registry.do_send(SessionTransition {
            id: self.id.clone(),
            state: next,
        });
        Ok(())
    }

    /// Cancelled by the registry, or the registry itself is gone
    fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow() || self.cancelled.has_changed().is_err()
    }

    async fn read_device_info(&self) -> DeviceInfo {
        let mut info = DeviceInfo {
            kind: self.device.kind().to_string(),
            uuid: self.id.canonical().to_string(),
            ..Default::default()
        };
        let stop_on_error = self.manager.settings.stop_info_reads_on_error;

        info.device_name = self.info_field("device name", self.device.read_device_name().await);
        if info.device_name.is_none() && stop_on_error {
            return info;
        }
        info.firmware_revision =
            self.info_field("firmware revision", self.device.read_firmware_revision().await);
        if info.firmware_revision.is_none() && stop_on_error {
            return info;
        }
        info.manufacturer_name =
            self.info_field("manufacturer name", self.device.read_manufacturer_name().await);
        info
    }

    fn info_field(&self, field: &str, res: Result<String, RadioError>) -> Option<String> {
        match res {
            Ok(value) => {
                log::debug!("{} {field} = {value}", self.id);
                Some(value)
            }
            Err(e) => {
                log::warn!("Unable to read {field} of {}: {e:}", self.id);
                None
            }
        }
    }

    /// One tick per interval, first one a full interval after announcing.
    /// A slow tick pushes the next one back rather than overlapping it
    async fn poll(&mut self) {
        let period = self.manager.settings.sample_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cancelled = self.cancelled.clone();

        loop {
            tokio::select! {
                _ = wait_cancelled(&mut cancelled) => break,
                _ = ticker.tick() => {
                    let report = self.manager.sequencer.tick(self.device.as_ref()).await;
                    if self.is_cancelled() {
                        log::info!("Session {} closed mid-tick, sample discarded", self.id);
                        break;
                    }
                    if let Err(e) = publish_json(
                        self.manager.publisher.as_ref(),
                        &self.topics.device_data,
                        &report.sample,
                    )
                    .await
                    {
                        log::error!("Sample for {} not published {e:}", self.id);
                    }
                }
            }
        }
        log::info!("Stopped polling {}", self.id);
    }
}

async fn wait_cancelled(cancelled: &mut watch::Receiver<bool>) {
    while !*cancelled.borrow_and_update() {
        if cancelled.changed().await.is_err() {
            return;
        }
    }
}
