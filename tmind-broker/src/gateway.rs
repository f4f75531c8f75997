use actix::{Actor, Addr, MailboxError};
use std::sync::Arc;
use thiserror::Error;
use tmind_radio::{DeviceId, SensorRadio};
use tokio::{sync::mpsc::unbounded_channel, task::JoinHandle};

use crate::{
    discovery::{DiscoveryHandle, DiscoveryScheduler},
    publisher::TelemetryPublisher,
    registry::{ActiveSessions, CancelAll, IsDiscoveryOpen, SessionRegistry},
    session::{SessionManager, SessionState},
    settings::Settings,
};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Actix mailbox Error")]
    Mailbox(#[from] MailboxError),
    #[error("Gateway task Error")]
    Join(#[from] tokio::task::JoinError),
}

/// Running gateway: the registry actor plus the discovery and session
/// manager tasks. Dropping it without calling [`Gateway::shutdown`] leaves
/// the tasks running until the runtime goes away
pub struct Gateway {
    registry: Addr<SessionRegistry>,
    discovery: DiscoveryHandle,
    scheduler: JoinHandle<()>,
    manager: JoinHandle<()>,
}

/// Start the gateway and open the first discovery window. Must be called
/// from within a running actix system
pub fn gateway(
    settings: Arc<Settings>,
    radio: Arc<dyn SensorRadio>,
    publisher: Arc<dyn TelemetryPublisher>,
) -> Gateway {
    let registry = SessionRegistry::new().start();

    let (discovered_tx, discovered_rx) = unbounded_channel();
    let (scheduler, discovery) = DiscoveryScheduler::new(
        radio,
        registry.clone(),
        settings.discovery_window,
        settings.discovery_restart,
        discovered_tx,
    );
    let scheduler = tokio::spawn(scheduler.event_loop());

    let manager = SessionManager::new(settings, registry.clone(), discovery.clone(), publisher);
    let manager = tokio::spawn(manager.event_loop(discovered_rx));

    discovery.start();

    Gateway {
        registry,
        discovery,
        scheduler,
        manager,
    }
}

impl Gateway {
    pub fn discovery(&self) -> &DiscoveryHandle {
        &self.discovery
    }

    pub async fn active_sessions(&self) -> Result<Vec<(DeviceId, SessionState)>, GatewayError> {
        Ok(self.registry.send(ActiveSessions).await?)
    }

    pub async fn is_discovery_open(&self) -> Result<bool, GatewayError> {
        Ok(self.registry.send(IsDiscoveryOpen).await?)
    }

    /// Stop discovery, let already discovered devices drain, then cancel
    /// every session. Sessions disconnect from their devices on their own
    pub async fn shutdown(self) -> Result<(), GatewayError> {
        log::info!("Shutting down gateway");
        self.discovery.shutdown();
        self.scheduler.await?;
        // The scheduler held the only sender, so this ends once drained
        self.manager.await?;

        let cancelled = self.registry.send(CancelAll).await?;
        log::info!("Cancelled {cancelled} sessions");
        Ok(())
    }
}
