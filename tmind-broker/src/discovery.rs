use actix::Addr;
use futures::future;
use std::sync::Arc;
use tmind_radio::{DiscoveryStream, SensorDevice, SensorRadio};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::{Duration, Instant},
};

use crate::registry::{CloseWindow, OpenWindow, RegistryError, SessionRegistry};

/// Why a window is being opened, for the logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenReason {
    Start,
    SessionEnded,
    Announced,
    IdleRestart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Requested,
    Timeout,
    ScannerStopped,
    Shutdown,
}

#[derive(Debug)]
pub enum DiscoveryCommand {
    Open(OpenReason),
    Close,
    Shutdown,
}

/// Cheap, cloneable handle used by the rest of the gateway to steer
/// discovery. Commands are applied in order by the scheduler task, so a
/// close followed by an open can never interleave with another open
#[derive(Debug, Clone)]
pub struct DiscoveryHandle(pub(crate) UnboundedSender<DiscoveryCommand>);

impl DiscoveryHandle {
    /// Open a window and arm its timeout. No-op if a window is open
    pub fn start(&self) {
        self.send(DiscoveryCommand::Open(OpenReason::Start));
    }

    /// Close any open window and disarm its timeout. Idempotent
    pub fn stop(&self) {
        self.send(DiscoveryCommand::Close);
    }

    /// Open a window only if discovery is idle
    pub fn reopen_if_idle(&self, reason: OpenReason) {
        self.send(DiscoveryCommand::Open(reason));
    }

    pub fn shutdown(&self) {
        self.send(DiscoveryCommand::Shutdown);
    }

    fn send(&self, cmd: DiscoveryCommand) {
        if let Err(e) = self.0.send(cmd) {
            log::debug!("Discovery scheduler gone, dropping {:?}", e.0);
        }
    }
}

/// Drives repeating, time-bounded discovery windows on the radio and
/// forwards every discovered device to the session manager.
///
/// A window closes on timeout, on request (a session was just created and
/// needs the radio for setup), or when the radio's scanner stops by itself.
/// Window state lives in the [`SessionRegistry`]; this task is the only one
/// that changes it.
pub struct DiscoveryScheduler {
    radio: Arc<dyn SensorRadio>,
    registry: Addr<SessionRegistry>,
    window: Duration,
    restart: Option<Duration>,
    commands: UnboundedReceiver<DiscoveryCommand>,
    discovered: UnboundedSender<Arc<dyn SensorDevice>>,
    stream: Option<DiscoveryStream>,
    deadline: Option<Instant>,
    restart_at: Option<Instant>,
}

impl DiscoveryScheduler {
    pub fn new(
        radio: Arc<dyn SensorRadio>,
        registry: Addr<SessionRegistry>,
        window: Duration,
        restart: Option<Duration>,
        discovered: UnboundedSender<Arc<dyn SensorDevice>>,
    ) -> (Self, DiscoveryHandle) {
        let (sender, commands) = unbounded_channel();
        (
            Self {
                radio,
                registry,
                window,
                restart,
                commands,
                discovered,
                stream: None,
                deadline: None,
                restart_at: None,
            },
            DiscoveryHandle(sender),
        )
    }

    pub async fn event_loop(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(DiscoveryCommand::Open(reason)) => self.open(reason).await,
                        Some(DiscoveryCommand::Close) => self.close(CloseReason::Requested).await,
                        Some(DiscoveryCommand::Shutdown) | None => {
                            self.close(CloseReason::Shutdown).await;
                            break;
                        }
                    }
                }
                device = next_device(&mut self.stream) => {
                    match device {
                        Some(device) => {
                            log::trace!("Discovered {}", device.id());
                            if self.discovered.send(device).is_err() {
                                log::error!("Session manager gone, dropping discovered device");
                            }
                        }
                        None => {
                            log::warn!("Radio ended discovery while window open");
                            self.close(CloseReason::ScannerStopped).await;
                        }
                    }
                }
                _ = sleep_until(self.deadline) => {
                    self.close(CloseReason::Timeout).await;
                }
                _ = sleep_until(self.restart_at) => {
                    self.restart_at = None;
                    self.open(OpenReason::IdleRestart).await;
                }
            }
        }
        log::warn!("Discovery scheduler exiting event loop");
    }

    async fn open(&mut self, reason: OpenReason) {
        match self.registry.send(OpenWindow).await {
            Ok(Ok(())) => {}
            Ok(Err(RegistryError::WindowAlreadyOpen)) => {
                log::debug!("Discovery already open, ignoring open ({reason:?})");
                return;
            }
            Ok(Err(e)) => {
                log::error!("Unable to open discovery window {e:}");
                return;
            }
            Err(e) => {
                log::error!("Registry unavailable, not opening discovery {e:}");
                return;
            }
        }

        match self.radio.start_discovery().await {
            Ok(stream) => {
                log::info!("Start discovering ({reason:?})");
                self.stream = Some(stream);
                self.deadline = Some(Instant::now() + self.window);
                self.restart_at = None;
            }
            Err(e) => {
                log::error!("Unable to start discovery {e:}");
                self.registry.send(CloseWindow).await.ok();
                self.arm_restart();
            }
        }
    }

    async fn close(&mut self, reason: CloseReason) {
        self.stream = None;
        self.deadline = None;

        match reason {
            CloseReason::Timeout | CloseReason::ScannerStopped => self.arm_restart(),
            CloseReason::Requested | CloseReason::Shutdown => self.restart_at = None,
        }

        let was_open = self.registry.send(CloseWindow).await.unwrap_or_else(|e| {
            log::error!("Registry unavailable while closing discovery {e:}");
            true
        });
        if !was_open {
            log::trace!("Discovery already closed ({reason:?})");
            return;
        }

        if let Err(e) = self.radio.stop_discovery().await {
            log::error!("Error stopping discovery {e:}");
        }

        if reason == CloseReason::Timeout {
            log::info!("Discovery halted after {:?}", self.window);
        } else {
            log::info!("Stop discovering ({reason:?})");
        }
    }

    fn arm_restart(&mut self) {
        if let Some(pause) = self.restart {
            log::info!("Discovery restarts in {pause:?}");
            self.restart_at = Some(Instant::now() + pause);
        }
    }
}

async fn next_device(stream: &mut Option<DiscoveryStream>) -> Option<Arc<dyn SensorDevice>> {
    match stream {
        Some(stream) => stream.recv().await,
        None => future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
