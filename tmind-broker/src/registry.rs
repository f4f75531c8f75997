use actix::prelude::*;
use std::collections::HashMap;
use thiserror::Error;
use tmind_radio::DeviceId;
use tokio::sync::watch;

use crate::session::SessionState;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Discovery window already open")]
    WindowAlreadyOpen,
    #[error("No active session for {0}")]
    UnknownSession(DeviceId),
}

/// Explicit discovery window state. Only the discovery scheduler drives the
/// transitions, everyone else only reads it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryWindow {
    Closed,
    Open,
}

struct SessionEntry {
    state: SessionState,
    /// Flipped to `true` to cancel the session's periodic reads
    cancel: watch::Sender<bool>,
}

/// Single owner of the gateway's scheduling state: which devices have an
/// active session (and what state each is in), and whether a discovery
/// window is open. Being an actor, every check-and-modify below is atomic
/// with respect to every other, which is what makes session deduplication
/// and the one-window rule hold without locks.
pub struct SessionRegistry {
    sessions: HashMap<DeviceId, SessionEntry>,
    window: DiscoveryWindow,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            window: DiscoveryWindow::Closed,
        }
    }

    pub fn register(&mut self, id: DeviceId, cancel: watch::Sender<bool>) -> bool {
        if self.sessions.contains_key(&id) {
            log::debug!("Session for {id} already active");
            return false;
        }

        log::debug!("Registering session {id}");
        self.sessions.insert(
            id,
            SessionEntry {
                state: SessionState::Discovered,
                cancel,
            },
        );
        true
    }

    /// Removes the session and cancels its periodic reads. Returns false if
    /// there was nothing to remove
    pub fn unregister(&mut self, id: &DeviceId) -> bool {
        if let Some(entry) = self.sessions.remove(id) {
            entry.cancel.send_replace(true);
            log::debug!("Unregistered session {id} (was {:?})", entry.state);
            true
        } else {
            false
        }
    }

    pub fn is_discovery_open(&self) -> bool {
        self.window == DiscoveryWindow::Open
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Actor for SessionRegistry {
    type Context = Context<Self>;
}

/// Atomically check for and create a session. Responds `false` when a
/// session for the device is already active
#[derive(Message)]
#[rtype(result = "bool")]
pub struct RegisterSession {
    pub id: DeviceId,
    pub cancel: watch::Sender<bool>,
}

impl Handler<RegisterSession> for SessionRegistry {
    type Result = bool;

    fn handle(&mut self, msg: RegisterSession, _ctx: &mut Self::Context) -> Self::Result {
        self.register(msg.id, msg.cancel)
    }
}

#[derive(Message)]
#[rtype(result = "bool")]
pub struct UnregisterSession {
    pub id: DeviceId,
}

impl Handler<UnregisterSession> for SessionRegistry {
    type Result = bool;

    fn handle(&mut self, msg: UnregisterSession, _ctx: &mut Self::Context) -> Self::Result {
        self.unregister(&msg.id)
    }
}

/// Record a session's new lifecycle state
#[derive(Message)]
#[rtype(result = "SessionTransitionResponse")]
pub struct SessionTransition {
    pub id: DeviceId,
    pub state: SessionState,
}
type SessionTransitionResponse = Result<(), RegistryError>;

impl Handler<SessionTransition> for SessionRegistry {
    type Result = SessionTransitionResponse;

    fn handle(&mut self, msg: SessionTransition, _ctx: &mut Self::Context) -> Self::Result {
        let entry = self
            .sessions
            .get_mut(&msg.id)
            .ok_or(RegistryError::UnknownSession(msg.id))?;
        entry.state = msg.state;
        Ok(())
    }
}

/// List active sessions, sorted by device id
#[derive(Message)]
#[rtype(result = "Vec<(DeviceId, SessionState)>")]
pub struct ActiveSessions;

impl Handler<ActiveSessions> for SessionRegistry {
    type Result = MessageResult<ActiveSessions>;

    fn handle(&mut self, _msg: ActiveSessions, _ctx: &mut Self::Context) -> Self::Result {
        let mut sessions = self
            .sessions
            .iter()
            .map(|(id, entry)| (id.clone(), entry.state))
            .collect::<Vec<_>>();
        sessions.sort_by(|a, b| a.0.canonical().cmp(b.0.canonical()));
        MessageResult(sessions)
    }
}

/// Cancel and drop every session, used on shutdown
#[derive(Message)]
#[rtype(result = "usize")]
pub struct CancelAll;

impl Handler<CancelAll> for SessionRegistry {
    type Result = usize;

    fn handle(&mut self, _msg: CancelAll, _ctx: &mut Self::Context) -> Self::Result {
        let ids = self.sessions.keys().cloned().collect::<Vec<_>>();
        ids.iter().filter(|id| self.unregister(id)).count()
    }
}

#[derive(Message)]
#[rtype(result = "bool")]
pub struct IsDiscoveryOpen;

impl Handler<IsDiscoveryOpen> for SessionRegistry {
    type Result = bool;

    fn handle(&mut self, _msg: IsDiscoveryOpen, _ctx: &mut Self::Context) -> Self::Result {
        self.is_discovery_open()
    }
}

/// Closed -> Open. Rejected if a window is already open
#[derive(Message)]
#[rtype(result = "OpenWindowResponse")]
pub struct OpenWindow;
type OpenWindowResponse = Result<(), RegistryError>;

impl Handler<OpenWindow> for SessionRegistry {
    type Result = OpenWindowResponse;

    fn handle(&mut self, _msg: OpenWindow, _ctx: &mut Self::Context) -> Self::Result {
        match self.window {
            DiscoveryWindow::Open => Err(RegistryError::WindowAlreadyOpen),
            DiscoveryWindow::Closed => {
                self.window = DiscoveryWindow::Open;
                Ok(())
            }
        }
    }
}

/// Open -> Closed. Responds whether a window was actually open
#[derive(Message)]
#[rtype(result = "bool")]
pub struct CloseWindow;

impl Handler<CloseWindow> for SessionRegistry {
    type Result = bool;

    fn handle(&mut self, _msg: CloseWindow, _ctx: &mut Self::Context) -> Self::Result {
        let was_open = self.is_discovery_open();
        self.window = DiscoveryWindow::Closed;
        was_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix::test]
    async fn register_is_idempotent_per_device() {
        let registry = SessionRegistry::new().start();
        let (first, _) = watch::channel(false);
        let (second, second_rx) = watch::channel(false);

        assert!(registry
            .send(RegisterSession {
                id: DeviceId::new("AA:BB"),
                cancel: first,
            })
            .await
            .unwrap());
        assert!(!registry
            .send(RegisterSession {
                id: DeviceId::new("aa:bb"),
                cancel: second,
            })
            .await
            .unwrap());

        // The rejected registration's cancel handle was dropped with it
        assert!(second_rx.has_changed().is_err());

        let active = registry.send(ActiveSessions).await.unwrap();
        assert_eq!(active, vec![(DeviceId::new("AA:BB"), SessionState::Discovered)]);
    }

    #[actix::test]
    async fn unregister_cancels_session() {
        let registry = SessionRegistry::new().start();
        let (cancel, cancel_rx) = watch::channel(false);
        let id = DeviceId::new("AA:BB");

        registry
            .send(RegisterSession {
                id: id.clone(),
                cancel,
            })
            .await
            .unwrap();
        registry
            .send(SessionTransition {
                id: id.clone(),
                state: SessionState::Connecting,
            })
            .await
            .unwrap()
            .unwrap();

        assert!(registry
            .send(UnregisterSession { id: id.clone() })
            .await
            .unwrap());
        assert!(*cancel_rx.borrow());
        assert!(!registry.send(UnregisterSession { id: id.clone() }).await.unwrap());

        assert!(matches!(
            registry
                .send(SessionTransition {
                    id,
                    state: SessionState::Announced,
                })
                .await
                .unwrap(),
            Err(RegistryError::UnknownSession(_))
        ));
    }

    #[actix::test]
    async fn window_transitions_are_guarded() {
        let registry = SessionRegistry::new().start();

        assert!(!registry.send(IsDiscoveryOpen).await.unwrap());
        assert!(registry.send(OpenWindow).await.unwrap().is_ok());
        assert!(registry.send(IsDiscoveryOpen).await.unwrap());
        assert!(matches!(
            registry.send(OpenWindow).await.unwrap(),
            Err(RegistryError::WindowAlreadyOpen)
        ));

        assert!(registry.send(CloseWindow).await.unwrap());
        assert!(!registry.send(CloseWindow).await.unwrap());
        assert!(!registry.send(IsDiscoveryOpen).await.unwrap());
    }

    #[actix::test]
    async fn cancel_all_drains_registry() {
        let registry = SessionRegistry::new().start();
        let mut receivers = vec![];
        for id in ["AA:BB", "CC:DD"] {
            let (cancel, rx) = watch::channel(false);
            receivers.push(rx);
            registry
                .send(RegisterSession {
                    id: DeviceId::new(id),
                    cancel,
                })
                .await
                .unwrap();
        }

        assert_eq!(registry.send(CancelAll).await.unwrap(), 2);
        assert!(receivers.iter().all(|rx| *rx.borrow()));
        assert!(registry.send(ActiveSessions).await.unwrap().is_empty());
    }
}
