//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` provides a cheap-to-clone interface for sending commands
//! to the registry actor and subscribing to session events.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use tokio::sync::{broadcast, mpsc, oneshot};

use logproxy_core::{ClientId, ClientMeta, PeerInfo, SessionState};

use super::commands::{RegistryCommand, RegistryError, RemovalReason, SessionEntry, SessionEvent};

/// Handle for interacting with the registry actor.
///
/// This is a cheap-to-clone handle that can be shared across tasks.
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
    event_sender: broadcast::Sender<SessionEvent>,
}

impl RegistryHandle {
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Sends a command built around a fresh oneshot and awaits the reply.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Register a session (insert-if-absent).
    ///
    /// # Errors
    ///
    /// - `RegistryError::DuplicateClient` if a session with this id exists
    /// - `RegistryError::RegistryFull` if the registry is at maximum capacity
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn register(&self, meta: ClientMeta) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::Register {
            meta: Box::new(meta),
            respond_to,
        })
        .await?
    }

    pub async fn advance(&self, client_id: &ClientId, to: SessionState) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::Advance {
            client_id: client_id.clone(),
            to,
            respond_to,
        })
        .await?
    }

    /// Admit a session waiting in `QuotaCheck` if fewer than `max` are admitted.
    pub async fn admit(&self, client_id: &ClientId, max: usize) -> Result<usize, RegistryError> {
        self.request(|respond_to| RegistryCommand::Admit {
            client_id: client_id.clone(),
            max,
            respond_to,
        })
        .await?
    }

    pub async fn attach_worker(&self, client_id: &ClientId, pid: u32) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::AttachWorker {
            client_id: client_id.clone(),
            pid,
            respond_to,
        })
        .await?
    }

    /// Returns `None` if the session doesn't exist or the actor is gone.
    pub async fn get_session(&self, client_id: &ClientId) -> Option<SessionEntry> {
        self.request(|respond_to| RegistryCommand::GetSession {
            client_id: client_id.clone(),
            respond_to,
        })
        .await
        .ok()
        .flatten()
    }

    /// Returns an empty vector if communication with the actor fails.
    pub async fn get_all_sessions(&self) -> Vec<SessionEntry> {
        self.request(|respond_to| RegistryCommand::GetAllSessions { respond_to })
            .await
            .unwrap_or_default()
    }

    /// Start closing a session, returning it as it was if this call did.
    ///
    /// With `peer` set, only a session registered from that connection is
    /// closed.
    pub async fn begin_close(
        &self,
        client_id: &ClientId,
        peer: Option<PeerInfo>,
        reason: RemovalReason,
    ) -> Option<SessionEntry> {
        self.request(|respond_to| RegistryCommand::BeginClose {
            client_id: client_id.clone(),
            peer,
            reason,
            respond_to,
        })
        .await
        .ok()
        .flatten()
    }

    /// Remove a session, returning it if this call removed it.
    pub async fn remove(&self, client_id: &ClientId, reason: RemovalReason) -> Option<SessionEntry> {
        self.request(|respond_to| RegistryCommand::Remove {
            client_id: client_id.clone(),
            peer: None,
            reason,
            respond_to,
        })
        .await
        .ok()
        .flatten()
    }

    /// Like [`RegistryHandle::remove`], but only if the session belongs to
    /// the connection `peer`.
    pub async fn remove_if_peer(
        &self,
        client_id: &ClientId,
        peer: PeerInfo,
        reason: RemovalReason,
    ) -> Option<SessionEntry> {
        self.request(|respond_to| RegistryCommand::Remove {
            client_id: client_id.clone(),
            peer: Some(peer),
            reason,
            respond_to,
        })
        .await
        .ok()
        .flatten()
    }

    /// Subscribe to session events.
    ///
    /// This is a synchronous operation - it doesn't communicate with the actor.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_sender.subscribe()
    }

    /// Returns `true` if the command channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
