//! Registry actor commands, errors, and events.
//!
//! This module defines the message types for communicating with the `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `SessionEvent`: Events published by the registry for subscribers
//!
//! All types are designed for async message passing and follow the panic-free policy.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use logproxy_core::{ClientId, ClientMeta, PeerInfo, SessionState};

// ============================================================================
// Session Entry
// ============================================================================

/// One client session as stored by the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionEntry {
    pub meta: ClientMeta,
    pub state: SessionState,
    /// Worker pid, set once the session becomes `Active`.
    pub pid: Option<u32>,
    /// When the session entered its current state.
    pub state_since: DateTime<Utc>,
    /// Why the session is closing, once it is.
    pub closing: Option<RemovalReason>,
}

impl SessionEntry {
    pub fn new(meta: ClientMeta, state: SessionState) -> Self {
        Self {
            meta,
            state,
            pid: None,
            state_since: Utc::now(),
            closing: None,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.meta.id
    }

    /// Time since registration.
    pub fn age(&self) -> chrono::Duration {
        self.meta.age()
    }

    /// True while the session occupies a worker quota slot. A closing
    /// session keeps its slot until its worker has been reaped.
    pub fn holds_quota(&self) -> bool {
        self.state.is_admitted() || (self.state == SessionState::Closing && self.pid.is_some())
    }
}

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each command uses a oneshot channel for the response. The actor handles
/// commands one at a time, so every command is atomic with respect to the
/// others: two registrations for the same id cannot both succeed, and two
/// admissions cannot both take the last quota slot.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Register a session for a freshly parsed handshake.
    ///
    /// The session starts in `Resolving`.
    ///
    /// # Errors
    /// - `RegistryError::DuplicateClient` if a session with this id exists
    /// - `RegistryError::RegistryFull` if at maximum capacity
    Register {
        meta: Box<ClientMeta>,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Move a session to `to`.
    ///
    /// # Errors
    /// - `RegistryError::ClientNotFound` if the session doesn't exist
    /// - `RegistryError::InvalidTransition` if `to` is not a legal successor
    Advance {
        client_id: ClientId,
        to: SessionState,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Move a session from `QuotaCheck` to `Spawning` if fewer than `max`
    /// sessions are admitted. Responds with the admitted count including
    /// this one.
    ///
    /// # Errors
    /// - `RegistryError::QuotaExceeded` if `max` sessions are already admitted
    /// - `RegistryError::ClientNotFound`, `RegistryError::InvalidTransition`
    Admit {
        client_id: ClientId,
        max: usize,
        respond_to: oneshot::Sender<Result<usize, RegistryError>>,
    },

    /// Record the worker pid and move `Spawning` to `Active`.
    ///
    /// # Errors
    /// - `RegistryError::ClientNotFound` if the session was closed meanwhile
    /// - `RegistryError::InvalidTransition` if it is not `Spawning`
    AttachWorker {
        client_id: ClientId,
        pid: u32,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Get a single session by id.
    GetSession {
        client_id: ClientId,
        respond_to: oneshot::Sender<Option<SessionEntry>>,
    },

    /// Get all sessions.
    GetAllSessions {
        respond_to: oneshot::Sender<Vec<SessionEntry>>,
    },

    /// Move a session to `Closing` and record why.
    ///
    /// Responds with the entry as it was before closing, or `None` if there
    /// is no such session, it belongs to another connection, or it is
    /// already closing. Exactly one of any number of concurrent calls
    /// receives the entry.
    BeginClose {
        client_id: ClientId,
        peer: Option<PeerInfo>,
        reason: RemovalReason,
        respond_to: oneshot::Sender<Option<SessionEntry>>,
    },

    /// Remove a session, passing through `Closing` and `Closed`.
    ///
    /// Responds with the removed entry, or `None` if there was none. Exactly
    /// one of any number of concurrent removals receives the entry.
    ///
    /// With `peer` set, the session is only removed if it was registered
    /// from that connection; a newer session under the same id is kept.
    Remove {
        client_id: ClientId,
        peer: Option<PeerInfo>,
        reason: RemovalReason,
        respond_to: oneshot::Sender<Option<SessionEntry>>,
    },
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The registry has reached its maximum session capacity.
    #[error("registry is full (max: {max} sessions)")]
    RegistryFull { max: usize },

    #[error("client not found: {0}")]
    ClientNotFound(ClientId),

    /// A session with this id is already live.
    #[error("client already registered: {0}")]
    DuplicateClient(ClientId),

    #[error("client {client_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        client_id: ClientId,
        from: SessionState,
        to: SessionState,
    },

    #[error("worker quota exhausted (max: {max})")]
    QuotaExceeded { max: usize },

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

// ============================================================================
// Session Events
// ============================================================================

/// Events published by the registry to subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Registered { client_id: ClientId, peer: PeerInfo },

    StateChanged {
        client_id: ClientId,
        from: SessionState,
        to: SessionState,
    },

    Removed {
        client_id: ClientId,
        reason: RemovalReason,
    },
}

/// Reason why a session was removed from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Closed through `close_client`.
    Closed,

    /// The worker process exited and was reaped.
    WorkerExited,

    /// Closed administratively with an error code.
    ForceClosed,

    /// Never reached `Active` within the lease.
    Expired,

    /// Rejected during the handshake.
    Rejected,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::WorkerExited => write!(f, "worker exited"),
            Self::ForceClosed => write!(f, "force closed"),
            Self::Expired => write!(f, "initialization lease expired"),
            Self::Rejected => write!(f, "rejected during handshake"),
        }
    }
}
