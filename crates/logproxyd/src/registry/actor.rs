//! Registry actor - owns all session state and processes commands.
//!
//! The RegistryActor is the single owner of client session state.
//! It receives commands via an mpsc channel and publishes events via broadcast.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are logged but don't panic

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use logproxy_core::{ClientId, ClientMeta, PeerInfo, SessionState};

use super::commands::{RegistryCommand, RegistryError, RemovalReason, SessionEntry, SessionEvent};

/// Maximum number of sessions the registry can hold, admitted or not.
pub const MAX_SESSIONS: usize = 4096;

// ============================================================================
// Registry Actor
// ============================================================================

/// The registry actor - owns all session state.
///
/// Implements the actor pattern: receives commands via mpsc channel,
/// processes them sequentially, and publishes events to subscribers.
/// All state mutations happen within this single task.
pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryCommand>,

    /// Sessions keyed by client id. At most one per id.
    sessions: HashMap<ClientId, SessionEntry>,

    event_publisher: broadcast::Sender<SessionEvent>,
}

impl RegistryActor {
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        event_publisher: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            receiver,
            sessions: HashMap::new(),
            event_publisher,
        }
    }

    /// Runs the actor event loop.
    ///
    /// Processes commands until the channel closes (all senders dropped).
    pub async fn run(mut self) {
        info!("Registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!("Registry actor stopped (sessions: {})", self.sessions.len());
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Register { meta, respond_to } => {
                let result = self.handle_register(*meta);
                // Ignore send error - client may have dropped the receiver
                let _ = respond_to.send(result);
            }
            RegistryCommand::Advance {
                client_id,
                to,
                respond_to,
            } => {
                let result = self.handle_advance(&client_id, to);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Admit {
                client_id,
                max,
                respond_to,
            } => {
                let result = self.handle_admit(&client_id, max);
                let _ = respond_to.send(result);
            }
            RegistryCommand::AttachWorker {
                client_id,
                pid,
                respond_to,
            } => {
                let result = self.handle_attach_worker(&client_id, pid);
                let _ = respond_to.send(result);
            }
            RegistryCommand::GetSession {
                client_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.sessions.get(&client_id).cloned());
            }
            RegistryCommand::GetAllSessions { respond_to } => {
                let _ = respond_to.send(self.sessions.values().cloned().collect());
            }
            RegistryCommand::BeginClose {
                client_id,
                peer,
                reason,
                respond_to,
            } => {
                let result = self.handle_begin_close(&client_id, peer, reason);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Remove {
                client_id,
                peer,
                reason,
                respond_to,
            } => {
                let result = self.handle_remove(client_id, peer, reason);
                let _ = respond_to.send(result);
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_register(&mut self, meta: ClientMeta) -> Result<(), RegistryError> {
        if self.sessions.contains_key(&meta.id) {
            debug!(client_id = %meta.id, "Client already registered, rejecting");
            return Err(RegistryError::DuplicateClient(meta.id));
        }

        if self.sessions.len() >= MAX_SESSIONS {
            warn!(
                client_id = %meta.id,
                current = self.sessions.len(),
                max = MAX_SESSIONS,
                "Registry is full, rejecting registration"
            );
            return Err(RegistryError::RegistryFull { max: MAX_SESSIONS });
        }

        let client_id = meta.id.clone();
        let peer = meta.peer;
        self.sessions
            .insert(client_id.clone(), SessionEntry::new(meta, SessionState::Resolving));

        info!(
            client_id = %client_id,
            peer = %peer,
            total_sessions = self.sessions.len(),
            "Session registered"
        );

        let _ = self
            .event_publisher
            .send(SessionEvent::Registered { client_id, peer });

        Ok(())
    }

    /// Applies a validated state change and publishes it.
    fn transition(&mut self, client_id: &ClientId, to: SessionState) -> Result<(), RegistryError> {
        let entry = self
            .sessions
            .get_mut(client_id)
            .ok_or_else(|| RegistryError::ClientNotFound(client_id.clone()))?;

        let from = entry.state;
        if !from.can_transition_to(to) {
            return Err(RegistryError::InvalidTransition {
                client_id: client_id.clone(),
                from,
                to,
            });
        }

        entry.state = to;
        entry.state_since = Utc::now();
        debug!(client_id = %client_id, from = %from, to = %to, "Session state changed");

        let _ = self.event_publisher.send(SessionEvent::StateChanged {
            client_id: client_id.clone(),
            from,
            to,
        });
        Ok(())
    }

    fn handle_advance(&mut self, client_id: &ClientId, to: SessionState) -> Result<(), RegistryError> {
        self.transition(client_id, to)
    }

    fn handle_admit(&mut self, client_id: &ClientId, max: usize) -> Result<usize, RegistryError> {
        let state = self
            .sessions
            .get(client_id)
            .map(|e| e.state)
            .ok_or_else(|| RegistryError::ClientNotFound(client_id.clone()))?;
        if state != SessionState::QuotaCheck {
            return Err(RegistryError::InvalidTransition {
                client_id: client_id.clone(),
                from: state,
                to: SessionState::Spawning,
            });
        }

        let admitted = self.admitted_count();
        if admitted >= max {
            warn!(client_id = %client_id, admitted, max, "Worker quota exhausted");
            return Err(RegistryError::QuotaExceeded { max });
        }

        self.transition(client_id, SessionState::Spawning)?;
        Ok(admitted + 1)
    }

    fn handle_attach_worker(&mut self, client_id: &ClientId, pid: u32) -> Result<(), RegistryError> {
        self.transition(client_id, SessionState::Active)?;
        if let Some(entry) = self.sessions.get_mut(client_id) {
            entry.pid = Some(pid);
        }
        info!(client_id = %client_id, pid, "Worker attached");
        Ok(())
    }

    /// Looks up a session, honouring the optional connection filter.
    fn owned_by(&self, client_id: &ClientId, peer: Option<PeerInfo>) -> Option<&SessionEntry> {
        let current = self.sessions.get(client_id)?;
        match peer {
            Some(peer) if current.meta.peer != peer => {
                debug!(client_id = %client_id, peer = %peer, "Session belongs to another connection, keeping it");
                None
            }
            _ => Some(current),
        }
    }

    fn handle_begin_close(
        &mut self,
        client_id: &ClientId,
        peer: Option<PeerInfo>,
        reason: RemovalReason,
    ) -> Option<SessionEntry> {
        let before = self.owned_by(client_id, peer)?.clone();
        if before.state == SessionState::Closing {
            return None;
        }

        self.transition(client_id, SessionState::Closing).ok()?;
        if let Some(entry) = self.sessions.get_mut(client_id) {
            entry.closing = Some(reason);
        }
        debug!(client_id = %client_id, from = %before.state, reason = %reason, "Session closing");
        Some(before)
    }

    fn handle_remove(
        &mut self,
        client_id: ClientId,
        peer: Option<PeerInfo>,
        reason: RemovalReason,
    ) -> Option<SessionEntry> {
        let state = self.owned_by(&client_id, peer)?.state;
        if state != SessionState::Closing {
            let _ = self.transition(&client_id, SessionState::Closing);
        }
        let _ = self.transition(&client_id, SessionState::Closed);
        let entry = self.sessions.remove(&client_id)?;
        // the reason recorded when closing began wins
        let reason = entry.closing.unwrap_or(reason);

        info!(
            client_id = %client_id,
            pid = ?entry.pid,
            reason = %reason,
            remaining_sessions = self.sessions.len(),
            "Session removed"
        );

        let _ = self
            .event_publisher
            .send(SessionEvent::Removed { client_id, reason });

        Some(entry)
    }

    fn admitted_count(&self) -> usize {
        self.sessions.values().filter(|e| e.holds_quota()).count()
    }

    // ========================================================================
    // Accessors (for testing)
    // ========================================================================

    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logproxy_core::LogType;
    use tokio::sync::oneshot;

    fn meta(id: &str) -> ClientMeta {
        ClientMeta {
            log_type: LogType::OceanBase,
            id: ClientId::new(id),
            ip: "10.0.0.1".to_string(),
            version: "2.0.0".to_string(),
            packet_version: 2,
            configuration: String::new(),
            peer: PeerInfo::new(1, "127.0.0.1:4000".parse().unwrap(), 10),
            register_time: Utc::now(),
            enable_monitor: false,
        }
    }

    fn create_actor() -> (mpsc::Sender<RegistryCommand>, RegistryActor, broadcast::Receiver<SessionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = broadcast::channel(64);
        let actor = RegistryActor::new(cmd_rx, event_tx);
        (cmd_tx, actor, event_rx)
    }

    fn register(actor: &mut RegistryActor, id: &str) -> oneshot::Receiver<Result<(), RegistryError>> {
        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Register {
            meta: Box::new(meta(id)),
            respond_to: tx,
        });
        rx
    }

    fn advance(actor: &mut RegistryActor, id: &str, to: SessionState) -> oneshot::Receiver<Result<(), RegistryError>> {
        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Advance {
            client_id: ClientId::new(id),
            to,
            respond_to: tx,
        });
        rx
    }

    fn admit(actor: &mut RegistryActor, id: &str, max: usize) -> oneshot::Receiver<Result<usize, RegistryError>> {
        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Admit {
            client_id: ClientId::new(id),
            max,
            respond_to: tx,
        });
        rx
    }

    /// Registers `id` and walks it to `QuotaCheck`.
    async fn to_quota_check(actor: &mut RegistryActor, id: &str) {
        register(actor, id).await.unwrap().unwrap();
        advance(actor, id, SessionState::Authenticating).await.unwrap().unwrap();
        advance(actor, id, SessionState::QuotaCheck).await.unwrap().unwrap();
    }

    fn get(actor: &mut RegistryActor, id: &str) -> oneshot::Receiver<Option<SessionEntry>> {
        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::GetSession {
            client_id: ClientId::new(id),
            respond_to: tx,
        });
        rx
    }

    #[tokio::test]
    async fn test_register_session() {
        let (cmd_tx, mut actor, mut event_rx) = create_actor();

        let (respond_tx, respond_rx) = oneshot::channel();
        cmd_tx
            .send(RegistryCommand::Register {
                meta: Box::new(meta("c1")),
                respond_to: respond_tx,
            })
            .await
            .unwrap();

        // Process the command manually (actor not running in background)
        if let Some(cmd) = actor.receiver.recv().await {
            actor.handle_command(cmd);
        }

        assert!(respond_rx.await.unwrap().is_ok());
        assert_eq!(actor.session_count(), 1);

        let event = event_rx.try_recv().unwrap();
        assert!(matches!(event, SessionEvent::Registered { .. }));

        let entry = get(&mut actor, "c1").await.unwrap().unwrap();
        assert_eq!(entry.state, SessionState::Resolving);
        assert_eq!(entry.pid, None);
    }

    #[tokio::test]
    async fn test_register_duplicate_fails() {
        let (_, mut actor, _) = create_actor();

        register(&mut actor, "c1").await.unwrap().unwrap();
        let result = register(&mut actor, "c1").await.unwrap();

        assert_eq!(result, Err(RegistryError::DuplicateClient(ClientId::new("c1"))));
        assert_eq!(actor.session_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let (_, mut actor, _) = create_actor();
        register(&mut actor, "c1").await.unwrap().unwrap();

        let result = advance(&mut actor, "c1", SessionState::Active).await.unwrap();
        assert!(matches!(
            result,
            Err(RegistryError::InvalidTransition {
                from: SessionState::Resolving,
                to: SessionState::Active,
                ..
            })
        ));

        let result = advance(&mut actor, "ghost", SessionState::Authenticating).await.unwrap();
        assert!(matches!(result, Err(RegistryError::ClientNotFound(_))));
    }

    #[tokio::test]
    async fn test_admit_respects_quota() {
        let (_, mut actor, _) = create_actor();
        to_quota_check(&mut actor, "c1").await;
        to_quota_check(&mut actor, "c2").await;

        assert_eq!(admit(&mut actor, "c1", 1).await.unwrap(), Ok(1));
        assert_eq!(
            admit(&mut actor, "c2", 1).await.unwrap(),
            Err(RegistryError::QuotaExceeded { max: 1 })
        );

        let entry = get(&mut actor, "c2").await.unwrap().unwrap();
        assert_eq!(entry.state, SessionState::QuotaCheck);
    }

    #[tokio::test]
    async fn test_admit_requires_quota_check_state() {
        let (_, mut actor, _) = create_actor();
        register(&mut actor, "c1").await.unwrap().unwrap();

        let result = admit(&mut actor, "c1", 10).await.unwrap();
        assert!(matches!(result, Err(RegistryError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_attach_worker() {
        let (_, mut actor, _) = create_actor();
        to_quota_check(&mut actor, "c1").await;
        admit(&mut actor, "c1", 10).await.unwrap().unwrap();

        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::AttachWorker {
            client_id: ClientId::new("c1"),
            pid: 4242,
            respond_to: tx,
        });
        assert!(rx.await.unwrap().is_ok());

        let entry = get(&mut actor, "c1").await.unwrap().unwrap();
        assert_eq!(entry.state, SessionState::Active);
        assert_eq!(entry.pid, Some(4242));
    }

    #[tokio::test]
    async fn test_remove_checks_peer() {
        let (_, mut actor, _event_rx) = create_actor();
        register(&mut actor, "c1").await.unwrap().unwrap();

        let other = PeerInfo::new(2, "127.0.0.1:4001".parse().unwrap(), 10);
        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Remove {
            client_id: ClientId::new("c1"),
            peer: Some(other),
            reason: RemovalReason::WorkerExited,
            respond_to: tx,
        });
        assert!(rx.await.unwrap().is_none());
        assert_eq!(actor.session_count(), 1);

        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Remove {
            client_id: ClientId::new("c1"),
            peer: Some(meta("c1").peer),
            reason: RemovalReason::WorkerExited,
            respond_to: tx,
        });
        assert!(rx.await.unwrap().is_some());
        assert_eq!(actor.session_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_returns_entry_once() {
        let (_, mut actor, mut event_rx) = create_actor();
        register(&mut actor, "c1").await.unwrap().unwrap();
        let _ = event_rx.try_recv();

        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Remove {
            client_id: ClientId::new("c1"),
            peer: None,
            reason: RemovalReason::Closed,
            respond_to: tx,
        });
        let removed = rx.await.unwrap();
        assert_eq!(removed.map(|e| e.meta.id), Some(ClientId::new("c1")));

        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Remove {
            client_id: ClientId::new("c1"),
            peer: None,
            reason: RemovalReason::Closed,
            respond_to: tx,
        });
        assert!(rx.await.unwrap().is_none());
        assert_eq!(actor.session_count(), 0);

        let events: Vec<SessionEvent> = std::iter::from_fn(|| event_rx.try_recv().ok()).collect();
        assert!(matches!(
            events.as_slice(),
            [
                SessionEvent::StateChanged {
                    from: SessionState::Resolving,
                    to: SessionState::Closing,
                    ..
                },
                SessionEvent::StateChanged {
                    from: SessionState::Closing,
                    to: SessionState::Closed,
                    ..
                },
                SessionEvent::Removed {
                    reason: RemovalReason::Closed,
                    ..
                },
            ]
        ));
    }

    #[tokio::test]
    async fn test_get_all_sessions() {
        let (_, mut actor, _) = create_actor();
        for i in 0..3 {
            register(&mut actor, &format!("c{i}")).await.unwrap().unwrap();
        }

        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::GetAllSessions { respond_to: tx });
        assert_eq!(rx.await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_closed_session_frees_quota() {
        let (_, mut actor, _) = create_actor();
        to_quota_check(&mut actor, "c1").await;
        admit(&mut actor, "c1", 1).await.unwrap().unwrap();

        let (tx, _) = oneshot::channel();
        actor.handle_command(RegistryCommand::Remove {
            client_id: ClientId::new("c1"),
            peer: None,
            reason: RemovalReason::WorkerExited,
            respond_to: tx,
        });

        to_quota_check(&mut actor, "c2").await;
        assert_eq!(admit(&mut actor, "c2", 1).await.unwrap(), Ok(1));
    }

    fn begin_close(
        actor: &mut RegistryActor,
        id: &str,
        reason: RemovalReason,
    ) -> oneshot::Receiver<Option<SessionEntry>> {
        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::BeginClose {
            client_id: ClientId::new(id),
            peer: None,
            reason,
            respond_to: tx,
        });
        rx
    }

    fn remove(actor: &mut RegistryActor, id: &str, reason: RemovalReason) -> oneshot::Receiver<Option<SessionEntry>> {
        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Remove {
            client_id: ClientId::new(id),
            peer: None,
            reason,
            respond_to: tx,
        });
        rx
    }

    /// Walks `id` to `Active` with worker `pid`.
    async fn to_active(actor: &mut RegistryActor, id: &str, pid: u32) {
        to_quota_check(actor, id).await;
        admit(actor, id, 100).await.unwrap().unwrap();
        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::AttachWorker {
            client_id: ClientId::new(id),
            pid,
            respond_to: tx,
        });
        rx.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_begin_close_once() {
        let (_, mut actor, _) = create_actor();
        to_active(&mut actor, "c1", 4242).await;

        let before = begin_close(&mut actor, "c1", RemovalReason::Closed).await.unwrap();
        assert_eq!(before.map(|e| e.state), Some(SessionState::Active));
        assert!(begin_close(&mut actor, "c1", RemovalReason::ForceClosed)
            .await
            .unwrap()
            .is_none());

        let entry = get(&mut actor, "c1").await.unwrap().unwrap();
        assert_eq!(entry.state, SessionState::Closing);
        assert_eq!(entry.closing, Some(RemovalReason::Closed));
        assert_eq!(entry.pid, Some(4242));
    }

    #[tokio::test]
    async fn test_closing_session_blocks_duplicates_and_holds_quota() {
        let (_, mut actor, _) = create_actor();
        to_active(&mut actor, "c1", 4242).await;
        begin_close(&mut actor, "c1", RemovalReason::Closed).await.unwrap();

        let result = register(&mut actor, "c1").await.unwrap();
        assert_eq!(result, Err(RegistryError::DuplicateClient(ClientId::new("c1"))));

        to_quota_check(&mut actor, "c2").await;
        assert_eq!(
            admit(&mut actor, "c2", 1).await.unwrap(),
            Err(RegistryError::QuotaExceeded { max: 1 })
        );

        remove(&mut actor, "c1", RemovalReason::WorkerExited).await.unwrap();
        assert_eq!(admit(&mut actor, "c2", 1).await.unwrap(), Ok(1));
    }

    #[tokio::test]
    async fn test_removal_reports_closing_reason() {
        let (_, mut actor, mut event_rx) = create_actor();
        to_active(&mut actor, "c1", 4242).await;
        begin_close(&mut actor, "c1", RemovalReason::ForceClosed).await.unwrap();
        while event_rx.try_recv().is_ok() {}

        let removed = remove(&mut actor, "c1", RemovalReason::WorkerExited).await.unwrap().unwrap();
        assert_eq!(removed.state, SessionState::Closed);

        let events: Vec<SessionEvent> = std::iter::from_fn(|| event_rx.try_recv().ok()).collect();
        assert!(matches!(
            events.as_slice(),
            [
                SessionEvent::StateChanged {
                    from: SessionState::Closing,
                    to: SessionState::Closed,
                    ..
                },
                SessionEvent::Removed {
                    reason: RemovalReason::ForceClosed,
                    ..
                },
            ]
        ));
    }
}
