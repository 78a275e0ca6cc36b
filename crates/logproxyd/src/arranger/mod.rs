//! Session orchestration.
//!
//! The Arranger owns the Communicator, the client registry and the process
//! supervisor. It drives each client through the handshake:
//!
//! ```text
//! handshake frame ─▶ parse ─▶ register ─▶ resolve ─▶ auth ─▶ quota
//!                                                             │
//!        client ◀─ HandshakeResponse ◀────────────────────────┘
//!                         │
//!                         ▼
//!                   spawn worker ─▶ release channel ─▶ Active
//! ```
//!
//! Any failure after registration closes the session with one Error frame.
//!
//! Closing a session whose worker is alive shuts the client socket down and
//! stops the worker, but the session stays registered as `Closing`, holding
//! its id and its quota slot, until the reaper reports the exit. Worker exits
//! come back through [`WorkerExitListener`] and finish the session they
//! served.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Teardown errors are logged and swallowed

mod auth;
mod error;
mod gc;

pub use auth::{AllowAll, AuthError, Authenticator, UpstreamAuthenticator, UpstreamUser};
pub use error::ArrangeError;
pub use gc::GcReport;

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use logproxy_core::{
    cipher, ClientId, ClientMeta, OblogConfig, PeerInfo, ProxyConfig, SessionState,
};
use logproxy_protocol::{ErrorCode, Frame, HandshakeResponse, Message, MessageType, ProtocolVersion};

use crate::communicator::{
    CommError, Communicator, CommunicatorConfig, EventResult, MessageHandler,
};
use crate::monitor::spawn_monitor_task;
use crate::registry::{spawn_registry, RegistryHandle, RemovalReason, SessionEntry, SessionEvent};
use crate::supervisor::{
    ProcessSupervisor, SpawnError, SupervisorConfig, WorkerExit, WorkerExitListener,
};
use crate::worker::{WorkerHandoff, WorkerSettings};

/// Version reported in handshake responses.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct Arranger {
    me: Weak<Arranger>,
    config: Arc<ProxyConfig>,
    communicator: Arc<Communicator>,
    registry: RegistryHandle,
    supervisor: Arc<ProcessSupervisor>,
    authenticator: Arc<dyn Authenticator>,
    cancel_token: CancellationToken,
    local_addr: OnceLock<SocketAddr>,
}

impl Arranger {
    /// Builds the arranger and spawns the registry actor.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: ProxyConfig, authenticator: Arc<dyn Authenticator>) -> Result<Arc<Self>, SpawnError> {
        let supervisor = ProcessSupervisor::new(SupervisorConfig::from_config(&config)?);
        let cancel_token = CancellationToken::new();
        let communicator = Communicator::new(
            CommunicatorConfig {
                max_packet_bytes: config.max_packet_bytes,
                first_frame_timeout: config.command_timeout(),
            },
            cancel_token.clone(),
        );

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config: Arc::new(config),
            communicator: Arc::new(communicator),
            registry: spawn_registry(),
            supervisor: Arc::new(supervisor),
            authenticator,
            cancel_token,
            local_addr: OnceLock::new(),
        }))
    }

    /// Binds the listening socket.
    pub async fn init(&self) -> Result<SocketAddr, CommError> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.service_port);
        let local = self.communicator.listen(&addr).await?;
        let _ = self.local_addr.set(local);
        Ok(local)
    }

    /// Serves clients until [`Arranger::shutdown`] is called.
    ///
    /// On return every session is closing and every worker has been sent
    /// SIGTERM; sessions are removed as their workers are reaped.
    pub async fn run(self: &Arc<Self>) -> Result<(), CommError> {
        let gc = tokio::spawn(gc::gc_pid_routine(Arc::clone(self)));
        let monitor = self.config.metric_enable.then(|| {
            spawn_monitor_task(
                Arc::clone(&self.supervisor),
                self.config.metric_interval(),
                self.cancel_token.clone(),
            )
        });

        info!(
            max_workers = self.config.oblogreader_max_count,
            work_root = %self.config.oblogreader_path.display(),
            "Arranger running"
        );

        let handler: Arc<dyn MessageHandler> = Arc::clone(self) as Arc<dyn MessageHandler>;
        let result = Arc::clone(&self.communicator).run(handler).await;

        self.cancel_token.cancel();
        self.close_all().await;
        let _ = gc.await;
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }

        info!("Arranger stopped");
        result
    }

    pub fn shutdown(&self) {
        info!("Arranger shutdown requested");
        self.cancel_token.cancel();
    }

    async fn close_all(&self) {
        for entry in self.registry.get_all_sessions().await {
            self.close_client_force(entry.client_id(), ErrorCode::ForceClosed, "proxy shutting down")
                .await;
        }
        self.supervisor.shutdown();
    }

    // ========================================================================
    // Handshake
    // ========================================================================

    async fn handshake(&self, peer: PeerInfo, frame: Frame) {
        let version = frame.version;

        let meta = match parse_handshake(peer, &frame) {
            Ok(meta) => meta,
            Err(e) => {
                self.reject(peer, version, &e).await;
                return;
            }
        };
        info!(client = %meta, "Handshake received");

        if let Err(e) = self.registry.register(meta.clone()).await {
            // an existing session with this id is left alone
            self.reject(peer, version, &e.into()).await;
            return;
        }

        if let Err(e) = self.establish(&meta).await {
            warn!(client_id = %meta.id, code = %e.code(), error = %e, "Session setup failed");
            self.teardown(&meta.id, Some(peer), RemovalReason::Rejected, Some((e.code(), &e.to_string())))
                .await;
        }
    }

    async fn establish(&self, client: &ClientMeta) -> Result<u32, ArrangeError> {
        let oblog = self.resolve(client)?;
        self.registry.advance(&client.id, SessionState::Authenticating).await?;

        self.auth(client, &oblog).await?;
        self.registry.advance(&client.id, SessionState::QuotaCheck).await?;

        self.check_quota(client).await?;
        self.respond_success(client).await?;
        self.create(client, &oblog).await
    }

    /// Sends an Error frame to a peer that never got a session, then drops it.
    async fn reject(&self, peer: PeerInfo, version: u16, err: &ArrangeError) {
        warn!(peer = %peer, code = %err.code(), error = %err, "Handshake rejected");
        if let Some(channel) = self.communicator.get_channel(&peer).await {
            if let Err(e) = channel.send(&Message::error(err.code(), err.to_string()), version).await {
                debug!(peer = %peer, error = %e, "Could not deliver rejection");
            }
            channel.shutdown();
        }
        self.communicator.remove_channel(&peer).await;
    }

    /// Parses the tenant configuration and applies the system account.
    pub fn resolve(&self, client: &ClientMeta) -> Result<OblogConfig, ArrangeError> {
        let mut oblog = OblogConfig::parse(&client.configuration)?;
        oblog.validate(self.config.allow_all_tenant)?;

        if self.config.has_sys_account() && oblog.sys_user.is_empty() {
            let key = &self.config.cipher_key;
            oblog.sys_user = cipher::decrypt(key, &self.config.ob_sys_username)
                .map_err(|e| ArrangeError::SysAccount(e.to_string()))?;
            oblog.sys_password = cipher::decrypt(key, &self.config.ob_sys_password)
                .map_err(|e| ArrangeError::SysAccount(e.to_string()))?;
        }

        debug!(client_id = %client.id, config = %oblog, "Configuration resolved");
        Ok(oblog)
    }

    pub async fn auth(&self, client: &ClientMeta, oblog: &OblogConfig) -> Result<(), ArrangeError> {
        if !self.config.auth_user {
            return Ok(());
        }
        self.authenticator.auth(client, oblog).await?;
        Ok(())
    }

    /// Admits the session if the worker quota allows it.
    pub async fn check_quota(&self, client: &ClientMeta) -> Result<(), ArrangeError> {
        let admitted = self
            .registry
            .admit(&client.id, self.config.oblogreader_max_count)
            .await?;
        debug!(
            client_id = %client.id,
            admitted,
            max = self.config.oblogreader_max_count,
            "Session admitted"
        );
        Ok(())
    }

    async fn respond_success(&self, client: &ClientMeta) -> Result<(), ArrangeError> {
        let channel = self
            .communicator
            .get_channel(&client.peer)
            .await
            .ok_or_else(|| ArrangeError::Spawn(format!("connection {} is gone", client.peer)))?;

        let server_ip = channel.local_addr().map(|a| a.ip().to_string()).unwrap_or_default();
        let response = Message::HandshakeResponse(HandshakeResponse::success(server_ip, SERVER_VERSION));
        channel
            .send(&response, client.packet_version)
            .await
            .map_err(|e| ArrangeError::Spawn(format!("cannot send handshake response: {e}")))
    }

    /// Starts the worker for `client` and hands it the connection.
    pub async fn create(&self, client: &ClientMeta, oblog: &OblogConfig) -> Result<u32, ArrangeError> {
        let channel = self
            .communicator
            .get_channel(&client.peer)
            .await
            .ok_or_else(|| ArrangeError::Spawn(format!("connection {} is gone", client.peer)))?;
        let listener: Arc<dyn WorkerExitListener> = self
            .me
            .upgrade()
            .ok_or_else(|| ArrangeError::Spawn("proxy is shutting down".to_string()))?;

        let handoff = WorkerHandoff {
            client: client.clone(),
            oblog_config: oblog.to_config_string(),
            settings: WorkerSettings::from_config(&self.config),
        };
        let pid = self
            .supervisor
            .spawn(&self.communicator, &channel, &handoff, listener)
            .await
            .map_err(|e| ArrangeError::Spawn(e.to_string()))?;

        // the worker owns the connection now
        self.communicator.remove_channel(&client.peer).await;
        drop(channel);

        if let Err(e) = self.registry.attach_worker(&client.id, pid).await {
            warn!(client_id = %client.id, pid, error = %e, "Session gone before worker attached");
            self.supervisor.terminate(pid);
            return Err(e.into());
        }

        info!(client_id = %client.id, pid, "Session active");
        Ok(pid)
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Closes a session. Returns true only for the call that tore it down.
    pub async fn close_client(&self, client_id: &ClientId) -> bool {
        self.teardown(client_id, None, RemovalReason::Closed, None).await
    }

    /// Closes a session, telling the client why if it is still connected
    /// to the proxy.
    pub async fn close_client_force(&self, client_id: &ClientId, code: ErrorCode, reason: &str) -> bool {
        self.teardown(client_id, None, RemovalReason::ForceClosed, Some((code, reason)))
            .await
    }

    /// Closes the session (only if it still belongs to `peer`, when given)
    /// and releases its connection. A live worker is stopped and the session
    /// is left `Closing` until the worker is reaped; otherwise it is removed
    /// at once.
    async fn teardown(
        &self,
        client_id: &ClientId,
        peer: Option<PeerInfo>,
        reason: RemovalReason,
        notify: Option<(ErrorCode, &str)>,
    ) -> bool {
        let Some(entry) = self.registry.begin_close(client_id, peer, reason).await else {
            return false;
        };

        let peer = entry.meta.peer;
        if let Some(channel) = self.communicator.get_channel(&peer).await {
            if let Some((code, message)) = notify {
                if let Err(e) = channel
                    .send(&Message::error(code, message), entry.meta.packet_version)
                    .await
                {
                    debug!(client_id = %client_id, error = %e, "Could not deliver error frame");
                }
            }
            channel.shutdown();
            self.communicator.remove_channel(&peer).await;
        }

        let pid = entry.pid.or_else(|| self.supervisor.pid_of(client_id));
        if let Some(pid) = pid.filter(|pid| self.supervisor.stop_worker(client_id, *pid)) {
            info!(
                client_id = %client_id,
                pid,
                state = %entry.state,
                reason = %reason,
                "Session closing, waiting for worker exit"
            );
            return true;
        }

        self.registry.remove_if_peer(client_id, peer, reason).await;
        info!(
            client_id = %client_id,
            state = %entry.state,
            reason = %reason,
            "Session closed"
        );
        true
    }

    /// Finishes the session of a worker that is gone.
    ///
    /// Returns false if the session was already removed, or belongs to a
    /// newer connection.
    async fn collect_exited(&self, client_id: &ClientId, peer: PeerInfo) -> bool {
        if self
            .teardown(client_id, Some(peer), RemovalReason::WorkerExited, None)
            .await
        {
            return true;
        }
        // a close already in progress was waiting for this exit
        match self
            .registry
            .remove_if_peer(client_id, peer, RemovalReason::WorkerExited)
            .await
        {
            Some(entry) => {
                info!(
                    client_id = %client_id,
                    reason = ?entry.closing,
                    "Session closed after worker exit"
                );
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub async fn session(&self, client_id: &ClientId) -> Option<SessionEntry> {
        self.registry.get_session(client_id).await
    }

    pub async fn sessions(&self) -> Vec<SessionEntry> {
        self.registry.get_all_sessions().await
    }

    pub async fn worker_pid(&self, client_id: &ClientId) -> Option<u32> {
        self.registry.get_session(client_id).await.and_then(|e| e.pid)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.registry.subscribe()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn communicator(&self) -> &Arc<Communicator> {
        &self.communicator
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }
}

/// Validates the first frame of a connection.
fn parse_handshake(peer: PeerInfo, frame: &Frame) -> Result<ClientMeta, ArrangeError> {
    if frame.msg_type != MessageType::HandshakeRequest {
        return Err(ArrangeError::BadHandshake(format!(
            "expected a handshake request, got {:?}",
            frame.msg_type
        )));
    }
    ProtocolVersion::from_code(frame.version).map_err(|e| ArrangeError::BadHandshake(e.to_string()))?;

    let request = match Message::from_frame(frame) {
        Ok(Message::HandshakeRequest(request)) => request,
        Ok(other) => {
            return Err(ArrangeError::BadHandshake(format!(
                "unexpected {:?} payload",
                other.msg_type()
            )))
        }
        Err(e) => return Err(ArrangeError::BadHandshake(e.to_string())),
    };

    request
        .to_client_meta(peer, frame.version)
        .map_err(|e| ArrangeError::BadHandshake(e.to_string()))
}

#[async_trait]
impl MessageHandler for Arranger {
    async fn on_message(&self, peer: PeerInfo, frame: Frame) -> EventResult {
        self.handshake(peer, frame).await;
        EventResult::Stop
    }

    async fn on_disconnect(&self, peer: PeerInfo) {
        debug!(peer = %peer, "Connection ended before handshake");
    }
}

#[async_trait]
impl WorkerExitListener for Arranger {
    async fn on_worker_exit(&self, exit: WorkerExit) {
        if exit.success() {
            info!(pid = exit.pid, client_id = %exit.client_id, "Worker exited");
        } else {
            warn!(
                pid = exit.pid,
                client_id = %exit.client_id,
                status = %exit.describe(),
                "Worker exited abnormally"
            );
        }

        if !self.collect_exited(&exit.client_id, exit.peer).await {
            debug!(pid = exit.pid, client_id = %exit.client_id, "Session already closed");
        }
    }
}
