//! TCP front end of the proxy.
//!
//! The Communicator:
//! - Owns the listening socket and accepts client connections
//! - Keeps the registry of live channels keyed by `PeerInfo`
//! - Runs one reader task per connection and dispatches frames to a
//!   `MessageHandler`
//! - Quiesces channel registration while a worker process is being forked
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Communicator   │
//! │                 │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ connection task │────▶│ MessageHandler  │
//! │  (per client)   │     │   (Arranger)    │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Accept errors are logged and allow continued operation

mod channel;
mod fork;

pub use channel::{Channel, CommError};
pub use fork::{ChildFdPlan, ForkGuard};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use logproxy_core::PeerInfo;
use logproxy_protocol::{Frame, FrameCodec, Message};

/// Channel registry keyed by connection.
pub type ChannelMap = Arc<RwLock<HashMap<PeerInfo, Arc<Channel>>>>;

/// Pause after a failed accept (e.g. descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What the connection task does after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventResult {
    /// Keep reading frames from this connection.
    Continue,
    /// Stop reading; the handler now owns the connection's fate.
    Stop,
}

/// Receives frames from connection tasks.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, peer: PeerInfo, frame: Frame) -> EventResult;

    /// Called when a connection ends before the handler returned `Stop`.
    async fn on_disconnect(&self, _peer: PeerInfo) {}
}

/// Tunables for the Communicator.
#[derive(Debug, Clone, Copy)]
pub struct CommunicatorConfig {
    pub max_packet_bytes: u32,
    /// Deadline for a new connection's first frame.
    pub first_frame_timeout: Duration,
}

pub struct Communicator {
    codec: FrameCodec,
    first_frame_timeout: Duration,
    listener: Mutex<Option<TcpListener>>,
    listener_fd: AtomicI32,
    channels: ChannelMap,
    /// Read-locked to change the channel registry, write-locked to fork.
    fork_gate: Arc<RwLock<()>>,
    connection_counter: AtomicU64,
    cancel_token: CancellationToken,
}

impl Communicator {
    pub fn new(config: CommunicatorConfig, cancel_token: CancellationToken) -> Self {
        Self {
            codec: FrameCodec::new(config.max_packet_bytes),
            first_frame_timeout: config.first_frame_timeout,
            listener: Mutex::new(None),
            listener_fd: AtomicI32::new(-1),
            channels: Arc::new(RwLock::new(HashMap::new())),
            fork_gate: Arc::new(RwLock::new(())),
            connection_counter: AtomicU64::new(0),
            cancel_token,
        }
    }

    /// Binds the listening socket and returns the bound address.
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr, CommError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| CommError::Bind {
            addr: addr.to_string(),
            error: e.to_string(),
        })?;
        let local = listener.local_addr().map_err(|e| CommError::Bind {
            addr: addr.to_string(),
            error: e.to_string(),
        })?;

        self.listener_fd.store(listener.as_raw_fd(), Ordering::Release);
        *self.listener.lock().await = Some(listener);

        info!(addr = %local, "Communicator listening");
        Ok(local)
    }

    /// Accepts connections until the cancellation token fires.
    pub async fn run(self: Arc<Self>, handler: Arc<dyn MessageHandler>) -> Result<(), CommError> {
        let listener = self.listener.lock().await.take().ok_or(CommError::NotListening)?;

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Communicator shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            self.register(stream, addr, &handler).await;
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
            }
        }

        self.listener_fd.store(-1, Ordering::Release);
        drop(listener);
        self.clear_channels().await;
        info!("Communicator stopped");
        Ok(())
    }

    async fn register(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr, handler: &Arc<dyn MessageHandler>) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let channel = {
            let _gate = self.fork_gate.read().await;
            let id = self.connection_counter.fetch_add(1, Ordering::Relaxed);
            let peer = PeerInfo::new(id, addr, stream.as_raw_fd());
            let channel = Arc::new(Channel::new(peer, stream, self.codec));
            self.channels.write().await.insert(peer, Arc::clone(&channel));
            channel
        };

        debug!(peer = %channel.peer(), "Accepted connection");
        tokio::spawn(Arc::clone(self).serve(channel, Arc::clone(handler)));
    }

    /// Reads frames from one connection until the handler stops it.
    async fn serve(self: Arc<Self>, channel: Arc<Channel>, handler: Arc<dyn MessageHandler>) {
        let peer = *channel.peer();
        let mut first = true;

        loop {
            let read = async {
                if first {
                    timeout(self.first_frame_timeout, channel.read_frame())
                        .await
                        .unwrap_or(Err(CommError::Timeout))
                } else {
                    channel.read_frame().await
                }
            };

            let result = tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                result = read => result,
            };

            match result {
                Ok(frame) => {
                    first = false;
                    if handler.on_message(peer, frame).await == EventResult::Stop {
                        return;
                    }
                }
                Err(CommError::Framing(e)) if !e.is_fatal() => {
                    warn!(peer = %peer, error = %e, "Skipping frame");
                }
                Err(CommError::Eof) => {
                    debug!(peer = %peer, "Peer closed connection");
                    break;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Dropping connection");
                    break;
                }
            }
        }

        handler.on_disconnect(peer).await;
        channel.shutdown();
        self.remove_channel(&peer).await;
    }

    pub async fn get_channel(&self, peer: &PeerInfo) -> Option<Arc<Channel>> {
        self.channels.read().await.get(peer).cloned()
    }

    /// Drops the proxy's reference to a channel. Idempotent.
    ///
    /// The socket is not shut down here; a worker may own it.
    pub async fn remove_channel(&self, peer: &PeerInfo) -> bool {
        let _gate = self.fork_gate.read().await;
        let removed = self.channels.write().await.remove(peer).is_some();
        if removed {
            debug!(peer = %peer, "Channel removed");
        }
        removed
    }

    /// Shuts down and drops every channel.
    pub async fn clear_channels(&self) {
        let _gate = self.fork_gate.read().await;
        let mut channels = self.channels.write().await;
        for channel in channels.values() {
            channel.shutdown();
        }
        let count = channels.len();
        channels.clear();
        if count > 0 {
            info!(count, "Cleared channels");
        }
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn send_message(&self, peer: &PeerInfo, message: &Message, version: u16) -> Result<(), CommError> {
        let channel = self.get_channel(peer).await.ok_or(CommError::PeerNotFound(*peer))?;
        channel.send(message, version).await
    }

    /// Blocks channel registration until the returned guard is released.
    pub async fn prepare_for_fork(&self) -> ForkGuard {
        let gate = Arc::clone(&self.fork_gate).write_owned().await;
        let fd = self.listener_fd.load(Ordering::Acquire);
        ForkGuard::new(gate, (fd >= 0).then_some(fd))
    }

    /// Stops the accept loop; channels are cleared when it exits.
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}
