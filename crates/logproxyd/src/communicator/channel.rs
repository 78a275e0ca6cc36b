//! A single client connection.
//!
//! A `Channel` owns both halves of an accepted TCP stream. Frames are read by
//! the connection task that the Communicator spawns; writes may come from any
//! task and are serialized by the writer lock.
//!
//! Dropping a channel closes the proxy's descriptor but never shuts the
//! socket down: after a hand-off a worker process owns the same socket.
//! Only [`Channel::shutdown`] ends the connection for both sides.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - I/O failures are returned as `CommError`

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, trace};

use logproxy_core::PeerInfo;
use logproxy_protocol::{Frame, FrameCodec, FramingError, Message, HEADER_LEN};

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised by the communicator and its channels.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: String, error: String },

    #[error("Listener is not bound")]
    NotListening,

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerInfo),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Channel already shut down")]
    Closed,
}

impl CommError {
    fn io(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            CommError::Eof
        } else {
            CommError::Io(err.to_string())
        }
    }
}

pub struct Channel {
    peer: PeerInfo,
    local_addr: Option<SocketAddr>,
    codec: FrameCodec,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    shut_down: AtomicBool,
}

impl Channel {
    /// Wraps an accepted stream. `peer.fd` must be the stream's descriptor.
    pub fn new(peer: PeerInfo, stream: TcpStream, codec: FrameCodec) -> Self {
        let local_addr = stream.local_addr().ok();
        let (reader, writer) = stream.into_split();
        Self {
            peer,
            local_addr,
            codec,
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// Proxy-side address of the connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn raw_fd(&self) -> RawFd {
        self.peer.fd
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Reads one frame.
    ///
    /// A frame of unknown type is consumed in full and reported as
    /// `FramingError::UnknownMessageType` so the caller can keep reading.
    pub async fn read_frame(&self) -> Result<Frame, CommError> {
        let mut reader = self.reader.lock().await;

        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await.map_err(CommError::io)?;

        let header = match self.codec.decode_header(&header) {
            Ok(h) => h,
            Err(FramingError::UnknownMessageType { code, size }) => {
                let mut skipped = (&mut *reader).take(u64::from(size));
                tokio::io::copy(&mut skipped, &mut tokio::io::sink())
                    .await
                    .map_err(CommError::io)?;
                return Err(FramingError::UnknownMessageType { code, size }.into());
            }
            Err(e) => return Err(e.into()),
        };

        let mut payload = vec![0u8; header.size as usize];
        reader.read_exact(&mut payload).await.map_err(CommError::io)?;

        trace!(peer = %self.peer, msg_type = ?header.msg_type, size = header.size, "Received frame");
        Ok(Frame::new(header.msg_type, header.version, payload))
    }

    /// Sends a message encoded at protocol `version`.
    pub async fn send(&self, message: &Message, version: u16) -> Result<(), CommError> {
        self.send_frame(&message.to_frame(version)).await
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<(), CommError> {
        let bytes = self.codec.encode(frame)?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(CommError::Closed)?;

        match timeout(WRITE_TIMEOUT, async {
            writer.write_all(&bytes).await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CommError::io(e)),
            Err(_) => Err(CommError::WriteTimeout),
        }
    }

    /// Shuts the socket down in both directions.
    ///
    /// Returns true for the call that performed the shutdown; later calls are
    /// no-ops.
    pub fn shutdown(&self) -> bool {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        // SAFETY: the descriptor stays open while `self` owns the stream halves.
        let rc = unsafe { libc::shutdown(self.peer.fd, libc::SHUT_RDWR) };
        if rc != 0 {
            debug!(
                peer = %self.peer,
                error = %std::io::Error::last_os_error(),
                "Socket shutdown failed (peer probably gone)"
            );
        }
        true
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // OwnedWriteHalf half-closes the socket on drop; a worker may own it now.
        if let Some(writer) = self.writer.get_mut().take() {
            writer.forget();
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
