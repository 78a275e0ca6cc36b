//! Shared helpers for the proxy integration suites.
//!
//! `sleep 30` stands in for the worker program: it inherits the client
//! socket and holds it open until it is killed.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use logproxy_core::{ClientId, ClientMeta, OblogConfig, ProxyConfig};
use logproxy_protocol::{
    ErrorCode, Frame, FrameCodec, HandshakeRequest, HandshakeResponse, Message, HEADER_LEN,
};
use logproxyd::arranger::{AllowAll, Arranger, AuthError, Authenticator};
use logproxyd::registry::SessionEntry;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

// ============================================================================
// Constants
// ============================================================================

pub const MAX_PACKET: u32 = 64 * 1024;
pub const VERSION: u16 = 2;
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub const TENANT_CONFIG: &str =
    "cluster_url=http://127.0.0.1:8080/services cluster_user=u@t1 cluster_password=p tb_white_list=t1.db.*";

// ============================================================================
// Proxy
// ============================================================================

pub fn test_config(work_root: &Path) -> ProxyConfig {
    ProxyConfig {
        service_port: 0,
        bind_address: "127.0.0.1".to_string(),
        max_packet_bytes: MAX_PACKET,
        command_timeout_s: 1,
        oblogreader_path: work_root.to_path_buf(),
        oblogreader_max_count: 8,
        gc_interval_s: 3600,
        worker_stop_grace_s: 1,
        auth_user: false,
        worker_program: Some("sleep".into()),
        worker_args: Some(vec!["30".to_string()]),
        metric_enable: false,
        ..ProxyConfig::default()
    }
}

pub struct TestProxy {
    pub arranger: Arc<Arranger>,
    pub addr: SocketAddr,
    run: Option<JoinHandle<()>>,
    pub work_root: TempDir,
}

impl TestProxy {
    pub async fn start() -> Self {
        Self::start_with(|_| {}, Arc::new(AllowAll)).await
    }

    pub async fn start_with(
        tweak: impl FnOnce(&mut ProxyConfig),
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let work_root = tempfile::tempdir().expect("create work root");
        let mut config = test_config(work_root.path());
        tweak(&mut config);

        let arranger = Arranger::new(config, authenticator).expect("create arranger");
        let addr = arranger.init().await.expect("bind listener");

        let runner = Arc::clone(&arranger);
        let run = tokio::spawn(async move {
            let _ = runner.run().await;
        });

        TestProxy {
            arranger,
            addr,
            run: Some(run),
            work_root,
        }
    }

    pub async fn connect(&self) -> TestClient {
        TestClient::connect(self.addr).await
    }

    pub async fn session(&self, id: &str) -> Option<SessionEntry> {
        self.arranger.session(&ClientId::new(id)).await
    }

    /// Polls until the session reaches a worker pid.
    pub async fn wait_for_pid(&self, id: &str) -> u32 {
        let deadline = Instant::now() + IO_TIMEOUT;
        loop {
            if let Some(pid) = self.arranger.worker_pid(&ClientId::new(id)).await {
                return pid;
            }
            assert!(Instant::now() < deadline, "session {id} never became active");
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Polls until the session is gone.
    pub async fn wait_for_removal(&self, id: &str) {
        let deadline = Instant::now() + IO_TIMEOUT;
        while self.session(id).await.is_some() {
            assert!(Instant::now() < deadline, "session {id} was never removed");
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Shuts the proxy down and waits for workers to be collected.
    pub async fn stop(mut self) {
        self.arranger.shutdown();
        if let Some(run) = self.run.take() {
            timeout(IO_TIMEOUT, run)
                .await
                .expect("arranger stops in time")
                .expect("arranger task");
        }
        timeout(IO_TIMEOUT, self.arranger.supervisor().join_reapers())
            .await
            .expect("reapers finish in time");
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.arranger.shutdown();
    }
}

// ============================================================================
// Client
// ============================================================================

pub fn handshake_request(id: &str) -> HandshakeRequest {
    HandshakeRequest {
        log_type: 0,
        client_id: id.to_string(),
        ip: "127.0.0.1".to_string(),
        version: "2.0.0".to_string(),
        configuration: TENANT_CONFIG.to_string(),
        enable_monitor: false,
    }
}

pub struct TestClient {
    stream: TcpStream,
    codec: FrameCodec,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to proxy");
        TestClient {
            stream,
            codec: FrameCodec::new(MAX_PACKET),
        }
    }

    pub async fn send_frame(&mut self, frame: &Frame) {
        let bytes = self.codec.encode(frame).expect("encode frame");
        self.send_raw(&bytes).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write to proxy");
    }

    pub async fn send_handshake(&mut self, id: &str) {
        let frame = Message::HandshakeRequest(handshake_request(id)).to_frame(VERSION);
        self.send_frame(&frame).await;
    }

    /// Next message, or `None` once the proxy closed the connection.
    pub async fn read_message(&mut self) -> Option<Message> {
        let read = async {
            let mut header = [0u8; HEADER_LEN];
            if self.stream.read_exact(&mut header).await.is_err() {
                return None;
            }
            let header = self.codec.decode_header(&header).expect("valid header");
            let mut payload = vec![0u8; header.size as usize];
            self.stream.read_exact(&mut payload).await.ok()?;
            let frame = Frame::new(header.msg_type, header.version, payload);
            Some(Message::from_frame(&frame).expect("valid payload"))
        };
        timeout(IO_TIMEOUT, read).await.expect("proxy answered in time")
    }

    pub async fn expect_success(&mut self) -> HandshakeResponse {
        match self.read_message().await {
            Some(Message::HandshakeResponse(response)) => {
                assert!(response.success);
                response
            }
            other => panic!("expected handshake response, got {other:?}"),
        }
    }

    pub async fn expect_error(&mut self) -> ErrorCode {
        match self.read_message().await {
            Some(Message::Error(error)) => error.code,
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    pub async fn expect_eof(&mut self) {
        let mut buf = [0u8; 1];
        let read = timeout(IO_TIMEOUT, self.stream.read(&mut buf))
            .await
            .expect("connection closed in time");
        // a reset counts as closed too
        assert!(matches!(read, Ok(0) | Err(_)), "expected EOF, got {read:?}");
    }
}

// ============================================================================
// Authenticators
// ============================================================================

/// Never finishes, keeping sessions in `Authenticating`.
pub struct StallingAuth;

#[async_trait]
impl Authenticator for StallingAuth {
    async fn auth(&self, _client: &ClientMeta, _config: &OblogConfig) -> Result<(), AuthError> {
        std::future::pending().await
    }
}

/// Rejects everyone.
pub struct DenyAll;

#[async_trait]
impl Authenticator for DenyAll {
    async fn auth(&self, _client: &ClientMeta, _config: &OblogConfig) -> Result<(), AuthError> {
        Err(AuthError::SysTenantDenied)
    }
}
