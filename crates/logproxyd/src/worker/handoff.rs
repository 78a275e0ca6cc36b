//! Session hand-off from the proxy to a worker process.
//!
//! The proxy writes `handoff.json` into the client's work directory before
//! starting the worker, and passes the directory and the inherited socket
//! descriptor through the environment. The file carries credentials, so the
//! worker deletes it as soon as it has been read; the proxy deletes it too if
//! the worker never starts, and again once the worker is reaped.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use logproxy_core::{ClientMeta, ProxyConfig};

/// File name of the hand-off inside the work directory.
pub const HANDOFF_FILE: &str = "handoff.json";

/// Environment variable naming the worker's work directory.
pub const WORKER_DIR_ENV: &str = "LOGPROXY_WORKER_DIR";

/// Environment variable carrying the inherited client socket descriptor.
pub const CHANNEL_FD_ENV: &str = "LOGPROXY_CHANNEL_FD";

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("failed to write hand-off: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to read hand-off: {0}")]
    Read(#[source] std::io::Error),

    #[error("malformed hand-off: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Pipeline settings copied from the proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub reader_command: Option<String>,
    pub record_queue_size: usize,
    pub send_batch_size: usize,
    pub send_timeout_us: u64,
    pub max_packet_bytes: u32,
    /// Read records but never send them.
    pub readonly: bool,
    pub verbose: bool,
    pub verbose_packet: bool,
}

impl WorkerSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            reader_command: config.reader_command.clone(),
            record_queue_size: config.record_queue_size,
            send_batch_size: config.send_batch_size,
            send_timeout_us: config.send_timeout_us,
            max_packet_bytes: config.max_packet_bytes,
            readonly: config.debug || config.readonly,
            verbose: config.verbose,
            verbose_packet: config.verbose_packet,
        }
    }
}

/// Everything a worker needs to serve one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHandoff {
    pub client: ClientMeta,
    /// Resolved tenant configuration, `k=v` separated by spaces.
    pub oblog_config: String,
    pub settings: WorkerSettings,
}

impl WorkerHandoff {
    /// Writes the hand-off into `dir`, readable by the owner only.
    pub fn write_to(&self, dir: &Path) -> Result<(), HandoffError> {
        let json = serde_json::to_vec_pretty(self)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(dir.join(HANDOFF_FILE))
            .map_err(HandoffError::Write)?;
        file.write_all(&json).map_err(HandoffError::Write)
    }

    pub fn read_from(dir: &Path) -> Result<Self, HandoffError> {
        let raw = fs::read(dir.join(HANDOFF_FILE)).map_err(HandoffError::Read)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Reads the hand-off and deletes the file, even if it is malformed.
    pub fn take_from(dir: &Path) -> Result<Self, HandoffError> {
        let handoff = Self::read_from(dir);
        discard_handoff(dir).map_err(HandoffError::Read)?;
        handoff
    }
}

/// Deletes the hand-off in `dir`. A missing file is not an error.
pub fn discard_handoff(dir: &Path) -> io::Result<()> {
    match fs::remove_file(dir.join(HANDOFF_FILE)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
