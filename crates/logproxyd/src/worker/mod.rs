//! Worker process entry point.
//!
//! A worker serves exactly one client. The proxy starts it with the client's
//! socket inherited and the work directory named in the environment; the
//! worker runs the log reader and streams its records back to the client.
//!
//! Exit codes: `0` when the source is exhausted or the client leaves, `1` on
//! a runtime failure, `2` when the hand-off cannot be used.

mod handoff;
mod pipeline;

pub use handoff::{
    discard_handoff, HandoffError, WorkerHandoff, WorkerSettings, CHANNEL_FD_ENV, HANDOFF_FILE,
    WORKER_DIR_ENV,
};
pub use pipeline::{run_pipeline, CommandSource, PipelineEnd, PipelineStats, RecordSource};

use std::env;
use std::os::fd::{FromRawFd, RawFd};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{error, info};

use logproxy_protocol::FramingError;

/// Log file inside the work directory.
pub const WORKER_LOG: &str = "log/worker.log";

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error("cannot enter work directory {path}: {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Handoff(#[from] HandoffError),

    #[error("inherited descriptor {value:?} is unusable: {reason}")]
    BadChannel { value: String, reason: String },

    #[error("no reader_command configured")]
    NoReader,

    #[error("log reader failed: {0}")]
    Source(#[source] std::io::Error),

    #[error("log reader exited with {0}")]
    SourceExited(String),

    #[error("record of {size} bytes exceeds the {max} byte frame limit")]
    RecordTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),

    #[error("send timed out")]
    SendTimeout,

    #[error("pipeline task failed: {0}")]
    Task(String),

    #[error("logging setup failed: {0}")]
    Logging(String),
}

impl WorkerError {
    fn task(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::MissingEnv(_) | Self::WorkDir { .. } | Self::Handoff(_) | Self::BadChannel { .. } => 2,
            _ => 1,
        }
    }
}

/// Runs the worker to completion.
pub async fn run() -> Result<PipelineEnd, WorkerError> {
    let dir = env::var_os(WORKER_DIR_ENV)
        .map(PathBuf::from)
        .ok_or(WorkerError::MissingEnv(WORKER_DIR_ENV))?;
    env::set_current_dir(&dir).map_err(|source| WorkerError::WorkDir {
        path: dir.clone(),
        source,
    })?;

    let handoff = WorkerHandoff::take_from(Path::new("."))?;
    crate::logging::init_file(Path::new(WORKER_LOG), handoff.settings.verbose)
        .map_err(|e| WorkerError::Logging(e.to_string()))?;

    let client = &handoff.client;
    info!(
        client_id = %client.id,
        peer = %client.peer,
        pid = std::process::id(),
        readonly = handoff.settings.readonly,
        "Worker starting"
    );

    let result = serve(&handoff).await;
    match &result {
        Ok(end) => info!(client_id = %client.id, end = ?end, "Worker finished"),
        Err(e) => error!(client_id = %client.id, error = %e, "Worker failed"),
    }
    result
}

async fn serve(handoff: &WorkerHandoff) -> Result<PipelineEnd, WorkerError> {
    let stream = adopt_channel()?;

    let command = handoff
        .settings
        .reader_command
        .as_deref()
        .ok_or(WorkerError::NoReader)?;
    let max_record = handoff.settings.max_packet_bytes as usize;
    let source = CommandSource::start(command, &handoff.oblog_config, max_record).await?;

    run_pipeline(source, stream, &handoff.settings, handoff.client.packet_version).await
}

/// Takes ownership of the client socket named by `LOGPROXY_CHANNEL_FD`.
fn adopt_channel() -> Result<TcpStream, WorkerError> {
    let value = env::var(CHANNEL_FD_ENV).map_err(|_| WorkerError::MissingEnv(CHANNEL_FD_ENV))?;
    let bad = |reason: String| WorkerError::BadChannel {
        value: value.clone(),
        reason,
    };

    let fd: RawFd = value.trim().parse().map_err(|_| bad("not a descriptor number".to_string()))?;
    if fd < 0 {
        return Err(bad("negative descriptor".to_string()));
    }
    // SAFETY: fcntl(2) only queries the descriptor flags.
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
        return Err(bad(std::io::Error::last_os_error().to_string()));
    }

    // SAFETY: the descriptor was inherited for this worker and nothing else owns it.
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
    std_stream
        .set_nonblocking(true)
        .map_err(|e| bad(e.to_string()))?;
    TcpStream::from_std(std_stream).map_err(|e| bad(e.to_string()))
}
