//! Worker process supervision.
//!
//! The supervisor starts one worker process per admitted client, hands it the
//! client's socket, and reaps it when it exits.
//!
//! # Architecture
//!
//! ```text
//!   spawn()                         worker process
//!     │ write handoff.json              ▲
//!     │ ForkGuard (no new channels)     │ exec, inherits client fd only
//!     └──▶ spawn thread ──fork/exec─────┘
//!                                        │ exit
//!   reaper task ◀── waitid(WNOWAIT) ─────┘
//!     │ drop pid entry, shutdown(client socket)
//!     │ wait, delete handoff.json
//!     └ WorkerExitListener::on_worker_exit
//! ```
//!
//! Stopping a worker shuts its client socket down in both directions, sends
//! SIGTERM, and escalates to SIGKILL if the process outlives the grace
//! period.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A poisoned pid table lock is recovered, never propagated

mod reaper;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::os::fd::BorrowedFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use logproxy_core::{is_process_alive, ClientId, PeerInfo, ProxyConfig, SourceMeta};

use crate::communicator::{Channel, Communicator};
use crate::worker::{discard_handoff, HandoffError, WorkerHandoff, CHANNEL_FD_ENV, WORKER_DIR_ENV};

/// Subcommand the proxy binary runs as a worker.
pub const WORKER_SUBCOMMAND: &str = "worker";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("cannot locate worker program: {0}")]
    Program(#[source] io::Error),

    #[error("cannot prepare work directory {path}: {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Handoff(#[from] HandoffError),

    #[error("cannot duplicate client socket: {0}")]
    DupSocket(#[source] io::Error),

    #[error("cannot start spawn thread: {0}")]
    Thread(#[source] io::Error),

    #[error("spawn thread exited without a result")]
    ThreadLost,

    #[error("failed to start worker: {0}")]
    Exec(#[source] io::Error),
}

// ============================================================================
// Exit notification
// ============================================================================

/// A reaped worker.
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub pid: u32,
    pub client_id: ClientId,
    /// Connection the worker served.
    pub peer: PeerInfo,
    /// `None` when the status could not be collected.
    pub status: Option<ExitStatus>,
}

impl WorkerExit {
    /// Human-readable exit status, e.g. `exit code 1` or `signal 9`.
    pub fn describe(&self) -> String {
        match self.status {
            Some(status) => match (status.code(), status.signal()) {
                (Some(code), _) => format!("exit code {code}"),
                (None, Some(signal)) => format!("signal {signal}"),
                (None, None) => "unknown".to_string(),
            },
            None => "unknown".to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.status.is_some_and(|s| s.success())
    }
}

/// Notified by the reaper once per worker exit.
#[async_trait]
pub trait WorkerExitListener: Send + Sync + 'static {
    async fn on_worker_exit(&self, exit: WorkerExit);
}

// ============================================================================
// Pid table
// ============================================================================

/// A live worker. The entry is dropped as soon as the process is known to
/// have exited, while it is still an unreaped zombie.
struct SourceEntry {
    meta: SourceMeta,
    /// Duplicate of the client socket, used to shut it down on stop or exit.
    socket: Option<TcpStream>,
    /// Distinguishes this spawn from a later one that reuses the pid.
    serial: u64,
}

impl SourceEntry {
    fn shutdown_socket(&mut self) {
        if let Some(socket) = self.socket.take() {
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                debug!(pid = self.meta.pid, error = %e, "Client socket already closed");
            }
        }
    }
}

type SourceTable = Arc<Mutex<HashMap<u32, SourceEntry>>>;

fn lock(table: &SourceTable) -> MutexGuard<'_, HashMap<u32, SourceEntry>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Supervisor
// ============================================================================

/// How workers are started.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Parent of the per-client work directories.
    pub work_root: PathBuf,
    /// Time between SIGTERM and SIGKILL when stopping a worker.
    pub stop_grace: Duration,
}

impl SupervisorConfig {
    /// Uses `worker_program`/`worker_args`, or this executable's `worker`
    /// subcommand.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, SpawnError> {
        let program = match &config.worker_program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(SpawnError::Program)?,
        };
        let args = config
            .worker_args
            .clone()
            .unwrap_or_else(|| vec![WORKER_SUBCOMMAND.to_string()]);
        Ok(Self {
            program,
            args,
            work_root: config.oblogreader_path.clone(),
            stop_grace: config.stop_grace(),
        })
    }
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    sources: SourceTable,
    /// Serializes process creation.
    spawn_lock: Arc<Mutex<()>>,
    reapers: Mutex<Vec<JoinHandle<()>>>,
    next_serial: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            sources: Arc::new(Mutex::new(HashMap::new())),
            spawn_lock: Arc::new(Mutex::new(())),
            reapers: Mutex::new(Vec::new()),
            next_serial: AtomicU64::new(1),
        }
    }

    /// Starts a worker that takes over `channel`.
    ///
    /// Returns once the process exists; its reaper is already running. The
    /// caller still owns `channel` and should drop it from the Communicator.
    pub async fn spawn(
        &self,
        communicator: &Communicator,
        channel: &Channel,
        handoff: &WorkerHandoff,
        listener: Arc<dyn WorkerExitListener>,
    ) -> Result<u32, SpawnError> {
        let client = &handoff.client;
        let work_dir = self.config.work_root.join(client.id.as_str());

        let prepared = {
            let work_dir = work_dir.clone();
            let handoff = handoff.clone();
            tokio::task::spawn_blocking(move || {
                fs::create_dir_all(&work_dir).map_err(|source| SpawnError::WorkDir {
                    path: work_dir.clone(),
                    source,
                })?;
                handoff.write_to(&work_dir)?;
                Ok::<(), SpawnError>(())
            })
            .await
            .map_err(|_| SpawnError::ThreadLost)?
        };
        prepared?;

        let (child, socket) = match self.launch(communicator, channel, &work_dir).await {
            Ok(launched) => launched,
            Err(e) => {
                // the worker never read its hand-off
                if let Err(err) = discard_handoff(&work_dir) {
                    warn!(work_dir = %work_dir.display(), error = %err, "Failed to remove hand-off");
                }
                return Err(e);
            }
        };
        let pid = child.id();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);

        {
            let mut table = lock(&self.sources);
            let previous = table.insert(
                pid,
                SourceEntry {
                    meta: SourceMeta::new(client.log_type, pid, client.id.clone()),
                    socket: Some(socket),
                    serial,
                },
            );
            if let Some(previous) = previous {
                warn!(pid, client_id = %previous.meta.client_id, "Replaced stale pid entry");
            }
        }

        let reaper = reaper::spawn_reaper(
            Arc::clone(&self.sources),
            child,
            work_dir.clone(),
            client.id.clone(),
            client.peer,
            listener,
        );
        {
            let mut reapers = self.reapers.lock().unwrap_or_else(PoisonError::into_inner);
            reapers.retain(|r| !r.is_finished());
            reapers.push(reaper);
        }

        info!(
            client_id = %client.id,
            pid,
            program = %self.config.program.display(),
            work_dir = %work_dir.display(),
            "Worker started"
        );
        Ok(pid)
    }

    /// Forks and execs the worker with only the client socket inherited.
    async fn launch(
        &self,
        communicator: &Communicator,
        channel: &Channel,
        work_dir: &Path,
    ) -> Result<(Child, TcpStream), SpawnError> {
        // SAFETY: `channel` keeps the descriptor open for the duration of the borrow.
        let socket = unsafe { BorrowedFd::borrow_raw(channel.raw_fd()) }
            .try_clone_to_owned()
            .map(TcpStream::from)
            .map_err(SpawnError::DupSocket)?;

        let guard = communicator.prepare_for_fork().await;
        let plan = guard.child_plan(channel);

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .env(WORKER_DIR_ENV, work_dir)
            .env(CHANNEL_FD_ENV, plan.channel_fd().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        // SAFETY: the plan only calls close(2) and fcntl(2).
        unsafe {
            command.pre_exec(move || plan.apply());
        }

        let (tx, rx) = oneshot::channel();
        let serial = Arc::clone(&self.spawn_lock);
        std::thread::Builder::new()
            .name("worker-spawn".to_string())
            .spawn(move || {
                let _serial = serial.lock().unwrap_or_else(PoisonError::into_inner);
                let _ = tx.send(command.spawn());
            })
            .map_err(SpawnError::Thread)?;
        let spawned = rx.await;
        guard.after_fork();

        let child = spawned.map_err(|_| SpawnError::ThreadLost)?.map_err(SpawnError::Exec)?;
        Ok((child, socket))
    }

    /// Stops a live worker.
    ///
    /// Returns false if the pid is unknown or has already exited.
    pub fn terminate(&self, pid: u32) -> bool {
        let mut table = lock(&self.sources);
        self.stop_locked(&mut table, pid)
    }

    /// Stops `pid` only if it is the worker serving `client_id`.
    pub fn stop_worker(&self, client_id: &ClientId, pid: u32) -> bool {
        let mut table = lock(&self.sources);
        let serves = table.get(&pid).is_some_and(|e| &e.meta.client_id == client_id);
        serves && self.stop_locked(&mut table, pid)
    }

    /// Shuts the client socket down, sends SIGTERM, and arms the SIGKILL
    /// timer.
    fn stop_locked(&self, table: &mut HashMap<u32, SourceEntry>, pid: u32) -> bool {
        let Some(entry) = table.get_mut(&pid) else {
            return false;
        };
        entry.shutdown_socket();
        if !signal(pid, libc::SIGTERM) {
            return false;
        }
        self.arm_kill(pid, entry.serial);
        true
    }

    fn arm_kill(&self, pid: u32, serial: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let sources = Arc::clone(&self.sources);
        let grace = self.config.stop_grace;
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            let table = lock(&sources);
            if table.get(&pid).is_some_and(|e| e.serial == serial) && signal(pid, libc::SIGKILL) {
                warn!(pid, grace_ms = grace.as_millis() as u64, "Worker ignored SIGTERM, killed");
            }
        });
    }

    /// Reconciles the pid table with the process table.
    ///
    /// Live workers have their liveness timestamp refreshed. Workers whose
    /// process is gone are dropped, their client socket shut down, and
    /// returned.
    pub fn sweep(&self) -> Vec<SourceMeta> {
        let candidates: Vec<u32> = lock(&self.sources).keys().copied().collect();

        let (alive, dead): (Vec<u32>, Vec<u32>) = candidates.into_iter().partition(|pid| is_process_alive(*pid));

        let mut table = lock(&self.sources);
        for pid in alive {
            if let Some(entry) = table.get_mut(&pid) {
                entry.meta.touch();
            }
        }

        let mut gone = Vec::new();
        for pid in dead {
            if let Some(mut entry) = table.remove(&pid) {
                entry.shutdown_socket();
                warn!(pid, client_id = %entry.meta.client_id, "Worker vanished");
                gone.push(entry.meta);
            }
        }
        gone
    }

    pub fn pid_of(&self, client_id: &ClientId) -> Option<u32> {
        lock(&self.sources)
            .values()
            .find(|e| &e.meta.client_id == client_id)
            .map(|e| e.meta.pid)
    }

    pub fn source(&self, pid: u32) -> Option<SourceMeta> {
        lock(&self.sources).get(&pid).map(|e| e.meta.clone())
    }

    pub fn sources(&self) -> Vec<SourceMeta> {
        lock(&self.sources).values().map(|e| e.meta.clone()).collect()
    }

    pub fn worker_count(&self) -> usize {
        lock(&self.sources).len()
    }

    /// Stops every live worker. Reapers keep running and collect them.
    pub fn shutdown(&self) -> usize {
        let mut table = lock(&self.sources);
        let pids: Vec<u32> = table.keys().copied().collect();
        let count = pids
            .into_iter()
            .filter(|pid| self.stop_locked(&mut table, *pid))
            .count();
        if count > 0 {
            info!(count, "Terminated workers");
        }
        count
    }

    /// Waits until every reaper has finished, for orderly shutdown.
    pub async fn join_reapers(&self) {
        let reapers: Vec<JoinHandle<()>> = self
            .reapers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for reaper in reapers {
            let _ = reaper.await;
        }
    }
}

fn signal(pid: u32, sig: libc::c_int) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) with a pid we spawned and have not reaped.
    let rc = unsafe { libc::kill(pid, sig) };
    if rc != 0 {
        debug!(pid, sig, error = %io::Error::last_os_error(), "kill failed");
    }
    rc == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn exit(status: Option<ExitStatus>) -> WorkerExit {
        WorkerExit {
            pid: 1,
            client_id: ClientId::new("c1"),
            peer: PeerInfo::new(1, "127.0.0.1:9".parse().unwrap(), 3),
            status,
        }
    }

    #[test]
    fn test_describe_exit() {
        assert_eq!(exit(Some(ExitStatus::from_raw(1 << 8))).describe(), "exit code 1");
        assert_eq!(exit(Some(ExitStatus::from_raw(9))).describe(), "signal 9");
        assert_eq!(exit(None).describe(), "unknown");
        assert!(exit(Some(ExitStatus::from_raw(0))).success());
    }

    #[test]
    fn test_config_defaults_to_worker_subcommand() {
        let config = SupervisorConfig::from_config(&ProxyConfig::default()).unwrap();
        assert_eq!(config.args, vec![WORKER_SUBCOMMAND.to_string()]);
        assert_eq!(config.work_root, PathBuf::from("./run"));
        assert_eq!(config.stop_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_terminate_unknown_pid() {
        let supervisor = ProcessSupervisor::new(SupervisorConfig {
            program: PathBuf::from("/bin/true"),
            args: Vec::new(),
            work_root: PathBuf::from("/tmp"),
            stop_grace: Duration::from_secs(1),
        });
        assert!(!supervisor.terminate(999_999));
        assert!(!supervisor.stop_worker(&ClientId::new("c1"), 999_999));
        assert!(supervisor.sweep().is_empty());
        assert_eq!(supervisor.worker_count(), 0);
    }
}
