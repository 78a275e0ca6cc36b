//! Per-worker reaper tasks.
//!
//! Each worker gets one task that waits for the process to exit. The exit is
//! first observed without reaping (`WNOWAIT`). While the zombie still holds
//! the pid, the worker's entry is dropped from the table, so a new worker
//! that later receives the same pid can never be confused with this one.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use logproxy_core::{ClientId, PeerInfo};

use super::{lock, SourceTable, WorkerExit, WorkerExitListener};
use crate::worker::discard_handoff;

/// Blocks until `pid` has exited, leaving it waitable.
fn wait_exited(pid: u32) -> io::Result<()> {
    loop {
        // SAFETY: siginfo_t is plain data; waitid only writes into it.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Waits for `child`, drops its entry, shuts its socket down and reaps it.
fn reap(sources: &SourceTable, mut child: Child, work_dir: &Path) -> io::Result<ExitStatus> {
    let pid = child.id();
    if let Err(e) = wait_exited(pid) {
        debug!(pid, error = %e, "waitid failed, falling back to wait");
    }

    let entry = lock(sources).remove(&pid);
    if let Some(mut entry) = entry {
        entry.shutdown_socket();
    }

    let status = child.wait();
    if let Err(e) = discard_handoff(work_dir) {
        warn!(pid, work_dir = %work_dir.display(), error = %e, "Failed to remove hand-off");
    }
    status
}

/// Starts the reaper for a freshly spawned worker.
pub(super) fn spawn_reaper(
    sources: SourceTable,
    child: Child,
    work_dir: PathBuf,
    client_id: ClientId,
    peer: PeerInfo,
    listener: Arc<dyn WorkerExitListener>,
) -> JoinHandle<()> {
    let pid = child.id();

    tokio::spawn(async move {
        let status = match tokio::task::spawn_blocking(move || reap(&sources, child, &work_dir)).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(pid, error = %e, "Failed to reap worker");
                None
            }
            Err(e) => {
                warn!(pid, error = %e, "Reaper thread failed");
                None
            }
        };
        debug!(pid, "Worker reaped");

        listener
            .on_worker_exit(WorkerExit {
                pid,
                client_id,
                peer,
                status,
            })
            .await;
    })
}
