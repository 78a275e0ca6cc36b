//! Worker process bookkeeping.

use chrono::{DateTime, Utc};
use procfs::process::{Process, ProcState};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::{ClientId, LogType};

/// A worker process started for one client.
///
/// Created when the worker is spawned, owned by the process supervisor and
/// dropped when the worker is reaped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMeta {
    pub log_type: LogType,
    pub pid: u32,
    pub client_id: ClientId,
    pub started_at: DateTime<Utc>,
    /// Last time the process was observed alive.
    pub last_seen: DateTime<Utc>,
}

impl SourceMeta {
    pub fn new(log_type: LogType, pid: u32, client_id: ClientId) -> Self {
        let now = Utc::now();
        Self {
            log_type,
            pid,
            client_id,
            started_at: now,
            last_seen: now,
        }
    }

    /// Records that the process was seen alive just now.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

/// Returns true if `pid` names a running (non-zombie) process.
///
/// A zombie has exited and is only waiting to be reaped, so it counts as dead.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };

    match Process::new(pid).and_then(|p| p.stat()) {
        Ok(stat) => match stat.state() {
            Ok(ProcState::Zombie) | Ok(ProcState::Dead) => {
                debug!(pid, "is_process_alive: process is a zombie");
                false
            }
            _ => true,
        },
        Err(_) => {
            debug!(pid, "is_process_alive: process NOT FOUND in /proc");
            false
        }
    }
}
