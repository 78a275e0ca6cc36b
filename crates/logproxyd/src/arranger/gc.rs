//! Periodic reconciliation of sessions and workers.

use std::sync::Arc;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use logproxy_core::SessionState;
use logproxy_protocol::ErrorCode;

use super::Arranger;
use crate::registry::RemovalReason;

/// What one sweep cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Sessions whose worker vanished without being reaped.
    pub reaped: usize,
    /// Active or closing sessions whose worker left the pid table.
    pub orphaned: usize,
    /// Sessions stuck in setup past the lease.
    pub expired: usize,
    /// Workers terminated because no session owns them.
    pub wild: usize,
}

impl GcReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Arranger {
    /// Runs one reconciliation pass.
    pub async fn gc_sweep(&self) -> GcReport {
        let mut report = GcReport::default();
        let sessions = self.registry.get_all_sessions().await;

        for source in self.supervisor.sweep() {
            let owner = sessions.iter().find(|e| e.pid == Some(source.pid));
            if let Some(entry) = owner {
                if self.collect_exited(entry.client_id(), entry.meta.peer).await {
                    report.reaped += 1;
                }
            }
        }

        for entry in &sessions {
            let orphaned = match entry.state {
                SessionState::Active => entry.pid.map_or(true, |pid| self.supervisor.source(pid).is_none()),
                SessionState::Closing => entry.pid.is_some_and(|pid| self.supervisor.source(pid).is_none()),
                _ => false,
            };
            if orphaned && self.collect_exited(entry.client_id(), entry.meta.peer).await {
                report.orphaned += 1;
            }
        }

        let lease = self.config.lease();
        for entry in sessions.iter().filter(|e| e.state.is_pending()) {
            let overdue = entry.age().to_std().is_ok_and(|age| age > lease);
            if overdue
                && self
                    .teardown(
                        entry.client_id(),
                        Some(entry.meta.peer),
                        RemovalReason::Expired,
                        Some((ErrorCode::InitTimeout, "session setup timed out")),
                    )
                    .await
            {
                report.expired += 1;
            }
        }

        // sessions may have been added since the snapshot
        let sessions = self.registry.get_all_sessions().await;
        for source in self.supervisor.sources() {
            let owned = sessions.iter().any(|e| {
                e.pid == Some(source.pid)
                    || (e.pid.is_none()
                        && matches!(e.state, SessionState::Spawning | SessionState::Closing)
                        && e.meta.id == source.client_id)
            });
            if !owned && self.supervisor.terminate(source.pid) {
                info!(pid = source.pid, client_id = %source.client_id, "Terminated worker without session");
                report.wild += 1;
            }
        }

        report
    }
}

/// Sweeps every `gc_interval` until the arranger shuts down.
pub(super) async fn gc_pid_routine(arranger: Arc<Arranger>) {
    let period = arranger.config.gc_interval();
    // first sweep one full period after startup
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(interval_ms = period.as_millis() as u64, "GC routine started");
    loop {
        tokio::select! {
            biased;

            _ = arranger.cancel_token.cancelled() => break,

            _ = tick.tick() => {
                let report = arranger.gc_sweep().await;
                if !report.is_empty() {
                    info!(
                        reaped = report.reaped,
                        orphaned = report.orphaned,
                        expired = report.expired,
                        wild = report.wild,
                        "GC sweep"
                    );
                }
            }
        }
    }
    debug!("GC routine stopped");
}
