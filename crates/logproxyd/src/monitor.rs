//! Host and worker resource metrics.
//!
//! Every `metric_interval_s` the proxy logs three kinds of line: a count of
//! live workers, host-wide memory/CPU/load figures, and one line per process
//! (the proxy itself plus each worker in the supervisor's pid table) with its
//! memory and CPU usage. Processes above the thresholds are logged at WARN.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Processes that vanish between listing and sampling are skipped

use std::process;
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use logproxy_core::{ClientId, SourceMeta};

use crate::supervisor::ProcessSupervisor;

/// Memory usage warning threshold in MB, per process.
pub const HIGH_MEMORY_THRESHOLD_MB: u64 = 512;

/// CPU usage warning threshold (percentage of one core), per process.
pub const HIGH_CPU_THRESHOLD_PERCENT: f32 = 80.0;

const MB: u64 = 1024 * 1024;

/// Host-wide figures.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemMetrics {
    pub mem_used_mb: u64,
    pub mem_total_mb: u64,
    /// `mem_used_mb / mem_total_mb`, 0.0 when the total is unknown.
    pub mem_used_ratio: f32,
    pub cpu_count: usize,
    /// Average over all cores, 0.0 - 100.0.
    pub cpu_percent: f32,
    pub load_1: f64,
    pub load_5: f64,
}

/// One process's usage at sampling time.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessMetrics {
    pub pid: u32,
    /// Client the worker serves; `None` for the proxy itself.
    pub client_id: Option<ClientId>,
    pub memory_mb: u64,
    /// Share of host memory.
    pub memory_ratio: f32,
    /// CPU usage as percentage (0.0 - 100.0 per core)
    pub cpu_percent: f32,
    pub memory_high: bool,
    pub cpu_high: bool,
}

impl ProcessMetrics {
    pub fn is_any_high(&self) -> bool {
        self.memory_high || self.cpu_high
    }
}

/// Everything one refresh observed.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub system: SystemMetrics,
    /// `None` if the proxy's own process could not be read.
    pub proxy: Option<ProcessMetrics>,
    /// Workers that were still alive when sampled.
    pub workers: Vec<ProcessMetrics>,
}

/// Samples host, proxy and worker usage through `sysinfo`.
pub struct ProcessMonitor {
    system: System,
    pid: Pid,
    memory_threshold_mb: u64,
    cpu_threshold_percent: f32,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self::with_thresholds(HIGH_MEMORY_THRESHOLD_MB, HIGH_CPU_THRESHOLD_PERCENT)
    }

    pub fn with_thresholds(memory_threshold_mb: u64, cpu_threshold_percent: f32) -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(process::id()),
            memory_threshold_mb,
            cpu_threshold_percent,
        }
    }

    /// Refreshes the host and the listed workers.
    ///
    /// CPU usage is relative to the previous refresh, so a process seen for
    /// the first time reads as zero.
    pub fn refresh(&mut self, workers: &[SourceMeta]) -> MetricsSnapshot {
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();

        let mut pids: Vec<Pid> = workers.iter().map(|w| Pid::from_u32(w.pid)).collect();
        pids.push(self.pid);
        self.system.refresh_processes(ProcessesToUpdate::Some(&pids), true);

        let system = self.system_metrics();
        let proxy = self.process_metrics(self.pid, None, system.mem_total_mb);
        let workers = workers
            .iter()
            .filter_map(|w| {
                self.process_metrics(Pid::from_u32(w.pid), Some(w.client_id.clone()), system.mem_total_mb)
            })
            .collect();

        MetricsSnapshot {
            system,
            proxy,
            workers,
        }
    }

    fn system_metrics(&self) -> SystemMetrics {
        let mem_total_mb = self.system.total_memory() / MB;
        let mem_used_mb = self.system.used_memory() / MB;
        let load = System::load_average();
        SystemMetrics {
            mem_used_mb,
            mem_total_mb,
            mem_used_ratio: ratio(mem_used_mb, mem_total_mb),
            cpu_count: self.system.cpus().len(),
            cpu_percent: self.system.global_cpu_usage(),
            load_1: load.one,
            load_5: load.five,
        }
    }

    fn process_metrics(&self, pid: Pid, client_id: Option<ClientId>, mem_total_mb: u64) -> Option<ProcessMetrics> {
        let p = self.system.process(pid)?;
        let memory_mb = p.memory() / MB;
        let cpu_percent = p.cpu_usage();
        Some(ProcessMetrics {
            pid: pid.as_u32(),
            client_id,
            memory_mb,
            memory_ratio: ratio(memory_mb, mem_total_mb),
            cpu_percent,
            memory_high: memory_mb > self.memory_threshold_mb,
            cpu_high: cpu_percent > self.cpu_threshold_percent,
        })
    }

    pub fn memory_threshold_mb(&self) -> u64 {
        self.memory_threshold_mb
    }

    pub fn cpu_threshold_percent(&self) -> f32 {
        self.cpu_threshold_percent
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn ratio(part: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        part as f32 / total as f32
    }
}

/// Spawns the metrics task. It stops when `cancel_token` fires.
pub fn spawn_monitor_task(
    supervisor: Arc<ProcessSupervisor>,
    period: Duration,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut monitor = ProcessMonitor::new();
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // baseline for CPU deltas
        let _ = monitor.refresh(&supervisor.sources());

        info!(
            memory_threshold_mb = monitor.memory_threshold_mb(),
            cpu_threshold_percent = monitor.cpu_threshold_percent(),
            interval_secs = period.as_secs(),
            "Process monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Process monitor shutting down");
                    break;
                }

                _ = tick.tick() => {
                    let workers = supervisor.sources();
                    info!(workers = workers.len(), "Counts");
                    let snapshot = monitor.refresh(&workers);
                    log_snapshot(&snapshot);
                }
            }
        }

        debug!("Process monitor task completed");
    })
}

fn log_snapshot(snapshot: &MetricsSnapshot) {
    let s = &snapshot.system;
    info!(
        mem_used_mb = s.mem_used_mb,
        mem_total_mb = s.mem_total_mb,
        mem_used_percent = format!("{:.2}", s.mem_used_ratio * 100.0),
        cpu_count = s.cpu_count,
        cpu_percent = format!("{:.2}", s.cpu_percent),
        load_1 = format!("{:.2}", s.load_1),
        load_5 = format!("{:.2}", s.load_5),
        "Host resource usage"
    );

    match &snapshot.proxy {
        Some(proxy) => log_process(proxy),
        None => warn!("Failed to read proxy process metrics"),
    }
    for worker in &snapshot.workers {
        log_process(worker);
    }
}

fn log_process(m: &ProcessMetrics) {
    let client_id = m.client_id.as_ref().map_or("-", ClientId::as_str);
    let mem_percent = format!("{:.2}", m.memory_ratio * 100.0);
    let cpu_percent = format!("{:.1}", m.cpu_percent);
    if m.is_any_high() {
        warn!(
            pid = m.pid,
            client_id,
            memory_mb = m.memory_mb,
            mem_percent,
            cpu_percent,
            memory_high = m.memory_high,
            cpu_high = m.cpu_high,
            "Process resource usage above threshold"
        );
    } else {
        info!(
            pid = m.pid,
            client_id,
            memory_mb = m.memory_mb,
            mem_percent,
            cpu_percent,
            "Process resource usage"
        );
    }
}
