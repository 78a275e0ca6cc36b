//! Proxy configuration loaded from a JSON file.
//!
//! Every key is optional; absent keys take the defaults below. Unknown keys
//! are rejected so typos surface at startup.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default listen port.
pub const DEFAULT_SERVICE_PORT: u16 = 2983;

/// Default maximum frame payload (64 MiB).
pub const DEFAULT_MAX_PACKET_BYTES: u32 = 64 * 1024 * 1024;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "./conf/conf.json";

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// TCP port clients connect to.
    pub service_port: u16,
    /// Address the listener binds to.
    pub bind_address: String,
    /// Largest frame payload accepted from a client.
    pub max_packet_bytes: u32,
    /// Deadline for the first frame, and for upstream reachability checks.
    pub command_timeout_s: u64,

    /// Root of per-client worker directories.
    pub oblogreader_path: PathBuf,
    /// Maximum number of admitted sessions (spawning or active).
    pub oblogreader_max_count: usize,
    /// A session that has not become active within this window is reclaimed.
    pub oblogreader_lease_s: u64,
    /// Period of the worker liveness sweep.
    pub gc_interval_s: u64,
    /// How long a closed session's worker may ignore SIGTERM before SIGKILL.
    pub worker_stop_grace_s: u64,

    pub auth_user: bool,
    pub auth_allow_sys_user: bool,
    pub allow_all_tenant: bool,
    /// System account the workers use instead of the client's, hex ciphertext.
    pub ob_sys_username: String,
    /// Password for `ob_sys_username`, hex ciphertext.
    pub ob_sys_password: String,
    /// Passphrase for `-x`/`-y` and the encrypted fields above.
    pub cipher_key: String,

    /// Program started for each worker; defaults to this executable.
    pub worker_program: Option<PathBuf>,
    /// Arguments for `worker_program`; defaults to `["worker"]`.
    pub worker_args: Option<Vec<String>>,
    /// Shell command the worker runs to read the commit log.
    pub reader_command: Option<String>,
    pub record_queue_size: usize,
    pub send_batch_size: usize,
    pub send_timeout_us: u64,

    pub metric_enable: bool,
    pub metric_interval_s: u64,

    /// Workers read but do not send.
    pub debug: bool,
    pub verbose: bool,
    pub verbose_packet: bool,
    pub readonly: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            service_port: DEFAULT_SERVICE_PORT,
            bind_address: "0.0.0.0".to_string(),
            max_packet_bytes: DEFAULT_MAX_PACKET_BYTES,
            command_timeout_s: 10,
            oblogreader_path: PathBuf::from("./run"),
            oblogreader_max_count: 100,
            oblogreader_lease_s: 300,
            gc_interval_s: 10,
            worker_stop_grace_s: 5,
            auth_user: true,
            auth_allow_sys_user: false,
            allow_all_tenant: false,
            ob_sys_username: String::new(),
            ob_sys_password: String::new(),
            cipher_key: crate::cipher::DEFAULT_KEY.to_string(),
            worker_program: None,
            worker_args: None,
            reader_command: None,
            record_queue_size: 20_000,
            send_batch_size: 64,
            send_timeout_us: 2_000_000,
            metric_enable: true,
            metric_interval_s: 120,
            debug: false,
            verbose: false,
            verbose_packet: false,
            readonly: false,
        }
    }
}

impl ProxyConfig {
    /// Loads configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks cross-field constraints. Call after CLI overrides are applied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_packet_bytes == 0 {
            return Err(ConfigError::Invalid {
                key: "max_packet_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.oblogreader_max_count == 0 {
            return Err(ConfigError::Invalid {
                key: "oblogreader_max_count",
                reason: "must allow at least one worker".to_string(),
            });
        }
        if self.record_queue_size == 0 || self.send_batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "record_queue_size",
                reason: "queue and batch sizes must be greater than zero".to_string(),
            });
        }
        if self.gc_interval_s == 0 {
            return Err(ConfigError::Invalid {
                key: "gc_interval_s",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.ob_sys_username.is_empty() != self.ob_sys_password.is_empty() {
            return Err(ConfigError::Invalid {
                key: "ob_sys_username",
                reason: "ob_sys_username and ob_sys_password must be set together".to_string(),
            });
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_s)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.oblogreader_lease_s)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_s)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.worker_stop_grace_s)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_micros(self.send_timeout_us)
    }

    pub fn metric_interval(&self) -> Duration {
        Duration::from_secs(self.metric_interval_s.max(1))
    }

    /// True when a system account replaces client credentials for workers.
    pub fn has_sys_account(&self) -> bool {
        !self.ob_sys_username.is_empty()
    }
}
