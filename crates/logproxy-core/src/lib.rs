//! logproxy core - shared domain types
//!
//! This crate provides the types shared between the wire protocol
//! (`logproxy-protocol`) and the daemon (`logproxyd`): client identity,
//! session lifecycle, worker bookkeeping, tenant and proxy configuration.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`
//! outside of tests.

pub mod cipher;
pub mod client;
pub mod config;
pub mod error;
pub mod oblog;
pub mod session;
pub mod source;

// Re-exports for convenience
pub use cipher::CipherError;
pub use client::{ClientId, ClientMeta, LogType, PeerInfo};
pub use config::{ConfigError, ProxyConfig};
pub use error::{DomainError, DomainResult};
pub use oblog::{OblogConfig, RootServer, TableWhiteList, TenantConfigError};
pub use session::SessionState;
pub use source::{is_process_alive, SourceMeta};
