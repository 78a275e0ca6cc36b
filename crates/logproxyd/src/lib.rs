//! logproxy daemon - session broker and worker supervisor
//!
//! This crate provides the runtime of the proxy:
//! - `communicator` - TCP listener, per-connection framing and the fork gate
//! - `registry` - Client registry actor, one session per client id
//! - `arranger` - Handshake pipeline, authentication, quota and teardown
//! - `supervisor` - Worker process creation, pid table and reapers
//! - `worker` - The worker side: handoff, record source and send pipeline
//! - `monitor` - Host, proxy and per-worker CPU/memory metrics
//! - `logging` - Subscriber setup for the proxy and its workers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     logproxy process                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐  frames ┌─────────────────────────┐    │
//! │  │  Communicator   │────────▶│        Arranger         │    │
//! │  │  (TCP listener) │         │  (handshake pipeline)   │    │
//! │  └────────┬────────┘         └────┬──────────────┬─────┘    │
//! │           │ fork gate             │              │          │
//! │           ▼                       ▼              ▼          │
//! │  ┌─────────────────┐    ┌────────────────┐ ┌─────────────┐  │
//! │  │ProcessSupervisor│    │ RegistryActor  │ │Authenticator│  │
//! │  │ (pid table)     │    │(session owner) │ └─────────────┘  │
//! │  └────────┬────────┘    └────────────────┘                  │
//! │           │ fork/exec, reap                                 │
//! └───────────┼─────────────────────────────────────────────────┘
//!             ▼
//!   worker process (one per client, owns the client socket)
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod arranger;
pub mod communicator;
pub mod logging;
pub mod monitor;
pub mod registry;
pub mod supervisor;
pub mod worker;
