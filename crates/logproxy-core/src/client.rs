//! Client identity and handshake metadata.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

// ============================================================================
// Client ID
// ============================================================================

/// Unique identifier a client declares in its handshake.
///
/// At most one live session may exist per ClientId.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Creates a new ClientId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the id is empty or only whitespace.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// True if the id can name a work directory without escaping its parent.
    pub fn is_path_safe(&self) -> bool {
        !self.is_blank() && self.0 != "." && self.0 != ".." && !self.0.contains(['/', '\\', '\0'])
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Log Type
// ============================================================================

/// The upstream log kind a client subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogType {
    /// OceanBase commit log.
    #[serde(rename = "oceanbase")]
    OceanBase,
}

impl LogType {
    /// Maps a wire code to a log type.
    pub fn from_code(code: u8) -> DomainResult<Self> {
        match code {
            0 => Ok(Self::OceanBase),
            other => Err(DomainError::InvalidFieldValue {
                field: "log_type".to_string(),
                value: other.to_string(),
                expected: "0 (oceanbase)".to_string(),
            }),
        }
    }

    /// Wire code for this log type.
    pub fn code(self) -> u8 {
        match self {
            Self::OceanBase => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OceanBase => "oceanbase",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Peer Info
// ============================================================================

/// A live client connection.
///
/// `id` is assigned from a monotonically increasing counter and is never
/// reused, so two PeerInfo values are equal only if they describe the same
/// accepted connection, even when the OS recycles the file descriptor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Connection number assigned at accept time.
    pub id: u64,
    /// Remote socket address.
    pub addr: SocketAddr,
    /// Raw file descriptor of the accepted socket in the proxy process.
    pub fd: i32,
}

impl PeerInfo {
    pub fn new(id: u64, addr: SocketAddr, fd: i32) -> Self {
        Self { id, addr, fd }
    }
}

impl PartialEq for PeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerInfo {}

impl Hash for PeerInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}({}, fd {})", self.id, self.addr, self.fd)
    }
}

// ============================================================================
// Client Meta
// ============================================================================

/// Everything the proxy learned about a client from its handshake.
///
/// Owned by the client registry from a successful handshake parse until the
/// session is closed. Session state and worker pid are tracked next to it,
/// never inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMeta {
    pub log_type: LogType,
    pub id: ClientId,
    /// Address the client reported for itself.
    pub ip: String,
    /// Client software version string.
    pub version: String,
    /// Wire protocol version negotiated in the frame header.
    pub packet_version: u16,
    /// Raw tenant configuration blob, resolved later.
    pub configuration: String,
    pub peer: PeerInfo,
    pub register_time: DateTime<Utc>,
    pub enable_monitor: bool,
}

impl ClientMeta {
    /// Returns the age of this client since registration.
    pub fn age(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.register_time)
    }
}

impl fmt::Display for ClientMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "client(id={}, type={}, ip={}, version={}, peer={})",
            self.id, self.log_type, self.ip, self.version, self.peer
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_client_id_blank() {
        assert!(ClientId::new("").is_blank());
        assert!(ClientId::new("  ").is_blank());
        assert!(!ClientId::new("c1").is_blank());
    }

    #[test]
    fn test_client_id_path_safety() {
        assert!(ClientId::new("c1.tenant-a").is_path_safe());
        assert!(!ClientId::new("..").is_path_safe());
        assert!(!ClientId::new("a/b").is_path_safe());
        assert!(!ClientId::new("").is_path_safe());
    }

    #[test]
    fn test_log_type_codes() {
        assert_eq!(LogType::from_code(0).unwrap(), LogType::OceanBase);
        assert_eq!(LogType::OceanBase.code(), 0);
        assert!(LogType::from_code(9).is_err());
    }

    #[test]
    fn test_peer_identity_ignores_recycled_fd() {
        let first = PeerInfo::new(1, addr(), 7);
        let recycled = PeerInfo::new(2, addr(), 7);
        assert_ne!(first, recycled);

        let mut set = HashSet::new();
        set.insert(first);
        set.insert(recycled);
        set.insert(PeerInfo::new(1, addr(), 9));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_client_meta_serde() {
        let meta = ClientMeta {
            log_type: LogType::OceanBase,
            id: ClientId::new("c1"),
            ip: "10.0.0.1".to_string(),
            version: "2.0.0".to_string(),
            packet_version: 2,
            configuration: "cluster_user=u".to_string(),
            peer: PeerInfo::new(3, addr(), 11),
            register_time: Utc::now(),
            enable_monitor: false,
        };
        let json = serde_json::to_string(&meta).unwrap();
        let parsed: ClientMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, meta);
        assert!(json.contains("\"oceanbase\""));
    }

    #[test]
    fn test_log_type_serde_matches_display() {
        let json = serde_json::to_string(&LogType::OceanBase).unwrap();
        assert_eq!(json, format!("\"{}\"", LogType::OceanBase));
        let parsed: LogType = serde_json::from_str("\"oceanbase\"").unwrap();
        assert_eq!(parsed, LogType::OceanBase);
    }
}
