//! Protocol versioning for safe upgrades.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire protocol version carried in every frame header.
///
/// Payload layouts are identical across the versions this build accepts;
/// the proxy echoes the client's version in every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V0,
    V1,
    V2,
}

impl ProtocolVersion {
    /// Current protocol version.
    pub const CURRENT: ProtocolVersion = ProtocolVersion::V2;

    /// Header value for this version.
    pub const fn code(self) -> u16 {
        match self {
            ProtocolVersion::V0 => 0,
            ProtocolVersion::V1 => 1,
            ProtocolVersion::V2 => 2,
        }
    }

    /// Maps a header value to a supported version.
    pub fn from_code(code: u16) -> Result<Self, VersionError> {
        match code {
            0 => Ok(ProtocolVersion::V0),
            1 => Ok(ProtocolVersion::V1),
            2 => Ok(ProtocolVersion::V2),
            other => Err(VersionError::Unsupported {
                got: other,
                newest: Self::CURRENT.code(),
            }),
        }
    }

    /// Returns true if this version is the current version.
    pub fn is_current(self) -> bool {
        self == Self::CURRENT
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.code())
    }
}

/// Errors that can occur with version handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Unsupported protocol version {got} (newest supported: {newest})")]
    Unsupported { got: u16, newest: u16 },
}
