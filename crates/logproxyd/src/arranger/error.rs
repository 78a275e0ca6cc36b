//! Session-scoped failures and their wire codes.

use thiserror::Error;

use logproxy_core::{ClientId, TenantConfigError};
use logproxy_protocol::ErrorCode;

use super::auth::AuthError;
use crate::registry::RegistryError;

/// Why a client session could not be set up.
///
/// Every variant is reported to the client as one Error frame carrying
/// [`ArrangeError::code`], after which the connection is closed.
#[derive(Debug, Error)]
pub enum ArrangeError {
    #[error("bad handshake: {0}")]
    BadHandshake(String),

    #[error("client {0} is already connected")]
    Duplicate(ClientId),

    #[error("cannot resolve tenant configuration: {0}")]
    Resolve(#[from] TenantConfigError),

    #[error("cannot decrypt system account: {0}")]
    SysAccount(String),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("worker quota exhausted (max: {max})")]
    Quota { max: usize },

    #[error("cannot start worker: {0}")]
    Spawn(String),

    /// The session changed under us, e.g. it was force-closed mid-handshake.
    #[error("session lost: {0}")]
    Registry(RegistryError),
}

impl ArrangeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ArrangeError::BadHandshake(_) => ErrorCode::BadHandshake,
            ArrangeError::Duplicate(_) => ErrorCode::DuplicateClient,
            ArrangeError::Resolve(_) | ArrangeError::SysAccount(_) => ErrorCode::ResolveFailed,
            ArrangeError::Auth(_) => ErrorCode::AuthFailed,
            ArrangeError::Quota { .. } => ErrorCode::QuotaExceeded,
            ArrangeError::Spawn(_) => ErrorCode::SpawnFailed,
            ArrangeError::Registry(_) => ErrorCode::ForceClosed,
        }
    }
}

impl From<RegistryError> for ArrangeError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateClient(id) => ArrangeError::Duplicate(id),
            RegistryError::QuotaExceeded { max } | RegistryError::RegistryFull { max } => {
                ArrangeError::Quota { max }
            }
            other => ArrangeError::Registry(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_errors_map_to_codes() {
        let dup: ArrangeError = RegistryError::DuplicateClient(ClientId::new("c1")).into();
        assert_eq!(dup.code(), ErrorCode::DuplicateClient);

        let full: ArrangeError = RegistryError::RegistryFull { max: 8 }.into();
        assert_eq!(full.code(), ErrorCode::QuotaExceeded);

        let lost: ArrangeError = RegistryError::ClientNotFound(ClientId::new("c1")).into();
        assert_eq!(lost.code(), ErrorCode::ForceClosed);
    }

    #[test]
    fn test_codes() {
        assert_eq!(
            ArrangeError::Resolve(TenantConfigError::NoTenant).code(),
            ErrorCode::ResolveFailed
        );
        assert_eq!(ArrangeError::Spawn("x".into()).code(), ErrorCode::SpawnFailed);
        assert_eq!(
            ArrangeError::Auth(AuthError::SysTenantDenied).code(),
            ErrorCode::AuthFailed
        );
    }
}
