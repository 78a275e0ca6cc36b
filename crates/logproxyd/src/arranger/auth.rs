//! Client authentication against the upstream cluster.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use logproxy_core::{ClientMeta, OblogConfig, TableWhiteList, TenantConfigError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AuthError {
    #[error("subscribing to the sys tenant is not allowed")]
    SysTenantDenied,

    #[error("subscribing to all tenants is not allowed")]
    AllTenantDenied,

    #[error("user {user} belongs to tenant {user_tenant}, not {tenant}")]
    TenantMismatch {
        user: String,
        user_tenant: String,
        tenant: String,
    },

    #[error("no upstream server reachable: {0}")]
    Unreachable(String),

    #[error(transparent)]
    Config(#[from] TenantConfigError),
}

/// Decides whether a client may subscribe with its resolved configuration.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn auth(&self, client: &ClientMeta, config: &OblogConfig) -> Result<(), AuthError>;
}

/// Accepts everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn auth(&self, _client: &ClientMeta, _config: &OblogConfig) -> Result<(), AuthError> {
        Ok(())
    }
}

// ============================================================================
// Upstream user names
// ============================================================================

/// An upstream account name in one of its accepted spellings:
/// `user@tenant#cluster`, `user@tenant`, `cluster:tenant:user` or `user`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamUser {
    pub user: String,
    pub tenant: Option<String>,
    pub cluster: Option<String>,
}

impl UpstreamUser {
    pub fn parse(full: &str) -> Self {
        if let Some((user, rest)) = full.split_once('@') {
            let (tenant, cluster) = match rest.split_once('#') {
                Some((tenant, cluster)) => (tenant, Some(cluster.to_string())),
                None => (rest, None),
            };
            return Self {
                user: user.to_string(),
                tenant: Some(tenant.to_string()),
                cluster,
            };
        }

        let parts: Vec<&str> = full.split(':').collect();
        if let [cluster, tenant, user] = parts.as_slice() {
            return Self {
                user: (*user).to_string(),
                tenant: Some((*tenant).to_string()),
                cluster: Some((*cluster).to_string()),
            };
        }

        Self {
            user: full.to_string(),
            tenant: None,
            cluster: None,
        }
    }
}

// ============================================================================
// Upstream authenticator
// ============================================================================

/// Checks tenant policy locally, then that the cluster is reachable.
///
/// Only root servers listed in `rootserver_list` are checked; a configuration
/// that names only a `cluster_url` skips the reachability check.
#[derive(Debug, Clone)]
pub struct UpstreamAuthenticator {
    pub allow_sys_user: bool,
    pub allow_all_tenant: bool,
    pub timeout: Duration,
}

impl UpstreamAuthenticator {
    /// Tenant policy checks that need no network access.
    pub fn check_policy(&self, config: &OblogConfig) -> Result<TableWhiteList, AuthError> {
        let white_list = TableWhiteList::parse(&config.tb_white_list)?;

        if white_list.all_tenant {
            if !self.allow_all_tenant {
                return Err(AuthError::AllTenantDenied);
            }
            return Ok(white_list);
        }
        if white_list.with_sys && !self.allow_sys_user {
            return Err(AuthError::SysTenantDenied);
        }

        let user = UpstreamUser::parse(&config.cluster_user);
        if let Some(user_tenant) = &user.tenant {
            if let Some(tenant) = white_list.tenant_names().find(|t| *t != user_tenant) {
                return Err(AuthError::TenantMismatch {
                    user: user.user.clone(),
                    user_tenant: user_tenant.clone(),
                    tenant: tenant.to_string(),
                });
            }
        }
        Ok(white_list)
    }

    async fn check_reachable(&self, config: &OblogConfig) -> Result<(), AuthError> {
        let servers = config.root_servers()?;
        if servers.is_empty() {
            return Ok(());
        }

        let mut last_error = String::new();
        for server in &servers {
            let addr = format!("{}:{}", server.host, server.sql_port);
            match timeout(self.timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(_)) => {
                    debug!(server = %addr, "Upstream server reachable");
                    return Ok(());
                }
                Ok(Err(e)) => last_error = format!("{addr}: {e}"),
                Err(_) => last_error = format!("{addr}: timed out"),
            }
        }
        Err(AuthError::Unreachable(last_error))
    }
}

#[async_trait]
impl Authenticator for UpstreamAuthenticator {
    async fn auth(&self, client: &ClientMeta, config: &OblogConfig) -> Result<(), AuthError> {
        self.check_policy(config)?;
        self.check_reachable(config).await?;
        debug!(client_id = %client.id, "Client authenticated");
        Ok(())
    }
}
