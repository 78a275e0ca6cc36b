//! Tenant configuration carried in a client's handshake.
//!
//! The blob is a space separated list of `key=value` pairs:
//!
//! ```text
//! cluster_url=http://cfg/api cluster_user=u@t cluster_password=p tb_white_list=t1.db.*
//! ```
//!
//! Known keys are parsed into fields; anything else is kept in `extras` and
//! forwarded to the log reader untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while resolving a client's tenant configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TenantConfigError {
    #[error("missing required key: {0}")]
    MissingKey(&'static str),

    #[error("invalid table white list section: {0}")]
    InvalidWhiteList(String),

    #[error("invalid root server entry: {0}")]
    InvalidRootServer(String),

    #[error("no tenant selected in tb_white_list")]
    NoTenant,

    #[error("all-tenant subscription is not allowed")]
    AllTenantNotAllowed,

    #[error("invalid {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

// ============================================================================
// OblogConfig
// ============================================================================

/// Parsed tenant configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OblogConfig {
    pub cluster_url: String,
    pub rootserver_list: String,
    pub cluster_user: String,
    pub cluster_password: String,
    pub tb_white_list: String,
    pub first_start_timestamp: u64,
    pub sys_user: String,
    pub sys_password: String,
    /// Unknown keys, passed through to the reader.
    pub extras: BTreeMap<String, String>,
}

impl OblogConfig {
    /// Parses a `k1=v1 k2=v2` blob.
    ///
    /// Pairs without `=` are skipped; only the first `=` splits, so values may
    /// contain `=`. Later duplicates overwrite earlier ones.
    pub fn parse(blob: &str) -> Result<Self, TenantConfigError> {
        let mut config = Self::default();
        for pair in blob.split(' ').filter(|s| !s.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            config.set(key, value)?;
        }
        Ok(config)
    }

    /// Sets a key, routing unknown keys into `extras`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), TenantConfigError> {
        match key {
            "cluster_url" => self.cluster_url = value.to_string(),
            "rootserver_list" => self.rootserver_list = value.to_string(),
            "cluster_user" => self.cluster_user = value.to_string(),
            "cluster_password" => self.cluster_password = value.to_string(),
            "tb_white_list" => self.tb_white_list = value.to_string(),
            "first_start_timestamp" => {
                self.first_start_timestamp =
                    value.parse().map_err(|_| TenantConfigError::InvalidValue {
                        key: "first_start_timestamp",
                        value: value.to_string(),
                    })?;
            }
            "sys_user" => self.sys_user = value.to_string(),
            "sys_password" => self.sys_password = value.to_string(),
            other => {
                self.extras.insert(other.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    /// Checks the required keys and returns the parsed white list.
    pub fn validate(&self, allow_all_tenant: bool) -> Result<TableWhiteList, TenantConfigError> {
        if self.cluster_user.is_empty() {
            return Err(TenantConfigError::MissingKey("cluster_user"));
        }
        if self.cluster_password.is_empty() {
            return Err(TenantConfigError::MissingKey("cluster_password"));
        }
        if self.cluster_url.is_empty() && self.rootserver_list.is_empty() {
            return Err(TenantConfigError::MissingKey("cluster_url or rootserver_list"));
        }
        // surfaces malformed entries before a worker is started
        self.root_servers()?;

        let white_list = TableWhiteList::parse(&self.tb_white_list)?;
        if white_list.all_tenant {
            if !allow_all_tenant {
                return Err(TenantConfigError::AllTenantNotAllowed);
            }
        } else if white_list.tenants.is_empty() {
            return Err(TenantConfigError::NoTenant);
        }
        Ok(white_list)
    }

    /// Parses `rootserver_list` (`host:rpc_port:sql_port;...`).
    pub fn root_servers(&self) -> Result<Vec<RootServer>, TenantConfigError> {
        self.rootserver_list
            .split(';')
            .filter(|s| !s.trim().is_empty())
            .map(RootServer::parse)
            .collect()
    }

    /// Replaces the upstream account the reader logs in with.
    pub fn set_credentials(&mut self, user: impl Into<String>, password: impl Into<String>) {
        self.cluster_user = user.into();
        self.cluster_password = password.into();
    }

    /// Renders the configuration back into `k=v` form for the log reader.
    pub fn to_config_string(&self) -> String {
        self.pairs()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn pairs(&self) -> impl Iterator<Item = (&str, String)> {
        let known = [
            ("cluster_url", self.cluster_url.clone()),
            ("rootserver_list", self.rootserver_list.clone()),
            ("cluster_user", self.cluster_user.clone()),
            ("cluster_password", self.cluster_password.clone()),
            ("tb_white_list", self.tb_white_list.clone()),
            (
                "first_start_timestamp",
                if self.first_start_timestamp == 0 {
                    String::new()
                } else {
                    self.first_start_timestamp.to_string()
                },
            ),
            ("sys_user", self.sys_user.clone()),
            ("sys_password", self.sys_password.clone()),
        ];
        known
            .into_iter()
            .chain(self.extras.iter().map(|(k, v)| (k.as_str(), v.clone())))
            .filter(|(_, v)| !v.is_empty())
    }
}

/// Display masks passwords, so it is safe for logs.
impl fmt::Display for OblogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in self.pairs() {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            if key.ends_with("password") {
                write!(f, "{key}=******")?;
            } else {
                write!(f, "{key}={value}")?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Root servers
// ============================================================================

/// One entry of `rootserver_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootServer {
    pub host: String,
    pub rpc_port: u16,
    pub sql_port: u16,
}

impl RootServer {
    fn parse(entry: &str) -> Result<Self, TenantConfigError> {
        let invalid = || TenantConfigError::InvalidRootServer(entry.to_string());
        let mut parts = entry.trim().split(':');
        let (Some(host), Some(rpc), Some(sql), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            host: host.to_string(),
            rpc_port: rpc.parse().map_err(|_| invalid())?,
            sql_port: sql.parse().map_err(|_| invalid())?,
        })
    }
}

// ============================================================================
// Table white list
// ============================================================================

/// Database selection for one tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbTables {
    pub all_databases: bool,
    pub databases: BTreeMap<String, BTreeSet<String>>,
}

/// Parsed `tb_white_list` (`tenant.db.table|tenant.db.table`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableWhiteList {
    /// `*` tenant: subscribe to every tenant.
    pub all_tenant: bool,
    /// The `sys` tenant (or `*`) is included.
    pub with_sys: bool,
    pub tenants: BTreeMap<String, DbTables>,
}

impl TableWhiteList {
    pub fn parse(raw: &str) -> Result<Self, TenantConfigError> {
        let mut list = Self::default();

        for section in raw.split('|').filter(|s| !s.is_empty()) {
            let items: Vec<&str> = section.split('.').collect();
            let [tenant, database, table] = items.as_slice() else {
                return Err(TenantConfigError::InvalidWhiteList(section.to_string()));
            };

            if *tenant == "sys" {
                list.with_sys = true;
            }
            if *tenant == "*" {
                list.with_sys = true;
                list.all_tenant = true;
                list.tenants.clear();
                return Ok(list);
            }

            let entry = list.tenants.entry((*tenant).to_string()).or_default();
            if entry.all_databases {
                continue;
            }
            if *database == "*" {
                entry.all_databases = true;
                entry.databases.clear();
                continue;
            }

            let tables = entry.databases.entry((*database).to_string()).or_default();
            if !tables.contains("*") {
                tables.insert((*table).to_string());
            }
        }

        Ok(list)
    }

    /// Tenant names in the list.
    pub fn tenant_names(&self) -> impl Iterator<Item = &str> {
        self.tenants.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = "cluster_url=http://cfg/api cluster_user=u@t1 cluster_password=secret \
                         tb_white_list=t1.db1.tbl1|t1.db2.*";

    #[test]
    fn test_parse_known_and_extra_keys() {
        let config = OblogConfig::parse(&format!("{BASIC} working_mode=storage noeq")).unwrap();
        assert_eq!(config.cluster_url, "http://cfg/api");
        assert_eq!(config.cluster_user, "u@t1");
        assert_eq!(config.extras.get("working_mode").map(String::as_str), Some("storage"));
        assert!(!config.extras.contains_key("noeq"));
    }

    #[test]
    fn test_value_may_contain_equals() {
        let config = OblogConfig::parse("cluster_password=a=b").unwrap();
        assert_eq!(config.cluster_password, "a=b");
    }

    #[test]
    fn test_invalid_timestamp() {
        let err = OblogConfig::parse("first_start_timestamp=soon").unwrap_err();
        assert!(matches!(err, TenantConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_validate_requires_credentials() {
        let config = OblogConfig::parse("cluster_url=x tb_white_list=t.d.t").unwrap();
        assert_eq!(
            config.validate(false).unwrap_err(),
            TenantConfigError::MissingKey("cluster_user")
        );

        let config = OblogConfig::parse("cluster_user=u cluster_password=p tb_white_list=t.d.t").unwrap();
        assert!(matches!(
            config.validate(false).unwrap_err(),
            TenantConfigError::MissingKey(_)
        ));
    }

    #[test]
    fn test_validate_tenants() {
        let config = OblogConfig::parse(BASIC).unwrap();
        let list = config.validate(false).unwrap();
        assert_eq!(list.tenant_names().collect::<Vec<_>>(), vec!["t1"]);
        let t1 = list.tenants.get("t1").unwrap();
        assert!(t1.databases.get("db1").unwrap().contains("tbl1"));
        assert!(t1.databases.get("db2").unwrap().contains("*"));

        let config = OblogConfig::parse("cluster_url=x cluster_user=u cluster_password=p").unwrap();
        assert_eq!(config.validate(false).unwrap_err(), TenantConfigError::NoTenant);
    }

    #[test]
    fn test_all_tenant_requires_permission() {
        let config =
            OblogConfig::parse("cluster_url=x cluster_user=u cluster_password=p tb_white_list=*.*.*").unwrap();
        assert_eq!(
            config.validate(false).unwrap_err(),
            TenantConfigError::AllTenantNotAllowed
        );
        let list = config.validate(true).unwrap();
        assert!(list.all_tenant);
        assert!(list.with_sys);
    }

    #[test]
    fn test_white_list_syntax_error() {
        let err = TableWhiteList::parse("t1.db1").unwrap_err();
        assert_eq!(err, TenantConfigError::InvalidWhiteList("t1.db1".to_string()));
    }

    #[test]
    fn test_white_list_database_wildcard_wins() {
        let list = TableWhiteList::parse("t1.db.a|t1.*.*|t1.db.b").unwrap();
        let t1 = list.tenants.get("t1").unwrap();
        assert!(t1.all_databases);
        assert!(t1.databases.is_empty());
    }

    #[test]
    fn test_root_servers() {
        let config = OblogConfig::parse("rootserver_list=10.0.0.1:2882:2881;10.0.0.2:2882:2881").unwrap();
        let servers = config.root_servers().unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].host, "10.0.0.2");
        assert_eq!(servers[0].sql_port, 2881);

        let config = OblogConfig::parse("rootserver_list=10.0.0.1:2882").unwrap();
        assert!(config.root_servers().is_err());
    }

    #[test]
    fn test_display_masks_passwords() {
        let mut config = OblogConfig::parse(BASIC).unwrap();
        config.sys_password = "root-secret".to_string();
        let shown = config.to_string();
        assert!(!shown.contains("secret"));
        assert!(shown.contains("cluster_password=******"));
        assert!(config.to_config_string().contains("cluster_password=secret"));
    }

    #[test]
    fn test_config_string_reparses() {
        let mut config = OblogConfig::parse(BASIC).unwrap();
        config.set_credentials("sys_reader", "pw");
        let reparsed = OblogConfig::parse(&config.to_config_string()).unwrap();
        assert_eq!(reparsed, config);
    }
}
