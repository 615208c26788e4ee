use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use toml::Deserializer;
use url::Url;

use crate::cli::CliArgs;
use crate::columns::{AttributeMap, Column};
use crate::error::{Result, ScanError};

#[derive(Debug, Deserialize)]
pub struct Config {
    ldap: Option<LdapConfig>,

    #[serde(default)]
    pool: PoolConfig,

    #[serde(default)]
    search: SearchConfig,

    #[serde(default)]
    columns: ColumnOverrides,

    #[serde(default = "default_log_level")]
    log_level: log::LevelFilter,
}

fn default_log_level() -> log::LevelFilter {
    log::LevelFilter::Info
}

impl Config {
    pub fn load_from_file<A: AsRef<Path>>(path: A) -> Result<Config> {
        let string = std::fs::read_to_string(path)?;

        let deserializer = Deserializer::new(string.as_str());

        let config: Config = Deserialize::deserialize(deserializer)
            .map_err(|e| ScanError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn ldap(&self) -> Option<&LdapConfig> {
        self.ldap.as_ref()
    }

    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }

    pub fn search(&self) -> &SearchConfig {
        &self.search
    }

    pub fn attribute_map(&self) -> AttributeMap {
        AttributeMap::with_overrides(&self.columns.user, &self.columns.list)
    }

    pub fn log(&self) -> log::LevelFilter {
        self.log_level
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LdapConfig {
    // The server to connect to
    server: Url,
    // The DN to bind with; anonymous when absent
    bind_dn: Option<String>,
    // Optionally, the password to use when binding.
    password: Option<String>,
}

impl LdapConfig {
    /// Builds a configuration purely from command-line arguments, if a server
    /// was given there.
    pub fn from_args(args: &CliArgs) -> Option<Self> {
        args.server.clone().map(|server| LdapConfig {
            server,
            bind_dn: args.bind_dn.clone(),
            password: None,
        })
    }

    /// Command-line arguments win over the configuration file.
    pub fn merge_args(&mut self, args: &CliArgs) {
        if let Some(ref server) = args.server {
            self.server = server.clone();
        }
        if let Some(ref bind_dn) = args.bind_dn {
            self.bind_dn = Some(bind_dn.clone());
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.server.scheme() {
            "ldap" | "ldaps" | "ldapi" => Ok(()),
            other => Err(ScanError::Config(format!(
                "unsupported server scheme {other:?}, expected ldap, ldaps or ldapi"
            ))),
        }
    }

    pub fn server(&self) -> &str {
        self.server.as_str()
    }

    /// Service bind credentials, `None` for an anonymous pool. A bind DN
    /// without a password means the password must be prompted for first.
    pub fn bind(&self) -> Option<(String, String)> {
        match (&self.bind_dn, &self.password) {
            (Some(dn), Some(password)) => Some((dn.clone(), password.clone())),
            _ => None,
        }
    }

    pub fn bind_dn(&self) -> Option<&str> {
        self.bind_dn.as_deref()
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    pub fn set_password(&mut self, password: String) {
        self.password = Some(password);
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections the reaper keeps alive even past their keep-alive.
    pub min_idle: usize,
    /// Reaper cycles a connection may stay idle before it is closed.
    pub keepalive_cycles: u32,
    pub reap_interval_secs: u64,
    /// Checked-out handles older than this are reported as possible leaks.
    pub leak_warn_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 1,
            keepalive_cycles: 2,
            reap_interval_secs: 60,
            leak_warn_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Default search base when none is given on the command line.
    pub base: Option<String>,
    /// Server page size for the paged-results control.
    pub page_size: i32,
    pub scope: SearchScope,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base: None,
            page_size: 500,
            scope: SearchScope::Sub,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    Base,
    One,
    Sub,
}

impl From<SearchScope> for ldap3::Scope {
    fn from(scope: SearchScope) -> ldap3::Scope {
        match scope {
            SearchScope::Base => ldap3::Scope::Base,
            SearchScope::One => ldap3::Scope::OneLevel,
            SearchScope::Sub => ldap3::Scope::Subtree,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ColumnOverrides {
    #[serde(default)]
    user: HashMap<Column, String>,
    #[serde(default)]
    list: HashMap<Column, String>,
}

#[cfg(test)]
mod test {
    use crate::columns::Projection;

    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str(
            r#"
            [ldap]
            server = "ldap://localhost:389"
            "#,
        )
        .unwrap();

        assert_eq!(config.pool().keepalive_cycles, 2);
        assert_eq!(config.pool().min_idle, 1);
        assert_eq!(config.search().page_size, 500);
        assert_eq!(config.search().scope, SearchScope::Sub);
        assert_eq!(config.log(), log::LevelFilter::Info);
        assert!(config.ldap().unwrap().validate().is_ok());
        assert!(config.ldap().unwrap().bind().is_none());
    }

    #[test]
    fn full_config_parses() {
        let config: Config = toml::from_str(
            r#"
            log_level = "DEBUG"

            [ldap]
            server = "ldaps://dir.example.org:636"
            bind_dn = "cn=reader,dc=example,dc=org"
            password = "secret"

            [pool]
            min_idle = 2
            keepalive_cycles = 4
            reap_interval_secs = 30

            [search]
            base = "ou=people,dc=example,dc=org"
            page_size = 100
            scope = "one"

            [columns.user]
            email2 = "mailAlternateAddress"
            "#,
        )
        .unwrap();

        let ldap = config.ldap().unwrap();
        assert_eq!(
            ldap.bind(),
            Some(("cn=reader,dc=example,dc=org".to_owned(), "secret".to_owned()))
        );
        assert_eq!(config.pool().min_idle, 2);
        assert_eq!(config.pool().keepalive_cycles, 4);
        assert_eq!(config.search().scope, SearchScope::One);
        assert_eq!(config.log(), log::LevelFilter::Debug);

        let map = config.attribute_map();
        assert_eq!(
            map.attribute(Projection::User, Column::Email2),
            Some("mailAlternateAddress")
        );
    }

    #[test]
    fn bad_scheme_is_rejected() {
        let config: Config = toml::from_str(
            r#"
            [ldap]
            server = "http://dir.example.org"
            "#,
        )
        .unwrap();

        assert!(config.ldap().unwrap().validate().is_err());
    }
}
