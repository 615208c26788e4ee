use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScanError>;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("I/O error: {0}")]
    Io(#[from] #[source] std::io::Error),

    #[error("directory error: {0}")]
    Ldap(#[from] #[source] ldap3::LdapError),

    #[error("bind as {dn} rejected by server (rc={rc})")]
    BindRejected { dn: String, rc: u32 },

    #[error("root DSE returned no defaultNamingContext")]
    NoRootContext,

    #[error("pool is shut down")]
    PoolClosed,

    #[error("invalid configuration: {0}")]
    Config(String),
}
