use clap::{Args, Parser, Subcommand};
use url::Url;

use crate::columns::Column;
use crate::controls::SortKey;

#[derive(Parser)]
#[clap(version, author, about, long_about = None)]
pub struct CliArgs {
    #[arg(short, long, default_value_t = String::from("/etc/ldapscan.toml"))]
    /// The config file to use
    pub config_file: String,

    /// The server to connect to. Specifying this will override the server
    /// set in the configuration, if any. Note that this option is required
    /// if there is no server set in the configuration.
    #[arg(short, long)]
    pub server: Option<Url>,

    /// The DN to bind with, overriding the configuration
    #[arg(short = 'u', long)]
    pub bind_dn: Option<String>,

    #[arg(short, long)]
    /// If set, prompts for the bind password instead of reading it from the
    /// configuration.
    pub password: bool,

    /// The base entry to search under, overriding [search].base from the
    /// configuration
    #[arg(short, long)]
    pub base: Option<String>,

    #[command(subcommand)]
    pub cmd: MainCommand,
}

#[derive(Debug, Clone, Subcommand)]
pub enum MainCommand {
    /// Search the directory and print matching entries as LDIF
    Search(SearchArgs),
    /// Export matching entries into an ldif file, optionally with a csv copy
    Export(ExportArgs),
    /// Verify credentials for an entry using a pooled connection
    Check {
        /// The DN to bind as
        dn: String,
    },
}

#[derive(Debug, Clone, Args)]
pub struct SearchArgs {
    /// The LDAP filter to search with, e.g. (objectClass=inetOrgPerson)
    pub filter: String,

    /// The columns to fetch for each entry. Columns without an attribute
    /// mapping in the active projection are skipped.
    #[arg(short = 'o', long, value_delimiter = ',')]
    pub columns: Vec<Column>,

    /// Sort server-side, e.g. surname or surname:desc. Column names go
    /// through the attribute mapping, anything else is sent as a raw
    /// attribute name.
    #[arg(short = 'S', long = "sort")]
    pub sort: Vec<SortKey>,

    /// Search soft-deleted entries (tombstones) under the directory root
    /// instead of live ones
    #[arg(short, long)]
    pub deleted: bool,

    /// Use the distribution-list attribute projection instead of the user one
    #[arg(short, long)]
    pub lists: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ExportArgs {
    #[command(flatten)]
    pub search: SearchArgs,

    /// The file to export to
    #[arg(long)]
    pub file: String,

    #[arg(short = 'C', long)]
    /// If set, additionally exports the entries' attribute values into the
    /// given csv file.
    pub csv: Option<String>,
}
