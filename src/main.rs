#[macro_use]
extern crate log;

use anyhow::bail;
use clap::Parser;

mod cli;
mod cmd;
mod columns;
mod config;
mod controls;
mod csv;
mod directory;
mod error;
mod ldif;
mod pool;
mod progress;
mod search;

use cli::{CliArgs, MainCommand};
use config::{Config, LdapConfig};
use directory::LdapDirectory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let cfg = args.config_file.as_str();

    let config = Config::load_from_file(cfg)?;

    env_logger::builder().filter_level(config.log()).init();

    let Some(mut ldap_config) = config.ldap().cloned().or_else(|| LdapConfig::from_args(&args))
    else {
        error!("Missing required parameters to connect to server. Check config or provide via cli (--help for more info)");
        bail!("Missing required server information");
    };

    ldap_config.merge_args(&args);
    ldap_config.validate()?;

    if ldap_config.bind_dn().is_some() && (args.password || !ldap_config.has_password()) {
        let password = rpassword::prompt_password("Bind password: ")?;
        ldap_config.set_password(password);
    }

    let directory = LdapDirectory::new(
        &ldap_config,
        config.pool().clone(),
        config.search().clone(),
        config.attribute_map(),
    );

    let result = match args.cmd {
        MainCommand::Search(_) => cmd::search_cmd(&args, &directory).await,
        MainCommand::Export(_) => cmd::export_cmd(&args, &directory).await,
        MainCommand::Check { .. } => cmd::check_cmd(&args, &directory).await,
    };

    directory.shutdown().await;

    if let Err(e) = result {
        error!("Command failed: {e}");
        return Err(e);
    }

    Ok(())
}
