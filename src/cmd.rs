use anyhow::bail;

use crate::cli::{CliArgs, MainCommand, SearchArgs};
use crate::columns::{Column, Projection};
use crate::directory::{LdapDirectory, SearchParams};
use crate::{csv, ldif, progress};

fn projection(search: &SearchArgs) -> Projection {
    if search.lists {
        Projection::DistributionList
    } else {
        Projection::User
    }
}

fn effective_columns(search: &SearchArgs) -> Vec<Column> {
    if !search.columns.is_empty() {
        return search.columns.clone();
    }
    if search.lists {
        vec![
            Column::DisplayName,
            Column::Email1,
            Column::Uid,
            Column::Members,
        ]
    } else {
        vec![
            Column::DisplayName,
            Column::GivenName,
            Column::Surname,
            Column::Email1,
            Column::Uid,
        ]
    }
}

fn search_params(args: &CliArgs, search: &SearchArgs) -> SearchParams {
    SearchParams {
        base: args.base.clone(),
        filter: search.filter.clone(),
        projection: projection(search),
        columns: effective_columns(search),
        sort: search.sort.clone(),
        deleted: search.deleted,
    }
}

pub async fn search_cmd(args: &CliArgs, directory: &LdapDirectory) -> anyhow::Result<()> {
    let MainCommand::Search(ref search) = args.cmd else {
        unreachable!()
    };
    let params = search_params(args, search);

    let stats = directory
        .search(&params, |entry| {
            print!("{}", ldif::build_entry_string(&entry));
        })
        .await?;

    info!(
        "Matched {} entries in {} round trips",
        stats.entries, stats.round_trips
    );

    Ok(())
}

pub async fn export_cmd(args: &CliArgs, directory: &LdapDirectory) -> anyhow::Result<()> {
    let MainCommand::Export(ref export) = args.cmd else {
        unreachable!()
    };
    let params = search_params(args, &export.search);

    let (ldif_sender, ldif_task) = ldif::start_ldif_export_task(export.file.as_str()).await?;

    let (csv_sender, csv_task) = match export.csv {
        Some(ref file) => {
            let header = directory.attributes_for(params.projection, &params.columns);
            let (sender, task) = csv::start_csv_task(file.as_str(), header).await?;
            (Some(sender), Some(task))
        }
        None => (None, None),
    };

    let (progress_sender, progress_task) = progress::start_progress_task().await;

    let result = directory
        .search(&params, |entry| {
            if let Some(ref sender) = csv_sender {
                // if the writer task quit early we have bigger problems; the
                // error shows up when the task is awaited below
                drop(sender.send(entry.clone()));
            }
            drop(ldif_sender.send(entry));
            drop(progress_sender.send(()));
        })
        .await;

    // closing the channels lets the export tasks drain and flush
    drop(ldif_sender);
    drop(csv_sender);
    drop(progress_sender);
    ldif_task.await?;
    if let Some(task) = csv_task {
        task.await?;
    }
    progress_task.await?;

    let stats = result?;
    info!(
        "Exported {} entries in {} round trips",
        stats.entries, stats.round_trips
    );

    Ok(())
}

pub async fn check_cmd(args: &CliArgs, directory: &LdapDirectory) -> anyhow::Result<()> {
    let MainCommand::Check { ref dn } = args.cmd else {
        unreachable!()
    };

    let password = rpassword::prompt_password(format!("Password for {dn}: "))?;

    if directory.authenticate(dn, password.as_str()).await? {
        println!("credentials accepted for {dn}");
        Ok(())
    } else {
        bail!("credentials rejected for {dn}");
    }
}
