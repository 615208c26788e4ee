/// Renders search results as LDIF, either straight to a string for terminal
/// output or through a background task writing an export file. There is no
/// line folding and binary attribute values are skipped rather than
/// base64-encoded, so the output is meant for inspection and re-import of
/// textual directories, not as a byte-faithful dump.

use std::path::Path;

use ldap3::SearchEntry;
use tokio::fs as tfs;
use tokio::io::{self as tio, AsyncWriteExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

pub type LdifSender = UnboundedSender<SearchEntry>;
pub type LdifReceiver = UnboundedReceiver<SearchEntry>;

/// Starts the export task. The task drains the channel into a buffered
/// writer and finishes when the last sender is dropped; await the returned
/// handle to be sure the file is flushed.
pub async fn start_ldif_export_task<P: AsRef<Path>>(
    export_file: P,
) -> anyhow::Result<(LdifSender, JoinHandle<()>)> {
    let (tx, rx) = unbounded_channel();

    let file = tfs::File::create(export_file).await?;
    let writer = tio::BufWriter::new(file);

    let handle = tokio::spawn(async move { ldif_exporter(rx, writer).await });

    Ok((tx, handle))
}

async fn ldif_exporter<O: AsyncWriteExt + Unpin>(rx: LdifReceiver, mut writer: O) {
    let mut stream = UnboundedReceiverStream::new(rx);
    while let Some(entry) = stream.next().await {
        let entry_string = build_entry_string(&entry);

        if let Err(e) = writer.write_all(entry_string.as_bytes()).await {
            debug!("LDIF write error: {e:#?}");
            warn!("Failed to write entry to file: {e}");
        }
    }

    if let Err(e) = writer.flush().await {
        warn!("Failed to flush LDIF file: {e}");
    }
}

/// Builds one LDIF record, dn first, attributes in name order so the output
/// is stable across runs.
pub fn build_entry_string(entry: &SearchEntry) -> String {
    let mut attrs: Vec<(&String, &Vec<String>)> = entry.attrs.iter().collect();
    attrs.sort_by_key(|(name, _)| name.as_str());

    if !entry.bin_attrs.is_empty() {
        debug!(
            "entry {} has {} binary attributes, skipping them",
            entry.dn,
            entry.bin_attrs.len()
        );
    }

    //              prefix             ": \n" per value              empty line
    let capacity = "dn: \n".len()
        + entry.dn.len()
        + attrs
            .iter()
            .map(|(k, vs)| vs.iter().map(|v| k.len() + v.len() + 3).sum::<usize>())
            .sum::<usize>()
        + 1;
    let mut entry_string = String::with_capacity(capacity);

    entry_string.push_str("dn: ");
    entry_string.push_str(entry.dn.as_str());
    entry_string.push('\n');

    for (key, values) in attrs {
        for value in values {
            entry_string.push_str(key.as_str());
            entry_string.push_str(": ");
            entry_string.push_str(value);
            entry_string.push('\n');
        }
    }
    entry_string.push('\n');

    entry_string
}
