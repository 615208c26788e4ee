//! Exports search results as a csv file.
//!
//! The header row is the requested attribute set, written when the task
//! starts; each entry becomes one record in header order. Multi-valued
//! attributes are joined with `|`, absent ones become empty cells.

use std::fs;
use std::path::{Path, PathBuf};

use ldap3::SearchEntry;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{self, JoinHandle};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

pub type CsvSender = UnboundedSender<SearchEntry>;
pub type CsvReceiver = UnboundedReceiver<SearchEntry>;
pub type Writer = csv::Writer<std::fs::File>;

/// Starts the csv export task, creating `target_file` with `header` as the
/// first record. Returns the sender handle plus the task handle; the task
/// stops (and flushes) when the last sender is dropped.
pub async fn start_csv_task<P: AsRef<Path>>(
    target_file: P,
    header: Vec<String>,
) -> anyhow::Result<(CsvSender, JoinHandle<()>)> {
    let (sender, receiver) = mpsc::unbounded_channel();
    let path = target_file.as_ref().to_path_buf();

    let mut writer = task::block_in_place(|| open_new_writer(path))?;
    writer.write_record(&header)?;

    let handle = tokio::spawn(async move { csv_exporter(writer, header, receiver).await });

    Ok((sender, handle))
}

async fn csv_exporter(mut writer: Writer, header: Vec<String>, receiver: CsvReceiver) {
    let mut stream = UnboundedReceiverStream::new(receiver);
    let mut last_flush = Instant::now();

    while let Some(entry) = stream.next().await {
        let record = entry_record(&header, &entry);

        if let Err(e) = task::block_in_place(|| writer.write_record(&record)) {
            warn!("Failed to write csv record: {e}");
        }

        // flush every 5 seconds to minimize data loss on long searches that
        // trickle in slowly
        let now = Instant::now();
        if (now - last_flush).as_secs() >= 5 {
            if let Err(e) = task::block_in_place(|| writer.flush()) {
                warn!("Failed to flush csv writer: {e}");
            }
            last_flush = now;
        }
    }

    if let Err(e) = task::block_in_place(|| writer.flush()) {
        warn!("Failed to flush csv writer: {e}");
    }
}

/// One record in header order.
fn entry_record(header: &[String], entry: &SearchEntry) -> Vec<String> {
    header
        .iter()
        .map(|attr| {
            entry
                .attrs
                .get(attr)
                .map(|values| values.join("|"))
                .unwrap_or_default()
        })
        .collect()
}

fn open_new_writer(file: PathBuf) -> anyhow::Result<Writer> {
    let file = fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .create(true)
        .open(file)?;

    let writer = csv::WriterBuilder::new().from_writer(file);

    Ok(writer)
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn records_follow_header_order() {
        let header = vec!["sn".to_owned(), "mail".to_owned(), "title".to_owned()];
        let entry = SearchEntry {
            dn: "uid=test.user,ou=users,dc=example,dc=org".to_owned(),
            attrs: HashMap::from([
                ("sn".to_owned(), vec!["user".to_owned()]),
                (
                    "mail".to_owned(),
                    vec!["a@example.org".to_owned(), "b@example.org".to_owned()],
                ),
            ]),
            bin_attrs: HashMap::new(),
        };

        assert_eq!(
            entry_record(&header, &entry),
            vec![
                "user".to_owned(),
                "a@example.org|b@example.org".to_owned(),
                String::new()
            ]
        );
    }
}
