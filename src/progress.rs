/// Provides a progress spinner that shows how many entries have been
/// received so far. The total is unknown up front, the server only tells us
/// page by page.

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};

pub type ProgressData = ();
pub type ProgressSender = UnboundedSender<ProgressData>;
pub type ProgressReceiver = UnboundedReceiver<ProgressData>;

pub async fn start_progress_task() -> (ProgressSender, JoinHandle<()>) {
    let (tx, rx) = unbounded_channel();
    let handle = tokio::spawn(async move { progress_task(rx).await });

    (tx, handle)
}

async fn progress_task(rx: ProgressReceiver) {
    let style =
        ProgressStyle::with_template("{spinner} {pos} entries {msg}").expect("valid style");
    let bar = ProgressBar::new_spinner();
    bar.set_style(style);
    let mut stream = UnboundedReceiverStream::new(rx);
    let mut count: u64 = 0;
    let start = time::Instant::now();
    let mut current_interval = start;
    let mut current_count = 0;

    while let Some(_) = stream.next().await {
        bar.inc(1);
        count += 1;
        current_count += 1;

        let now = time::Instant::now();
        if (now - current_interval).as_secs() >= 1 {
            let msg = format!("({current_count} entries/second)");
            bar.set_message(msg);
            current_count = 0;
            current_interval = now;
        }
    }

    let elapsed = start.elapsed().as_secs().max(1);
    let msg = format!("Received {count} entries ({} entries/second on average)", count / elapsed);

    bar.finish_with_message(msg);
}
