//! Merging error streams and reacting to the first failure.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const MERGED_CHANNEL_SIZE: usize = 64;

/// Forwards every item from `inputs` into one stream that closes once all
/// inputs have closed.
pub fn merge<T: Send + 'static>(inputs: Vec<mpsc::Receiver<T>>) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(MERGED_CHANNEL_SIZE);

    for mut input in inputs {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(item) = input.recv().await {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
    }

    rx
}

/// Collects errors until `errors` closes, cancelling `cancel` on the first.
///
/// Draining continues after cancellation so that every producer can exit.
pub async fn supervise(
    cancel: &CancellationToken,
    mut errors: mpsc::Receiver<anyhow::Error>,
) -> Vec<anyhow::Error> {
    let mut collected = Vec::new();

    while let Some(err) = errors.recv().await {
        if collected.is_empty() {
            warn!(error = %format!("{err:#}"), "stopping agent after error");
            cancel.cancel();
        }
        collected.push(err);
    }

    collected
}
