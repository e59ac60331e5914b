use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Starts the re-armable single-shot flush timer.
///
/// The returned sender accepts the next delay; after sleeping, the task
/// signals the returned receiver. The fire channel has capacity one and is
/// written with `try_send`, so redundant fires coalesce instead of piling
/// up behind a busy event loop. Cancellation interrupts the sleep.
pub fn start(cancel: CancellationToken) -> (mpsc::Sender<Duration>, mpsc::Receiver<()>) {
    let (set_tx, mut set_rx) = mpsc::channel::<Duration>(1);
    let (fire_tx, fire_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("flush timer received quit");
                    return;
                }
                duration = set_rx.recv() => {
                    let Some(duration) = duration else { return };

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("flush timer received quit");
                            return;
                        }
                        _ = tokio::time::sleep(duration) => {
                            // Do not block if the loop has not consumed
                            // the previous fire yet.
                            let _ = fire_tx.try_send(());
                        }
                    }
                }
            }
        }
    });

    (set_tx, fire_rx)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[tokio::test]
    async fn test_fires_after_submitted_duration() {
        let cancel = CancellationToken::new();
        let (set_tx, mut fire_rx) = start(cancel.clone());

        let started = Instant::now();
        set_tx
            .send(Duration::from_millis(20))
            .await
            .expect("submit");

        fire_rx.recv().await.expect("fire");
        assert!(started.elapsed() >= Duration::from_millis(20));

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_rearms_after_each_fire() {
        let cancel = CancellationToken::new();
        let (set_tx, mut fire_rx) = start(cancel.clone());

        for _ in 0..3 {
            set_tx
                .send(Duration::from_millis(10))
                .await
                .expect("submit");
            fire_rx.recv().await.expect("fire");
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_sleep() {
        let cancel = CancellationToken::new();
        let (set_tx, mut fire_rx) = start(cancel.clone());

        set_tx.send(Duration::from_secs(60)).await.expect("submit");
        cancel.cancel();

        // The pending fire never arrives; the channel closes instead.
        let fired = tokio::time::timeout(Duration::from_millis(200), fire_rx.recv()).await;
        assert!(matches!(fired, Ok(None)));
    }
}
