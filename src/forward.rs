use crate::shutdown::{select_stream_or_shutdown, Shutdown};
use crate::types::GenericBoxedStream;

use tokio::sync::mpsc;
use tracing::info;

/// Pump a stream into a channel with graceful shutdown.
///
/// Stops when the stream ends, when shutdown is requested (also while
/// waiting for channel capacity), or when the receiving side is dropped.
pub async fn forward_stream<T: Send>(
    mut stream: GenericBoxedStream<T>,
    sink: mpsc::Sender<T>,
    shutdown: &Shutdown,
) {
    loop {
        match select_stream_or_shutdown(stream.as_mut(), shutdown).await {
            Ok(Some(item)) => {
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => {
                        info!("Shutdown requested");
                        break;
                    }
                    sent = sink.send(item) => {
                        if sent.is_err() {
                            info!("Receiver dropped");
                            break;
                        }
                    }
                }
            }
            Ok(None) => {
                info!("Stream ended");
                break;
            }
            Err(()) => {
                info!("Shutdown requested");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[tokio::test]
    async fn forwards_until_stream_ends() {
        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = Shutdown::new();
        forward_stream(Box::pin(stream::iter(vec![1, 2, 3])), tx, &shutdown).await;

        let mut received = vec![];
        while let Some(item) = rx.recv().await {
            received.push(item);
        }
        assert_eq!(received, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn stops_on_shutdown_with_pending_stream() {
        let (tx, _rx) = mpsc::channel::<u8>(1);
        let shutdown = Shutdown::new();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { forward_stream(Box::pin(stream::pending()), tx, &shutdown).await }
        });
        shutdown.trigger();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("forwarding should stop")
            .unwrap();
    }
}
