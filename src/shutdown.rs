use futures_util::Stream;
use futures_util::StreamExt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// External cancellation signal shared by every beacon task.
///
/// Triggering is latched: a task that starts waiting after [`Shutdown::trigger`]
/// was called returns immediately instead of waiting for a second signal.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    triggered: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // register before checking the flag so a concurrent trigger is not lost
        notified.as_mut().enable();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

/// Await the next item from a stream or a shutdown signal.
///
/// - Returns `Ok(Some(item))` when the stream yields
/// - Returns `Ok(None)` when the stream ends
/// - Returns `Err(())` on shutdown
pub async fn select_stream_or_shutdown<T>(
    mut stream: Pin<&mut (dyn Stream<Item = T> + Send)>,
    shutdown: &Shutdown,
) -> Result<Option<T>, ()> {
    tokio::select! {
        biased;
        _ = shutdown.wait() => Err(()),
        item = stream.next() => Ok(item),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn late_waiters_see_an_earlier_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_millis(100), shutdown.wait())
            .await
            .expect("wait should return once triggered");
    }

    #[tokio::test]
    async fn wakes_pending_waiters() {
        let shutdown = Shutdown::new();
        let waiter = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { shutdown.wait().await }
        });
        tokio::task::yield_now().await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_wins_over_a_ready_stream() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut stream: crate::types::GenericBoxedStream<u32> =
            Box::pin(futures_util::stream::iter(vec![1, 2, 3]));
        assert_eq!(select_stream_or_shutdown(stream.as_mut(), &shutdown).await, Err(()));
    }
}
