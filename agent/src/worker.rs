//! Periodic worker scaffolding shared by the watchdog and the VPN sentry.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

/// Runs `tick` every `period` until stopped. The first tick fires
/// immediately so enforcement starts the moment lockdown does.
pub(crate) fn spawn_periodic(
    name: &'static str,
    period: Duration,
    mut tick: impl FnMut() + Send + 'static,
) -> WorkerHandle {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => tick(),
            }
        }
        tracing::debug!(worker = name, "Stopped");
    });

    WorkerHandle { shutdown_tx, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn ticks_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let handle = spawn_periodic("test", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.stop().await;

        let ticks = count.load(Ordering::SeqCst);
        assert!(ticks >= 2, "only {ticks} ticks");

        // No more ticks after stop.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), ticks);
    }
}
