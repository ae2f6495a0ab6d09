use std::time::Duration;

use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(20);

/// Block until the process is asked to stop (SIGINT, or SIGTERM on unix).
///
/// Used as the HTTP listener's graceful-shutdown trigger; worker pools are
/// drained separately through [`WorkerSet::drain`] once the listener closes.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation failed");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Interrupt received; closing webhook intake");
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received; closing webhook intake");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .expect("Ctrl+C handler installation failed");
        tracing::info!("Interrupt received; closing webhook intake");
    }
}

/// The background tasks that must wind down after the listener stops:
/// summary and notification pools plus queue maintenance.
pub struct WorkerSet {
    shutdown: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerSet {
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Sender the pools subscribe to for their stop signal.
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Track a spawned pool so `drain` can wait for it.
    pub fn register(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    /// Tell every pool to stop claiming jobs and wait for in-flight work,
    /// bounded by the drain timeout. A job still leased when the timeout
    /// trips is recovered later by the stall requeue.
    pub async fn drain(self) {
        let _ = self.shutdown.send(());

        let join_all = async {
            for handle in self.handles {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(DRAIN_TIMEOUT, join_all).await {
            Ok(()) => tracing::info!("Worker pools drained"),
            Err(_) => {
                tracing::warn!(
                    timeout_secs = DRAIN_TIMEOUT.as_secs(),
                    "Worker drain timed out; exiting with jobs still leased"
                );
            }
        }
    }
}

impl Default for WorkerSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_waits_for_registered_workers() {
        let mut workers = WorkerSet::new();
        let mut rx = workers.shutdown_sender().subscribe();

        let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag_clone = std::sync::Arc::clone(&flag);
        workers.register(tokio::spawn(async move {
            let _ = rx.recv().await;
            flag_clone.store(true, std::sync::atomic::Ordering::SeqCst);
        }));

        workers.drain().await;
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn drain_with_no_workers_returns_immediately() {
        WorkerSet::new().drain().await;
    }
}
