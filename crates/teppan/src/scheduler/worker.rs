use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::{sync::Notify, task::JoinHandle};

/// A fixed pool of background worker tasks sharing a running flag and a
/// wakeup notifier.
///
/// Workers are expected to check the running flag on every loop iteration
/// and to park on the notifier when idle. Shutdown flips the flag, wakes
/// every parked worker and reaps the join handles.
pub(crate) struct WorkerPool {
    running: Arc<AtomicBool>,
    notifier: Arc<Notify>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new<F>(num_workers: usize, spawn_worker: F) -> Self
    where
        F: Fn(Arc<AtomicBool>, Arc<Notify>) -> JoinHandle<()>,
    {
        let running = Arc::new(AtomicBool::new(true));
        let notifier = Arc::new(Notify::new());
        let handles = (0..num_workers)
            .map(|_| spawn_worker(running.clone(), notifier.clone()))
            .collect();

        Self {
            running,
            notifier,
            handles,
        }
    }

    /// Wakes one idle worker.
    #[allow(dead_code)]
    pub fn notify(&self) {
        self.notifier.notify_one();
    }

    pub fn notifier(&self) -> Arc<Notify> {
        self.notifier.clone()
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.notifier.notify_waiters();

        for handle in self.handles.drain(..) {
            if tokio::runtime::Handle::try_current().is_ok() {
                tokio::spawn(async move {
                    let _ = handle.await;
                });
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_stops_workers() {
        let looped = Arc::new(AtomicBool::new(false));
        let mut pool = WorkerPool::new(2, |running, notifier| {
            let looped = looped.clone();
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    looped.store(true, Ordering::SeqCst);
                    let _ =
                        tokio::time::timeout(Duration::from_millis(1), notifier.notified()).await;
                }
            })
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(looped.load(Ordering::SeqCst));

        pool.shutdown();
        tokio::time::sleep(Duration::from_millis(5)).await;
        // A second shutdown (e.g. from Drop) is a no-op.
        pool.shutdown();
    }
}
