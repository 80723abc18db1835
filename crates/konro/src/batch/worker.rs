//! Background worker lifecycle management.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Handle to the single consumer task that owns one engine.
///
/// Spawns the task, wakes it when new work is queued, and shuts it down
/// gracefully when dropped. The running flag and the notifier are the only
/// channels between the handle and the loop: shutdown clears the flag and
/// pokes the notifier so the loop observes it promptly.
pub struct BatchWorkerHandle {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    notifier: Arc<Notify>,
}

impl BatchWorkerHandle {
    /// Spawns the worker. `task` receives the shared running flag and
    /// notifier and returns the join handle of the spawned loop.
    pub fn new<F>(task: F) -> Self
    where
        F: FnOnce(Arc<AtomicBool>, Arc<Notify>) -> JoinHandle<()> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let notifier = Arc::new(Notify::new());
        let handle = task(running.clone(), notifier.clone());

        Self {
            running,
            handle: Some(handle),
            notifier,
        }
    }

    /// Wakes the worker to drain newly queued requests.
    pub fn notify(&self) {
        self.notifier.notify_one();
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Initiates a graceful shutdown: clears the running flag, wakes the
    /// loop so it can observe the flag, and detaches a task to await the
    /// loop's completion.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.notifier.notify_one();

        if let Some(handle) = self.handle.take() {
            tokio::spawn(async move {
                let _ = handle.await;
            });
        }
    }
}

impl Drop for BatchWorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time;

    #[tokio::test]
    async fn starts_running() {
        let worker = BatchWorkerHandle::new(|running, _notifier| {
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    time::sleep(Duration::from_millis(10)).await;
                }
            })
        });

        assert!(worker.running().load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn notify_wakes_the_loop() {
        let woken = Arc::new(AtomicBool::new(false));
        let woken_clone = woken.clone();

        let worker = BatchWorkerHandle::new(|running, notifier| {
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    notifier.notified().await;
                    woken_clone.store(true, Ordering::SeqCst);
                }
            })
        });

        time::sleep(Duration::from_millis(50)).await;
        worker.notify();
        time::sleep(Duration::from_millis(50)).await;

        assert!(woken.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_clone = stopped.clone();

        let mut worker = BatchWorkerHandle::new(|running, notifier| {
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    notifier.notified().await;
                }
                stopped_clone.store(true, Ordering::SeqCst);
            })
        });

        worker.notify();
        time::sleep(Duration::from_millis(50)).await;

        worker.shutdown();
        time::sleep(Duration::from_millis(100)).await;

        assert!(!worker.running().load(Ordering::SeqCst));
        assert!(stopped.load(Ordering::SeqCst));
        assert!(worker.handle.is_none());
    }

    #[tokio::test]
    async fn drop_triggers_shutdown() {
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_clone = stopped.clone();

        {
            let worker = BatchWorkerHandle::new(|running, notifier| {
                tokio::spawn(async move {
                    while running.load(Ordering::SeqCst) {
                        notifier.notified().await;
                    }
                    stopped_clone.store(true, Ordering::SeqCst);
                })
            });

            worker.notify();
            time::sleep(Duration::from_millis(50)).await;
        }

        time::sleep(Duration::from_millis(100)).await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn repeated_shutdown_is_harmless() {
        let mut worker = BatchWorkerHandle::new(|running, _notifier| {
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    time::sleep(Duration::from_millis(10)).await;
                }
            })
        });

        worker.shutdown();
        worker.shutdown();
        assert!(!worker.running().load(Ordering::SeqCst));
    }
}
